//! Tree key derivation.
//!
//! Every input is fixed width (20-byte addresses, 32-byte secrets), so plain
//! concatenation cannot collide across field boundaries.

use crate::crypto::{hash_parts, Address, Hash};

const BALANCE_KEY_CONTEXT: &str = "veiled-ledger balance key";
const TX_KEY_CONTEXT: &str = "veiled-ledger tx key";

/// `H(wallet || token || balance_secret)`
pub fn balance_key(wallet: &Address, token: &Address, secret: &Hash) -> Hash {
    hash_parts(BALANCE_KEY_CONTEXT, &[wallet.as_bytes(), token.as_bytes(), secret])
}

/// `H(sender || receiver || token || secret)`. Not symmetric: the sender's
/// and the receiver's buckets for the same pair live under different keys.
pub fn tx_key(sender: &Address, receiver: &Address, token: &Address, secret: &Hash) -> Hash {
    hash_parts(TX_KEY_CONTEXT, &[sender.as_bytes(), receiver.as_bytes(), token.as_bytes(), secret])
}
