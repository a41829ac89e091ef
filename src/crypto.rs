use blake3::Hasher;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

use crate::error::{LedgerError, Result};

/// A 32-byte digest: tree keys, leaf values, roots, secrets.
pub type Hash = [u8; 32];

const HASH_CONTEXT: &str = "veiled-ledger v1";

/// A 20-byte account or token address, rendered as lowercase `0x` hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl FromStr for Address {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or_else(|| LedgerError::Validation(format!("address '{s}' lacks 0x prefix")))?;
        if body.len() != 40 {
            return Err(LedgerError::Validation(format!("address '{s}' is not 20 bytes")));
        }
        let mut out = [0u8; 20];
        hex::decode_to_slice(body, &mut out)
            .map_err(|e| LedgerError::Validation(format!("address '{s}': {e}")))?;
        Ok(Address(out))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

/// Hashes arbitrary data with a domain-specific key for internal consistency.
pub fn blake3_hash(data: &[u8]) -> Hash {
    *Hasher::new_derive_key(HASH_CONTEXT).update(data).finalize().as_bytes()
}

/// Hash a sequence of fixed-width parts under a dedicated derivation context.
pub fn hash_parts(context: &str, parts: &[&[u8]]) -> Hash {
    let mut hasher = Hasher::new_derive_key(context);
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

pub fn keccak256(data: &[u8]) -> Hash {
    Keccak256::digest(data).into()
}

/// EIP-191 `personal_sign` digest.
pub fn personal_message_hash(message: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

pub fn address_from_key(key: &VerifyingKey) -> Address {
    let point = key.as_affine().to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[12..]);
    Address(out)
}

/// A structurally valid 65-byte `r || s || v` wallet signature.
#[derive(Debug, Clone)]
pub struct WalletSignature {
    bytes: [u8; 65],
}

impl WalletSignature {
    /// Structural parse only; nothing is verified here.
    pub fn parse(text: &str) -> Result<Self> {
        let body = text.strip_prefix("0x").unwrap_or(text);
        let raw = hex::decode(body)
            .map_err(|e| LedgerError::Validation(format!("signature is not hex: {e}")))?;
        let bytes: [u8; 65] = raw
            .try_into()
            .map_err(|_| LedgerError::Validation("signature must be 65 bytes".into()))?;
        if !matches!(bytes[64], 0 | 1 | 27 | 28) {
            return Err(LedgerError::Validation(format!("invalid recovery byte {}", bytes[64])));
        }
        Ok(WalletSignature { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.bytes
    }

    /// Recover the address that signed `message` with `personal_sign`.
    pub fn recover(&self, message: &[u8]) -> Result<Address> {
        let v = self.bytes[64];
        let recid = RecoveryId::from_byte(if v >= 27 { v - 27 } else { v })
            .ok_or_else(|| LedgerError::Auth("bad recovery id".into()))?;
        let sig = Signature::from_slice(&self.bytes[..64])
            .map_err(|e| LedgerError::Auth(format!("malformed signature: {e}")))?;
        let digest = personal_message_hash(message);
        let key = VerifyingKey::recover_from_prehash(&digest, &sig, recid)
            .map_err(|e| LedgerError::Auth(format!("recovery failed: {e}")))?;
        Ok(address_from_key(&key))
    }

    /// Fails with `Auth` unless `expected` produced this signature over `message`.
    pub fn verify(&self, expected: &Address, message: &[u8]) -> Result<()> {
        let signer = self.recover(message)?;
        if signer != *expected {
            return Err(LedgerError::Auth(format!("signed by {signer}, expected {expected}")));
        }
        Ok(())
    }
}

/// Sign `message` the way a wallet's `personal_sign` does; returns 0x-hex `r || s || v`.
pub fn sign_personal(key: &SigningKey, message: &[u8]) -> Result<String> {
    let digest = personal_message_hash(message);
    let (sig, recid) = key
        .sign_prehash_recoverable(&digest)
        .map_err(|e| LedgerError::Auth(format!("signing failed: {e}")))?;
    let mut out = sig.to_bytes().to_vec();
    out.push(27 + recid.to_byte());
    Ok(format!("0x{}", hex::encode(out)))
}

pub fn hash_to_hex(hash: &Hash) -> String {
    format!("0x{}", hex::encode(hash))
}

pub fn hash_from_hex(text: &str) -> Result<Hash> {
    let body = text.strip_prefix("0x").unwrap_or(text);
    let mut out = [0u8; 32];
    hex::decode_to_slice(body, &mut out)
        .map_err(|e| LedgerError::Validation(format!("hash '{text}': {e}")))?;
    Ok(out)
}

/// Serde adapter: `Hash` as 0x-hex.
pub mod hex_hash {
    use super::{hash_from_hex, hash_to_hex, Hash};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &Hash, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hash_to_hex(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Hash, D::Error> {
        let text = String::deserialize(deserializer)?;
        hash_from_hex(&text).map_err(de::Error::custom)
    }
}

/// Serde adapter: `Vec<Hash>` as a list of 0x-hex strings.
pub mod hex_hashes {
    use super::{hash_from_hex, hash_to_hex, Hash};
    use serde::{de, ser::SerializeSeq, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hashes: &[Hash], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(hashes.len()))?;
        for h in hashes {
            seq.serialize_element(&hash_to_hex(h))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Hash>, D::Error> {
        let texts = Vec::<String>::deserialize(deserializer)?;
        texts.iter().map(|t| hash_from_hex(t).map_err(de::Error::custom)).collect()
    }
}
