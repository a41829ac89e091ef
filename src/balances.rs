//! Balance tree: a sparse Merkle projection of the `balance:{wallet}:{token}`
//! records. Each leaf sits at `H(wallet || token || balance_secret)` and holds
//! the fixed-point amount.

use std::sync::Arc;
use tracing::{info, warn};

use crate::amount::Amount;
use crate::crypto::{Address, Hash};
use crate::error::{LedgerError, Result};
use crate::keys::balance_key;
use crate::secrets::{Purpose, SecretStore};
use crate::smt::{MerkleProof, SparseMerkleTree};
use crate::storage::{layout, KvStore};

pub struct BalanceTree {
    tree: SparseMerkleTree,
    secrets: Arc<SecretStore>,
}

/// Split `balance:{wallet}:{token}` into its addresses.
pub fn parse_balance_key(key: &str) -> Result<(Address, Address)> {
    let rest = key
        .strip_prefix(layout::BALANCE_PREFIX)
        .ok_or_else(|| LedgerError::Persistence(format!("not a balance key: '{key}'")))?;
    let (wallet, token) = rest
        .split_once(':')
        .ok_or_else(|| LedgerError::Persistence(format!("malformed balance key '{key}'")))?;
    Ok((wallet.parse()?, token.parse()?))
}

impl BalanceTree {
    pub fn new(secrets: Arc<SecretStore>) -> Self {
        Self { tree: SparseMerkleTree::new(), secrets }
    }

    /// Replay every persisted balance record. Records of wallets without a
    /// balance secret are skipped; they become reachable when the wallet
    /// unlocks.
    pub fn rebuild(db: &dyn KvStore, secrets: Arc<SecretStore>) -> Result<Self> {
        let mut tree = BalanceTree::new(secrets);
        let mut applied = 0usize;
        let mut skipped = 0usize;
        for (key, value) in db.scan_prefix(layout::BALANCE_PREFIX)? {
            let (wallet, token) = parse_balance_key(&key)?;
            let amount = Amount::parse(&value)
                .map_err(|e| LedgerError::Persistence(format!("bad balance record '{key}': {e}")))?;
            match tree.set(&wallet, &token, amount) {
                Ok(_) => applied += 1,
                Err(LedgerError::SecretMissing { .. }) => {
                    warn!(%wallet, %token, "balance record skipped: wallet has no balance secret");
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        info!(applied, skipped, leaves = tree.tree.len(), "balance tree rebuilt");
        Ok(tree)
    }

    /// Re-project one wallet's persisted balances, used right after it unlocks.
    pub fn project_wallet(&mut self, db: &dyn KvStore, wallet: &Address) -> Result<usize> {
        let mut count = 0;
        for (key, value) in db.scan_prefix(&layout::balances_of(wallet))? {
            let (_, token) = parse_balance_key(&key)?;
            let amount = Amount::parse(&value)
                .map_err(|e| LedgerError::Persistence(format!("bad balance record '{key}': {e}")))?;
            self.set(wallet, &token, amount)?;
            count += 1;
        }
        Ok(count)
    }

    /// Zero when the leaf is absent or the wallet has not unlocked.
    pub fn get(&self, wallet: &Address, token: &Address) -> Amount {
        match self.secrets.secret(wallet, Purpose::Balance) {
            Some(secret) => Amount::from_leaf(&self.tree.get(&balance_key(wallet, token, &secret)))
                .unwrap_or_default(),
            None => Amount::ZERO,
        }
    }

    /// Insert-or-update. Returns the new root.
    pub fn set(&mut self, wallet: &Address, token: &Address, amount: Amount) -> Result<Hash> {
        let secret = self.secrets.require(wallet, Purpose::Balance)?;
        Ok(self.tree.update(balance_key(wallet, token, &secret), amount.to_leaf()))
    }

    pub fn key_of(&self, wallet: &Address, token: &Address) -> Result<Hash> {
        let secret = self.secrets.require(wallet, Purpose::Balance)?;
        Ok(balance_key(wallet, token, &secret))
    }

    pub fn proof(&self, wallet: &Address, token: &Address) -> Result<MerkleProof> {
        Ok(self.tree.proof(&self.key_of(wallet, token)?))
    }

    pub fn root(&self) -> Hash {
        self.tree.root()
    }

    pub fn leaf_count(&self) -> usize {
        self.tree.len()
    }

    pub fn verify(proof: &MerkleProof) -> bool {
        proof.verify()
    }
}
