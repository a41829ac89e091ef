//! The ledger authority.
//!
//! One `LedgerService` is built at startup from the durable store and handed
//! to request handlers by `Arc`. It owns both trees; the only way to change
//! them is `commit`, which persists a `WriteSet` first and then applies the
//! matching tree updates under a single write lock. Readers take the read
//! lock and always see either all or none of a write set.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::amount::Amount;
use crate::balances::BalanceTree;
use crate::config;
use crate::crypto::{hex_hash, Address, Hash};
use crate::error::{LedgerError, Result};
use crate::history::{BucketId, PendingAppend, TransactionLedger, TransferRecord};
use crate::locks::WalletLocks;
use crate::metrics;
use crate::secrets::{Purpose, SecretStore};
use crate::smt::MerkleProof;
use crate::storage::{layout, Batch, KvStore};

pub struct Trees {
    pub balances: BalanceTree,
    pub history: TransactionLedger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Roots {
    #[serde(with = "hex_hash")]
    pub balance_root: Hash,
    #[serde(with = "hex_hash")]
    pub tx_root: Hash,
}

/// Durable writes plus the tree changes they imply.
#[derive(Default)]
pub struct WriteSet {
    batch: Batch,
    balances: Vec<(Address, Address, Amount)>,
    history: Option<PendingAppend>,
}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&mut self, wallet: Address, token: Address, amount: Amount) {
        self.batch.put(layout::balance(&wallet, &token), amount.to_string());
        self.balances.push((wallet, token, amount));
    }

    pub fn append_history(&mut self, pending: PendingAppend) -> Result<()> {
        pending.write_to(&mut self.batch)?;
        self.history = Some(pending);
        Ok(())
    }

    pub fn put_json<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        self.batch.put_json(key, value)
    }
}

pub struct LedgerService {
    db: Arc<dyn KvStore>,
    secrets: Arc<SecretStore>,
    trees: RwLock<Trees>,
    locks: WalletLocks,
    cfg: config::Ledger,
}

impl LedgerService {
    /// Load secrets and rebuild both trees from the store. Runs to completion
    /// before the service exists, so no request can observe a partial rebuild.
    pub fn open(db: Arc<dyn KvStore>, cfg: config::Ledger) -> Result<Self> {
        let secrets = Arc::new(SecretStore::new(db.clone()));
        let loaded = secrets.load_all()?;
        let balances = BalanceTree::rebuild(db.as_ref(), secrets.clone())?;
        let history = TransactionLedger::rebuild(db.as_ref(), secrets.clone(), cfg.require_receiver_secret)?;

        metrics::record(|m| {
            m.tree_leaves.with_label_values(&["balance"]).set(balances.leaf_count() as i64);
            m.tree_leaves.with_label_values(&["transaction"]).set(history.bucket_count() as i64);
        });
        info!(
            secrets = loaded,
            balance_root = %crate::crypto::hash_to_hex(&balances.root()),
            tx_root = %crate::crypto::hash_to_hex(&history.root()),
            "ledger state rebuilt"
        );

        Ok(Self {
            db,
            secrets,
            trees: RwLock::new(Trees { balances, history }),
            locks: WalletLocks::new(),
            cfg,
        })
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.db
    }

    pub fn secrets(&self) -> &SecretStore {
        &self.secrets
    }

    pub fn config(&self) -> &config::Ledger {
        &self.cfg
    }

    pub(crate) fn locks(&self) -> &WalletLocks {
        &self.locks
    }

    /// Derive (or return) a wallet secret. A freshly created balance secret
    /// projects the wallet's persisted balances into the tree.
    pub async fn unlock(&self, wallet: &Address, purpose: Purpose, signature: &str) -> Result<bool> {
        let _guard = self.locks.acquire(&[*wallet]).await;
        let (_, created) = self.secrets.derive_secret(wallet, purpose, signature)?;
        if created && purpose == Purpose::Balance {
            let projected = self.trees.write().balances.project_wallet(self.db.as_ref(), wallet)?;
            if projected > 0 {
                info!(%wallet, projected, "persisted balances now reachable");
            }
        }
        Ok(created)
    }

    pub fn balance(&self, wallet: &Address, token: &Address) -> Amount {
        self.trees.read().balances.get(wallet, token)
    }

    /// The durable record, readable whether or not the wallet has unlocked.
    pub fn stored_balance(&self, wallet: &Address, token: &Address) -> Result<Amount> {
        match self.db.get(&layout::balance(wallet, token))? {
            Some(text) => Amount::parse(&text)
                .map_err(|e| LedgerError::Persistence(format!("bad balance record for {wallet}: {e}"))),
            None => Ok(Amount::ZERO),
        }
    }

    pub fn balance_key(&self, wallet: &Address, token: &Address) -> Result<Hash> {
        self.trees.read().balances.key_of(wallet, token)
    }

    pub fn balance_proof(&self, wallet: &Address, token: &Address) -> Result<MerkleProof> {
        self.trees.read().balances.proof(wallet, token)
    }

    pub fn verify_balance_proof(&self, proof: &MerkleProof) -> Result<()> {
        if BalanceTree::verify(proof) {
            Ok(())
        } else {
            Err(LedgerError::ProofVerification("siblings do not hash to the claimed root".into()))
        }
    }

    pub fn tx_proof(&self, sender: &Address, receiver: &Address, token: &Address, requester: &Address) -> Result<MerkleProof> {
        self.trees.read().history.proof_for(sender, receiver, token, requester)
    }

    pub fn history(&self, wallet: &Address) -> Vec<TransferRecord> {
        self.trees.read().history.history_for(wallet)
    }

    pub fn bucket(&self, id: &BucketId) -> Vec<TransferRecord> {
        self.trees.read().history.bucket(id).to_vec()
    }

    pub fn roots(&self) -> Roots {
        let trees = self.trees.read();
        Roots { balance_root: trees.balances.root(), tx_root: trees.history.root() }
    }

    pub(crate) fn prepare_history(
        &self,
        sender: &Address,
        receiver: &Address,
        token: &Address,
        amount: Amount,
        now_ms: i64,
    ) -> Result<PendingAppend> {
        self.trees.read().history.prepare_append(sender, receiver, token, amount, now_ms)
    }

    /// Persist, then project. A store failure leaves the trees untouched.
    /// Callers hold the wallet locks of every balance in the set.
    pub(crate) fn commit(&self, writes: WriteSet) -> Result<Roots> {
        let WriteSet { batch, balances, history } = writes;
        self.db.commit(batch)?;

        let mut trees = self.trees.write();
        for (wallet, token, amount) in balances {
            match trees.balances.set(&wallet, &token, amount) {
                Ok(_) => {}
                Err(LedgerError::SecretMissing { .. }) => {
                    warn!(%wallet, %token, "balance persisted but not projected: wallet is locked");
                }
                Err(e) => return Err(e),
            }
        }
        if let Some(pending) = history {
            trees.history.apply(pending);
        }
        Ok(Roots { balance_root: trees.balances.root(), tx_root: trees.history.root() })
    }
}
