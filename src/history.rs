//! Transfer-history ledger.
//!
//! Every (sender, receiver, token) pair has two buckets, one addressed under
//! the sender's transaction secret and one under the receiver's. Each bucket
//! is the full ordered record list between the pair; its tree leaf commits to
//! the hash of the whole list.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::amount::Amount;
use crate::crypto::{blake3_hash, Address, Hash};
use crate::error::{LedgerError, Result};
use crate::keys::tx_key;
use crate::secrets::{Purpose, SecretStore};
use crate::smt::{MerkleProof, SparseMerkleTree};
use crate::storage::{layout, Batch, KvStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub sender: Address,
    pub receiver: Address,
    pub token: Address,
    pub amount: Amount,
    /// Unix milliseconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Sender,
    Receiver,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Sender => "sender",
            Side::Receiver => "receiver",
        }
    }
}

impl std::str::FromStr for Side {
    type Err = LedgerError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sender" => Ok(Side::Sender),
            "receiver" => Ok(Side::Receiver),
            other => Err(LedgerError::Validation(format!("unknown bucket side '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketId {
    pub sender: Address,
    pub receiver: Address,
    pub token: Address,
    pub side: Side,
}

impl BucketId {
    /// The wallet whose secret addresses this bucket.
    pub fn owner(&self) -> &Address {
        match self.side {
            Side::Sender => &self.sender,
            Side::Receiver => &self.receiver,
        }
    }

    pub fn storage_key(&self) -> String {
        layout::txdata(&self.sender, &self.receiver, &self.token, self.side.as_str())
    }

    pub fn parse_storage_key(key: &str) -> Result<Self> {
        let bad = || LedgerError::Persistence(format!("malformed txdata key '{key}'"));
        let rest = key.strip_prefix(layout::TXDATA_PREFIX).ok_or_else(bad)?;
        let parts: Vec<&str> = rest.split(':').collect();
        if parts.len() != 4 {
            return Err(bad());
        }
        Ok(BucketId {
            sender: parts[0].parse()?,
            receiver: parts[1].parse()?,
            token: parts[2].parse()?,
            side: parts[3].parse()?,
        })
    }
}

/// Commitment to a whole bucket.
pub fn bucket_hash(records: &[TransferRecord]) -> Result<Hash> {
    let bytes = serde_json::to_vec(records)
        .map_err(|e| LedgerError::Persistence(format!("serialize bucket: {e}")))?;
    Ok(blake3_hash(&bytes))
}

/// A bucket's replacement contents and leaf, computed before anything is written.
#[derive(Debug, Clone)]
pub struct BucketUpdate {
    pub id: BucketId,
    pub records: Vec<TransferRecord>,
    pub leaf_key: Hash,
    pub leaf_value: Hash,
}

/// A prepared append: durable writes go to the batch first, `apply` follows.
#[derive(Debug, Clone)]
pub struct PendingAppend {
    pub record: TransferRecord,
    pub updates: Vec<BucketUpdate>,
}

impl PendingAppend {
    pub fn write_to(&self, batch: &mut Batch) -> Result<()> {
        for update in &self.updates {
            batch.put_json(update.id.storage_key(), &update.records)?;
        }
        Ok(())
    }
}

pub struct TransactionLedger {
    tree: SparseMerkleTree,
    buckets: BTreeMap<BucketId, Vec<TransferRecord>>,
    secrets: Arc<SecretStore>,
    require_receiver_secret: bool,
}

impl TransactionLedger {
    pub fn new(secrets: Arc<SecretStore>, require_receiver_secret: bool) -> Self {
        Self { tree: SparseMerkleTree::new(), buckets: BTreeMap::new(), secrets, require_receiver_secret }
    }

    pub fn rebuild(db: &dyn KvStore, secrets: Arc<SecretStore>, require_receiver_secret: bool) -> Result<Self> {
        let mut ledger = TransactionLedger::new(secrets, require_receiver_secret);
        let mut skipped = 0usize;
        for (key, value) in db.scan_prefix(layout::TXDATA_PREFIX)? {
            let id = BucketId::parse_storage_key(&key)?;
            let records: Vec<TransferRecord> = serde_json::from_str(&value)
                .map_err(|e| LedgerError::Persistence(format!("corrupt bucket '{key}': {e}")))?;
            let Some(secret) = ledger.secrets.secret(id.owner(), Purpose::Transaction) else {
                warn!(bucket = %key, "bucket skipped: owner has no transaction secret");
                skipped += 1;
                continue;
            };
            let leaf_key = tx_key(&id.sender, &id.receiver, &id.token, &secret);
            ledger.tree.update(leaf_key, bucket_hash(&records)?);
            ledger.buckets.insert(id, records);
        }
        info!(buckets = ledger.buckets.len(), skipped, "transaction ledger rebuilt");
        Ok(ledger)
    }

    /// Prepare one record for both sides of the pair. The sender's secret is
    /// always required; the receiver's unless the receiver check is bypassed,
    /// in which case only the sender's bucket is written.
    pub fn prepare_append(
        &self,
        sender: &Address,
        receiver: &Address,
        token: &Address,
        amount: Amount,
        now_ms: i64,
    ) -> Result<PendingAppend> {
        let sender_secret = self.secrets.require(sender, Purpose::Transaction)?;
        let receiver_secret = match self.secrets.require(receiver, Purpose::Transaction) {
            Ok(s) => Some(s),
            Err(e) if self.require_receiver_secret => return Err(e),
            Err(_) => {
                warn!(%receiver, "receiver has no transaction secret; recording sender side only");
                None
            }
        };

        let sender_bucket = BucketId { sender: *sender, receiver: *receiver, token: *token, side: Side::Sender };
        let receiver_bucket = BucketId { side: Side::Receiver, ..sender_bucket };

        // Strictly increasing per pair, so (pair, timestamp) identifies a record.
        let last = [sender_bucket, receiver_bucket]
            .iter()
            .filter_map(|id| self.buckets.get(id).and_then(|b| b.last()).map(|r| r.timestamp))
            .max();
        let timestamp = match last {
            Some(t) if t >= now_ms => t + 1,
            _ => now_ms,
        };
        let record = TransferRecord { sender: *sender, receiver: *receiver, token: *token, amount, timestamp };

        let mut updates = Vec::with_capacity(2);
        let sides = [(sender_bucket, Some(sender_secret)), (receiver_bucket, receiver_secret)];
        for (id, secret) in sides {
            let Some(secret) = secret else { continue };
            let mut records = self.buckets.get(&id).cloned().unwrap_or_default();
            records.push(record.clone());
            updates.push(BucketUpdate {
                id,
                leaf_key: tx_key(&id.sender, &id.receiver, &id.token, &secret),
                leaf_value: bucket_hash(&records)?,
                records,
            });
        }
        Ok(PendingAppend { record, updates })
    }

    /// Install a prepared append whose batch has been committed.
    pub fn apply(&mut self, pending: PendingAppend) -> Hash {
        for update in pending.updates {
            self.tree.update(update.leaf_key, update.leaf_value);
            self.buckets.insert(update.id, update.records);
        }
        self.tree.root()
    }

    /// Every record the wallet took part in, newest first, each record once.
    pub fn history_for(&self, wallet: &Address) -> Vec<TransferRecord> {
        let mut seen = HashSet::new();
        let mut out: Vec<TransferRecord> = self
            .buckets
            .iter()
            .filter(|(id, _)| id.sender == *wallet || id.receiver == *wallet)
            .flat_map(|(_, records)| records.iter())
            .filter(|r| seen.insert((r.sender, r.receiver, r.token, r.timestamp)))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out
    }

    pub fn bucket(&self, id: &BucketId) -> &[TransferRecord] {
        self.buckets.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Proof over the requester's own bucket for the pair.
    pub fn proof_for(
        &self,
        sender: &Address,
        receiver: &Address,
        token: &Address,
        requester: &Address,
    ) -> Result<MerkleProof> {
        if requester != sender && requester != receiver {
            return Err(LedgerError::Auth(format!("{requester} is not a party to this pair")));
        }
        let secret = self.secrets.require(requester, Purpose::Transaction)?;
        Ok(self.tree.proof(&tx_key(sender, receiver, token, &secret)))
    }

    pub fn root(&self) -> Hash {
        self.tree.root()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// A disclosed bucket checks out when the proof verifies and its leaf is the
/// bucket's hash.
pub fn verify_bucket(proof: &MerkleProof, records: &[TransferRecord]) -> bool {
    proof.verify() && bucket_hash(records).map_or(false, |h| h == proof.value)
}
