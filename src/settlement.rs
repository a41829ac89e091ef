// settlement.rs
// On-chain boundary: deposit intake, executor-backed withdrawals, the
// executor liveness model and proof-based emergency exits.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::amount::Amount;
use crate::config;
use crate::crypto::{hash_parts, hash_to_hex, hex_hash, Address, Hash};
use crate::error::{LedgerError, Result};
use crate::metrics;
use crate::service::{LedgerService, WriteSet};
use crate::smt::MerkleProof;
use crate::storage::layout;

/// Seconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Settable clock for driving the liveness model by hand.
#[derive(Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(start: i64) -> Self {
        ManualClock(AtomicI64::new(start))
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

// --- Deposits ---

/// Delivered by the chain watcher; authenticity is the notifier's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositNotice {
    pub wallet: Address,
    pub token: Address,
    pub amount: Amount,
    #[serde(rename = "chainTxHash")]
    pub chain_tx_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DepositReceipt {
    wallet: Address,
    token: Address,
    amount: Amount,
    credited_at: i64,
}

// --- Withdrawals ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub wallet: Address,
    pub token: Address,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Pending,
    Settled {
        #[serde(rename = "chainTxHash")]
        chain_tx_hash: String,
    },
    Reverted { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRecord {
    pub id: String,
    pub wallet: Address,
    pub token: Address,
    pub amount: Amount,
    #[serde(flatten)]
    pub status: WithdrawalStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Performs the on-chain `withdraw(amount, token, recipient)` call.
/// Returns the chain transaction hash, or the failure reason.
#[async_trait]
pub trait WithdrawalExecutor: Send + Sync {
    async fn execute(&self, withdrawal: &WithdrawalRecord) -> std::result::Result<String, String>;
}

// --- Liveness ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LivenessState {
    Active,
    Stalled,
    EmergencyWindow,
}

impl LivenessState {
    fn gauge(&self) -> i64 {
        match self {
            LivenessState::Active => 0,
            LivenessState::Stalled => 1,
            LivenessState::EmergencyWindow => 2,
        }
    }
}

/// Executor heartbeat tracking. Silence longer than `interval` stalls the
/// system; silence longer than `interval + challenge` opens the emergency
/// window. Any ping returns it to active.
pub struct LivenessMonitor {
    interval: i64,
    challenge: i64,
    last_ping: AtomicI64,
    observed: Mutex<LivenessState>,
}

impl LivenessMonitor {
    pub fn new(cfg: &config::Settlement, last_ping: i64) -> Self {
        Self {
            interval: cfg.liveness_interval_secs as i64,
            challenge: cfg.challenge_period_secs as i64,
            last_ping: AtomicI64::new(last_ping),
            observed: Mutex::new(LivenessState::Active),
        }
    }

    pub fn last_ping(&self) -> i64 {
        self.last_ping.load(Ordering::SeqCst)
    }

    pub fn state_at(&self, now: i64) -> LivenessState {
        let silent = now - self.last_ping();
        let state = if silent <= self.interval {
            LivenessState::Active
        } else if silent <= self.interval + self.challenge {
            LivenessState::Stalled
        } else {
            LivenessState::EmergencyWindow
        };

        let mut observed = self.observed.lock();
        if *observed != state {
            warn!(from = ?*observed, to = ?state, silent_secs = silent, "liveness state changed");
            *observed = state;
            metrics::record(|m| m.liveness_state.set(state.gauge()));
        }
        state
    }

    fn record_ping(&self, now: i64) {
        self.last_ping.fetch_max(now, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedRoot {
    #[serde(with = "hex_hash")]
    pub root: Hash,
    pub published_at: i64,
}

pub struct Settlement {
    ledger: Arc<LedgerService>,
    liveness: LivenessMonitor,
    executor: Option<Arc<dyn WithdrawalExecutor>>,
    clock: Arc<dyn Clock>,
    deposit_gate: tokio::sync::Mutex<()>,
    sequence: AtomicU64,
}

impl Settlement {
    pub fn new(
        ledger: Arc<LedgerService>,
        cfg: &config::Settlement,
        executor: Option<Arc<dyn WithdrawalExecutor>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        // With no recorded ping the executor gets a full interval from boot.
        let last_ping = match ledger.store().get(layout::LAST_PING)? {
            Some(text) => text
                .parse::<i64>()
                .map_err(|e| LedgerError::Persistence(format!("bad liveness record: {e}")))?,
            None => clock.now_secs(),
        };
        Ok(Self {
            liveness: LivenessMonitor::new(cfg, last_ping),
            ledger,
            executor,
            clock,
            deposit_gate: tokio::sync::Mutex::new(()),
            sequence: AtomicU64::new(0),
        })
    }

    pub fn ledger(&self) -> &Arc<LedgerService> {
        &self.ledger
    }

    pub fn liveness_state(&self) -> LivenessState {
        self.liveness.state_at(self.clock.now_secs())
    }

    /// Executor heartbeat (the contract's liveness-ping counterpart).
    pub fn record_ping(&self) -> Result<LivenessState> {
        let now = self.clock.now_secs();
        self.ledger.store().put(layout::LAST_PING, &now.to_string())?;
        self.liveness.record_ping(now);
        Ok(self.liveness.state_at(now))
    }

    /// Credit an on-chain deposit once per `chain_tx_hash`. Returns false for
    /// a replayed notification.
    pub async fn deposit(&self, notice: &DepositNotice) -> Result<bool> {
        if notice.chain_tx_hash.trim().is_empty() {
            return Err(LedgerError::Validation("deposit without chainTxHash".into()));
        }
        if notice.amount.is_zero() {
            return Err(LedgerError::Validation("deposit amount must be positive".into()));
        }

        let _gate = self.deposit_gate.lock().await;
        let dedup_key = layout::deposit(&notice.chain_tx_hash);
        if self.ledger.store().get(&dedup_key)?.is_some() {
            metrics::record(|m| m.deposits_duplicate.inc());
            info!(chain_tx = %notice.chain_tx_hash, "deposit already credited");
            return Ok(false);
        }

        let _guard = self.ledger.locks().acquire(&[notice.wallet]).await;
        let credited = self.ledger.stored_balance(&notice.wallet, &notice.token)?.checked_add(notice.amount)?;
        let mut writes = WriteSet::new();
        writes.set_balance(notice.wallet, notice.token, credited);
        writes.put_json(
            dedup_key,
            &DepositReceipt {
                wallet: notice.wallet,
                token: notice.token,
                amount: notice.amount,
                credited_at: self.clock.now_secs(),
            },
        )?;
        self.ledger.commit(writes)?;

        metrics::record(|m| m.deposits_credited.inc());
        info!(wallet = %notice.wallet, token = %notice.token, amount = %notice.amount, chain_tx = %notice.chain_tx_hash, "deposit credited");
        Ok(true)
    }

    fn withdrawal_id(&self, req: &WithdrawalRequest, now: i64) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let digest = hash_parts(
            "veiled-ledger withdrawal id",
            &[
                req.wallet.as_bytes(),
                req.token.as_bytes(),
                &req.amount.scaled().to_be_bytes(),
                &now.to_be_bytes(),
                &seq.to_be_bytes(),
                &chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default().to_be_bytes(),
            ],
        );
        hex::encode(&digest[..16])
    }

    /// Debit the balance and persist a pending withdrawal, atomically. The
    /// wallet lock is released before any executor is contacted.
    pub async fn begin_withdrawal(&self, req: &WithdrawalRequest) -> Result<WithdrawalRecord> {
        if req.amount.is_zero() {
            return Err(LedgerError::Validation("withdrawal amount must be positive".into()));
        }
        match self.liveness_state() {
            LivenessState::Active => {}
            other => {
                return Err(LedgerError::SettlementUnavailable(format!(
                    "executor liveness is {other:?}; use the emergency exit once the window opens"
                )))
            }
        }
        self.ledger.secrets().require(&req.wallet, crate::secrets::Purpose::Balance)?;

        let _guard = self.ledger.locks().acquire(&[req.wallet]).await;
        let available = self.ledger.balance(&req.wallet, &req.token);
        if available < req.amount {
            return Err(LedgerError::InsufficientBalance {
                available: available.to_string(),
                requested: req.amount.to_string(),
            });
        }

        let now = self.clock.now_secs();
        let record = WithdrawalRecord {
            id: self.withdrawal_id(req, now),
            wallet: req.wallet,
            token: req.token,
            amount: req.amount,
            status: WithdrawalStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        let mut writes = WriteSet::new();
        writes.set_balance(req.wallet, req.token, available.checked_sub(req.amount)?);
        writes.put_json(layout::withdrawal(&record.id), &record)?;
        self.ledger.commit(writes)?;

        info!(id = %record.id, wallet = %record.wallet, amount = %record.amount, "withdrawal debited, awaiting settlement");
        Ok(record)
    }

    /// Settle or revert a pending withdrawal. A failure credits the amount
    /// back in the same batch that marks the record reverted.
    pub async fn complete_withdrawal(
        &self,
        id: &str,
        outcome: std::result::Result<String, String>,
    ) -> Result<WithdrawalRecord> {
        let key = layout::withdrawal(id);
        let mut record: WithdrawalRecord = self
            .ledger
            .store()
            .get_json(&key)?
            .ok_or_else(|| LedgerError::NotFound(format!("withdrawal {id}")))?;

        let _guard = self.ledger.locks().acquire(&[record.wallet]).await;
        // re-read under the lock; a concurrent resolver may have won
        record = self
            .ledger
            .store()
            .get_json(&key)?
            .ok_or_else(|| LedgerError::NotFound(format!("withdrawal {id}")))?;
        if record.status != WithdrawalStatus::Pending {
            return Err(LedgerError::Validation(format!("withdrawal {id} is already resolved")));
        }

        record.updated_at = self.clock.now_secs();
        let mut writes = WriteSet::new();
        match outcome {
            Ok(chain_tx_hash) => {
                record.status = WithdrawalStatus::Settled { chain_tx_hash };
                writes.put_json(key, &record)?;
                self.ledger.commit(writes)?;
                metrics::record(|m| m.withdrawals.with_label_values(&["settled"]).inc());
                info!(id, "withdrawal settled");
            }
            Err(reason) => {
                let restored = self
                    .ledger
                    .stored_balance(&record.wallet, &record.token)?
                    .checked_add(record.amount)?;
                record.status = WithdrawalStatus::Reverted { reason: reason.clone() };
                writes.set_balance(record.wallet, record.token, restored);
                writes.put_json(key, &record)?;
                if let Err(e) = self.ledger.commit(writes) {
                    error!(id, error = %e, "compensating credit failed; withdrawal left pending for retry");
                    return Err(e);
                }
                metrics::record(|m| m.withdrawals.with_label_values(&["compensated"]).inc());
                warn!(id, %reason, amount = %record.amount, "withdrawal failed on-chain; debit reversed");
            }
        }
        Ok(record)
    }

    /// Full withdrawal. Without an attached executor the record stays
    /// pending until the external executor reports back.
    pub async fn withdraw(&self, req: &WithdrawalRequest) -> Result<WithdrawalRecord> {
        let record = self.begin_withdrawal(req).await?;
        let Some(executor) = self.executor.clone() else {
            return Ok(record);
        };
        match executor.execute(&record).await {
            Ok(chain_tx) => self.complete_withdrawal(&record.id, Ok(chain_tx)).await,
            Err(reason) => {
                self.complete_withdrawal(&record.id, Err(reason.clone())).await?;
                Err(LedgerError::Executor(reason))
            }
        }
    }

    pub fn pending_withdrawals(&self) -> Result<Vec<WithdrawalRecord>> {
        let mut out = Vec::new();
        for (key, value) in self.ledger.store().scan_prefix(layout::WITHDRAWAL_PREFIX)? {
            let record: WithdrawalRecord = serde_json::from_str(&value)
                .map_err(|e| LedgerError::Persistence(format!("corrupt withdrawal '{key}': {e}")))?;
            if record.status == WithdrawalStatus::Pending {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Snapshot the balance root that emergency exits are proven against.
    pub fn publish_root(&self) -> Result<PublishedRoot> {
        let published = PublishedRoot {
            root: self.ledger.roots().balance_root,
            published_at: self.clock.now_secs(),
        };
        let text = serde_json::to_string(&published)
            .map_err(|e| LedgerError::Persistence(format!("serialize root: {e}")))?;
        self.ledger.store().put(layout::PUBLISHED_ROOT, &text)?;
        info!(root = %hash_to_hex(&published.root), "balance root published");
        Ok(published)
    }

    pub fn published_root(&self) -> Result<Option<PublishedRoot>> {
        self.ledger.store().get_json(layout::PUBLISHED_ROOT)
    }

    /// Exit against the last published root, bypassing the executor. Only
    /// honored while the emergency window is open; each published snapshot
    /// can be claimed once per (wallet, token).
    pub async fn emergency_withdraw(
        &self,
        wallet: &Address,
        token: &Address,
        amount: Amount,
        proof: &MerkleProof,
    ) -> Result<Amount> {
        if self.liveness_state() != LivenessState::EmergencyWindow {
            return Err(LedgerError::SettlementUnavailable("emergency window is not open".into()));
        }
        let published = self
            .published_root()?
            .ok_or_else(|| LedgerError::NotFound("no published root".into()))?;
        if proof.root != published.root {
            return Err(LedgerError::ProofVerification("proof is not against the published root".into()));
        }
        self.ledger.verify_balance_proof(proof)?;
        if proof.key != self.ledger.balance_key(wallet, token)? {
            return Err(LedgerError::ProofVerification("proof is for another leaf".into()));
        }
        let proven = Amount::from_leaf(&proof.value)?;
        if amount.is_zero() || amount > proven {
            return Err(LedgerError::InsufficientBalance {
                available: proven.to_string(),
                requested: amount.to_string(),
            });
        }

        let _guard = self.ledger.locks().acquire(&[*wallet]).await;
        let claim_key = layout::emergency_claim(wallet, token, &hash_to_hex(&published.root));
        if self.ledger.store().get(&claim_key)?.is_some() {
            return Err(LedgerError::Validation("this snapshot was already claimed".into()));
        }
        // The snapshot may predate withdrawals that already left the system;
        // only value still held on the ledger can exit.
        let remaining = self.ledger.stored_balance(wallet, token)?.checked_sub(amount)?;
        let mut writes = WriteSet::new();
        writes.set_balance(*wallet, *token, remaining);
        writes.put_json(claim_key, &serde_json::json!({ "amount": amount, "claimedAt": self.clock.now_secs() }))?;
        self.ledger.commit(writes)?;

        metrics::record(|m| m.emergency_withdrawals.inc());
        warn!(%wallet, %token, %amount, "emergency withdrawal honored from published root");
        Ok(amount)
    }
}
