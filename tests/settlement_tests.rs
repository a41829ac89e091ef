mod common;

use async_trait::async_trait;
use common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use veiled_ledger::storage::{layout, KvStore, MemoryStore};
use veiled_ledger::{
    config, LivenessState, WithdrawalExecutor, WithdrawalRecord, WithdrawalRequest, WithdrawalStatus,
};

struct ScriptedExecutor {
    fail: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl WithdrawalExecutor for ScriptedExecutor {
    async fn execute(&self, withdrawal: &WithdrawalRecord) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err("execution reverted: paused".into())
        } else {
            Ok(format!("0xchain{}", withdrawal.id))
        }
    }
}

fn with_executor(fail: bool) -> (Harness, Arc<ScriptedExecutor>) {
    let executor = Arc::new(ScriptedExecutor { fail, calls: AtomicUsize::new(0) });
    let h = Harness::with_store(Arc::new(MemoryStore::new()), config::Ledger::default(), Some(executor.clone()));
    (h, executor)
}

fn request(wallet: veiled_ledger::Address, value: &str) -> WithdrawalRequest {
    WithdrawalRequest { wallet, token: token(), amount: amount(value) }
}

#[tokio::test]
async fn replayed_deposit_is_credited_once() {
    let h = Harness::memory();
    let a = key(1);
    h.unlock(&a).await;

    assert!(h.deposit(addr(&a), "100", "0xABC").await);
    assert!(!h.deposit(addr(&a), "100", "0xabc").await);
    assert_eq!(h.balance(addr(&a)), amount("100"));
}

#[tokio::test]
async fn deposit_to_locked_wallet_appears_after_unlock() {
    let h = Harness::memory();
    let b = key(2);
    h.deposit(addr(&b), "50", "0xdep").await;
    assert!(h.balance(addr(&b)).is_zero());
    assert_eq!(h.ledger.stored_balance(&addr(&b), &token()).unwrap(), amount("50"));

    h.unlock(&b).await;
    assert_eq!(h.balance(addr(&b)), amount("50"));
    h.ledger.verify_balance_proof(&h.ledger.balance_proof(&addr(&b), &token()).unwrap()).unwrap();
}

#[tokio::test]
async fn failed_withdrawal_is_compensated() {
    let (h, executor) = with_executor(true);
    let a = key(1);
    h.unlock(&a).await;
    h.deposit(addr(&a), "100", "0xdep").await;
    let before = h.ledger.roots();

    let err = h.settlement.withdraw(&request(addr(&a), "30")).await.unwrap_err();
    assert_eq!(err.kind(), "executor_error");
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.balance(addr(&a)), amount("100"));
    assert_eq!(h.ledger.roots().balance_root, before.balance_root);
    assert!(h.settlement.pending_withdrawals().unwrap().is_empty());

    let stored = h.ledger.store().scan_prefix(layout::WITHDRAWAL_PREFIX).unwrap();
    assert_eq!(stored.len(), 1);
    let record: WithdrawalRecord = serde_json::from_str(&stored[0].1).unwrap();
    assert!(matches!(record.status, WithdrawalStatus::Reverted { .. }));
}

#[tokio::test]
async fn successful_withdrawal_settles_and_debits() {
    let (h, _) = with_executor(false);
    let a = key(1);
    h.unlock(&a).await;
    h.deposit(addr(&a), "100", "0xdep").await;

    let record = h.settlement.withdraw(&request(addr(&a), "30")).await.unwrap();
    assert_eq!(record.status, WithdrawalStatus::Settled { chain_tx_hash: format!("0xchain{}", record.id) });
    assert_eq!(h.balance(addr(&a)), amount("70"));
}

#[tokio::test]
async fn external_executor_reports_back_once() {
    let h = Harness::memory();
    let a = key(1);
    h.unlock(&a).await;
    h.deposit(addr(&a), "100", "0xdep").await;

    let record = h.settlement.withdraw(&request(addr(&a), "25")).await.unwrap();
    assert_eq!(record.status, WithdrawalStatus::Pending);
    assert_eq!(h.balance(addr(&a)), amount("75"));
    assert_eq!(h.settlement.pending_withdrawals().unwrap().len(), 1);

    let failed = h.settlement.complete_withdrawal(&record.id, Err("gas".into())).await.unwrap();
    assert_eq!(failed.status, WithdrawalStatus::Reverted { reason: "gas".into() });
    assert_eq!(h.balance(addr(&a)), amount("100"));

    let again = h.settlement.complete_withdrawal(&record.id, Ok("0x1".into())).await.unwrap_err();
    assert_eq!(again.kind(), "validation_error");
    assert_eq!(h.balance(addr(&a)), amount("100"));

    let missing = h.settlement.complete_withdrawal("nope", Ok("0x1".into())).await.unwrap_err();
    assert_eq!(missing.kind(), "not_found");
}

#[tokio::test]
async fn overdrawn_withdrawal_touches_nothing() {
    let (h, executor) = with_executor(false);
    let a = key(1);
    h.unlock(&a).await;
    h.deposit(addr(&a), "10", "0xdep").await;

    let err = h.settlement.withdraw(&request(addr(&a), "11")).await.unwrap_err();
    assert_eq!(err.kind(), "insufficient_balance");
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    assert!(h.ledger.store().scan_prefix(layout::WITHDRAWAL_PREFIX).unwrap().is_empty());
}

#[tokio::test]
async fn liveness_gates_withdrawals_and_opens_emergency_exit() {
    let (h, executor) = with_executor(false);
    let a = key(1);
    h.unlock(&a).await;
    h.deposit(addr(&a), "100", "0xdep").await;
    h.settlement.publish_root().unwrap();
    let proof = h.ledger.balance_proof(&addr(&a), &token()).unwrap();

    assert_eq!(h.settlement.liveness_state(), LivenessState::Active);
    let early = h.settlement.emergency_withdraw(&addr(&a), &token(), amount("100"), &proof).await;
    assert_eq!(early.unwrap_err().kind(), "settlement_unavailable");

    h.clock.advance(120);
    assert_eq!(h.settlement.liveness_state(), LivenessState::Stalled);
    let err = h.settlement.withdraw(&request(addr(&a), "1")).await.unwrap_err();
    assert_eq!(err.kind(), "settlement_unavailable");
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);

    h.clock.advance(100);
    assert_eq!(h.settlement.liveness_state(), LivenessState::EmergencyWindow);

    let mut inflated = proof.clone();
    inflated.value = amount("1000").to_leaf();
    let err = h.settlement.emergency_withdraw(&addr(&a), &token(), amount("1000"), &inflated).await.unwrap_err();
    assert_eq!(err.kind(), "proof_verification_error");

    let err = h.settlement.emergency_withdraw(&addr(&a), &token(), amount("101"), &proof).await.unwrap_err();
    assert_eq!(err.kind(), "insufficient_balance");

    let paid = h.settlement.emergency_withdraw(&addr(&a), &token(), amount("100"), &proof).await.unwrap();
    assert_eq!(paid, amount("100"));
    assert!(h.balance(addr(&a)).is_zero());

    let replay = h.settlement.emergency_withdraw(&addr(&a), &token(), amount("100"), &proof).await.unwrap_err();
    assert_eq!(replay.kind(), "validation_error");

    assert_eq!(h.settlement.record_ping().unwrap(), LivenessState::Active);
}

#[tokio::test]
async fn proof_for_someone_else_cannot_be_claimed() {
    let h = Harness::memory();
    let (a, b) = (key(1), key(2));
    h.unlock(&a).await;
    h.unlock(&b).await;
    h.deposit(addr(&a), "100", "0xdep1").await;
    h.deposit(addr(&b), "1", "0xdep2").await;
    h.settlement.publish_root().unwrap();
    h.clock.advance(1_000);

    let a_proof = h.ledger.balance_proof(&addr(&a), &token()).unwrap();
    let err = h.settlement.emergency_withdraw(&addr(&b), &token(), amount("100"), &a_proof).await.unwrap_err();
    assert_eq!(err.kind(), "proof_verification_error");
    assert_eq!(h.balance(addr(&b)), amount("1"));
}

#[tokio::test]
async fn last_ping_survives_restart() {
    let db: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    {
        let h = Harness::with_store(db.clone(), config::Ledger::default(), None);
        h.settlement.record_ping().unwrap();
    }
    assert_eq!(db.get(layout::LAST_PING).unwrap(), Some(START.to_string()));
}

#[tokio::test]
async fn settled_withdrawal_cannot_exit_again_through_an_older_proof() {
    let h = Harness::memory();
    let a = key(1);
    h.unlock(&a).await;
    h.deposit(addr(&a), "100", "0xdep").await;
    h.settlement.publish_root().unwrap();
    let proof = h.ledger.balance_proof(&addr(&a), &token()).unwrap();

    let record = h.settlement.withdraw(&request(addr(&a), "100")).await.unwrap();
    let settled = h.settlement.complete_withdrawal(&record.id, Ok("0xpaid".into())).await.unwrap();
    assert!(matches!(settled.status, WithdrawalStatus::Settled { .. }));
    assert!(h.balance(addr(&a)).is_zero());

    h.clock.advance(1_000);
    assert_eq!(h.settlement.liveness_state(), LivenessState::EmergencyWindow);
    let err = h.settlement.emergency_withdraw(&addr(&a), &token(), amount("100"), &proof).await.unwrap_err();
    assert_eq!(err.kind(), "insufficient_balance");
    assert!(h.balance(addr(&a)).is_zero());
    assert_eq!(h.ledger.stored_balance(&addr(&a), &token()).unwrap(), amount("0"));
}
