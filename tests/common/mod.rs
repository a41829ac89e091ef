#![allow(dead_code)]

use k256::ecdsa::SigningKey;
use std::sync::Arc;
use tempfile::TempDir;
use veiled_ledger::crypto::{address_from_key, sign_personal};
use veiled_ledger::storage::{KvStore, MemoryStore, Store};
use veiled_ledger::{
    config, Address, Amount, DepositNotice, LedgerService, ManualClock, Purpose, SendTransaction, Settlement,
    TransferRequest, WithdrawalExecutor,
};

pub const START: i64 = 1_700_000_000;

pub fn key(n: u8) -> SigningKey {
    SigningKey::from_slice(&[n; 32]).unwrap()
}

pub fn addr(key: &SigningKey) -> Address {
    address_from_key(key.verifying_key())
}

pub fn token() -> Address {
    "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48".parse().unwrap()
}

pub fn amount(text: &str) -> Amount {
    Amount::parse(text).unwrap()
}

pub fn settlement_cfg() -> config::Settlement {
    config::Settlement { liveness_interval_secs: 100, challenge_period_secs: 50 }
}

pub fn rocks(dir: &TempDir) -> Arc<dyn KvStore> {
    let path = dir.path().join("ledger_db");
    Arc::new(Store::open(&path.to_string_lossy()).unwrap())
}

pub struct Harness {
    pub ledger: Arc<LedgerService>,
    pub settlement: Arc<Settlement>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn with_store(db: Arc<dyn KvStore>, ledger_cfg: config::Ledger, executor: Option<Arc<dyn WithdrawalExecutor>>) -> Self {
        let ledger = Arc::new(LedgerService::open(db, ledger_cfg).unwrap());
        let clock = Arc::new(ManualClock::new(START));
        let settlement =
            Arc::new(Settlement::new(ledger.clone(), &settlement_cfg(), executor, clock.clone()).unwrap());
        Harness { ledger, settlement, clock }
    }

    pub fn memory() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), config::Ledger::default(), None)
    }

    pub async fn unlock(&self, key: &SigningKey) {
        let wallet = addr(key);
        for purpose in Purpose::ALL {
            let sig = sign_personal(key, purpose.unlock_message(&wallet).as_bytes()).unwrap();
            self.ledger.unlock(&wallet, purpose, &sig).await.unwrap();
        }
    }

    pub async fn deposit(&self, wallet: Address, value: &str, chain_tx: &str) -> bool {
        let notice = DepositNotice { wallet, token: token(), amount: amount(value), chain_tx_hash: chain_tx.into() };
        self.settlement.deposit(&notice).await.unwrap()
    }

    pub fn balance(&self, wallet: Address) -> Amount {
        self.ledger.balance(&wallet, &token())
    }
}

/// A transfer request signed by `from`.
pub fn signed_transfer(from: &SigningKey, to: Address, value: &str) -> TransferRequest {
    let send = SendTransaction {
        from: addr(from).to_string(),
        to: to.to_string(),
        token: token().to_string(),
        amount: value.into(),
    };
    let message = send.parse().unwrap().canonical_message().unwrap();
    let signature = sign_personal(from, message.as_bytes()).unwrap();
    TransferRequest { send_transaction: send, signature }
}
