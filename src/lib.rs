// Library interface for the veiled ledger.
// The binaries and the integration tests go through this crate.

pub mod amount;
pub mod api;
pub mod balances;
pub mod config;
pub mod crypto;
pub mod error;
pub mod history;
pub mod keys;
pub mod locks;
pub mod metrics;
pub mod secrets;
pub mod service;
pub mod settlement;
pub mod smt;
pub mod storage;
pub mod transfer;

pub use amount::Amount;
pub use crypto::{Address, Hash, WalletSignature};
pub use error::{LedgerError, Result};
pub use secrets::Purpose;
pub use service::{LedgerService, Roots};
pub use settlement::{
    Clock, DepositNotice, LivenessState, ManualClock, Settlement, SystemClock, WithdrawalExecutor,
    WithdrawalRecord, WithdrawalRequest, WithdrawalStatus,
};
pub use smt::MerkleProof;
pub use transfer::{SendTransaction, TransferRequest, TransferResult};
