//! Ledger error taxonomy.
//!
//! Every failure the core can surface to a caller is one of these variants.
//! `kind()` is the stable identifier returned over the wire; `status()` is the
//! HTTP-style class the API layer answers with.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("signature rejected: {0}")]
    Auth(String),

    #[error("wallet {wallet} has no {purpose} secret")]
    SecretMissing { wallet: String, purpose: &'static str },

    #[error("wallet {wallet} already holds a different {purpose} secret")]
    SecretConflict { wallet: String, purpose: &'static str },

    #[error("sender and receiver are the same wallet")]
    SelfTransfer,

    #[error("insufficient balance: have {available}, need {requested}")]
    InsufficientBalance { available: String, requested: String },

    #[error("amount {0} exceeds 18 fractional digits or the supported range")]
    Precision(String),

    #[error("durable store failure: {0}")]
    Persistence(String),

    #[error("proof rejected: {0}")]
    ProofVerification(String),

    #[error("settlement unavailable: {0}")]
    SettlementUnavailable(String),

    #[error("withdrawal executor failed: {0}")]
    Executor(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl LedgerError {
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::Validation(_) => "validation_error",
            LedgerError::Auth(_) => "auth_error",
            LedgerError::SecretMissing { .. } => "missing_secret",
            LedgerError::SecretConflict { .. } => "secret_conflict",
            LedgerError::SelfTransfer => "self_transfer",
            LedgerError::InsufficientBalance { .. } => "insufficient_balance",
            LedgerError::Precision(_) => "precision_error",
            LedgerError::Persistence(_) => "persistence_error",
            LedgerError::ProofVerification(_) => "proof_verification_error",
            LedgerError::SettlementUnavailable(_) => "settlement_unavailable",
            LedgerError::Executor(_) => "executor_error",
            LedgerError::NotFound(_) => "not_found",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            LedgerError::Validation(_) | LedgerError::SelfTransfer | LedgerError::Precision(_) => 400,
            LedgerError::Auth(_) => 401,
            LedgerError::SecretMissing { .. } => 403,
            LedgerError::NotFound(_) => 404,
            LedgerError::SecretConflict { .. } => 409,
            LedgerError::InsufficientBalance { .. } | LedgerError::ProofVerification(_) => 422,
            LedgerError::Persistence(_) | LedgerError::Executor(_) => 500,
            LedgerError::SettlementUnavailable(_) => 503,
        }
    }

    pub(crate) fn persistence(e: impl std::fmt::Display) -> Self {
        LedgerError::Persistence(e.to_string())
    }
}
