use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::amount::Amount;
use crate::crypto::{hex_hash, Address, Hash, WalletSignature};
use crate::error::{LedgerError, Result};
use crate::metrics;
use crate::service::{LedgerService, WriteSet};

/// The signed body of a transfer, as received on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendTransaction {
    pub from: String,
    pub to: String,
    pub token: String,
    pub amount: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    #[serde(rename = "sendTransaction")]
    pub send_transaction: SendTransaction,
    pub signature: String,
}

/// A structurally valid transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transfer {
    pub from: Address,
    pub to: Address,
    pub token: Address,
    pub amount: Amount,
}

impl Transfer {
    /// The exact bytes the sender signs: compact JSON with fields in
    /// `from, to, token, amount` order, lowercase addresses and the canonical
    /// decimal amount.
    pub fn canonical_message(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| LedgerError::Validation(format!("serialize transfer: {e}")))
    }
}

impl SendTransaction {
    pub fn parse(&self) -> Result<Transfer> {
        let amount = Amount::parse(&self.amount)?;
        if amount.is_zero() {
            return Err(LedgerError::Validation("amount must be positive".into()));
        }
        Ok(Transfer {
            from: self.from.parse()?,
            to: self.to.parse()?,
            token: self.token.parse()?,
            amount,
        })
    }
}

/// The transfer's commitment: the balance root after it was applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    #[serde(rename = "txHash", with = "hex_hash")]
    pub tx_hash: Hash,
    pub from: Address,
    pub to: Address,
    pub token: Address,
    pub amount: Amount,
}

impl LedgerService {
    pub async fn transfer(&self, request: &TransferRequest) -> Result<TransferResult> {
        let outcome = self.execute_transfer(request).await;
        match &outcome {
            Ok(result) => {
                metrics::record(|m| m.transfers_ok.inc());
                info!(from = %result.from, to = %result.to, token = %result.token, amount = %result.amount, "transfer committed");
            }
            Err(e) => {
                metrics::record(|m| m.transfers_rejected.with_label_values(&[e.kind()]).inc());
                warn!(kind = e.kind(), error = %e, "transfer rejected");
            }
        }
        outcome
    }

    async fn execute_transfer(&self, request: &TransferRequest) -> Result<TransferResult> {
        // 1. structure
        let transfer = request.send_transaction.parse()?;
        let signature = WalletSignature::parse(&request.signature)?;

        // 2. self-transfer
        if transfer.from == transfer.to {
            return Err(LedgerError::SelfTransfer);
        }

        // 3. signature over the canonical body
        signature.verify(&transfer.from, transfer.canonical_message()?.as_bytes())?;

        // 4-5. unlock state of both parties
        if !self.secrets().has_all_secrets(&transfer.from) {
            return Err(LedgerError::SecretMissing {
                wallet: transfer.from.to_string(),
                purpose: missing_purpose(self, &transfer.from),
            });
        }
        let receiver_ready = self.secrets().has_all_secrets(&transfer.to);
        if !receiver_ready {
            if self.config().strict_receiver {
                return Err(LedgerError::SecretMissing {
                    wallet: transfer.to.to_string(),
                    purpose: missing_purpose(self, &transfer.to),
                });
            }
            warn!(to = %transfer.to, "receiver is locked; debiting sender without a deliverable credit");
        }

        // 6-8. read-check-write, exclusive for both wallets
        let _guard = self.locks().acquire(&[transfer.from, transfer.to]).await;

        let available = self.balance(&transfer.from, &transfer.token);
        if available < transfer.amount {
            return Err(LedgerError::InsufficientBalance {
                available: available.to_string(),
                requested: transfer.amount.to_string(),
            });
        }

        let mut writes = WriteSet::new();
        writes.set_balance(transfer.from, transfer.token, available.checked_sub(transfer.amount)?);
        if receiver_ready {
            let credited = self.balance(&transfer.to, &transfer.token).checked_add(transfer.amount)?;
            writes.set_balance(transfer.to, transfer.token, credited);
            let pending = self.prepare_history(
                &transfer.from,
                &transfer.to,
                &transfer.token,
                transfer.amount,
                chrono::Utc::now().timestamp_millis(),
            )?;
            writes.append_history(pending)?;
        }

        let roots = self.commit(writes)?;
        Ok(TransferResult {
            tx_hash: roots.balance_root,
            from: transfer.from,
            to: transfer.to,
            token: transfer.token,
            amount: transfer.amount,
        })
    }
}

fn missing_purpose(service: &LedgerService, wallet: &Address) -> &'static str {
    use crate::secrets::Purpose;
    if service.secrets().has_secret(wallet, Purpose::Balance) {
        Purpose::Transaction.name()
    } else {
        Purpose::Balance.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_message_normalizes_fields() {
        let send = SendTransaction {
            from: "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".into(),
            to: "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".into(),
            token: "0xcccccccccccccccccccccccccccccccccccccccc".into(),
            amount: "40.50".into(),
        };
        let msg = send.parse().unwrap().canonical_message().unwrap();
        assert_eq!(
            msg,
            r#"{"from":"0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa","to":"0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb","token":"0xcccccccccccccccccccccccccccccccccccccccc","amount":"40.5"}"#
        );
    }

    #[test]
    fn zero_and_malformed_amounts_are_rejected() {
        let mut send = SendTransaction {
            from: format!("0x{}", "11".repeat(20)),
            to: format!("0x{}", "22".repeat(20)),
            token: format!("0x{}", "33".repeat(20)),
            amount: "0".into(),
        };
        assert_eq!(send.parse().unwrap_err().kind(), "validation_error");
        send.amount = "1.0000000000000000001".into();
        assert_eq!(send.parse().unwrap_err().kind(), "precision_error");
        send.amount = "1".into();
        send.to = "0x22".into();
        assert_eq!(send.parse().unwrap_err().kind(), "validation_error");
    }

    #[test]
    fn wire_shape_uses_camel_case_names() {
        let json = r#"{"sendTransaction":{"from":"a","to":"b","token":"c","amount":"1"},"signature":"0x"}"#;
        let req: TransferRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.send_transaction.amount, "1");
    }
}
