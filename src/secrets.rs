//! Per-wallet secrets.
//!
//! Each wallet unlocks two secrets by signing a canonical message, one salting
//! its balance leaves and one salting its transfer-history buckets. A secret is
//! written once; re-signing returns the stored value.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::crypto::{hash_from_hex, hash_parts, hash_to_hex, Address, Hash, WalletSignature};
use crate::error::{LedgerError, Result};
use crate::storage::{layout, KvStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    Balance,
    Transaction,
}

impl Purpose {
    pub const ALL: [Purpose; 2] = [Purpose::Balance, Purpose::Transaction];

    pub fn name(&self) -> &'static str {
        match self {
            Purpose::Balance => "balance",
            Purpose::Transaction => "transaction",
        }
    }

    /// Segment used in the persisted `secret:{segment}:{wallet}` key.
    pub fn key_segment(&self) -> &'static str {
        match self {
            Purpose::Balance => "balance",
            Purpose::Transaction => "tx",
        }
    }

    /// The exact text a wallet signs to unlock this purpose.
    pub fn unlock_message(&self, wallet: &Address) -> String {
        format!("Unlock {} secret for {wallet}", self.name())
    }

    fn derivation_context(&self) -> &'static str {
        match self {
            Purpose::Balance => "veiled-ledger secret balance",
            Purpose::Transaction => "veiled-ledger secret transaction",
        }
    }
}

pub struct SecretStore {
    db: Arc<dyn KvStore>,
    cache: RwLock<HashMap<(Address, Purpose), Hash>>,
}

impl SecretStore {
    pub fn new(db: Arc<dyn KvStore>) -> Self {
        Self { db, cache: RwLock::new(HashMap::new()) }
    }

    /// Load every persisted secret. Returns how many were loaded.
    pub fn load_all(&self) -> Result<usize> {
        let mut loaded = 0;
        for purpose in Purpose::ALL {
            let prefix = layout::secret_prefix(purpose);
            for (key, value) in self.db.scan_prefix(&prefix)? {
                let wallet: Address = key[prefix.len()..]
                    .parse()
                    .map_err(|e| LedgerError::Persistence(format!("bad secret key '{key}': {e}")))?;
                let secret = hash_from_hex(&value)
                    .map_err(|e| LedgerError::Persistence(format!("bad secret for {wallet}: {e}")))?;
                self.install(wallet, purpose, secret)?;
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Register an already-derived secret in memory. A different value for an
    /// existing `(wallet, purpose)` would orphan every leaf written under the
    /// old one, so it is refused.
    pub fn install(&self, wallet: Address, purpose: Purpose, secret: Hash) -> Result<()> {
        let mut cache = self.cache.write();
        match cache.get(&(wallet, purpose)) {
            Some(existing) if *existing != secret => Err(LedgerError::SecretConflict {
                wallet: wallet.to_string(),
                purpose: purpose.name(),
            }),
            Some(_) => Ok(()),
            None => {
                cache.insert((wallet, purpose), secret);
                Ok(())
            }
        }
    }

    /// Verify `signature` over the purpose's unlock message and return the
    /// wallet's secret, deriving and persisting it on first use.
    /// The flag is true when the secret was created by this call.
    pub fn derive_secret(&self, wallet: &Address, purpose: Purpose, signature: &str) -> Result<(Hash, bool)> {
        let sig = WalletSignature::parse(signature)?;
        sig.verify(wallet, purpose.unlock_message(wallet).as_bytes())?;

        let mut cache = self.cache.write();
        if let Some(existing) = cache.get(&(*wallet, purpose)) {
            debug!(%wallet, purpose = purpose.name(), "secret already present");
            return Ok((*existing, false));
        }

        let secret = hash_parts(purpose.derivation_context(), &[sig.as_bytes()]);
        self.db.put(&layout::secret(purpose, wallet), &hash_to_hex(&secret))?;
        cache.insert((*wallet, purpose), secret);
        info!(%wallet, purpose = purpose.name(), "secret derived");
        Ok((secret, true))
    }

    pub fn secret(&self, wallet: &Address, purpose: Purpose) -> Option<Hash> {
        self.cache.read().get(&(*wallet, purpose)).copied()
    }

    pub fn require(&self, wallet: &Address, purpose: Purpose) -> Result<Hash> {
        self.secret(wallet, purpose).ok_or_else(|| LedgerError::SecretMissing {
            wallet: wallet.to_string(),
            purpose: purpose.name(),
        })
    }

    pub fn has_secret(&self, wallet: &Address, purpose: Purpose) -> bool {
        self.secret(wallet, purpose).is_some()
    }

    pub fn has_all_secrets(&self, wallet: &Address) -> bool {
        Purpose::ALL.iter().all(|p| self.has_secret(wallet, *p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{address_from_key, sign_personal};
    use crate::storage::MemoryStore;
    use k256::ecdsa::SigningKey;

    fn wallet(n: u8) -> (SigningKey, Address) {
        let k = SigningKey::from_slice(&[n; 32]).unwrap();
        let a = address_from_key(k.verifying_key());
        (k, a)
    }

    #[test]
    fn derive_is_idempotent_and_persisted() {
        let db: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let secrets = SecretStore::new(db.clone());
        let (k, a) = wallet(3);
        let sig = sign_personal(&k, Purpose::Balance.unlock_message(&a).as_bytes()).unwrap();

        let (s1, created) = secrets.derive_secret(&a, Purpose::Balance, &sig).unwrap();
        assert!(created);
        let (s2, created) = secrets.derive_secret(&a, Purpose::Balance, &sig).unwrap();
        assert!(!created);
        assert_eq!(s1, s2);
        assert!(secrets.has_secret(&a, Purpose::Balance));
        assert!(!secrets.has_all_secrets(&a));

        let stored = db.get(&layout::secret(Purpose::Balance, &a)).unwrap().unwrap();
        assert_eq!(hash_from_hex(&stored).unwrap(), s1);

        let reloaded = SecretStore::new(db);
        assert_eq!(reloaded.load_all().unwrap(), 1);
        assert_eq!(reloaded.secret(&a, Purpose::Balance), Some(s1));
    }

    #[test]
    fn wrong_message_or_signer_is_auth_error() {
        let secrets = SecretStore::new(Arc::new(MemoryStore::new()));
        let (k, a) = wallet(3);
        let (_, b) = wallet(4);
        // signed the transaction message, presented for balance
        let sig = sign_personal(&k, Purpose::Transaction.unlock_message(&a).as_bytes()).unwrap();
        assert_eq!(secrets.derive_secret(&a, Purpose::Balance, &sig).unwrap_err().kind(), "auth_error");
        let sig = sign_personal(&k, Purpose::Balance.unlock_message(&b).as_bytes()).unwrap();
        assert_eq!(secrets.derive_secret(&b, Purpose::Balance, &sig).unwrap_err().kind(), "auth_error");
        assert!(!secrets.has_secret(&b, Purpose::Balance));
    }

    #[test]
    fn conflicting_install_is_rejected() {
        let secrets = SecretStore::new(Arc::new(MemoryStore::new()));
        let (_, a) = wallet(5);
        secrets.install(a, Purpose::Transaction, [1u8; 32]).unwrap();
        secrets.install(a, Purpose::Transaction, [1u8; 32]).unwrap();
        let err = secrets.install(a, Purpose::Transaction, [2u8; 32]).unwrap_err();
        assert_eq!(err.kind(), "secret_conflict");
        assert_eq!(secrets.secret(&a, Purpose::Transaction), Some([1u8; 32]));
    }

    #[test]
    fn require_reports_missing_purpose() {
        let secrets = SecretStore::new(Arc::new(MemoryStore::new()));
        let (_, a) = wallet(6);
        let err = secrets.require(&a, Purpose::Transaction).unwrap_err();
        assert_eq!(err.to_string(), format!("wallet {a} has no transaction secret"));
    }
}
