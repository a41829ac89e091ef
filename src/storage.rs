use rocksdb::{Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use anyhow::Context;
use parking_lot::Mutex;
use tracing::info;

use crate::error::{LedgerError, Result};

/// Ordered string-keyed store: the ledger's source of truth.
///
/// Trees are projections rebuilt from here; anything that mutates a tree
/// commits its records through `commit` first.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
    /// All `(key, value)` pairs whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;
    /// Apply every write in `batch` or none of them.
    fn commit(&self, batch: Batch) -> Result<()>;
}

impl dyn KvStore {
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| LedgerError::Persistence(format!("corrupt record '{key}': {e}"))),
            None => Ok(None),
        }
    }
}

/// A set of writes applied atomically by `KvStore::commit`.
#[derive(Debug, Default, Clone)]
pub struct Batch {
    ops: Vec<(String, Option<String>)>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.ops.push((key.into(), Some(value.into())));
    }

    pub fn put_json<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        let key = key.into();
        let text = serde_json::to_string(value)
            .map_err(|e| LedgerError::Persistence(format!("serialize '{key}': {e}")))?;
        self.ops.push((key, Some(text)));
        Ok(())
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.push((key.into(), None));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[(String, Option<String>)] {
        &self.ops
    }
}

/// Persisted key layout.
pub mod layout {
    use crate::crypto::Address;
    use crate::secrets::Purpose;

    pub const BALANCE_PREFIX: &str = "balance:";
    pub const TXDATA_PREFIX: &str = "txdata:";
    pub const SECRET_PREFIX: &str = "secret:";
    pub const WITHDRAWAL_PREFIX: &str = "withdrawal:";
    pub const DEPOSIT_PREFIX: &str = "deposit:";
    pub const EMERGENCY_PREFIX: &str = "emergency:";
    pub const PUBLISHED_ROOT: &str = "root:published";
    pub const LAST_PING: &str = "liveness:last_ping";

    pub fn secret(purpose: Purpose, wallet: &Address) -> String {
        format!("secret:{}:{wallet}", purpose.key_segment())
    }

    pub fn secret_prefix(purpose: Purpose) -> String {
        format!("secret:{}:", purpose.key_segment())
    }

    pub fn balance(wallet: &Address, token: &Address) -> String {
        format!("balance:{wallet}:{token}")
    }

    pub fn balances_of(wallet: &Address) -> String {
        format!("balance:{wallet}:")
    }

    pub fn txdata(sender: &Address, receiver: &Address, token: &Address, side: &str) -> String {
        format!("txdata:{sender}:{receiver}:{token}:{side}")
    }

    pub fn deposit(chain_tx_hash: &str) -> String {
        format!("{DEPOSIT_PREFIX}{}", chain_tx_hash.to_ascii_lowercase())
    }

    pub fn withdrawal(id: &str) -> String {
        format!("withdrawal:{id}")
    }

    pub fn emergency_claim(wallet: &Address, token: &Address, root: &str) -> String {
        format!("{EMERGENCY_PREFIX}{wallet}:{token}:{root}")
    }
}

/// RocksDB-backed store.
pub struct Store {
    pub db: DB,
    path: String,
}

impl Store {
    /// Perform database health check
    pub fn health_check(&self) -> anyhow::Result<()> {
        let test_key = b"health_check";
        self.db.put(test_key, b"ok").with_context(|| "Database write test failed")?;
        let value = self.db.get(test_key).with_context(|| "Database read test failed")?;
        if value.as_deref() != Some(b"ok") {
            anyhow::bail!("Database read/write consistency check failed");
        }
        self.db.delete(test_key).with_context(|| "Database delete test failed")?;
        Ok(())
    }

    pub fn open(base_path: &str) -> anyhow::Result<Self> {
        let db_path = base_path.to_string();

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);

        // WAL files live in /logs under the data directory
        let wal_dir = format!("{db_path}/logs");
        std::fs::create_dir_all(&db_path)
            .with_context(|| format!("Failed to create data directory '{db_path}'"))?;
        std::fs::create_dir_all(&wal_dir)
            .with_context(|| format!("Failed to create WAL directory '{wal_dir}'"))?;
        db_opts.set_wal_dir(&wal_dir);

        db_opts.set_write_buffer_size(64 * 1024 * 1024);
        db_opts.set_max_write_buffer_number(2);
        db_opts.set_target_file_size_base(64 * 1024 * 1024);
        db_opts.set_max_background_jobs(4);
        db_opts.set_max_open_files(512);

        // Ledger writes are synced per batch, so a torn tail only loses unacknowledged writes
        db_opts.set_wal_recovery_mode(rocksdb::DBRecoveryMode::TolerateCorruptedTailRecords);
        db_opts.set_max_total_wal_size(512 * 1024 * 1024);
        db_opts.set_keep_log_file_num(10);

        let db = DB::open(&db_opts, &db_path)
            .with_context(|| format!("Failed to open database at '{db_path}'"))?;

        let store = Store { db, path: db_path };
        store.health_check().with_context(|| "Database health check failed during initialization")?;

        info!(path = %store.path, "database opened");
        Ok(store)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush all memtables and the WAL to disk
    pub fn flush(&self) -> anyhow::Result<()> {
        self.db.flush().with_context(|| "Failed to flush database")?;
        self.db.flush_wal(true).with_context(|| "Failed to flush WAL")?;
        Ok(())
    }

    /// Proper cleanup when shutting down
    pub fn close(&self) -> anyhow::Result<()> {
        self.flush()?;
        self.db.cancel_all_background_work(true);
        Ok(())
    }
}

fn utf8(bytes: &[u8], what: &str) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| LedgerError::Persistence(format!("non-UTF-8 {what} in store")))
}

impl KvStore for Store {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.db.get(key.as_bytes()).map_err(LedgerError::persistence)? {
            Some(v) => utf8(&v, "value").map(Some),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db
            .put_opt(key.as_bytes(), value.as_bytes(), &write_opts)
            .map_err(|e| LedgerError::Persistence(format!("PUT '{key}': {e}")))
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let iter = self.db.iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        let mut out = Vec::new();
        for item in iter {
            let (k, v) = item.map_err(LedgerError::persistence)?;
            if !k.starts_with(prefix.as_bytes()) {
                break;
            }
            out.push((utf8(&k, "key")?, utf8(&v, "value")?));
        }
        Ok(out)
    }

    fn commit(&self, batch: Batch) -> Result<()> {
        let mut wb = WriteBatch::default();
        for (key, value) in batch.ops {
            match value {
                Some(v) => wb.put(key.as_bytes(), v.as_bytes()),
                None => wb.delete(key.as_bytes()),
            }
        }
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db
            .write_opt(wb, &write_opts)
            .map_err(|e| LedgerError::Persistence(format!("batch write: {e}")))
    }
}

/// In-memory store for ephemeral runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.map.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .map
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn commit(&self, batch: Batch) -> Result<()> {
        let mut map = self.map.lock();
        for (key, value) in batch.ops {
            match value {
                Some(v) => map.insert(key, v),
                None => map.remove(&key),
            };
        }
        Ok(())
    }
}

pub fn open(cfg: &crate::config::Storage) -> anyhow::Result<Arc<dyn KvStore>> {
    if cfg.in_memory {
        info!("using in-memory store; nothing will survive a restart");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = Store::open(&cfg.path).with_context(|| {
        format!(
            "Database failed to open at '{}'. Check the directory is writable and no other instance is running",
            cfg.path
        )
    })?;
    Ok(Arc::new(store))
}
