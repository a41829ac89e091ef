use serde::Deserialize;
use std::{fs, path::Path};
use anyhow::{Context, Result};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub ledger: Ledger,
    #[serde(default)]
    pub settlement: Settlement,
    #[serde(default)]
    pub api: Api,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub log: Log,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Storage {
    #[serde(default = "default_path")]
    pub path: String,
    /// Skip rocksdb entirely; state is lost on exit.
    #[serde(default)]
    pub in_memory: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Ledger {
    /// Reject transfers to wallets that have not unlocked both secrets.
    #[serde(default = "default_true")]
    pub strict_receiver: bool,
    /// Degraded-availability switch: let the history ledger record only the
    /// sender's side when the receiver has no transaction secret.
    #[serde(default = "default_true")]
    pub require_receiver_secret: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settlement {
    #[serde(default = "default_liveness")]
    pub liveness_interval_secs: u64,
    #[serde(default = "default_challenge")]
    pub challenge_period_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Api {
    #[serde(default = "default_api_bind")]
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Metrics {
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Log {
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_path() -> String { "./data".into() }
fn default_true() -> bool { true }
fn default_liveness() -> u64 { 3_600 }        // 1 h between executor pings
fn default_challenge() -> u64 { 86_400 }      // 24 h before the emergency window opens
fn default_api_bind() -> String { "127.0.0.1:8080".into() }
fn default_bind() -> String { "127.0.0.1:9100".into() }
fn default_filter() -> String { "info".into() }

impl Default for Storage {
    fn default() -> Self { Storage { path: default_path(), in_memory: false } }
}

impl Default for Ledger {
    fn default() -> Self { Ledger { strict_receiver: true, require_receiver_secret: true } }
}

impl Default for Settlement {
    fn default() -> Self {
        Settlement { liveness_interval_secs: default_liveness(), challenge_period_secs: default_challenge() }
    }
}

impl Default for Api {
    fn default() -> Self { Api { bind: default_api_bind() } }
}

impl Default for Metrics {
    fn default() -> Self { Metrics { bind: default_bind() } }
}

impl Default for Log {
    fn default() -> Self { Log { filter: default_filter() } }
}

/// Read the TOML file at `p` and deserialize into `Config`.
/// *Adds context* so user errors print a friendlier message.
///
/// # Errors
/// * Returns an anyhow::Error if the file cannot be read or parsed.
pub fn load<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(&p)
        .with_context(|| format!("couldn't read config file {}", p.as_ref().display()))?;
    load_from_str(&text)
}

pub fn load_from_str(text: &str) -> Result<Config> {
    toml::from_str(text).with_context(|| "invalid TOML in config file".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_fills_defaults() {
        let cfg = load_from_str("[ledger]\nstrict_receiver = false\n").unwrap();
        assert!(!cfg.ledger.strict_receiver);
        assert!(cfg.ledger.require_receiver_secret);
        assert_eq!(cfg.storage.path, "./data");
        assert_eq!(cfg.settlement.challenge_period_secs, 86_400);
    }

    #[test]
    fn empty_file_is_valid() {
        let cfg = load_from_str("").unwrap();
        assert_eq!(cfg.api.bind, "127.0.0.1:8080");
        assert_eq!(cfg.log.filter, "info");
    }

    #[test]
    fn bad_toml_is_rejected() {
        assert!(load_from_str("[storage\npath=").is_err());
    }
}
