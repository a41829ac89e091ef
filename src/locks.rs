//! Per-wallet exclusive sections.
//!
//! A writer takes the locks of every wallet whose balance it reads and
//! rewrites. Locks are taken in address order so two transfers in opposite
//! directions cannot deadlock. Guards release on drop, on every exit path.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::crypto::Address;

#[derive(Default)]
pub struct WalletLocks {
    slots: Mutex<HashMap<Address, Arc<AsyncMutex<()>>>>,
}

/// Held exclusive sections; dropping it releases all of them.
pub struct WalletGuard {
    _held: Vec<OwnedMutexGuard<()>>,
}

impl WalletLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, wallet: &Address) -> Arc<AsyncMutex<()>> {
        self.slots.lock().entry(*wallet).or_default().clone()
    }

    pub async fn acquire(&self, wallets: &[Address]) -> WalletGuard {
        let mut ordered = wallets.to_vec();
        ordered.sort();
        ordered.dedup();
        let mut held = Vec::with_capacity(ordered.len());
        for wallet in &ordered {
            held.push(self.slot(wallet).lock_owned().await);
        }
        WalletGuard { _held: held }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_wallet_is_exclusive_and_disjoint_is_not() {
        let locks = Arc::new(WalletLocks::new());
        let a = Address([1; 20]);
        let b = Address([2; 20]);

        let held = locks.acquire(&[a, b]).await;
        let l = locks.clone();
        let blocked = tokio::spawn(async move { l.acquire(&[b]).await; });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        // a third wallet proceeds immediately
        let c = Address([3; 20]);
        tokio::time::timeout(Duration::from_millis(100), locks.acquire(&[c])).await.unwrap();

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), blocked).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn duplicate_wallets_do_not_self_deadlock() {
        let locks = WalletLocks::new();
        let a = Address([1; 20]);
        tokio::time::timeout(Duration::from_millis(100), locks.acquire(&[a, a])).await.unwrap();
    }
}
