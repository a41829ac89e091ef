use std::sync::Arc;
use veiled_ledger::storage::{self, layout, KvStore};
use veiled_ledger::{config, crypto, LedgerService};

fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "./data".to_string());
    println!("Inspecting ledger database at '{path}'...");

    let store: Arc<dyn KvStore> = Arc::new(storage::Store::open(&path)?);

    println!("\nRecords per prefix:");
    let prefixes = [
        ("balances", layout::BALANCE_PREFIX),
        ("history buckets", layout::TXDATA_PREFIX),
        ("secrets", layout::SECRET_PREFIX),
        ("withdrawals", layout::WITHDRAWAL_PREFIX),
        ("deposits", layout::DEPOSIT_PREFIX),
        ("emergency claims", layout::EMERGENCY_PREFIX),
    ];
    for (label, prefix) in prefixes {
        let rows = store.scan_prefix(prefix)?;
        println!("   {label:<18} {:>8}", rows.len());
    }

    let pending = store
        .scan_prefix(layout::WITHDRAWAL_PREFIX)?
        .into_iter()
        .filter(|(_, v)| v.contains("\"status\":\"pending\""))
        .count();
    if pending > 0 {
        println!("   ⚠️  {pending} withdrawal(s) still pending settlement");
    }

    match store.get(layout::LAST_PING)? {
        Some(ts) => println!("\nLast executor ping: {ts}"),
        None => println!("\nLast executor ping: never"),
    }

    // Rebuild exactly as the server does at startup.
    let ledger = LedgerService::open(store.clone(), config::Ledger::default())?;
    let roots = ledger.roots();
    println!("\nRoots after rebuild:");
    println!("   balance: {}", crypto::hash_to_hex(&roots.balance_root));
    println!("   tx:      {}", crypto::hash_to_hex(&roots.tx_root));
    if let Some(published) = store.get(layout::PUBLISHED_ROOT)? {
        println!("   published snapshot: {published}");
    }
    Ok(())
}
