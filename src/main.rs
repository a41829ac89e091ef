use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use veiled_ledger::{api, config, crypto, metrics, storage, Address, LedgerService, Settlement, SystemClock};

#[derive(Parser)]
#[command(author, version, about = "veiled-ledger: private off-chain balances with on-chain settlement")]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log at debug level regardless of the configured filter
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Rebuild state, then serve the API and metrics (default)
    Serve,
    /// Print the balance and transaction roots
    Roots,
    /// Print one wallet's balance (the wallet must have unlocked before)
    Balance {
        #[arg(long)]
        wallet: String,
        #[arg(long)]
        token: String,
    },
    /// Snapshot the current balance root for emergency exits
    PublishRoot,
}

fn load_config(path: &str) -> anyhow::Result<config::Config> {
    match config::load(path) {
        Ok(c) => Ok(c),
        Err(e1) => {
            // fall back to the bundled defaults so a bare binary still starts
            const EMBEDDED_CONFIG: &str = include_str!("../config.toml");
            eprintln!("could not read config from '{path}': {e1:#}; using built-in defaults");
            config::load_from_str(EMBEDDED_CONFIG).with_context(|| format!("failed to load configuration after: {e1}"))
        }
    }
}

fn init_logging(cfg: &config::Log, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.filter))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;
    init_logging(&cfg.log, cli.verbose);

    let db = storage::open(&cfg.storage)?;
    let ledger = Arc::new(LedgerService::open(db, cfg.ledger.clone())?);
    let settlement = Arc::new(Settlement::new(ledger.clone(), &cfg.settlement, None, Arc::new(SystemClock))?);

    match cli.cmd.unwrap_or(Cmd::Serve) {
        Cmd::Serve => {
            if let Err(e) = metrics::serve(cfg.metrics.clone()) {
                warn!(error = %e, "metrics endpoint disabled");
            }
            api::serve(&cfg.api.bind, settlement.clone(), tokio::runtime::Handle::current())?;
            info!(liveness = ?settlement.liveness_state(), "ledger ready");

            signal::ctrl_c().await?;
            info!("shutting down");
        }
        Cmd::Roots => {
            let roots = ledger.roots();
            println!("balance root: {}", crypto::hash_to_hex(&roots.balance_root));
            println!("tx root:      {}", crypto::hash_to_hex(&roots.tx_root));
            match settlement.published_root()? {
                Some(p) => println!("published:    {} at {}", crypto::hash_to_hex(&p.root), p.published_at),
                None => println!("published:    none"),
            }
        }
        Cmd::Balance { wallet, token } => {
            let wallet: Address = wallet.parse()?;
            let token: Address = token.parse()?;
            let stored = ledger.stored_balance(&wallet, &token)?;
            if ledger.secrets().has_secret(&wallet, veiled_ledger::Purpose::Balance) {
                println!("{wallet} {token}: {}", ledger.balance(&wallet, &token));
            } else {
                println!("{wallet} {token}: {stored} (stored; wallet has not unlocked)");
            }
        }
        Cmd::PublishRoot => {
            let published = settlement.publish_root()?;
            println!("published {} at {}", crypto::hash_to_hex(&published.root), published.published_at);
        }
    }
    Ok(())
}
