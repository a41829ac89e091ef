use anyhow::{anyhow, Result};
use once_cell::sync::OnceCell;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::thread;
use tracing::{error, info};

/// Process-wide ledger metrics, registered once on first use.
pub struct Metrics {
    registry: Registry,
    pub transfers_ok: IntCounter,
    pub transfers_rejected: IntCounterVec,
    pub deposits_credited: IntCounter,
    pub deposits_duplicate: IntCounter,
    pub withdrawals: IntCounterVec,
    pub emergency_withdrawals: IntCounter,
    /// 0 = active, 1 = stalled, 2 = emergency window
    pub liveness_state: IntGauge,
    pub tree_leaves: IntGaugeVec,
}

static METRICS: OnceCell<Metrics> = OnceCell::new();

impl Metrics {
    fn register() -> prometheus::Result<Self> {
        let registry = Registry::new();
        // Prefix metrics with `veiled_` for namespacing.
        let m = Metrics {
            transfers_ok: IntCounter::new("veiled_transfers_total", "Transfers committed")?,
            transfers_rejected: IntCounterVec::new(
                Opts::new("veiled_transfers_rejected_total", "Transfers rejected, by error kind"),
                &["kind"],
            )?,
            deposits_credited: IntCounter::new("veiled_deposits_credited_total", "On-chain deposits credited")?,
            deposits_duplicate: IntCounter::new(
                "veiled_deposits_duplicate_total",
                "Deposit notifications ignored as replays",
            )?,
            withdrawals: IntCounterVec::new(
                Opts::new("veiled_withdrawals_total", "Withdrawals by final status"),
                &["status"],
            )?,
            emergency_withdrawals: IntCounter::new(
                "veiled_emergency_withdrawals_total",
                "Proof-based exits during the emergency window",
            )?,
            liveness_state: IntGauge::new("veiled_liveness_state", "0 = active, 1 = stalled, 2 = emergency window")?,
            tree_leaves: IntGaugeVec::new(Opts::new("veiled_tree_leaves", "Leaves per tree after rebuild"), &["tree"])?,
            registry,
        };
        m.registry.register(Box::new(m.transfers_ok.clone()))?;
        m.registry.register(Box::new(m.transfers_rejected.clone()))?;
        m.registry.register(Box::new(m.deposits_credited.clone()))?;
        m.registry.register(Box::new(m.deposits_duplicate.clone()))?;
        m.registry.register(Box::new(m.withdrawals.clone()))?;
        m.registry.register(Box::new(m.emergency_withdrawals.clone()))?;
        m.registry.register(Box::new(m.liveness_state.clone()))?;
        m.registry.register(Box::new(m.tree_leaves.clone()))?;
        Ok(m)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

pub fn init() -> Result<&'static Metrics> {
    METRICS.get_or_try_init(Metrics::register).map_err(|e| anyhow!("could not register metrics: {e}"))
}

/// Update the process metrics. A registry that failed to build records
/// nothing; `serve` reports that failure.
pub fn record(f: impl FnOnce(&Metrics)) {
    if let Ok(m) = init() {
        f(m);
    }
}

pub fn serve(cfg: crate::config::Metrics) -> Result<()> {
    let metrics = init()?;
    let server = tiny_http::Server::http(&cfg.bind)
        .map_err(|e| anyhow!("could not start metrics server on {}: {}", cfg.bind, e))?;
    let header = "Content-Type: text/plain; version=0.0.4; charset=utf-8"
        .parse::<tiny_http::Header>()
        .map_err(|_| anyhow!("invalid metrics content-type header"))?;
    info!(bind = %cfg.bind, "metrics endpoint listening");

    thread::Builder::new().name("metrics".into()).spawn(move || {
        for request in server.incoming_requests() {
            let mut buffer = vec![];
            let encoder = TextEncoder::new();
            let metric_families = metrics.registry().gather();
            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                error!(error = %e, "could not encode metrics");
                continue;
            }

            let response = tiny_http::Response::from_data(buffer).with_header(header.clone());
            let _ = request.respond(response);
        }
    })?;

    Ok(())
}
