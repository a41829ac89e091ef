use anyhow::anyhow;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

use crate::amount::Amount;
use crate::crypto::{hash_to_hex, Address};
use crate::error::{LedgerError, Result};
use crate::secrets::Purpose;
use crate::settlement::{DepositNotice, Settlement, WithdrawalRequest};
use crate::smt::MerkleProof;
use crate::transfer::TransferRequest;

#[derive(Deserialize)]
struct UnlockBody {
    wallet: Address,
    purpose: Purpose,
    signature: String,
}

#[derive(Deserialize)]
struct EmergencyBody {
    wallet: Address,
    token: Address,
    amount: Amount,
    proof: MerkleProof,
}

#[derive(Deserialize)]
struct SettleBody {
    #[serde(rename = "chainTxHash")]
    chain_tx_hash: String,
}

#[derive(Deserialize)]
struct FailBody {
    reason: String,
}

fn body<T: DeserializeOwned>(raw: &[u8]) -> Result<T> {
    serde_json::from_slice(raw).map_err(|e| LedgerError::Validation(format!("malformed body: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| LedgerError::Persistence(format!("serialize response: {e}")))
}

struct Query(HashMap<String, String>);

impl Query {
    fn parse(raw: &str) -> Self {
        Query(
            raw.split('&')
                .filter(|kv| !kv.is_empty())
                .map(|kv| match kv.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (kv.to_string(), String::new()),
                })
                .collect(),
        )
    }

    fn address(&self, name: &str) -> Result<Address> {
        self.0
            .get(name)
            .ok_or_else(|| LedgerError::Validation(format!("missing query parameter '{name}'")))?
            .parse()
    }
}

fn error_reply(e: &LedgerError) -> (u16, Value) {
    (e.status(), json!({ "error": e.kind(), "message": e.to_string() }))
}

/// Dispatch one request. Returns the status code and the JSON body.
pub async fn route(settlement: &Settlement, method: &str, url: &str, raw: &[u8]) -> (u16, Value) {
    match dispatch(settlement, method, url, raw).await {
        Ok(value) => (200, value),
        Err(e) => {
            debug!(%method, %url, kind = e.kind(), error = %e, "request failed");
            error_reply(&e)
        }
    }
}

async fn dispatch(settlement: &Settlement, method: &str, url: &str, raw: &[u8]) -> Result<Value> {
    let ledger = settlement.ledger();
    let (path, query) = url.split_once('?').unwrap_or((url, ""));
    let query = Query::parse(query);
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        ("POST", ["unlock"]) => {
            let req: UnlockBody = body(raw)?;
            let created = ledger.unlock(&req.wallet, req.purpose, &req.signature).await?;
            Ok(json!({ "wallet": req.wallet, "purpose": req.purpose, "created": created }))
        }
        ("POST", ["transfer"]) => {
            let req: TransferRequest = body(raw)?;
            to_json(&ledger.transfer(&req).await?)
        }
        ("GET", ["balance"]) => {
            let wallet = query.address("wallet")?;
            let token = query.address("token")?;
            Ok(json!({ "wallet": wallet, "token": token, "amount": ledger.balance(&wallet, &token) }))
        }
        ("GET", ["proof", "balance"]) => {
            let proof = ledger.balance_proof(&query.address("wallet")?, &query.address("token")?)?;
            to_json(&proof)
        }
        ("GET", ["proof", "tx"]) => {
            let proof = ledger.tx_proof(
                &query.address("sender")?,
                &query.address("receiver")?,
                &query.address("token")?,
                &query.address("wallet")?,
            )?;
            to_json(&proof)
        }
        ("GET", ["history"]) => {
            let wallet = query.address("wallet")?;
            ledger.secrets().require(&wallet, Purpose::Transaction)?;
            to_json(&ledger.history(&wallet))
        }
        ("GET", ["roots"]) => {
            let roots = ledger.roots();
            let published = settlement.published_root()?.map(|p| hash_to_hex(&p.root));
            Ok(json!({
                "balanceRoot": hash_to_hex(&roots.balance_root),
                "txRoot": hash_to_hex(&roots.tx_root),
                "publishedRoot": published,
                "liveness": settlement.liveness_state(),
            }))
        }
        ("POST", ["roots", "publish"]) => to_json(&settlement.publish_root()?),
        ("POST", ["deposit"]) => {
            let notice: DepositNotice = body(raw)?;
            Ok(json!({ "credited": settlement.deposit(&notice).await? }))
        }
        ("POST", ["withdraw"]) => {
            let req: WithdrawalRequest = body(raw)?;
            to_json(&settlement.withdraw(&req).await?)
        }
        ("POST", ["liveness", "ping"]) => Ok(json!({ "state": settlement.record_ping()? })),
        ("POST", ["emergency", "withdraw"]) => {
            let req: EmergencyBody = body(raw)?;
            let paid = settlement.emergency_withdraw(&req.wallet, &req.token, req.amount, &req.proof).await?;
            Ok(json!({ "amount": paid }))
        }
        ("GET", ["withdrawals"]) => to_json(&settlement.pending_withdrawals()?),
        ("POST", ["withdrawals", id, "settle"]) => {
            let req: SettleBody = body(raw)?;
            to_json(&settlement.complete_withdrawal(id, Ok(req.chain_tx_hash)).await?)
        }
        ("POST", ["withdrawals", id, "fail"]) => {
            let req: FailBody = body(raw)?;
            to_json(&settlement.complete_withdrawal(id, Err(req.reason)).await?)
        }
        _ => Err(LedgerError::NotFound(format!("{method} {path}"))),
    }
}

async fn handle(request: tiny_http::Request, settlement: Arc<Settlement>, header: tiny_http::Header) {
    // tiny_http reads and writes are blocking
    let read = tokio::task::spawn_blocking(move || {
        let mut request = request;
        let mut raw = Vec::new();
        let outcome = request.as_reader().read_to_end(&mut raw).map(|_| raw);
        (request, outcome)
    })
    .await;
    let (request, outcome) = match read {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "request reader task failed");
            return;
        }
    };

    let (status, value) = match outcome {
        Ok(raw) => {
            let method = request.method().to_string().to_uppercase();
            let url = request.url().to_string();
            route(&settlement, &method, &url, &raw).await
        }
        Err(e) => {
            warn!(error = %e, "could not read request body");
            error_reply(&LedgerError::Validation(format!("unreadable request body: {e}")))
        }
    };

    let response = tiny_http::Response::from_string(value.to_string())
        .with_status_code(status)
        .with_header(header);
    let sent = tokio::task::spawn_blocking(move || request.respond(response)).await;
    if let Ok(Err(e)) = sent {
        error!(error = %e, "could not send response");
    }
}

/// Serve the API. The accept loop runs on its own thread and every request
/// becomes a task on `runtime`, so a slow request only holds itself.
/// Returns the bound address.
pub fn serve(bind: &str, settlement: Arc<Settlement>, runtime: tokio::runtime::Handle) -> anyhow::Result<SocketAddr> {
    let server = tiny_http::Server::http(bind).map_err(|e| anyhow!("could not start api server on {bind}: {e}"))?;
    let addr = server
        .server_addr()
        .to_ip()
        .ok_or_else(|| anyhow!("api server on {bind} is not bound to an IP address"))?;
    let header = "Content-Type: application/json"
        .parse::<tiny_http::Header>()
        .map_err(|_| anyhow!("invalid content-type header"))?;
    info!(%addr, "api listening");

    thread::Builder::new().name("api".into()).spawn(move || {
        for request in server.incoming_requests() {
            runtime.spawn(handle(request, settlement.clone(), header.clone()));
        }
    })?;
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreadable_body_is_a_validation_error() {
        let (status, body) = error_reply(&LedgerError::Validation("unreadable request body: reset".into()));
        assert_eq!(status, 400);
        assert_eq!(body["error"], "validation_error");
    }

    #[test]
    fn query_parsing_tolerates_bare_and_empty_pairs() {
        let q = Query::parse("wallet=0x01&flag&&token=");
        assert_eq!(q.0.get("wallet").map(String::as_str), Some("0x01"));
        assert_eq!(q.0.get("flag").map(String::as_str), Some(""));
        assert_eq!(q.address("token").unwrap_err().kind(), "validation_error");
        assert_eq!(q.address("missing").unwrap_err().kind(), "validation_error");
    }
}
