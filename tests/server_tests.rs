mod common;

use async_trait::async_trait;
use common::*;
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use veiled_ledger::storage::MemoryStore;
use veiled_ledger::{api, config, WithdrawalExecutor, WithdrawalRecord};

/// Holds every withdrawal until the test releases it.
#[derive(Default)]
struct GatedExecutor {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl WithdrawalExecutor for GatedExecutor {
    async fn execute(&self, withdrawal: &WithdrawalRecord) -> Result<String, String> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(format!("0xsettled{}", withdrawal.id))
    }
}

fn http(addr: SocketAddr, method: &str, path: &str, body: Option<Value>) -> (u16, Value) {
    let body = body.map(|b| b.to_string()).unwrap_or_default();
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    write!(
        stream,
        "{method} {path} HTTP/1.0\r\nHost: localhost\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).unwrap();
    let status = raw.split_whitespace().nth(1).unwrap().parse().unwrap();
    let payload = raw.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("");
    (status, serde_json::from_str(payload).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pending_executor_call_does_not_block_other_requests() {
    let executor = Arc::new(GatedExecutor::default());
    let h = Harness::with_store(Arc::new(MemoryStore::new()), config::Ledger::default(), Some(executor.clone()));
    let a = key(1);
    h.unlock(&a).await;
    h.deposit(addr(&a), "100", "0xdep").await;
    let bound = api::serve("127.0.0.1:0", h.settlement.clone(), tokio::runtime::Handle::current()).unwrap();

    let wallet = addr(&a);
    let withdrawal = tokio::task::spawn_blocking(move || {
        http(bound, "POST", "/withdraw", Some(json!({ "wallet": wallet, "token": token(), "amount": "30" })))
    });
    tokio::time::timeout(Duration::from_secs(5), executor.entered.notified()).await.unwrap();

    // the withdrawal is parked inside the executor; reads still answer
    let roots = tokio::task::spawn_blocking(move || http(bound, "GET", "/roots", None));
    let (status, body) = tokio::time::timeout(Duration::from_secs(5), roots).await.unwrap().unwrap();
    assert_eq!(status, 200, "{body}");

    let balance_path = format!("/balance?wallet={wallet}&token={}", token());
    let balance = tokio::task::spawn_blocking(move || http(bound, "GET", &balance_path, None));
    let (_, body) = tokio::time::timeout(Duration::from_secs(5), balance).await.unwrap().unwrap();
    assert_eq!(body["amount"], "70");

    executor.release.notify_one();
    let (status, record) = tokio::time::timeout(Duration::from_secs(5), withdrawal).await.unwrap().unwrap();
    assert_eq!(status, 200, "{record}");
    assert_eq!(record["status"], "settled");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_route_answers_over_the_socket() {
    let h = Harness::memory();
    let bound = api::serve("127.0.0.1:0", h.settlement.clone(), tokio::runtime::Handle::current()).unwrap();
    let (status, body) = tokio::task::spawn_blocking(move || http(bound, "GET", "/nowhere", None)).await.unwrap();
    assert_eq!(status, 404);
    assert_eq!(body["error"], "not_found");
}
