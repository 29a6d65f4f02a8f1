//! Getwork poll client tests against a minimal in-process HTTP responder.

use energi_pool::{ClientEvent, GetworkClient, GetworkConfig, Solution};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

/// Serve HTTP/1.1 JSON-RPC: each request body is handed to `respond`, whose
/// return value becomes the `result` member of the reply.
async fn http_stub(respond: Arc<dyn Fn(&Value) -> Value + Send + Sync>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let respond = respond.clone();
            tokio::spawn(async move {
                let (read_half, mut write_half) = socket.into_split();
                let mut reader = BufReader::new(read_half);
                loop {
                    let mut content_length = 0usize;
                    let mut saw_request_line = false;
                    loop {
                        let mut line = String::new();
                        match reader.read_line(&mut line).await {
                            Ok(0) => return,
                            Ok(_) => {}
                            Err(_) => return,
                        }
                        let line = line.trim_end();
                        if line.is_empty() {
                            break;
                        }
                        saw_request_line = true;
                        if let Some(value) = line
                            .to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(str::trim)
                            .and_then(|v| v.parse().ok())
                        {
                            content_length = value;
                        }
                    }
                    if !saw_request_line {
                        return;
                    }

                    let mut body = vec![0u8; content_length];
                    if reader.read_exact(&mut body).await.is_err() {
                        return;
                    }
                    let request: Value = serde_json::from_slice(&body).unwrap();
                    let reply = json!({
                        "id": request["id"],
                        "jsonrpc": "2.0",
                        "result": respond(&request),
                        "error": null,
                    })
                    .to_string();

                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                        reply.len(),
                        reply
                    );
                    if write_half.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    format!("http://{addr}")
}

async fn next_event(events: &mut UnboundedReceiver<ClientEvent>) -> ClientEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for client event")
        .expect("event channel closed")
}

fn test_config(url: String) -> GetworkConfig {
    GetworkConfig {
        url,
        farm_recheck_period: 50,
        coinbase: "tEnergiCoinbase".to_string(),
        request_timeout: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn poll_reports_only_changed_work() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let polls = Arc::new(AtomicUsize::new(0));
    let polls_in_stub = polls.clone();
    let url = http_stub(Arc::new(move |request| {
        assert_eq!(request["method"], "getblocktemplate");
        assert_eq!(request["params"][0]["coinbase"], "tEnergiCoinbase");
        // Same template for the first three polls, then a new one
        let n = polls_in_stub.fetch_add(1, Ordering::SeqCst);
        if n < 3 {
            json!({"previousblockhash": "aaa", "height": 10})
        } else {
            json!({"previousblockhash": "bbb", "height": 11})
        }
    }))
    .await;

    let (client, handle, mut events) = GetworkClient::new(test_config(url)).unwrap();
    tokio::spawn(client.run());
    handle.connect();

    assert!(matches!(next_event(&mut events).await, ClientEvent::Connected));
    assert!(handle.is_connected());

    match next_event(&mut events).await {
        ClientEvent::WorkReceived(job) => assert_eq!(job.name, "aaa"),
        other => panic!("expected WorkReceived, got {other:?}"),
    }
    // Identical polls in between produce nothing; the next event is the
    // changed template.
    match next_event(&mut events).await {
        ClientEvent::WorkReceived(job) => assert_eq!(job.name, "bbb"),
        other => panic!("expected WorkReceived, got {other:?}"),
    }

    handle.disconnect();
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::Disconnected
    ));
    assert!(!handle.is_connected());
}

#[tokio::test]
async fn submit_block_posts_serialized_header() {
    let url = http_stub(Arc::new(|request| {
        match request["method"].as_str().unwrap() {
            "getblocktemplate" => json!({"previousblockhash": "ccc"}),
            "submitblock" => {
                // Header words big-endian, hex, then the raw transactions
                assert_eq!(request["params"][0], "01020304aabbccddff00");
                Value::Null
            }
            other => panic!("unexpected method {other}"),
        }
    }))
    .await;

    let (client, handle, mut events) = GetworkClient::new(test_config(url)).unwrap();
    tokio::spawn(client.run());
    handle.connect();
    assert!(matches!(next_event(&mut events).await, ClientEvent::Connected));

    handle.submit_solution(Solution {
        job_name: "ccc".to_string(),
        extra_nonce: String::new(),
        time: "0".to_string(),
        nonce: 1,
        hash_mix: String::new(),
        block_header: vec![0x0102_0304, 0xaabb_ccdd],
        transaction_hex: "ff00".to_string(),
    });

    loop {
        match next_event(&mut events).await {
            ClientEvent::SolutionAccepted(true) => break,
            ClientEvent::WorkReceived(_) => continue,
            other => panic!("expected SolutionAccepted, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn hashrate_report_posts_rpc_call() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let reported = Arc::new(AtomicBool::new(false));
    let reported_in_stub = reported.clone();
    let url = http_stub(Arc::new(move |request| {
        match request["method"].as_str().unwrap() {
            "getblocktemplate" => json!({"previousblockhash": "ddd"}),
            "eth_submitHashrate" => {
                assert_eq!(request["id"], 9);
                // Rate plus the coinbase as the client identifier
                assert_eq!(request["params"], json!(["0x1dcd6500", "tEnergiCoinbase"]));
                reported_in_stub.store(true, Ordering::SeqCst);
                json!(true)
            }
            other => panic!("unexpected method {other}"),
        }
    }))
    .await;

    let (client, handle, mut events) = GetworkClient::new(test_config(url)).unwrap();
    tokio::spawn(client.run());
    handle.connect();
    assert!(matches!(next_event(&mut events).await, ClientEvent::Connected));

    handle.submit_hashrate("0x1dcd6500".to_string());

    timeout(Duration::from_secs(5), async {
        while !reported.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("hashrate report never reached the node");
}

#[tokio::test]
async fn poll_failure_retries_next_tick() {
    // No server at all for the first phase: the client must keep ticking
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (client, handle, mut events) =
        GetworkClient::new(test_config(format!("http://127.0.0.1:{port}"))).unwrap();
    tokio::spawn(client.run());
    handle.connect();

    assert!(matches!(next_event(&mut events).await, ClientEvent::Connected));

    // Several failed polls later the client is still up and polling
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(handle.is_connected());
    assert!(events.try_recv().is_err());
}
