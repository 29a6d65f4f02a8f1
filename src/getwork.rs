//! HTTP getwork client.
//!
//! The minimal alternative to the stream client: poll the node's JSON-RPC
//! endpoint for a block template on a fixed period and report a job whenever
//! the template changes. There is no persistent connection and no session
//! handshake; a failed poll simply retries at the next tick.

use crate::client::ClientEvent;
use crate::config::GetworkConfig;
use crate::error::{PoolClientError, Result};
use crate::protocol::{self, Job, Solution};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

enum GetworkCommand {
    Connect,
    Disconnect,
    SubmitSolution(Solution),
    SubmitHashrate(String),
}

/// Cheap, cloneable handle to a running [`GetworkClient`] task
#[derive(Clone)]
pub struct GetworkHandle {
    commands: mpsc::UnboundedSender<GetworkCommand>,
    connected: Arc<AtomicBool>,
}

impl GetworkHandle {
    /// Start polling
    pub fn connect(&self) {
        let _ = self.commands.send(GetworkCommand::Connect);
    }

    /// Stop polling
    pub fn disconnect(&self) {
        let _ = self.commands.send(GetworkCommand::Disconnect);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// The poll client has no connect or disconnect transitions to wait out
    pub fn is_pending_state(&self) -> bool {
        false
    }

    pub fn submit_solution(&self, solution: Solution) {
        let _ = self.commands.send(GetworkCommand::SubmitSolution(solution));
    }

    pub fn submit_hashrate(&self, rate: String) {
        let _ = self.commands.send(GetworkCommand::SubmitHashrate(rate));
    }
}

/// Periodic getwork poll task.
///
/// Create with [`GetworkClient::new`], spawn `client.run()`, and consume the
/// same [`ClientEvent`] stream the stratum client produces.
pub struct GetworkClient {
    config: GetworkConfig,
    url: Url,
    http: reqwest::Client,
    connected: Arc<AtomicBool>,
    commands: mpsc::UnboundedReceiver<GetworkCommand>,
    events: mpsc::UnboundedSender<ClientEvent>,
    previous: Option<Value>,
}

impl GetworkClient {
    pub fn new(
        config: GetworkConfig,
    ) -> Result<(Self, GetworkHandle, mpsc::UnboundedReceiver<ClientEvent>)> {
        let url = Url::parse(&config.url)
            .map_err(|e| PoolClientError::InvalidUrl(format!("{}: {e}", config.url)))?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        let client = Self {
            config,
            url,
            http,
            connected: connected.clone(),
            commands: command_rx,
            events: event_tx,
            previous: None,
        };
        let handle = GetworkHandle {
            commands: command_tx,
            connected,
        };
        Ok((client, handle, event_rx))
    }

    /// Run the poll task until every handle is dropped
    pub async fn run(mut self) {
        let mut poll =
            tokio::time::interval(Duration::from_millis(self.config.farm_recheck_period.max(1)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(GetworkCommand::Connect) => {
                            if !self.connected.swap(true, Ordering::Relaxed) {
                                self.previous = None;
                                self.emit(ClientEvent::Connected);
                            }
                        }
                        Some(GetworkCommand::Disconnect) => {
                            if self.connected.swap(false, Ordering::Relaxed) {
                                self.emit(ClientEvent::Disconnected);
                            }
                        }
                        Some(GetworkCommand::SubmitSolution(solution)) => {
                            if self.connected.load(Ordering::Relaxed) {
                                self.submit_solution(solution).await;
                            } else {
                                warn!("Solution dropped: getwork client is not started");
                            }
                        }
                        Some(GetworkCommand::SubmitHashrate(rate)) => {
                            if self.connected.load(Ordering::Relaxed) {
                                self.submit_hashrate(&rate).await;
                            }
                        }
                        None => break,
                    }
                }

                _ = poll.tick() => {
                    if self.connected.load(Ordering::Relaxed) {
                        self.poll_work().await;
                    }
                }
            }
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// One JSON-RPC round trip; transport and node errors are returned so
    /// the caller can decide whether they are fatal for the tick.
    async fn rpc_call(&self, request: &Value) -> Result<Value> {
        let response = self
            .http
            .post(self.url.clone())
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        let error = body.get("error").cloned().unwrap_or(Value::Null);
        if !error.is_null() {
            return Err(PoolClientError::Connection(protocol::error_reason(&error)));
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Fetch the current template; report a job when it differs from the
    /// last poll. Failures are logged and retried at the next tick.
    async fn poll_work(&mut self) {
        let request = json!({
            "id": 1,
            "jsonrpc": "2.0",
            "method": "getblocktemplate",
            "params": [{"coinbase": self.config.coinbase}],
        });

        match self.rpc_call(&request).await {
            Ok(result) => {
                if self.previous.as_ref() != Some(&result) {
                    let job = Job::from_template(&result);
                    debug!("New work package received");
                    self.previous = Some(result);
                    self.emit(ClientEvent::WorkReceived(job));
                }
            }
            Err(e) => {
                warn!("Failed to get work from {}: {e}", self.config.url);
            }
        }
    }

    /// Submit the serialized block: big-endian header words plus the raw
    /// transaction data, as one hex string.
    async fn submit_solution(&mut self, solution: Solution) {
        let request = json!({
            "id": 1,
            "jsonrpc": "2.0",
            "method": "submitblock",
            "params": [solution.submit_block_data()],
        });

        match self.rpc_call(&request).await {
            // submitblock answers null on acceptance, a reason string otherwise
            Ok(Value::Null) => {
                info!("Block solution accepted");
                self.emit(ClientEvent::SolutionAccepted(true));
            }
            Ok(reason) => {
                warn!("Block solution rejected: {reason}");
                self.emit(ClientEvent::SolutionRejected(false));
            }
            Err(e) => {
                warn!("Failed to submit block: {e}");
                self.emit(ClientEvent::SolutionRejected(false));
            }
        }
    }

    async fn submit_hashrate(&self, rate: &str) {
        // The coinbase is the only client identifier this protocol carries,
        // and there is no user string to split a worker name from.
        let request = protocol::hashrate_request(rate, &self.config.coinbase, "");
        if let Err(e) = self.rpc_call(&request).await {
            warn!("Submit hashRate failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(url: &str) -> GetworkConfig {
        GetworkConfig {
            url: url.to_string(),
            farm_recheck_period: 500,
            coinbase: "tEnergiCoinbase".to_string(),
            request_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn test_rejects_bad_url() {
        assert!(GetworkClient::new(test_config("not a url")).is_err());
    }

    #[tokio::test]
    async fn test_initial_state_is_disconnected() {
        let (_client, handle, _events) =
            GetworkClient::new(test_config("http://127.0.0.1:9796")).unwrap();
        assert!(!handle.is_connected());
        assert!(!handle.is_pending_state());
    }
}
