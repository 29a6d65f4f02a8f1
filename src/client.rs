//! Stream-based stratum client.
//!
//! One task owns the connection lifecycle: resolve the host, walk the
//! endpoint queue until a connect (and TLS handshake) succeeds, subscribe,
//! authorize, then serve the job stream until a timer fires, the pool drops
//! us, or the consumer asks to disconnect. External calls never touch state
//! directly; they enqueue commands onto the session task, and the task
//! reports back through an event channel.

use crate::config::{PoolEndpoint, StratumConfig};
use crate::connection::{resolve_endpoints, PoolConnection};
use crate::error::PoolClientError;
use crate::protocol::{
    self, ids, Job, MessageClass, RpcMessage, Solution,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

/// Session lifecycle and work events delivered to the consumer
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Transport established (subscribe handshake follows)
    Connected,

    /// Session torn down; fired exactly once per connect cycle
    Disconnected,

    /// A fresh job arrived
    WorkReceived(Job),

    /// The pool accepted our solution
    SolutionAccepted(bool),

    /// The pool rejected our solution
    SolutionRejected(bool),
}

enum ClientCommand {
    Connect,
    Disconnect,
    SubmitSolution(Solution),
    SubmitHashrate(String),
    SetEndpoint(PoolEndpoint),
}

/// Session status, readable from any thread.
///
/// All transitions happen on the session task; relaxed ordering is enough
/// because the atomics only serve outside observers.
#[derive(Debug, Default)]
pub struct StatusFlags {
    connecting: AtomicBool,
    connected: AtomicBool,
    subscribed: AtomicBool,
    authorized: AtomicBool,
    disconnecting: AtomicBool,
    response_pending: AtomicBool,
}

impl StatusFlags {
    fn set(flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::Relaxed);
    }

    fn get(flag: &AtomicBool) -> bool {
        flag.load(Ordering::Relaxed)
    }
}

/// Cheap, cloneable handle to a running [`StratumClient`] task
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<ClientCommand>,
    flags: Arc<StatusFlags>,
}

impl ClientHandle {
    /// Start a connect cycle. A no-op while a connect is already in flight.
    pub fn connect(&self) {
        if self.flags.connecting.swap(true, Ordering::Relaxed) {
            return;
        }
        if self.commands.send(ClientCommand::Connect).is_err() {
            StatusFlags::set(&self.flags.connecting, false);
        }
    }

    /// Tear the session down. A no-op while a disconnect is already in flight.
    pub fn disconnect(&self) {
        if self.flags.disconnecting.swap(true, Ordering::Relaxed) {
            return;
        }
        if self.commands.send(ClientCommand::Disconnect).is_err() {
            StatusFlags::set(&self.flags.disconnecting, false);
        }
    }

    pub fn is_connected(&self) -> bool {
        StatusFlags::get(&self.flags.connected)
    }

    /// True while connecting or disconnecting
    pub fn is_pending_state(&self) -> bool {
        StatusFlags::get(&self.flags.connecting) || StatusFlags::get(&self.flags.disconnecting)
    }

    /// Queue a solution for submission on the session task
    pub fn submit_solution(&self, solution: Solution) {
        let _ = self.commands.send(ClientCommand::SubmitSolution(solution));
    }

    /// Hashrate reporting hook. Accepted and dropped by the stream client.
    pub fn submit_hashrate(&self, rate: String) {
        let _ = self.commands.send(ClientCommand::SubmitHashrate(rate));
    }

    /// Replace the pool endpoint; takes effect on the next connect
    pub fn set_endpoint(&self, endpoint: PoolEndpoint) {
        let _ = self.commands.send(ClientCommand::SetEndpoint(endpoint));
    }
}

/// Mutable per-connection protocol state
struct SessionState {
    extra_nonce: String,
    extra_nonce_hex_size: usize,
    next_work_difficulty: f64,
    current_work: Option<Job>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            extra_nonce: String::new(),
            extra_nonce_hex_size: 0,
            next_work_difficulty: 1.0,
            current_work: None,
        }
    }

    fn process_extranonce(&mut self, enonce: &str) {
        info!("Extranonce set to {enonce}");
        let (padded, hex_size) = protocol::pad_extranonce(enonce);
        self.extra_nonce = padded;
        self.extra_nonce_hex_size = hex_size;
    }
}

/// Outcome of handling one inbound message
enum Flow {
    Continue,
    Disconnect,
}

/// Stream-based stratum session task.
///
/// Create with [`StratumClient::new`], then drive it with
/// `tokio::spawn(client.run())` and talk to it through the returned handle.
pub struct StratumClient {
    endpoint: PoolEndpoint,
    /// Replacement endpoint received mid-session, applied at the next connect
    pending_endpoint: Option<PoolEndpoint>,
    config: StratumConfig,
    flags: Arc<StatusFlags>,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl StratumClient {
    pub fn new(
        endpoint: PoolEndpoint,
        config: StratumConfig,
    ) -> (Self, ClientHandle, mpsc::UnboundedReceiver<ClientEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let flags = Arc::new(StatusFlags::default());

        let client = Self {
            endpoint,
            pending_endpoint: None,
            config,
            flags: flags.clone(),
            commands: command_rx,
            events: event_tx,
        };
        let handle = ClientHandle {
            commands: command_tx,
            flags,
        };
        (client, handle, event_rx)
    }

    /// Run the session task until every handle is dropped
    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                ClientCommand::Connect => {
                    if let Some(endpoint) = self.pending_endpoint.take() {
                        self.endpoint = endpoint;
                    }
                    StatusFlags::set(&self.flags.connecting, true);
                    StatusFlags::set(&self.flags.connected, false);
                    StatusFlags::set(&self.flags.subscribed, false);
                    StatusFlags::set(&self.flags.authorized, false);
                    self.run_session().await;
                }
                ClientCommand::Disconnect => {
                    // Nothing to tear down
                    StatusFlags::set(&self.flags.disconnecting, false);
                }
                ClientCommand::SubmitSolution(_) => {
                    warn!("Solution dropped: not connected to a pool");
                }
                ClientCommand::SubmitHashrate(_) => {}
                ClientCommand::SetEndpoint(endpoint) => {
                    self.endpoint = endpoint;
                    self.pending_endpoint = None;
                }
            }
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// One full connect cycle: resolve, walk the endpoint queue, then serve
    /// the session until it ends.
    async fn run_session(&mut self) {
        let host = self.endpoint.host.clone();
        let port = self.endpoint.port;

        let mut endpoints = match resolve_endpoints(&host, port).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!("{e}");
                StatusFlags::set(&self.flags.connected, false);
                StatusFlags::set(&self.flags.connecting, false);
                self.emit(ClientEvent::Disconnected);
                return;
            }
        };

        let conn = loop {
            let Some(addr) = endpoints.pop_front() else {
                warn!("No more IP addresses to try for host: {host}");
                StatusFlags::set(&self.flags.connecting, false);
                self.emit(ClientEvent::Disconnected);
                return;
            };
            info!("Trying {addr} ...");
            // The connect timer bounds the TCP connect and the TLS handshake
            // together; on expiry the attempt is dropped and the next
            // endpoint is tried.
            match timeout(
                self.config.response_timeout,
                PoolConnection::open(addr, &self.endpoint),
            )
            .await
            {
                Ok(Ok(conn)) => break conn,
                Ok(Err(e)) => warn!("Error  {addr} [{e}]"),
                Err(_) => warn!("Error  {addr} [Timeout]"),
            }
        };

        StatusFlags::set(&self.flags.connecting, false);
        StatusFlags::set(&self.flags.connected, true);
        self.emit(ClientEvent::Connected);

        self.session_loop(conn).await;
    }

    async fn session_loop(&mut self, mut conn: PoolConnection) {
        let mut session = SessionState::new();
        let work_timeout = self.config.work_timeout;
        let response_timeout = self.config.response_timeout;
        let mut work_deadline = Instant::now() + work_timeout;
        let mut response_deadline: Option<Instant> = None;

        let subscribe = protocol::subscribe_request(self.endpoint.dialect, &crate::user_agent());
        if let Err(e) = conn.write_message(&subscribe).await {
            warn!("Socket write failed: {e}");
            return self.teardown(conn).await;
        }

        loop {
            tokio::select! {
                msg = conn.read_message() => {
                    match msg {
                        Ok(Some(msg)) => {
                            match self
                                .handle_message(&mut conn, &mut session, msg, &mut work_deadline, &mut response_deadline)
                                .await
                            {
                                Flow::Continue => {}
                                Flow::Disconnect => break,
                            }
                        }
                        Ok(None) => {
                            info!("Connection remotely closed by {}", self.endpoint.host);
                            break;
                        }
                        Err(PoolClientError::InvalidMessage(reason)) => {
                            warn!("Got invalid Json message: {reason}");
                            break;
                        }
                        Err(e) => {
                            warn!("Socket read failed: {e}");
                            break;
                        }
                    }
                }

                cmd = self.commands.recv() => {
                    match cmd {
                        Some(ClientCommand::Disconnect) => break,
                        Some(ClientCommand::SubmitSolution(solution)) => {
                            if let Some(job) = &session.current_work {
                                if job.name != solution.job_name {
                                    debug!("Submitting solution for stale job {}", solution.job_name);
                                }
                            }
                            // Arm the response timer before the frame leaves
                            response_deadline = Some(Instant::now() + response_timeout);
                            let frame = protocol::submit_request(
                                self.endpoint.dialect,
                                &solution,
                                &self.endpoint.user,
                                self.endpoint.worker_suffix(),
                            );
                            if let Err(e) = conn.write_message(&frame).await {
                                warn!("Socket write failed: {e}");
                                break;
                            }
                            StatusFlags::set(&self.flags.response_pending, true);
                        }
                        Some(ClientCommand::SubmitHashrate(_)) => {
                            debug!("Hashrate submission is disabled for stream sessions");
                        }
                        Some(ClientCommand::Connect) => {
                            StatusFlags::set(&self.flags.connecting, false);
                            debug!("Connect ignored: session already established");
                        }
                        Some(ClientCommand::SetEndpoint(endpoint)) => {
                            // The running session keeps its endpoint; the
                            // replacement is picked up by the next connect
                            self.pending_endpoint = Some(endpoint);
                        }
                        None => break,
                    }
                }

                _ = sleep_until(work_deadline) => {
                    warn!("No new work received in {} seconds.", work_timeout.as_secs());
                    break;
                }

                _ = async {
                    match response_deadline {
                        Some(deadline) => sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    if StatusFlags::get(&self.flags.response_pending) {
                        warn!("No response received in {} seconds.", response_timeout.as_secs());
                        break;
                    }
                    response_deadline = None;
                }
            }
        }

        self.teardown(conn).await;
    }

    /// Close the transport and reset every flag. All timers died with the
    /// session loop, so none survives the disconnect.
    async fn teardown(&mut self, mut conn: PoolConnection) {
        StatusFlags::set(&self.flags.disconnecting, true);
        StatusFlags::set(&self.flags.response_pending, false);

        // close_notify exchange for TLS, FIN otherwise; bounded so a dead
        // peer cannot stall the teardown. On expiry the stream is dropped,
        // which force-closes the lowest layer.
        if timeout(self.config.response_timeout, conn.shutdown())
            .await
            .is_err()
        {
            warn!("Shutdown of connection to {} timed out", self.endpoint.host);
        }
        drop(conn);

        StatusFlags::set(&self.flags.subscribed, false);
        StatusFlags::set(&self.flags.authorized, false);
        StatusFlags::set(&self.flags.connected, false);
        StatusFlags::set(&self.flags.connecting, false);
        StatusFlags::set(&self.flags.disconnecting, false);
        self.emit(ClientEvent::Disconnected);
    }

    async fn handle_message(
        &mut self,
        conn: &mut PoolConnection,
        session: &mut SessionState,
        msg: RpcMessage,
        work_deadline: &mut Instant,
        response_deadline: &mut Option<Instant>,
    ) -> Flow {
        if let Err(reason) = msg.validate(self.endpoint.dialect) {
            warn!("Pool sent an invalid jsonrpc message: {reason}");
            warn!("Disconnecting ...");
            return Flow::Disconnect;
        }

        match msg.classify(self.endpoint.dialect) {
            MessageClass::Response(id) => {
                self.handle_response(conn, session, id, &msg, work_deadline, response_deadline)
                    .await
            }
            MessageClass::Notification(method) => {
                self.handle_notification(conn, session, &method, &msg, work_deadline)
                    .await
            }
        }
    }

    async fn handle_response(
        &mut self,
        conn: &mut PoolConnection,
        session: &mut SessionState,
        id: u64,
        msg: &RpcMessage,
        work_deadline: &mut Instant,
        response_deadline: &mut Option<Instant>,
    ) -> Flow {
        match id {
            ids::SUBSCRIBE => self.handle_subscribe_reply(conn, session, msg).await,

            // Reply to mining.extranonce.subscribe carries no logic; actual
            // extranonce changes arrive via mining.set_extranonce.
            ids::EXTRANONCE_SUBSCRIBE => Flow::Continue,

            ids::AUTHORIZE => {
                // Some pools answer result:false, others throw an error;
                // accept either signal.
                let mut success = msg.is_success();
                if success {
                    if let Some(flag) = msg.result.as_bool() {
                        success = flag;
                    }
                }
                StatusFlags::set(&self.flags.authorized, success);
                if !success {
                    info!(
                        "Worker not authorized {} {}",
                        self.endpoint.user,
                        msg.error_text()
                    );
                    return Flow::Disconnect;
                }
                info!("Authorized worker {}", self.endpoint.user);
                Flow::Continue
            }

            ids::SUBMIT => {
                let mut success = msg.is_success();
                if success {
                    if let Some(flag) = msg.result.as_bool() {
                        success = flag;
                    }
                }
                *response_deadline = None;
                StatusFlags::set(&self.flags.response_pending, false);
                if success {
                    self.emit(ClientEvent::SolutionAccepted(true));
                } else {
                    let reason = msg.error_text();
                    warn!("Reject reason: {reason}");
                    self.emit(ClientEvent::SolutionRejected(false));
                }
                Flow::Continue
            }

            ids::GET_WORK => {
                // Reply to the initial eth-proxy work request doubles as the
                // first job broadcast.
                if self.endpoint.dialect == crate::config::ProtocolDialect::EthProxy {
                    if let Some(params) = msg.result.as_array() {
                        return self.handle_mining_notify(session, params, work_deadline);
                    }
                }
                Flow::Continue
            }

            ids::HASHRATE => {
                if !msg.is_success() {
                    warn!("Submit hashRate failed: {}", msg.error_text());
                }
                Flow::Continue
            }

            ids::UNKNOWN_ERROR => {
                // Never sent by us; observed from pools that reject subscribe
                // or authorize under this id. Which request failed follows
                // from how far the handshake got.
                if !msg.is_success() {
                    if !StatusFlags::get(&self.flags.subscribed) {
                        info!("Subscription failed: {}", msg.error_text());
                        return Flow::Disconnect;
                    } else if !StatusFlags::get(&self.flags.authorized) {
                        info!("Worker not authorized: {}", msg.error_text());
                        return Flow::Disconnect;
                    }
                }
                Flow::Continue
            }

            other => {
                info!("Got response for unknown message id [{other}] Discarding ...");
                Flow::Continue
            }
        }
    }

    async fn handle_subscribe_reply(
        &mut self,
        conn: &mut PoolConnection,
        session: &mut SessionState,
        msg: &RpcMessage,
    ) -> Flow {
        use crate::config::ProtocolDialect::*;

        let success = msg.is_success();
        StatusFlags::set(&self.flags.subscribed, success);

        match self.endpoint.dialect {
            Stratum => {
                if !success {
                    info!("Could not subscribe to stratum server");
                    return Flow::Disconnect;
                }
                info!("Subscribed to stratum server");
                let authorize = protocol::authorize_request(
                    Stratum,
                    &self.endpoint.login(),
                    &self.endpoint.pass,
                );
                self.send_or_disconnect(conn, &authorize).await
            }
            EthProxy => {
                if !success {
                    info!("Could not login to ethproxy server: {}", msg.error_text());
                    return Flow::Disconnect;
                }
                info!("Logged in to eth-proxy server");
                StatusFlags::set(&self.flags.authorized, true);
                self.send_or_disconnect(conn, &protocol::get_work_request())
                    .await
            }
            EthereumStratum => {
                if !success {
                    info!("Could not subscribe to stratum server: {}", msg.error_text());
                    return Flow::Disconnect;
                }
                info!("Subscribed to stratum server");
                session.next_work_difficulty = 1.0;
                if let Some(result) = msg.result.as_array() {
                    if let Some(enonce) = result.get(1) {
                        session.process_extranonce(enonce.as_str().unwrap_or(""));
                    }
                }
                if let Flow::Disconnect = self
                    .send_or_disconnect(conn, &protocol::extranonce_subscribe_request())
                    .await
                {
                    return Flow::Disconnect;
                }
                let authorize = protocol::authorize_request(
                    EthereumStratum,
                    &self.endpoint.login(),
                    &self.endpoint.pass,
                );
                self.send_or_disconnect(conn, &authorize).await
            }
        }
    }

    async fn handle_notification(
        &mut self,
        conn: &mut PoolConnection,
        session: &mut SessionState,
        method: &str,
        msg: &RpcMessage,
        work_deadline: &mut Instant,
    ) -> Flow {
        match method {
            "mining.notify" => {
                // Under eth-proxy a method-less job broadcast rides in `result`
                let payload = if !msg.params.is_array()
                    && self.endpoint.dialect == crate::config::ProtocolDialect::EthProxy
                {
                    &msg.result
                } else {
                    &msg.params
                };
                if let Some(params) = payload.as_array() {
                    return self.handle_mining_notify(session, params, work_deadline);
                }
                Flow::Continue
            }

            "mining.set_difficulty" => {
                if let Some(params) = msg.params.as_array() {
                    let difficulty = params.first().and_then(Value::as_f64).unwrap_or(1.0);
                    session.next_work_difficulty = protocol::clamp_difficulty(difficulty);
                    info!("Difficulty set to {}", session.next_work_difficulty);
                }
                Flow::Continue
            }

            "mining.set_extranonce" => {
                if let Some(params) = msg.params.as_array() {
                    let enonce = params.first().and_then(Value::as_str).unwrap_or("");
                    session.process_extranonce(enonce);
                }
                Flow::Continue
            }

            "client.get_version" => {
                let reply =
                    protocol::get_version_reply(msg.id_value(), msg.rpc_version(), crate::VERSION);
                self.send_or_disconnect(conn, &reply).await
            }

            other => {
                warn!("Got unknown method [{other}] from pool. Discarding ...");
                Flow::Continue
            }
        }
    }

    fn handle_mining_notify(
        &mut self,
        session: &mut SessionState,
        params: &[Value],
        work_deadline: &mut Instant,
    ) -> Flow {
        let job = Job::from_notify(
            params,
            &session.extra_nonce,
            session.extra_nonce_hex_size,
            session.next_work_difficulty,
            true,
        );
        if let Some(job) = job {
            *work_deadline = Instant::now() + self.config.work_timeout;
            session.current_work = Some(job.clone());
            self.emit(ClientEvent::WorkReceived(job));
        }
        Flow::Continue
    }

    async fn send_or_disconnect(&self, conn: &mut PoolConnection, frame: &Value) -> Flow {
        match conn.write_message(frame).await {
            Ok(()) => Flow::Continue,
            Err(e) => {
                warn!("Socket write failed: {e}");
                Flow::Disconnect
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProtocolDialect, SecureLevel};

    fn test_endpoint() -> PoolEndpoint {
        PoolEndpoint {
            host: "127.0.0.1".to_string(),
            port: 1,
            user: "wallet.rig".to_string(),
            pass: "x".to_string(),
            path: String::new(),
            secure_level: SecureLevel::None,
            dialect: ProtocolDialect::Stratum,
        }
    }

    #[tokio::test]
    async fn test_initial_flags() {
        let (_client, handle, _events) = StratumClient::new(test_endpoint(), Default::default());
        assert!(!handle.is_connected());
        assert!(!handle.is_pending_state());
    }

    #[tokio::test]
    async fn test_connect_is_single_flight() {
        let (client, handle, _events) = StratumClient::new(test_endpoint(), Default::default());
        // Task not yet running: both calls only queue commands, and the
        // second must be swallowed by the connecting guard.
        handle.connect();
        handle.connect();
        assert!(handle.is_pending_state());

        // Exactly one Connect command was queued
        let mut client = client;
        let first = client.commands.try_recv();
        assert!(matches!(first, Ok(ClientCommand::Connect)));
        assert!(client.commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_guard_resets_when_task_gone() {
        let (client, handle, _events) = StratumClient::new(test_endpoint(), Default::default());
        drop(client);
        handle.disconnect();
        // Send failed, so the guard must have been released
        assert!(!handle.is_pending_state());
    }
}
