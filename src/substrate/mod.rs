//! Execution substrate
//!
//! The substrate is the sandboxed-process layer underneath a unit: it can
//! launch the unit's image, report whether the process is running, expose a
//! request/response transport to one of its ports, and notify observers when
//! the process stops. The orchestrator consumes it behind the [`Substrate`]
//! trait so tests substitute a scripted implementation.

pub mod docker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use docker::{DockerSubstrate, HttpTransport};

/// Errors from substrate operations
#[derive(Error, Debug)]
pub enum SubstrateError {
    #[error("Failed to launch unit: {0}")]
    Launch(String),

    #[error("Ports {ports:?} not ready after {timeout_ms}ms")]
    PortTimeout { ports: Vec<u16>, timeout_ms: u64 },

    #[error("Wait aborted")]
    Aborted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the process-local transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Unit request failed: {0}")]
    Request(String),

    #[error("Invalid upstream response: {0}")]
    Response(String),
}

/// What to launch: image reference, runtime environment, declared ports
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub image: String,
    pub env: HashMap<String, String>,
    pub ports: Vec<u16>,
}

/// Bounds for the port-readiness wait
#[derive(Debug, Clone)]
pub struct PortWaitOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for PortWaitOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(120_000),
            poll_interval: Duration::from_millis(1_000),
        }
    }
}

/// Coarse process status as reported by the substrate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Never launched, or stopped and reaped
    Idle,
    Running,
    Exited,
}

/// Point-in-time process state
#[derive(Debug, Clone)]
pub struct UnitStateSnapshot {
    pub status: ProcessStatus,
    pub last_change: DateTime<Utc>,
    pub exit_code: Option<i64>,
}

/// Why a unit stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Exit,
    RuntimeSignal,
    Idle,
}

/// Stop notification published on the substrate's stop channel
#[derive(Debug, Clone, serde::Serialize)]
pub struct StopNotice {
    pub exit_code: Option<i64>,
    pub reason: StopReason,
}

/// A buffered request forwarded into a unit
#[derive(Debug, Clone)]
pub struct ProxiedRequest {
    pub method: Method,
    /// Path plus optional query string, e.g. `/api/agents?cluster=primary`
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxiedRequest {
    pub fn get(path_and_query: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path_and_query: path_and_query.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// A buffered response from a unit
#[derive(Debug, Clone)]
pub struct ProxiedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxiedResponse {
    pub fn with_status(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// Request/response exchange with one of a unit's exposed ports
#[async_trait]
pub trait UnitTransport: Send + Sync {
    async fn send(&self, request: ProxiedRequest) -> Result<ProxiedResponse, TransportError>;
}

/// The sandboxed-process execution substrate for one unit
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Launch the unit and wait until its declared ports accept connections.
    /// Idempotent: a running unit only re-waits the ports.
    async fn start(
        &self,
        launch: &LaunchSpec,
        wait: &PortWaitOptions,
        cancel: &CancellationToken,
    ) -> Result<(), SubstrateError>;

    /// Current process state
    async fn state(&self) -> UnitStateSnapshot;

    /// Whether the unit process is currently running
    async fn is_running(&self) -> bool;

    /// Transport handle for one of the unit's ports
    fn transport(&self, port: u16) -> Arc<dyn UnitTransport>;

    /// Stop notifications; the channel holds the most recent notice
    fn stops(&self) -> watch::Receiver<Option<StopNotice>>;
}

/// Poll the given TCP ports until they all accept connections
///
/// Bounded by `opts.timeout`, polling every `opts.poll_interval`; aborts
/// promptly on cancellation.
pub async fn wait_for_ports(
    host: &str,
    ports: &[u16],
    opts: &PortWaitOptions,
    cancel: &CancellationToken,
) -> Result<(), SubstrateError> {
    let deadline = Instant::now() + opts.timeout;
    let mut pending: Vec<u16> = ports.to_vec();

    loop {
        let mut still_closed = Vec::new();
        for port in &pending {
            let attempt = tokio::time::timeout(
                Duration::from_millis(500),
                TcpStream::connect((host, *port)),
            );
            match attempt.await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => still_closed.push(*port),
            }
            if cancel.is_cancelled() {
                return Err(SubstrateError::Aborted);
            }
        }
        pending = still_closed;

        if pending.is_empty() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(SubstrateError::PortTimeout {
                ports: pending,
                timeout_ms: opts.timeout.as_millis() as u64,
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(SubstrateError::Aborted),
            _ = tokio::time::sleep(opts.poll_interval) => {}
        }
    }
}

#[cfg(test)]
pub mod mock {
    //! Scripted substrate for orchestrator tests

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Outcome scripted for the next `start` calls
    #[derive(Debug, Clone)]
    pub enum StartScript {
        Ok,
        Fail(String),
        Timeout,
    }

    pub struct MockTransport {
        /// Status codes handed out in order; the last one repeats
        statuses: Mutex<VecDeque<u16>>,
        /// Requests observed, for assertions
        pub requests: Mutex<Vec<ProxiedRequest>>,
        /// When set, fail every exchange
        pub refuse: AtomicBool,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                statuses: Mutex::new(VecDeque::from([200])),
                requests: Mutex::new(Vec::new()),
                refuse: AtomicBool::new(false),
            }
        }

        pub fn script_statuses(&self, statuses: &[u16]) {
            *self.statuses.lock().unwrap() = statuses.iter().copied().collect();
        }

        fn next_status(&self) -> u16 {
            let mut queue = self.statuses.lock().unwrap();
            if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                *queue.front().unwrap_or(&200)
            }
        }
    }

    #[async_trait]
    impl UnitTransport for MockTransport {
        async fn send(&self, request: ProxiedRequest) -> Result<ProxiedResponse, TransportError> {
            self.requests.lock().unwrap().push(request);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(TransportError::Request("connection refused".to_string()));
            }
            let status = StatusCode::from_u16(self.next_status())
                .map_err(|e| TransportError::Response(e.to_string()))?;
            Ok(ProxiedResponse::with_status(status))
        }
    }

    pub struct MockSubstrate {
        pub start_calls: AtomicUsize,
        running: AtomicBool,
        script: Mutex<StartScript>,
        start_delay: Mutex<Duration>,
        transport: Arc<MockTransport>,
        /// Launch spec observed by the most recent `start`
        pub last_launch: Mutex<Option<LaunchSpec>>,
        stops_tx: watch::Sender<Option<StopNotice>>,
        stops_rx: watch::Receiver<Option<StopNotice>>,
    }

    impl MockSubstrate {
        pub fn new() -> Self {
            let (stops_tx, stops_rx) = watch::channel(None);
            Self {
                start_calls: AtomicUsize::new(0),
                running: AtomicBool::new(false),
                script: Mutex::new(StartScript::Ok),
                start_delay: Mutex::new(Duration::from_millis(0)),
                transport: Arc::new(MockTransport::new()),
                last_launch: Mutex::new(None),
                stops_tx,
                stops_rx,
            }
        }

        pub fn script_start(&self, script: StartScript) {
            *self.script.lock().unwrap() = script;
        }

        /// Delay applied before `start` resolves, to widen race windows
        pub fn set_start_delay(&self, delay: Duration) {
            *self.start_delay.lock().unwrap() = delay;
        }

        pub fn mock_transport(&self) -> Arc<MockTransport> {
            self.transport.clone()
        }

        pub fn starts(&self) -> usize {
            self.start_calls.load(Ordering::SeqCst)
        }

        pub fn emit_stop(&self, notice: StopNotice) {
            self.running.store(false, Ordering::SeqCst);
            let _ = self.stops_tx.send(Some(notice));
        }
    }

    #[async_trait]
    impl Substrate for MockSubstrate {
        async fn start(
            &self,
            launch: &LaunchSpec,
            wait: &PortWaitOptions,
            cancel: &CancellationToken,
        ) -> Result<(), SubstrateError> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_launch.lock().unwrap() = Some(launch.clone());
            let delay = *self.start_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SubstrateError::Aborted),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            let script = self.script.lock().unwrap().clone();
            match script {
                StartScript::Ok => {
                    self.running.store(true, Ordering::SeqCst);
                    Ok(())
                }
                StartScript::Fail(message) => Err(SubstrateError::Launch(message)),
                StartScript::Timeout => {
                    tokio::select! {
                        _ = cancel.cancelled() => Err(SubstrateError::Aborted),
                        _ = tokio::time::sleep(wait.timeout) => {
                            Err(SubstrateError::PortTimeout {
                                ports: vec![],
                                timeout_ms: wait.timeout.as_millis() as u64,
                            })
                        }
                    }
                }
            }
        }

        async fn state(&self) -> UnitStateSnapshot {
            let running = self.running.load(Ordering::SeqCst);
            UnitStateSnapshot {
                status: if running {
                    ProcessStatus::Running
                } else {
                    ProcessStatus::Idle
                },
                last_change: Utc::now(),
                exit_code: None,
            }
        }

        async fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn transport(&self, _port: u16) -> Arc<dyn UnitTransport> {
            self.transport.clone()
        }

        fn stops(&self) -> watch::Receiver<Option<StopNotice>> {
            self.stops_rx.clone()
        }
    }
}
