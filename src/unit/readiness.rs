//! Unit readiness state machine
//!
//! Tracks one unit through `Unknown -> Starting -> Healthy`, with `Error`
//! reachable from any state. `ensure_ready` starts the unit if needed, waits
//! for its declared ports, runs the role's application-level probe when one
//! is defined, and marks the unit healthy exactly once per transition.
//! Concurrent callers share a single in-flight wait through a single-flight
//! guard; each caller races the shared wait against its own cancellation
//! token.

use std::sync::{Arc, Mutex as StdMutex};

use axum::http::header::{ACCEPT, AUTHORIZATION};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use base64::prelude::*;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::substrate::{
    LaunchSpec, PortWaitOptions, ProxiedRequest, Substrate, SubstrateError,
};

use super::lifecycle::{LifecycleEventKind, LifecycleNotifier};
use super::role::{ReadinessProbe, RoleSpec};

/// Errors from a readiness wait
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadinessError {
    #[error("Failed to start unit: {0}")]
    Start(String),

    #[error("Unit not ready after {0}ms")]
    Timeout(u64),

    #[error("Readiness wait cancelled")]
    Cancelled,
}

impl From<SubstrateError> for ReadinessError {
    fn from(e: SubstrateError) -> Self {
        match e {
            SubstrateError::PortTimeout { timeout_ms, .. } => ReadinessError::Timeout(timeout_ms),
            SubstrateError::Aborted => ReadinessError::Cancelled,
            other => ReadinessError::Start(other.to_string()),
        }
    }
}

/// Readiness status of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Unknown,
    Starting,
    Healthy,
    Error,
}

/// Readiness state owned by one controller; mutated only via transitions
#[derive(Debug, Clone)]
pub struct UnitReadinessState {
    pub status: UnitStatus,
    pub last_change: DateTime<Utc>,
    pub exit_code: Option<i64>,
}

/// Per-request context for a readiness wait
#[derive(Debug, Clone)]
pub struct ReadyContext {
    pub launch: LaunchSpec,
    pub wait: PortWaitOptions,
}

type FlightResult = Result<(), ReadinessError>;
type Flight = Shared<BoxFuture<'static, FlightResult>>;

/// Readiness controller for one unit instance
pub struct ReadinessController {
    spec: RoleSpec,
    substrate: Arc<dyn Substrate>,
    notifier: Arc<LifecycleNotifier>,
    state: StdMutex<UnitReadinessState>,
    /// Single-flight slot: at most one readiness wait in flight per unit
    pending: Mutex<Option<Flight>>,
    /// Serializes the transition into `Healthy` and its start event
    mark_guard: Mutex<()>,
}

impl ReadinessController {
    pub fn new(
        spec: RoleSpec,
        substrate: Arc<dyn Substrate>,
        notifier: Arc<LifecycleNotifier>,
    ) -> Self {
        Self {
            spec,
            substrate,
            notifier,
            state: StdMutex::new(UnitReadinessState {
                status: UnitStatus::Unknown,
                last_change: Utc::now(),
                exit_code: None,
            }),
            pending: Mutex::new(None),
            mark_guard: Mutex::new(()),
        }
    }

    pub fn status(&self) -> UnitStatus {
        self.state.lock().unwrap().status
    }

    pub fn state(&self) -> UnitReadinessState {
        self.state.lock().unwrap().clone()
    }

    fn transition(&self, status: UnitStatus, exit_code: Option<i64>) {
        let mut state = self.state.lock().unwrap();
        state.status = status;
        state.last_change = Utc::now();
        state.exit_code = exit_code;
    }

    /// Record a substrate-reported stop; the unit will cycle back through
    /// `Starting` on the next `ensure_ready`
    pub fn note_stopped(&self, exit_code: Option<i64>) {
        self.transition(UnitStatus::Unknown, exit_code);
    }

    /// Ensure the unit is started and healthy
    ///
    /// Fast path: already `Healthy` with a confirmed running process.
    /// Otherwise join (or become the leader of) the single readiness wait in
    /// flight for this unit. Start/port-wait failures and probe timeouts are
    /// fatal to this call but not to the controller; later calls retry.
    pub async fn ensure_ready(
        self: Arc<Self>,
        ctx: ReadyContext,
        cancel: &CancellationToken,
    ) -> FlightResult {
        if self.status() == UnitStatus::Healthy && self.substrate.is_running().await {
            return Ok(());
        }

        let flight = {
            let mut pending = self.pending.lock().await;
            match pending.as_ref() {
                Some(flight) => flight.clone(),
                None => {
                    let controller = self.clone();
                    let flight_cancel = cancel.clone();
                    // Run the wait on its own task so a disconnected leader
                    // does not stall joined callers, and clear the slot from
                    // inside the task before its result becomes observable.
                    let task = tokio::spawn(async move {
                        let result = controller.wait_until_ready(ctx, &flight_cancel).await;
                        controller.pending.lock().await.take();
                        result
                    });
                    let flight: Flight = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => {
                                Err(ReadinessError::Start(format!("readiness task failed: {}", e)))
                            }
                        }
                    }
                    .boxed()
                    .shared();
                    *pending = Some(flight.clone());
                    flight
                }
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(ReadinessError::Cancelled),
            result = flight => result,
        }
    }

    async fn wait_until_ready(
        &self,
        ctx: ReadyContext,
        cancel: &CancellationToken,
    ) -> FlightResult {
        self.transition(UnitStatus::Starting, None);
        debug!(
            role = %self.spec.role,
            ports = ?self.spec.required_ports,
            timeout_ms = ctx.wait.timeout.as_millis() as u64,
            "waiting for unit ports"
        );

        if let Err(e) = self.substrate.start(&ctx.launch, &ctx.wait, cancel).await {
            let err = ReadinessError::from(e);
            error!(role = %self.spec.role, error = %err, "unit start failed");
            self.record_failure(&err);
            return Err(err);
        }

        if let ReadinessProbe::HttpHealth {
            path,
            user_env,
            password_env,
        } = self.spec.probe
        {
            if !self.substrate.is_running().await {
                let err = ReadinessError::Start(format!(
                    "{} unit exited during startup",
                    self.spec.role
                ));
                self.record_failure(&err);
                return Err(err);
            }
            if let Err(err) = self
                .probe_http(path, user_env, password_env, &ctx, cancel)
                .await
            {
                self.record_failure(&err);
                return Err(err);
            }
        }

        self.mark_healthy().await;
        Ok(())
    }

    /// Poll the role's health endpoint until it answers
    ///
    /// 200 is healthy; 401/403 prove the service is answering with auth
    /// merely unconfigured or rejected, so they count as healthy too. Any
    /// other status or transport error retries until the timeout window
    /// elapses.
    async fn probe_http(
        &self,
        path: &str,
        user_env: &str,
        password_env: &str,
        ctx: &ReadyContext,
        cancel: &CancellationToken,
    ) -> FlightResult {
        let transport = self.substrate.transport(self.spec.default_port);
        let headers = probe_headers(
            ctx.launch.env.get(user_env).map(String::as_str),
            ctx.launch.env.get(password_env).map(String::as_str),
        );
        let timeout_ms = ctx.wait.timeout.as_millis() as u64;
        let deadline = Instant::now() + ctx.wait.timeout;

        loop {
            if Instant::now() >= deadline {
                warn!(role = %self.spec.role, timeout_ms, "readiness probe timed out");
                return Err(ReadinessError::Timeout(timeout_ms));
            }

            let request = ProxiedRequest {
                method: axum::http::Method::GET,
                path_and_query: path.to_string(),
                headers: headers.clone(),
                body: Bytes::new(),
            };
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return Err(ReadinessError::Cancelled),
                result = transport.send(request) => result,
            };

            match attempt {
                Ok(response) if probe_accepts(response.status) => {
                    debug!(role = %self.spec.role, status = %response.status, "readiness confirmed");
                    return Ok(());
                }
                Ok(response) => {
                    debug!(role = %self.spec.role, status = %response.status, "readiness pending");
                }
                Err(e) => {
                    debug!(role = %self.spec.role, error = %e, "readiness probe failed");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ReadinessError::Cancelled),
                _ = tokio::time::sleep(ctx.wait.poll_interval) => {}
            }
        }
    }

    /// Transition into `Healthy`, publishing the start event at most once
    async fn mark_healthy(&self) {
        let _guard = self.mark_guard.lock().await;
        if self.status() == UnitStatus::Healthy {
            return;
        }
        self.notifier
            .publish(LifecycleEventKind::Started, serde_json::json!({}))
            .await;
        self.transition(UnitStatus::Healthy, None);
    }

    fn record_failure(&self, err: &ReadinessError) {
        match err {
            // A cancelled wait says nothing about the unit itself
            ReadinessError::Cancelled => self.transition(UnitStatus::Unknown, None),
            _ => self.transition(UnitStatus::Error, None),
        }
    }

    #[cfg(test)]
    pub async fn has_pending(&self) -> bool {
        self.pending.lock().await.is_some()
    }
}

fn probe_accepts(status: StatusCode) -> bool {
    status.is_success()
        || status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
}

fn probe_headers(user: Option<&str>, password: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    let user = user.unwrap_or("admin");
    let password = password.unwrap_or("");
    if !password.is_empty() {
        let token = BASE64_STANDARD.encode(format!("{}:{}", user, password));
        if let Ok(value) = HeaderValue::from_str(&format!("Basic {}", token)) {
            headers.insert(AUTHORIZATION, value);
        }
    }
    headers
}
