//! Docker-backed execution substrate
//!
//! Runs one unit as a detached container on the host network, waits for its
//! declared ports, observes the container's exit through `docker wait`, and
//! enforces an idle-sleep policy keyed off the last transport activity. A
//! stopped unit is relaunched by the next `start` call.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    wait_for_ports, LaunchSpec, PortWaitOptions, ProcessStatus, ProxiedRequest, ProxiedResponse,
    StopNotice, StopReason, Substrate, SubstrateError, TransportError, UnitStateSnapshot,
    UnitTransport,
};

const LOOPBACK: &str = "127.0.0.1";

/// Build the `docker run` argument list for a launch spec
///
/// Environment keys are sorted so the command line is deterministic.
pub fn generate_run_args(container_name: &str, launch: &LaunchSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        container_name.to_string(),
        "--network".to_string(),
        "host".to_string(),
    ];

    let mut keys: Vec<&String> = launch.env.keys().collect();
    keys.sort();
    for key in keys {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, launch.env[key]));
    }

    args.push(launch.image.clone());
    args
}

struct Shared {
    running: AtomicBool,
    state: StdMutex<UnitStateSnapshot>,
    last_activity: StdMutex<Instant>,
    /// Reason claimed by whoever initiates a stop, consumed by the observer
    pending_stop_reason: StdMutex<Option<StopReason>>,
    stops_tx: watch::Sender<Option<StopNotice>>,
}

impl Shared {
    fn set_status(&self, status: ProcessStatus, exit_code: Option<i64>) {
        let mut state = self.state.lock().unwrap();
        state.status = status;
        state.last_change = Utc::now();
        state.exit_code = exit_code;
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }
}

/// Execution substrate backed by a local Docker daemon
pub struct DockerSubstrate {
    container_name: String,
    sleep_after: Option<Duration>,
    launch_lock: Mutex<()>,
    shared: Arc<Shared>,
    stops_rx: watch::Receiver<Option<StopNotice>>,
    client: reqwest::Client,
}

impl DockerSubstrate {
    pub fn new(container_name: impl Into<String>, sleep_after: Option<Duration>) -> Self {
        let (stops_tx, stops_rx) = watch::channel(None);
        Self {
            container_name: container_name.into(),
            sleep_after,
            launch_lock: Mutex::new(()),
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                state: StdMutex::new(UnitStateSnapshot {
                    status: ProcessStatus::Idle,
                    last_change: Utc::now(),
                    exit_code: None,
                }),
                last_activity: StdMutex::new(Instant::now()),
                pending_stop_reason: StdMutex::new(None),
                stops_tx,
            }),
            stops_rx,
            client: reqwest::Client::new(),
        }
    }

    async fn launch(&self, launch: &LaunchSpec) -> Result<(), SubstrateError> {
        // Remove any stale container left from a previous run
        let _ = Command::new("docker")
            .args(["rm", "-f", &self.container_name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await;

        let args = generate_run_args(&self.container_name, launch);
        debug!(container = %self.container_name, image = %launch.image, "launching unit");

        let output = Command::new("docker")
            .args(&args)
            .output()
            .await
            .map_err(|e| SubstrateError::Launch(format!("failed to run docker: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SubstrateError::Launch(stderr.trim().to_string()));
        }

        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.set_status(ProcessStatus::Running, None);
        self.shared.touch();

        self.spawn_exit_observer();
        if let Some(idle) = self.sleep_after {
            self.spawn_idle_reaper(idle);
        }

        info!(container = %self.container_name, "unit launched");
        Ok(())
    }

    /// Watch for the container to exit and publish a stop notice
    fn spawn_exit_observer(&self) {
        let shared = self.shared.clone();
        let name = self.container_name.clone();
        tokio::spawn(async move {
            let output = Command::new("docker").args(["wait", &name]).output().await;

            let exit_code = output
                .ok()
                .filter(|o| o.status.success())
                .and_then(|o| String::from_utf8_lossy(&o.stdout).trim().parse::<i64>().ok());

            let reason = shared
                .pending_stop_reason
                .lock()
                .unwrap()
                .take()
                .unwrap_or(match exit_code {
                    Some(0) => StopReason::Exit,
                    Some(_) => StopReason::RuntimeSignal,
                    None => StopReason::Exit,
                });

            shared.running.store(false, Ordering::SeqCst);
            shared.set_status(ProcessStatus::Exited, exit_code);
            let _ = shared.stops_tx.send(Some(StopNotice { exit_code, reason }));
            info!(container = %name, exit_code = ?exit_code, "unit stopped");
        });
    }

    /// Stop the container once it has been idle for `sleep_after`
    fn spawn_idle_reaper(&self, sleep_after: Duration) {
        let shared = self.shared.clone();
        let name = self.container_name.clone();
        tokio::spawn(async move {
            loop {
                if !shared.running.load(Ordering::SeqCst) {
                    return;
                }
                let idle_for = shared.last_activity.lock().unwrap().elapsed();
                if idle_for >= sleep_after {
                    break;
                }
                tokio::time::sleep(sleep_after - idle_for).await;
            }

            info!(container = %name, "unit idle, putting to sleep");
            *shared.pending_stop_reason.lock().unwrap() = Some(StopReason::Idle);
            let result = Command::new("docker")
                .args(["stop", &name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .output()
                .await;
            if let Err(e) = result {
                warn!(container = %name, error = %e, "idle stop failed");
            }
        });
    }
}

#[async_trait]
impl Substrate for DockerSubstrate {
    async fn start(
        &self,
        launch: &LaunchSpec,
        wait: &PortWaitOptions,
        cancel: &CancellationToken,
    ) -> Result<(), SubstrateError> {
        {
            let _guard = self.launch_lock.lock().await;
            if !self.shared.running.load(Ordering::SeqCst) {
                self.launch(launch).await?;
            }
        }
        wait_for_ports(LOOPBACK, &launch.ports, wait, cancel).await
    }

    async fn state(&self) -> UnitStateSnapshot {
        self.shared.state.lock().unwrap().clone()
    }

    async fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn transport(&self, port: u16) -> Arc<dyn UnitTransport> {
        Arc::new(HttpTransport {
            client: self.client.clone(),
            base: format!("http://{}:{}", LOOPBACK, port),
            shared: self.shared.clone(),
        })
    }

    fn stops(&self) -> watch::Receiver<Option<StopNotice>> {
        self.stops_rx.clone()
    }
}

/// HTTP transport into a unit's exposed port
pub struct HttpTransport {
    client: reqwest::Client,
    base: String,
    shared: Arc<Shared>,
}

#[async_trait]
impl UnitTransport for HttpTransport {
    async fn send(&self, request: ProxiedRequest) -> Result<ProxiedResponse, TransportError> {
        self.shared.touch();

        let url = format!("{}{}", self.base, request.path_and_query);
        let mut headers = request.headers.clone();
        headers.remove(axum::http::header::HOST);
        headers.remove(axum::http::header::CONTENT_LENGTH);

        let response = self
            .client
            .request(request.method, &url)
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Response(e.to_string()))?;

        self.shared.touch();
        Ok(ProxiedResponse {
            status,
            headers,
            body,
        })
    }
}
