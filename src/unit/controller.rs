//! Unit controller
//!
//! One controller fronts one unit instance for a role: it resolves the
//! cluster configuration named by the request, builds the unit's effective
//! environment as an explicit per-request value, drives the readiness
//! controller, and forwards the request to the unit's default port. Stop
//! notices from the substrate are forwarded as `stopped` lifecycle events
//! and cycle the readiness state back so the unit can be woken again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::config::{ClusterConfig, ConfigError, ConfigResolver};
use crate::substrate::{
    LaunchSpec, PortWaitOptions, ProxiedRequest, ProxiedResponse, Substrate, TransportError,
};

use super::lifecycle::{EventSink, LifecycleEventKind, LifecycleNotifier};
use super::readiness::{ReadinessController, ReadinessError, ReadyContext};
use super::role::{base_environment, Role, RoleSpec};

/// Request header carrying the resolved cluster name
pub const CLUSTER_HEADER: &str = "x-wazuh-cluster";

/// Errors from handling one request
#[derive(Error, Debug)]
pub enum HandleError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Readiness(#[from] ReadinessError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Tunables shared by every controller
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        let defaults = PortWaitOptions::default();
        Self {
            ready_timeout: defaults.timeout,
            poll_interval: defaults.poll_interval,
        }
    }
}

/// Controller for one unit instance of a role
pub struct UnitController {
    role: Role,
    spec: RoleSpec,
    unit_id: Uuid,
    resolver: Arc<ConfigResolver>,
    substrate: Arc<dyn Substrate>,
    readiness: Arc<ReadinessController>,
    notifier: Arc<LifecycleNotifier>,
    settings: ControllerSettings,
}

impl UnitController {
    pub fn new(
        role: Role,
        resolver: Arc<ConfigResolver>,
        substrate: Arc<dyn Substrate>,
        sink: Option<Arc<dyn EventSink>>,
        settings: ControllerSettings,
    ) -> Arc<Self> {
        let unit_id = Uuid::new_v4();
        let notifier = Arc::new(LifecycleNotifier::new(sink, role, unit_id));
        let readiness = Arc::new(ReadinessController::new(
            role.spec(),
            substrate.clone(),
            notifier.clone(),
        ));

        spawn_stop_monitor(substrate.clone(), readiness.clone(), notifier.clone());

        Arc::new(Self {
            role,
            spec: role.spec(),
            unit_id,
            resolver,
            substrate,
            readiness,
            notifier,
            settings,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn unit_id(&self) -> Uuid {
        self.unit_id
    }

    pub fn readiness(&self) -> &Arc<ReadinessController> {
        &self.readiness
    }

    /// Handle one inbound request: configure, ensure ready, forward
    ///
    /// Any error publishes a best-effort `error` lifecycle event before
    /// propagating to the dispatcher.
    pub async fn handle(
        &self,
        request: ProxiedRequest,
        cancel: &CancellationToken,
    ) -> Result<ProxiedResponse, HandleError> {
        match self.try_handle(request, cancel).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.notifier
                    .publish(
                        LifecycleEventKind::Error,
                        serde_json::json!({ "message": e.to_string() }),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn try_handle(
        &self,
        request: ProxiedRequest,
        cancel: &CancellationToken,
    ) -> Result<ProxiedResponse, HandleError> {
        let hint = request
            .headers
            .get(CLUSTER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let config = self.resolver.resolve(hint.as_deref()).await?;

        debug!(
            role = %self.role,
            unit = %self.unit_id,
            cluster = %config.name,
            path = %request.path_and_query,
            "dispatching to unit"
        );

        let ctx = ReadyContext {
            launch: LaunchSpec {
                image: self.role.image_ref(&config),
                env: self.effective_environment(&config),
                ports: self.spec.required_ports.clone(),
            },
            wait: PortWaitOptions {
                timeout: self.settings.ready_timeout,
                poll_interval: self.settings.poll_interval,
            },
        };
        self.readiness.clone().ensure_ready(ctx, cancel).await?;

        let transport = self.substrate.transport(self.spec.default_port);
        let response = transport.send(request).await?;
        Ok(response)
    }

    /// Base variables merged under the role environment; last merge wins
    fn effective_environment(&self, config: &ClusterConfig) -> HashMap<String, String> {
        let mut env = base_environment(config, self.role);
        env.extend(self.role.environment(config));
        env
    }
}

/// Forward substrate stop notices as lifecycle events and cycle readiness
fn spawn_stop_monitor(
    substrate: Arc<dyn Substrate>,
    readiness: Arc<ReadinessController>,
    notifier: Arc<LifecycleNotifier>,
) {
    let mut stops = substrate.stops();
    tokio::spawn(async move {
        while stops.changed().await.is_ok() {
            let notice = stops.borrow_and_update().clone();
            let Some(notice) = notice else { continue };
            readiness.note_stopped(notice.exit_code);
            notifier
                .publish(
                    LifecycleEventKind::Stopped,
                    serde_json::json!({
                        "exit_code": notice.exit_code,
                        "reason": notice.reason,
                    }),
                )
                .await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::config::store::memory::MemoryConfigStore;
    use crate::config::ConfigCache;
    use crate::substrate::mock::{MockSubstrate, StartScript};
    use crate::substrate::{StopNotice, StopReason};
    use crate::unit::lifecycle::memory::MemoryEventSink;
    use crate::unit::readiness::UnitStatus;

    struct Harness {
        controller: Arc<UnitController>,
        substrate: Arc<MockSubstrate>,
        sink: Arc<MemoryEventSink>,
        store: Arc<MemoryConfigStore>,
    }

    fn harness(role: Role) -> Harness {
        let store = Arc::new(MemoryConfigStore::new());
        let resolver = Arc::new(ConfigResolver::new(
            store.clone(),
            Arc::new(ConfigCache::new()),
            "primary",
        ));
        let substrate = Arc::new(MockSubstrate::new());
        let sink = Arc::new(MemoryEventSink::new());
        let controller = UnitController::new(
            role,
            resolver,
            substrate.clone(),
            Some(sink.clone() as Arc<dyn EventSink>),
            ControllerSettings {
                ready_timeout: Duration::from_millis(5_000),
                poll_interval: Duration::from_millis(100),
            },
        );
        Harness {
            controller,
            substrate,
            sink,
            store,
        }
    }

    fn cluster_document(name: &str) -> serde_json::Value {
        let group = json!({ "count": 1, "image": "", "env": {} });
        json!({
            "name": name,
            "version": "4.9.0",
            "nodes": {
                "managers": group,
                "indexers": group,
                "dashboards": group,
                "certs": group,
            },
            "secrets": {
                "admin_user": "admin",
                "admin_password": "admin",
                "enrollment_key": "ek",
                "api_jwt_secret": "jwt",
                "ca_pem": "PEM",
            }
        })
    }

    #[tokio::test]
    async fn test_handle_forwards_request() {
        let h = harness(Role::Manager);
        let cancel = CancellationToken::new();

        let response = h
            .controller
            .handle(ProxiedRequest::get("/api/agents/summary"), &cancel)
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        let binding = h.substrate.mock_transport();
        let requests = binding.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].path_and_query, "/api/agents/summary");
    }

    #[tokio::test]
    async fn test_handle_builds_launch_environment() {
        let h = harness(Role::Manager);
        let cancel = CancellationToken::new();

        h.controller
            .handle(ProxiedRequest::get("/"), &cancel)
            .await
            .unwrap();

        let launch = h.substrate.last_launch.lock().unwrap().clone().unwrap();
        assert_eq!(launch.image, "wazuh/wazuh-manager:4.9.0");
        assert_eq!(launch.ports, vec![55000]);
        assert_eq!(
            launch.env.get("WAZUH_CLUSTER_NAME"),
            Some(&"primary".to_string())
        );
        assert_eq!(launch.env.get("WAZUH_ROLE"), Some(&"manager".to_string()));
        assert_eq!(
            launch.env.get("WAZUH_IMAGE"),
            Some(&"wazuh/wazuh-manager:4.9.0".to_string())
        );
    }

    #[tokio::test]
    async fn test_cluster_header_selects_cluster() {
        let h = harness(Role::Dashboard);
        h.store
            .insert("clusters:secondary", cluster_document("secondary"));
        let cancel = CancellationToken::new();

        let mut request = ProxiedRequest::get("/dashboard/overview");
        request
            .headers
            .insert(CLUSTER_HEADER, "secondary".parse().unwrap());
        h.controller.handle(request, &cancel).await.unwrap();

        let launch = h.substrate.last_launch.lock().unwrap().clone().unwrap();
        assert_eq!(
            launch.env.get("WAZUH_CLUSTER_NAME"),
            Some(&"secondary".to_string())
        );
    }

    #[tokio::test]
    async fn test_unknown_cluster_fails_before_start() {
        let h = harness(Role::Certs);
        let cancel = CancellationToken::new();

        let mut request = ProxiedRequest::get("/api/certs/ca");
        request
            .headers
            .insert(CLUSTER_HEADER, "ghost".parse().unwrap());
        let err = h.controller.handle(request, &cancel).await.unwrap_err();

        assert!(matches!(
            err,
            HandleError::Config(ConfigError::NotFound(_))
        ));
        assert_eq!(h.substrate.starts(), 0);
    }

    #[tokio::test]
    async fn test_start_failure_publishes_error_event() {
        let h = harness(Role::Manager);
        h.substrate
            .script_start(StartScript::Fail("image missing".to_string()));
        let cancel = CancellationToken::new();

        let err = h
            .controller
            .handle(ProxiedRequest::get("/"), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, HandleError::Readiness(_)));
        assert_eq!(h.sink.kinds(), vec!["error"]);
    }

    #[tokio::test]
    async fn test_stop_notice_emits_stopped_event() {
        let h = harness(Role::Indexer);
        let cancel = CancellationToken::new();
        h.controller
            .handle(ProxiedRequest::get("/_cat/indices"), &cancel)
            .await
            .unwrap();

        h.substrate.emit_stop(StopNotice {
            exit_code: Some(0),
            reason: StopReason::Idle,
        });
        // Let the monitor task observe the notice
        tokio::time::sleep(Duration::from_millis(50)).await;

        let kinds = h.sink.kinds();
        assert!(kinds.contains(&"stopped".to_string()), "events: {:?}", kinds);
        assert_eq!(h.controller.readiness().status(), UnitStatus::Unknown);
    }
}
