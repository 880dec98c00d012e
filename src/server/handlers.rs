//! HTTP surface
//!
//! Routes mirror the deployment's public API: dashboard UI and API
//! passthrough, agent/enrollment API (manager), indexer API, certs API, and
//! a liveness endpoint. Every proxied route funnels through the dispatcher.

use axum::{
    extract::{Request, State},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::unit::Role;

use super::dispatch::proxy;
use super::state::AppState;

/// Liveness endpoint
async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn dashboard(State(state): State<AppState>, request: Request) -> Response {
    proxy(&state, Role::Dashboard, request, false).await
}

async fn manager(State(state): State<AppState>, request: Request) -> Response {
    proxy(&state, Role::Manager, request, false).await
}

async fn enroll(State(state): State<AppState>, request: Request) -> Response {
    proxy(&state, Role::Manager, request, true).await
}

async fn indexer(State(state): State<AppState>, request: Request) -> Response {
    proxy(&state, Role::Indexer, request, false).await
}

async fn certs(State(state): State<AppState>, request: Request) -> Response {
    proxy(&state, Role::Certs, request, false).await
}

/// Create the Axum router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/", get(dashboard))
        .route("/dashboard", any(dashboard))
        .route("/dashboard/{*path}", any(dashboard))
        .route("/api/dashboard", any(dashboard))
        .route("/api/dashboard/{*path}", any(dashboard))
        .route("/api/agents/enroll", post(enroll).fallback(manager))
        .route("/api/agents", any(manager))
        .route("/api/agents/{*path}", any(manager))
        .route("/api/indexer", any(indexer))
        .route("/api/indexer/{*path}", any(indexer))
        .route("/api/certs", any(certs))
        .route("/api/certs/{*path}", any(certs))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::config::store::memory::MemoryConfigStore;
    use crate::config::{ConfigCache, ConfigResolver};
    use crate::substrate::mock::{MockSubstrate, StartScript};
    use crate::substrate::Substrate;
    use crate::unit::lifecycle::memory::MemoryEventSink;
    use crate::unit::ControllerSettings;

    struct TestEnv {
        app: Router,
        mocks: Arc<Mutex<HashMap<(Role, usize), Arc<MockSubstrate>>>>,
        store: Arc<MemoryConfigStore>,
    }

    impl TestEnv {
        fn mock(&self, role: Role, index: usize) -> Arc<MockSubstrate> {
            self.mocks.lock().unwrap()[&(role, index)].clone()
        }
    }

    fn env() -> TestEnv {
        env_with(None)
    }

    fn env_with(meta: Option<Arc<crate::store::MetaStore>>) -> TestEnv {
        let store = Arc::new(MemoryConfigStore::new());
        let resolver = Arc::new(ConfigResolver::new(
            store.clone(),
            Arc::new(ConfigCache::new()),
            "primary",
        ));
        let sink = Arc::new(MemoryEventSink::new());
        let mocks: Arc<Mutex<HashMap<(Role, usize), Arc<MockSubstrate>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let factory = {
            let mocks = mocks.clone();
            move |role: Role, index: usize| -> Arc<dyn Substrate> {
                let mock = Arc::new(MockSubstrate::new());
                mocks.lock().unwrap().insert((role, index), mock.clone());
                mock
            }
        };

        let state = AppState::new(
            resolver,
            Some(sink as Arc<dyn crate::unit::EventSink>),
            meta,
            "primary",
            ControllerSettings {
                ready_timeout: std::time::Duration::from_millis(2_000),
                poll_interval: std::time::Duration::from_millis(50),
            },
            factory,
        );

        TestEnv {
            app: create_router(state),
            mocks,
            store,
        }
    }

    fn cluster_document(name: &str) -> Value {
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

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let env = env();
        let response = env
            .app
            .oneshot(
                HttpRequest::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_root_proxies_to_dashboard() {
        let env = env();
        let response = env
            .app
            .clone()
            .oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let mock = env.mock(Role::Dashboard, 0);
        assert_eq!(mock.starts(), 1);
        let launch = mock.last_launch.lock().unwrap().clone().unwrap();
        assert_eq!(
            launch.env.get("WAZUH_CLUSTER_NAME"),
            Some(&"primary".to_string())
        );
    }

    #[tokio::test]
    async fn test_enroll_body_cluster_wins_over_default() {
        let env = env();
        env.store
            .insert("clusters:secondary", cluster_document("secondary"));

        let response = env
            .app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/api/agents/enroll")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"cluster":"secondary","agentId":"a1","hostname":"h","version":"4.9.0"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let mock = env.mock(Role::Manager, 0);
        let launch = mock.last_launch.lock().unwrap().clone().unwrap();
        assert_eq!(
            launch.env.get("WAZUH_CLUSTER_NAME"),
            Some(&"secondary".to_string())
        );

        // The buffered body is re-sent verbatim
        let binding = mock.mock_transport();
        let requests = binding.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(String::from_utf8_lossy(&requests[0].body).contains("\"agentId\":\"a1\""));
    }

    #[tokio::test]
    async fn test_enrollment_records_agent_best_effort() {
        let meta = Arc::new(
            crate::store::MetaStore::connect("sqlite::memory:")
                .await
                .unwrap(),
        );
        let env = env_with(Some(meta.clone()));

        let response = env
            .app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/api/agents/enroll")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"agentId":"a7","hostname":"edge-7","version":"4.9.0","tags":["linux"]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let agent = meta.get_agent("a7").await.unwrap().unwrap();
        assert_eq!(agent.hostname, "edge-7");
        assert_eq!(agent.cluster, "primary");
        assert_eq!(agent.status, "enrolled");
    }

    #[tokio::test]
    async fn test_query_param_selects_cluster() {
        let env = env();
        env.store
            .insert("clusters:secondary", cluster_document("secondary"));

        let response = env
            .app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/indexer/_search?cluster=secondary")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let launch = env
            .mock(Role::Indexer, 0)
            .last_launch
            .lock()
            .unwrap()
            .clone()
            .unwrap();
        assert_eq!(
            launch.env.get("WAZUH_CLUSTER_NAME"),
            Some(&"secondary".to_string())
        );
    }

    #[tokio::test]
    async fn test_unknown_cluster_maps_to_role_scoped_502() {
        let env = env();
        let response = env
            .app
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/indexer/_search?cluster=ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["error"], "indexer_unavailable");
        assert!(body["message"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_start_failure_maps_to_manager_502() {
        let env = env();
        {
            let mocks = env.mocks.lock().unwrap();
            for ((role, _), mock) in mocks.iter() {
                if *role == Role::Manager {
                    mock.script_start(StartScript::Fail("image missing".to_string()));
                }
            }
        }

        let response = env
            .app
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/agents/summary")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["error"], "manager_unavailable");
    }

    #[tokio::test]
    async fn test_certs_route_uses_certs_pool() {
        let env = env();
        let response = env
            .app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/certs/download")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(env.mock(Role::Certs, 0).starts(), 1);
    }

    #[tokio::test]
    async fn test_get_on_enroll_path_falls_back_to_manager_proxy() {
        let env = env();
        let response = env
            .app
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/agents/enroll")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        // Not a 405: non-POST methods proxy like any other agents route
        assert_eq!(response.status(), StatusCode::OK);
    }
}
