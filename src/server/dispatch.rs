//! Request dispatch
//!
//! Resolves the target cluster for an inbound request, picks a controller
//! from the role's pool, forwards the buffered request, and maps every
//! controller failure to a uniform role-scoped 502 body. Internal errors
//! never leak beyond their message text.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::store::{AgentRecord, AuditEventRecord};
use crate::substrate::ProxiedRequest;
use crate::unit::{Role, CLUSTER_HEADER};

use super::state::AppState;

/// Largest request body the proxy will buffer
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Errors from cluster resolution
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Cluster name must not be empty")]
    EmptyCluster,

    #[error("Request body too large")]
    BodyTooLarge,
}

/// Agent enrollment request body
#[derive(Debug, Clone, Deserialize)]
pub struct EnrollmentRequest {
    #[serde(alias = "agentId")]
    pub agent_id: String,
    pub hostname: String,
    pub version: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Resolve the target cluster name
///
/// Precedence: explicit override (enrollment body), `?cluster=` query
/// parameter, deployment default. The result must be non-empty.
pub fn resolve_cluster(
    body_override: Option<&str>,
    query: Option<&str>,
    default: &str,
) -> Result<String, DispatchError> {
    let name = body_override.or(query).unwrap_or(default).trim();
    if name.is_empty() {
        return Err(DispatchError::EmptyCluster);
    }
    Ok(name.to_lowercase())
}

/// Extract the `cluster` query parameter from a request URI
pub fn cluster_query_param(uri: &Uri) -> Option<String> {
    uri.query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("cluster="))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Pull a `cluster` override out of a JSON request body
///
/// Malformed JSON is ignored; the caller falls through to query/default.
pub fn body_cluster_override(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value
        .get("cluster")
        .and_then(|c| c.as_str())
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

/// Uniform role-scoped error response
pub fn unavailable_response(role: Role, message: &str) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({
            "error": role.unavailable_code(),
            "message": message,
        })),
    )
        .into_response()
}

/// Proxy one request to a unit of the given role
///
/// `parse_body_cluster` enables the enrollment-only body sniffing; the
/// buffered body is re-sent verbatim either way.
pub async fn proxy(
    state: &AppState,
    role: Role,
    request: Request,
    parse_body_cluster: bool,
) -> Response {
    let (parts, body) = request.into_parts();

    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return unavailable_response(role, &DispatchError::BodyTooLarge.to_string()),
    };

    let body_override = if parse_body_cluster
        && parts.method != Method::GET
        && parts.method != Method::HEAD
    {
        body_cluster_override(&bytes)
    } else {
        None
    };

    let cluster = match resolve_cluster(
        body_override.as_deref(),
        cluster_query_param(&parts.uri).as_deref(),
        state.default_cluster(),
    ) {
        Ok(cluster) => cluster,
        Err(e) => return unavailable_response(role, &e.to_string()),
    };

    let mut headers = parts.headers;
    match HeaderValue::from_str(&cluster) {
        Ok(value) => {
            headers.insert(CLUSTER_HEADER, value);
        }
        Err(_) => return unavailable_response(role, &DispatchError::EmptyCluster.to_string()),
    }

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    let proxied = ProxiedRequest {
        method: parts.method,
        path_and_query,
        headers,
        body: bytes.clone(),
    };

    // Tie cancellation to this handler: dropping the future (client
    // disconnect) cancels every readiness suspension point downstream.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let controller = state.pool(role).pick();
    match controller.handle(proxied, &cancel).await {
        Ok(upstream) => {
            if parse_body_cluster && upstream.status.as_u16() < 400 {
                record_enrollment(state, &cluster, &bytes).await;
            }
            let mut builder = Response::builder().status(upstream.status);
            if let Some(headers) = builder.headers_mut() {
                *headers = upstream.headers;
            }
            builder
                .body(Body::from(upstream.body))
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
        }
        Err(e) => unavailable_response(role, &e.to_string()),
    }
}

/// Best-effort enrollment bookkeeping; never affects the client response
async fn record_enrollment(state: &AppState, cluster: &str, body: &Bytes) {
    let Some(meta) = state.meta() else {
        return;
    };
    let Ok(enrollment) = serde_json::from_slice::<EnrollmentRequest>(body) else {
        return;
    };

    let now = Utc::now().timestamp_millis();
    let agent = AgentRecord {
        id: enrollment.agent_id.clone(),
        hostname: enrollment.hostname,
        cluster: cluster.to_string(),
        status: "enrolled".to_string(),
        version: enrollment.version,
        tags: enrollment.tags,
        metadata: enrollment.metadata,
        enrolled_at: now,
        last_check_in: Some(now),
    };
    if let Err(e) = meta.upsert_agent(&agent).await {
        warn!(agent = %agent.id, error = %e, "failed to persist enrolled agent");
    }

    let audit = AuditEventRecord {
        id: Uuid::new_v4().to_string(),
        cluster: cluster.to_string(),
        event_type: "agent_enrolled".to_string(),
        payload: json!({ "agent_id": enrollment.agent_id }),
        created_at: now,
    };
    if let Err(e) = meta.record_audit_event(&audit).await {
        warn!(error = %e, "failed to record enrollment audit event");
    }
}
