//! Enrollment and audit bookkeeping
//!
//! Persists agent, node, and audit records to SQLite. This store is a side
//! contract: core orchestration never reads it, and callers treat writes as
//! best-effort. JSON-shaped columns are stored as serialized text.

use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;

/// Errors from the meta store
#[derive(Error, Debug)]
pub enum MetaStoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// An enrolled agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub hostname: String,
    pub cluster: String,
    pub status: String,
    pub version: String,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
    pub enrolled_at: i64,
    pub last_check_in: Option<i64>,
}

/// A known cluster node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub role: String,
    pub cluster: String,
    pub status: String,
    pub updated_at: i64,
    pub metadata: serde_json::Value,
}

/// One audit trail entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEventRecord {
    pub id: String,
    pub cluster: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    hostname TEXT NOT NULL,
    cluster TEXT NOT NULL,
    status TEXT NOT NULL,
    version TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    metadata TEXT NOT NULL DEFAULT '{}',
    enrolled_at INTEGER NOT NULL,
    last_check_in INTEGER
);
CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY,
    role TEXT NOT NULL,
    cluster TEXT NOT NULL,
    status TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);
CREATE TABLE IF NOT EXISTS audit_events (
    id TEXT PRIMARY KEY,
    cluster TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL
);
"#;

/// SQLite-backed store for agents, nodes, and audit events
pub struct MetaStore {
    pool: SqlitePool,
}

impl MetaStore {
    /// Open (creating if missing) and migrate the database at `url`
    pub async fn connect(url: &str) -> Result<Self, MetaStoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn upsert_agent(&self, agent: &AgentRecord) -> Result<(), MetaStoreError> {
        sqlx::query(
            r#"
            INSERT INTO agents (id, hostname, cluster, status, version, tags, metadata, enrolled_at, last_check_in)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                hostname = excluded.hostname,
                cluster = excluded.cluster,
                status = excluded.status,
                version = excluded.version,
                tags = excluded.tags,
                metadata = excluded.metadata,
                last_check_in = excluded.last_check_in
            "#,
        )
        .bind(&agent.id)
        .bind(&agent.hostname)
        .bind(&agent.cluster)
        .bind(&agent.status)
        .bind(&agent.version)
        .bind(serde_json::to_string(&agent.tags)?)
        .bind(serde_json::to_string(&agent.metadata)?)
        .bind(agent.enrolled_at)
        .bind(agent.last_check_in.unwrap_or(agent.enrolled_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_node(&self, node: &NodeRecord) -> Result<(), MetaStoreError> {
        sqlx::query(
            r#"
            INSERT INTO nodes (id, role, cluster, status, updated_at, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                role = excluded.role,
                cluster = excluded.cluster,
                status = excluded.status,
                updated_at = excluded.updated_at,
                metadata = excluded.metadata
            "#,
        )
        .bind(&node.id)
        .bind(&node.role)
        .bind(&node.cluster)
        .bind(&node.status)
        .bind(node.updated_at)
        .bind(serde_json::to_string(&node.metadata)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_audit_event(&self, event: &AuditEventRecord) -> Result<(), MetaStoreError> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (id, cluster, event_type, payload, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&event.id)
        .bind(&event.cluster)
        .bind(&event.event_type)
        .bind(serde_json::to_string(&event.payload)?)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch one agent by id
    pub async fn get_agent(&self, id: &str) -> Result<Option<AgentRecord>, MetaStoreError> {
        let row = sqlx::query(
            "SELECT id, hostname, cluster, status, version, tags, metadata, enrolled_at, last_check_in FROM agents WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let tags: String = row.get("tags");
        let metadata: String = row.get("metadata");
        Ok(Some(AgentRecord {
            id: row.get("id"),
            hostname: row.get("hostname"),
            cluster: row.get("cluster"),
            status: row.get("status"),
            version: row.get("version"),
            tags: serde_json::from_str(&tags).unwrap_or_default(),
            metadata: serde_json::from_str(&metadata)
                .unwrap_or(serde_json::Value::Object(Default::default())),
            enrolled_at: row.get("enrolled_at"),
            last_check_in: row.try_get("last_check_in").ok(),
        }))
    }

    /// List nodes, optionally scoped to one cluster, newest first
    pub async fn list_nodes(
        &self,
        cluster: Option<&str>,
    ) -> Result<Vec<NodeRecord>, MetaStoreError> {
        let rows = match cluster {
            Some(cluster) => {
                sqlx::query(
                    "SELECT id, role, cluster, status, updated_at, metadata FROM nodes WHERE cluster = ?1 ORDER BY updated_at DESC",
                )
                .bind(cluster)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, role, cluster, status, updated_at, metadata FROM nodes ORDER BY updated_at DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        let now = Utc::now().timestamp_millis();
        rows.into_iter()
            .map(|row| {
                let metadata: String = row.get("metadata");
                Ok(NodeRecord {
                    id: row.get("id"),
                    role: row.get("role"),
                    cluster: row.get("cluster"),
                    status: row.get("status"),
                    updated_at: row.try_get("updated_at").unwrap_or(now),
                    metadata: serde_json::from_str(&metadata)
                        .unwrap_or(serde_json::Value::Object(Default::default())),
                })
            })
            .collect()
    }
}
