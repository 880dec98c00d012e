//! Cluster configuration model
//!
//! A `ClusterConfig` describes one logical Wazuh cluster: a node group per
//! role, shared secrets, and feature toggles. Documents are deserialized with
//! defaulting and then validated as a whole - an invalid document is rejected
//! entirely, never partially applied.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Stack version used when a document omits one
pub const DEFAULT_STACK_VERSION: &str = "4.9.0";

/// Configuration for one logical cluster
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Cluster name (lowercase key)
    pub name: String,

    /// Stack version, used as the default image tag
    #[serde(default = "default_version")]
    pub version: String,

    /// One node group per role
    pub nodes: NodeGroups,

    /// Admin credentials, enrollment key, signing secret, CA material
    pub secrets: ClusterSecrets,

    /// Feature toggles
    #[serde(default)]
    pub features: FeatureFlags,
}

fn default_version() -> String {
    DEFAULT_STACK_VERSION.to_string()
}

/// The per-role node groups; every role is mandatory
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NodeGroups {
    pub managers: NodeGroupSpec,
    pub indexers: NodeGroupSpec,
    pub dashboards: NodeGroupSpec,
    pub certs: NodeGroupSpec,
}

/// Sizing and image spec for one role's node group
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NodeGroupSpec {
    /// Desired node count (at least 1)
    pub count: u32,

    /// Upper bound on live instances
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_instances: Option<u32>,

    /// Image reference without tag; empty means the role default
    #[serde(default)]
    pub image: String,

    /// Image tag; defaults to the cluster version when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    /// Extra runtime environment, merged last (caller keys win)
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Optional resource hints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceHints>,
}

/// Resource hints for a node group
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ResourceHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,

    /// Memory limit (e.g. "2g")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Cluster-wide secret material
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClusterSecrets {
    pub admin_user: String,
    pub admin_password: String,
    pub enrollment_key: String,
    pub api_jwt_secret: String,
    pub ca_pem: String,
}

/// Boolean feature toggles
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FeatureFlags {
    #[serde(default = "default_true")]
    pub event_streaming: bool,

    #[serde(default = "default_true")]
    pub log_replication: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            event_streaming: true,
            log_replication: true,
        }
    }
}

impl ClusterConfig {
    /// Parse and validate a cluster document from JSON
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let config: ClusterConfig = serde_json::from_value(value)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the whole document; invalid configuration is never applied
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("cluster name is empty".to_string()));
        }
        if self.version.trim().is_empty() {
            return Err(ConfigError::Invalid("version is empty".to_string()));
        }
        for (role, group) in [
            ("managers", &self.nodes.managers),
            ("indexers", &self.nodes.indexers),
            ("dashboards", &self.nodes.dashboards),
            ("certs", &self.nodes.certs),
        ] {
            group
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("nodes.{}: {}", role, e)))?;
        }
        Ok(())
    }
}

impl NodeGroupSpec {
    fn validate(&self) -> Result<(), String> {
        if self.count < 1 {
            return Err("count must be at least 1".to_string());
        }
        if let Some(max) = self.max_instances {
            if max < 1 {
                return Err("max_instances must be at least 1".to_string());
            }
        }
        Ok(())
    }
}
