//! Built-in default cluster configurations
//!
//! Used when a cluster name has no persisted document in the config store.
//! Only development-grade material lives here; real deployments persist their
//! own documents.

use std::collections::HashMap;

use super::cluster::{
    ClusterConfig, ClusterSecrets, FeatureFlags, NodeGroupSpec, NodeGroups,
};

const SAMPLE_CA_PEM: &str =
    "-----BEGIN CERTIFICATE-----\nMIIF...sample...IDAQAB\n-----END CERTIFICATE-----";

fn group(image: &str, tag: &str) -> NodeGroupSpec {
    NodeGroupSpec {
        count: 1,
        max_instances: None,
        image: image.to_string(),
        tag: Some(tag.to_string()),
        env: HashMap::new(),
        resources: None,
    }
}

/// Look up the built-in configuration for a cluster name
pub fn builtin_cluster(name: &str) -> Option<ClusterConfig> {
    match name {
        "primary" => Some(ClusterConfig {
            name: "primary".to_string(),
            version: "4.9.0".to_string(),
            nodes: NodeGroups {
                managers: group("wazuh/wazuh-manager", "4.9.0"),
                indexers: group("wazuh/wazuh-indexer", "4.9.0"),
                dashboards: group("wazuh/wazuh-dashboard", "4.9.0"),
                certs: group("wazuh/wazuh-certs-generator", "0.0.1"),
            },
            secrets: ClusterSecrets {
                admin_user: "admin".to_string(),
                admin_password: "admin".to_string(),
                enrollment_key: "sample-enrollment-key".to_string(),
                api_jwt_secret: "sample-jwt-secret".to_string(),
                ca_pem: SAMPLE_CA_PEM.to_string(),
            },
            features: FeatureFlags::default(),
        }),
        _ => None,
    }
}
