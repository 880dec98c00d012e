//! Unit roles
//!
//! A role determines a unit's image default, network ports, runtime
//! environment, and readiness protocol. Each role is a value carrying a small
//! capability record, not a separate type.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::ClusterConfig;

/// The functional kind of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Manager,
    Indexer,
    Dashboard,
    Certs,
}

/// How a role confirms application-level health beyond open ports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessProbe {
    /// Open ports are sufficient
    PortOnly,
    /// Poll an HTTP endpoint on the default port until it answers
    HttpHealth {
        path: &'static str,
        /// Environment keys holding the probe credentials
        user_env: &'static str,
        password_env: &'static str,
    },
}

/// Per-role capability record
#[derive(Debug, Clone)]
pub struct RoleSpec {
    pub role: Role,
    pub default_port: u16,
    pub required_ports: Vec<u16>,
    pub probe: ReadinessProbe,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Manager, Role::Indexer, Role::Dashboard, Role::Certs];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Manager => "manager",
            Role::Indexer => "indexer",
            Role::Dashboard => "dashboard",
            Role::Certs => "certs",
        }
    }

    /// Error code used in user-facing 502 bodies
    pub fn unavailable_code(&self) -> &'static str {
        match self {
            Role::Manager => "manager_unavailable",
            Role::Indexer => "indexer_unavailable",
            Role::Dashboard => "dashboard_unavailable",
            Role::Certs => "certs_unavailable",
        }
    }

    /// Controller pool size for this role
    pub fn pool_size(&self) -> usize {
        match self {
            Role::Manager => 3,
            Role::Indexer => 2,
            Role::Dashboard => 2,
            Role::Certs => 1,
        }
    }

    fn default_image(&self) -> &'static str {
        match self {
            Role::Manager => "wazuh/wazuh-manager",
            Role::Indexer => "wazuh/wazuh-indexer",
            Role::Dashboard => "wazuh/wazuh-dashboard",
            Role::Certs => "wazuh/wazuh-certs-generator",
        }
    }

    /// The capability record for this role
    pub fn spec(&self) -> RoleSpec {
        match self {
            Role::Manager => RoleSpec {
                role: *self,
                default_port: 55000,
                required_ports: vec![55000],
                probe: ReadinessProbe::PortOnly,
            },
            Role::Indexer => RoleSpec {
                role: *self,
                default_port: 9200,
                required_ports: vec![9200],
                probe: ReadinessProbe::HttpHealth {
                    path: "/_cluster/health?wait_for_status=yellow&timeout=5s",
                    user_env: "OPENSEARCH_INITIAL_ADMIN_USER",
                    password_env: "OPENSEARCH_INITIAL_ADMIN_PASSWORD",
                },
            },
            Role::Dashboard => RoleSpec {
                role: *self,
                default_port: 5601,
                required_ports: vec![5601],
                probe: ReadinessProbe::PortOnly,
            },
            Role::Certs => RoleSpec {
                role: *self,
                default_port: 1515,
                required_ports: vec![1515],
                probe: ReadinessProbe::PortOnly,
            },
        }
    }

    fn node_group<'a>(&self, config: &'a ClusterConfig) -> &'a crate::config::NodeGroupSpec {
        match self {
            Role::Manager => &config.nodes.managers,
            Role::Indexer => &config.nodes.indexers,
            Role::Dashboard => &config.nodes.dashboards,
            Role::Certs => &config.nodes.certs,
        }
    }

    /// Image reference for this role: `image:tag` with role-default image
    /// and cluster-version-default tag
    pub fn image_ref(&self, config: &ClusterConfig) -> String {
        let group = self.node_group(config);
        let image = if group.image.is_empty() {
            self.default_image()
        } else {
            &group.image
        };
        let tag = group
            .tag
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(&config.version);
        format!("{}:{}", image, tag)
    }

    /// Role-specific runtime variables, with the group's `env` merged last
    pub fn environment(&self, config: &ClusterConfig) -> HashMap<String, String> {
        let group = self.node_group(config);
        let mut env = HashMap::new();
        env.insert("WAZUH_IMAGE".to_string(), self.image_ref(config));

        match self {
            Role::Manager => {
                env.insert(
                    "WAZUH_API_USERNAME".to_string(),
                    config.secrets.admin_user.clone(),
                );
                env.insert(
                    "WAZUH_API_PASSWORD".to_string(),
                    config.secrets.admin_password.clone(),
                );
                env.insert(
                    "WAZUH_ENROLLMENT_KEY".to_string(),
                    config.secrets.enrollment_key.clone(),
                );
                env.insert(
                    "WAZUH_API_JWT_SECRET".to_string(),
                    config.secrets.api_jwt_secret.clone(),
                );
                env.insert("WAZUH_CA_PEM".to_string(), config.secrets.ca_pem.clone());
            }
            Role::Indexer => {
                env.insert("WAZUH_INDEXER_CLUSTER".to_string(), config.name.clone());
            }
            Role::Dashboard => {
                env.insert(
                    "WAZUH_DASHBOARD_USER".to_string(),
                    config.secrets.admin_user.clone(),
                );
                env.insert(
                    "WAZUH_DASHBOARD_PASSWORD".to_string(),
                    config.secrets.admin_password.clone(),
                );
            }
            Role::Certs => {
                env.insert("WAZUH_CERTS_CLUSTER".to_string(), config.name.clone());
                env.insert("WAZUH_CA_PEM".to_string(), config.secrets.ca_pem.clone());
            }
        }

        for (key, value) in &group.env {
            env.insert(key.clone(), value.clone());
        }
        env
    }
}

/// Variables shared by every role
pub fn base_environment(config: &ClusterConfig, role: Role) -> HashMap<String, String> {
    HashMap::from([
        ("WAZUH_CLUSTER_NAME".to_string(), config.name.clone()),
        ("WAZUH_STACK_VERSION".to_string(), config.version.clone()),
        ("WAZUH_ROLE".to_string(), role.as_str().to_string()),
    ])
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
