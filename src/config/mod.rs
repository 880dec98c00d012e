pub mod cluster;
pub mod defaults;
pub mod resolver;
pub mod store;

pub use cluster::{
    ClusterConfig, ClusterSecrets, FeatureFlags, NodeGroupSpec, NodeGroups, ResourceHints,
    DEFAULT_STACK_VERSION,
};
pub use defaults::builtin_cluster;
pub use resolver::{ConfigCache, ConfigResolver};
pub use store::{ConfigStore, FileConfigStore, StoreError};

use thiserror::Error;

/// Errors from configuration resolution
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cluster configuration '{0}' was not found")]
    NotFound(String),

    #[error("Invalid cluster configuration: {0}")]
    Invalid(String),

    #[error("Configuration store error: {0}")]
    Store(#[from] StoreError),
}
