//! Shared application state
//!
//! Holds a small fixed pool of unit controllers per role. Controllers are
//! selected round-robin; no session affinity is guaranteed. State is cheap
//! to clone and shared across handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::ConfigResolver;
use crate::store::MetaStore;
use crate::substrate::Substrate;
use crate::unit::{ControllerSettings, EventSink, Role, UnitController};

/// Fixed pool of controllers for one role
pub struct ControllerPool {
    controllers: Vec<Arc<UnitController>>,
    cursor: AtomicUsize,
}

impl ControllerPool {
    fn new(controllers: Vec<Arc<UnitController>>) -> Self {
        Self {
            controllers,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Pick the next controller; any-of selection, no affinity
    pub fn pick(&self) -> Arc<UnitController> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.controllers.len();
        self.controllers[index].clone()
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }
}

struct Inner {
    pools: HashMap<Role, ControllerPool>,
    resolver: Arc<ConfigResolver>,
    meta: Option<Arc<MetaStore>>,
    default_cluster: String,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

impl AppState {
    /// Build the per-role controller pools
    ///
    /// `substrate_for` supplies the execution substrate for each unit
    /// instance, so tests can substitute a scripted one.
    pub fn new(
        resolver: Arc<ConfigResolver>,
        sink: Option<Arc<dyn EventSink>>,
        meta: Option<Arc<MetaStore>>,
        default_cluster: impl Into<String>,
        settings: ControllerSettings,
        substrate_for: impl Fn(Role, usize) -> Arc<dyn Substrate>,
    ) -> Self {
        let mut pools = HashMap::new();
        for role in Role::ALL {
            let controllers = (0..role.pool_size())
                .map(|index| {
                    UnitController::new(
                        role,
                        resolver.clone(),
                        substrate_for(role, index),
                        sink.clone(),
                        settings.clone(),
                    )
                })
                .collect();
            pools.insert(role, ControllerPool::new(controllers));
        }

        Self {
            inner: Arc::new(Inner {
                pools,
                resolver,
                meta,
                default_cluster: default_cluster.into(),
            }),
        }
    }

    pub fn pool(&self, role: Role) -> &ControllerPool {
        &self.inner.pools[&role]
    }

    pub fn resolver(&self) -> &Arc<ConfigResolver> {
        &self.inner.resolver
    }

    pub fn meta(&self) -> Option<&Arc<MetaStore>> {
        self.inner.meta.as_ref()
    }

    pub fn default_cluster(&self) -> &str {
        &self.inner.default_cluster
    }
}
