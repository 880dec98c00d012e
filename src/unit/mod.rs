pub mod controller;
pub mod lifecycle;
pub mod readiness;
pub mod role;

pub use controller::{ControllerSettings, HandleError, UnitController, CLUSTER_HEADER};
pub use lifecycle::{EventSink, FileEventSink, LifecycleEventKind, LifecycleNotifier, SinkError};
pub use readiness::{
    ReadinessController, ReadinessError, ReadyContext, UnitReadinessState, UnitStatus,
};
pub use role::{base_environment, ReadinessProbe, Role, RoleSpec};
