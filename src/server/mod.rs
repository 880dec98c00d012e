pub mod dispatch;
pub mod handlers;
pub mod state;

pub use dispatch::{resolve_cluster, DispatchError, EnrollmentRequest};
pub use handlers::create_router;
pub use state::{AppState, ControllerPool};
