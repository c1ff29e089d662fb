pub mod breaker;
pub mod config;
pub mod control_plane;
pub mod coordinator;
pub mod execution;
pub mod governor;
pub mod limiter;
pub mod models;
pub mod supervisor;

pub use config::ControlPlaneConfig;
pub use control_plane::{Admission, ControlPlane, ControlPlaneStats, SubmitRequest};
pub use models::{ControlError, ControlResult, ErrorKind};
