//! Connection/vibration coordination and the public action surface

pub mod handle;
pub mod machine;
pub mod status;

pub use handle::{ControlError, ControllerHandle, ControllerSettings};
pub use machine::{ConnectionMachine, ConnectionState, Transition};
pub use status::{status_for, Status, StatusClass, StatusSnapshot};
