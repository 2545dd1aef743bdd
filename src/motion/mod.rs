//! Motor coordination.
//!
//! - [`position`]: motor position maps and centred-position values
//! - [`readiness`]: the derived "device ready" state and its polling wait
//! - [`coordinator`]: concurrent moves across the installed motor set

pub mod coordinator;
pub mod position;
pub mod readiness;

pub use coordinator::{MotorCoordinator, MoveHandle};
pub use position::{point_between, CentredPosition, MotorKey, MotorPositionMap};
pub use readiness::{Readiness, ReadinessState};
