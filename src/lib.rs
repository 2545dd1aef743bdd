//! Sample-centring and motor-coordination engine for a diffractometer.
//!
//! The engine runs one centring session at a time (manual clicks, automatic image
//! analysis or a direct move to the beam), turns the picked pixels into motor targets,
//! drives the goniometer motors there concurrently and publishes every lifecycle
//! transition as an event.
//!
//! # Architecture
//!
//! ```text
//! Diffractometer (handle) --commands--> DiffractometerActor --spawns--> procedure task
//!        |                                   |      ^                        |
//!        |                                   |      +----AwaitClick/Finished-+
//!        v                                   v
//! MotorCoordinator <----------------- finalize move task
//!        |
//!        v
//!   Motor capability (hardware driver or mock)
//! ```
//!
//! - [`diffractometer`]: public handle and builder
//! - [`centring`]: methods, requests, status and the procedure variants
//! - [`motion`]: position maps, readiness tracking and the motor coordinator
//! - [`resolver`]: pixel-to-motor conversion and calibration
//! - [`publisher`]: lifecycle events
//! - [`hardware`]: capability traits and simulated devices
//! - [`config`]: figment-based configuration
//! - [`error`]: error taxonomy

mod actor;
pub mod centring;
pub mod config;
pub mod diffractometer;
pub mod error;
pub mod hardware;
mod messages;
pub mod motion;
pub mod publisher;
pub mod resolver;

pub use centring::{CentringMethod, CentringRequest, CentringState, CentringStatus, SampleInfo};
pub use config::DiffractometerConfig;
pub use diffractometer::{Diffractometer, DiffractometerBuilder};
pub use error::{AppResult, DiffractometerError};
pub use motion::{CentredPosition, MotorPositionMap};
pub use publisher::CentringEvent;
pub use resolver::{CalibrationState, ClickPointResolver, PixelPoint};
