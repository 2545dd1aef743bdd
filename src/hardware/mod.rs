//! Hardware capability traits and simulated devices.
//!
//! The engine never talks to a driver directly. It consumes the capabilities in
//! [`capabilities`]; physical drivers live outside this crate and implement them.
//! [`mock`] provides simulated devices for tests and for the demo binary.

pub mod capabilities;
pub mod mock;

pub use capabilities::{BeamInfo, Camera, LoopFinder, Motor};
