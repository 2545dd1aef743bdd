//! Centring session status.
//!
//! [`CentringStatus`] is a value type: every transition builds a new status from the
//! previous one instead of editing a shared record. Readers always receive their own
//! copy, so holding on to a snapshot never exposes later changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::centring::CentringMethod;

/// Where the orchestrator is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CentringState {
    /// No session.
    #[default]
    Idle,
    /// A procedure task is running.
    Running,
    /// The procedure is suspended on a user click.
    AwaitingUserInput,
    /// The result is resolved and motors are moving to it.
    Finalizing,
}

/// Status of the current or last centring session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CentringStatus {
    /// True when `motors` holds a usable centred position.
    pub valid: bool,
    /// True once the result was accepted.
    pub accepted: bool,
    /// Variant that produced the result.
    pub method: Option<CentringMethod>,
    /// When the session started.
    pub start_time: Option<DateTime<Utc>>,
    /// When the session finished.
    pub end_time: Option<DateTime<Utc>>,
    /// Centred position by motor name, including the beam pseudo-motors.
    pub motors: Option<BTreeMap<String, f64>>,
    /// Set when the result was produced without rotation-range checks.
    pub angle_limit: Option<bool>,
}

impl CentringStatus {
    /// Status with no usable result.
    pub fn invalid() -> Self {
        Self::default()
    }

    /// Status of a session that has just started.
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            start_time: Some(at),
            ..Self::default()
        }
    }

    /// Attach the resolved centred position.
    pub fn with_motors(self, motors: BTreeMap<String, f64>) -> Self {
        Self {
            motors: Some(motors),
            ..self
        }
    }

    /// Mark the session as successfully finished.
    pub fn succeeded(self, method: CentringMethod, at: DateTime<Utc>) -> Self {
        Self {
            valid: true,
            method: Some(method),
            end_time: Some(at),
            angle_limit: if method == CentringMethod::MoveToBeam {
                Some(true)
            } else {
                self.angle_limit
            },
            ..self
        }
    }

    /// Mark the result as accepted.
    pub fn accepted(self) -> Self {
        Self {
            valid: true,
            accepted: true,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_build_new_values() {
        let t0 = Utc::now();
        let started = CentringStatus::started(t0);
        assert!(!started.valid);
        assert_eq!(started.start_time, Some(t0));

        let motors: BTreeMap<String, f64> = [("phi".to_string(), 12.0)].into_iter().collect();
        let resolved = started.clone().with_motors(motors.clone());
        let done = resolved.clone().succeeded(CentringMethod::Manual, t0);

        // Earlier values are untouched
        assert!(started.motors.is_none());
        assert!(!resolved.valid);

        assert!(done.valid);
        assert!(!done.accepted);
        assert_eq!(done.motors, Some(motors));
        assert_eq!(done.method, Some(CentringMethod::Manual));
        assert_eq!(done.angle_limit, None);
    }

    #[test]
    fn test_move_to_beam_sets_angle_limit() {
        let done = CentringStatus::started(Utc::now()).succeeded(CentringMethod::MoveToBeam, Utc::now());
        assert_eq!(done.angle_limit, Some(true));
        assert!(done.accepted().accepted);
    }

    #[test]
    fn test_serializes_to_json() {
        let status = CentringStatus::invalid();
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["valid"], serde_json::json!(false));
    }
}
