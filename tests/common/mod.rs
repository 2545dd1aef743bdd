//! Common test utilities for rust_diffractometer integration tests
//!
//! This module provides reusable test helpers for:
//! - Building a diffractometer on fast simulated hardware
//! - Waiting on lifecycle events and centring states with a bound
//! - Calibration presets matching the documented scenarios

#![allow(dead_code)] // Utilities may not all be used by every test file

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use rust_diffractometer::centring::CentringState;
use rust_diffractometer::config::{DiffractometerConfig, PixelPair};
use rust_diffractometer::hardware::mock::{MockBeamInfo, MockCamera, MockMotor};
use rust_diffractometer::hardware::{LoopFinder, Motor};
use rust_diffractometer::{CentringEvent, Diffractometer, DiffractometerBuilder, PixelPoint};

/// Upper bound for any single wait in these tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Speed that makes simulated moves effectively instant.
pub const FAST: f64 = 100_000.0;

/// Motors installed on the test rig.
pub const RIG_MOTORS: [&str; 5] = ["phi", "phiy", "phiz", "sampx", "sampy"];

/// Beam reference position used by the scenarios.
pub const BEAM: PixelPoint = PixelPoint::new(100.0, 50.0);

/// Configuration with a complete calibration: ppmm (2, 2), zoom centre = beam.
pub fn calibrated_config() -> DiffractometerConfig {
    DiffractometerConfig {
        pixels_per_mm: Some(PixelPair { x: 2.0, y: 2.0 }),
        zoom_centre: Some(PixelPair {
            x: BEAM.x,
            y: BEAM.y,
        }),
        clicks_required: 2,
        move_timeout_ms: 2_000,
        ready_poll_interval_ms: 2,
        ..Default::default()
    }
}

/// Same as [`calibrated_config`] but without a pixel scale.
pub fn uncalibrated_config() -> DiffractometerConfig {
    DiffractometerConfig {
        pixels_per_mm: None,
        ..calibrated_config()
    }
}

/// A diffractometer plus direct access to its simulated devices.
pub struct Rig {
    pub diffractometer: Diffractometer,
    pub motors: BTreeMap<String, Arc<MockMotor>>,
    pub beam: Arc<MockBeamInfo>,
}

impl Rig {
    /// Simulated motor by name.
    pub fn motor(&self, name: &str) -> Arc<MockMotor> {
        Arc::clone(&self.motors[name])
    }

    /// Current position of a simulated motor.
    pub async fn position(&self, name: &str) -> f64 {
        self.motors[name].position().await.unwrap()
    }
}

/// Build a rig with fast motors, a camera and a beam-info source at [`BEAM`].
pub async fn rig(config: DiffractometerConfig) -> Rig {
    rig_with_finder(config, None).await
}

/// Build a rig with an optional loop finder for automatic centring.
pub async fn rig_with_finder(
    config: DiffractometerConfig,
    finder: Option<Arc<dyn LoopFinder>>,
) -> Rig {
    build_rig(config, finder, &[]).await
}

/// Build a rig where the listed motors run at their own speed instead of [`FAST`].
pub async fn rig_with_speeds(config: DiffractometerConfig, speeds: &[(&str, f64)]) -> Rig {
    build_rig(config, None, speeds).await
}

async fn build_rig(
    config: DiffractometerConfig,
    finder: Option<Arc<dyn LoopFinder>>,
    speeds: &[(&str, f64)],
) -> Rig {
    let speed_of = |name: &str| {
        speeds
            .iter()
            .find(|(motor, _)| *motor == name)
            .map_or(FAST, |(_, speed)| *speed)
    };
    let motors: BTreeMap<String, Arc<MockMotor>> = RIG_MOTORS
        .iter()
        .map(|name| {
            (
                name.to_string(),
                Arc::new(MockMotor::with_speed(*name, speed_of(*name))),
            )
        })
        .collect();
    let beam = Arc::new(MockBeamInfo::new(BEAM));

    let mut builder = DiffractometerBuilder::new(config)
        .with_motors(motors.values().map(|m| Arc::clone(m) as Arc<dyn Motor>))
        .with_camera(Arc::new(MockCamera::new(200, 100)))
        .with_beam_info(beam.clone());
    if let Some(finder) = finder {
        builder = builder.with_loop_finder(finder);
    }
    let diffractometer = builder.build().await.unwrap();

    Rig {
        diffractometer,
        motors,
        beam,
    }
}

/// Next event, failing the test if none arrives in time.
pub async fn next_event(events: &mut broadcast::Receiver<CentringEvent>) -> CentringEvent {
    tokio::time::timeout(TEST_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Next event that is not a progress message.
pub async fn next_lifecycle_event(
    events: &mut broadcast::Receiver<CentringEvent>,
) -> CentringEvent {
    loop {
        match next_event(events).await {
            CentringEvent::ProgressMessage(_) => continue,
            event => return event,
        }
    }
}

/// Skip events until a terminal one arrives.
pub async fn terminal_event(events: &mut broadcast::Receiver<CentringEvent>) -> CentringEvent {
    loop {
        let event = next_event(events).await;
        if event.is_terminal() {
            return event;
        }
    }
}

/// Poll until the engine reaches `state`.
pub async fn wait_for_state(diffractometer: &Diffractometer, state: CentringState) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while diffractometer.centring_state().await.unwrap() != state {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for state {:?}", state));
}

/// Wait for each click request and answer it.
pub async fn click_through(diffractometer: &Diffractometer, clicks: &[PixelPoint]) {
    for click in clicks {
        wait_for_state(diffractometer, CentringState::AwaitingUserInput).await;
        assert!(diffractometer.image_clicked(click.x, click.y).await.unwrap());
    }
}
