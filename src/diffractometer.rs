//! Public diffractometer handle.
//!
//! [`Diffractometer`] is a cheap, cloneable front-end: centring operations are sent to
//! the centring actor as commands, motor operations go straight to the shared
//! [`MotorCoordinator`]. Build one with [`DiffractometerBuilder`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use rust_diffractometer::centring::CentringRequest;
//! use rust_diffractometer::config::DiffractometerConfig;
//! use rust_diffractometer::diffractometer::DiffractometerBuilder;
//! use rust_diffractometer::hardware::mock::{MockCamera, MockMotor};
//!
//! # async fn demo() -> rust_diffractometer::error::AppResult<()> {
//! let diffractometer = DiffractometerBuilder::new(DiffractometerConfig::default())
//!     .with_motor(Arc::new(MockMotor::new("phi")))
//!     .with_motor(Arc::new(MockMotor::new("phiy")))
//!     .with_camera(Arc::new(MockCamera::default()))
//!     .build()
//!     .await?;
//!
//! diffractometer.set_pixels_per_mm(500.0, 500.0).await?;
//! let status = diffractometer
//!     .start_centring(CentringRequest::MoveToBeam { point: None, omega: None }, None, true)
//!     .await?;
//! assert!(status.valid);
//! # Ok(())
//! # }
//! ```

use log::{debug, info, warn};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::actor::DiffractometerActor;
use crate::centring::{
    CentringMethod, CentringRequest, CentringState, CentringStatus, SampleInfo,
};
use crate::config::{DiffractometerConfig, GridDirection, HeadType};
use crate::error::{AppResult, DiffractometerError};
use crate::hardware::{BeamInfo, Camera, LoopFinder, Motor};
use crate::messages::DiffractometerCommand;
use crate::motion::{MotorCoordinator, MotorPositionMap, Readiness};
use crate::publisher::{CentringEvent, StatusPublisher};
use crate::resolver::{CalibrationState, ClickPointResolver, PixelPoint, ReferenceResolver};

/// Handle to a running diffractometer engine.
#[derive(Clone)]
pub struct Diffractometer {
    command_tx: mpsc::Sender<DiffractometerCommand>,
    coordinator: Arc<MotorCoordinator>,
    resolver: Arc<dyn ClickPointResolver>,
    publisher: StatusPublisher,
    config: Arc<DiffractometerConfig>,
}

impl Diffractometer {
    async fn request<T>(
        &self,
        (command, response): (DiffractometerCommand, oneshot::Receiver<T>),
    ) -> AppResult<T> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| DiffractometerError::ActorUnavailable)?;
        response
            .await
            .map_err(|_| DiffractometerError::ActorUnavailable)
    }

    /// Subscribe to centring lifecycle events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CentringEvent> {
        self.publisher.subscribe()
    }

    /// Start a centring session.
    ///
    /// Fails with [`DiffractometerError::AlreadyCentring`] if a session is active and
    /// with [`DiffractometerError::UnknownCentringMethod`] if the variant is not
    /// registered. With `wait` the call returns only once the session has ended and
    /// yields its terminal status; there is no time bound on that wait.
    pub async fn start_centring(
        &self,
        request: CentringRequest,
        sample_info: Option<SampleInfo>,
        wait: bool,
    ) -> AppResult<CentringStatus> {
        let started = self
            .request(DiffractometerCommand::start_centring(request, sample_info))
            .await??;
        if !wait {
            return Ok(started.status);
        }
        started
            .completion
            .await
            .map_err(|_| DiffractometerError::ActorUnavailable)
    }

    /// Start a centring session by its display name (e.g. "Manual 3-click").
    pub async fn start_centring_by_name(
        &self,
        name: &str,
        sample_info: Option<SampleInfo>,
        wait: bool,
    ) -> AppResult<CentringStatus> {
        let method = match name.parse::<CentringMethod>() {
            Ok(method) => method,
            Err(err) => {
                warn!("Diffractometer: unknown centring method ({})", name);
                self.publisher
                    .centring_failed(None, &CentringStatus::invalid());
                return Err(err);
            }
        };
        self.start_centring(method.into(), sample_info, wait).await
    }

    /// Cancel the running centring. With `reject` the last result is also discarded.
    ///
    /// Motors already moving are not stopped.
    pub async fn cancel_centring(&self, reject: bool) -> AppResult<()> {
        self.request(DiffractometerCommand::cancel_centring(reject))
            .await
    }

    /// Deliver a click on the sample image.
    ///
    /// Returns `false` (and changes nothing) when no procedure is waiting for input.
    pub async fn image_clicked(&self, x: f64, y: f64) -> AppResult<bool> {
        self.request(DiffractometerCommand::image_clicked(PixelPoint::new(x, y)))
            .await
    }

    /// Accept the last centring result.
    pub async fn accept_centring(&self) -> AppResult<()> {
        self.request(DiffractometerCommand::accept_centring()).await
    }

    /// Reject the last centring result, cancelling any running procedure.
    pub async fn reject_centring(&self) -> AppResult<()> {
        self.request(DiffractometerCommand::reject_centring()).await
    }

    /// Copy of the current (or last) centring status.
    pub async fn centring_status(&self) -> AppResult<CentringStatus> {
        self.request(DiffractometerCommand::get_centring_status())
            .await
    }

    /// Where the centring state machine currently is.
    pub async fn centring_state(&self) -> AppResult<CentringState> {
        self.request(DiffractometerCommand::get_centring_state())
            .await
    }

    /// Method of the active session, if any.
    pub async fn current_centring_method(&self) -> AppResult<Option<CentringMethod>> {
        self.request(DiffractometerCommand::get_current_method())
            .await
    }

    /// Registered centring variants.
    pub fn available_centring_methods(&self) -> &[CentringMethod] {
        &self.config.centring_methods
    }

    /// True when no move or centring procedure is outstanding.
    pub async fn is_ready(&self) -> bool {
        self.coordinator.is_ready().await
    }

    /// Wait until the device is ready, failing with `DeviceTimeout` after `timeout`.
    pub async fn wait_device_ready(&self, timeout: Duration) -> AppResult<()> {
        self.coordinator.wait_device_ready(timeout).await
    }

    /// Move several motors concurrently and wait for all of them.
    pub async fn move_motors(&self, positions: &MotorPositionMap) -> AppResult<()> {
        self.coordinator.move_motors(positions).await
    }

    /// Move several motors on a background task.
    ///
    /// Without `wait` failures are only logged; with it they are returned.
    pub async fn move_to_motors_positions(
        &self,
        positions: MotorPositionMap,
        wait: bool,
    ) -> AppResult<()> {
        let handle = self.coordinator.move_to_motors_positions(positions);
        if wait {
            handle.wait().await
        } else {
            Ok(())
        }
    }

    /// Centre the pixel (x, y) outside of any centring session.
    pub async fn move_to_beam(&self, x: f64, y: f64, omega: Option<f64>) -> AppResult<()> {
        let calibration = self.calibration().await?;
        let current = self.coordinator.positions().await;
        let positions =
            self.resolver
                .resolve_from_pixel(PixelPoint::new(x, y), omega, &calibration, &current)?;
        debug!("Move to beam ({:.1}, {:.1}): {:?}", x, y, positions);
        self.coordinator.move_motors(&positions).await
    }

    /// Current position of every installed motor plus the beam pseudo-motors.
    pub async fn positions(&self) -> AppResult<BTreeMap<String, f64>> {
        let mut positions = self.coordinator.positions().await;
        let calibration = self.calibration().await?;
        if let Err(err) = calibration.insert_beam_offsets(&mut positions) {
            debug!("Beam pseudo-motors unavailable: {}", err);
        }
        Ok(positions)
    }

    /// Current rotation angle.
    pub async fn omega_position(&self) -> AppResult<f64> {
        let phi = self.coordinator.motor("phi").ok_or_else(|| {
            DiffractometerError::Configuration("rotation motor 'phi' is not installed".to_string())
        })?;
        phi.position()
            .await
            .map_err(|err| DiffractometerError::motor("phi", &err))
    }

    /// Copy of the pixel-to-physical calibration.
    pub async fn calibration(&self) -> AppResult<CalibrationState> {
        self.request(DiffractometerCommand::get_calibration()).await
    }

    /// Update the pixel-per-millimetre scale, e.g. after a zoom change.
    pub async fn set_pixels_per_mm(&self, x: f64, y: f64) -> AppResult<()> {
        if !(x > 0.0 && y > 0.0) {
            return Err(DiffractometerError::Configuration(format!(
                "pixels_per_mm must be positive, got ({}, {})",
                x, y
            )));
        }
        self.request(DiffractometerCommand::set_pixels_per_mm(x, y))
            .await
    }

    /// Engine configuration.
    pub fn config(&self) -> &DiffractometerConfig {
        &self.config
    }

    /// True when a plate holder is mounted.
    pub fn in_plate_mode(&self) -> bool {
        self.config.in_plate_mode()
    }

    /// Mounted sample head.
    pub fn head_type(&self) -> HeadType {
        self.config.head_type
    }

    /// Named diffractometer phases.
    pub fn phase_list(&self) -> &[String] {
        &self.config.phase_list
    }

    /// Raster grid orientation.
    pub fn grid_direction(&self) -> GridDirection {
        self.config.grid_direction
    }

    /// Whether the rotation axis turns in the negative direction.
    pub fn is_reversing_rotation(&self) -> bool {
        self.config.reversing_rotation
    }

    /// Stop the engine. An active session is failed and its procedure cancelled.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.request(DiffractometerCommand::shutdown()).await
    }
}

/// Assembles a [`Diffractometer`] from configuration and collaborators.
pub struct DiffractometerBuilder {
    config: DiffractometerConfig,
    motors: Vec<Arc<dyn Motor>>,
    camera: Option<Arc<dyn Camera>>,
    beam_info: Option<Arc<dyn BeamInfo>>,
    loop_finder: Option<Arc<dyn LoopFinder>>,
    resolver: Option<Arc<dyn ClickPointResolver>>,
}

impl DiffractometerBuilder {
    /// Start from a configuration.
    pub fn new(config: DiffractometerConfig) -> Self {
        Self {
            config,
            motors: Vec::new(),
            camera: None,
            beam_info: None,
            loop_finder: None,
            resolver: None,
        }
    }

    /// Install one motor.
    pub fn with_motor(mut self, motor: Arc<dyn Motor>) -> Self {
        self.motors.push(motor);
        self
    }

    /// Install several motors.
    pub fn with_motors(mut self, motors: impl IntoIterator<Item = Arc<dyn Motor>>) -> Self {
        self.motors.extend(motors);
        self
    }

    /// Sample camera, used to default the beam position and zoom centre.
    pub fn with_camera(mut self, camera: Arc<dyn Camera>) -> Self {
        self.camera = Some(camera);
        self
    }

    /// Beam position source.
    pub fn with_beam_info(mut self, beam_info: Arc<dyn BeamInfo>) -> Self {
        self.beam_info = Some(beam_info);
        self
    }

    /// Image analysis for automatic centring.
    pub fn with_loop_finder(mut self, loop_finder: Arc<dyn LoopFinder>) -> Self {
        self.loop_finder = Some(loop_finder);
        self
    }

    /// Replace the default [`ReferenceResolver`].
    pub fn with_resolver(mut self, resolver: Arc<dyn ClickPointResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    async fn initial_calibration(&self) -> AppResult<CalibrationState> {
        let frame_centre = match &self.camera {
            Some(camera) => {
                let (width, height) = camera.frame_size().await.map_err(|err| {
                    DiffractometerError::CalibrationUnavailable(format!(
                        "could not read camera frame size: {:#}",
                        err
                    ))
                })?;
                Some(PixelPoint::new(f64::from(width) / 2.0, f64::from(height) / 2.0))
            }
            None => None,
        };

        let beam_position = match &self.beam_info {
            Some(beam_info) => Some(beam_info.beam_position()),
            None => frame_centre,
        };
        let zoom_centre = self
            .config
            .zoom_centre
            .map(|pair| PixelPoint::new(pair.x, pair.y))
            .or(frame_centre);

        Ok(CalibrationState {
            beam_position,
            pixels_per_mm: self.config.pixels_per_mm.map(|pair| (pair.x, pair.y)),
            zoom_centre,
        })
    }

    /// Validate, spawn the actor and return the handle.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn build(self) -> AppResult<Diffractometer> {
        self.config.validate()?;

        let mut seen = HashSet::new();
        for motor in &self.motors {
            let name = motor.name();
            if !self.config.is_configured_motor(name) {
                return Err(DiffractometerError::Configuration(format!(
                    "motor '{}' is not in used_motors",
                    name
                )));
            }
            if !seen.insert(name.to_string()) {
                return Err(DiffractometerError::Configuration(format!(
                    "motor '{}' is installed twice",
                    name
                )));
            }
        }

        if !seen.contains("phi") {
            return Err(DiffractometerError::Configuration(
                "rotation motor 'phi' is not installed".to_string(),
            ));
        }

        let calibration = self.initial_calibration().await?;
        let config = Arc::new(self.config);
        let publisher = StatusPublisher::new(config.event_channel_capacity);
        let coordinator = Arc::new(MotorCoordinator::new(
            self.motors,
            Readiness::new(),
            publisher.clone(),
            config.move_timeout(),
            config.ready_poll_interval(),
        ));
        let resolver = self.resolver.unwrap_or_else(|| {
            Arc::new(ReferenceResolver::new().with_reversing_rotation(config.reversing_rotation))
        });

        let (command_tx, command_rx) = mpsc::channel(config.command_channel_capacity);
        let actor = DiffractometerActor::new(
            Arc::clone(&config),
            Arc::clone(&coordinator),
            Arc::clone(&resolver),
            self.loop_finder,
            publisher.clone(),
            calibration,
            command_tx.downgrade(),
        );
        tokio::spawn(actor.run(command_rx));

        if let Some(beam_info) = self.beam_info {
            spawn_beam_watcher(beam_info.as_ref(), command_tx.downgrade());
        }

        info!(
            "Diffractometer ready: {} motors, methods {:?}, head {:?}",
            coordinator.motor_names().count(),
            config.centring_methods,
            config.head_type
        );

        Ok(Diffractometer {
            command_tx,
            coordinator,
            resolver,
            publisher,
            config,
        })
    }
}

/// Forward beam position changes to the actor until either side goes away.
fn spawn_beam_watcher(beam_info: &dyn BeamInfo, commands: mpsc::WeakSender<DiffractometerCommand>) {
    let mut changes = beam_info.subscribe();
    tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            let point = *changes.borrow_and_update();
            let Some(tx) = commands.upgrade() else {
                break;
            };
            if tx
                .send(DiffractometerCommand::BeamPositionChanged { point })
                .await
                .is_err()
            {
                break;
            }
        }
        debug!("Beam position watcher stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockCamera, MockMotor};

    fn motors() -> Vec<Arc<dyn Motor>> {
        vec![
            Arc::new(MockMotor::with_speed("phi", 10_000.0)),
            Arc::new(MockMotor::with_speed("phiy", 100.0)),
        ]
    }

    #[tokio::test]
    async fn test_camera_defaults_calibration_to_frame_centre() {
        let diffractometer = DiffractometerBuilder::new(DiffractometerConfig::default())
            .with_motors(motors())
            .with_camera(Arc::new(MockCamera::new(800, 600)))
            .build()
            .await
            .unwrap();

        let calibration = diffractometer.calibration().await.unwrap();
        assert_eq!(calibration.beam_position, Some(PixelPoint::new(400.0, 300.0)));
        assert_eq!(calibration.zoom_centre, Some(PixelPoint::new(400.0, 300.0)));
        assert_eq!(calibration.pixels_per_mm, None);
    }

    #[tokio::test]
    async fn test_rejects_unconfigured_motor() {
        let result = DiffractometerBuilder::new(DiffractometerConfig::default())
            .with_motor(Arc::new(MockMotor::new("goniometer_z")))
            .build()
            .await;
        assert!(matches!(result, Err(DiffractometerError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_rejects_duplicate_motor() {
        let result = DiffractometerBuilder::new(DiffractometerConfig::default())
            .with_motor(Arc::new(MockMotor::new("phi")))
            .with_motor(Arc::new(MockMotor::new("phi")))
            .build()
            .await;
        assert!(matches!(result, Err(DiffractometerError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_rejects_missing_rotation_motor() {
        let result = DiffractometerBuilder::new(DiffractometerConfig::default())
            .with_motor(Arc::new(MockMotor::new("phiy")))
            .build()
            .await;
        assert!(matches!(result, Err(DiffractometerError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_set_pixels_per_mm() {
        let diffractometer = DiffractometerBuilder::new(DiffractometerConfig::default())
            .with_motors(motors())
            .build()
            .await
            .unwrap();

        assert!(diffractometer.set_pixels_per_mm(0.0, 1.0).await.is_err());
        diffractometer.set_pixels_per_mm(250.0, 260.0).await.unwrap();
        assert_eq!(
            diffractometer.calibration().await.unwrap().pixels_per_mm,
            Some((250.0, 260.0))
        );
    }

    #[tokio::test]
    async fn test_queries_after_shutdown_fail() {
        let diffractometer = DiffractometerBuilder::new(DiffractometerConfig::default())
            .with_motors(motors())
            .build()
            .await
            .unwrap();

        diffractometer.shutdown().await.unwrap();
        assert_eq!(
            diffractometer.centring_status().await,
            Err(DiffractometerError::ActorUnavailable)
        );
    }

    #[tokio::test]
    async fn test_omega_position() {
        let diffractometer = DiffractometerBuilder::new(DiffractometerConfig::default())
            .with_motor(Arc::new(MockMotor::new("phi").at(42.0)))
            .build()
            .await
            .unwrap();
        assert_eq!(diffractometer.omega_position().await.unwrap(), 42.0);
    }
}
