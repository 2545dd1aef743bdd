//! Actor-based centring session management
//!
//! This module implements the actor that owns the centring session and the
//! calibration state. All mutations happen in a single async task that processes
//! commands via message-passing; procedure and move tasks report back through the
//! same channel. Because the check for an active session and the creation of a new
//! one happen inside one command handler, "only one centring at a time" holds on a
//! multi-threaded runtime without any lock.
//!
//! # State machine
//!
//! ```text
//! Idle -> Running <-> AwaitingUserInput
//!            |
//!            v
//!        Finalizing -> Idle
//! ```
//!
//! Every path back to `Idle` publishes exactly one of `Successful`/`Failed`, releases
//! the readiness flag and resolves any `wait` callers.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::centring::procedure::{
    AutomaticCentring, ManualCentring, MoveToBeam, ProcedureContext, SpawnedProcedure,
};
use crate::centring::{
    CentringMethod, CentringRequest, CentringState, CentringStatus, SampleInfo,
};
use crate::config::DiffractometerConfig;
use crate::error::{AppResult, DiffractometerError};
use crate::hardware::LoopFinder;
use crate::messages::{DiffractometerCommand, StartedCentring};
use crate::motion::{MotorCoordinator, MotorPositionMap};
use crate::publisher::StatusPublisher;
use crate::resolver::{CalibrationState, ClickPointResolver, PixelPoint};

/// The single active centring attempt.
struct CentringSession {
    id: Uuid,
    method: CentringMethod,
    state: CentringState,
    started_at: DateTime<Utc>,
    sample_info: Option<SampleInfo>,
    cancel: CancellationToken,
    /// Procedure task while running, supervising finalize task while finalizing
    abort: Option<AbortHandle>,
    pending_click: Option<oneshot::Sender<PixelPoint>>,
    waiters: Vec<oneshot::Sender<CentringStatus>>,
}

impl CentringSession {
    /// Stop whatever task the session is running. Motors already moving keep going.
    fn tear_down(&mut self) {
        self.cancel.cancel();
        if let Some(abort) = self.abort.take() {
            abort.abort();
        }
        self.pending_click = None;
    }
}

/// Actor that owns the centring session and calibration
pub struct DiffractometerActor {
    config: Arc<DiffractometerConfig>,
    coordinator: Arc<MotorCoordinator>,
    resolver: Arc<dyn ClickPointResolver>,
    loop_finder: Option<Arc<dyn LoopFinder>>,
    publisher: StatusPublisher,
    calibration: CalibrationState,
    status: CentringStatus,
    session: Option<CentringSession>,
    self_tx: mpsc::WeakSender<DiffractometerCommand>,
}

impl DiffractometerActor {
    /// Creates a new DiffractometerActor
    pub(crate) fn new(
        config: Arc<DiffractometerConfig>,
        coordinator: Arc<MotorCoordinator>,
        resolver: Arc<dyn ClickPointResolver>,
        loop_finder: Option<Arc<dyn LoopFinder>>,
        publisher: StatusPublisher,
        calibration: CalibrationState,
        self_tx: mpsc::WeakSender<DiffractometerCommand>,
    ) -> Self {
        Self {
            config,
            coordinator,
            resolver,
            loop_finder,
            publisher,
            calibration,
            status: CentringStatus::invalid(),
            session: None,
            self_tx,
        }
    }

    /// Runs the actor event loop, processing commands until shutdown
    pub(crate) async fn run(mut self, mut command_rx: mpsc::Receiver<DiffractometerCommand>) {
        info!("DiffractometerActor started");

        while let Some(command) = command_rx.recv().await {
            match command {
                DiffractometerCommand::StartCentring {
                    request,
                    sample_info,
                    response,
                } => {
                    let result = self.start_centring(request, sample_info).await;
                    let _ = response.send(result);
                }

                DiffractometerCommand::CancelCentring { reject, response } => {
                    self.cancel_centring(reject);
                    let _ = response.send(());
                }

                DiffractometerCommand::ImageClicked { point, response } => {
                    let delivered = self.image_clicked(point);
                    let _ = response.send(delivered);
                }

                DiffractometerCommand::AcceptCentring { response } => {
                    self.accept_centring();
                    let _ = response.send(());
                }

                DiffractometerCommand::RejectCentring { response } => {
                    self.reject_centring();
                    let _ = response.send(());
                }

                DiffractometerCommand::GetCentringStatus { response } => {
                    let _ = response.send(self.status.clone());
                }

                DiffractometerCommand::GetCentringState { response } => {
                    let state = self
                        .session
                        .as_ref()
                        .map_or(CentringState::Idle, |session| session.state);
                    let _ = response.send(state);
                }

                DiffractometerCommand::GetCurrentMethod { response } => {
                    let _ = response.send(self.session.as_ref().map(|session| session.method));
                }

                DiffractometerCommand::GetCalibration { response } => {
                    let _ = response.send(self.calibration);
                }

                DiffractometerCommand::SetPixelsPerMm { x, y, response } => {
                    info!("Pixels per mm set to ({:.3}, {:.3})", x, y);
                    self.calibration.pixels_per_mm = Some((x, y));
                    let _ = response.send(());
                }

                DiffractometerCommand::BeamPositionChanged { point } => {
                    debug!("Beam position changed to ({:.1}, {:.1})", point.x, point.y);
                    self.calibration.beam_position = Some(point);
                }

                DiffractometerCommand::AwaitClick {
                    session_id,
                    responder,
                } => {
                    self.await_click(session_id, responder);
                }

                DiffractometerCommand::ProcedureFinished { session_id, result } => {
                    self.procedure_finished(session_id, result).await;
                }

                DiffractometerCommand::FinalizeFinished { session_id, result } => {
                    self.finalize_finished(session_id, result);
                }

                DiffractometerCommand::Shutdown { response } => {
                    info!("Shutdown command received");
                    if self.session.is_some() {
                        self.fail_session();
                    }
                    let _ = response.send(());
                    break; // Exit event loop
                }
            }
        }

        info!("DiffractometerActor shutting down");
    }

    fn active_session(&mut self, id: Uuid) -> Option<&mut CentringSession> {
        self.session.as_mut().filter(|session| session.id == id)
    }

    /// Starts a centring session
    async fn start_centring(
        &mut self,
        request: CentringRequest,
        sample_info: Option<SampleInfo>,
    ) -> AppResult<StartedCentring> {
        let method = request.method();

        if let Some(session) = &self.session {
            error!(
                "Diffractometer: already in centring method {}",
                session.method
            );
            return Err(DiffractometerError::AlreadyCentring(
                session.method.to_string(),
            ));
        }

        if !self.config.centring_methods.contains(&method) {
            error!("Diffractometer: unknown centring method ({})", method);
            self.publisher
                .centring_failed(None, &CentringStatus::invalid());
            return Err(DiffractometerError::UnknownCentringMethod(
                method.to_string(),
            ));
        }

        let now = Utc::now();
        let (completion_tx, completion_rx) = oneshot::channel();
        self.status = CentringStatus::started(now);
        self.session = Some(CentringSession {
            id: Uuid::new_v4(),
            method,
            state: CentringState::Running,
            started_at: now,
            sample_info,
            cancel: CancellationToken::new(),
            abort: None,
            pending_click: None,
            waiters: vec![completion_tx],
        });
        self.publisher.centring_started(method);
        if let Some(session) = &self.session {
            info!(
                "Centring {} started for sample {:?}",
                method,
                session.sample_info.as_ref().and_then(|info| info.name.as_deref())
            );
        }

        match request {
            CentringRequest::Manual => {
                self.publisher
                    .progress_message("Manual 3 click centring...");
                self.spawn_procedure(SpawnedProcedure::Manual(ManualCentring));
            }
            CentringRequest::Automatic { loop_only } => {
                self.publisher.progress_message("Automatic centring...");
                self.spawn_procedure(SpawnedProcedure::Automatic(AutomaticCentring {
                    loop_only,
                }));
            }
            CentringRequest::MoveToBeam { point, omega } => {
                self.publisher.progress_message("Move to beam...");
                let current = self.coordinator.positions().await;
                let result = MoveToBeam { point, omega }.resolve(
                    self.resolver.as_ref(),
                    &self.calibration,
                    &current,
                );
                if let Err(err) = &result {
                    error!("Diffractometer: could not complete 2D centring: {}", err);
                }
                self.complete(result, current);
            }
        }

        Ok(StartedCentring {
            status: self.status.clone(),
            completion: completion_rx,
        })
    }

    fn spawn_procedure(&mut self, procedure: SpawnedProcedure) {
        let Some(tx) = self.self_tx.upgrade() else {
            warn!("Actor channel closed, not starting procedure");
            self.fail_session();
            return;
        };
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let ctx = ProcedureContext {
            session_id: session.id,
            calibration: self.calibration,
            resolver: Arc::clone(&self.resolver),
            coordinator: Arc::clone(&self.coordinator),
            commands: tx.clone(),
            cancel: session.cancel.clone(),
            points_required: self.config.clicks_required,
            rotation_step: self.config.click_rotation_step,
            click_timeout: self.config.user_click_timeout(),
            loop_finder: self.loop_finder.clone(),
            attempts_per_point: self.config.automatic_attempts,
        };

        self.coordinator.readiness().set_centring_running(true);
        let session_id = session.id;
        let procedure_task: JoinHandle<AppResult<MotorPositionMap>> =
            tokio::spawn(procedure.run(ctx));
        session.abort = Some(procedure_task.abort_handle());

        // Supervisor: reports however the procedure ended, including abort and panic
        tokio::spawn(async move {
            let result = match procedure_task.await {
                Ok(result) => result,
                Err(err) if err.is_cancelled() => Err(DiffractometerError::Cancelled),
                Err(err) => Err(DiffractometerError::Procedure(format!(
                    "procedure task panicked: {}",
                    err
                ))),
            };
            let _ = tx
                .send(DiffractometerCommand::ProcedureFinished { session_id, result })
                .await;
        });
    }

    fn await_click(&mut self, session_id: Uuid, responder: oneshot::Sender<PixelPoint>) {
        match self.active_session(session_id) {
            Some(session) => {
                session.pending_click = Some(responder);
                session.state = CentringState::AwaitingUserInput;
            }
            None => debug!("Click request from finished session {} dropped", session_id),
        }
    }

    /// Deliver a click to the waiting procedure. Returns false if nothing was waiting.
    fn image_clicked(&mut self, point: PixelPoint) -> bool {
        let Some(session) = self.session.as_mut() else {
            debug!("Click at ({:.1}, {:.1}) ignored: no centring", point.x, point.y);
            return false;
        };
        let Some(responder) = session.pending_click.take() else {
            debug!("Click at ({:.1}, {:.1}) ignored: nothing awaiting input", point.x, point.y);
            return false;
        };
        session.state = CentringState::Running;
        responder.send(point).is_ok()
    }

    async fn procedure_finished(&mut self, session_id: Uuid, result: AppResult<MotorPositionMap>) {
        if self.active_session(session_id).is_none() {
            debug!("Result of finished session {} ignored", session_id);
            return;
        }
        self.coordinator.readiness().set_centring_running(false);

        match result {
            Ok(positions) => {
                let current = self.coordinator.positions().await;
                self.complete(Ok(positions), current);
            }
            Err(err) => {
                error!("Could not complete centring: {}", err);
                self.fail_session();
            }
        }
    }

    /// Name the raw result: configured motors missing from it keep their current
    /// position, and the beam pseudo-motors are always added.
    fn named_positions(
        &self,
        positions: &MotorPositionMap,
        current: &BTreeMap<String, f64>,
    ) -> AppResult<BTreeMap<String, f64>> {
        let mut named: BTreeMap<String, f64> = self
            .config
            .used_motors
            .iter()
            .filter_map(|name| current.get(name).map(|value| (name.clone(), *value)))
            .collect();
        named.extend(positions.to_named());
        self.calibration.insert_beam_offsets(&mut named)?;
        Ok(named)
    }

    /// Finalize a resolved (or failed) procedure result.
    fn complete(
        &mut self,
        result: AppResult<MotorPositionMap>,
        current: BTreeMap<String, f64>,
    ) {
        let positions = match result {
            Ok(positions) => positions,
            Err(_) => {
                self.fail_session();
                return;
            }
        };
        let named = match self.named_positions(&positions, &current) {
            Ok(named) => named,
            Err(err) => {
                error!("Could not name centred position: {}", err);
                self.fail_session();
                return;
            }
        };

        let Some(tx) = self.self_tx.upgrade() else {
            self.fail_session();
            return;
        };
        let Some(session) = self.session.as_mut() else {
            return;
        };

        self.status = self.status.clone().with_motors(named);
        session.state = CentringState::Finalizing;
        self.publisher
            .progress_message("Moving sample to centred position...");
        self.publisher.centring_moving();

        let session_id = session.id;
        let half_turn = session.method.rotates_after_move() && !self.config.in_plate_mode();
        let coordinator = Arc::clone(&self.coordinator);
        let finalize: JoinHandle<()> = tokio::spawn(async move {
            let mut result = coordinator
                .move_to_motors_positions(positions)
                .wait()
                .await;
            if result.is_ok() && half_turn {
                result = coordinator.move_relative("phi", -180.0).await;
            }
            let _ = tx
                .send(DiffractometerCommand::FinalizeFinished { session_id, result })
                .await;
        });
        session.abort = Some(finalize.abort_handle());
    }

    fn finalize_finished(&mut self, session_id: Uuid, result: AppResult<()>) {
        if self.active_session(session_id).is_none() {
            debug!("Move result of finished session {} ignored", session_id);
            return;
        }
        match result {
            Ok(()) => self.succeed_session(),
            Err(err) => {
                error!("Could not move to centred position: {}", err);
                self.fail_session();
            }
        }
    }

    fn succeed_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let now = Utc::now();
        let mut status = self.status.clone().succeeded(session.method, now);
        if session.method == CentringMethod::MoveToBeam || !self.config.user_confirms_centring {
            status = status.accepted();
        }
        self.status = status;

        info!(
            "Centring {} successful after {:.2}s",
            session.method,
            (now - session.started_at).num_milliseconds() as f64 / 1000.0
        );
        self.publisher
            .centring_successful(session.method, &self.status);
        self.publisher.progress_message("");
        for waiter in session.waiters {
            let _ = waiter.send(self.status.clone());
        }
    }

    /// End the session (if any) with a failure event; always releases readiness.
    fn fail_session(&mut self) {
        let mut session = self.session.take();
        if let Some(session) = session.as_mut() {
            session.tear_down();
        }
        self.coordinator.readiness().set_centring_running(false);
        self.status = CentringStatus::invalid();

        let method = session.as_ref().map(|session| session.method);
        warn!("Centring failed ({:?})", method);
        self.publisher.centring_failed(method, &self.status);
        if let Some(session) = session {
            for waiter in session.waiters {
                let _ = waiter.send(self.status.clone());
            }
        }
    }

    fn cancel_centring(&mut self, reject: bool) {
        if let Some(session) = &self.session {
            info!(
                "Cancelling centring method {} in state {:?}",
                session.method, session.state
            );
        }
        self.fail_session();
        self.publisher.progress_message("");
        if reject {
            self.reject_centring();
        }
    }

    fn accept_centring(&mut self) {
        self.status = self.status.clone().accepted();
        self.publisher.centring_accepted(true, &self.status);
    }

    fn reject_centring(&mut self) {
        if self.session.is_some() {
            self.fail_session();
        }
        self.status = CentringStatus::invalid();
        self.publisher.progress_message("");
        self.publisher.centring_accepted(false, &self.status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::Readiness;
    use crate::resolver::ReferenceResolver;
    use std::time::Duration;

    fn actor(calibration: CalibrationState) -> DiffractometerActor {
        let (tx, _rx) = mpsc::channel(1);
        let publisher = StatusPublisher::new(8);
        let coordinator = Arc::new(MotorCoordinator::new(
            Vec::new(),
            Readiness::new(),
            publisher.clone(),
            Duration::from_millis(100),
            Duration::from_millis(1),
        ));
        DiffractometerActor::new(
            Arc::new(DiffractometerConfig::default()),
            coordinator,
            Arc::new(ReferenceResolver::new()),
            None,
            publisher,
            calibration,
            tx.downgrade(),
        )
    }

    fn calibration(pixels_per_mm: Option<(f64, f64)>) -> CalibrationState {
        CalibrationState {
            beam_position: Some(PixelPoint::new(104.0, 46.0)),
            pixels_per_mm,
            zoom_centre: Some(PixelPoint::new(100.0, 50.0)),
        }
    }

    #[test]
    fn test_named_positions_fill_configured_motors_and_beam() {
        let actor = actor(calibration(Some((2.0, 4.0))));
        let current: BTreeMap<String, f64> = [("phi", 10.0), ("sampx", 1.0), ("extra", 5.0)]
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        let resolved: MotorPositionMap = [("phi", 20.0)].into_iter().collect();

        let named = actor.named_positions(&resolved, &current).unwrap();

        assert_eq!(named["phi"], 20.0);
        assert_eq!(named["sampx"], 1.0);
        assert_eq!(named["beam_x"], 2.0);
        assert_eq!(named["beam_y"], -1.0);
        assert!(!named.contains_key("extra"));
        assert_eq!(named.len(), 4);
    }

    #[test]
    fn test_named_positions_need_pixel_scale() {
        let actor = actor(calibration(None));
        let resolved: MotorPositionMap = [("phi", 20.0)].into_iter().collect();

        assert!(matches!(
            actor.named_positions(&resolved, &BTreeMap::new()),
            Err(DiffractometerError::CalibrationUnavailable(_))
        ));
    }
}
