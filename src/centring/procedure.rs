//! Centring procedure variants.
//!
//! Each variant runs to completion and produces a [`MotorPositionMap`]. Manual and
//! automatic centring run on their own task and may suspend (user click, image
//! analysis, rotation between picks); every suspension also watches the session's
//! [`CancellationToken`], so a cancelled procedure unwinds at its next await.
//! Move-to-beam never suspends and is resolved directly by the actor.

use log::{debug, info};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{AppResult, DiffractometerError};
use crate::hardware::{LoopFinder, Motor};
use crate::messages::DiffractometerCommand;
use crate::motion::{MotorCoordinator, MotorPositionMap};
use crate::resolver::{CalibrationState, ClickPoint, ClickPointResolver, PixelPoint};

/// Everything a procedure task needs, owned so the task can be spawned.
pub(crate) struct ProcedureContext {
    pub session_id: Uuid,
    pub calibration: CalibrationState,
    pub resolver: Arc<dyn ClickPointResolver>,
    pub coordinator: Arc<MotorCoordinator>,
    pub commands: mpsc::Sender<DiffractometerCommand>,
    pub cancel: CancellationToken,
    pub points_required: usize,
    pub rotation_step: f64,
    pub click_timeout: Option<Duration>,
    pub loop_finder: Option<Arc<dyn LoopFinder>>,
    pub attempts_per_point: usize,
}

impl ProcedureContext {
    /// Run `future` unless the session is cancelled first.
    async fn cancellable<T>(
        &self,
        future: impl std::future::Future<Output = AppResult<T>>,
    ) -> AppResult<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(DiffractometerError::Cancelled),
            result = future => result,
        }
    }

    /// Suspend until the user clicks on the sample image.
    async fn next_click(&self) -> AppResult<PixelPoint> {
        let (responder, click) = oneshot::channel();
        self.commands
            .send(DiffractometerCommand::AwaitClick {
                session_id: self.session_id,
                responder,
            })
            .await
            .map_err(|_| DiffractometerError::ActorUnavailable)?;

        // A dropped responder means the actor tore the session down
        let wait = async { click.await.map_err(|_| DiffractometerError::Cancelled) };
        self.cancellable(async {
            match self.click_timeout {
                Some(bound) => tokio::time::timeout(bound, wait)
                    .await
                    .map_err(|_| DiffractometerError::DeviceTimeout(bound.as_millis() as u64))?,
                None => wait.await,
            }
        })
        .await
    }

    fn rotation_motor(&self) -> Option<Arc<dyn Motor>> {
        self.coordinator.motor("phi")
    }

    async fn current_phi(&self) -> Option<f64> {
        match self.rotation_motor() {
            Some(phi) => phi.position().await.ok(),
            None => None,
        }
    }

    /// Turn the sample between two picks.
    ///
    /// The move runs on a coordinator task, so cancelling the procedure stops the
    /// wait but not the motor.
    async fn rotate(&self) -> AppResult<()> {
        if self.rotation_step == 0.0 {
            return Ok(());
        }
        let Some(rotation) = self.coordinator.spawn_relative("phi", self.rotation_step) else {
            return Ok(());
        };
        self.cancellable(rotation.wait()).await
    }

    async fn resolve(&self, picks: &[ClickPoint]) -> AppResult<MotorPositionMap> {
        let current = self.coordinator.positions().await;
        self.resolver
            .resolve_from_clicks(picks, &self.calibration, &current)
    }
}

/// Interactive multi-click centring.
#[derive(Debug, Clone, Default)]
pub(crate) struct ManualCentring;

impl ManualCentring {
    async fn run(self, ctx: &ProcedureContext) -> AppResult<MotorPositionMap> {
        let mut picks = Vec::with_capacity(ctx.points_required);
        while picks.len() < ctx.points_required {
            let point = ctx.next_click().await?;
            let phi = ctx.current_phi().await;
            debug!(
                "Manual centring pick {}/{} at ({:.1}, {:.1}), phi {:?}",
                picks.len() + 1,
                ctx.points_required,
                point.x,
                point.y,
                phi
            );
            picks.push(ClickPoint { point, phi });
            if picks.len() < ctx.points_required {
                ctx.rotate().await?;
            }
        }
        ctx.resolve(&picks).await
    }
}

/// Image-analysis driven centring.
#[derive(Debug, Clone, Default)]
pub(crate) struct AutomaticCentring {
    pub loop_only: bool,
}

impl AutomaticCentring {
    async fn run(self, ctx: &ProcedureContext) -> AppResult<MotorPositionMap> {
        let finder = ctx.loop_finder.clone().ok_or_else(|| {
            DiffractometerError::Procedure("no loop finder is configured".to_string())
        })?;

        let mut picks = Vec::with_capacity(ctx.points_required);
        while picks.len() < ctx.points_required {
            let mut found = None;
            for attempt in 1..=ctx.attempts_per_point {
                let result = ctx
                    .cancellable(async {
                        finder.find_loop(self.loop_only).await.map_err(|err| {
                            DiffractometerError::Procedure(format!("loop finder failed: {:#}", err))
                        })
                    })
                    .await?;
                if result.is_some() {
                    found = result;
                    break;
                }
                debug!(
                    "Automatic centring: no loop found (attempt {}/{})",
                    attempt, ctx.attempts_per_point
                );
            }
            let point = found.ok_or_else(|| {
                DiffractometerError::Procedure(format!(
                    "loop not found after {} attempts",
                    ctx.attempts_per_point
                ))
            })?;
            picks.push(ClickPoint {
                point,
                phi: ctx.current_phi().await,
            });
            if picks.len() < ctx.points_required {
                ctx.rotate().await?;
            }
        }
        info!("Automatic centring collected {} points", picks.len());
        ctx.resolve(&picks).await
    }
}

/// Centre on a single pixel.
#[derive(Debug, Clone, Default)]
pub(crate) struct MoveToBeam {
    pub point: Option<PixelPoint>,
    pub omega: Option<f64>,
}

impl MoveToBeam {
    /// Resolve without suspending. The pixel defaults to the beam reference position.
    pub fn resolve(
        &self,
        resolver: &dyn ClickPointResolver,
        calibration: &CalibrationState,
        current: &BTreeMap<String, f64>,
    ) -> AppResult<MotorPositionMap> {
        let point = match self.point {
            Some(point) => point,
            None => calibration.beam_position.ok_or_else(|| {
                DiffractometerError::CalibrationUnavailable(
                    "beam position is not known".to_string(),
                )
            })?,
        };
        resolver.resolve_from_pixel(point, self.omega, calibration, current)
    }
}

/// The variants that run on their own task.
pub(crate) enum SpawnedProcedure {
    Manual(ManualCentring),
    Automatic(AutomaticCentring),
}

impl SpawnedProcedure {
    pub async fn run(self, ctx: ProcedureContext) -> AppResult<MotorPositionMap> {
        match self {
            SpawnedProcedure::Manual(procedure) => procedure.run(&ctx).await,
            SpawnedProcedure::Automatic(procedure) => procedure.run(&ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockLoopFinder, MockMotor};
    use crate::motion::Readiness;
    use crate::publisher::StatusPublisher;
    use crate::resolver::ReferenceResolver;

    fn calibration() -> CalibrationState {
        CalibrationState {
            beam_position: Some(PixelPoint::new(100.0, 50.0)),
            pixels_per_mm: Some((2.0, 2.0)),
            zoom_centre: Some(PixelPoint::new(100.0, 50.0)),
        }
    }

    fn context(
        finder: Option<Arc<dyn LoopFinder>>,
    ) -> (ProcedureContext, mpsc::Receiver<DiffractometerCommand>) {
        let (tx, rx) = mpsc::channel(8);
        let motors: Vec<Arc<dyn Motor>> = vec![
            Arc::new(MockMotor::with_speed("phi", 100_000.0)),
            Arc::new(MockMotor::with_speed("phiy", 1000.0)),
        ];
        let coordinator = Arc::new(MotorCoordinator::new(
            motors,
            Readiness::new(),
            StatusPublisher::new(8),
            Duration::from_secs(1),
            Duration::from_millis(5),
        ));
        let ctx = ProcedureContext {
            session_id: Uuid::new_v4(),
            calibration: calibration(),
            resolver: Arc::new(ReferenceResolver::new()),
            coordinator,
            commands: tx,
            cancel: CancellationToken::new(),
            points_required: 2,
            rotation_step: 90.0,
            click_timeout: None,
            loop_finder: finder,
            attempts_per_point: 2,
        };
        (ctx, rx)
    }

    #[test]
    fn test_move_to_beam_defaults_to_beam_position() {
        let current: BTreeMap<String, f64> = [("phiy".to_string(), 0.0)].into_iter().collect();
        let map = MoveToBeam::default()
            .resolve(&ReferenceResolver::new(), &calibration(), &current)
            .unwrap();
        assert_eq!(map.get("beam_x"), Some(0.0));
        assert_eq!(map.get("phiy"), Some(0.0));
    }

    #[test]
    fn test_move_to_beam_omega_override() {
        let procedure = MoveToBeam {
            point: Some(PixelPoint::new(100.0, 50.0)),
            omega: Some(45.0),
        };
        let map = procedure
            .resolve(&ReferenceResolver::new(), &calibration(), &BTreeMap::new())
            .unwrap();
        assert_eq!(map.get("phi"), Some(45.0));
    }

    #[tokio::test]
    async fn test_manual_collects_clicks_and_rotates() {
        let (ctx, mut rx) = context(None);
        let phi = ctx.coordinator.motor("phi").unwrap();
        let task = tokio::spawn(ManualCentring.run_owned(ctx));

        for x in [98.0, 102.0] {
            match rx.recv().await.unwrap() {
                DiffractometerCommand::AwaitClick { responder, .. } => {
                    responder.send(PixelPoint::new(x, 50.0)).unwrap();
                }
                other => panic!("unexpected command {:?}", other),
            }
        }

        let map = task.await.unwrap().unwrap();
        assert!(map.get("phiy").is_some());
        // One rotation between the two picks
        assert_eq!(phi.position().await.unwrap(), 90.0);
    }

    #[tokio::test]
    async fn test_manual_unwinds_on_cancel() {
        let (ctx, mut rx) = context(None);
        let token = ctx.cancel.clone();
        let task = tokio::spawn(ManualCentring.run_owned(ctx));

        // Keep the responder alive so only the token can end the wait
        let _pending = rx.recv().await.unwrap();
        token.cancel();
        assert_eq!(task.await.unwrap(), Err(DiffractometerError::Cancelled));
    }

    #[tokio::test]
    async fn test_bounded_click_wait() {
        let (mut ctx, mut rx) = context(None);
        ctx.click_timeout = Some(Duration::from_millis(20));
        let task = tokio::spawn(ManualCentring.run_owned(ctx));
        let _pending = rx.recv().await.unwrap();
        assert_eq!(
            task.await.unwrap(),
            Err(DiffractometerError::DeviceTimeout(20))
        );
    }

    #[tokio::test]
    async fn test_automatic_retries_until_found() {
        let finder = Arc::new(MockLoopFinder::new([
            None,
            Some(PixelPoint::new(100.0, 50.0)),
            Some(PixelPoint::new(100.0, 50.0)),
        ]));
        let (ctx, _rx) = context(Some(finder.clone()));
        let map = AutomaticCentring { loop_only: true }
            .run(&ctx)
            .await
            .unwrap();
        assert_eq!(finder.calls(), 3);
        assert_eq!(map.get("beam_y"), Some(0.0));
    }

    #[tokio::test]
    async fn test_automatic_gives_up() {
        let finder = Arc::new(MockLoopFinder::new([]));
        let (ctx, _rx) = context(Some(finder.clone()));
        let err = AutomaticCentring::default().run(&ctx).await.unwrap_err();
        assert!(matches!(err, DiffractometerError::Procedure(_)));
        assert_eq!(finder.calls(), 2);
    }

    #[tokio::test]
    async fn test_automatic_without_finder() {
        let (ctx, _rx) = context(None);
        assert!(AutomaticCentring::default().run(&ctx).await.is_err());
    }

    impl ManualCentring {
        async fn run_owned(self, ctx: ProcedureContext) -> AppResult<MotorPositionMap> {
            self.run(&ctx).await
        }
    }
}
