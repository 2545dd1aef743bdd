//! Concurrent motor moves.
//!
//! [`MotorCoordinator`] issues one move task per motor, lets them run side by side,
//! and then blocks on device readiness. Moves inside one call have no ordering
//! guarantee among themselves; the readiness wait only completes once all of them
//! are done.
//!
//! Dropping or aborting the caller does not stop the spawned move tasks. A motor may
//! therefore be left mid-move by a cancelled centring.

use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::error::{AppResult, DiffractometerError};
use crate::hardware::Motor;
use crate::motion::position::{MotorKey, MotorPositionMap};
use crate::motion::readiness::{Readiness, ReadinessState};
use crate::publisher::StatusPublisher;

#[derive(Debug, Clone, Copy)]
enum MoveKind {
    Absolute(f64),
    Relative(f64),
}

/// One outstanding move for one motor.
struct MotorMoveTask {
    motor: String,
    handle: JoinHandle<anyhow::Result<()>>,
}

/// Handle on a background `move_to_motors_positions` task.
#[derive(Debug)]
pub struct MoveHandle {
    handle: JoinHandle<AppResult<()>>,
}

impl MoveHandle {
    /// Wait for the background move to finish and return its outcome.
    pub async fn wait(self) -> AppResult<()> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(DiffractometerError::Cancelled),
            Err(err) => Err(DiffractometerError::Procedure(format!(
                "move task panicked: {}",
                err
            ))),
        }
    }

    /// Stop waiting on the move. Motors already in motion keep going.
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// True once the background task has completed.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Supervises moves across the installed motor set.
///
/// The motor set is fixed at construction and shared read-only with the centring
/// actor.
pub struct MotorCoordinator {
    motors: BTreeMap<String, Arc<dyn Motor>>,
    readiness: Arc<Readiness>,
    publisher: StatusPublisher,
    move_timeout: Duration,
    poll_interval: Duration,
}

impl MotorCoordinator {
    /// Create a coordinator over `motors`, keyed by their logical names.
    pub fn new(
        motors: impl IntoIterator<Item = Arc<dyn Motor>>,
        readiness: Arc<Readiness>,
        publisher: StatusPublisher,
        move_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        let motors = motors
            .into_iter()
            .map(|motor| (motor.name().to_string(), motor))
            .collect();
        Self {
            motors,
            readiness,
            publisher,
            move_timeout,
            poll_interval,
        }
    }

    /// Installed motor for a role.
    pub fn motor(&self, name: &str) -> Option<Arc<dyn Motor>> {
        self.motors.get(name).cloned()
    }

    /// Names of the installed motors.
    pub fn motor_names(&self) -> impl Iterator<Item = &str> {
        self.motors.keys().map(String::as_str)
    }

    /// Shared readiness state.
    pub fn readiness(&self) -> &Arc<Readiness> {
        &self.readiness
    }

    /// Bound used by `move_motors`.
    pub fn move_timeout(&self) -> Duration {
        self.move_timeout
    }

    /// Current position of every installed motor. Unreadable motors are logged and left out.
    pub async fn positions(&self) -> BTreeMap<String, f64> {
        let mut positions = BTreeMap::new();
        for (name, motor) in &self.motors {
            match motor.position().await {
                Ok(value) => {
                    positions.insert(name.clone(), value);
                }
                Err(err) => warn!("Could not read position of motor '{}': {:#}", name, err),
            }
        }
        positions
    }

    /// True when nothing is outstanding and every installed motor reports ready.
    pub async fn is_ready(&self) -> bool {
        if !self.readiness.state().is_idle() {
            return false;
        }
        for motor in self.motors.values() {
            if !motor.is_ready().await {
                return false;
            }
        }
        true
    }

    /// Poll readiness at a fixed interval until ready or `timeout` elapses.
    pub async fn wait_device_ready(&self, timeout: Duration) -> AppResult<()> {
        let poll = async {
            while !self.is_ready().await {
                sleep(self.poll_interval).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.map_err(|_| {
            let state: ReadinessState = self.readiness.state();
            warn!(
                "Device not ready after {:?} ({} moves outstanding, centring running: {})",
                timeout, state.moves_outstanding, state.centring_running
            );
            DiffractometerError::DeviceTimeout(timeout.as_millis() as u64)
        })
    }

    fn resolve(&self, key: &MotorKey) -> Option<Arc<dyn Motor>> {
        match key {
            MotorKey::Handle(motor) => Some(Arc::clone(motor)),
            MotorKey::Name(name) => {
                let motor = self.motors.get(name).cloned();
                if motor.is_none() {
                    debug!("Motor '{}' is not installed, skipping", name);
                }
                motor
            }
        }
    }

    fn spawn_move(&self, motor: Arc<dyn Motor>, kind: MoveKind) -> MotorMoveTask {
        let guard = self.readiness.begin_move();
        let name = motor.name().to_string();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            match kind {
                MoveKind::Absolute(target) => motor.move_abs(target).await,
                MoveKind::Relative(delta) => motor.move_rel(delta).await,
            }
        });
        MotorMoveTask { motor: name, handle }
    }

    async fn settle(&self, tasks: Vec<MotorMoveTask>) -> AppResult<()> {
        self.wait_device_ready(self.move_timeout).await?;

        let results = futures::future::join_all(
            tasks
                .into_iter()
                .map(|task| async move { (task.motor, task.handle.await) }),
        )
        .await;

        let mut first_error = None;
        for (motor, result) in results {
            if let Err(outcome) = move_outcome(motor, result) {
                warn!("{}", outcome);
                first_error.get_or_insert(outcome);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Move every motor in `positions` concurrently and wait for readiness.
    ///
    /// Unknown motor names are skipped. An empty map returns immediately without
    /// spawning anything. Fails with `DeviceTimeout` if readiness is not reached
    /// within the configured bound; the moves are left running in that case.
    pub async fn move_motors(&self, positions: &MotorPositionMap) -> AppResult<()> {
        if positions.is_empty() {
            return Ok(());
        }

        let tasks: Vec<MotorMoveTask> = positions
            .iter()
            .filter_map(|(key, target)| {
                self.resolve(key)
                    .map(|motor| self.spawn_move(motor, MoveKind::Absolute(target)))
            })
            .collect();
        info!(
            "Moving {} of {} requested motors",
            tasks.len(),
            positions.len()
        );

        self.settle(tasks).await
    }

    /// Start a relative move of one installed motor on its own task.
    ///
    /// The move is tracked by readiness but not waited on; dropping or aborting the
    /// returned handle leaves it running. `None` if the motor is not installed.
    pub fn spawn_relative(&self, name: &str, delta: f64) -> Option<MoveHandle> {
        let motor = self.motor(name)?;
        let task = self.spawn_move(motor, MoveKind::Relative(delta));
        let handle = tokio::spawn(async move { move_outcome(task.motor, task.handle.await) });
        Some(MoveHandle { handle })
    }

    /// Move one installed motor by `delta` and wait for readiness.
    pub async fn move_relative(&self, name: &str, delta: f64) -> AppResult<()> {
        let Some(motor) = self.motor(name) else {
            error!("Relative move requested for missing motor '{}'", name);
            return Ok(());
        };
        let task = self.spawn_move(motor, MoveKind::Relative(delta));
        self.settle(vec![task]).await
    }

    /// Run `move_motors` as an independent task.
    ///
    /// Publishes a progress message while moving and clears it when the task ends,
    /// whatever the outcome. Motor failures are only visible through the returned
    /// handle.
    pub fn move_to_motors_positions(self: &Arc<Self>, positions: MotorPositionMap) -> MoveHandle {
        self.publisher
            .progress_message("Moving to motors positions...");
        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let result = coordinator.move_motors(&positions).await;
            if let Err(err) = &result {
                warn!("Move to motors positions failed: {}", err);
            }
            coordinator.publisher.progress_message("");
            result
        });
        MoveHandle { handle }
    }
}

fn move_outcome(
    motor: String,
    result: Result<anyhow::Result<()>, tokio::task::JoinError>,
) -> AppResult<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(DiffractometerError::motor(motor, &err)),
        Err(join_err) => Err(DiffractometerError::Motor {
            motor,
            message: join_err.to_string(),
        }),
    }
}
