//! Mock Hardware Implementations
//!
//! Provides simulated devices for testing without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockMotor` - Simulated axis with realistic timing and optional fault injection
//! - `MockCamera` - Fixed frame size camera
//! - `MockBeamInfo` - Beam position source that can be moved at runtime
//! - `MockLoopFinder` - Scripted image-analysis results
//!
//! # Performance Characteristics
//!
//! - MockMotor: 10 units/sec motion speed by default, 5ms settling time

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::debug;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, RwLock};
use tokio::time::{sleep, Duration};

use crate::hardware::capabilities::{BeamInfo, Camera, LoopFinder, Motor};
use crate::resolver::PixelPoint;

// =============================================================================
// MockMotor - Simulated Axis
// =============================================================================

/// Mock motor with realistic timing
///
/// Simulates an axis with:
/// - configurable speed (units/sec)
/// - 5ms settling time after motion
/// - a busy flag visible through `is_ready`
/// - optional fault injection for error-path tests
///
/// # Example
///
/// ```
/// # use rust_diffractometer::hardware::{mock::MockMotor, Motor};
/// # tokio_test::block_on(async {
/// let phi = MockMotor::new("phi");
/// phi.move_abs(1.0).await?; // Takes ~100 ms
/// assert_eq!(phi.position().await?, 1.0);
/// # Ok::<(), anyhow::Error>(())
/// # }).unwrap();
/// ```
pub struct MockMotor {
    name: String,
    position: Arc<RwLock<f64>>,
    speed_per_sec: f64,
    moving: AtomicBool,
    fail_moves: AtomicBool,
    move_count: AtomicUsize,
}

impl MockMotor {
    /// Create new mock motor at position 0.0
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_speed(name, 10.0)
    }

    /// Create mock motor with custom speed
    ///
    /// # Arguments
    /// * `speed_per_sec` - Motion speed in units/sec
    pub fn with_speed(name: impl Into<String>, speed_per_sec: f64) -> Self {
        Self {
            name: name.into(),
            position: Arc::new(RwLock::new(0.0)),
            speed_per_sec,
            moving: AtomicBool::new(false),
            fail_moves: AtomicBool::new(false),
            move_count: AtomicUsize::new(0),
        }
    }

    /// Start the motor at a given position.
    pub fn at(self, position: f64) -> Self {
        Self {
            position: Arc::new(RwLock::new(position)),
            ..self
        }
    }

    /// Make every subsequent move fail (or succeed again).
    pub fn set_fail_moves(&self, fail: bool) {
        self.fail_moves.store(fail, Ordering::SeqCst);
    }

    /// Number of move commands received so far.
    pub fn move_count(&self) -> usize {
        self.move_count.load(Ordering::SeqCst)
    }
}

/// Keeps a motor's busy flag raised until dropped, even if the move future is.
struct BusyFlag<'a>(&'a AtomicBool);

impl<'a> BusyFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for BusyFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Motor for MockMotor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn move_abs(&self, target: f64) -> Result<()> {
        self.move_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_moves.load(Ordering::SeqCst) {
            return Err(anyhow!("MockMotor {}: simulated drive fault", self.name));
        }

        let current = *self.position.read().await;
        let distance = (target - current).abs();
        let delay_ms = (distance / self.speed_per_sec * 1000.0) as u64;

        debug!(
            "MockMotor {}: Moving from {:.3} to {:.3} ({}ms)",
            self.name, current, target, delay_ms
        );

        let _busy = BusyFlag::raise(&self.moving);
        // CRITICAL: Use tokio::time::sleep, NOT std::thread::sleep
        sleep(Duration::from_millis(delay_ms)).await;
        *self.position.write().await = target;
        sleep(Duration::from_millis(5)).await; // settling

        debug!("MockMotor {}: Reached {:.3}", self.name, target);
        Ok(())
    }

    async fn move_rel(&self, delta: f64) -> Result<()> {
        let current = *self.position.read().await;
        self.move_abs(current + delta).await
    }

    async fn position(&self) -> Result<f64> {
        Ok(*self.position.read().await)
    }

    async fn is_ready(&self) -> bool {
        !self.moving.load(Ordering::SeqCst)
    }
}

// =============================================================================
// MockCamera - Simulated Camera
// =============================================================================

/// Mock camera reporting a fixed frame size
pub struct MockCamera {
    resolution: (u32, u32),
}

impl MockCamera {
    /// Create new mock camera with specified resolution
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            resolution: (width, height),
        }
    }
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::new(768, 576)
    }
}

#[async_trait]
impl Camera for MockCamera {
    async fn frame_size(&self) -> Result<(u32, u32)> {
        Ok(self.resolution)
    }
}

// =============================================================================
// MockBeamInfo - Beam position source
// =============================================================================

/// Beam position source whose value can be changed from a test
pub struct MockBeamInfo {
    sender: watch::Sender<PixelPoint>,
}

impl MockBeamInfo {
    /// Create with an initial beam position
    pub fn new(initial: PixelPoint) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    /// Move the beam and notify subscribers
    pub fn set_beam_position(&self, position: PixelPoint) {
        self.sender.send_replace(position);
    }
}

impl BeamInfo for MockBeamInfo {
    fn beam_position(&self) -> PixelPoint {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<PixelPoint> {
        self.sender.subscribe()
    }
}

// =============================================================================
// MockLoopFinder - Scripted image analysis
// =============================================================================

/// Loop finder replaying a scripted sequence of results
///
/// Once the script is exhausted every call reports "nothing found".
pub struct MockLoopFinder {
    script: Mutex<VecDeque<Option<PixelPoint>>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockLoopFinder {
    /// Create a finder that returns `results` in order
    pub fn new(results: impl IntoIterator<Item = Option<PixelPoint>>) -> Self {
        Self {
            script: Mutex::new(results.into_iter().collect()),
            delay: Duration::from_millis(5),
            calls: AtomicUsize::new(0),
        }
    }

    /// Simulated image-analysis time per call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of analysis calls made so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LoopFinder for MockLoopFinder {
    async fn find_loop(&self, loop_only: bool) -> Result<Option<PixelPoint>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        sleep(self.delay).await;
        let next = self
            .script
            .lock()
            .map_err(|_| anyhow!("MockLoopFinder script lock poisoned"))?
            .pop_front()
            .flatten();
        debug!("MockLoopFinder (loop_only={}): {:?}", loop_only, next);
        Ok(next)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_motor_absolute_move() {
        let motor = MockMotor::with_speed("sampx", 100.0);

        // Initial position should be 0
        assert_eq!(motor.position().await.unwrap(), 0.0);

        motor.move_abs(1.0).await.unwrap();
        assert_eq!(motor.position().await.unwrap(), 1.0);
        assert!(motor.is_ready().await);
        assert_eq!(motor.move_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_motor_relative_move() {
        let motor = MockMotor::with_speed("phi", 1000.0).at(90.0);

        motor.move_rel(-180.0).await.unwrap();
        assert_eq!(motor.position().await.unwrap(), -90.0);
    }

    #[tokio::test]
    async fn test_mock_motor_ready_after_dropped_move() {
        let motor = MockMotor::with_speed("phi", 10.0);

        let interrupted = tokio::time::timeout(Duration::from_millis(20), motor.move_abs(5.0)).await;
        assert!(interrupted.is_err());
        assert!(motor.is_ready().await);
    }

    #[tokio::test]
    async fn test_mock_motor_busy_while_moving() {
        let motor = Arc::new(MockMotor::with_speed("phiz", 10.0));
        let mover = motor.clone();
        let task = tokio::spawn(async move { mover.move_abs(1.0).await });

        sleep(Duration::from_millis(20)).await;
        assert!(!motor.is_ready().await);

        task.await.unwrap().unwrap();
        assert!(motor.is_ready().await);
    }

    #[tokio::test]
    async fn test_mock_motor_fault_injection() {
        let motor = MockMotor::new("phiy");
        motor.set_fail_moves(true);
        assert!(motor.move_abs(1.0).await.is_err());
        assert_eq!(motor.position().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_mock_camera_frame_size() {
        let camera = MockCamera::new(1360, 1024);
        assert_eq!(camera.frame_size().await.unwrap(), (1360, 1024));
    }

    #[tokio::test]
    async fn test_mock_beam_info_notifies() {
        let beam = MockBeamInfo::new(PixelPoint::new(100.0, 50.0));
        let mut rx = beam.subscribe();

        beam.set_beam_position(PixelPoint::new(110.0, 55.0));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), PixelPoint::new(110.0, 55.0));
        assert_eq!(beam.beam_position(), PixelPoint::new(110.0, 55.0));
    }

    #[tokio::test]
    async fn test_mock_loop_finder_script() {
        let finder = MockLoopFinder::new([None, Some(PixelPoint::new(1.0, 2.0))]);
        assert_eq!(finder.find_loop(false).await.unwrap(), None);
        assert_eq!(
            finder.find_loop(true).await.unwrap(),
            Some(PixelPoint::new(1.0, 2.0))
        );
        // Exhausted script reports nothing found
        assert_eq!(finder.find_loop(false).await.unwrap(), None);
        assert_eq!(finder.calls(), 3);
    }
}
