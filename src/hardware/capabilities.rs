//! Capability traits consumed by the centring engine.
//!
//! Each trait describes one thing a collaborator can do, not what kind of device it
//! is. A goniometer axis implements [`Motor`]; the sample camera implements
//! [`Camera`]; a beam-position monitor implements [`BeamInfo`]. Drivers return
//! `anyhow::Result` so they can attach their own context; the engine converts driver
//! errors into [`DiffractometerError`](crate::error::DiffractometerError) at its
//! boundary.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;

use crate::resolver::PixelPoint;

/// A single independently driven axis.
///
/// `move_abs` and `move_rel` resolve once the motor has reached its target. The
/// engine runs each call on its own task, so a slow axis never holds up the others.
#[async_trait]
pub trait Motor: Send + Sync {
    /// Logical role of this motor (e.g. "phi", "sampx").
    fn name(&self) -> &str;

    /// Move to an absolute position.
    async fn move_abs(&self, target: f64) -> Result<()>;

    /// Move by a relative distance.
    async fn move_rel(&self, delta: f64) -> Result<()>;

    /// Current position in motor units.
    async fn position(&self) -> Result<f64>;

    /// True when the motor is not moving and can accept a command.
    async fn is_ready(&self) -> bool;
}

/// Sample-viewing camera.
#[async_trait]
pub trait Camera: Send + Sync {
    /// Current frame size as (width, height) in pixels.
    async fn frame_size(&self) -> Result<(u32, u32)>;
}

/// Source of the beam reference position on screen.
pub trait BeamInfo: Send + Sync {
    /// Current beam position in pixels.
    fn beam_position(&self) -> PixelPoint;

    /// Receiver notified every time the beam position changes.
    fn subscribe(&self) -> watch::Receiver<PixelPoint>;
}

/// Image-analysis collaborator used by automatic centring.
#[async_trait]
pub trait LoopFinder: Send + Sync {
    /// Locate the sample loop in the current image.
    ///
    /// Returns `Ok(None)` when nothing was found in this frame. `loop_only` restricts
    /// the search to the loop outline rather than the crystal.
    async fn find_loop(&self, loop_only: bool) -> Result<Option<PixelPoint>>;
}
