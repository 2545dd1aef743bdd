//! Message types for actor-based communication
//!
//! This module defines the command and response types used for message-passing
//! between the [`Diffractometer`](crate::diffractometer::Diffractometer) handle, the
//! background procedure tasks and the `DiffractometerActor`. Every mutation of the
//! centring session goes through this channel, so the single-active-session check
//! and the session creation can never interleave with another start.

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::centring::{CentringMethod, CentringRequest, CentringState, CentringStatus, SampleInfo};
use crate::error::AppResult;
use crate::motion::MotorPositionMap;
use crate::resolver::{CalibrationState, PixelPoint};

/// Reply to a successful start: the snapshot at start and a receiver resolved with
/// the terminal status once the session is back to idle.
#[derive(Debug)]
pub struct StartedCentring {
    pub status: CentringStatus,
    pub completion: oneshot::Receiver<CentringStatus>,
}

/// Commands that can be sent to the DiffractometerActor
#[derive(Debug)]
pub enum DiffractometerCommand {
    /// Start a centring session
    StartCentring {
        request: CentringRequest,
        sample_info: Option<SampleInfo>,
        response: oneshot::Sender<AppResult<StartedCentring>>,
    },

    /// Cancel the running session, optionally rejecting the last result
    CancelCentring {
        reject: bool,
        response: oneshot::Sender<()>,
    },

    /// Deliver a user click; replies whether a procedure was waiting for it
    ImageClicked {
        point: PixelPoint,
        response: oneshot::Sender<bool>,
    },

    /// Accept the last centring result
    AcceptCentring { response: oneshot::Sender<()> },

    /// Reject the last centring result
    RejectCentring { response: oneshot::Sender<()> },

    /// Get a copy of the current status
    GetCentringStatus {
        response: oneshot::Sender<CentringStatus>,
    },

    /// Get the state machine position
    GetCentringState {
        response: oneshot::Sender<CentringState>,
    },

    /// Get the method of the active session
    GetCurrentMethod {
        response: oneshot::Sender<Option<CentringMethod>>,
    },

    /// Get a copy of the calibration
    GetCalibration {
        response: oneshot::Sender<CalibrationState>,
    },

    /// Update the pixel-per-millimetre scale
    SetPixelsPerMm {
        x: f64,
        y: f64,
        response: oneshot::Sender<()>,
    },

    /// Beam reference moved (sent by the beam-info watcher)
    BeamPositionChanged { point: PixelPoint },

    /// A procedure suspends until the next user click
    AwaitClick {
        session_id: Uuid,
        responder: oneshot::Sender<PixelPoint>,
    },

    /// A procedure task ended, however it ended
    ProcedureFinished {
        session_id: Uuid,
        result: AppResult<MotorPositionMap>,
    },

    /// The move to the centred position ended
    FinalizeFinished {
        session_id: Uuid,
        result: AppResult<()>,
    },

    /// Shutdown the actor
    Shutdown { response: oneshot::Sender<()> },
}

impl DiffractometerCommand {
    /// Helper to create a StartCentring command
    pub fn start_centring(
        request: CentringRequest,
        sample_info: Option<SampleInfo>,
    ) -> (Self, oneshot::Receiver<AppResult<StartedCentring>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::StartCentring {
                request,
                sample_info,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a CancelCentring command
    pub fn cancel_centring(reject: bool) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::CancelCentring { reject, response: tx }, rx)
    }

    /// Helper to create an ImageClicked command
    pub fn image_clicked(point: PixelPoint) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (Self::ImageClicked { point, response: tx }, rx)
    }

    /// Helper to create an AcceptCentring command
    pub fn accept_centring() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::AcceptCentring { response: tx }, rx)
    }

    /// Helper to create a RejectCentring command
    pub fn reject_centring() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::RejectCentring { response: tx }, rx)
    }

    /// Helper to create a GetCentringStatus command
    pub fn get_centring_status() -> (Self, oneshot::Receiver<CentringStatus>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetCentringStatus { response: tx }, rx)
    }

    /// Helper to create a GetCentringState command
    pub fn get_centring_state() -> (Self, oneshot::Receiver<CentringState>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetCentringState { response: tx }, rx)
    }

    /// Helper to create a GetCurrentMethod command
    pub fn get_current_method() -> (Self, oneshot::Receiver<Option<CentringMethod>>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetCurrentMethod { response: tx }, rx)
    }

    /// Helper to create a GetCalibration command
    pub fn get_calibration() -> (Self, oneshot::Receiver<CalibrationState>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetCalibration { response: tx }, rx)
    }

    /// Helper to create a SetPixelsPerMm command
    pub fn set_pixels_per_mm(x: f64, y: f64) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::SetPixelsPerMm { x, y, response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
