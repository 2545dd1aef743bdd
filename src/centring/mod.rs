//! Centring methods, requests and session status.
//!
//! A centring procedure finds the sample on screen and produces a target position for
//! the goniometer. Three variants exist:
//!
//! - [`CentringMethod::Manual`]: the user picks the sample several times
//! - [`CentringMethod::Automatic`]: an image-analysis loop picks it
//! - [`CentringMethod::MoveToBeam`]: a single given (or default) pixel, no suspension
//!
//! Requests are a tagged enum, one variant per method, so dispatch is checked for
//! exhaustiveness at compile time. Names are only parsed at the API edge
//! ([`CentringMethod::from_str`](std::str::FromStr)).

pub mod procedure;
pub mod status;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DiffractometerError;
use crate::resolver::PixelPoint;

pub use status::{CentringState, CentringStatus};

/// Tag identifying a centring variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CentringMethod {
    /// Interactive multi-click centring.
    Manual,
    /// Image-analysis driven centring.
    Automatic,
    /// Centre on a single pixel without user interaction.
    MoveToBeam,
}

impl CentringMethod {
    /// Human-readable name used by clients.
    pub fn as_str(&self) -> &'static str {
        match self {
            CentringMethod::Manual => "Manual 3-click",
            CentringMethod::Automatic => "Computer automatic",
            CentringMethod::MoveToBeam => "Move to beam",
        }
    }

    /// True for the multi-point variants, which finish with a half-turn of `phi`.
    pub fn rotates_after_move(&self) -> bool {
        matches!(self, CentringMethod::Manual | CentringMethod::Automatic)
    }
}

impl fmt::Display for CentringMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CentringMethod {
    type Err = DiffractometerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Manual 3-click" | "Manual" => Ok(CentringMethod::Manual),
            "Computer automatic" | "Automatic" => Ok(CentringMethod::Automatic),
            "Move to beam" | "MoveToBeam" => Ok(CentringMethod::MoveToBeam),
            other => Err(DiffractometerError::UnknownCentringMethod(other.to_string())),
        }
    }
}

/// Parameters for starting one centring session.
#[derive(Debug, Clone, PartialEq)]
pub enum CentringRequest {
    /// Manual multi-click centring.
    Manual,
    /// Automatic centring; `loop_only` restricts image analysis to the loop outline.
    Automatic {
        /// Restrict the search to the loop.
        loop_only: bool,
    },
    /// Centre on `point` (default: the beam position), optionally forcing `phi`.
    MoveToBeam {
        /// Pixel to centre; `None` uses the beam reference position.
        point: Option<PixelPoint>,
        /// Explicit rotation angle for the result.
        omega: Option<f64>,
    },
}

impl CentringRequest {
    /// Variant tag of this request.
    pub fn method(&self) -> CentringMethod {
        match self {
            CentringRequest::Manual => CentringMethod::Manual,
            CentringRequest::Automatic { .. } => CentringMethod::Automatic,
            CentringRequest::MoveToBeam { .. } => CentringMethod::MoveToBeam,
        }
    }
}

impl From<CentringMethod> for CentringRequest {
    fn from(method: CentringMethod) -> Self {
        match method {
            CentringMethod::Manual => CentringRequest::Manual,
            CentringMethod::Automatic => CentringRequest::Automatic { loop_only: false },
            CentringMethod::MoveToBeam => CentringRequest::MoveToBeam {
                point: None,
                omega: None,
            },
        }
    }
}

/// Optional description of the mounted sample, carried along for logging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleInfo {
    /// Sample name or barcode.
    pub name: Option<String>,
    /// Sample-changer location.
    pub location: Option<String>,
}
