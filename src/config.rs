//! Diffractometer configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables (prefixed with `DIFFRACTOMETER_`, nested keys split on `__`)
//!
//! All values are read once when the engine is built and treated as immutable for the
//! engine's lifetime.
//!
//! ```text
//! DIFFRACTOMETER_HEAD_TYPE=Plate
//! DIFFRACTOMETER_CLICKS_REQUIRED=5
//! DIFFRACTOMETER_ZOOM_CENTRE__X=384
//! ```
//!
//! # Example
//!
//! ```no_run
//! use rust_diffractometer::config::DiffractometerConfig;
//!
//! let config = DiffractometerConfig::load_from("config/diffractometer.toml")?;
//! println!("Motors: {:?}", config.used_motors);
//! # Ok::<(), rust_diffractometer::error::DiffractometerError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::centring::CentringMethod;
use crate::error::{AppResult, DiffractometerError};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "DIFFRACTOMETER_";

/// Motor roles used when the configuration does not list any.
pub const DEFAULT_MOTORS: [&str; 11] = [
    "phi",
    "focus",
    "phiz",
    "phiy",
    "zoom",
    "sampx",
    "sampy",
    "kappa",
    "kappa_phi",
    "beam_x",
    "beam_y",
];

/// Sample head mounted on the goniometer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HeadType {
    /// Mini-kappa head.
    #[default]
    MiniKappa,
    /// Crystallisation plate holder; suppresses the post-centring rotation.
    Plate,
    /// Permanent (non-removable) head.
    Permanent,
}

/// A pixel coordinate pair in the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelPair {
    /// Horizontal pixel coordinate.
    pub x: f64,
    /// Vertical pixel coordinate.
    pub y: f64,
}

/// Orientation of the fast and slow axes of a raster grid on screen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridDirection {
    /// Fast scan axis.
    pub fast: (i32, i32),
    /// Slow scan axis.
    pub slow: (i32, i32),
}

impl Default for GridDirection {
    fn default() -> Self {
        Self {
            fast: (0, 1),
            slow: (1, 0),
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffractometerConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Motor roles the engine knows about, including pseudo-motors
    #[serde(default = "default_used_motors")]
    pub used_motors: Vec<String>,
    /// Mounted sample head
    #[serde(default)]
    pub head_type: HeadType,
    /// Screen position the zoom converges on; defaults to the frame centre
    #[serde(default)]
    pub zoom_centre: Option<PixelPair>,
    /// Initial pixel-per-millimetre scale; normally supplied later by the zoom
    #[serde(default)]
    pub pixels_per_mm: Option<PixelPair>,
    /// Whether the rotation axis turns in the negative direction
    #[serde(default)]
    pub reversing_rotation: bool,
    /// Raster grid orientation
    #[serde(default)]
    pub grid_direction: GridDirection,
    /// Named diffractometer phases
    #[serde(default)]
    pub phase_list: Vec<String>,
    /// Centring variants callers may start
    #[serde(default = "default_centring_methods")]
    pub centring_methods: Vec<CentringMethod>,
    /// Points collected by the manual and automatic procedures
    #[serde(default = "default_clicks_required")]
    pub clicks_required: usize,
    /// Rotation of `phi` between two collected points, in degrees
    #[serde(default = "default_click_rotation_step")]
    pub click_rotation_step: f64,
    /// When false, successful centrings are accepted without user confirmation
    #[serde(default = "default_true")]
    pub user_confirms_centring: bool,
    /// Upper bound on a single click wait; `None` waits forever
    #[serde(default)]
    pub user_click_timeout_ms: Option<u64>,
    /// Loop-finder calls allowed per collected point in automatic centring
    #[serde(default = "default_automatic_attempts")]
    pub automatic_attempts: usize,
    /// Bound on the readiness wait after issuing motor moves
    #[serde(default = "default_move_timeout_ms")]
    pub move_timeout_ms: u64,
    /// Readiness polling interval
    #[serde(default = "default_ready_poll_interval_ms")]
    pub ready_poll_interval_ms: u64,
    /// Capacity of the actor command channel
    #[serde(default = "default_command_channel_capacity")]
    pub command_channel_capacity: usize,
    /// Capacity of the status event broadcast channel
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_used_motors() -> Vec<String> {
    DEFAULT_MOTORS.iter().map(|name| name.to_string()).collect()
}

fn default_centring_methods() -> Vec<CentringMethod> {
    vec![
        CentringMethod::Manual,
        CentringMethod::Automatic,
        CentringMethod::MoveToBeam,
    ]
}

fn default_clicks_required() -> usize {
    3
}

fn default_click_rotation_step() -> f64 {
    90.0
}

fn default_true() -> bool {
    true
}

fn default_automatic_attempts() -> usize {
    3
}

fn default_move_timeout_ms() -> u64 {
    15_000
}

fn default_ready_poll_interval_ms() -> u64 {
    10
}

fn default_command_channel_capacity() -> usize {
    64
}

fn default_event_channel_capacity() -> usize {
    256
}

impl Default for DiffractometerConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            used_motors: default_used_motors(),
            head_type: HeadType::default(),
            zoom_centre: None,
            pixels_per_mm: None,
            reversing_rotation: false,
            grid_direction: GridDirection::default(),
            phase_list: Vec::new(),
            centring_methods: default_centring_methods(),
            clicks_required: default_clicks_required(),
            click_rotation_step: default_click_rotation_step(),
            user_confirms_centring: true,
            user_click_timeout_ms: None,
            automatic_attempts: default_automatic_attempts(),
            move_timeout_ms: default_move_timeout_ms(),
            ready_poll_interval_ms: default_ready_poll_interval_ms(),
            command_channel_capacity: default_command_channel_capacity(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl DiffractometerConfig {
    /// Load configuration from a TOML file with environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from defaults and environment only.
    pub fn from_env() -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check semantic constraints that deserialisation cannot express.
    pub fn validate(&self) -> AppResult<()> {
        if self.used_motors.is_empty() {
            return Err(DiffractometerError::Configuration(
                "used_motors must name at least one motor".to_string(),
            ));
        }
        if !self.used_motors.iter().any(|name| name == "phi") {
            return Err(DiffractometerError::Configuration(
                "used_motors must include the 'phi' rotation axis".to_string(),
            ));
        }
        if self.clicks_required == 0 {
            return Err(DiffractometerError::Configuration(
                "clicks_required must be at least 1".to_string(),
            ));
        }
        if !self.click_rotation_step.is_finite() {
            return Err(DiffractometerError::Configuration(
                "click_rotation_step must be a finite angle".to_string(),
            ));
        }
        if self.automatic_attempts == 0 {
            return Err(DiffractometerError::Configuration(
                "automatic_attempts must be at least 1".to_string(),
            ));
        }
        if self.ready_poll_interval_ms == 0 || self.ready_poll_interval_ms > self.move_timeout_ms {
            return Err(DiffractometerError::Configuration(format!(
                "ready_poll_interval_ms must be in 1..={}",
                self.move_timeout_ms
            )));
        }
        if let Some(scale) = self.pixels_per_mm {
            if scale.x <= 0.0 || scale.y <= 0.0 {
                return Err(DiffractometerError::Configuration(
                    "pixels_per_mm must be positive".to_string(),
                ));
            }
        }
        if self.command_channel_capacity == 0 || self.event_channel_capacity == 0 {
            return Err(DiffractometerError::Configuration(
                "channel capacities must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// True when a plate holder is mounted.
    pub fn in_plate_mode(&self) -> bool {
        self.head_type == HeadType::Plate
    }

    /// Readiness bound for motor moves.
    pub fn move_timeout(&self) -> Duration {
        Duration::from_millis(self.move_timeout_ms)
    }

    /// Readiness polling interval.
    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    /// Bound on a single click wait, if configured.
    pub fn user_click_timeout(&self) -> Option<Duration> {
        self.user_click_timeout_ms.map(Duration::from_millis)
    }

    /// True if `name` is one of the configured motor roles.
    pub fn is_configured_motor(&self, name: &str) -> bool {
        self.used_motors.iter().any(|motor| motor == name)
    }
}
