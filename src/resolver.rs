//! Click-point resolution: screen pixels to motor targets.
//!
//! A [`ClickPointResolver`] turns a pixel coordinate picked on the sample image into a
//! [`MotorPositionMap`]. The conversion depends on the geometry of each diffractometer
//! model, so it is an extension point: the orchestrator only relies on the contract
//! below, and [`ReferenceResolver`] is a planar implementation good enough for a
//! single-axis goniometer and for tests.
//!
//! # Contract
//!
//! - Every installed motor of the configured set gets a target.
//! - The `beam_x`/`beam_y` pseudo-motors are always present, computed as
//!   `(beam_position - zoom_centre) / pixels_per_mm` per axis.
//! - Missing calibration (no pixel scale, no beam position, no zoom centre) fails with
//!   [`DiffractometerError::CalibrationUnavailable`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{AppResult, DiffractometerError};
use crate::motion::MotorPositionMap;

/// Pseudo-motor name for the horizontal beam offset.
pub const BEAM_X: &str = "beam_x";
/// Pseudo-motor name for the vertical beam offset.
pub const BEAM_Y: &str = "beam_y";

/// A point on the sample image, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelPoint {
    /// Horizontal coordinate.
    pub x: f64,
    /// Vertical coordinate.
    pub y: f64,
}

impl PixelPoint {
    /// Construct a pixel point.
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A user (or loop-finder) pick together with the rotation angle it was taken at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClickPoint {
    /// Picked pixel.
    pub point: PixelPoint,
    /// Rotation (`phi`) position when the pick was made, if known.
    pub phi: Option<f64>,
}

/// Pixel-to-physical calibration owned by the diffractometer.
///
/// Only the centring actor mutates this; the resolver receives a borrowed view.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationState {
    /// Beam reference position on screen.
    pub beam_position: Option<PixelPoint>,
    /// Pixels per millimetre along x and y.
    pub pixels_per_mm: Option<(f64, f64)>,
    /// Screen point the zoom converges on.
    pub zoom_centre: Option<PixelPoint>,
}

impl CalibrationState {
    fn scale(&self) -> AppResult<(f64, f64)> {
        match self.pixels_per_mm {
            Some((x, y)) if x > 0.0 && y > 0.0 => Ok((x, y)),
            Some(_) => Err(DiffractometerError::CalibrationUnavailable(
                "pixels_per_mm must be positive".to_string(),
            )),
            None => Err(DiffractometerError::CalibrationUnavailable(
                "pixels_per_mm is not set".to_string(),
            )),
        }
    }

    fn beam(&self) -> AppResult<PixelPoint> {
        self.beam_position.ok_or_else(|| {
            DiffractometerError::CalibrationUnavailable("beam position is not known".to_string())
        })
    }

    fn zoom(&self) -> AppResult<PixelPoint> {
        self.zoom_centre.ok_or_else(|| {
            DiffractometerError::CalibrationUnavailable("zoom centre is not known".to_string())
        })
    }

    /// The `beam_x`/`beam_y` pseudo-motor values in millimetres.
    pub fn beam_offsets(&self) -> AppResult<(f64, f64)> {
        let (ppmm_x, ppmm_y) = self.scale()?;
        let beam = self.beam()?;
        let zoom = self.zoom()?;
        Ok((
            (beam.x - zoom.x) / ppmm_x,
            (beam.y - zoom.y) / ppmm_y,
        ))
    }

    /// Add the pseudo-motor values to a named position map.
    pub fn insert_beam_offsets(&self, positions: &mut BTreeMap<String, f64>) -> AppResult<()> {
        let (beam_x, beam_y) = self.beam_offsets()?;
        positions.insert(BEAM_X.to_string(), beam_x);
        positions.insert(BEAM_Y.to_string(), beam_y);
        Ok(())
    }
}

/// Converts picked pixels into motor targets for one diffractometer model.
pub trait ClickPointResolver: Send + Sync {
    /// Resolve a single pixel coordinate.
    ///
    /// `rotation` overrides the target of the rotation axis. `current` holds the
    /// positions of every installed motor, by name.
    fn resolve_from_pixel(
        &self,
        point: PixelPoint,
        rotation: Option<f64>,
        calibration: &CalibrationState,
        current: &BTreeMap<String, f64>,
    ) -> AppResult<MotorPositionMap>;

    /// Resolve a set of picks collected by a multi-point procedure.
    ///
    /// The default averages the picks and resolves the mean at the rotation of the
    /// last pick. Models able to reconstruct a 3-D point override this.
    fn resolve_from_clicks(
        &self,
        clicks: &[ClickPoint],
        calibration: &CalibrationState,
        current: &BTreeMap<String, f64>,
    ) -> AppResult<MotorPositionMap> {
        let Some(last) = clicks.last() else {
            return Err(DiffractometerError::Procedure(
                "no points were collected".to_string(),
            ));
        };
        let n = clicks.len() as f64;
        let mean = PixelPoint::new(
            clicks.iter().map(|c| c.point.x).sum::<f64>() / n,
            clicks.iter().map(|c| c.point.y).sum::<f64>() / n,
        );
        self.resolve_from_pixel(mean, last.phi, calibration, current)
    }
}

/// Planar resolver for a goniometer with one rotation axis.
///
/// A horizontal screen offset maps onto the axis parallel to the rotation axis. A
/// vertical offset is split over the two centring-table axes according to the
/// rotation angle. All other installed motors keep their current position.
#[derive(Debug, Clone)]
pub struct ReferenceResolver {
    rotation_axis: String,
    horizontal_axis: String,
    table_axes: (String, String),
    reversing_rotation: bool,
}

impl Default for ReferenceResolver {
    fn default() -> Self {
        Self {
            rotation_axis: "phi".to_string(),
            horizontal_axis: "phiy".to_string(),
            table_axes: ("sampx".to_string(), "sampy".to_string()),
            reversing_rotation: false,
        }
    }
}

impl ReferenceResolver {
    /// Resolver with the default MD2-style axis names.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the sense of the rotation axis.
    pub fn with_reversing_rotation(mut self, reversing: bool) -> Self {
        self.reversing_rotation = reversing;
        self
    }

    /// Use different axis names.
    pub fn with_axes(
        mut self,
        rotation: impl Into<String>,
        horizontal: impl Into<String>,
        table: (impl Into<String>, impl Into<String>),
    ) -> Self {
        self.rotation_axis = rotation.into();
        self.horizontal_axis = horizontal.into();
        self.table_axes = (table.0.into(), table.1.into());
        self
    }
}

impl ClickPointResolver for ReferenceResolver {
    fn resolve_from_pixel(
        &self,
        point: PixelPoint,
        rotation: Option<f64>,
        calibration: &CalibrationState,
        current: &BTreeMap<String, f64>,
    ) -> AppResult<MotorPositionMap> {
        let (ppmm_x, ppmm_y) = calibration.scale()?;
        let beam = calibration.beam()?;
        let (beam_x, beam_y) = calibration.beam_offsets()?;

        let dx_mm = (point.x - beam.x) / ppmm_x;
        let dy_mm = (point.y - beam.y) / ppmm_y;

        let phi = rotation
            .or_else(|| current.get(&self.rotation_axis).copied())
            .unwrap_or(0.0);
        let sense = if self.reversing_rotation { -1.0 } else { 1.0 };
        let angle = (sense * phi).to_radians();

        let mut targets: BTreeMap<String, f64> = current
            .iter()
            .filter(|(name, _)| name.as_str() != BEAM_X && name.as_str() != BEAM_Y)
            .map(|(name, value)| (name.clone(), *value))
            .collect();

        if let Some(value) = targets.get_mut(&self.horizontal_axis) {
            *value -= dx_mm;
        }
        if let Some(value) = targets.get_mut(&self.table_axes.0) {
            *value -= dy_mm * angle.sin();
        }
        if let Some(value) = targets.get_mut(&self.table_axes.1) {
            *value += dy_mm * angle.cos();
        }
        if rotation.is_some() {
            targets.insert(self.rotation_axis.clone(), phi);
        }

        targets.insert(BEAM_X.to_string(), beam_x);
        targets.insert(BEAM_Y.to_string(), beam_y);
        Ok(targets.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calibration() -> CalibrationState {
        CalibrationState {
            beam_position: Some(PixelPoint::new(100.0, 50.0)),
            pixels_per_mm: Some((2.0, 2.0)),
            zoom_centre: Some(PixelPoint::new(100.0, 50.0)),
        }
    }

    fn current() -> BTreeMap<String, f64> {
        [("phi", 0.0), ("phiy", 1.0), ("sampx", 0.5), ("sampy", -0.5)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn test_click_on_beam_keeps_positions() {
        let resolver = ReferenceResolver::new();
        let map = resolver
            .resolve_from_pixel(PixelPoint::new(100.0, 50.0), None, &calibration(), &current())
            .unwrap()
            .to_named();
        assert_eq!(map["phiy"], 1.0);
        assert_eq!(map["sampx"], 0.5);
        assert_eq!(map["sampy"], -0.5);
        assert_eq!(map[BEAM_X], 0.0);
        assert_eq!(map[BEAM_Y], 0.0);
        // phi untouched without an override
        assert_eq!(map["phi"], 0.0);
    }

    #[test]
    fn test_offsets_follow_rotation() {
        let resolver = ReferenceResolver::new();
        let map = resolver
            .resolve_from_pixel(
                PixelPoint::new(104.0, 54.0),
                Some(90.0),
                &calibration(),
                &current(),
            )
            .unwrap()
            .to_named();
        // 4 px at 2 px/mm = 2 mm
        assert!((map["phiy"] - (1.0 - 2.0)).abs() < 1e-9);
        assert!((map["sampx"] - (0.5 - 2.0)).abs() < 1e-9);
        assert!((map["sampy"] - -0.5).abs() < 1e-9);
        assert_eq!(map["phi"], 90.0);
    }

    #[test]
    fn test_missing_scale_is_calibration_error() {
        let resolver = ReferenceResolver::new();
        let calibration = CalibrationState {
            pixels_per_mm: None,
            ..calibration()
        };
        let err = resolver
            .resolve_from_pixel(PixelPoint::new(0.0, 0.0), None, &calibration, &current())
            .unwrap_err();
        assert!(matches!(err, DiffractometerError::CalibrationUnavailable(_)));
    }

    #[test]
    fn test_beam_offsets() {
        let calibration = CalibrationState {
            beam_position: Some(PixelPoint::new(110.0, 40.0)),
            pixels_per_mm: Some((2.0, 4.0)),
            zoom_centre: Some(PixelPoint::new(100.0, 50.0)),
        };
        assert_eq!(calibration.beam_offsets().unwrap(), (5.0, -2.5));
    }

    #[test]
    fn test_resolve_from_clicks_averages() {
        let resolver = ReferenceResolver::new();
        let clicks = [
            ClickPoint {
                point: PixelPoint::new(98.0, 50.0),
                phi: Some(0.0),
            },
            ClickPoint {
                point: PixelPoint::new(102.0, 50.0),
                phi: Some(0.0),
            },
        ];
        let map = resolver
            .resolve_from_clicks(&clicks, &calibration(), &current())
            .unwrap()
            .to_named();
        assert_eq!(map["phiy"], 1.0);
    }

    #[test]
    fn test_resolve_from_no_clicks_fails() {
        let resolver = ReferenceResolver::new();
        assert!(resolver
            .resolve_from_clicks(&[], &calibration(), &current())
            .is_err());
    }
}
