//! Motor position maps and centred positions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::hardware::Motor;

/// Identifies a motor either by logical name or by direct handle.
///
/// Keys compare by motor name, so `Name("phi")` and a handle whose `name()` is
/// `"phi"` address the same entry in a [`MotorPositionMap`].
#[derive(Clone)]
pub enum MotorKey {
    /// Logical motor role, resolved against the installed motor set.
    Name(String),
    /// Direct reference; moved even if it is not part of the installed set.
    Handle(Arc<dyn Motor>),
}

impl MotorKey {
    /// Logical motor name.
    pub fn name(&self) -> &str {
        match self {
            MotorKey::Name(name) => name,
            MotorKey::Handle(motor) => motor.name(),
        }
    }
}

impl fmt::Debug for MotorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotorKey::Name(name) => f.debug_tuple("Name").field(name).finish(),
            MotorKey::Handle(motor) => f.debug_tuple("Handle").field(&motor.name()).finish(),
        }
    }
}

impl PartialEq for MotorKey {
    fn eq(&self, other: &Self) -> bool {
        self.name() == other.name()
    }
}

impl From<&str> for MotorKey {
    fn from(name: &str) -> Self {
        MotorKey::Name(name.to_string())
    }
}

impl From<String> for MotorKey {
    fn from(name: String) -> Self {
        MotorKey::Name(name)
    }
}

impl From<Arc<dyn Motor>> for MotorKey {
    fn from(motor: Arc<dyn Motor>) -> Self {
        MotorKey::Handle(motor)
    }
}

/// Target positions keyed by motor. Order is irrelevant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MotorPositionMap {
    entries: Vec<(MotorKey, f64)>,
}

impl MotorPositionMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the target for a motor, replacing any previous target for it.
    pub fn insert(&mut self, key: impl Into<MotorKey>, value: f64) {
        let key = key.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Target for the named motor, if any.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(key, _)| key.name() == name)
            .map(|(_, value)| *value)
    }

    /// Iterate over (key, target) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&MotorKey, f64)> {
        self.entries.iter().map(|(key, value)| (key, *value))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when there is nothing to move.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Convert to a name-keyed map.
    pub fn to_named(&self) -> BTreeMap<String, f64> {
        self.entries
            .iter()
            .map(|(key, value)| (key.name().to_string(), *value))
            .collect()
    }
}

impl From<BTreeMap<String, f64>> for MotorPositionMap {
    fn from(map: BTreeMap<String, f64>) -> Self {
        map.into_iter().collect()
    }
}

impl<K: Into<MotorKey>> FromIterator<(K, f64)> for MotorPositionMap {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        let mut map = MotorPositionMap::new();
        for (key, value) in iter {
            map.insert(key, value);
        }
        map
    }
}

/// A centred sample position in goniometer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CentredPosition {
    /// Centring table x.
    pub sampx: f64,
    /// Centring table y.
    pub sampy: f64,
    /// Rotation angle, normalised to [0, 360).
    pub phi: f64,
    /// Alignment z.
    pub phiz: f64,
    /// Alignment y.
    pub phiy: f64,
    /// Zoom level.
    pub zoom: f64,
}

impl CentredPosition {
    /// Build from a named motor map. Missing motors default to zero.
    pub fn from_motors(motors: &BTreeMap<String, f64>) -> Self {
        let get = |name: &str| motors.get(name).copied().unwrap_or_default();
        Self {
            sampx: get("sampx"),
            sampy: get("sampy"),
            phi: get("phi").rem_euclid(360.0),
            phiz: get("phiz"),
            phiy: get("phiy"),
            zoom: get("zoom"),
        }
    }

    /// Named motor map for this position.
    pub fn as_map(&self) -> BTreeMap<String, f64> {
        [
            ("sampx", self.sampx),
            ("sampy", self.sampy),
            ("phi", self.phi),
            ("phiz", self.phiz),
            ("phiy", self.phiy),
            ("zoom", self.zoom),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
    }
}

/// Position of frame `frame` of `total` on a helical line between two points.
///
/// Each frame is placed at the middle of its slice of the line.
pub fn point_between(
    start: &CentredPosition,
    end: &CentredPosition,
    frame: u32,
    total: u32,
) -> BTreeMap<String, f64> {
    let start = start.as_map();
    let end = end.as_map();
    let total = f64::from(total.max(1));
    let fraction = f64::from(frame) / total;

    start
        .iter()
        .map(|(motor, &a)| {
            let b = end.get(motor).copied().unwrap_or(a);
            let value = fraction * (a - b).abs() + a + 0.5 * (b - a) / total;
            (motor.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockMotor;

    #[test]
    fn test_insert_replaces_same_motor() {
        let mut map = MotorPositionMap::new();
        map.insert("phi", 10.0);
        let handle: Arc<dyn Motor> = Arc::new(MockMotor::new("phi"));
        map.insert(handle, 20.0);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("phi"), Some(20.0));
    }

    #[test]
    fn test_named_round_trip_of_names() {
        let map: MotorPositionMap = [("sampx", 1.0), ("sampy", 2.0)].into_iter().collect();
        let named = map.to_named();
        assert_eq!(named.len(), 2);
        assert_eq!(named["sampy"], 2.0);
    }

    #[test]
    fn test_centred_position_wraps_phi() {
        let motors: BTreeMap<String, f64> = [("phi", 370.0), ("sampx", 0.25)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let position = CentredPosition::from_motors(&motors);
        assert_eq!(position.phi, 10.0);
        assert_eq!(position.sampx, 0.25);
        assert_eq!(position.zoom, 0.0);

        let negative = CentredPosition::from_motors(
            &[("phi".to_string(), -90.0)].into_iter().collect(),
        );
        assert_eq!(negative.phi, 270.0);
    }

    #[test]
    fn test_point_between_first_frame() {
        let start = CentredPosition {
            sampx: 0.0,
            ..Default::default()
        };
        let end = CentredPosition {
            sampx: 1.0,
            ..Default::default()
        };
        let point = point_between(&start, &end, 0, 10);
        assert!((point["sampx"] - 0.05).abs() < 1e-12);

        let point = point_between(&start, &end, 5, 10);
        assert!((point["sampx"] - 0.55).abs() < 1e-12);
        assert_eq!(point["phiy"], 0.0);
    }
}
