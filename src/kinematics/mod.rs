//! Kinematics evaluation: impact magnitude and displacement from anchor.
//!
//! Pure functions, no state. Absent axis readings count as zero and an
//! unset position yields zero displacement.

use crate::types::{AccelerationReading, KineticSample, KineticSnapshot, Position};

/// Standard gravity (m/s²)
pub const STANDARD_GRAVITY: f64 = 9.81;

/// Mean Earth radius used by the haversine formula (m)
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Total acceleration magnitude (m/s²) and its g-force ratio
pub fn compute_magnitude(ax: f64, ay: f64, az: f64) -> (f64, f64) {
    let total = (ax * ax + ay * ay + az * az).sqrt();
    (total, total / STANDARD_GRAVITY)
}

/// Evaluate a raw sensor reading into a sample
pub fn evaluate(reading: &AccelerationReading) -> KineticSample {
    let x = reading.x.unwrap_or(0.0);
    let y = reading.y.unwrap_or(0.0);
    let z = reading.z.unwrap_or(0.0);
    let (magnitude, gforce) = compute_magnitude(x, y, z);

    KineticSample { x, y, z, magnitude, gforce }
}

/// Per-axis g-force breakdown of a sample
pub fn snapshot(sample: &KineticSample) -> KineticSnapshot {
    KineticSnapshot {
        gx: sample.x / STANDARD_GRAVITY,
        gy: sample.y / STANDARD_GRAVITY,
        gz: sample.z / STANDARD_GRAVITY,
        total: sample.gforce,
    }
}

/// Great-circle distance between two fixes in meters
pub fn haversine_m(a: &Position, b: &Position) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    // Rounding can push h a hair outside [0, 1]
    let c = 2.0 * h.clamp(0.0, 1.0).sqrt().asin();
    EARTH_RADIUS_M * c
}

/// Displacement from the anchor. Zero when either fix is missing.
pub fn compute_displacement(anchor: Option<&Position>, current: Option<&Position>) -> f64 {
    match (anchor, current) {
        (Some(a), Some(c)) => haversine_m(a, c),
        _ => 0.0,
    }
}
