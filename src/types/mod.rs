//! Core data types for the LifeGuard node.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Blood groups offered by the registration form
pub const BLOOD_GROUPS: [&str; 8] = ["A+", "A-", "B+", "B-", "O+", "O-", "AB+", "AB-"];

/// Registered driver profile. Fixed once registration completes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub name: String,
    pub mobile: String,
    pub vehicle_number: String,
    pub age: u32,
    pub blood_group: String,
    #[serde(default)]
    pub address: String,
    /// Family member's phone number
    pub emergency_contact: String,
}

impl Profile {
    /// Check the fields the registration form marks as required.
    /// Returns the name of the first offending field.
    pub fn validate(&self) -> Result<(), String> {
        let required = [
            ("name", &self.name),
            ("mobile", &self.mobile),
            ("vehicleNumber", &self.vehicle_number),
            ("emergencyContact", &self.emergency_contact),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(format!("{} is required", field));
            }
        }
        if self.age == 0 {
            return Err("age must be positive".to_string());
        }
        if !BLOOD_GROUPS.contains(&self.blood_group.as_str()) {
            return Err(format!("unknown blood group '{}'", self.blood_group));
        }
        Ok(())
    }
}

/// Fixed dispatch numbers (configuration, not user data)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyContacts {
    pub ambulance: String,
}

impl Default for EmergencyContacts {
    fn default() -> Self {
        Self {
            ambulance: "+1-555-0199".to_string(),
        }
    }
}

/// A position fix from the location feed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Instantaneous speed in m/s, when the platform reports one
    #[serde(default)]
    pub speed: Option<f64>,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude, speed: None }
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    /// Speed in m/s; unreported speed counts as stationary
    pub fn speed_or_zero(&self) -> f64 {
        self.speed.filter(|s| s.is_finite()).unwrap_or(0.0)
    }
}

/// Raw acceleration-including-gravity payload (m/s²).
/// Any axis may be missing.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AccelerationReading {
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub z: Option<f64>,
}

impl AccelerationReading {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x: Some(x), y: Some(y), z: Some(z) }
    }
}

/// Latest evaluated accelerometer sample
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct KineticSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Vector magnitude in m/s²
    pub magnitude: f64,
    /// Magnitude as a multiple of standard gravity
    pub gforce: f64,
}

/// Per-axis and total g-force captured when an alert cycle starts
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct KineticSnapshot {
    pub gx: f64,
    pub gy: f64,
    pub gz: f64,
    pub total: f64,
}

/// Why an alert cycle was entered
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerReason {
    /// G-force above threshold while moving
    Impact,
    /// Vehicle moved away from the anchor position
    Movement,
}

impl std::fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerReason::Impact => write!(f, "IMPACT"),
            TriggerReason::Movement => write!(f, "MOVEMENT"),
        }
    }
}

/// Everything known at the moment a cycle was triggered
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerContext {
    pub reason: TriggerReason,
    pub snapshot: KineticSnapshot,
    pub position: Option<Position>,
    pub triggered_at: DateTime<Utc>,
}

/// Message recipients
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Recipient {
    Family,
    Ambulance,
}

/// The pair of SMS bodies produced for one alert cycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertMessages {
    pub family: String,
    pub ambulance: String,
}

impl AlertMessages {
    pub fn for_recipient(&self, recipient: Recipient) -> &str {
        match recipient {
            Recipient::Family => &self.family,
            Recipient::Ambulance => &self.ambulance,
        }
    }
}

/// Where a message pair came from. Diagnostic only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageSource {
    Generated,
    Fallback,
}
