//! Trigger policy: decides when the latest reading amounts to an accident.
//!
//! Two independent conditions, evaluated while the alert machine is idle:
//! - IMPACT: g-force strictly above the threshold, gated by a minimum speed
//!   so a phone dropped in a parked car does not raise an alert
//! - MOVEMENT: displacement from the anchor strictly above a fixed distance

use thiserror::Error;
use tracing::{debug, info};

use crate::types::TriggerReason;

#[derive(Error, Debug, PartialEq)]
pub enum DetectionError {
    #[error("G-force threshold {value} outside allowed range [{min}, {max}]")]
    ThresholdOutOfRange { value: f64, min: f64, max: f64 },
}

/// Configuration for the trigger policy
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    /// Impact threshold in g (operator adjustable)
    pub gforce_threshold: f64,
    /// Lowest threshold an operator may select
    pub min_gforce_threshold: f64,
    /// Highest threshold an operator may select
    pub max_gforce_threshold: f64,
    /// Impact is ignored below this speed (m/s)
    pub min_speed_mps: f64,
    /// Movement alert distance from anchor (m)
    pub movement_threshold_m: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            gforce_threshold: 3.5,
            min_gforce_threshold: 1.0,
            max_gforce_threshold: 8.0,
            // 15 km/h
            min_speed_mps: 15.0 / 3.6,
            // ~200 ft
            movement_threshold_m: 61.0,
        }
    }
}

/// Holds the latest g-force and speed and applies the trigger rules
#[derive(Debug, Clone)]
pub struct TriggerPolicy {
    config: DetectionConfig,
    current_gforce: f64,
    current_speed: f64,
}

impl TriggerPolicy {
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            config,
            current_gforce: 0.0,
            current_speed: 0.0,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.config.gforce_threshold
    }

    pub fn current_gforce(&self) -> f64 {
        self.current_gforce
    }

    pub fn current_speed(&self) -> f64 {
        self.current_speed
    }

    /// Adjust the impact threshold. Out-of-range values leave it unchanged.
    pub fn set_threshold(&mut self, value: f64) -> Result<(), DetectionError> {
        let (min, max) = (self.config.min_gforce_threshold, self.config.max_gforce_threshold);
        if !value.is_finite() || value < min || value > max {
            return Err(DetectionError::ThresholdOutOfRange { value, min, max });
        }
        info!("🎚️  Impact threshold set to {:.2}g", value);
        self.config.gforce_threshold = value;
        Ok(())
    }

    pub fn record_gforce(&mut self, gforce: f64) {
        self.current_gforce = if gforce.is_finite() { gforce } else { 0.0 };
    }

    /// Forget the recorded g-force once an alert cycle has used it
    pub fn clear_impact(&mut self) {
        self.current_gforce = 0.0;
    }

    pub fn record_speed(&mut self, speed: f64) {
        self.current_speed = if speed.is_finite() { speed.max(0.0) } else { 0.0 };
    }

    /// IMPACT rule: `gforce > threshold && speed >= min_speed`
    pub fn impact_detected(&self) -> bool {
        let over = self.current_gforce > self.config.gforce_threshold;
        if over && self.current_speed < self.config.min_speed_mps {
            debug!(
                "Impact {:.2}g suppressed: speed {:.2} m/s below gate",
                self.current_gforce, self.current_speed
            );
            return false;
        }
        over
    }

    /// MOVEMENT rule: `displacement > movement_threshold`
    pub fn movement_detected(&self, displacement_m: f64) -> bool {
        displacement_m.is_finite() && displacement_m > self.config.movement_threshold_m
    }

    /// Evaluate both rules. Impact is checked first; only one reason is returned.
    pub fn evaluate(&self, displacement_m: f64) -> Option<TriggerReason> {
        if self.impact_detected() {
            Some(TriggerReason::Impact)
        } else if self.movement_detected(displacement_m) {
            Some(TriggerReason::Movement)
        } else {
            None
        }
    }
}

impl Default for TriggerPolicy {
    fn default() -> Self {
        Self::new(DetectionConfig::default())
    }
}
