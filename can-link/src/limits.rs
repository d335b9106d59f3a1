//! Steering torque limits and signal rate estimation
//!
//! Helpers for controllers that command steering torque over CAN: clamp a
//! requested torque against what the driver is applying and against how fast
//! the command may change, and estimate a signal's rate of change from its
//! rolling counter.

use crate::types::{CanError, Result};
use serde::{Deserialize, Serialize};

/// Torque envelope for one steering command refresh
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SteeringLimits {
    /// Largest torque magnitude, in raw signal units
    pub max: f64,
    /// Largest increase in magnitude per refresh
    pub delta_up: f64,
    /// Largest decrease in magnitude per refresh
    pub delta_down: f64,
    /// Driver torque tolerated before the envelope starts shrinking
    pub driver_allowance: f64,
    pub driver_multiplier: f64,
    /// Scale of the driver torque signal
    pub driver_factor: f64,
}

impl Default for SteeringLimits {
    fn default() -> Self {
        Self {
            max: 2047.0,
            delta_up: 50.0,
            delta_down: 70.0,
            driver_allowance: 60.0,
            driver_multiplier: 50.0,
            driver_factor: 1.0,
        }
    }
}

impl SteeringLimits {
    /// Reject limits that are not finite, or a negative envelope or rate
    ///
    /// `driver_factor` may be negative to flip the driver torque sign.
    pub fn validate(&self) -> Result<()> {
        let bounds = [
            ("max", self.max),
            ("delta_up", self.delta_up),
            ("delta_down", self.delta_down),
            ("driver_allowance", self.driver_allowance),
            ("driver_multiplier", self.driver_multiplier),
        ];
        for (name, value) in bounds {
            if !value.is_finite() || value < 0.0 {
                return Err(CanError::InvalidParameter(format!(
                    "steering limit {} must be finite and non-negative, got {}",
                    name, value
                )));
            }
        }
        if !self.driver_factor.is_finite() {
            return Err(CanError::InvalidParameter(format!(
                "steering limit driver_factor must be finite, got {}",
                self.driver_factor
            )));
        }
        Ok(())
    }

    /// Limit `requested` torque given the previously applied torque and the
    /// measured driver torque
    ///
    /// The driver pushing against the command shrinks the allowed range on
    /// that side. The result then moves at most `delta_up` away from zero and
    /// at most `delta_down` towards it relative to `last`, and is rounded to a
    /// whole raw value. A non-finite input commands zero torque.
    pub fn apply_driver_torque_limits(&self, requested: f64, last: f64, driver_torque: f64) -> f64 {
        if !(requested.is_finite() && last.is_finite() && driver_torque.is_finite()) {
            log::warn!(
                "Non-finite steering input (requested: {}, last: {}, driver: {}), commanding zero torque",
                requested,
                last,
                driver_torque
            );
            return 0.0;
        }

        let driver = driver_torque * self.driver_factor;
        let driver_max = self.max + (self.driver_allowance + driver) * self.driver_multiplier;
        let driver_min = -self.max + (-self.driver_allowance + driver) * self.driver_multiplier;

        let max_allowed = self.max.min(driver_max).max(0.0);
        let min_allowed = (-self.max).max(driver_min).min(0.0);
        let torque = requested.max(min_allowed).min(max_allowed);

        // Not clamp: the bounds cross when the limits are misconfigured
        let torque = if last > 0.0 {
            let lower = (last - self.delta_down).max(-self.delta_up);
            torque.max(lower).min(last + self.delta_up)
        } else {
            let upper = (last + self.delta_down).min(self.delta_up);
            torque.max(last - self.delta_up).min(upper)
        };

        torque.round()
    }
}

/// Rate of change of a periodic CAN signal
///
/// The rate only refreshes when the message counter moves, so repeated
/// frames do not produce a spurious zero.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalRateCalculator {
    frequency: f64,
    previous_counter: i64,
    previous_value: f64,
    rate: f64,
}

impl SignalRateCalculator {
    /// `frequency` is the message rate in Hz
    pub fn new(frequency: f64) -> Self {
        Self {
            frequency,
            previous_counter: 0,
            previous_value: 0.0,
            rate: 0.0,
        }
    }

    pub fn update(&mut self, value: f64, counter: i64) -> f64 {
        if counter != self.previous_counter {
            self.rate = (value - self.previous_value) * self.frequency;
        }
        self.previous_counter = counter;
        self.previous_value = value;
        self.rate
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_ramp_up() {
        let limits = SteeringLimits::default();
        assert_eq!(limits.apply_driver_torque_limits(1000.0, 0.0, 0.0), 50.0);
        assert_eq!(limits.apply_driver_torque_limits(1000.0, 50.0, 0.0), 100.0);
        assert_eq!(limits.apply_driver_torque_limits(-1000.0, 0.0, 0.0), -50.0);
    }

    #[test]
    fn test_ramp_down_is_faster() {
        let limits = SteeringLimits::default();
        assert_eq!(limits.apply_driver_torque_limits(0.0, 500.0, 0.0), 430.0);
        assert_eq!(limits.apply_driver_torque_limits(0.0, -500.0, 0.0), -430.0);
        // Crossing zero is capped by delta_up on the other side
        assert_eq!(limits.apply_driver_torque_limits(-1000.0, 40.0, 0.0), -30.0);
    }

    #[test]
    fn test_driver_override_shrinks_envelope() {
        let limits = SteeringLimits::default();
        // Driver pulling hard the other way leaves no positive torque
        assert_eq!(limits.apply_driver_torque_limits(2000.0, 30.0, -200.0), 0.0);
        // max + (60 - 80) * 50 = 1047
        assert_eq!(limits.apply_driver_torque_limits(2000.0, 1040.0, -80.0), 1047.0);
    }

    #[test]
    fn test_result_is_rounded() {
        let limits = SteeringLimits::default();
        assert_eq!(limits.apply_driver_torque_limits(10.4, 0.0, 0.0), 10.0);
        assert_eq!(limits.apply_driver_torque_limits(10.6, 0.0, 0.0), 11.0);
    }

    #[test]
    fn test_non_finite_input_commands_zero() {
        let limits = SteeringLimits::default();
        assert_eq!(limits.apply_driver_torque_limits(10.0, f64::NAN, 0.0), 0.0);
        assert_eq!(limits.apply_driver_torque_limits(f64::NAN, 10.0, 0.0), 0.0);
        assert_eq!(limits.apply_driver_torque_limits(10.0, 0.0, f64::INFINITY), 0.0);
    }

    #[test]
    fn test_inverted_limits_do_not_panic() {
        let limits = SteeringLimits {
            delta_up: -10.0,
            ..Default::default()
        };
        assert!(limits.validate().is_err());
        let torque = limits.apply_driver_torque_limits(10.0, 0.0, 0.0);
        assert!(torque.is_finite());

        let limits = SteeringLimits {
            max: f64::NAN,
            ..Default::default()
        };
        assert!(limits.validate().is_err());
        assert!(limits.apply_driver_torque_limits(10.0, 0.0, 0.0).is_finite());
    }

    #[test]
    fn test_validate() {
        assert!(SteeringLimits::default().validate().is_ok());
        let flipped = SteeringLimits {
            driver_factor: -1.0,
            ..Default::default()
        };
        assert!(flipped.validate().is_ok());
        let err = SteeringLimits {
            delta_down: -1.0,
            ..Default::default()
        }
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("delta_down"));
    }

    #[test]
    fn test_rate_calculator() {
        let mut calc = SignalRateCalculator::new(50.0);
        assert_eq!(calc.update(1.0, 1), 50.0);
        // Same counter: rate held
        assert_eq!(calc.update(3.0, 1), 50.0);
        assert_eq!(calc.update(4.0, 2), 50.0);
        assert_eq!(calc.update(3.0, 3), -50.0);
        assert_eq!(calc.rate(), -50.0);
    }

    #[test]
    fn test_rate_calculator_first_counter_zero() {
        let mut calc = SignalRateCalculator::new(100.0);
        assert_eq!(calc.update(5.0, 0), 0.0);
    }
}
