//! Hardware constants of the Eros pod.
//!
//! These values are fixed by the pod firmware. The setup-pod version
//! response reports most of them back, and pairing cross-checks the
//! reported values against this module before any dose math is trusted.

use std::time::Duration;

/// Address a factory-fresh pod listens on until pairing assigns it one.
pub const PAIRING_ADDRESS: u32 = 0xFFFF_FFFF;

/// Volume of U100 insulin delivered by one motor pulse, in units.
pub const PULSE_SIZE: f64 = 0.05;

/// Number of motor pulses per unit of insulin.
pub const PULSES_PER_UNIT: f64 = 1.0 / PULSE_SIZE;

/// Seconds between pulses for a regular bolus.
pub const SECONDS_PER_BOLUS_PULSE: f64 = 2.0;

/// Bolus delivery rate, in units per second.
pub const BOLUS_DELIVERY_RATE: f64 = PULSE_SIZE / SECONDS_PER_BOLUS_PULSE;

/// Seconds between pulses while priming or inserting the cannula.
pub const SECONDS_PER_PRIME_PULSE: f64 = 1.0;

/// Prime and cannula-insertion delivery rate, in units per second.
pub const PRIME_DELIVERY_RATE: f64 = PULSE_SIZE / SECONDS_PER_PRIME_PULSE;

/// Units of insulin consumed by the prime bolus.
pub const PRIME_UNITS: f64 = 2.6;

/// Units of insulin consumed by cannula insertion.
pub const CANNULA_INSERTION_UNITS: f64 = 0.5;

/// Additional insertion insulin on top of [`CANNULA_INSERTION_UNITS`].
///
/// Zero for a stock pod; a tuning knob for experimentation.
pub const CANNULA_INSERTION_UNITS_EXTRA: f64 = 0.0;

/// Nominal pod lifetime, after which the expiration alert fires.
pub const NOMINAL_POD_LIFE: Duration = Duration::from_secs(72 * 60 * 60);

/// Maximum pod service time before the firmware shuts the pod down.
pub const SERVICE_DURATION: Duration = Duration::from_secs(80 * 60 * 60);

/// Window before end of service in which the shutdown-imminent alert runs.
pub const END_OF_SERVICE_IMMINENT_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Length of the expiration advisory period following nominal pod life.
pub const EXPIRATION_ADVISORY_WINDOW: Duration = Duration::from_secs(7 * 60 * 60);

/// Largest reservoir level the pod can report. Above this the status
/// carries no reading at all.
pub const MAXIMUM_RESERVOIR_READING: f64 = 50.0;

/// Total reservoir capacity in units.
pub const RESERVOIR_CAPACITY: f64 = 200.0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulse_math_is_consistent() {
        assert_eq!(PULSES_PER_UNIT * PULSE_SIZE, 1.0);
        // Prime and insertion volumes are whole numbers of pulses.
        assert_eq!((PRIME_UNITS * PULSES_PER_UNIT).fract(), 0.0);
        assert_eq!((CANNULA_INSERTION_UNITS * PULSES_PER_UNIT).fract(), 0.0);
    }

    #[test]
    fn service_outlasts_nominal_life() {
        assert!(SERVICE_DURATION > NOMINAL_POD_LIFE);
    }
}
