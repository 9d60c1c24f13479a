//! Version responses returned during pairing.
//!
//! The same block type answers both pairing commands, in two shapes:
//! the assign-address reply carries receiver gain and RSSI, while the
//! setup-pod reply instead reports the delivery constants baked into the
//! firmware. Pairing checks the reported constants against
//! [`crate::constants`] before any dose math is trusted.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::status::PodProgressStatus;

/// A three-part firmware version, e.g. `2.7.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Patch version.
    pub patch: u8,
}

impl FirmwareVersion {
    /// Build from parts.
    pub fn new(major: u8, minor: u8, patch: u8) -> FirmwareVersion {
        FirmwareVersion { major, minor, patch }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Receiver quality measured by the pod during address assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalQuality {
    /// 2-bit receiver gain; 0 is maximum gain.
    pub gain: u8,
    /// 6-bit received signal strength.
    pub rssi: u8,
}

/// Delivery constants reported in the setup-pod version response.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PodConstants {
    /// Units per motor pulse.
    pub pulse_size: f64,
    /// Seconds per bolus pulse.
    pub seconds_per_bolus_pulse: f64,
    /// Seconds per prime pulse.
    pub seconds_per_prime_pulse: f64,
    /// Units consumed by the prime bolus.
    pub prime_units: f64,
    /// Units consumed by cannula insertion.
    pub cannula_insertion_units: f64,
    /// Maximum pod service time.
    pub service_duration: Duration,
}

impl PodConstants {
    /// The values every stock Eros pod reports.
    pub const NOMINAL: PodConstants = PodConstants {
        pulse_size: constants::PULSE_SIZE,
        seconds_per_bolus_pulse: constants::SECONDS_PER_BOLUS_PULSE,
        seconds_per_prime_pulse: constants::SECONDS_PER_PRIME_PULSE,
        prime_units: constants::PRIME_UNITS,
        cannula_insertion_units: constants::CANNULA_INSERTION_UNITS,
        service_duration: constants::SERVICE_DURATION,
    };

    /// Whether the reported constants match [`PodConstants::NOMINAL`].
    pub fn is_nominal(&self) -> bool {
        *self == PodConstants::NOMINAL
    }
}

/// Pod identity block returned by both pairing commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionResponse {
    /// PM processor firmware version.
    pub pm_version: FirmwareVersion,
    /// PI processor firmware version.
    pub pi_version: FirmwareVersion,
    /// Product identifier; 0x02 for Eros.
    pub product_id: u8,
    /// Pod lot number.
    pub lot: u32,
    /// Pod serial within the lot.
    pub tid: u32,
    /// Radio address the pod accepted.
    pub address: u32,
    /// Lifecycle stage at the time of the response.
    pub pod_progress_status: PodProgressStatus,
    /// Present only in the assign-address shape.
    pub signal_quality: Option<SignalQuality>,
    /// Present only in the setup-pod shape.
    pub pod_constants: Option<PodConstants>,
}

impl VersionResponse {
    /// Whether this is the shape that answers assign-address.
    pub fn is_assign_address_response(&self) -> bool {
        self.signal_quality.is_some()
    }

    /// Whether this is the shape that answers setup-pod.
    pub fn is_setup_pod_response(&self) -> bool {
        self.pod_constants.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_response() -> VersionResponse {
        VersionResponse {
            pm_version: FirmwareVersion::new(2, 7, 0),
            pi_version: FirmwareVersion::new(2, 7, 0),
            product_id: 0x02,
            lot: 43620,
            tid: 560313,
            address: 0x1F0B_3557,
            pod_progress_status: PodProgressStatus::ReminderInitialized,
            signal_quality: None,
            pod_constants: None,
        }
    }

    #[test]
    fn firmware_version_display() {
        assert_eq!(FirmwareVersion::new(2, 7, 0).to_string(), "2.7.0");
    }

    #[test]
    fn response_shape_predicates() {
        let mut response = base_response();
        assert!(!response.is_assign_address_response());
        assert!(!response.is_setup_pod_response());

        response.signal_quality = Some(SignalQuality { gain: 0, rssi: 45 });
        assert!(response.is_assign_address_response());

        let mut setup = base_response();
        setup.pod_constants = Some(PodConstants::NOMINAL);
        assert!(setup.is_setup_pod_response());
        assert!(!setup.is_assign_address_response());
    }

    #[test]
    fn nominal_constants_round_trip() {
        assert!(PodConstants::NOMINAL.is_nominal());

        let mut off = PodConstants::NOMINAL;
        off.prime_units = 2.0;
        assert!(!off.is_nominal());

        let mut short_life = PodConstants::NOMINAL;
        short_life.service_duration = Duration::from_secs(60 * 60);
        assert!(!short_life.is_nominal());
    }
}
