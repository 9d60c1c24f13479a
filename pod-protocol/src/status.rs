//! Pod status reporting: progress stage, delivery state, and the 0x1D
//! status response every dosing command answers with.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::alerts::AlertSet;

/// Lifecycle stage reported by the pod firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum PodProgressStatus {
    /// Factory fresh.
    Initialized = 0,
    /// Pod memory initialized.
    MemoryInitialized = 1,
    /// Pairing reminder armed.
    ReminderInitialized = 2,
    /// Setup-pod accepted, pod is paired.
    PairingCompleted = 3,
    /// Prime bolus running.
    Priming = 4,
    /// Prime finished.
    PrimingCompleted = 5,
    /// Initial basal schedule programmed.
    BasalInitialized = 6,
    /// Cannula insertion bolus running.
    InsertingCannula = 7,
    /// Delivering, more than 50 U in the reservoir.
    AboveFiftyUnits = 8,
    /// Delivering, 50 U or less in the reservoir.
    FiftyOrLessUnits = 9,
    /// Unused firmware stage.
    OneNotUsed = 10,
    /// Unused firmware stage.
    TwoNotUsed = 11,
    /// Unused firmware stage.
    ThreeNotUsed = 12,
    /// A fault has latched; delivery halted.
    FaultEventOccurred = 13,
    /// Setup did not finish inside the activation window.
    ActivationTimeExceeded = 14,
    /// Pod deactivated.
    Inactive = 15,
}

impl PodProgressStatus {
    /// Whether the pod is in a normal insulin-delivering stage.
    pub fn ready_for_delivery(self) -> bool {
        matches!(
            self,
            PodProgressStatus::AboveFiftyUnits | PodProgressStatus::FiftyOrLessUnits
        )
    }
}

impl fmt::Display for PodProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PodProgressStatus::Initialized => "initialized",
            PodProgressStatus::MemoryInitialized => "memory initialized",
            PodProgressStatus::ReminderInitialized => "reminder initialized",
            PodProgressStatus::PairingCompleted => "pairing completed",
            PodProgressStatus::Priming => "priming",
            PodProgressStatus::PrimingCompleted => "priming completed",
            PodProgressStatus::BasalInitialized => "basal initialized",
            PodProgressStatus::InsertingCannula => "inserting cannula",
            PodProgressStatus::AboveFiftyUnits => "running above 50 U",
            PodProgressStatus::FiftyOrLessUnits => "running at 50 U or less",
            PodProgressStatus::OneNotUsed => "unused state 10",
            PodProgressStatus::TwoNotUsed => "unused state 11",
            PodProgressStatus::ThreeNotUsed => "unused state 12",
            PodProgressStatus::FaultEventOccurred => "fault event occurred",
            PodProgressStatus::ActivationTimeExceeded => "activation time exceeded",
            PodProgressStatus::Inactive => "inactive",
        };
        f.write_str(text)
    }
}

/// What the pod is currently delivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeliveryStatus {
    /// Nothing running; delivery suspended.
    Suspended = 0,
    /// Scheduled basal running.
    ScheduledBasal = 1,
    /// Temp basal running over the schedule.
    TempBasalRunning = 2,
    /// Prime or insertion bolus running.
    Priming = 4,
    /// Immediate bolus running over basal.
    BolusInProgress = 5,
    /// Immediate bolus and temp basal both running.
    BolusAndTempBasal = 6,
    /// Extended bolus running while suspended.
    ExtendedBolusWhileSuspended = 8,
    /// Extended bolus running over basal.
    ExtendedBolusRunning = 9,
    /// Extended bolus and temp basal both running.
    ExtendedBolusAndTempBasal = 10,
}

impl DeliveryStatus {
    /// Whether basal delivery is suspended.
    pub fn suspended(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Suspended
                | DeliveryStatus::Priming
                | DeliveryStatus::ExtendedBolusWhileSuspended
        )
    }

    /// Whether any bolus is in progress.
    pub fn bolusing(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Priming
                | DeliveryStatus::BolusInProgress
                | DeliveryStatus::BolusAndTempBasal
                | DeliveryStatus::ExtendedBolusWhileSuspended
                | DeliveryStatus::ExtendedBolusRunning
                | DeliveryStatus::ExtendedBolusAndTempBasal
        )
    }

    /// Whether a temp basal is in progress.
    pub fn temp_basal_running(self) -> bool {
        matches!(
            self,
            DeliveryStatus::TempBasalRunning
                | DeliveryStatus::BolusAndTempBasal
                | DeliveryStatus::ExtendedBolusAndTempBasal
        )
    }
}

/// The pod's regular status report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Current delivery state.
    pub delivery_status: DeliveryStatus,
    /// Current lifecycle stage.
    pub pod_progress_status: PodProgressStatus,
    /// Pod clock: whole minutes since activation.
    pub time_active: Duration,
    /// Reservoir reading; `None` while above the 50 U threshold.
    pub reservoir_level: Option<f64>,
    /// Lifetime insulin delivered, in units, including setup boluses.
    pub insulin_delivered: f64,
    /// Units of the current or last bolus not yet delivered.
    pub bolus_not_delivered: f64,
    /// Low nibble of the sequence number of the last programming command
    /// the pod accepted.
    pub last_programming_message_seq_num: u8,
    /// Alert slots currently firing.
    pub alerts: AlertSet,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_for_delivery_stages() {
        assert!(PodProgressStatus::AboveFiftyUnits.ready_for_delivery());
        assert!(PodProgressStatus::FiftyOrLessUnits.ready_for_delivery());
        assert!(!PodProgressStatus::Priming.ready_for_delivery());
        assert!(!PodProgressStatus::FaultEventOccurred.ready_for_delivery());
    }

    #[test]
    fn progress_stages_are_ordered() {
        assert!(PodProgressStatus::PairingCompleted < PodProgressStatus::Priming);
        assert!(PodProgressStatus::PrimingCompleted < PodProgressStatus::BasalInitialized);
        assert!(PodProgressStatus::InsertingCannula < PodProgressStatus::AboveFiftyUnits);
    }

    #[test]
    fn delivery_status_predicates() {
        assert!(DeliveryStatus::Suspended.suspended());
        assert!(DeliveryStatus::Priming.suspended());
        assert!(DeliveryStatus::Priming.bolusing());
        assert!(!DeliveryStatus::ScheduledBasal.suspended());
        assert!(DeliveryStatus::BolusAndTempBasal.bolusing());
        assert!(DeliveryStatus::BolusAndTempBasal.temp_basal_running());
        assert!(!DeliveryStatus::BolusInProgress.temp_basal_running());
        assert!(DeliveryStatus::ExtendedBolusWhileSuspended.suspended());
    }
}
