//! The closed set of message blocks a pod message can carry.
//!
//! Commands flow controller to pod, responses flow back. Six of the
//! commands carry the rolling nonce; [`MessageBlock::nonce`] and
//! [`MessageBlock::set_nonce`] give the session layer uniform access so a
//! nonce resync can rewrite every nonce-bearing block in place.

use std::fmt;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::alerts::{AlertConfiguration, AlertSet, BeepType};
use crate::basal::BasalSchedule;
use crate::fault::FaultEventCode;
use crate::pod_info::{PodInfoResponse, PodInfoType};
use crate::status::{PodProgressStatus, StatusResponse};
use crate::version::VersionResponse;

/// First pairing command: claim a radio address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignAddressCommand {
    /// Address the pod should answer on from now on.
    pub address: u32,
}

/// Second pairing command: confirm identity and set the pod clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupPodCommand {
    /// Address assigned in the first phase.
    pub address: u32,
    /// Wall clock written into the pod.
    pub activation_date: SystemTime,
    /// Pod lot number, echoed back from address assignment.
    pub lot: u32,
    /// Pod serial within the lot, echoed back from address assignment.
    pub tid: u32,
}

/// Status query, optionally for one of the extended records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetStatusCommand {
    /// Which record to return.
    pub pod_info_type: PodInfoType,
}

impl Default for GetStatusCommand {
    fn default() -> Self {
        GetStatusCommand {
            pod_info_type: PodInfoType::Normal,
        }
    }
}

/// Program one or more alert slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigureAlertsCommand {
    /// Rolling nonce.
    pub nonce: u32,
    /// Slot programmings, applied in order.
    pub configurations: Vec<AlertConfiguration>,
}

/// An insulin program: the payload of a set-insulin-schedule command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeliverySchedule {
    /// Program the daily basal schedule, entering it `schedule_offset`
    /// into the day.
    BasalSchedule {
        /// The 24-hour program.
        schedule: BasalSchedule,
        /// Time past midnight at the moment the program starts.
        schedule_offset: Duration,
    },
    /// Run a flat rate for a bounded time in place of the schedule.
    TempBasal {
        /// Rate in units per hour.
        units_per_hour: f64,
        /// How long the temp rate runs.
        duration: Duration,
    },
    /// Deliver a bolus starting now.
    Bolus {
        /// Total units to deliver.
        units: f64,
        /// Pulse spacing; 2 seconds for a normal bolus, 1 second for the
        /// setup boluses.
        time_between_pulses: Duration,
    },
}

/// Start an insulin program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetInsulinScheduleCommand {
    /// Rolling nonce.
    pub nonce: u32,
    /// The program to start.
    pub schedule: DeliverySchedule,
}

/// Clear fired alert slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgeAlertsCommand {
    /// Rolling nonce.
    pub nonce: u32,
    /// Slots to clear.
    pub alerts: AlertSet,
}

/// Which kinds of delivery a cancel command stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryType(u8);

impl DeliveryType {
    /// Stop nothing; used as an authenticated no-op.
    pub const NONE: DeliveryType = DeliveryType(0);
    /// Stop scheduled basal delivery.
    pub const BASAL: DeliveryType = DeliveryType(1 << 0);
    /// Stop a running temp basal.
    pub const TEMP_BASAL: DeliveryType = DeliveryType(1 << 1);
    /// Stop a running bolus.
    pub const BOLUS: DeliveryType = DeliveryType(1 << 2);
    /// Stop everything.
    pub const ALL: DeliveryType = DeliveryType(0b111);

    /// Whether every kind in `other` is also in `self`.
    pub fn contains(self, other: DeliveryType) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Stop one or more kinds of delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelDeliveryCommand {
    /// Rolling nonce.
    pub nonce: u32,
    /// What to stop.
    pub delivery_type: DeliveryType,
    /// Beep to emit on completion.
    pub beep_type: BeepType,
}

/// Permanently retire the pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivatePodCommand {
    /// Rolling nonce.
    pub nonce: u32,
}

/// Write the pod's confirmation beep preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeepConfigCommand {
    /// Beep to emit now, acknowledging the write.
    pub beep_type: BeepType,
    /// Beep when a basal program completes.
    pub basal_completion_beep: bool,
    /// Beep when a temp basal completes.
    pub temp_basal_completion_beep: bool,
    /// Beep when a bolus completes.
    pub bolus_completion_beep: bool,
}

/// Adjust internal fault-detection table entries.
///
/// Setup writes zeroes here to disable the $6x fault window during the
/// prime bolus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultConfigCommand {
    /// Rolling nonce.
    pub nonce: u32,
    /// Table 5 entry 16.
    pub tab5_sub16: u8,
    /// Table 5 entry 17.
    pub tab5_sub17: u8,
}

/// Command rejection returned in place of the expected response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorResponse {
    /// The nonce did not match; carries the key for resynchronization.
    BadNonce {
        /// 16-bit sync word folded into the replacement seed.
        nonce_resync_key: u16,
    },
    /// Any other rejection; resending the same command cannot help.
    Nonretryable {
        /// Raw rejection code.
        code: u8,
        /// Fault code at rejection time, normally no-faults.
        fault_event_code: FaultEventCode,
        /// Lifecycle stage at rejection time.
        pod_progress: PodProgressStatus,
    },
}

/// Discriminant of a [`MessageBlock`], for logs and error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum MessageBlockType {
    AssignAddress,
    SetupPod,
    GetStatus,
    ConfigureAlerts,
    SetInsulinSchedule,
    AcknowledgeAlerts,
    CancelDelivery,
    DeactivatePod,
    BeepConfig,
    FaultConfig,
    ErrorResponse,
    StatusResponse,
    VersionResponse,
    PodInfoResponse,
}

impl fmt::Display for MessageBlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageBlockType::AssignAddress => "assign-address",
            MessageBlockType::SetupPod => "setup-pod",
            MessageBlockType::GetStatus => "get-status",
            MessageBlockType::ConfigureAlerts => "configure-alerts",
            MessageBlockType::SetInsulinSchedule => "set-insulin-schedule",
            MessageBlockType::AcknowledgeAlerts => "acknowledge-alerts",
            MessageBlockType::CancelDelivery => "cancel-delivery",
            MessageBlockType::DeactivatePod => "deactivate-pod",
            MessageBlockType::BeepConfig => "beep-config",
            MessageBlockType::FaultConfig => "fault-config",
            MessageBlockType::ErrorResponse => "error-response",
            MessageBlockType::StatusResponse => "status-response",
            MessageBlockType::VersionResponse => "version-response",
            MessageBlockType::PodInfoResponse => "pod-info-response",
        };
        f.write_str(name)
    }
}

/// Every block that can appear in a pod message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageBlock {
    /// Claim a radio address.
    AssignAddress(AssignAddressCommand),
    /// Confirm identity and set the pod clock.
    SetupPod(SetupPodCommand),
    /// Status or pod-info query.
    GetStatus(GetStatusCommand),
    /// Program alert slots.
    ConfigureAlerts(ConfigureAlertsCommand),
    /// Start an insulin program.
    SetInsulinSchedule(SetInsulinScheduleCommand),
    /// Clear fired alert slots.
    AcknowledgeAlerts(AcknowledgeAlertsCommand),
    /// Stop delivery.
    CancelDelivery(CancelDeliveryCommand),
    /// Permanently retire the pod.
    DeactivatePod(DeactivatePodCommand),
    /// Write beep preferences.
    BeepConfig(BeepConfigCommand),
    /// Adjust fault-detection tables.
    FaultConfig(FaultConfigCommand),
    /// Command rejection.
    ErrorResponse(ErrorResponse),
    /// Regular status report.
    StatusResponse(StatusResponse),
    /// Pairing identity block.
    VersionResponse(VersionResponse),
    /// Extended record report.
    PodInfoResponse(PodInfoResponse),
}

impl MessageBlock {
    /// This block's discriminant.
    pub fn block_type(&self) -> MessageBlockType {
        match self {
            MessageBlock::AssignAddress(_) => MessageBlockType::AssignAddress,
            MessageBlock::SetupPod(_) => MessageBlockType::SetupPod,
            MessageBlock::GetStatus(_) => MessageBlockType::GetStatus,
            MessageBlock::ConfigureAlerts(_) => MessageBlockType::ConfigureAlerts,
            MessageBlock::SetInsulinSchedule(_) => MessageBlockType::SetInsulinSchedule,
            MessageBlock::AcknowledgeAlerts(_) => MessageBlockType::AcknowledgeAlerts,
            MessageBlock::CancelDelivery(_) => MessageBlockType::CancelDelivery,
            MessageBlock::DeactivatePod(_) => MessageBlockType::DeactivatePod,
            MessageBlock::BeepConfig(_) => MessageBlockType::BeepConfig,
            MessageBlock::FaultConfig(_) => MessageBlockType::FaultConfig,
            MessageBlock::ErrorResponse(_) => MessageBlockType::ErrorResponse,
            MessageBlock::StatusResponse(_) => MessageBlockType::StatusResponse,
            MessageBlock::VersionResponse(_) => MessageBlockType::VersionResponse,
            MessageBlock::PodInfoResponse(_) => MessageBlockType::PodInfoResponse,
        }
    }

    /// The rolling nonce this block carries, if it is a nonce block.
    pub fn nonce(&self) -> Option<u32> {
        match self {
            MessageBlock::ConfigureAlerts(c) => Some(c.nonce),
            MessageBlock::SetInsulinSchedule(c) => Some(c.nonce),
            MessageBlock::AcknowledgeAlerts(c) => Some(c.nonce),
            MessageBlock::CancelDelivery(c) => Some(c.nonce),
            MessageBlock::DeactivatePod(c) => Some(c.nonce),
            MessageBlock::FaultConfig(c) => Some(c.nonce),
            _ => None,
        }
    }

    /// Rewrite the nonce in place; no-op for blocks without one.
    pub fn set_nonce(&mut self, nonce: u32) {
        match self {
            MessageBlock::ConfigureAlerts(c) => c.nonce = nonce,
            MessageBlock::SetInsulinSchedule(c) => c.nonce = nonce,
            MessageBlock::AcknowledgeAlerts(c) => c.nonce = nonce,
            MessageBlock::CancelDelivery(c) => c.nonce = nonce,
            MessageBlock::DeactivatePod(c) => c.nonce = nonce,
            MessageBlock::FaultConfig(c) => c.nonce = nonce,
            _ => {}
        }
    }
}

/// Response kinds the session layer can ask an exchange to produce.
///
/// Implemented for the response blocks of the closed union, so callers
/// state the reply type they expect and everything else is handled as a
/// protocol error in one place.
pub trait ExpectedResponse: Sized {
    /// Block type this extractor accepts.
    const BLOCK_TYPE: MessageBlockType;

    /// The payload when `block` is of the expected kind, or the block
    /// handed back unchanged so the caller can classify it.
    fn extract(block: MessageBlock) -> Result<Self, MessageBlock>;
}

impl ExpectedResponse for StatusResponse {
    const BLOCK_TYPE: MessageBlockType = MessageBlockType::StatusResponse;

    fn extract(block: MessageBlock) -> Result<Self, MessageBlock> {
        match block {
            MessageBlock::StatusResponse(response) => Ok(response),
            other => Err(other),
        }
    }
}

impl ExpectedResponse for VersionResponse {
    const BLOCK_TYPE: MessageBlockType = MessageBlockType::VersionResponse;

    fn extract(block: MessageBlock) -> Result<Self, MessageBlock> {
        match block {
            MessageBlock::VersionResponse(response) => Ok(response),
            other => Err(other),
        }
    }
}

impl ExpectedResponse for PodInfoResponse {
    const BLOCK_TYPE: MessageBlockType = MessageBlockType::PodInfoResponse;

    fn extract(block: MessageBlock) -> Result<Self, MessageBlock> {
        match block {
            MessageBlock::PodInfoResponse(response) => Ok(response),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_blocks_expose_their_nonce() {
        let mut blocks = vec![
            MessageBlock::ConfigureAlerts(ConfigureAlertsCommand {
                nonce: 11,
                configurations: vec![],
            }),
            MessageBlock::SetInsulinSchedule(SetInsulinScheduleCommand {
                nonce: 22,
                schedule: DeliverySchedule::Bolus {
                    units: 1.0,
                    time_between_pulses: Duration::from_secs(2),
                },
            }),
            MessageBlock::AcknowledgeAlerts(AcknowledgeAlertsCommand {
                nonce: 33,
                alerts: AlertSet::new(0x80),
            }),
            MessageBlock::CancelDelivery(CancelDeliveryCommand {
                nonce: 44,
                delivery_type: DeliveryType::ALL,
                beep_type: BeepType::NoBeepCancel,
            }),
            MessageBlock::DeactivatePod(DeactivatePodCommand { nonce: 55 }),
            MessageBlock::FaultConfig(FaultConfigCommand {
                nonce: 66,
                tab5_sub16: 0,
                tab5_sub17: 0,
            }),
        ];

        for block in &blocks {
            assert!(block.nonce().is_some());
        }
        for block in &mut blocks {
            block.set_nonce(0xDEAD_BEEF);
            assert_eq!(block.nonce(), Some(0xDEAD_BEEF));
        }
    }

    #[test]
    fn non_nonce_blocks_have_no_nonce() {
        let mut status_query = MessageBlock::GetStatus(GetStatusCommand::default());
        assert_eq!(status_query.nonce(), None);
        status_query.set_nonce(1);
        assert_eq!(status_query.nonce(), None);

        let beep = MessageBlock::BeepConfig(BeepConfigCommand {
            beep_type: BeepType::BipBip,
            basal_completion_beep: true,
            temp_basal_completion_beep: false,
            bolus_completion_beep: true,
        });
        assert_eq!(beep.nonce(), None);
    }

    #[test]
    fn delivery_type_containment() {
        assert!(DeliveryType::ALL.contains(DeliveryType::BOLUS));
        assert!(DeliveryType::ALL.contains(DeliveryType::BASAL));
        assert!(!DeliveryType::BOLUS.contains(DeliveryType::TEMP_BASAL));
        assert!(DeliveryType::NONE.contains(DeliveryType::NONE));
    }

    #[test]
    fn expected_response_extraction() {
        let block = MessageBlock::ErrorResponse(ErrorResponse::BadNonce {
            nonce_resync_key: 0xA9E4,
        });
        // A mismatch returns the block untouched.
        assert_eq!(StatusResponse::extract(block.clone()), Err(block));
        assert_eq!(
            StatusResponse::BLOCK_TYPE,
            MessageBlockType::StatusResponse
        );
    }

    #[test]
    fn block_type_display() {
        let block = MessageBlock::GetStatus(GetStatusCommand::default());
        assert_eq!(block.block_type().to_string(), "get-status");
    }
}
