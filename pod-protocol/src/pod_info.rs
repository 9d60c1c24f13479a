//! Pod-info queries and the detailed status record.
//!
//! A get-status command can ask for more than the regular status report.
//! The detailed status is the most important of these: it is also the
//! payload the pod substitutes for every response once it has faulted.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::alerts::AlertSet;
use crate::fault::FaultEventCode;
use crate::status::{DeliveryStatus, PodProgressStatus, StatusResponse};

/// Which record a pod-info query asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PodInfoType {
    /// The regular status report.
    Normal = 0x00,
    /// Which configured alerts have fired.
    TriggeredAlerts = 0x01,
    /// Full delivery and fault detail.
    DetailedStatus = 0x02,
    /// Most recent pulse log entries.
    PulseLogRecent = 0x50,
    /// Pulse log entries preceding the recent ones.
    PulseLogPrevious = 0x51,
}

/// Decomposed fault context byte carried in a faulted detailed status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEventInfo {
    /// The insulin state table was corrupt at fault time.
    pub insulin_state_table_corruption: bool,
    /// 2-bit occlusion classification.
    pub occlusion_type: u8,
    /// An immediate bolus was in progress at fault time.
    pub immediate_bolus_in_progress: bool,
    /// Lifecycle stage before the fault latched.
    pub pod_progress_status: PodProgressStatus,
}

/// Full delivery and fault detail record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedStatus {
    /// Current lifecycle stage.
    pub pod_progress_status: PodProgressStatus,
    /// Current delivery state.
    pub delivery_status: DeliveryStatus,
    /// Units of the current or last bolus not yet delivered.
    pub bolus_not_delivered: f64,
    /// Low nibble of the sequence number of the last programming command
    /// the pod accepted.
    pub last_programming_message_seq_num: u8,
    /// Lifetime insulin delivered, in units.
    pub total_insulin_delivered: f64,
    /// Latched fault code; [`FaultEventCode::NO_FAULTS`] when healthy.
    pub fault_event_code: FaultEventCode,
    /// Pod clock at the moment the fault latched; `None` when unknown or
    /// not faulted.
    pub fault_event_time_since_activation: Option<Duration>,
    /// Reservoir reading; `None` while above the 50 U threshold.
    pub reservoir_level: Option<f64>,
    /// Pod clock: whole minutes since activation.
    pub time_active: Duration,
    /// Alert slots that fired without being acknowledged.
    pub unacknowledged_alerts: AlertSet,
    /// The fault happened while accessing internal tables.
    pub fault_accessing_tables: bool,
    /// Extra fault context; present only when faulted.
    pub error_event_info: Option<ErrorEventInfo>,
    /// 2-bit receiver gain at the last exchange.
    pub receiver_low_gain: u8,
    /// Received signal strength at the last exchange.
    pub radio_rssi: u8,
    /// Lifecycle stage before the current one, when reported.
    pub previous_pod_progress_status: Option<PodProgressStatus>,
}

impl DetailedStatus {
    /// Whether this record reports a fault condition.
    pub fn is_faulted(&self) -> bool {
        self.fault_event_code.is_faulted()
            || self.pod_progress_status == PodProgressStatus::ActivationTimeExceeded
    }

    /// The regular status report this record subsumes.
    ///
    /// A faulted pod answers every command with its detailed status, so
    /// bookkeeping that runs on status responses needs this projection.
    pub fn to_status_response(&self) -> StatusResponse {
        StatusResponse {
            delivery_status: self.delivery_status,
            pod_progress_status: self.pod_progress_status,
            time_active: self.time_active,
            reservoir_level: self.reservoir_level,
            insulin_delivered: self.total_insulin_delivered,
            bolus_not_delivered: self.bolus_not_delivered,
            last_programming_message_seq_num: self.last_programming_message_seq_num,
            alerts: self.unacknowledged_alerts,
        }
    }
}

/// Which configured alerts have fired, per the pod's own accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggeredAlertsInfo {
    /// Slots whose configured alerts have triggered.
    pub triggered_alerts: AlertSet,
}

/// A window of raw 32-bit pulse log entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseLogInfo {
    /// Log entries, oldest first.
    pub entries: Vec<u32>,
}

/// Response to a pod-info query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PodInfoResponse {
    /// Full delivery and fault detail.
    DetailedStatus(DetailedStatus),
    /// Which configured alerts have fired.
    TriggeredAlerts(TriggeredAlertsInfo),
    /// Most recent pulse log entries.
    PulseLog(PulseLogInfo),
    /// Pulse log entries preceding the recent ones.
    PulseLogPrevious(PulseLogInfo),
}

impl PodInfoResponse {
    /// The query type this response answers.
    pub fn pod_info_type(&self) -> PodInfoType {
        match self {
            PodInfoResponse::DetailedStatus(_) => PodInfoType::DetailedStatus,
            PodInfoResponse::TriggeredAlerts(_) => PodInfoType::TriggeredAlerts,
            PodInfoResponse::PulseLog(_) => PodInfoType::PulseLogRecent,
            PodInfoResponse::PulseLogPrevious(_) => PodInfoType::PulseLogPrevious,
        }
    }

    /// The detailed status record, when that is what this response holds.
    pub fn detailed_status(&self) -> Option<&DetailedStatus> {
        match self {
            PodInfoResponse::DetailedStatus(status) => Some(status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_detailed_status() -> DetailedStatus {
        DetailedStatus {
            pod_progress_status: PodProgressStatus::AboveFiftyUnits,
            delivery_status: DeliveryStatus::ScheduledBasal,
            bolus_not_delivered: 0.0,
            last_programming_message_seq_num: 4,
            total_insulin_delivered: 25.65,
            fault_event_code: FaultEventCode::NO_FAULTS,
            fault_event_time_since_activation: None,
            reservoir_level: None,
            time_active: Duration::from_secs(8 * 60 * 60),
            unacknowledged_alerts: AlertSet::NONE,
            fault_accessing_tables: false,
            error_event_info: None,
            receiver_low_gain: 0,
            radio_rssi: 39,
            previous_pod_progress_status: None,
        }
    }

    #[test]
    fn healthy_record_is_not_faulted() {
        assert!(!healthy_detailed_status().is_faulted());
    }

    #[test]
    fn fault_code_marks_record_faulted() {
        let mut status = healthy_detailed_status();
        status.fault_event_code = FaultEventCode::OCCLUDED;
        assert!(status.is_faulted());
    }

    #[test]
    fn activation_timeout_counts_as_faulted() {
        let mut status = healthy_detailed_status();
        status.pod_progress_status = PodProgressStatus::ActivationTimeExceeded;
        assert!(status.is_faulted());
    }

    #[test]
    fn projection_to_status_response() {
        let mut detailed = healthy_detailed_status();
        detailed.bolus_not_delivered = 1.45;
        detailed.unacknowledged_alerts = AlertSet::new(0x08);

        let status = detailed.to_status_response();
        assert_eq!(status.delivery_status, DeliveryStatus::ScheduledBasal);
        assert_eq!(status.insulin_delivered, 25.65);
        assert_eq!(status.bolus_not_delivered, 1.45);
        assert_eq!(status.last_programming_message_seq_num, 4);
        assert_eq!(status.alerts, AlertSet::new(0x08));
    }

    #[test]
    fn response_reports_its_query_type() {
        let response = PodInfoResponse::TriggeredAlerts(TriggeredAlertsInfo {
            triggered_alerts: AlertSet::new(0x80),
        });
        assert_eq!(response.pod_info_type(), PodInfoType::TriggeredAlerts);
        assert!(response.detailed_status().is_none());

        let detailed = PodInfoResponse::DetailedStatus(healthy_detailed_status());
        assert_eq!(detailed.pod_info_type(), PodInfoType::DetailedStatus);
        assert!(detailed.detailed_status().is_some());
    }
}
