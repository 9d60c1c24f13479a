//! # erospod-protocol
//!
//! Protocol model for the Omnipod Eros command link.
//!
//! This crate defines the data carried between a controller and a pod:
//! - [`Message`], [`MessageBlock`] - Command and response containers
//! - [`StatusResponse`], [`DetailedStatus`], [`FaultEventCode`] - Pod-reported state
//! - [`PodAlert`], [`AlertSlot`], [`BasalSchedule`] - Alert and delivery configuration
//! - [`constants`] - Hardware constants the pod firmware bakes in
//!
//! Everything here is plain data with no I/O; the session layer in
//! `erospod-comms` decides what to send and when.
//!
//! Wire-level byte encoding is deliberately out of scope. Blocks are
//! modeled by their semantic content, and a transport implementation owns
//! the mapping to radio frames.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod alerts;
mod basal;
mod blocks;
pub mod constants;
mod crc;
mod fault;
mod message;
mod pod_info;
mod status;
mod transport_state;
mod version;

pub use alerts::{
    AlertConfiguration, AlertSet, AlertSlot, AlertTrigger, BeepRepeat, BeepType, PodAlert,
};
pub use basal::{BasalSchedule, BasalScheduleEntry, BasalScheduleError};
pub use blocks::{
    AcknowledgeAlertsCommand, AssignAddressCommand, BeepConfigCommand, CancelDeliveryCommand,
    ConfigureAlertsCommand, DeactivatePodCommand, DeliverySchedule, DeliveryType, ErrorResponse,
    ExpectedResponse, FaultConfigCommand, GetStatusCommand, MessageBlock, MessageBlockType,
    SetInsulinScheduleCommand, SetupPodCommand,
};
pub use crc::{crc16, CRC16_TABLE};
pub use fault::FaultEventCode;
pub use message::{Message, MessageError};
pub use pod_info::{
    DetailedStatus, ErrorEventInfo, PodInfoResponse, PodInfoType, PulseLogInfo,
    TriggeredAlertsInfo,
};
pub use status::{DeliveryStatus, PodProgressStatus, StatusResponse};
pub use transport_state::MessageTransportState;
pub use version::{FirmwareVersion, PodConstants, SignalQuality, VersionResponse};
