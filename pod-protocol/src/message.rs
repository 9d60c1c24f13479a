//! A complete pod message: address, sequence number, payload blocks.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blocks::MessageBlock;
use crate::pod_info::{DetailedStatus, PodInfoResponse};

/// Errors a transport can hit while validating a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    /// Frame shorter than its declared length.
    #[error("not enough data to decode message")]
    NotEnoughData,
    /// Frame integrity check failed.
    #[error("message CRC mismatch")]
    InvalidCrc,
    /// Response sequence number does not follow the sent message.
    #[error("unexpected message sequence number {got}, expected {expected}")]
    InvalidSequence {
        /// Sequence number the exchange was waiting for.
        expected: u8,
        /// Sequence number actually received.
        got: u8,
    },
    /// Response carries a different address than the exchange.
    #[error("unexpected message address 0x{got:08X}, expected 0x{expected:08X}")]
    InvalidAddress {
        /// Address the exchange ran under.
        expected: u32,
        /// Address actually received.
        got: u32,
    },
}

/// One radio message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Radio address this message is for.
    pub address: u32,
    /// Payload blocks, in order.
    pub message_blocks: Vec<MessageBlock>,
    /// 4-bit message sequence number.
    pub sequence_num: u8,
    /// The reply is expected to span a follow-on message.
    pub expect_follow_on_message: bool,
}

impl Message {
    /// Build a message, masking the sequence number to its 4-bit width.
    pub fn new(address: u32, message_blocks: Vec<MessageBlock>, sequence_num: u8) -> Message {
        Message {
            address,
            message_blocks,
            sequence_num: sequence_num & 0x0F,
            expect_follow_on_message: false,
        }
    }

    /// The fault record, when the pod answered with a faulted detailed
    /// status in place of the expected response.
    ///
    /// A faulted pod does this for every command, so the session checks
    /// here on every exchange rather than only on status polls.
    pub fn fault(&self) -> Option<&DetailedStatus> {
        match self.message_blocks.first() {
            Some(MessageBlock::PodInfoResponse(PodInfoResponse::DetailedStatus(status)))
                if status.is_faulted() =>
            {
                Some(status)
            }
            _ => None,
        }
    }
}
