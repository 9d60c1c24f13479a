//! Transport abstraction for the pod radio link.
//!
//! This module provides a pluggable message transport that abstracts the
//! underlying packet layer (a radio bridge in production, a mock for
//! testing). One call to [`MessageTransport::send_message`] covers a whole
//! exchange: fragment and transmit the command, collect the reply packets,
//! reassemble and validate the response message.
//!
//! The transport owns the rolling packet and message counters. Sessions
//! read them through [`MessageTransport::state`] so they can be persisted
//! with the pod state and restored before the next session.

mod mock;

pub use mock::MockTransport;

use thiserror::Error;

use pod_protocol::{Message, MessageError, MessageTransportState};

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Nothing came back within the retry window.
    #[error("no response from pod")]
    NoResponse,

    /// The pod acknowledged the packets but never sent a response message.
    #[error("pod acknowledged without responding")]
    AckedWithoutResponse,

    /// The command reached the pod but the reply was lost, so the outcome
    /// is unknown. Carries the sequence number of the delivered message.
    #[error("message {sequence} delivered but its response was lost")]
    DeliveredUnconfirmed {
        /// Sequence number of the message the pod accepted.
        sequence: u8,
    },

    /// The link itself failed.
    #[error("link error: {0}")]
    Link(String),

    /// The response failed message validation.
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// One-exchange message transport to a pod.
///
/// Implementations handle the packet layer underneath (radio bridge,
/// mock, etc). The trait is object safe so sessions can hold any
/// transport behind `&mut dyn MessageTransport`.
pub trait MessageTransport {
    /// Run one exchange: deliver `message` and return the pod's reply.
    ///
    /// Advances the rolling counters whether or not the exchange
    /// succeeds, mirroring what went out over the air.
    fn send_message(&mut self, message: &Message) -> Result<Message, TransportError>;

    /// Sequence number the next outgoing message will carry.
    fn message_number(&self) -> u8;

    /// Current rolling counters, for persistence.
    fn state(&self) -> MessageTransportState;

    /// Restore rolling counters saved by an earlier session.
    fn restore_state(&mut self, state: MessageTransportState);
}
