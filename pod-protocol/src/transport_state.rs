//! Rolling radio sequence counters.

use serde::{Deserialize, Serialize};

/// Rolling packet and message sequence counters for one pod link.
///
/// The pod rejects out-of-sequence traffic, so the counters survive
/// process restarts inside the persisted pod state and are restored into
/// the transport at the start of every session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTransportState {
    /// Next 5-bit radio packet sequence number.
    pub packet_number: u8,
    /// Next 4-bit message sequence number.
    pub message_number: u8,
}

impl MessageTransportState {
    /// Counters starting at the given values, masked to their field widths.
    pub fn new(packet_number: u8, message_number: u8) -> Self {
        MessageTransportState {
            packet_number: packet_number & 0x1F,
            message_number: message_number & 0x0F,
        }
    }

    /// Advance the message counter by `count`, wrapping at 16.
    pub fn advance_message_number(&mut self, count: u8) {
        self.message_number = (self.message_number.wrapping_add(count)) & 0x0F;
    }

    /// Advance the packet counter by `count`, wrapping at 32.
    pub fn advance_packet_number(&mut self, count: u8) {
        self.packet_number = (self.packet_number.wrapping_add(count)) & 0x1F;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_wrap_at_field_width() {
        let mut state = MessageTransportState::new(30, 15);
        state.advance_packet_number(2);
        state.advance_message_number(2);
        assert_eq!(state.packet_number, 0);
        assert_eq!(state.message_number, 1);
    }

    #[test]
    fn new_masks_out_of_range_values() {
        let state = MessageTransportState::new(0xFF, 0xFF);
        assert_eq!(state.packet_number, 0x1F);
        assert_eq!(state.message_number, 0x0F);
    }

    #[test]
    fn default_is_zeroed() {
        assert_eq!(
            MessageTransportState::default(),
            MessageTransportState::new(0, 0)
        );
    }
}
