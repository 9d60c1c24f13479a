//! Mock message transport for testing.
//!
//! Allows scripting exchange outcomes and capturing sent messages for
//! verification.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use pod_protocol::{Message, MessageBlock, MessageTransportState};

use super::{MessageTransport, TransportError};

/// Mock message transport for testing.
///
/// Exchange outcomes are scripted in order: each queued entry answers one
/// `send_message` call. Clones share state, so a test can keep one handle
/// for scripting and inspection while a session drives another.
#[derive(Debug, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    state: MessageTransportState,
    sent_messages: Vec<Message>,
    script: VecDeque<Result<MessageBlock, TransportError>>,
}

impl MockTransport {
    /// Create a new mock transport with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response block for the next unanswered exchange.
    ///
    /// The block comes back wrapped in a message addressed like the
    /// command and one sequence number ahead, the way a pod replies.
    pub fn queue_response(&self, block: MessageBlock) {
        let mut inner = self.inner.lock().unwrap();
        inner.script.push_back(Ok(block));
    }

    /// Queue a failure for the next exchange.
    pub fn queue_error(&self, error: TransportError) {
        let mut inner = self.inner.lock().unwrap();
        inner.script.push_back(Err(error));
    }

    /// Get all messages that were sent.
    pub fn sent_messages(&self) -> Vec<Message> {
        let inner = self.inner.lock().unwrap();
        inner.sent_messages.clone()
    }

    /// Get the last message that was sent.
    pub fn last_sent(&self) -> Option<Message> {
        let inner = self.inner.lock().unwrap();
        inner.sent_messages.last().cloned()
    }

    /// Clear all state (messages, script, counters).
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = MockTransportInner::default();
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl MessageTransport for MockTransport {
    fn send_message(&mut self, message: &Message) -> Result<Message, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.sent_messages.push(message.clone());

        match inner.script.pop_front() {
            Some(Ok(block)) => {
                let response = Message::new(
                    message.address,
                    vec![block],
                    message.sequence_num.wrapping_add(1),
                );
                // Command packets out, response packets back.
                inner.state.advance_packet_number(2);
                inner.state.message_number = (response.sequence_num + 1) & 0x0F;
                Ok(response)
            }
            Some(Err(error)) => {
                // The attempt still went out over the air.
                inner.state.advance_packet_number(1);
                Err(error)
            }
            None => {
                inner.state.advance_packet_number(1);
                Err(TransportError::NoResponse)
            }
        }
    }

    fn message_number(&self) -> u8 {
        let inner = self.inner.lock().unwrap();
        inner.state.message_number
    }

    fn state(&self) -> MessageTransportState {
        let inner = self.inner.lock().unwrap();
        inner.state
    }

    fn restore_state(&mut self, state: MessageTransportState) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = state;
    }
}
