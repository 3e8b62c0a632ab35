//! Handling of messages the broker returned as unroutable
//!
//! A returned message gets one more chance under the emergency routing key.
//! A message that comes back while already on the emergency route is dropped
//! with an error log, so a missing emergency binding can never cause a
//! publish loop.

use crate::message::{decode_body, is_emergency_route, PendingMessage, EMERGENCY_ROUTING_KEY};
use tracing::{error, warn};

/// What happened to a returned message
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnOutcome {
    /// Rewritten for the emergency route; the caller re-enqueues it
    Rerouted(PendingMessage),
    /// Already on the emergency route, not sent again
    Dropped(PendingMessage),
}

#[derive(Debug)]
pub struct ReturnHandler {
    emergency_routing_key: String,
    rerouted: u64,
    dropped: u64,
}

impl ReturnHandler {
    pub fn new<S: Into<String>>(emergency_routing_key: S) -> Self {
        Self {
            emergency_routing_key: emergency_routing_key.into(),
            rerouted: 0,
            dropped: 0,
        }
    }

    pub fn on_message_returned(
        &mut self,
        reply_code: u16,
        reply_text: &str,
        routing_key: &str,
        body: &[u8],
    ) -> ReturnOutcome {
        let message = PendingMessage::new(routing_key, decode_body(body));

        if routing_key == self.emergency_routing_key || is_emergency_route(routing_key) {
            self.dropped += 1;
            error!(
                reply_code,
                reply_text,
                routing_key,
                original_routing_key = message.original_routing_key().unwrap_or("unknown"),
                "Message returned on the emergency route, dropping it"
            );
            return ReturnOutcome::Dropped(message);
        }

        self.rerouted += 1;
        warn!(
            reply_code,
            reply_text,
            routing_key,
            emergency_routing_key = %self.emergency_routing_key,
            "Message returned as unroutable, resending on the emergency route"
        );
        ReturnOutcome::Rerouted(message.into_emergency(&self.emergency_routing_key))
    }

    pub fn rerouted_count(&self) -> u64 {
        self.rerouted
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}

impl Default for ReturnHandler {
    fn default() -> Self {
        Self::new(EMERGENCY_ROUTING_KEY)
    }
}
