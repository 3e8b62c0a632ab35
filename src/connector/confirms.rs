//! Publisher-confirm bookkeeping
//!
//! Every published message stays here, keyed by delivery tag, until the
//! broker acks or nacks it. Tags are scoped to one channel: the event loop
//! clears or drains the tracker whenever it abandons a channel.

use crate::broker::DeliveryTag;
use crate::message::PendingMessage;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfirmError {
    #[error("Broker confirmed unknown delivery tag {tag} (multiple={multiple})")]
    UnknownDeliveryTag { tag: DeliveryTag, multiple: bool },
}

/// Unconfirmed messages ordered by delivery tag
#[derive(Debug, Default)]
pub struct ConfirmTracker {
    pending: BTreeMap<DeliveryTag, PendingMessage>,
}

impl ConfirmTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a message that was just handed to the channel
    pub fn track(&mut self, tag: DeliveryTag, message: PendingMessage) {
        if let Some(displaced) = self.pending.insert(tag, message) {
            // Only possible if tags were not reset with the channel
            warn!(
                delivery_tag = tag,
                routing_key = %displaced.routing_key,
                "Delivery tag reused while still unconfirmed"
            );
        }
    }

    /// Broker accepted `tag` (and everything below it if `multiple`); returns how many were settled
    pub fn on_ack(&mut self, tag: DeliveryTag, multiple: bool) -> Result<usize, ConfirmError> {
        let settled = self.remove_confirmed(tag, multiple)?;
        debug!(
            delivery_tag = tag,
            multiple,
            settled = settled.len(),
            remaining = self.pending.len(),
            "Publish confirmed"
        );
        Ok(settled.len())
    }

    /// Broker refused `tag` (and everything below it if `multiple`); returns the messages to resend
    pub fn on_nack(
        &mut self,
        tag: DeliveryTag,
        multiple: bool,
    ) -> Result<Vec<PendingMessage>, ConfirmError> {
        let refused = self.remove_confirmed(tag, multiple)?;
        warn!(
            delivery_tag = tag,
            multiple,
            refused = refused.len(),
            "Broker rejected published messages"
        );
        Ok(refused)
    }

    fn remove_confirmed(
        &mut self,
        tag: DeliveryTag,
        multiple: bool,
    ) -> Result<Vec<PendingMessage>, ConfirmError> {
        let unknown = ConfirmError::UnknownDeliveryTag { tag, multiple };

        if !multiple {
            return self.pending.remove(&tag).map(|m| vec![m]).ok_or(unknown);
        }

        let settled = match tag.checked_add(1) {
            Some(first_kept) => {
                let kept = self.pending.split_off(&first_kept);
                std::mem::replace(&mut self.pending, kept)
            }
            None => std::mem::take(&mut self.pending),
        };

        if settled.is_empty() {
            return Err(unknown);
        }
        Ok(settled.into_values().collect())
    }

    pub fn count_unconfirmed(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, tag: DeliveryTag) -> bool {
        self.pending.contains_key(&tag)
    }

    /// Copies of all unconfirmed messages in tag order
    pub fn snapshot_messages(&self) -> Vec<PendingMessage> {
        self.pending.values().cloned().collect()
    }

    /// Remove and return all unconfirmed messages in tag order
    pub fn take_all(&mut self) -> Vec<PendingMessage> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
