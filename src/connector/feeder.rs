//! Outbound queue and the feeder that moves messages onto the channel

use super::confirms::ConfirmTracker;
use super::state::ConnectionStateMachine;
use crate::broker::{BrokerChannel, BrokerError, DeliveryTag, FIRST_DELIVERY_TAG};
use crate::error::sanitize_error_message;
use crate::message::PendingMessage;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

/// FIFO of messages not yet handed to a channel
///
/// Shared between caller threads (which append) and the event loop (which
/// pops and re-queues). Every operation holds the lock for a single step, so
/// concurrent appends never interleave with a pop.
#[derive(Debug, Clone, Default)]
pub struct OutboundQueue {
    inner: Arc<Mutex<VecDeque<PendingMessage>>>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PendingMessage>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_back(&self, message: PendingMessage) {
        self.lock().push_back(message);
    }

    pub fn extend_back<I: IntoIterator<Item = PendingMessage>>(&self, messages: I) {
        self.lock().extend(messages);
    }

    pub fn push_front(&self, message: PendingMessage) {
        self.lock().push_front(message);
    }

    /// Put messages back at the head, keeping their relative order
    pub fn requeue_front(&self, messages: Vec<PendingMessage>) {
        let mut queue = self.lock();
        for message in messages.into_iter().rev() {
            queue.push_front(message);
        }
    }

    pub fn pop_front(&self) -> Option<PendingMessage> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove and return everything, head first
    pub fn drain(&self) -> Vec<PendingMessage> {
        self.lock().drain(..).collect()
    }
}

/// Result of one publish step
#[derive(Debug)]
pub enum PublishOutcome {
    Published(DeliveryTag),
    QueueEmpty,
    /// No open channel or the state does not allow publishing
    NotEligible,
    /// The channel refused the message; it is back at the head of the queue
    Failed(BrokerError),
}

/// Summary of a publish batch
#[derive(Debug, Default)]
pub struct BatchReport {
    pub published: usize,
    pub remaining: usize,
    pub failure: Option<BrokerError>,
}

impl BatchReport {
    /// The batch stopped at its size limit with work left over
    pub fn hit_limit(&self) -> bool {
        self.failure.is_none() && self.published > 0 && self.remaining > 0
    }
}

/// Moves messages from the queue to the channel, assigning delivery tags
#[derive(Debug)]
pub struct Feeder {
    queue: OutboundQueue,
    next_tag: DeliveryTag,
    batch_size: usize,
    consecutive_failures: u32,
}

impl Feeder {
    pub fn new(queue: OutboundQueue, batch_size: usize) -> Self {
        Self {
            queue,
            next_tag: FIRST_DELIVERY_TAG,
            batch_size: batch_size.max(1),
            consecutive_failures: 0,
        }
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    /// Tag the next successful publish will get
    pub fn next_delivery_tag(&self) -> DeliveryTag {
        self.next_tag
    }

    /// Called whenever a new channel replaces the old one
    pub fn reset_delivery_tags(&mut self) {
        self.next_tag = FIRST_DELIVERY_TAG;
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Publish the head of the queue if the connector can publish right now
    pub async fn publish_next(
        &mut self,
        state: &ConnectionStateMachine,
        channel: Option<&dyn BrokerChannel>,
        exchange: &str,
        confirms: &mut ConfirmTracker,
    ) -> PublishOutcome {
        let channel = match channel {
            Some(channel) if state.is_available_for_publish() => channel,
            _ => return PublishOutcome::NotEligible,
        };

        let Some(message) = self.queue.pop_front() else {
            return PublishOutcome::QueueEmpty;
        };

        let tag = self.next_tag;
        let result = match message.encode_body() {
            Ok(body) => {
                channel
                    .publish(tag, exchange, &message.routing_key, &body)
                    .await
            }
            Err(e) => Err(BrokerError::PublishFailed(format!(
                "body could not be encoded: {}",
                e
            ))),
        };

        match result {
            Ok(()) => {
                trace!(
                    delivery_tag = tag,
                    routing_key = %message.routing_key,
                    exchange,
                    "Message published"
                );
                self.next_tag += 1;
                self.consecutive_failures = 0;
                confirms.track(tag, message);
                PublishOutcome::Published(tag)
            }
            Err(error) => {
                warn!(
                    routing_key = %message.routing_key,
                    exchange,
                    error = %sanitize_error_message(&error.to_string()),
                    "Publish failed, message returned to the head of the queue"
                );
                self.consecutive_failures += 1;
                self.queue.push_front(message);
                PublishOutcome::Failed(error)
            }
        }
    }

    /// Publish up to `batch_size` messages, stopping at the first failure
    pub async fn publish_batch(
        &mut self,
        state: &ConnectionStateMachine,
        channel: Option<&dyn BrokerChannel>,
        exchange: &str,
        confirms: &mut ConfirmTracker,
    ) -> BatchReport {
        let mut report = BatchReport::default();

        for _ in 0..self.batch_size {
            match self.publish_next(state, channel, exchange, confirms).await {
                PublishOutcome::Published(_) => report.published += 1,
                PublishOutcome::QueueEmpty | PublishOutcome::NotEligible => break,
                PublishOutcome::Failed(error) => {
                    report.failure = Some(error);
                    break;
                }
            }
        }

        report.remaining = self.queue.len();
        if report.published > 0 {
            debug!(
                published = report.published,
                remaining = report.remaining,
                unconfirmed = confirms.count_unconfirmed(),
                "Publish batch finished"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockChannel;
    use serde_json::json;

    fn message(n: u32) -> PendingMessage {
        PendingMessage::new(format!("key.{n}"), json!({"n": n}))
    }

    fn available_state() -> ConnectionStateMachine {
        let mut state = ConnectionStateMachine::new();
        state.set_waiting_to_be_available();
        state.set_available();
        state
    }

    #[test]
    fn test_queue_requeue_front_keeps_order() {
        let queue = OutboundQueue::new();
        queue.push_back(message(3));
        queue.requeue_front(vec![message(1), message(2)]);

        let keys: Vec<_> = queue.drain().into_iter().map(|m| m.routing_key).collect();
        assert_eq!(keys, vec!["key.1", "key.2", "key.3"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_concurrent_appends_are_all_kept() {
        let queue = OutboundQueue::new();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for n in 0..250 {
                        queue.push_back(message(t * 1000 + n));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.len(), 1000);
    }

    #[tokio::test]
    async fn test_publish_assigns_consecutive_tags_in_fifo_order() {
        let queue = OutboundQueue::new();
        queue.extend_back((1..=3).map(message));
        let mut feeder = Feeder::new(queue, 10);
        let mut confirms = ConfirmTracker::new();
        let channel = MockChannel::detached();
        let state = available_state();

        let report = feeder
            .publish_batch(&state, Some(&channel), "ex", &mut confirms)
            .await;

        assert_eq!(report.published, 3);
        assert_eq!(report.remaining, 0);
        assert_eq!(feeder.next_delivery_tag(), 4);
        assert_eq!(confirms.count_unconfirmed(), 3);

        let published: Vec<_> = channel
            .published()
            .into_iter()
            .map(|p| (p.delivery_tag, p.routing_key))
            .collect();
        assert_eq!(
            published,
            vec![
                (1, "key.1".to_string()),
                (2, "key.2".to_string()),
                (3, "key.3".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_publish_preserves_queue_and_tag() {
        let queue = OutboundQueue::new();
        queue.extend_back((1..=2).map(message));
        let mut feeder = Feeder::new(queue.clone(), 10);
        let mut confirms = ConfirmTracker::new();
        let channel = MockChannel::detached();
        channel.fail_next_publishes(1);
        let state = available_state();

        let before = queue.len();
        let outcome = feeder
            .publish_next(&state, Some(&channel), "ex", &mut confirms)
            .await;

        assert!(matches!(outcome, PublishOutcome::Failed(_)));
        assert_eq!(queue.len(), before);
        assert_eq!(feeder.next_delivery_tag(), 1);
        assert_eq!(feeder.consecutive_failures(), 1);
        assert!(confirms.is_empty());
        assert_eq!(queue.pop_front().map(|m| m.routing_key), Some("key.1".to_string()));

        // A replacement channel starts with a clean record
        feeder.reset_delivery_tags();
        assert_eq!(feeder.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_nothing_published_without_channel_or_availability() {
        let queue = OutboundQueue::new();
        queue.push_back(message(1));
        let mut feeder = Feeder::new(queue.clone(), 10);
        let mut confirms = ConfirmTracker::new();
        let channel = MockChannel::detached();

        let outcome = feeder
            .publish_next(&available_state(), None, "ex", &mut confirms)
            .await;
        assert!(matches!(outcome, PublishOutcome::NotEligible));

        let mut waiting = ConnectionStateMachine::new();
        waiting.set_waiting_to_be_available();
        let outcome = feeder
            .publish_next(&waiting, Some(&channel), "ex", &mut confirms)
            .await;
        assert!(matches!(outcome, PublishOutcome::NotEligible));

        assert_eq!(queue.len(), 1);
        assert!(channel.published().is_empty());
    }

    #[tokio::test]
    async fn test_batch_size_limits_publishes() {
        let queue = OutboundQueue::new();
        queue.extend_back((1..=5).map(message));
        let mut feeder = Feeder::new(queue, 2);
        let mut confirms = ConfirmTracker::new();
        let channel = MockChannel::detached();

        let report = feeder
            .publish_batch(&available_state(), Some(&channel), "ex", &mut confirms)
            .await;

        assert_eq!(report.published, 2);
        assert_eq!(report.remaining, 3);
        assert!(report.hit_limit());
    }

    #[tokio::test]
    async fn test_reset_delivery_tags() {
        let queue = OutboundQueue::new();
        queue.extend_back((1..=2).map(message));
        let mut feeder = Feeder::new(queue, 10);
        let mut confirms = ConfirmTracker::new();
        let channel = MockChannel::detached();

        feeder
            .publish_batch(&available_state(), Some(&channel), "ex", &mut confirms)
            .await;
        assert_eq!(feeder.next_delivery_tag(), 3);

        feeder.reset_delivery_tags();
        assert_eq!(feeder.next_delivery_tag(), FIRST_DELIVERY_TAG);
    }
}
