//! In-memory implementation of the MessagePublisher trait for testing and development

use crate::{MessagePublisher, OutboxEvent, PublishAck, PublishError, PublishResult};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

type FailurePredicate = Box<dyn Fn(&str, &OutboxEvent) -> bool + Send + Sync>;

/// A message accepted by the in-memory broker
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub event: OutboxEvent,
    pub sequence: u64,
}

#[derive(Default)]
struct Faults {
    fail_next: AtomicUsize,
    predicate: Mutex<Option<FailurePredicate>>,
    ack_delay: Mutex<Option<Duration>>,
}

/// MessagePublisher that keeps everything in process memory
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without Docker
/// - Relay tests that need to inject broker failures
///
/// Every accepted message is recorded (see [`InMemoryPublisher::published`])
/// and broadcast to subscribers whose pattern matches the topic.
///
/// # Example
/// ```rust
/// use event_bus::{InMemoryPublisher, MessagePublisher, OutboxEvent};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let publisher = InMemoryPublisher::new();
/// publisher.start().await?;
///
/// let event = OutboxEvent::new(
///     "user.created".to_string(),
///     "user".to_string(),
///     "42".to_string(),
///     serde_json::Map::new(),
/// );
/// publisher.publish("chat.user.events", &event).await?;
///
/// assert_eq!(publisher.published().len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryPublisher {
    started: Arc<AtomicBool>,
    sequence: Arc<AtomicU64>,
    attempts: Arc<AtomicUsize>,
    published: Arc<Mutex<Vec<PublishedMessage>>>,
    faults: Arc<Faults>,
    sender: Arc<broadcast::Sender<PublishedMessage>>,
}

impl InMemoryPublisher {
    /// Create a new in-memory publisher
    ///
    /// Subscribers share a broadcast channel with a buffer of 1000 messages.
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    /// Create a new in-memory publisher with a custom subscriber buffer size
    pub fn with_capacity(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self {
            started: Arc::new(AtomicBool::new(false)),
            sequence: Arc::new(AtomicU64::new(0)),
            attempts: Arc::new(AtomicUsize::new(0)),
            published: Arc::new(Mutex::new(Vec::new())),
            faults: Arc::new(Faults::default()),
            sender: Arc::new(sender),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Snapshot of every message the broker accepted, in acceptance order
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }

    /// Number of publish calls made, successful or not
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Reject the next `count` publish calls with a broker error
    pub fn fail_next(&self, count: usize) {
        self.faults.fail_next.store(count, Ordering::SeqCst);
    }

    /// Reject every publish for which `predicate(topic, event)` returns true
    pub fn fail_when<F>(&self, predicate: F)
    where
        F: Fn(&str, &OutboxEvent) -> bool + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.faults.predicate.lock() {
            *slot = Some(Box::new(predicate));
        }
    }

    /// Remove all injected failures
    pub fn heal(&self) {
        self.faults.fail_next.store(0, Ordering::SeqCst);
        if let Ok(mut slot) = self.faults.predicate.lock() {
            *slot = None;
        }
    }

    /// Delay every acknowledgement, simulating a slow broker
    pub fn set_ack_delay(&self, delay: Option<Duration>) {
        if let Ok(mut slot) = self.faults.ack_delay.lock() {
            *slot = delay;
        }
    }

    /// Subscribe to accepted messages whose topic matches `pattern`
    pub fn subscribe(&self, pattern: &str) -> BoxStream<'static, PublishedMessage> {
        let mut receiver = self.sender.subscribe();
        let pattern = pattern.to_string();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(msg) => {
                        if matches_pattern(&msg.topic, &pattern) {
                            yield msg;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped = skipped, "InMemoryPublisher: subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        stream.boxed()
    }

    fn injected_failure(&self, topic: &str, event: &OutboxEvent) -> bool {
        let consumed = self
            .faults
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return true;
        }

        self.faults
            .predicate
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|p| p(topic, event)))
            .unwrap_or(false)
    }

    fn ack_delay(&self) -> Option<Duration> {
        self.faults.ack_delay.lock().ok().and_then(|slot| *slot)
    }
}

impl Default for InMemoryPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if a topic matches a subscription pattern
///
/// Supports NATS-style wildcards:
/// - `*` matches exactly one token
/// - `>` matches one or more tokens
fn matches_pattern(subject: &str, pattern: &str) -> bool {
    let subject_tokens: Vec<&str> = subject.split('.').collect();
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();

    let mut s_idx = 0;
    let mut p_idx = 0;

    while s_idx < subject_tokens.len() && p_idx < pattern_tokens.len() {
        let pattern_token = pattern_tokens[p_idx];

        if pattern_token == ">" {
            return true;
        } else if pattern_token == "*" || subject_tokens[s_idx] == pattern_token {
            s_idx += 1;
            p_idx += 1;
        } else {
            return false;
        }
    }

    s_idx == subject_tokens.len() && p_idx == pattern_tokens.len()
}

#[async_trait]
impl MessagePublisher for InMemoryPublisher {
    async fn start(&self) -> PublishResult<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> PublishResult<()> {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, topic_key: &str, event: &OutboxEvent) -> PublishResult<PublishAck> {
        if !self.is_started() {
            return Err(PublishError::NotStarted);
        }

        self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.ack_delay() {
            tokio::time::sleep(delay).await;
        }

        if self.injected_failure(topic_key, event) {
            return Err(PublishError::Rejected(format!(
                "injected failure for event {}",
                event.event_id
            )));
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let msg = PublishedMessage {
            topic: topic_key.to_string(),
            event: event.clone(),
            sequence,
        };

        self.published
            .lock()
            .map_err(|_| PublishError::Rejected("publisher state poisoned".to_string()))?
            .push(msg.clone());

        // No subscribers is fine
        let _ = self.sender.send(msg);

        Ok(PublishAck {
            stream: "in-memory".to_string(),
            sequence,
            duplicate: false,
        })
    }
}
