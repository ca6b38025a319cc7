//! # Event Bus Publisher Boundary
//!
//! The broker-facing half of the transactional outbox relay.
//!
//! ## Publishers
//!
//! The relay only sees the [`MessagePublisher`] trait; which broker sits
//! behind it is a configuration choice:
//! - **JetStreamPublisher**: production implementation, waits for the stream's
//!   persistence ack on every publish
//! - **InMemoryPublisher**: test/dev implementation with failure injection
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{
//!     InMemoryPublisher, JetStreamConfig, JetStreamPublisher, MessagePublisher, OutboxEvent,
//!     TopicRouter,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Production: NATS JetStream
//! let publisher: Arc<dyn MessagePublisher> = Arc::new(JetStreamPublisher::new(
//!     "nats://localhost:4222",
//!     JetStreamConfig::default(),
//! ));
//!
//! // Dev/Test: In-Memory
//! let publisher: Arc<dyn MessagePublisher> = Arc::new(InMemoryPublisher::new());
//!
//! publisher.start().await?;
//!
//! let router = TopicRouter::new("chat");
//! let event = OutboxEvent::new(
//!     "user.created".to_string(),
//!     "user".to_string(),
//!     "42".to_string(),
//!     serde_json::Map::new(),
//! );
//! let ack = publisher
//!     .publish(&router.topic_key(&event.aggregate_type), &event)
//!     .await?;
//! println!("persisted at sequence {}", ack.sequence);
//!
//! publisher.stop().await?;
//! # Ok(())
//! # }
//! ```

mod envelope;
mod inmemory_publisher;
mod jetstream_publisher;
pub mod retry;

pub use envelope::{validate_event_fields, OutboxEvent};
pub use inmemory_publisher::{InMemoryPublisher, PublishedMessage};
pub use jetstream_publisher::{JetStreamConfig, JetStreamPublisher};

use async_trait::async_trait;
use std::fmt;

/// Broker acknowledgement for a persisted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    /// Stream that stored the message
    pub stream: String,
    /// Position of the message within the stream
    pub sequence: u64,
    /// True when the broker recognised the message id as already stored
    pub duplicate: bool,
}

/// Errors that can occur when publishing to the broker
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("publisher is not started")]
    NotStarted,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("broker rejected message: {0}")]
    Rejected(String),

    #[error("timed out waiting for broker ack after {0:?}")]
    Timeout(std::time::Duration),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for publisher operations
pub type PublishResult<T> = Result<T, PublishError>;

/// Broker publisher used by the outbox relay
///
/// Implementations perform no internal retry: a failed publish surfaces to
/// the caller, which leaves the outbox record pending for a later cycle.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Establish broker connectivity. Calling it on a started publisher is a no-op.
    async fn start(&self) -> PublishResult<()>;

    /// Tear down broker connectivity. Calling it on a stopped publisher is a no-op.
    async fn stop(&self) -> PublishResult<()>;

    /// Publish one event and wait until the broker acknowledges persistence
    ///
    /// # Arguments
    /// * `topic_key` - Destination derived from the aggregate type (see [`TopicRouter`])
    /// * `event` - The event to publish
    ///
    /// # Returns
    /// * `Ok(PublishAck)` once the broker has stored the message
    /// * `Err(PublishError::NotStarted)` if called before `start`
    /// * `Err(PublishError)` on any transport or broker-side failure
    async fn publish(&self, topic_key: &str, event: &OutboxEvent) -> PublishResult<PublishAck>;
}

impl fmt::Debug for dyn MessagePublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessagePublisher")
    }
}

/// Derives one logical stream per aggregate type
///
/// Topic keys have the shape `{prefix}.{aggregate_type}.events`. Ordering is
/// therefore preserved per aggregate type only, never globally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRouter {
    prefix: String,
}

impl TopicRouter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Topic key for an aggregate type
    pub fn topic_key(&self, aggregate_type: &str) -> String {
        format!("{}.{}.events", self.prefix, subject_token(aggregate_type))
    }

    /// Wildcard pattern covering every topic this router produces
    pub fn wildcard(&self) -> String {
        format!("{}.*.events", self.prefix)
    }
}

/// Make a string safe to use as a single NATS subject token
fn subject_token(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}
