//! NATS JetStream implementation of the MessagePublisher trait

use crate::{MessagePublisher, OutboxEvent, PublishAck, PublishError, PublishResult};
use async_nats::jetstream::{self, stream};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use std::future::IntoFuture;
use std::time::Duration;
use tokio::sync::RwLock;

/// JetStream header used by the broker's duplicate detection window
const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Stream settings applied when the publisher starts
#[derive(Debug, Clone)]
pub struct JetStreamConfig {
    /// Stream that stores the relay's events
    pub stream_name: String,
    /// Subjects bound to the stream (e.g., "chat.*.events")
    pub subjects: Vec<String>,
    /// How long the broker keeps events
    pub max_age: Duration,
    /// Window in which a re-published event id is reported as duplicate
    pub duplicate_window: Duration,
    /// Upper bound on the wait for a persistence ack
    pub ack_timeout: Duration,
    /// Upper bound on the initial TCP/handshake
    pub connect_timeout: Duration,
}

impl Default for JetStreamConfig {
    fn default() -> Self {
        Self {
            stream_name: "CHAT_EVENTS".to_string(),
            subjects: vec!["chat.*.events".to_string()],
            max_age: Duration::from_secs(60 * 60 * 24 * 14), // 14 days
            duplicate_window: Duration::from_secs(120),
            ack_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

struct Connection {
    client: Client,
    context: jetstream::Context,
}

/// MessagePublisher backed by NATS JetStream
///
/// `publish` returns only after the stream has acknowledged persistence of
/// the message, not merely after the bytes left the socket. The outbox record
/// id is sent as `Nats-Msg-Id`, so a re-publish after a lost ack is reported
/// by the broker as a duplicate instead of being stored twice.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{JetStreamConfig, JetStreamPublisher, MessagePublisher};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let publisher = JetStreamPublisher::new("nats://localhost:4222", JetStreamConfig::default());
/// publisher.start().await?;
/// // ... publish events ...
/// publisher.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct JetStreamPublisher {
    url: String,
    config: JetStreamConfig,
    connection: RwLock<Option<Connection>>,
}

impl JetStreamPublisher {
    pub fn new(url: impl Into<String>, config: JetStreamConfig) -> Self {
        Self {
            url: url.into(),
            config,
            connection: RwLock::new(None),
        }
    }

    /// Create the stream if it does not exist yet
    async fn ensure_stream(&self, js: &jetstream::Context) -> PublishResult<()> {
        if js.get_stream(&self.config.stream_name).await.is_ok() {
            return Ok(());
        }

        let stream_cfg = stream::Config {
            name: self.config.stream_name.clone(),
            subjects: self.config.subjects.clone(),
            max_age: self.config.max_age,
            duplicate_window: self.config.duplicate_window,
            ..Default::default()
        };

        js.create_stream(stream_cfg)
            .await
            .map_err(|e| PublishError::Connection(e.to_string()))?;

        tracing::info!(
            stream = %self.config.stream_name,
            subjects = ?self.config.subjects,
            "Created JetStream stream"
        );

        Ok(())
    }
}

#[async_trait]
impl MessagePublisher for JetStreamPublisher {
    async fn start(&self) -> PublishResult<()> {
        let mut guard = self.connection.write().await;
        if guard.is_some() {
            return Ok(());
        }

        tracing::info!(url = %self.url, "Connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .connection_timeout(self.config.connect_timeout)
            .connect(&self.url)
            .await
            .map_err(|e| PublishError::Connection(e.to_string()))?;

        let context = jetstream::new(client.clone());
        self.ensure_stream(&context).await?;

        *guard = Some(Connection { client, context });
        Ok(())
    }

    async fn stop(&self) -> PublishResult<()> {
        let connection = self.connection.write().await.take();

        if let Some(connection) = connection {
            connection
                .client
                .flush()
                .await
                .map_err(|e| PublishError::Connection(e.to_string()))?;
            tracing::info!(url = %self.url, "Disconnected from NATS");
        }

        Ok(())
    }

    async fn publish(&self, topic_key: &str, event: &OutboxEvent) -> PublishResult<PublishAck> {
        let context = match self.connection.read().await.as_ref() {
            Some(connection) => connection.context.clone(),
            None => return Err(PublishError::NotStarted),
        };

        let payload = event.to_bytes()?;
        let mut headers = HeaderMap::new();
        headers.insert(MSG_ID_HEADER, event.event_id.to_string().as_str());

        let ack_future = context
            .publish_with_headers(topic_key.to_string(), headers, payload.into())
            .await
            .map_err(|e| PublishError::Connection(e.to_string()))?;

        let ack = tokio::time::timeout(self.config.ack_timeout, ack_future.into_future())
            .await
            .map_err(|_| PublishError::Timeout(self.config.ack_timeout))?
            .map_err(|e| PublishError::Rejected(e.to_string()))?;

        if ack.duplicate {
            tracing::debug!(
                event_id = %event.event_id,
                stream = %ack.stream,
                sequence = ack.sequence,
                "Broker reported duplicate publish"
            );
        }

        Ok(PublishAck {
            stream: ack.stream,
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }
}
