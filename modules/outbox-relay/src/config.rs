use std::env;
use std::time::Duration;

use event_bus::{JetStreamConfig, TopicRouter};

use crate::db::PoolSettings;
use crate::worker::WorkerConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusType {
    Nats,
    InMemory,
}

impl BusType {
    fn parse(raw: Option<String>) -> Self {
        match raw
            .unwrap_or_else(|| "inmemory".to_string())
            .to_lowercase()
            .as_str()
        {
            "nats" => BusType::Nats,
            "inmemory" => BusType::InMemory,
            other => {
                tracing::warn!(bus_type = %other, "Unknown BUS_TYPE, defaulting to inmemory");
                BusType::InMemory
            }
        }
    }
}

/// Relay configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bus_type: BusType,
    pub nats_url: String,
    pub topic_prefix: String,
    pub stream_name: String,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub max_backoff: Duration,
    pub workers: usize,
    pub publish_ack_timeout: Duration,
    pub pool: PoolSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup (the process environment in production)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url =
            lookup("DATABASE_URL").ok_or_else(|| "DATABASE_URL must be set".to_string())?;

        let bus_type = BusType::parse(lookup("BUS_TYPE"));

        let nats_url =
            lookup("NATS_URL").unwrap_or_else(|| "nats://localhost:4222".to_string());

        let topic_prefix = lookup("OUTBOX_TOPIC_PREFIX").unwrap_or_else(|| "chat".to_string());
        if topic_prefix.trim().is_empty() {
            return Err("OUTBOX_TOPIC_PREFIX cannot be empty".to_string());
        }

        let stream_name =
            lookup("OUTBOX_STREAM_NAME").unwrap_or_else(|| "CHAT_EVENTS".to_string());

        let batch_size: usize = parse_or(&lookup, "OUTBOX_BATCH_SIZE", 10)?;
        if batch_size == 0 {
            return Err("OUTBOX_BATCH_SIZE must be greater than 0".to_string());
        }

        let workers: usize = parse_or(&lookup, "OUTBOX_WORKERS", 1)?;
        if workers == 0 {
            return Err("OUTBOX_WORKERS must be greater than 0".to_string());
        }

        let poll_interval = Duration::from_millis(parse_or(&lookup, "OUTBOX_POLL_INTERVAL_MS", 1000)?);
        let max_backoff = Duration::from_millis(parse_or(&lookup, "OUTBOX_MAX_BACKOFF_MS", 30_000)?);
        let publish_ack_timeout =
            Duration::from_millis(parse_or(&lookup, "OUTBOX_PUBLISH_ACK_TIMEOUT_MS", 5000)?);

        let defaults = PoolSettings::default();
        let pool = PoolSettings {
            max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", defaults.max_connections)?,
            min_connections: parse_or(&lookup, "DB_MIN_CONNECTIONS", defaults.min_connections)?,
            acquire_timeout: Duration::from_secs(parse_or(
                &lookup,
                "DB_ACQUIRE_TIMEOUT_SECS",
                defaults.acquire_timeout.as_secs(),
            )?),
        };
        if (pool.max_connections as usize) < workers {
            return Err(format!(
                "DB_MAX_CONNECTIONS ({}) must be at least OUTBOX_WORKERS ({})",
                pool.max_connections, workers
            ));
        }

        Ok(Config {
            database_url,
            bus_type,
            nats_url,
            topic_prefix,
            stream_name,
            batch_size,
            poll_interval,
            max_backoff,
            workers,
            publish_ack_timeout,
            pool,
        })
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            batch_size: self.batch_size,
            poll_interval: self.poll_interval,
            max_backoff: self.max_backoff,
        }
    }

    pub fn topic_router(&self) -> TopicRouter {
        TopicRouter::new(self.topic_prefix.clone())
    }

    pub fn jetstream_config(&self) -> JetStreamConfig {
        JetStreamConfig {
            stream_name: self.stream_name.clone(),
            subjects: vec![self.topic_router().wildcard()],
            ack_timeout: self.publish_ack_timeout,
            ..Default::default()
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, String>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("{} must be a valid number", key)),
        None => Ok(default),
    }
}
