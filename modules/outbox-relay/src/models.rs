use chrono::{DateTime, Utc};
use event_bus::OutboxEvent;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::StorageError;

/// Delivery state of an outbox record
///
/// `Pending -> Processed` is the only legal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "outbox_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Processed,
}

/// Outbox row as stored in `outbox_events`
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: Value,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    pub fn is_pending(&self) -> bool {
        self.status == OutboxStatus::Pending
    }

    /// Build the wire event; the record id doubles as the event id
    pub fn to_event(&self) -> OutboxEvent {
        let payload = match &self.payload {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };

        OutboxEvent::with_event_id(
            self.id,
            self.event_type.clone(),
            self.aggregate_type.clone(),
            self.aggregate_id.clone(),
            payload,
        )
        .with_occurred_at(self.created_at)
    }
}

/// Fields supplied by the business transaction when appending
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxRecord {
    pub id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: Map<String, Value>,
}

impl NewOutboxRecord {
    pub fn new(
        event_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            payload,
        }
    }

    /// Build from an arbitrary JSON value, which must be an object
    pub fn from_value(
        event_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: Value,
    ) -> Result<Self, StorageError> {
        match payload {
            Value::Object(map) => Ok(Self::new(event_type, aggregate_type, aggregate_id, map)),
            other => Err(StorageError::InvalidRecord(format!(
                "payload must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Build from a typed domain event
    pub fn from_event<E: DomainEvent>(event: &E) -> Result<Self, StorageError> {
        let payload = serde_json::to_value(event)?;
        Self::from_value(
            event.event_type(),
            E::AGGREGATE_TYPE,
            event.aggregate_id(),
            payload,
        )
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        event_bus::validate_event_fields(&self.event_type, &self.aggregate_type, &self.aggregate_id)
            .map_err(StorageError::InvalidRecord)
    }
}

/// A business event that can be written to the outbox
///
/// ```rust
/// use outbox_relay_rs::models::DomainEvent;
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct UserCreated {
///     user_id: String,
///     email: String,
/// }
///
/// impl DomainEvent for UserCreated {
///     const AGGREGATE_TYPE: &'static str = "user";
///
///     fn event_type(&self) -> &str {
///         "user.created"
///     }
///
///     fn aggregate_id(&self) -> String {
///         self.user_id.clone()
///     }
/// }
/// ```
pub trait DomainEvent: Serialize {
    const AGGREGATE_TYPE: &'static str;

    fn event_type(&self) -> &str;

    fn aggregate_id(&self) -> String;
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
