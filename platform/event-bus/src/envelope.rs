//! # Outbox Event
//!
//! Wire format for every event the relay publishes to the broker.
//!
//! ## Fields
//!
//! - `event_id`: Outbox record id, stable across re-publishes (consumer dedup key)
//! - `event_type`: Business event tag (e.g., "user.created")
//! - `aggregate_type`: Kind of entity the event concerns (e.g., "user")
//! - `aggregate_id`: Identifier of that entity
//! - `payload`: Self-contained event body (JSON object)
//! - `occurred_at`: When the record was written to the outbox

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Event as it travels over the broker
///
/// # Examples
///
/// ```rust
/// use event_bus::OutboxEvent;
/// use serde_json::json;
///
/// let payload = json!({"user_id": "42", "email": "ann@example.com"});
/// let event = OutboxEvent::new(
///     "user.created".to_string(),
///     "user".to_string(),
///     "42".to_string(),
///     payload.as_object().cloned().unwrap_or_default(),
/// );
///
/// assert_eq!(event.aggregate_type, "user");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Outbox record identifier
    pub event_id: Uuid,

    /// Business event tag
    pub event_type: String,

    /// Domain entity kind, drives topic routing
    pub aggregate_type: String,

    /// Domain entity identifier
    pub aggregate_id: String,

    /// Event body
    pub payload: Map<String, Value>,

    /// When the event was recorded in the outbox
    pub occurred_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// Create a new event with a fresh id and the current timestamp
    pub fn new(
        event_type: String,
        aggregate_type: String,
        aggregate_id: String,
        payload: Map<String, Value>,
    ) -> Self {
        Self::with_event_id(
            Uuid::new_v4(),
            event_type,
            aggregate_type,
            aggregate_id,
            payload,
        )
    }

    /// Create an event carrying an existing id (the outbox record id)
    pub fn with_event_id(
        event_id: Uuid,
        event_type: String,
        aggregate_type: String,
        aggregate_id: String,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            event_id,
            event_type,
            aggregate_type,
            aggregate_id,
            payload,
            occurred_at: Utc::now(),
        }
    }

    /// Override the recorded timestamp
    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    /// Serialize to the JSON bytes sent over the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Validate the routing fields of an event
///
/// # Validation Rules
///
/// - `event_type`: Must be non-empty
/// - `aggregate_type`: Must be non-empty
/// - `aggregate_id`: Must be non-empty
///
/// # Errors
///
/// Returns a descriptive error string if validation fails
pub fn validate_event_fields(
    event_type: &str,
    aggregate_type: &str,
    aggregate_id: &str,
) -> Result<(), String> {
    if event_type.trim().is_empty() {
        return Err("event_type cannot be empty".to_string());
    }

    if aggregate_type.trim().is_empty() {
        return Err("aggregate_type cannot be empty".to_string());
    }

    if aggregate_id.trim().is_empty() {
        return Err("aggregate_id cannot be empty".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Map<String, Value> {
        json!({"user_id": "u-1", "name": "Ann"})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_event_creation() {
        let event = OutboxEvent::new(
            "user.created".to_string(),
            "user".to_string(),
            "u-1".to_string(),
            payload(),
        );

        assert_eq!(event.event_type, "user.created");
        assert_eq!(event.aggregate_id, "u-1");
        assert_eq!(event.payload.get("name"), Some(&json!("Ann")));
    }

    #[test]
    fn test_explicit_event_id_is_kept() {
        let id = Uuid::new_v4();
        let event = OutboxEvent::with_event_id(
            id,
            "chat.created".to_string(),
            "chat".to_string(),
            "c-1".to_string(),
            Map::new(),
        );

        assert_eq!(event.event_id, id);
    }

    #[test]
    fn test_wire_format_fields() {
        let event = OutboxEvent::new(
            "user.created".to_string(),
            "user".to_string(),
            "u-1".to_string(),
            payload(),
        );

        let bytes = event.to_bytes().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["event_type"], "user.created");
        assert_eq!(value["aggregate_type"], "user");
        assert_eq!(value["aggregate_id"], "u-1");
        assert_eq!(value["payload"]["user_id"], "u-1");
        assert_eq!(value["event_id"], event.event_id.to_string());
        assert!(value["occurred_at"].is_string());
    }

    #[test]
    fn test_validate_event_fields_valid() {
        assert!(validate_event_fields("user.created", "user", "u-1").is_ok());
    }

    #[test]
    fn test_validate_event_fields_rejects_blank() {
        assert!(validate_event_fields("", "user", "u-1").is_err());
        assert!(validate_event_fields("user.created", "  ", "u-1").is_err());
        assert!(validate_event_fields("user.created", "user", "").is_err());
    }
}
