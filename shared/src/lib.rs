use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const ORDER_CREATED: &str = "order_created";
pub const DELIVERY_ROUTES_GENERATED: &str = "delivery_routes_generated";

/// Name of the message attribute (Kafka header) that carries the event type.
pub const EVENT_TYPE_ATTRIBUTE: &str = "event_type";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreatedEvent {
    pub event_id: String,
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub delivery_address: String,
    pub delivery_city: String,
    pub delivery_country: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub order_timestamp: DateTime<Utc>,
}

impl OrderCreatedEvent {
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).context("Malformed order_created payload")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutesGeneratedEvent {
    pub event_type: String,
}

impl RoutesGeneratedEvent {
    pub fn new() -> Self {
        Self {
            event_type: DELIVERY_ROUTES_GENERATED.to_string(),
        }
    }
}

impl Default for RoutesGeneratedEvent {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses a queue message body, unwrapping a notification envelope
/// (`{"Message": "<json string>", ...}`) when one is present.
pub fn parse_event_body(body: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(body).context("Message body is not valid JSON")?;

    match value.get("Message") {
        Some(Value::String(inner)) => {
            serde_json::from_str(inner).context("Envelope Message is not valid JSON")
        }
        Some(_) => Err(anyhow!("Envelope Message field is not a string")),
        None => Ok(value),
    }
}

pub fn event_type(event: &Value) -> Option<&str> {
    event.get("event_type").and_then(Value::as_str)
}

/// Accepts RFC 3339 timestamps as well as naive ISO-8601 ones, which are read as UTC.
fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;

    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(parsed.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}
