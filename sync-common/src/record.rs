use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

/// A single upstream entity, e.g. a CRM customer or an inventory product.
///
/// The record is kept as the JSON object upstream sent: field order, number formatting and
/// fields this crate knows nothing about are written back untouched when the record is
/// published. Only `id` and `source` are ever looked at.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    pub fields: Map<String, Value>,
}

impl Record {
    /// The natural identifier. Upstream ids are strings in some services and integers in
    /// others; blank strings and any other JSON type count as no id.
    pub fn natural_id(&self) -> Option<String> {
        match self.fields.get("id")? {
            Value::String(id) if !id.trim().is_empty() => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }

    pub fn source(&self) -> Option<&str> {
        self.fields.get("source").and_then(Value::as_str)
    }

    /// Tag the record with the source it was fetched from, unless upstream already set one.
    pub fn with_source(mut self, source: &str) -> Self {
        if matches!(self.fields.get("source"), None | Some(Value::Null)) {
            self.fields
                .insert("source".to_owned(), Value::String(source.to_owned()));
        }
        self
    }
}

/// The unit written to a topic: one per record.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub key: String,
    pub payload: Record,
    pub timestamp: OffsetDateTime,
}

impl Message {
    /// Build the message for `record`, keyed by its natural id or by a fresh surrogate.
    pub fn for_record(topic: &str, payload: Record) -> Self {
        let key = payload
            .natural_id()
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        Self {
            topic: topic.to_owned(),
            key,
            payload,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// Wire format of the message value.
    pub fn encode_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.payload)
    }

    pub fn timestamp_millis(&self) -> i64 {
        (self.timestamp.unix_timestamp_nanos() / 1_000_000) as i64
    }
}
