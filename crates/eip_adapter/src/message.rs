use std::collections::HashMap;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Header carrying the id shared by all parts of one split message.
pub const CORRELATION_ID: &str = "correlationId";
/// Header carrying the 0-based position of a part inside its split group.
pub const SEQUENCE_NUMBER: &str = "sequenceNumber";
/// Header carrying the number of parts in a split group.
pub const SEQUENCE_SIZE: &str = "sequenceSize";

/// Immutable envelope flowing through channels and endpoints.
///
/// Every "modification" returns a new message with a fresh id and timestamp,
/// the original is never touched.
#[derive(Debug, Clone, PartialEq, JsonSchema, Serialize, Deserialize)]
pub struct Message {
    id: String,
    timestamp: DateTime<Utc>,
    payload: Value,
    #[serde(default)]
    headers: HashMap<String, Value>,
}

impl Message {
    pub fn new(payload: Value) -> Self {
        Self::with_headers(payload, HashMap::new())
    }

    /// Convenience for string payloads.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Value::String(text.into()))
    }

    pub fn with_headers(payload: Value, headers: HashMap<String, Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            payload,
            headers,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// The payload as a string slice, if it is a JSON string.
    pub fn payload_str(&self) -> Option<&str> {
        self.payload.as_str()
    }

    pub fn headers(&self) -> &HashMap<String, Value> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(Value::as_str)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.header_str(CORRELATION_ID)
    }

    pub fn sequence_number(&self) -> Option<usize> {
        self.header(SEQUENCE_NUMBER)
            .and_then(Value::as_u64)
            .map(|n| n as usize)
    }

    pub fn sequence_size(&self) -> Option<usize> {
        self.header(SEQUENCE_SIZE)
            .and_then(Value::as_u64)
            .map(|n| n as usize)
    }

    /// New message with the same headers and a different payload.
    pub fn with_payload(&self, payload: Value) -> Message {
        Message::with_headers(payload, self.headers.clone())
    }

    /// New message with one header added or replaced.
    pub fn with_header(&self, name: impl Into<String>, value: impl Into<Value>) -> Message {
        let mut headers = self.headers.clone();
        headers.insert(name.into(), value.into());
        Message::with_headers(self.payload.clone(), headers)
    }

    /// New message with several headers merged in, overwriting existing keys.
    pub fn with_merged_headers<I>(&self, extra: I) -> Message
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut headers = self.headers.clone();
        headers.extend(extra);
        Message::with_headers(self.payload.clone(), headers)
    }

    pub fn without_header(&self, name: &str) -> Message {
        let mut headers = self.headers.clone();
        headers.remove(name);
        Message::with_headers(self.payload.clone(), headers)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::text(text)
    }
}

impl From<Value> for Message {
    fn from(payload: Value) -> Self {
        Message::new(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_creation() {
        let msg = Message::new(json!({"key": "value"}));
        assert!(!msg.id().is_empty());
        assert_eq!(msg.payload(), &json!({"key": "value"}));
        assert!(msg.headers().is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Message::text("a");
        let b = Message::text("a");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_with_header_leaves_original_untouched() {
        let msg = Message::text("x");
        let enriched = msg.with_header("foo", "bar");

        assert_eq!(enriched.header_str("foo"), Some("bar"));
        assert!(msg.header("foo").is_none());
        assert_ne!(msg.id(), enriched.id());
    }

    #[test]
    fn test_header_overwrite() {
        let msg = Message::text("x")
            .with_header("key", "first")
            .with_header("key", "second");

        assert_eq!(msg.header_str("key"), Some("second"));
    }

    #[test]
    fn test_correlation_accessors() {
        let msg = Message::text("part")
            .with_header(CORRELATION_ID, "c-1")
            .with_header(SEQUENCE_NUMBER, 2)
            .with_header(SEQUENCE_SIZE, 3);

        assert_eq!(msg.correlation_id(), Some("c-1"));
        assert_eq!(msg.sequence_number(), Some(2));
        assert_eq!(msg.sequence_size(), Some(3));
    }

    #[test]
    fn test_with_payload_keeps_headers() {
        let msg = Message::text("lower").with_header("source", "test");
        let upper = msg.with_payload(json!("LOWER"));

        assert_eq!(upper.payload_str(), Some("LOWER"));
        assert_eq!(upper.header_str("source"), Some("test"));
    }

    #[test]
    fn test_without_header() {
        let msg = Message::text("x").with_header("to_remove", "bye");
        assert!(msg.without_header("to_remove").header("to_remove").is_none());
    }
}
