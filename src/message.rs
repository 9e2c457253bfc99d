use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub use eip_adapter::message::{Message, CORRELATION_ID, SEQUENCE_NUMBER, SEQUENCE_SIZE};

use crate::error::{ErrorKind, FlowError};

pub const ERROR_KIND: &str = "errorKind";
pub const ORIGINAL_ID: &str = "originalId";
pub const FAILED_ENDPOINT: &str = "failedEndpoint";

/// Payload of a message published on a flow's error channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub cause: String,
    pub endpoint: Option<String>,
    /// The message(s) that were being processed. An expired correlation
    /// group carries all of its parts.
    pub original: Vec<Message>,
}

impl ErrorPayload {
    pub fn from_message(msg: &Message) -> Option<ErrorPayload> {
        serde_json::from_value(msg.payload().clone()).ok()
    }
}

/// Wrap a failure into a message for the error channel.
pub fn error_message(err: &FlowError, endpoint: Option<&str>, original: Vec<Message>) -> Message {
    let first_id = original.first().map(|m| m.id().to_string());
    let payload = ErrorPayload {
        kind: err.kind(),
        cause: err.to_string(),
        endpoint: endpoint.map(str::to_string),
        original,
    };
    let body = serde_json::to_value(&payload)
        .unwrap_or_else(|e| json!({ "kind": err.kind(), "cause": err.to_string(), "encoding": e.to_string() }));

    let mut msg = Message::new(body).with_header(ERROR_KIND, err.kind().to_string());
    if let Some(id) = first_id {
        msg = msg.with_header(ORIGINAL_ID, id);
    }
    if let Some(ep) = endpoint {
        msg = msg.with_header(FAILED_ENDPOINT, ep);
    }
    msg
}
