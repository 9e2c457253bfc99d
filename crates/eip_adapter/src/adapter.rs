use std::sync::Arc;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::Message;

/// Errors that a source or sink adapter can return.
#[derive(Error, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub enum AdapterError {
    /// Reading from or writing to the filesystem failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// The payload could not be turned into what the adapter needs.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The target refused the message (e.g. file exists in `fail` mode).
    #[error("rejected by target: {0}")]
    Rejected(String),

    /// The adapter returned an unspecified failure.
    #[error("adapter error: {0}")]
    Other(String),
}

impl From<std::io::Error> for AdapterError {
    fn from(err: std::io::Error) -> AdapterError {
        AdapterError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> AdapterError {
        AdapterError::InvalidPayload(err.to_string())
    }
}

impl From<anyhow::Error> for AdapterError {
    fn from(err: anyhow::Error) -> AdapterError {
        AdapterError::Other(err.to_string())
    }
}

/// Inbound side: called once per poller tick.
///
/// `fetch` must be safe to call repeatedly and return `Ok(None)` when nothing
/// is available rather than an error.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> String;

    async fn fetch(&self) -> Result<Option<Message>, AdapterError>;

    /// Give back a message the engine could not accept.
    ///
    /// Returns `true` when the source will hand the item out again. Sources
    /// that are naturally re-fetchable can rely on the default.
    async fn requeue(&self, _msg: Message) -> bool {
        false
    }
}

/// Outbound side. Retries, if any, are the adapter's own business.
#[async_trait]
pub trait SinkAdapter: Send + Sync {
    fn name(&self) -> String;

    async fn deliver(&self, msg: &Message) -> Result<(), AdapterError>;
}

#[async_trait]
impl<T: SourceAdapter + ?Sized> SourceAdapter for Arc<T> {
    fn name(&self) -> String {
        (**self).name()
    }

    async fn fetch(&self) -> Result<Option<Message>, AdapterError> {
        (**self).fetch().await
    }

    async fn requeue(&self, msg: Message) -> bool {
        (**self).requeue(msg).await
    }
}

#[async_trait]
impl<T: SinkAdapter + ?Sized> SinkAdapter for Arc<T> {
    fn name(&self) -> String {
        (**self).name()
    }

    async fn deliver(&self, msg: &Message) -> Result<(), AdapterError> {
        (**self).deliver(msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_error_display() {
        let err = AdapterError::Rejected("exists".to_string());
        assert_eq!(format!("{}", err), "rejected by target: exists");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: AdapterError = io.into();
        assert!(matches!(err, AdapterError::Io(ref m) if m.contains("gone")));
    }
}
