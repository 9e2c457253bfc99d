pub mod aggregator;
pub mod filter;
pub mod outbound;
pub mod service;
pub mod splitter;
pub mod transformer;

use std::{any::Any, panic::AssertUnwindSafe, time::Duration};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::{error::FlowError, message::Message};

pub use aggregator::{Aggregator, ExpiryPolicy, LateArrivalPolicy, Reducer, ReleaseStrategy};
pub use filter::Filter;
pub use outbound::OutboundAdapter;
pub use service::ServiceActivator;
pub use splitter::Splitter;
pub use transformer::Transformer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EndpointKind {
    Transformer,
    Filter,
    Splitter,
    Aggregator,
    ServiceActivator,
    OutboundAdapter,
}

/// What an endpoint did with one input message.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Disposition {
    /// Sent downstream in order.
    pub emitted: Vec<Message>,
    /// Routed to the discard channel when the flow has one.
    pub discarded: Vec<Message>,
    /// A failure that involves more than the input message, reported with all of them.
    pub failed: Option<(FlowError, Vec<Message>)>,
}

impl Disposition {
    pub fn emit(messages: Vec<Message>) -> Self {
        Self { emitted: messages, ..Self::default() }
    }

    pub fn single(msg: Message) -> Self {
        Self::emit(vec![msg])
    }

    pub fn discard(msg: Message) -> Self {
        Self { discarded: vec![msg], ..Self::default() }
    }

    pub fn failed(err: FlowError, messages: Vec<Message>) -> Self {
        Self { failed: Some((err, messages)), ..Self::default() }
    }

    /// Nothing goes downstream and nothing is discarded.
    pub fn consumed() -> Self {
        Self::default()
    }

    pub fn with_discarded(mut self, discarded: Vec<Message>) -> Self {
        self.discarded.extend(discarded);
        self
    }
}

/// Produced by a periodic sweep (aggregator expiry).
#[derive(Debug, Clone)]
pub enum SweepOutcome {
    Emit(Message),
    Failed(FlowError, Vec<Message>),
}

/// A stage of a flow. Implementations must tolerate concurrent `process`
/// calls when the stage runs with more than one worker.
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn kind(&self) -> EndpointKind;

    async fn process(&self, msg: Message) -> Result<Disposition, FlowError>;

    /// How often the flow should call `sweep`, if at all.
    fn sweep_interval(&self) -> Option<Duration> {
        None
    }

    async fn sweep(&self) -> Vec<SweepOutcome> {
        Vec::new()
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run a user handler, turning both its error and a panic into a plain message.
pub(crate) fn call_guarded<T>(f: impl FnOnce() -> anyhow::Result<T>) -> Result<T, String> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(payload) => Err(format!("handler panicked: {}", panic_message(payload))),
    }
}

/// Error reported when an endpoint of `kind` panics outside its own guard.
pub(crate) fn panic_error(kind: EndpointKind, detail: String) -> FlowError {
    let cause = format!("{} panicked: {}", kind, detail);
    match kind {
        EndpointKind::Filter => FlowError::FilterEvaluation(cause),
        EndpointKind::Aggregator => FlowError::Aggregation(cause),
        EndpointKind::OutboundAdapter => FlowError::Delivery {
            sink: kind.to_string(),
            cause: eip_adapter::AdapterError::Other(cause),
        },
        _ => FlowError::Transformation(cause),
    }
}

/// String payload or a transformation error naming what was found instead.
pub(crate) fn expect_text(msg: &Message) -> anyhow::Result<&str> {
    msg.payload_str()
        .ok_or_else(|| anyhow::anyhow!("expected a string payload, got {}", msg.payload()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_guarded_catches_panic() {
        let res: Result<(), String> = call_guarded(|| panic!("kaboom"));
        assert_eq!(res.unwrap_err(), "handler panicked: kaboom");
    }

    #[test]
    fn test_call_guarded_formats_error_chain() {
        let res: Result<(), String> =
            call_guarded(|| Err(anyhow::anyhow!("inner")).map_err(|e| e.context("outer")));
        assert_eq!(res.unwrap_err(), "outer: inner");
    }

    #[test]
    fn test_panic_error_kind() {
        let err = panic_error(EndpointKind::Filter, "x".into());
        assert_eq!(err.kind(), crate::error::ErrorKind::FilterEvaluation);
        assert_eq!(EndpointKind::ServiceActivator.to_string(), "service_activator");
    }
}
