use std::{fmt, sync::Arc};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::{
    endpoint::{call_guarded, expect_text, Disposition, Endpoint, EndpointKind},
    error::FlowError,
    message::Message,
};

type TransformFn = dyn Fn(&Message) -> anyhow::Result<Message> + Send + Sync;

/// Maps one message to one message. The input is never mutated; helpers
/// derive a new message from it.
#[derive(Clone)]
pub struct Transformer(pub Arc<TransformFn>);

impl fmt::Debug for Transformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transformer(..)")
    }
}

impl Transformer {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Message) -> anyhow::Result<Message> + Send + Sync + 'static,
    {
        Transformer(Arc::new(f))
    }

    /// Replace the payload, keep the headers.
    pub fn payload<F>(f: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::new(move |msg| Ok(msg.with_payload(f(msg.payload())?)))
    }

    /// String payload in, string payload out. Other payloads are rejected.
    pub fn text<F>(f: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self::new(move |msg| Ok(msg.with_payload(Value::String(f(expect_text(msg)?)))))
    }

    pub fn upper_case() -> Self {
        Self::text(|s| s.to_uppercase())
    }

    pub fn lower_case() -> Self {
        Self::text(|s| s.to_lowercase())
    }

    pub fn trim() -> Self {
        Self::text(|s| s.trim().to_string())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self::text(move |s| format!("{}{}", prefix, s))
    }

    pub fn suffix(suffix: impl Into<String>) -> Self {
        let suffix = suffix.into();
        Self::text(move |s| format!("{}{}", s, suffix))
    }

    pub fn replace(from: impl Into<String>, to: impl Into<String>) -> Self {
        let (from, to) = (from.into(), to.into());
        Self::text(move |s| s.replace(&from, &to))
    }

    /// `"[<epoch millis>] <payload>"`
    pub fn stamp() -> Self {
        Self::text(|s| format!("[{}] {}", Utc::now().timestamp_millis(), s))
    }

    pub fn header(name: impl Into<String>, value: impl Into<Value>) -> Self {
        let (name, value) = (name.into(), value.into());
        Self::new(move |msg| Ok(msg.with_header(name.clone(), value.clone())))
    }

    /// Apply `next` to the output of `self`.
    pub fn then(self, next: Transformer) -> Self {
        Self::new(move |msg| {
            let mid = (self.0)(msg)?;
            (next.0)(&mid)
        })
    }

    pub fn apply(&self, msg: &Message) -> Result<Message, FlowError> {
        call_guarded(|| (self.0)(msg)).map_err(FlowError::Transformation)
    }
}

#[async_trait]
impl Endpoint for Transformer {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Transformer
    }

    async fn process(&self, msg: Message) -> Result<Disposition, FlowError> {
        self.apply(&msg).map(Disposition::single)
    }
}
