use std::{fmt, sync::Arc};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::{
    endpoint::{call_guarded, expect_text, Disposition, Endpoint, EndpointKind},
    error::FlowError,
    message::Message,
};

type PredicateFn = dyn Fn(&Message) -> anyhow::Result<bool> + Send + Sync;

/// Passes a message through unchanged when the predicate holds, discards it
/// otherwise. Predicates must be free of side effects.
#[derive(Clone)]
pub struct Filter(pub Arc<PredicateFn>);

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Filter(..)")
    }
}

impl Filter {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        Filter(Arc::new(move |msg| Ok(predicate(msg))))
    }

    /// A predicate that can fail to evaluate.
    pub fn try_new<F>(predicate: F) -> Self
    where
        F: Fn(&Message) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Filter(Arc::new(predicate))
    }

    pub fn accepts(&self, msg: &Message) -> Result<bool, FlowError> {
        call_guarded(|| (self.0)(msg)).map_err(FlowError::FilterEvaluation)
    }

    /// Drops empty strings, empty arrays and `null`. Whitespace counts as content.
    pub fn non_empty() -> Self {
        Self::new(|msg| match msg.payload() {
            Value::String(s) => !s.is_empty(),
            Value::Null => false,
            Value::Array(items) => !items.is_empty(),
            _ => true,
        })
    }

    /// Like `non_empty`, but whitespace-only strings are dropped too.
    pub fn non_blank() -> Self {
        Self::new(|msg| match msg.payload() {
            Value::String(s) => !s.trim().is_empty(),
            Value::Null => false,
            Value::Array(items) => !items.is_empty(),
            _ => true,
        })
    }

    pub fn min_length(min: usize) -> Self {
        Self::try_new(move |msg| Ok(expect_text(msg)?.chars().count() >= min))
    }

    pub fn matches(pattern: &str) -> Result<Self, FlowError> {
        let re = Regex::new(pattern)
            .map_err(|e| FlowError::Config(format!("invalid filter pattern `{}`: {}", pattern, e)))?;
        Ok(Self::try_new(move |msg| Ok(re.is_match(expect_text(msg)?))))
    }

    pub fn header_present(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(move |msg| msg.header(&name).is_some())
    }

    pub fn header_equals(name: impl Into<String>, value: impl Into<Value>) -> Self {
        let (name, value) = (name.into(), value.into());
        Self::new(move |msg| msg.header(&name) == Some(&value))
    }
}

#[async_trait]
impl Endpoint for Filter {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Filter
    }

    async fn process(&self, msg: Message) -> Result<Disposition, FlowError> {
        if self.accepts(&msg)? {
            Ok(Disposition::single(msg))
        } else {
            Ok(Disposition::discard(msg))
        }
    }
}
