use std::{fmt, sync::Arc};
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    endpoint::{call_guarded, expect_text, Disposition, Endpoint, EndpointKind, Filter},
    error::FlowError,
    message::{Message, CORRELATION_ID, SEQUENCE_NUMBER, SEQUENCE_SIZE},
};

type SplitFn = dyn Fn(&Message) -> anyhow::Result<Vec<Value>> + Send + Sync;

/// Breaks one message into ordered parts sharing a fresh `correlationId`.
///
/// Part filters run before the parts are numbered, so `sequenceSize` only
/// counts parts that survive them. Rejected parts come back as discarded.
#[derive(Clone)]
pub struct Splitter {
    split: Arc<SplitFn>,
    part_filters: Vec<Filter>,
}

impl fmt::Debug for Splitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Splitter")
            .field("part_filters", &self.part_filters.len())
            .finish()
    }
}

impl Splitter {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Message) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    {
        Self {
            split: Arc::new(f),
            part_filters: Vec::new(),
        }
    }

    /// Split a string payload on `delimiter`. An empty string has no parts.
    pub fn delimiter(delimiter: impl Into<String>) -> Self {
        let delimiter = delimiter.into();
        Self::new(move |msg| {
            let text = expect_text(msg)?;
            if text.is_empty() {
                return Ok(Vec::new());
            }
            Ok(text.split(delimiter.as_str()).map(|s| Value::String(s.to_string())).collect())
        })
    }

    /// One part per line; `\r\n` endings are accepted.
    pub fn lines() -> Self {
        Self::new(|msg| {
            Ok(expect_text(msg)?
                .lines()
                .map(|s| Value::String(s.to_string()))
                .collect())
        })
    }

    pub fn array() -> Self {
        Self::new(|msg| match msg.payload() {
            Value::Array(items) => Ok(items.clone()),
            other => anyhow::bail!("expected an array payload, got {}", other),
        })
    }

    pub fn with_part_filter(mut self, filter: Filter) -> Self {
        self.part_filters.push(filter);
        self
    }

    pub fn part_filter_count(&self) -> usize {
        self.part_filters.len()
    }

    fn base_part(parent: &Message, payload: Value) -> Message {
        Message::with_headers(payload, parent.headers().clone())
    }

    pub fn split(&self, parent: &Message) -> Result<Disposition, FlowError> {
        let payloads = call_guarded(|| (self.split)(parent)).map_err(FlowError::Transformation)?;

        let mut kept = Vec::with_capacity(payloads.len());
        let mut discarded = Vec::new();
        'parts: for payload in payloads {
            let part = Self::base_part(parent, payload);
            for filter in &self.part_filters {
                if !filter.accepts(&part)? {
                    discarded.push(part);
                    continue 'parts;
                }
            }
            kept.push(part);
        }

        let correlation_id = Uuid::new_v4().to_string();
        let size = kept.len();
        let emitted = kept
            .into_iter()
            .enumerate()
            .map(|(seq, part)| {
                part.with_merged_headers([
                    (CORRELATION_ID.to_string(), Value::from(correlation_id.clone())),
                    (SEQUENCE_NUMBER.to_string(), Value::from(seq)),
                    (SEQUENCE_SIZE.to_string(), Value::from(size)),
                ])
            })
            .collect();
        Ok(Disposition::emit(emitted).with_discarded(discarded))
    }
}

#[async_trait]
impl Endpoint for Splitter {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Splitter
    }

    async fn process(&self, msg: Message) -> Result<Disposition, FlowError> {
        self.split(&msg)
    }
}
