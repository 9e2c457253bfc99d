use eip_adapter::AdapterError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use thiserror::Error;

/// Tag carried by error messages so consumers of an error channel can
/// dispatch on the failure without parsing the cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, EnumString)]
pub enum ErrorKind {
    #[strum(serialize = "TransformationError")]
    Transformation,
    #[strum(serialize = "FilterEvaluationError")]
    FilterEvaluation,
    #[strum(serialize = "ChannelFullError")]
    ChannelFull,
    #[strum(serialize = "ChannelTimeoutError")]
    ChannelTimeout,
    #[strum(serialize = "ChannelClosedError")]
    ChannelClosed,
    #[strum(serialize = "AggregationTimeoutError")]
    AggregationTimeout,
    #[strum(serialize = "LateArrivalError")]
    LateArrival,
    #[strum(serialize = "AggregationError")]
    Aggregation,
    #[strum(serialize = "DeliveryError")]
    Delivery,
    #[strum(serialize = "ConfigError")]
    Config,
    #[strum(serialize = "LifecycleError")]
    Lifecycle,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlowError {
    /// A transformer, splitter or service activator failed (or panicked).
    #[error("transformation failed: {0}")]
    Transformation(String),

    /// A filter predicate could not be evaluated.
    #[error("filter could not be evaluated: {0}")]
    FilterEvaluation(String),

    /// Bounded channel full and the channel fails fast.
    #[error("channel `{0}` is full")]
    ChannelFull(String),

    #[error("channel `{channel}` timed out after {timeout_ms} ms")]
    ChannelTimeout { channel: String, timeout_ms: u64 },

    /// The owning flow is stopped.
    #[error("channel `{0}` is closed")]
    ChannelClosed(String),

    #[error("correlation group `{correlation_id}` expired with {received} part(s), expected {expected:?}")]
    AggregationTimeout {
        correlation_id: String,
        received: usize,
        expected: Option<usize>,
    },

    /// A part arrived for a group that was already released or expired.
    #[error("late part for closed correlation group `{0}`")]
    LateArrival(String),

    #[error("aggregation failed: {0}")]
    Aggregation(String),

    #[error("delivery to `{sink}` failed: {cause}")]
    Delivery {
        sink: String,
        #[source]
        cause: AdapterError,
    },

    #[error("invalid flow configuration: {0}")]
    Config(String),

    #[error("lifecycle error: {0}")]
    Lifecycle(String),
}

impl FlowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::Transformation(_) => ErrorKind::Transformation,
            FlowError::FilterEvaluation(_) => ErrorKind::FilterEvaluation,
            FlowError::ChannelFull(_) => ErrorKind::ChannelFull,
            FlowError::ChannelTimeout { .. } => ErrorKind::ChannelTimeout,
            FlowError::ChannelClosed(_) => ErrorKind::ChannelClosed,
            FlowError::AggregationTimeout { .. } => ErrorKind::AggregationTimeout,
            FlowError::LateArrival(_) => ErrorKind::LateArrival,
            FlowError::Aggregation(_) => ErrorKind::Aggregation,
            FlowError::Delivery { .. } => ErrorKind::Delivery,
            FlowError::Config(_) => ErrorKind::Config,
            FlowError::Lifecycle(_) => ErrorKind::Lifecycle,
        }
    }

    /// Backpressure outcomes the producer may retry later.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, FlowError::ChannelFull(_) | FlowError::ChannelTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_kind_display_matches_error_names() {
        assert_eq!(ErrorKind::ChannelFull.to_string(), "ChannelFullError");
        assert_eq!(ErrorKind::AggregationTimeout.to_string(), "AggregationTimeoutError");
        assert_eq!(ErrorKind::from_str("DeliveryError").unwrap(), ErrorKind::Delivery);
    }

    #[test]
    fn test_error_kind_mapping() {
        let err = FlowError::ChannelTimeout { channel: "c".into(), timeout_ms: 10 };
        assert_eq!(err.kind(), ErrorKind::ChannelTimeout);
        assert!(err.is_backpressure());
        assert!(!FlowError::ChannelClosed("c".into()).is_backpressure());
    }

    #[test]
    fn test_error_display() {
        let err = FlowError::AggregationTimeout {
            correlation_id: "abc".into(),
            received: 1,
            expected: Some(2),
        };
        assert_eq!(
            format!("{}", err),
            "correlation group `abc` expired with 1 part(s), expected Some(2)"
        );
    }
}
