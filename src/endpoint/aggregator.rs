use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    correlation::{AppendOutcome, CorrelationGroup, CorrelationStore, DEFAULT_RETENTION},
    endpoint::{call_guarded, Disposition, Endpoint, EndpointKind, SweepOutcome},
    error::FlowError,
    message::{Message, CORRELATION_ID, SEQUENCE_NUMBER, SEQUENCE_SIZE},
};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub enum ReleaseStrategy {
    /// All `sequenceSize` parts arrived.
    SequenceComplete,
    Count(usize),
    Custom(Arc<dyn Fn(&CorrelationGroup) -> bool + Send + Sync>),
}

impl ReleaseStrategy {
    fn should_release(&self, group: &CorrelationGroup) -> bool {
        match self {
            ReleaseStrategy::SequenceComplete => group.is_complete(),
            ReleaseStrategy::Count(n) => group.len() >= *n,
            ReleaseStrategy::Custom(f) => f(group),
        }
    }
}

#[derive(Clone)]
pub enum Reducer {
    /// Strings concatenate, arrays flatten, anything else becomes an array.
    Concat,
    /// String rendering of each payload joined by a separator.
    Join(String),
    Collect,
    Custom(Arc<dyn Fn(&[Message]) -> anyhow::Result<Value> + Send + Sync>),
}

impl Reducer {
    pub fn reduce(&self, parts: &[Message]) -> Result<Value, FlowError> {
        match self {
            Reducer::Concat => Ok(concat(parts)),
            Reducer::Join(sep) => Ok(Value::String(
                parts.iter().map(payload_text).collect::<Vec<_>>().join(sep),
            )),
            Reducer::Collect => Ok(Value::Array(parts.iter().map(|p| p.payload().clone()).collect())),
            Reducer::Custom(f) => call_guarded(|| f(parts)).map_err(FlowError::Aggregation),
        }
    }
}

fn payload_text(msg: &Message) -> String {
    match msg.payload() {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn concat(parts: &[Message]) -> Value {
    let payloads: Vec<&Value> = parts.iter().map(Message::payload).collect();
    if payloads.iter().all(|v| v.is_string()) {
        Value::String(payloads.iter().filter_map(|v| v.as_str()).collect())
    } else if payloads.iter().all(|v| v.is_array()) {
        Value::Array(
            payloads
                .iter()
                .filter_map(|v| v.as_array())
                .flatten()
                .cloned()
                .collect(),
        )
    } else {
        Value::Array(payloads.into_iter().cloned().collect())
    }
}

/// Headers every part carries with the same value, minus the correlation ones.
fn common_headers(parts: &[Message]) -> HashMap<String, Value> {
    let Some((first, rest)) = parts.split_first() else {
        return HashMap::new();
    };
    first
        .headers()
        .iter()
        .filter(|(k, _)| ![CORRELATION_ID, SEQUENCE_NUMBER, SEQUENCE_SIZE].contains(&k.as_str()))
        .filter(|(k, v)| rest.iter().all(|p| p.header(k) == Some(*v)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryPolicy {
    /// Drop the group and report `AggregationTimeout` with its parts.
    #[default]
    Discard,
    /// Reduce whatever arrived and send it downstream.
    EmitPartial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LateArrivalPolicy {
    #[default]
    Error,
    Discard,
}

/// Collects correlated parts and releases one combined message per group.
#[derive(Clone)]
pub struct Aggregator {
    store: Arc<CorrelationStore>,
    release: ReleaseStrategy,
    reducer: Reducer,
    timeout: Option<Duration>,
    sweep_every: Option<Duration>,
    expiry: ExpiryPolicy,
    late_arrival: LateArrivalPolicy,
}

impl fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("timeout", &self.timeout)
            .field("expiry", &self.expiry)
            .field("late_arrival", &self.late_arrival)
            .field("pending", &self.store.pending_groups())
            .finish()
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            store: Arc::new(CorrelationStore::new(DEFAULT_RETENTION)),
            release: ReleaseStrategy::SequenceComplete,
            reducer: Reducer::Concat,
            timeout: None,
            sweep_every: None,
            expiry: ExpiryPolicy::Discard,
            late_arrival: LateArrivalPolicy::Error,
        }
    }

    pub fn release(mut self, strategy: ReleaseStrategy) -> Self {
        self.release = strategy;
        self
    }

    pub fn reducer(mut self, reducer: Reducer) -> Self {
        self.reducer = reducer;
        self
    }

    pub fn join(self, separator: impl Into<String>) -> Self {
        self.reducer(Reducer::Join(separator.into()))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Defaults to a quarter of the group timeout.
    pub fn sweep_every(mut self, interval: Duration) -> Self {
        self.sweep_every = Some(interval);
        self
    }

    pub fn on_expiry(mut self, policy: ExpiryPolicy) -> Self {
        self.expiry = policy;
        self
    }

    pub fn on_late_arrival(mut self, policy: LateArrivalPolicy) -> Self {
        self.late_arrival = policy;
        self
    }

    /// How long closed ids are remembered for late-arrival detection.
    pub fn retention(mut self, retention: Duration) -> Self {
        self.store = Arc::new(CorrelationStore::new(retention));
        self
    }

    pub fn pending_groups(&self) -> usize {
        self.store.pending_groups()
    }

    pub fn store(&self) -> &CorrelationStore {
        &self.store
    }

    fn combine(&self, parts: &[Message]) -> Result<Message, FlowError> {
        let payload = self.reducer.reduce(parts)?;
        Ok(Message::with_headers(payload, common_headers(parts)))
    }

    /// Expire overdue groups as of `now`.
    pub fn expire_at(&self, now: Instant) -> Vec<SweepOutcome> {
        let Some(timeout) = self.timeout else {
            return Vec::new();
        };
        self.store
            .expire(now, timeout)
            .into_iter()
            .map(|group| {
                debug!(correlation_id = %group.correlation_id(), received = group.len(), "correlation group expired");
                match self.expiry {
                    ExpiryPolicy::EmitPartial => match self.combine(group.parts()) {
                        Ok(msg) => SweepOutcome::Emit(msg),
                        Err(e) => SweepOutcome::Failed(e, group.into_parts()),
                    },
                    ExpiryPolicy::Discard => SweepOutcome::Failed(
                        FlowError::AggregationTimeout {
                            correlation_id: group.correlation_id().to_string(),
                            received: group.len(),
                            expected: group.expected_size(),
                        },
                        group.into_parts(),
                    ),
                }
            })
            .collect()
    }
}

#[async_trait]
impl Endpoint for Aggregator {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Aggregator
    }

    async fn process(&self, msg: Message) -> Result<Disposition, FlowError> {
        match self.store.append(msg, |g| self.release.should_release(g))? {
            AppendOutcome::Collecting => Ok(Disposition::consumed()),
            AppendOutcome::Duplicate => {
                debug!("duplicate sequence number ignored");
                Ok(Disposition::consumed())
            }
            AppendOutcome::Released(group) => {
                debug!(correlation_id = %group.correlation_id(), parts = group.len(), "correlation group released");
                match self.combine(group.parts()) {
                    Ok(combined) => Ok(Disposition::single(combined)),
                    Err(e) => Ok(Disposition::failed(e, group.into_parts())),
                }
            }
            AppendOutcome::Late(state, msg) => {
                let cid = msg.correlation_id().unwrap_or_default().to_string();
                match self.late_arrival {
                    LateArrivalPolicy::Error => Err(FlowError::LateArrival(cid)),
                    LateArrivalPolicy::Discard => {
                        warn!(correlation_id = %cid, ?state, "late part discarded");
                        Ok(Disposition::discard(msg))
                    }
                }
            }
        }
    }

    fn sweep_interval(&self) -> Option<Duration> {
        let timeout = self.timeout?;
        Some(self.sweep_every.unwrap_or(timeout / 4).max(MIN_SWEEP_INTERVAL))
    }

    async fn sweep(&self) -> Vec<SweepOutcome> {
        self.expire_at(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Splitter;
    use serde_json::json;

    fn parts_of(text: &str) -> Vec<Message> {
        Splitter::delimiter(",").split(&Message::text(text)).unwrap().emitted
    }

    async fn feed(agg: &Aggregator, parts: Vec<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        for p in parts {
            out.extend(agg.process(p).await.unwrap().emitted);
        }
        out
    }

    #[tokio::test]
    async fn test_join_reconstructs_split() {
        let agg = Aggregator::new().join(",");
        let out = feed(&agg, parts_of("x,y,z")).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload_str(), Some("x,y,z"));
    }

    #[tokio::test]
    async fn test_out_of_order_parts_are_ordered() {
        let agg = Aggregator::new();
        let mut parts = parts_of("a,b,c");
        parts.reverse();
        let out = feed(&agg, parts).await;
        assert_eq!(out[0].payload_str(), Some("abc"));
    }

    #[tokio::test]
    async fn test_never_releases_early() {
        let agg = Aggregator::new();
        let parts = parts_of("1,2,3");
        for p in parts.iter().take(2).cloned() {
            assert!(agg.process(p).await.unwrap().emitted.is_empty());
        }
        assert_eq!(agg.pending_groups(), 1);
    }

    #[tokio::test]
    async fn test_late_arrival_policies() {
        let agg = Aggregator::new();
        let parts = parts_of("a,b");
        feed(&agg, parts.clone()).await;
        let err = agg.process(parts[0].clone()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::LateArrival);

        let lenient = Aggregator::new().on_late_arrival(LateArrivalPolicy::Discard);
        feed(&lenient, parts.clone()).await;
        let d = lenient.process(parts[1].clone()).await.unwrap();
        assert!(d.emitted.is_empty());
        assert_eq!(d.discarded.len(), 1);
    }

    #[tokio::test]
    async fn test_output_keeps_common_headers_only() {
        let base = Message::text("a,b").with_header("source", "s1");
        let mut parts = Splitter::delimiter(",").split(&base).unwrap().emitted;
        parts[1] = parts[1].with_header("extra", 1);

        let out = feed(&Aggregator::new(), parts.clone()).await;
        let headers = out[0].headers();
        assert_eq!(headers.get("source"), Some(&json!("s1")));
        assert!(!headers.contains_key("extra"));
        assert!(!headers.contains_key(CORRELATION_ID));
        assert!(parts.iter().all(|p| p.id() != out[0].id()));
    }

    #[tokio::test]
    async fn test_count_release_and_collect() {
        let agg = Aggregator::new()
            .release(ReleaseStrategy::Count(2))
            .reducer(Reducer::Collect);
        let parts: Vec<Message> = (0..2)
            .map(|i| Message::new(json!(i)).with_header(CORRELATION_ID, "batch"))
            .collect();
        let out = feed(&agg, parts).await;
        assert_eq!(out[0].payload(), &json!([0, 1]));
    }

    #[tokio::test]
    async fn test_failed_reduce_keeps_every_part() {
        let agg = Aggregator::new().reducer(Reducer::Custom(Arc::new(|_| anyhow::bail!("cannot combine"))));
        let parts = parts_of("a,b,c");
        let mut last = Disposition::default();
        for p in parts.clone() {
            last = agg.process(p).await.unwrap();
        }
        assert!(last.emitted.is_empty());
        let (err, reported) = last.failed.expect("release failure");
        assert_eq!(err.kind(), crate::error::ErrorKind::Aggregation);
        assert_eq!(reported, parts);
        assert_eq!(agg.pending_groups(), 0);
    }

    #[test]
    fn test_concat_variants() {
        let arrays = vec![Message::new(json!([1])), Message::new(json!([2, 3]))];
        assert_eq!(concat(&arrays), json!([1, 2, 3]));
        let mixed = vec![Message::new(json!(1)), Message::text("a")];
        assert_eq!(concat(&mixed), json!([1, "a"]));
    }

    #[tokio::test]
    async fn test_expiry_discard_reports_timeout() {
        let agg = Aggregator::new().timeout(Duration::from_millis(100));
        let parts = parts_of("only,missing");
        agg.process(parts[0].clone()).await.unwrap();

        let outcomes = agg.expire_at(Instant::now() + Duration::from_millis(150));
        assert_eq!(outcomes.len(), 1);
        match &outcomes[0] {
            SweepOutcome::Failed(FlowError::AggregationTimeout { received, expected, .. }, originals) => {
                assert_eq!(*received, 1);
                assert_eq!(*expected, Some(2));
                assert_eq!(originals, &vec![parts[0].clone()]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(agg.pending_groups(), 0);
    }

    #[tokio::test]
    async fn test_expiry_emit_partial() {
        let agg = Aggregator::new()
            .timeout(Duration::from_millis(50))
            .on_expiry(ExpiryPolicy::EmitPartial);
        let parts = parts_of("a,b,c");
        agg.process(parts[0].clone()).await.unwrap();
        agg.process(parts[2].clone()).await.unwrap();

        let outcomes = agg.expire_at(Instant::now() + Duration::from_secs(1));
        assert!(matches!(&outcomes[..], [SweepOutcome::Emit(m)] if m.payload_str() == Some("ac")));
    }

    #[test]
    fn test_sweep_interval_follows_timeout() {
        assert_eq!(Aggregator::new().sweep_interval(), None);
        let agg = Aggregator::new().timeout(Duration::from_millis(100));
        assert_eq!(agg.sweep_interval(), Some(Duration::from_millis(25)));
    }
}
