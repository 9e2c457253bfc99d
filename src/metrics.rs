use std::sync::atomic::{AtomicU64, Ordering};
use opentelemetry::{global, metrics::Counter, KeyValue};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Point-in-time copy of a flow's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub emitted: u64,
    pub discarded: u64,
    pub failed: u64,
    pub released: u64,
    pub expired: u64,
    pub delivered: u64,
}

struct Metric {
    local: AtomicU64,
    otel: Counter<u64>,
}

impl Metric {
    fn new(name: &'static str, description: &'static str) -> Self {
        let meter = global::meter("eipflow");
        Self {
            local: AtomicU64::new(0),
            otel: meter.u64_counter(name).with_description(description).build(),
        }
    }

    fn add(&self, n: u64, attrs: &[KeyValue]) {
        if n == 0 {
            return;
        }
        self.local.fetch_add(n, Ordering::Relaxed);
        self.otel.add(n, attrs);
    }

    fn get(&self) -> u64 {
        self.local.load(Ordering::Relaxed)
    }
}

/// Counters recorded by the engine for one flow. Exported through the
/// global meter provider (a no-op unless telemetry is initialised) and
/// mirrored locally for `Flow::metrics`.
pub struct FlowMetrics {
    attrs: Vec<KeyValue>,
    received: Metric,
    emitted: Metric,
    discarded: Metric,
    failed: Metric,
    released: Metric,
    expired: Metric,
    delivered: Metric,
}

impl FlowMetrics {
    pub fn new(flow: &str) -> Self {
        Self {
            attrs: vec![KeyValue::new("flow", flow.to_string())],
            received: Metric::new("eipflow_messages_received", "Messages taken in by pollers"),
            emitted: Metric::new("eipflow_messages_emitted", "Messages produced by endpoints"),
            discarded: Metric::new("eipflow_messages_discarded", "Messages rejected by filters or dropped"),
            failed: Metric::new("eipflow_messages_failed", "Per-message failures reported"),
            released: Metric::new("eipflow_groups_released", "Correlation groups released"),
            expired: Metric::new("eipflow_groups_expired", "Correlation groups expired"),
            delivered: Metric::new("eipflow_messages_delivered", "Messages handed to sinks"),
        }
    }

    pub fn received(&self, n: u64) {
        self.received.add(n, &self.attrs);
    }

    pub fn emitted(&self, n: u64) {
        self.emitted.add(n, &self.attrs);
    }

    pub fn discarded(&self, n: u64) {
        self.discarded.add(n, &self.attrs);
    }

    pub fn failed(&self) {
        self.failed.add(1, &self.attrs);
    }

    pub fn released(&self) {
        self.released.add(1, &self.attrs);
    }

    pub fn expired(&self) {
        self.expired.add(1, &self.attrs);
    }

    pub fn delivered(&self) {
        self.delivered.add(1, &self.attrs);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.get(),
            emitted: self.emitted.get(),
            discarded: self.discarded.get(),
            failed: self.failed.get(),
            released: self.released.get(),
            expired: self.expired.get(),
            delivered: self.delivered.get(),
        }
    }
}
