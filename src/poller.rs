use std::{sync::Arc, time::Duration};
use eip_adapter::SourceAdapter;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    channel::{ChannelMode, ChannelRef},
    message::Message,
    metrics::FlowMetrics,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Wait this long after each poll has finished.
    FixedDelay(#[schemars(with = "u64")] #[serde(with = "millis")] Duration),
    /// Poll on a fixed schedule; ticks missed while busy are skipped.
    FixedRate(#[schemars(with = "u64")] #[serde(with = "millis")] Duration),
}

mod millis {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Drives a `SourceAdapter` on a timer and hands what it fetches to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Poller {
    trigger: Trigger,
    initial_delay: Duration,
    max_messages_per_poll: usize,
}

impl Poller {
    pub fn fixed_delay(delay: Duration) -> Self {
        Self::with_trigger(Trigger::FixedDelay(delay))
    }

    pub fn fixed_rate(period: Duration) -> Self {
        Self::with_trigger(Trigger::FixedRate(period))
    }

    pub fn with_trigger(trigger: Trigger) -> Self {
        Self {
            trigger,
            initial_delay: Duration::ZERO,
            max_messages_per_poll: 1,
        }
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Values below 1 are treated as 1.
    pub fn max_messages_per_poll(mut self, max: usize) -> Self {
        self.max_messages_per_poll = max.max(1);
        self
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    pub(crate) fn spawn(
        &self,
        flow: String,
        source: Arc<dyn SourceAdapter>,
        channel: ChannelRef,
        metrics: Arc<FlowMetrics>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let task = PollerTask {
            poller: self.clone(),
            flow,
            source,
            channel,
            metrics,
            cancel,
            pending: None,
        };
        tokio::spawn(task.run())
    }
}

struct PollerTask {
    poller: Poller,
    flow: String,
    source: Arc<dyn SourceAdapter>,
    channel: ChannelRef,
    metrics: Arc<FlowMetrics>,
    cancel: CancellationToken,
    /// Fetched but not yet accepted by the channel.
    pending: Option<Message>,
}

enum Handoff {
    Accepted,
    Rejected,
    Cancelled,
}

impl PollerTask {
    async fn run(mut self) {
        info!(flow = %self.flow, source = %self.source.name(), channel = %self.channel.name(), "poller started");

        let start = Instant::now() + self.poller.initial_delay;
        let mut ticker: Option<Interval> = match self.poller.trigger {
            Trigger::FixedRate(period) => {
                let mut t = interval_at(start, period.max(Duration::from_millis(1)));
                t.set_missed_tick_behavior(MissedTickBehavior::Skip);
                Some(t)
            }
            Trigger::FixedDelay(_) => None,
        };

        if ticker.is_none() && !self.sleep_or_cancel(self.poller.initial_delay).await {
            return self.finish().await;
        }

        loop {
            if let Some(t) = ticker.as_mut() {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    _ = t.tick() => {}
                }
            }

            if !self.poll_once().await {
                break;
            }

            if let Trigger::FixedDelay(delay) = self.poller.trigger {
                if !self.sleep_or_cancel(delay).await {
                    break;
                }
            }
        }
        self.finish().await
    }

    /// `false` if cancelled while waiting.
    async fn sleep_or_cancel(&self, d: Duration) -> bool {
        if d.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(d) => true,
        }
    }

    /// One tick. Returns `false` when the poller was cancelled mid-way.
    async fn poll_once(&mut self) -> bool {
        for _ in 0..self.poller.max_messages_per_poll {
            if self.cancel.is_cancelled() {
                return false;
            }
            let msg = match self.pending.take() {
                Some(msg) => msg,
                None => match self.source.fetch().await {
                    Ok(Some(msg)) => {
                        self.metrics.received(1);
                        msg
                    }
                    Ok(None) => return true,
                    Err(e) => {
                        warn!(flow = %self.flow, source = %self.source.name(), "fetch failed, retrying next tick: {}", e);
                        return true;
                    }
                },
            };

            match self.hand_off(msg).await {
                Handoff::Accepted => {}
                Handoff::Rejected => return true,
                Handoff::Cancelled => return false,
            }
        }
        true
    }

    async fn hand_off(&mut self, msg: Message) -> Handoff {
        let id = msg.id().to_string();
        // A queue send either enqueues or leaves nothing behind, so it can be
        // abandoned on cancel. A pub-sub send runs subscribers and must finish.
        let sent = if self.channel.mode() == ChannelMode::PointToPoint {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                res = self.channel.send(msg.clone()) => Some(res),
            }
        } else {
            Some(self.channel.send(msg.clone()).await)
        };
        let Some(result) = sent else {
            self.pending = Some(msg);
            return Handoff::Cancelled;
        };

        match result {
            Ok(()) => Handoff::Accepted,
            Err(e) if e.is_backpressure() || self.channel.is_closed() => {
                debug!(flow = %self.flow, message_id = %id, "hand-off rejected, keeping message pending: {}", e);
                self.pending = Some(msg);
                Handoff::Rejected
            }
            Err(e) => {
                error!(flow = %self.flow, message_id = %id, "hand-off failed, message dropped: {}", e);
                self.metrics.failed();
                Handoff::Accepted
            }
        }
    }

    async fn finish(mut self) {
        if let Some(msg) = self.pending.take() {
            let id = msg.id().to_string();
            if self.source.requeue(msg).await {
                debug!(flow = %self.flow, message_id = %id, "pending message returned to source");
            } else {
                warn!(flow = %self.flow, source = %self.source.name(), message_id = %id, "source cannot requeue, pending message dropped");
                self.metrics.discarded(1);
            }
        }
        info!(flow = %self.flow, source = %self.source.name(), "poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelSpec, MessageChannel};
    use eip_adapter::memory::QueueSource;

    fn open(spec: ChannelSpec) -> ChannelRef {
        let ch = Arc::new(MessageChannel::from_spec(&spec));
        ch.open();
        ch
    }

    #[tokio::test]
    async fn test_polls_until_source_empty() {
        let source = Arc::new(QueueSource::from_messages(
            "q",
            (0..3).map(|i| Message::new(serde_json::json!(i))),
        ));
        let channel = open(ChannelSpec::point_to_point("in"));
        let cancel = CancellationToken::new();
        let metrics = Arc::new(FlowMetrics::new("t"));

        let handle = Poller::fixed_delay(Duration::from_millis(5))
            .max_messages_per_poll(2)
            .spawn("t".into(), source.clone(), channel.clone(), metrics.clone(), cancel.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(channel.len(), 3);
        assert!(source.is_empty());
        assert_eq!(metrics.snapshot().received, 3);
    }

    #[tokio::test]
    async fn test_backpressure_keeps_pending_and_requeues_on_stop() {
        let source = Arc::new(QueueSource::from_messages(
            "q",
            ["a", "b", "c"].into_iter().map(Message::text),
        ));
        let channel = open(ChannelSpec::point_to_point("in").bounded(1).fail_when_full());
        let cancel = CancellationToken::new();

        let handle = Poller::fixed_rate(Duration::from_millis(5)).spawn(
            "t".into(),
            source.clone(),
            channel.clone(),
            Arc::new(FlowMetrics::new("t")),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        // "a" fills the channel, "b" waits as pending, "c" is never fetched.
        assert_eq!(channel.len(), 1);
        assert_eq!(source.len(), 1);

        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(source.len(), 2);
        let texts: Vec<_> = [source.fetch().await.unwrap(), source.fetch().await.unwrap()]
            .into_iter()
            .flatten()
            .filter_map(|m| m.payload_str().map(str::to_string))
            .collect();
        assert_eq!(texts, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_initial_delay() {
        let source = Arc::new(QueueSource::from_messages("q", [Message::text("x")]));
        let channel = open(ChannelSpec::point_to_point("in"));
        let cancel = CancellationToken::new();

        let handle = Poller::fixed_delay(Duration::from_millis(5))
            .initial_delay(Duration::from_millis(200))
            .spawn("t".into(), source, channel.clone(), Arc::new(FlowMetrics::new("t")), cancel.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(channel.is_empty());
        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_trigger_serde_in_millis() {
        let t: Trigger = serde_json::from_str(r#"{"fixed_rate": 250}"#).unwrap();
        assert_eq!(t, Trigger::FixedRate(Duration::from_millis(250)));
        assert_eq!(serde_json::to_string(&Trigger::FixedDelay(Duration::from_secs(1))).unwrap(), r#"{"fixed_delay":1000}"#);
    }
}
