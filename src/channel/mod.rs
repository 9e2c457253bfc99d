/*
   poller ──send──▶ [ QueueChannel ] ──receive──▶ worker(s) ──▶ endpoint
                                                                  │
                      [ PubSubChannel ] ◀──────────send───────────┘
                         │   │   │
                         ▼   ▼   ▼   subscribers, registration order,
                                     same &Message, sender's task
*/
pub mod pubsub;
pub mod queue;

use std::{fmt, sync::Arc, time::Duration};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{error::FlowError, message::Message};
pub use pubsub::PubSubChannel;
pub use queue::QueueChannel;

pub type ChannelRef = Arc<MessageChannel>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    #[default]
    PointToPoint,
    PublishSubscribe,
}

/// Behaviour of a bounded channel once it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum FullPolicy {
    /// Wait for room, up to the send timeout if one is set.
    #[default]
    Block,
    /// Return `ChannelFull` immediately.
    Fail,
}

/// Declaration of a channel, used by the builder and by flow files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChannelSpec {
    pub name: String,
    #[serde(default)]
    pub mode: ChannelMode,
    /// `None` means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
    #[serde(default)]
    pub full_policy: FullPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_timeout_ms: Option<u64>,
}

impl ChannelSpec {
    pub fn point_to_point(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: ChannelMode::PointToPoint,
            capacity: None,
            full_policy: FullPolicy::Block,
            send_timeout_ms: None,
        }
    }

    pub fn publish_subscribe(name: impl Into<String>) -> Self {
        Self {
            mode: ChannelMode::PublishSubscribe,
            ..Self::point_to_point(name)
        }
    }

    pub fn bounded(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn fail_when_full(mut self) -> Self {
        self.full_policy = FullPolicy::Fail;
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// A bounded channel needs room for at least one message.
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.name.trim().is_empty() {
            return Err(FlowError::Config("channel name is empty".into()));
        }
        if self.capacity == Some(0) {
            return Err(FlowError::Config(format!("channel `{}`: capacity must be at least 1", self.name)));
        }
        Ok(())
    }
}

/// Callback registered on a publish-subscribe channel.
#[async_trait]
pub trait MessageSubscriber: Send + Sync {
    fn name(&self) -> String;

    /// The message is shared with the other subscribers; derive new
    /// messages instead of mutating it.
    async fn on_message(&self, msg: &Message) -> anyhow::Result<()>;
}

pub enum MessageChannel {
    PointToPoint(QueueChannel),
    PublishSubscribe(PubSubChannel),
}

impl fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageChannel")
            .field("name", &self.name())
            .field("mode", &self.mode())
            .finish()
    }
}

impl MessageChannel {
    /// Channels start closed; the owning flow opens them on start.
    pub fn from_spec(spec: &ChannelSpec) -> Self {
        match spec.mode {
            ChannelMode::PointToPoint => {
                let ch = QueueChannel::new(
                    spec.name.clone(),
                    spec.capacity,
                    spec.full_policy,
                    spec.send_timeout_ms.map(Duration::from_millis),
                );
                ch.close();
                MessageChannel::PointToPoint(ch)
            }
            ChannelMode::PublishSubscribe => {
                let ch = PubSubChannel::new(spec.name.clone());
                ch.close();
                MessageChannel::PublishSubscribe(ch)
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            MessageChannel::PointToPoint(ch) => ch.name(),
            MessageChannel::PublishSubscribe(ch) => ch.name(),
        }
    }

    pub fn mode(&self) -> ChannelMode {
        match self {
            MessageChannel::PointToPoint(_) => ChannelMode::PointToPoint,
            MessageChannel::PublishSubscribe(_) => ChannelMode::PublishSubscribe,
        }
    }

    pub async fn send(&self, msg: Message) -> Result<(), FlowError> {
        match self {
            MessageChannel::PointToPoint(ch) => ch.send(msg).await,
            MessageChannel::PublishSubscribe(ch) => ch.send(msg).await,
        }
    }

    /// Poll a point-to-point channel.
    pub async fn receive(&self, timeout: Option<Duration>) -> Result<Option<Message>, FlowError> {
        match self {
            MessageChannel::PointToPoint(ch) => Ok(ch.receive(timeout).await),
            MessageChannel::PublishSubscribe(ch) => Err(FlowError::Config(format!(
                "channel `{}` is publish-subscribe and cannot be polled",
                ch.name()
            ))),
        }
    }

    /// Non-blocking poll; `None` when empty or publish-subscribe.
    pub fn try_receive(&self) -> Option<Message> {
        match self {
            MessageChannel::PointToPoint(ch) => ch.try_receive(),
            MessageChannel::PublishSubscribe(_) => None,
        }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn MessageSubscriber>) -> Result<(), FlowError> {
        match self {
            MessageChannel::PublishSubscribe(ch) => {
                ch.subscribe(subscriber);
                Ok(())
            }
            MessageChannel::PointToPoint(ch) => Err(FlowError::Config(format!(
                "channel `{}` is point-to-point and does not take subscribers",
                ch.name()
            ))),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            MessageChannel::PointToPoint(ch) => ch.len(),
            MessageChannel::PublishSubscribe(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publish-subscribe channels hold nothing between sends, so they are always idle.
    pub fn is_idle(&self) -> bool {
        match self {
            MessageChannel::PointToPoint(ch) => ch.is_idle(),
            MessageChannel::PublishSubscribe(_) => true,
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        match self {
            MessageChannel::PointToPoint(ch) => ch.capacity(),
            MessageChannel::PublishSubscribe(_) => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            MessageChannel::PointToPoint(ch) => ch.is_closed(),
            MessageChannel::PublishSubscribe(ch) => ch.is_closed(),
        }
    }

    pub(crate) fn open(&self) {
        match self {
            MessageChannel::PointToPoint(ch) => ch.open(),
            MessageChannel::PublishSubscribe(ch) => ch.open(),
        }
    }

    /// Reject further sends. Queued messages stay available for draining.
    pub fn close(&self) {
        match self {
            MessageChannel::PointToPoint(ch) => ch.close(),
            MessageChannel::PublishSubscribe(ch) => ch.close(),
        }
    }

    pub fn purge(&self) -> usize {
        match self {
            MessageChannel::PointToPoint(ch) => ch.purge(),
            MessageChannel::PublishSubscribe(_) => 0,
        }
    }

    pub(crate) fn as_queue(&self) -> Option<&QueueChannel> {
        match self {
            MessageChannel::PointToPoint(ch) => Some(ch),
            MessageChannel::PublishSubscribe(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channels_start_closed() {
        let ch = MessageChannel::from_spec(&ChannelSpec::point_to_point("p2p"));
        assert!(ch.is_closed());
        assert!(matches!(ch.send(Message::text("x")).await, Err(FlowError::ChannelClosed(_))));

        ch.open();
        ch.send(Message::text("x")).await.unwrap();
        assert_eq!(ch.len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_one_fail_fast_second_send() {
        let spec = ChannelSpec::point_to_point("small").bounded(1).fail_when_full();
        let ch = MessageChannel::from_spec(&spec);
        ch.open();

        ch.send(Message::text("first")).await.unwrap();
        let err = ch.send(Message::text("second")).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ChannelFull);
    }

    #[tokio::test]
    async fn test_mode_specific_operations() {
        let pubsub = MessageChannel::from_spec(&ChannelSpec::publish_subscribe("ps"));
        assert!(pubsub.receive(None).await.is_err());

        let p2p = MessageChannel::from_spec(&ChannelSpec::point_to_point("p2p"));
        struct Noop;
        #[async_trait]
        impl MessageSubscriber for Noop {
            fn name(&self) -> String { "noop".into() }
            async fn on_message(&self, _msg: &Message) -> anyhow::Result<()> { Ok(()) }
        }
        assert!(p2p.subscribe(Arc::new(Noop)).is_err());
        assert!(pubsub.subscribe(Arc::new(Noop)).is_ok());
    }

    #[tokio::test]
    async fn test_try_receive_close_and_purge() {
        let ch = MessageChannel::from_spec(&ChannelSpec::point_to_point("p2p"));
        ch.open();
        assert!(ch.try_receive().is_none());
        for i in 0..3 {
            ch.send(Message::text(format!("m{i}"))).await.unwrap();
        }
        assert_eq!(ch.try_receive().unwrap().payload_str(), Some("m0"));

        ch.close();
        assert!(ch.send(Message::text("late")).await.is_err());
        assert_eq!(ch.len(), 2);
        assert_eq!(ch.purge(), 2);
        assert!(ch.is_empty());
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let err = ChannelSpec::point_to_point("none").bounded(0).validate().unwrap_err();
        assert_eq!(err, FlowError::Config("channel `none`: capacity must be at least 1".into()));
        assert!(ChannelSpec::point_to_point("one").bounded(1).validate().is_ok());
        assert!(ChannelSpec::publish_subscribe("ps").validate().is_ok());
    }

    #[test]
    fn test_spec_from_yaml() {
        let spec: ChannelSpec = serde_yaml_bw::from_str(
            "name: lines\nmode: publish_subscribe\ncapacity: 10\nfull_policy: fail\n",
        )
        .unwrap();
        assert_eq!(spec.mode, ChannelMode::PublishSubscribe);
        assert_eq!(spec.capacity, Some(10));
        assert_eq!(spec.full_policy, FullPolicy::Fail);
    }
}
