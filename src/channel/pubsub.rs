use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock,
};
use tracing::{trace, warn};

use crate::{channel::MessageSubscriber, error::FlowError, message::Message};

/// Broadcast channel: `send` invokes every subscriber in registration order,
/// inside the sender's task, all of them sharing the same message.
pub struct PubSubChannel {
    name: String,
    subscribers: RwLock<Vec<Arc<dyn MessageSubscriber>>>,
    closed: AtomicBool,
}

impl PubSubChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self, subscriber: Arc<dyn MessageSubscriber>) {
        self.subscribers.write().unwrap().push(subscriber);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }

    /// A failing subscriber is logged and skipped; the others still get the message.
    pub async fn send(&self, msg: Message) -> Result<(), FlowError> {
        if self.is_closed() {
            return Err(FlowError::ChannelClosed(self.name.clone()));
        }
        let subscribers: Vec<Arc<dyn MessageSubscriber>> = {
            let guard = self.subscribers.read().unwrap();
            guard.clone()
        };
        trace!(channel = %self.name, message_id = %msg.id(), fan_out = subscribers.len(), "publishing");

        for subscriber in subscribers {
            if let Err(e) = subscriber.on_message(&msg).await {
                warn!(channel = %self.name, subscriber = %subscriber.name(), "subscriber failed: {:#}", e);
            }
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn open(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
