// In-memory adapters for demos and tests.

use std::{collections::VecDeque, sync::Mutex, time::Duration};
use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::info;

use crate::{adapter::{AdapterError, SinkAdapter, SourceAdapter}, message::Message};

/// Destructive FIFO source: each fetch removes the head of the queue.
/// Requeued messages go back to the front so ordering survives backpressure.
pub struct QueueSource {
    name: String,
    queue: Mutex<VecDeque<Message>>,
}

impl QueueSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn from_messages<I>(name: impl Into<String>, messages: I) -> Self
    where
        I: IntoIterator<Item = Message>,
    {
        Self {
            name: name.into(),
            queue: Mutex::new(messages.into_iter().collect()),
        }
    }

    pub fn push(&self, msg: Message) {
        self.queue.lock().unwrap().push_back(msg);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SourceAdapter for QueueSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn fetch(&self) -> Result<Option<Message>, AdapterError> {
        Ok(self.queue.lock().unwrap().pop_front())
    }

    async fn requeue(&self, msg: Message) -> bool {
        self.queue.lock().unwrap().push_front(msg);
        true
    }
}

/// Source backed by an iterator of payloads, each wrapped into a fresh message
/// when fetched. Requeued messages are replayed before the iterator continues.
pub struct IterSource<I> {
    name: String,
    inner: Mutex<(VecDeque<Message>, I)>,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = serde_json::Value> + Send,
{
    pub fn new<T>(name: impl Into<String>, items: T) -> Self
    where
        T: IntoIterator<IntoIter = I>,
    {
        Self {
            name: name.into(),
            inner: Mutex::new((VecDeque::new(), items.into_iter())),
        }
    }
}

#[async_trait]
impl<I> SourceAdapter for IterSource<I>
where
    I: Iterator<Item = serde_json::Value> + Send,
{
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn fetch(&self) -> Result<Option<Message>, AdapterError> {
        let mut guard = self.inner.lock().unwrap();
        let (replay, items) = &mut *guard;
        if let Some(msg) = replay.pop_front() {
            return Ok(Some(msg));
        }
        Ok(items.next().map(Message::new))
    }

    async fn requeue(&self, msg: Message) -> bool {
        self.inner.lock().unwrap().0.push_back(msg);
        true
    }
}

/// Sink that keeps everything it receives.
pub struct CollectingSink {
    name: String,
    received: Mutex<Vec<Message>>,
    arrived: Notify,
}

impl CollectingSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            received: Mutex::new(Vec::new()),
            arrived: Notify::new(),
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.received.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` messages arrived. Returns what was
    /// collected so far, even if the timeout hit first.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<Message> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.len() >= count {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }
        self.messages()
    }
}

#[async_trait]
impl SinkAdapter for CollectingSink {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn deliver(&self, msg: &Message) -> Result<(), AdapterError> {
        self.received.lock().unwrap().push(msg.clone());
        self.arrived.notify_waiters();
        Ok(())
    }
}

/// Sink that writes every message to the log at `info`.
pub struct LogSink {
    name: String,
}

impl LogSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl SinkAdapter for LogSink {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn deliver(&self, msg: &Message) -> Result<(), AdapterError> {
        info!(sink = %self.name, message_id = %msg.id(), payload = %msg.payload(), "delivered");
        Ok(())
    }
}
