use std::{collections::VecDeque, sync::Mutex, time::Duration};
use tokio::{sync::Notify, time::Instant};
use tracing::trace;

use crate::{channel::FullPolicy, error::FlowError, message::Message};

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Message>,
    /// Taken by a tracked consumer but not acknowledged yet.
    unacked: usize,
    closed: bool,
}

/// Point-to-point FIFO channel. Each message goes to exactly one consumer.
pub struct QueueChannel {
    name: String,
    capacity: Option<usize>,
    full_policy: FullPolicy,
    send_timeout: Option<Duration>,
    state: Mutex<QueueState>,
    item_ready: Notify,
    space_ready: Notify,
}

impl QueueChannel {
    pub fn new(
        name: impl Into<String>,
        capacity: Option<usize>,
        full_policy: FullPolicy,
        send_timeout: Option<Duration>,
    ) -> Self {
        Self {
            name: name.into(),
            capacity,
            full_policy,
            send_timeout,
            state: Mutex::new(QueueState::default()),
            item_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    pub fn unbounded(name: impl Into<String>) -> Self {
        Self::new(name, None, FullPolicy::Block, None)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub async fn send(&self, msg: Message) -> Result<(), FlowError> {
        let deadline = self.send_timeout.map(|t| Instant::now() + t);
        loop {
            let space = self.space_ready.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return Err(FlowError::ChannelClosed(self.name.clone()));
                }
                let has_room = self.capacity.map_or(true, |cap| state.queue.len() < cap);
                if has_room {
                    trace!(channel = %self.name, message_id = %msg.id(), "enqueued");
                    state.queue.push_back(msg);
                    drop(state);
                    self.item_ready.notify_one();
                    return Ok(());
                }
                if self.full_policy == FullPolicy::Fail {
                    return Err(FlowError::ChannelFull(self.name.clone()));
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, space).await.is_err() {
                        return Err(FlowError::ChannelTimeout {
                            channel: self.name.clone(),
                            timeout_ms: self.send_timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
                        });
                    }
                }
                None => space.await,
            }
        }
    }

    pub fn try_receive(&self) -> Option<Message> {
        self.pop(false)
    }

    /// Wait for the next message. `None` after `timeout`, or once the
    /// channel is closed and empty. A zero timeout never waits.
    pub async fn receive(&self, timeout: Option<Duration>) -> Option<Message> {
        self.receive_inner(timeout, false).await
    }

    /// Like `receive`, but the message counts as in flight until `ack`.
    pub(crate) async fn receive_tracked(&self) -> Option<Message> {
        self.receive_inner(None, true).await
    }

    pub(crate) fn ack(&self) {
        let mut state = self.state.lock().unwrap();
        state.unacked = state.unacked.saturating_sub(1);
    }

    async fn receive_inner(&self, timeout: Option<Duration>, tracked: bool) -> Option<Message> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let ready = self.item_ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            if let Some(msg) = self.pop(tracked) {
                return Some(msg);
            }
            if self.is_closed() {
                return None;
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, ready).await.is_err() {
                        return self.pop(tracked);
                    }
                }
                None => ready.await,
            }
        }
    }

    fn pop(&self, tracked: bool) -> Option<Message> {
        let mut state = self.state.lock().unwrap();
        let msg = state.queue.pop_front()?;
        if tracked {
            state.unacked += 1;
        }
        drop(state);
        self.space_ready.notify_one();
        Some(msg)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty and nothing taken by a tracked consumer is still unacknowledged.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.queue.is_empty() && state.unacked == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn open(&self) {
        self.state.lock().unwrap().closed = false;
    }

    /// Reject further sends. Queued messages stay receivable.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.item_ready.notify_waiters();
        self.space_ready.notify_waiters();
    }

    /// Drop everything queued, returning how many messages were discarded.
    pub fn purge(&self) -> usize {
        let dropped = {
            let mut state = self.state.lock().unwrap();
            let n = state.queue.len();
            state.queue.clear();
            n
        };
        self.space_ready.notify_waiters();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn open_channel(capacity: Option<usize>, policy: FullPolicy, timeout: Option<Duration>) -> QueueChannel {
        let ch = QueueChannel::new("test", capacity, policy, timeout);
        ch.open();
        ch
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let ch = open_channel(None, FullPolicy::Block, None);
        for i in 0..100 {
            ch.send(Message::new(serde_json::json!(i))).await.unwrap();
        }
        for i in 0..100 {
            let msg = ch.try_receive().unwrap();
            assert_eq!(msg.payload(), &serde_json::json!(i));
        }
        assert!(ch.try_receive().is_none());
    }

    #[tokio::test]
    async fn test_fail_fast_when_full() {
        let ch = open_channel(Some(1), FullPolicy::Fail, None);
        ch.send(Message::text("one")).await.unwrap();

        let err = ch.send(Message::text("two")).await.unwrap_err();
        assert_eq!(err, FlowError::ChannelFull("test".into()));
        assert_eq!(ch.len(), 1);
    }

    #[tokio::test]
    async fn test_blocking_send_times_out() {
        let ch = open_channel(Some(1), FullPolicy::Block, Some(Duration::from_millis(30)));
        ch.send(Message::text("one")).await.unwrap();

        let err = ch.send(Message::text("two")).await.unwrap_err();
        assert!(matches!(err, FlowError::ChannelTimeout { timeout_ms: 30, .. }));
    }

    #[tokio::test]
    async fn test_blocking_send_resumes_when_space_frees() {
        let ch = Arc::new(open_channel(Some(1), FullPolicy::Block, None));
        ch.send(Message::text("one")).await.unwrap();

        let sender = ch.clone();
        let handle = tokio::spawn(async move { sender.send(Message::text("two")).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ch.try_receive().unwrap().payload_str(), Some("one"));

        handle.await.unwrap().unwrap();
        assert_eq!(ch.try_receive().unwrap().payload_str(), Some("two"));
    }

    #[tokio::test]
    async fn test_receive_timeout_returns_none() {
        let ch = open_channel(None, FullPolicy::Block, None);
        assert!(ch.receive(Some(Duration::from_millis(10))).await.is_none());
        assert!(ch.receive(Some(Duration::ZERO)).await.is_none());
    }

    #[tokio::test]
    async fn test_receive_wakes_on_send() {
        let ch = Arc::new(open_channel(None, FullPolicy::Block, None));
        let receiver = ch.clone();
        let handle = tokio::spawn(async move { receiver.receive(Some(Duration::from_secs(2))).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        ch.send(Message::text("hi")).await.unwrap();
        assert_eq!(handle.await.unwrap().unwrap().payload_str(), Some("hi"));
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_but_drains() {
        let ch = open_channel(None, FullPolicy::Block, None);
        ch.send(Message::text("kept")).await.unwrap();
        ch.close();

        assert!(matches!(ch.send(Message::text("late")).await, Err(FlowError::ChannelClosed(_))));
        assert_eq!(ch.receive(None).await.unwrap().payload_str(), Some("kept"));
        assert!(ch.receive(None).await.is_none());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_sender() {
        let ch = Arc::new(open_channel(Some(1), FullPolicy::Block, None));
        ch.send(Message::text("one")).await.unwrap();

        let sender = ch.clone();
        let handle = tokio::spawn(async move { sender.send(Message::text("two")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        ch.close();

        assert!(matches!(handle.await.unwrap(), Err(FlowError::ChannelClosed(_))));
    }

    #[tokio::test]
    async fn test_tracked_receive_until_ack() {
        let ch = open_channel(None, FullPolicy::Block, None);
        ch.send(Message::text("work")).await.unwrap();
        assert!(!ch.is_idle());

        let _msg = ch.receive_tracked().await.unwrap();
        assert!(ch.is_empty());
        assert!(!ch.is_idle());

        ch.ack();
        assert!(ch.is_idle());
    }

    #[tokio::test]
    async fn test_purge() {
        let ch = open_channel(None, FullPolicy::Block, None);
        ch.send(Message::text("a")).await.unwrap();
        ch.send(Message::text("b")).await.unwrap();
        assert_eq!(ch.purge(), 2);
        assert!(ch.is_empty());
    }
}
