use std::time::Duration;
use dashmap::{mapref::entry::Entry, DashMap};
use moka::sync::Cache;
use tokio::time::Instant;
use tracing::debug;

use crate::{error::FlowError, message::Message};

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(300);

/// Parts collected so far for one correlation id.
#[derive(Debug, Clone)]
pub struct CorrelationGroup {
    correlation_id: String,
    expected_size: Option<usize>,
    /// Sorted by sequence number; parts without one keep arrival order at the end.
    parts: Vec<Message>,
    created_at: Instant,
}

impl CorrelationGroup {
    fn new(correlation_id: String, created_at: Instant) -> Self {
        Self {
            correlation_id,
            expected_size: None,
            parts: Vec::new(),
            created_at,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn expected_size(&self) -> Option<usize> {
        self.expected_size
    }

    pub fn parts(&self) -> &[Message] {
        &self.parts
    }

    pub fn into_parts(self) -> Vec<Message> {
        self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_complete(&self) -> bool {
        self.expected_size.is_some_and(|n| self.parts.len() >= n)
    }

    /// `false` when a part with the same sequence number is already present.
    fn insert(&mut self, msg: Message) -> bool {
        if self.expected_size.is_none() {
            self.expected_size = msg.sequence_size();
        }
        let Some(seq) = msg.sequence_number() else {
            self.parts.push(msg);
            return true;
        };
        let pos = self
            .parts
            .partition_point(|p| p.sequence_number().is_some_and(|n| n < seq));
        if self.parts.get(pos).and_then(Message::sequence_number) == Some(seq) {
            return false;
        }
        self.parts.insert(pos, msg);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Released,
    Expired,
}

#[derive(Debug)]
pub enum AppendOutcome {
    Collecting,
    Released(CorrelationGroup),
    /// Same sequence number seen before; the part was ignored.
    Duplicate,
    /// The group was already closed; the part is handed back.
    Late(GroupState, Message),
}

/// Open correlation groups keyed by id.
///
/// Append and the release decision happen under the map's per-key lock, so
/// two parts of one group never race, while other ids proceed in parallel.
/// Closed ids are remembered for `retention` to recognise late parts.
pub struct CorrelationStore {
    groups: DashMap<String, CorrelationGroup>,
    closed: Cache<String, GroupState>,
}

impl Default for CorrelationStore {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl CorrelationStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            groups: DashMap::new(),
            closed: Cache::builder().time_to_live(retention).build(),
        }
    }

    pub fn append<F>(&self, msg: Message, should_release: F) -> Result<AppendOutcome, FlowError>
    where
        F: Fn(&CorrelationGroup) -> bool,
    {
        let Some(id) = msg.correlation_id().map(str::to_string) else {
            return Err(FlowError::Aggregation(format!(
                "message {} has no correlationId header",
                msg.id()
            )));
        };

        match self.groups.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                if !entry.get_mut().insert(msg) {
                    return Ok(AppendOutcome::Duplicate);
                }
                if should_release(entry.get()) {
                    self.closed.insert(id, GroupState::Released);
                    return Ok(AppendOutcome::Released(entry.remove()));
                }
                Ok(AppendOutcome::Collecting)
            }
            Entry::Vacant(entry) => {
                if let Some(state) = self.closed.get(&id) {
                    return Ok(AppendOutcome::Late(state, msg));
                }
                let mut group = CorrelationGroup::new(id.clone(), Instant::now());
                group.insert(msg);
                if should_release(&group) {
                    self.closed.insert(id, GroupState::Released);
                    return Ok(AppendOutcome::Released(group));
                }
                debug!(correlation_id = %id, expected = ?group.expected_size, "opened correlation group");
                entry.insert(group);
                Ok(AppendOutcome::Collecting)
            }
        }
    }

    /// Remove and return every group older than `timeout` at `now`.
    pub fn expire(&self, now: Instant, timeout: Duration) -> Vec<CorrelationGroup> {
        let overdue: Vec<String> = self
            .groups
            .iter()
            .filter(|g| now.saturating_duration_since(g.created_at) >= timeout)
            .map(|g| g.key().clone())
            .collect();

        let mut expired = Vec::with_capacity(overdue.len());
        for id in overdue {
            // Re-check under the entry lock; the group may have been released meanwhile.
            if let Entry::Occupied(entry) = self.groups.entry(id.clone()) {
                if now.saturating_duration_since(entry.get().created_at) >= timeout {
                    self.closed.insert(id, GroupState::Expired);
                    expired.push(entry.remove());
                }
            }
        }
        expired
    }

    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn group_ids(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.key().clone()).collect()
    }

    pub fn closed_state(&self, correlation_id: &str) -> Option<GroupState> {
        self.closed.get(correlation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CORRELATION_ID, SEQUENCE_NUMBER, SEQUENCE_SIZE};
    use std::sync::Arc;

    fn part(cid: &str, seq: usize, size: usize) -> Message {
        Message::text(format!("p{}", seq))
            .with_header(CORRELATION_ID, cid)
            .with_header(SEQUENCE_NUMBER, seq)
            .with_header(SEQUENCE_SIZE, size)
    }

    #[test]
    fn test_release_only_when_complete() {
        let store = CorrelationStore::default();
        assert!(matches!(store.append(part("g", 1, 3), CorrelationGroup::is_complete).unwrap(), AppendOutcome::Collecting));
        assert!(matches!(store.append(part("g", 0, 3), CorrelationGroup::is_complete).unwrap(), AppendOutcome::Collecting));
        assert_eq!(store.pending_groups(), 1);

        let AppendOutcome::Released(group) = store.append(part("g", 2, 3), CorrelationGroup::is_complete).unwrap() else {
            panic!("expected release");
        };
        let seqs: Vec<_> = group.parts().iter().filter_map(Message::sequence_number).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(store.pending_groups(), 0);
        assert_eq!(store.closed_state("g"), Some(GroupState::Released));
    }

    #[test]
    fn test_duplicates_ignored_and_late_parts_refused() {
        let store = CorrelationStore::default();
        store.append(part("g", 0, 2), CorrelationGroup::is_complete).unwrap();
        assert!(matches!(store.append(part("g", 0, 2), CorrelationGroup::is_complete).unwrap(), AppendOutcome::Duplicate));
        assert!(matches!(store.append(part("g", 1, 2), CorrelationGroup::is_complete).unwrap(), AppendOutcome::Released(_)));

        let outcome = store.append(part("g", 1, 2), CorrelationGroup::is_complete).unwrap();
        assert!(matches!(outcome, AppendOutcome::Late(GroupState::Released, _)));
        assert_eq!(store.pending_groups(), 0);
    }

    #[test]
    fn test_missing_correlation_id() {
        let store = CorrelationStore::default();
        let err = store.append(Message::text("x"), |_| true).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Aggregation);
    }

    #[tokio::test]
    async fn test_expire_removes_overdue_groups() {
        let store = CorrelationStore::default();
        store.append(part("old", 0, 2), CorrelationGroup::is_complete).unwrap();

        assert!(store.expire(Instant::now(), Duration::from_secs(60)).is_empty());
        let expired = store.expire(Instant::now() + Duration::from_millis(200), Duration::from_millis(100));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].len(), 1);
        assert_eq!(store.closed_state("old"), Some(GroupState::Expired));

        let late = store.append(part("old", 1, 2), CorrelationGroup::is_complete).unwrap();
        assert!(matches!(late, AppendOutcome::Late(GroupState::Expired, _)));
    }

    #[tokio::test]
    async fn test_concurrent_appends_release_once() {
        let store = Arc::new(CorrelationStore::default());
        let size = 64;
        let mut handles = Vec::new();
        for seq in 0..size {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                matches!(
                    store.append(part("race", seq, size), CorrelationGroup::is_complete).unwrap(),
                    AppendOutcome::Released(_)
                )
            }));
        }
        let mut released = 0;
        for h in handles {
            if h.await.unwrap() {
                released += 1;
            }
        }
        assert_eq!(released, 1);
    }
}
