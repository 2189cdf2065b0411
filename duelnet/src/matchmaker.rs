//! Matchmaking queue.
//!
//! Strict FIFO: entries are ordered by enqueue sequence and the two oldest
//! are paired. All mutation happens under one short mutex; nothing slow
//! (store lookups, judge calls) runs while it is held.
//!
//! A popped pair stays tracked until the caller commits or requeues it, so a
//! `dequeue` that lands while the pair waits on the store withdraws the user
//! instead of being lost.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::protocol::{ConnectionId, UserId};

/// A user waiting for an opponent.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub user_id: UserId,
    pub username: String,
    pub connection_id: ConnectionId,
    pub enqueued_at: Instant,
    pub seq: u64,
}

impl QueueEntry {
    pub fn waited(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    /// Popped but not yet committed, mapped to "withdrew meanwhile".
    pairing: HashMap<UserId, bool>,
}

/// Matchmaking service.
pub struct Matchmaker {
    state: Mutex<QueueState>,
    seq: AtomicU64,
    timeout: Duration,
}

impl Matchmaker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            seq: AtomicU64::new(0),
            timeout,
        }
    }

    /// Append a user. Returns the 1-based queue position.
    pub fn enqueue(
        &self,
        user_id: impl Into<UserId>,
        username: impl Into<String>,
        connection_id: ConnectionId,
        now: Instant,
    ) -> Result<usize, MatchmakerError> {
        let user_id = user_id.into();
        let mut state = self.state.lock();
        let pairing = state.pairing.get(&user_id) == Some(&false);
        if pairing || state.entries.iter().any(|e| e.user_id == user_id) {
            return Err(MatchmakerError::AlreadyQueued(user_id));
        }
        state.entries.push_back(QueueEntry {
            user_id,
            username: username.into(),
            connection_id,
            enqueued_at: now,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        });
        Ok(state.entries.len())
    }

    /// Remove a user if present. A user whose pair is in progress is marked
    /// withdrawn and `None` is returned.
    pub fn dequeue(&self, user_id: &str) -> Option<QueueEntry> {
        let mut state = self.state.lock();
        if let Some(withdrawn) = state.pairing.get_mut(user_id) {
            *withdrawn = true;
        }
        let idx = state.entries.iter().position(|e| e.user_id == user_id)?;
        state.entries.remove(idx)
    }

    /// Point a queued user at a replacement connection, keeping their place.
    pub fn rebind(&self, user_id: &str, connection_id: ConnectionId) -> bool {
        let mut state = self.state.lock();
        match state.entries.iter_mut().find(|e| e.user_id == user_id) {
            Some(entry) => {
                entry.connection_id = connection_id;
                true
            }
            None => false,
        }
    }

    /// Pop the two oldest entries. Both stay tracked as pairing until
    /// [`Matchmaker::commit_pair`], [`Matchmaker::abandon`] or
    /// [`Matchmaker::requeue_front`].
    pub fn pop_pair(&self) -> Option<(QueueEntry, QueueEntry)> {
        let mut state = self.state.lock();
        if state.entries.len() < 2 {
            return None;
        }
        let first = state.entries.pop_front()?;
        let second = state.entries.pop_front()?;
        state.pairing.insert(first.user_id.clone(), false);
        state.pairing.insert(second.user_id.clone(), false);
        Some((first, second))
    }

    /// The user left the queue after their pair was popped.
    pub fn is_withdrawn(&self, user_id: &str) -> bool {
        self.state.lock().pairing.get(user_id) == Some(&true)
    }

    /// Stop tracking a popped user without requeueing them.
    pub fn abandon(&self, user_id: &str) {
        self.state.lock().pairing.remove(user_id);
    }

    /// Finish a pairing. Returns whether each side is still willing; a side
    /// that withdrew in the meantime reports `false`.
    pub fn commit_pair(&self, a: &str, b: &str) -> (bool, bool) {
        let mut state = self.state.lock();
        let a_withdrew = state.pairing.remove(a).unwrap_or(false);
        let b_withdrew = state.pairing.remove(b).unwrap_or(false);
        (!a_withdrew, !b_withdrew)
    }

    /// Put a popped entry back at the head, ahead of everyone who joined later.
    /// Entries withdrawn while pairing are dropped instead.
    pub fn requeue_front(&self, entry: QueueEntry) {
        let mut state = self.state.lock();
        if state.pairing.remove(&entry.user_id) == Some(true) {
            return;
        }
        if state.entries.iter().any(|e| e.user_id == entry.user_id) {
            return;
        }
        // Keep seq order if several entries come back.
        let idx = state
            .entries
            .iter()
            .position(|e| e.seq > entry.seq)
            .unwrap_or(state.entries.len());
        state.entries.insert(idx, entry);
    }

    /// Evict every entry that has waited at least the queue timeout.
    pub fn evict_expired(&self, now: Instant) -> Vec<QueueEntry> {
        let mut state = self.state.lock();
        let mut evicted = Vec::new();
        state.entries.retain(|entry| {
            if entry.waited(now) >= self.timeout {
                evicted.push(entry.clone());
                false
            } else {
                true
            }
        });
        evicted
    }

    pub fn is_queued(&self, user_id: &str) -> bool {
        self.state.lock().entries.iter().any(|e| e.user_id == user_id)
    }

    /// 1-based position of a queued user.
    pub fn position(&self, user_id: &str) -> Option<usize> {
        self.state
            .lock()
            .entries
            .iter()
            .position(|e| e.user_id == user_id)
            .map(|idx| idx + 1)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Get queue stats.
    pub fn stats(&self, now: Instant) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            players: state.entries.len(),
            longest_wait_secs: state
                .entries
                .iter()
                .map(|e| e.waited(now).as_secs())
                .max()
                .unwrap_or(0),
        }
    }
}

/// Queue statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub players: usize,
    pub longest_wait_secs: u64,
}

/// Matchmaker errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchmakerError {
    #[error("player already queued: {0}")]
    AlreadyQueued(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mm() -> Matchmaker {
        Matchmaker::new(Duration::from_secs(120))
    }

    #[test]
    fn test_pairs_in_fifo_order() {
        let mm = mm();
        let now = Instant::now();
        for (i, user) in ["u1", "u2", "u3", "u4"].iter().enumerate() {
            mm.enqueue(*user, *user, i as u64, now).unwrap();
        }

        let (a, b) = mm.pop_pair().unwrap();
        assert_eq!((a.user_id.as_str(), b.user_id.as_str()), ("u1", "u2"));
        let (c, d) = mm.pop_pair().unwrap();
        assert_eq!((c.user_id.as_str(), d.user_id.as_str()), ("u3", "u4"));
        assert!(mm.pop_pair().is_none());
    }

    #[test]
    fn test_duplicate_enqueue_rejected() {
        let mm = mm();
        let now = Instant::now();
        assert_eq!(mm.enqueue("alice", "Alice", 1, now), Ok(1));
        assert_eq!(
            mm.enqueue("alice", "Alice", 2, now),
            Err(MatchmakerError::AlreadyQueued("alice".into()))
        );
        assert_eq!(mm.len(), 1);
    }

    #[test]
    fn test_single_entry_does_not_pair() {
        let mm = mm();
        mm.enqueue("alice", "Alice", 1, Instant::now()).unwrap();
        assert!(mm.pop_pair().is_none());
        assert!(mm.is_queued("alice"));
    }

    #[test]
    fn test_requeue_front_keeps_priority() {
        let mm = mm();
        let now = Instant::now();
        mm.enqueue("u1", "u1", 1, now).unwrap();
        mm.enqueue("u2", "u2", 2, now).unwrap();
        mm.enqueue("u3", "u3", 3, now).unwrap();

        let (_gone, survivor) = mm.pop_pair().unwrap();
        mm.requeue_front(survivor);

        assert_eq!(mm.position("u2"), Some(1));
        assert_eq!(mm.position("u3"), Some(2));
        let (a, b) = mm.pop_pair().unwrap();
        assert_eq!((a.user_id.as_str(), b.user_id.as_str()), ("u2", "u3"));
    }

    #[test]
    fn test_requeue_both_preserves_order() {
        let mm = mm();
        let now = Instant::now();
        mm.enqueue("u1", "u1", 1, now).unwrap();
        mm.enqueue("u2", "u2", 2, now).unwrap();
        mm.enqueue("u3", "u3", 3, now).unwrap();

        let (a, b) = mm.pop_pair().unwrap();
        mm.requeue_front(b);
        mm.requeue_front(a);

        assert_eq!(mm.position("u1"), Some(1));
        assert_eq!(mm.position("u2"), Some(2));
        assert_eq!(mm.position("u3"), Some(3));
    }

    #[test]
    fn test_dequeue_and_rebind() {
        let mm = mm();
        let now = Instant::now();
        mm.enqueue("alice", "Alice", 1, now).unwrap();
        mm.enqueue("bob", "Bob", 2, now).unwrap();

        assert!(mm.rebind("alice", 9));
        assert!(mm.dequeue("bob").is_some());
        assert!(mm.dequeue("bob").is_none());

        let entry = mm.dequeue("alice").unwrap();
        assert_eq!(entry.connection_id, 9);
        assert!(mm.is_empty());
    }

    #[test]
    fn test_leave_during_pairing_withdraws() {
        let mm = mm();
        let now = Instant::now();
        mm.enqueue("alice", "Alice", 1, now).unwrap();
        mm.enqueue("bob", "Bob", 2, now).unwrap();

        let (a, b) = mm.pop_pair().unwrap();
        assert!(mm.dequeue("alice").is_none());
        assert!(mm.is_withdrawn("alice"));
        assert!(!mm.is_withdrawn("bob"));

        assert_eq!(mm.commit_pair(&a.user_id, &b.user_id), (false, true));
        mm.requeue_front(b);
        assert_eq!(mm.position("bob"), Some(1));
        assert!(!mm.is_withdrawn("alice"));
    }

    #[test]
    fn test_withdrawn_entry_is_not_requeued() {
        let mm = mm();
        let now = Instant::now();
        mm.enqueue("alice", "Alice", 1, now).unwrap();
        mm.enqueue("bob", "Bob", 2, now).unwrap();

        let (a, b) = mm.pop_pair().unwrap();
        // Being paired counts as queued.
        assert!(mm.enqueue("bob", "Bob", 2, now).is_err());
        mm.dequeue("alice");
        mm.requeue_front(a);
        mm.requeue_front(b);

        assert_eq!(mm.position("alice"), None);
        assert_eq!(mm.position("bob"), Some(1));
    }

    #[test]
    fn test_evict_expired() {
        let mm = mm();
        let start = Instant::now();
        mm.enqueue("old", "old", 1, start).unwrap();
        mm.enqueue("new", "new", 2, start + Duration::from_secs(60)).unwrap();

        let now = start + Duration::from_secs(120);
        let evicted = mm.evict_expired(now);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].user_id, "old");
        assert_eq!(mm.stats(now).longest_wait_secs, 60);
    }
}
