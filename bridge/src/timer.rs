//! Keyed, cancellable deadlines for per-server workers.
//!
//! A timer is identified by its key plus a generation token. Rescheduling or
//! cancelling a key invalidates any token handed out earlier, so a worker
//! that collected due timers and then processed other input first can check
//! with [`Timers::complete`] whether each one is still wanted.

use std::collections::HashMap;
use std::hash::Hash;
use tokio::time::Instant;

/// Sleeps until `deadline`, or forever if there is none.
pub async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken(u64);

/// A timer whose deadline has passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fired<K> {
    pub key: K,
    pub token: TimerToken,
}

#[derive(Debug)]
pub struct Timers<K> {
    entries: HashMap<K, (Instant, TimerToken)>,
    next_token: u64,
}

impl<K: Eq + Hash + Clone> Timers<K> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_token: 0,
        }
    }

    /// Sets the deadline for `key`, replacing any earlier one.
    pub fn schedule(&mut self, key: K, deadline: Instant) -> TimerToken {
        self.next_token += 1;
        let token = TimerToken(self.next_token);
        self.entries.insert(key, (deadline, token));
        token
    }

    pub fn cancel(&mut self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn deadline(&self, key: &K) -> Option<Instant> {
        self.entries.get(key).map(|(deadline, _)| *deadline)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|(deadline, _)| *deadline).min()
    }

    /// Timers due at `now`, earliest first. They stay scheduled until
    /// completed or cancelled.
    pub fn due(&self, now: Instant) -> Vec<Fired<K>> {
        let mut due: Vec<(Instant, Fired<K>)> = self
            .entries
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(key, (deadline, token))| {
                (
                    *deadline,
                    Fired {
                        key: key.clone(),
                        token: *token,
                    },
                )
            })
            .collect();
        due.sort_by_key(|(deadline, _)| *deadline);
        due.into_iter().map(|(_, fired)| fired).collect()
    }

    /// Removes the timer if `fired` is still its current generation.
    ///
    /// Returns false when the key was cancelled or rescheduled after it
    /// fired; the caller must then do nothing.
    pub fn complete(&mut self, fired: &Fired<K>) -> bool {
        match self.entries.get(&fired.key) {
            Some((_, token)) if *token == fired.token => {
                self.entries.remove(&fired.key);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<K: Eq + Hash + Clone> Default for Timers<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_next_deadline_is_earliest() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.schedule("b", now + Duration::from_secs(20));
        timers.schedule("a", now + Duration::from_secs(10));

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(10)));
        assert_eq!(timers.len(), 2);
    }

    #[test]
    fn test_due_orders_and_keeps_entries() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.schedule("late", now + Duration::from_secs(2));
        timers.schedule("early", now + Duration::from_secs(1));
        timers.schedule("future", now + Duration::from_secs(60));

        let due = timers.due(now + Duration::from_secs(5));
        let keys: Vec<&str> = due.iter().map(|f| f.key).collect();
        assert_eq!(keys, vec!["early", "late"]);
        assert_eq!(timers.len(), 3);

        assert!(timers.complete(&due[0]));
        assert!(timers.complete(&due[1]));
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_cancel_after_fire_wins() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.schedule("alice", now);

        let fired = timers.due(now);
        assert_eq!(fired.len(), 1);

        assert!(timers.cancel(&"alice"));
        assert!(!timers.complete(&fired[0]));
    }

    #[test]
    fn test_reschedule_invalidates_old_token() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.schedule("alice", now);
        let fired = timers.due(now);

        timers.schedule("alice", now + Duration::from_secs(30));
        assert!(!timers.complete(&fired[0]));
        assert_eq!(timers.deadline(&"alice"), Some(now + Duration::from_secs(30)));
    }

    #[test]
    fn test_empty() {
        let mut timers: Timers<String> = Timers::default();
        assert!(timers.is_empty());
        assert!(timers.next_deadline().is_none());
        assert!(!timers.cancel(&"nobody".to_string()));
        timers.schedule("x".into(), Instant::now());
        timers.clear();
        assert!(timers.is_empty());
    }
}
