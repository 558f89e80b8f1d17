use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

/// Messages that were sent but not acknowledged yet, by message id. `T` is whatever the
///  channel needs to report about the message once it is resolved, e.g. the response receiver
///  it was sent to.
///
/// Every entry is resolved at most once: either it is removed by its acknowledgement, or it
///  expires. The removing call is the one that reports the outcome.
pub struct PendingMessages<T> {
    entries: FxHashMap<String, PendingEntry<T>>,
}

struct PendingEntry<T> {
    sent_at: Instant,
    target: T,
}

impl<T> Default for PendingMessages<T> {
    fn default() -> Self {
        PendingMessages {
            entries: FxHashMap::default(),
        }
    }
}

impl<T> PendingMessages<T> {
    pub fn insert(&mut self, message_id: String, target: T, now: Instant) {
        self.entries.insert(message_id, PendingEntry { sent_at: now, target });
    }

    pub fn target(&self, message_id: &str) -> Option<&T> {
        self.entries.get(message_id)
            .map(|e| &e.target)
    }

    pub fn remove(&mut self, message_id: &str) -> Option<T> {
        self.entries.remove(message_id)
            .map(|e| e.target)
    }

    /// removes and returns all entries that were sent more than `timeout` before `now`
    pub fn take_expired(&mut self, now: Instant, timeout: Duration) -> Vec<(String, T)> {
        let expired_ids = self.entries.iter()
            .filter(|(_, e)| now.saturating_duration_since(e.sent_at) > timeout)
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();

        expired_ids.into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|e| (id, e.target)))
            .collect()
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


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acknowledge_resolves_once() {
        let now = Instant::now();
        let mut pending = PendingMessages::default();
        pending.insert("a".to_string(), "peer", now);

        assert_eq!(pending.target("a"), Some(&"peer"));
        assert_eq!(pending.remove("a"), Some("peer"));
        assert_eq!(pending.remove("a"), None);
        assert!(pending.take_expired(now + Duration::from_secs(100), Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_take_expired() {
        let start = Instant::now();
        let mut pending = PendingMessages::default();
        pending.insert("old".to_string(), (), start);
        pending.insert("new".to_string(), (), start + Duration::from_millis(800));

        let now = start + Duration::from_millis(1001);
        let expired = pending.take_expired(now, Duration::from_secs(1));
        assert_eq!(expired, vec![("old".to_string(), ())]);
        assert_eq!(pending.len(), 1);

        assert!(pending.take_expired(now, Duration::from_secs(1)).is_empty());
        assert_eq!(pending.remove("old"), None);
        assert_eq!(pending.remove("new"), Some(()));
        assert!(pending.is_empty());
    }
}
