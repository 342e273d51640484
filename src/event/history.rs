use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::config::duration_ms;

/// One archived emit. Entries are retained in emit order and can be fed
/// back through [`crate::event::EventBus::replay`].
#[derive(Debug, Clone, Serialize)]
pub struct EventHistoryEntry {
    pub event: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub listeners_notified: usize,
    pub errors: usize,
}

/// Bounded archive of emitted events. Oldest entries are evicted once
/// `max_entries` is reached.
pub(crate) struct EventHistory {
    entries: Mutex<VecDeque<EventHistoryEntry>>,
    max_entries: usize,
}

impl EventHistory {
    pub(crate) fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(max_entries.min(1024))),
            max_entries,
        }
    }

    // A poisoned lock only marks a panic elsewhere, the deque itself
    // stays valid.
    fn entries(&self) -> MutexGuard<'_, VecDeque<EventHistoryEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn push(&self, entry: EventHistoryEntry) {
        if self.max_entries == 0 {
            return;
        }
        let mut entries = self.entries();
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub(crate) fn snapshot(&self) -> Vec<EventHistoryEntry> {
        self.entries().iter().cloned().collect()
    }

    /// Last `n` entries in emit order.
    pub(crate) fn last(&self, n: usize) -> Vec<EventHistoryEntry> {
        let entries = self.entries();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Entries in `[from, to)`, clamped to the archive bounds. `None`
    /// reads to the end.
    pub(crate) fn slice(&self, from: usize, to: Option<usize>) -> Vec<EventHistoryEntry> {
        let entries = self.entries();
        let len = entries.len();
        let from = from.min(len);
        let to = to.unwrap_or(len).min(len);
        if from >= to {
            return Vec::new();
        }
        entries.iter().skip(from).take(to - from).cloned().collect()
    }

    pub(crate) fn clear(&self) {
        self.entries().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(event: &str, n: u64) -> EventHistoryEntry {
        EventHistoryEntry {
            event: event.to_string(),
            data: json!({ "n": n }),
            timestamp: Utc::now(),
            duration: Duration::from_micros(10),
            listeners_notified: 1,
            errors: 0,
        }
    }

    #[test]
    fn test_push_and_snapshot_preserve_order() {
        let history = EventHistory::new(10);
        history.push(entry("a", 1));
        history.push(entry("b", 2));
        history.push(entry("c", 3));

        let events: Vec<_> = history.snapshot().into_iter().map(|e| e.event).collect();
        assert_eq!(events, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_oldest_entries_evicted_at_capacity() {
        let history = EventHistory::new(3);
        for n in 0..5 {
            history.push(entry(&format!("e{}", n), n));
        }

        assert_eq!(history.len(), 3);
        let events: Vec<_> = history.snapshot().into_iter().map(|e| e.event).collect();
        assert_eq!(events, vec!["e2", "e3", "e4"]);
    }

    #[test]
    fn test_last_returns_tail() {
        let history = EventHistory::new(10);
        for n in 0..5 {
            history.push(entry(&format!("e{}", n), n));
        }

        let events: Vec<_> = history.last(2).into_iter().map(|e| e.event).collect();
        assert_eq!(events, vec!["e3", "e4"]);
        assert_eq!(history.last(100).len(), 5);
    }

    #[test]
    fn test_slice_clamps_out_of_range() {
        let history = EventHistory::new(10);
        for n in 0..4 {
            history.push(entry(&format!("e{}", n), n));
        }

        let events: Vec<_> = history
            .slice(1, Some(3))
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(events, vec!["e1", "e2"]);
        assert_eq!(history.slice(2, None).len(), 2);
        assert!(history.slice(10, Some(20)).is_empty());
        assert!(history.slice(3, Some(1)).is_empty());
    }

    #[test]
    fn test_zero_capacity_archives_nothing() {
        let history = EventHistory::new(0);
        history.push(entry("a", 1));
        assert_eq!(history.len(), 0);
    }

    #[test]
    fn test_clear() {
        let history = EventHistory::new(10);
        history.push(entry("a", 1));
        history.clear();
        assert_eq!(history.len(), 0);
        assert!(history.snapshot().is_empty());
    }

    #[test]
    fn test_entry_serializes_duration_as_millis() {
        let mut e = entry("a", 1);
        e.duration = Duration::from_millis(7);
        let serialized = serde_json::to_value(&e).unwrap();
        assert_eq!(serialized["duration"], json!(7));
        assert_eq!(serialized["event"], json!("a"));
    }
}
