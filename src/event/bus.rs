//! # Event Bus Implementation
//!
//! The EventBus is the central messaging hub for the resilience core. It
//! provides a listener-based publish-subscribe mechanism with priority
//! ordering, so components can react to cache updates, completed calls and
//! failures without direct dependencies.
//!
//! ## Features
//!
//! - **Priority Dispatch**: Listeners fire in descending priority order
//! - **Listener Isolation**: A failing listener never blocks the others
//! - **Bounded History**: Recent emits are archived for inspection and replay
//! - **Statistics**: Emit counts and timing are tracked per event
//!
//! ## Design Decisions
//!
//! Listeners are plain synchronous callbacks invoked on the emitting task.
//! `emit` therefore never blocks on channel capacity and never fails: a
//! listener returning an error is caught, counted and re-published as a
//! [`SYSTEM_ERROR`](crate::event::SYSTEM_ERROR) event. Async reactions
//! belong inside the listener body (for example via `tokio::spawn`).
//!
//! Dispatch iterates a snapshot of the registration list. Listeners may
//! subscribe, cancel or emit from inside a callback without deadlocking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, trace};
use uuid::Uuid;

use crate::config::EventBusConfig;
use crate::event::history::{EventHistory, EventHistoryEntry};
use crate::event::{error_payload, ErrorSeverity, SYSTEM_ERROR};

/// Error type listeners may return. Returning `Err` marks the listener
/// invocation as failed without affecting other listeners.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

type ListenerCallback = dyn Fn(&Value) -> Result<(), ListenerError> + Send + Sync;

struct ListenerRecord {
    id: Uuid,
    priority: i32,
    once: bool,
    /// Set on first invocation so a `once` listener cannot fire twice
    /// under overlapping emits.
    fired: AtomicBool,
    callback: Box<ListenerCallback>,
}

type ListenerMap = DashMap<String, Vec<Arc<ListenerRecord>>>;

/// Handle for one listener registration.
///
/// Dropping the handle does not remove the listener; call
/// [`Subscription::cancel`] for that. Cancelling twice, or after the
/// listener was already removed by `off`, `clear` or `once` expiry, is a
/// no-op.
pub struct Subscription {
    listeners: Weak<ListenerMap>,
    event: String,
    id: Uuid,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn cancel(&self) {
        let Some(listeners) = self.listeners.upgrade() else {
            return;
        };
        let now_empty = match listeners.get_mut(&self.event) {
            Some(mut records) => {
                records.retain(|record| record.id != self.id);
                records.is_empty()
            }
            None => false,
        };
        if now_empty {
            listeners.remove_if(&self.event, |_, records| records.is_empty());
        }
    }
}

/// Outcome of a single [`EventBus::emit`].
#[derive(Debug, Clone, Copy)]
pub struct EmitReport {
    pub listeners_notified: usize,
    pub errors: usize,
    pub duration: Duration,
}

/// Snapshot of bus activity counters.
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub total_events_emitted: u64,
    pub total_listeners: usize,
    pub event_counts: HashMap<String, u64>,
    /// Mean emit duration in milliseconds.
    pub average_emit_time: f64,
    pub errors: u64,
}

#[derive(Default)]
struct StatsInner {
    total_events_emitted: u64,
    event_counts: HashMap<String, u64>,
    average_emit_time: f64,
    errors: u64,
}

/// # EventBus
///
/// Central hub for priority publish-subscribe between the client, the
/// cache and application code.
///
/// Events are identified by plain string names. Payloads are
/// [`serde_json::Value`] so producers and consumers stay decoupled; the
/// well-known system events in [`crate::event`] come with payload helper
/// constructors.
///
/// ## Example
///
/// ```rust,no_run
/// use keel::event::EventBus;
/// use serde_json::json;
///
/// let bus = EventBus::default();
/// let _sub = bus.on("user:login", |data| {
///     println!("logged in: {}", data["userId"]);
///     Ok(())
/// });
/// bus.emit("user:login", json!({ "userId": "u-1" }));
/// ```
pub struct EventBus {
    listeners: Arc<ListenerMap>,
    history: EventHistory,
    stats: Mutex<StatsInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            listeners: Arc::new(DashMap::new()),
            history: EventHistory::new(config.max_history),
            stats: Mutex::new(StatsInner::default()),
        }
    }

    /// Registers a listener at priority 0.
    ///
    /// Higher priorities fire first within one emit; listeners at equal
    /// priority fire in registration order. The returned [`Subscription`]
    /// removes exactly this registration when cancelled.
    pub fn on<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.register(event, 0, false, callback)
    }

    pub fn on_with_priority<F>(&self, event: &str, priority: i32, callback: F) -> Subscription
    where
        F: Fn(&Value) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.register(event, priority, false, callback)
    }

    /// Registers a listener that is removed after its first invocation.
    pub fn once<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.register(event, 0, true, callback)
    }

    pub fn once_with_priority<F>(&self, event: &str, priority: i32, callback: F) -> Subscription
    where
        F: Fn(&Value) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.register(event, priority, true, callback)
    }

    fn register<F>(&self, event: &str, priority: i32, once: bool, callback: F) -> Subscription
    where
        F: Fn(&Value) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let record = Arc::new(ListenerRecord {
            id: Uuid::new_v4(),
            priority,
            once,
            fired: AtomicBool::new(false),
            callback: Box::new(callback),
        });
        let id = record.id;
        self.listeners
            .entry(event.to_string())
            .or_default()
            .push(record);
        debug!(event, listener = %id, priority, once, "Listener registered");
        Subscription {
            listeners: Arc::downgrade(&self.listeners),
            event: event.to_string(),
            id,
        }
    }

    /// Emits an event to all listeners registered for `event`.
    ///
    /// Listeners run synchronously in priority order (descending, stable
    /// within equal priority). A listener returning `Err` is counted,
    /// logged and re-published as a [`SYSTEM_ERROR`] event; the remaining
    /// listeners still run. Emitting with no listeners registered is a
    /// silent no-op that is still archived and counted.
    ///
    /// # Returns
    ///
    /// * `EmitReport` - listeners notified, listener errors and elapsed time
    pub fn emit(&self, event: &str, data: Value) -> EmitReport {
        let started = Instant::now();
        trace!(event, "Emitting event");

        let mut snapshot: Vec<Arc<ListenerRecord>> = self
            .listeners
            .get(event)
            .map(|records| records.clone())
            .unwrap_or_default();
        // Stable sort keeps registration order within equal priority.
        snapshot.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut notified = 0;
        let mut errors = 0;
        let mut expired: Vec<Uuid> = Vec::new();

        for record in &snapshot {
            if record.once && record.fired.swap(true, Ordering::SeqCst) {
                continue;
            }
            notified += 1;
            if let Err(err) = (record.callback)(&data) {
                errors += 1;
                error!(event, listener = %record.id, "Listener failed: {}", err);
                // Failures inside system:error dispatch are counted but
                // not re-published, so error reporting cannot recurse.
                if event != SYSTEM_ERROR {
                    self.emit(
                        SYSTEM_ERROR,
                        error_payload(
                            &err.to_string(),
                            &format!("event:{}", event),
                            ErrorSeverity::Medium,
                        ),
                    );
                }
            }
            if record.once {
                expired.push(record.id);
            }
        }

        if !expired.is_empty() {
            self.remove_listeners(event, &expired);
        }

        let duration = started.elapsed();
        self.history.push(EventHistoryEntry {
            event: event.to_string(),
            data,
            timestamp: chrono::Utc::now(),
            duration,
            listeners_notified: notified,
            errors,
        });

        let mut stats = self.stats_inner();
        stats.total_events_emitted += 1;
        *stats.event_counts.entry(event.to_string()).or_insert(0) += 1;
        stats.errors += errors as u64;
        let emit_ms = duration.as_secs_f64() * 1000.0;
        stats.average_emit_time +=
            (emit_ms - stats.average_emit_time) / stats.total_events_emitted as f64;
        drop(stats);

        EmitReport {
            listeners_notified: notified,
            errors,
            duration,
        }
    }

    /// Removes all listeners for `event`. Returns how many were removed.
    pub fn off(&self, event: &str) -> usize {
        self.listeners
            .remove(event)
            .map(|(_, records)| records.len())
            .unwrap_or(0)
    }

    /// Removes all listeners for all events. History and stats are kept.
    pub fn clear(&self) {
        self.listeners.clear();
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .get(event)
            .map(|records| records.len())
            .unwrap_or(0)
    }

    pub fn total_listeners(&self) -> usize {
        self.listeners.iter().map(|entry| entry.value().len()).sum()
    }

    /// Full archived history, oldest first.
    pub fn history(&self) -> Vec<EventHistoryEntry> {
        self.history.snapshot()
    }

    /// The `n` most recent archived emits, oldest first.
    pub fn last_events(&self, n: usize) -> Vec<EventHistoryEntry> {
        self.history.last(n)
    }

    pub fn clear_history(&self) {
        self.history.clear();
    }

    /// Re-emits archived entries `[from, to)` through the normal dispatch
    /// path, in original order. Replayed emits are archived again like any
    /// other emit. Out-of-range bounds are clamped.
    ///
    /// # Returns
    ///
    /// * `usize` - number of entries replayed
    pub fn replay(&self, from: usize, to: Option<usize>) -> usize {
        let entries = self.history.slice(from, to);
        let count = entries.len();
        debug!(from, ?to, count, "Replaying event history");
        for entry in entries {
            self.emit(&entry.event, entry.data);
        }
        count
    }

    pub fn stats(&self) -> BusStats {
        let stats = self.stats_inner();
        BusStats {
            total_events_emitted: stats.total_events_emitted,
            total_listeners: self.total_listeners(),
            event_counts: stats.event_counts.clone(),
            average_emit_time: stats.average_emit_time,
            errors: stats.errors,
        }
    }

    pub fn reset_stats(&self) {
        *self.stats_inner() = StatsInner::default();
    }

    /// Per-event emit counts, most frequent first.
    pub fn event_summary(&self) -> Vec<(String, u64)> {
        let stats = self.stats_inner();
        let mut summary: Vec<(String, u64)> = stats
            .event_counts
            .iter()
            .map(|(event, count)| (event.clone(), *count))
            .collect();
        drop(stats);
        summary.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        summary
    }

    fn remove_listeners(&self, event: &str, ids: &[Uuid]) {
        if let Some(mut records) = self.listeners.get_mut(event) {
            records.retain(|record| !ids.contains(&record.id));
            let now_empty = records.is_empty();
            drop(records);
            if now_empty {
                self.listeners
                    .remove_if(event, |_, records| records.is_empty());
            }
        }
    }

    // A poisoned lock only marks a panic elsewhere, the counters stay
    // valid.
    fn stats_inner(&self) -> MutexGuard<'_, StatsInner> {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CACHE_UPDATED, DATA_LOADED};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_listener() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = count.clone();
        let _sub = bus.on("test:event", move |data| {
            assert_eq!(data["value"], json!(42));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let report = bus.emit("test:event", json!({ "value": 42 }));
        assert_eq!(report.listeners_notified, 1);
        assert_eq!(report.errors, 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_emit_without_listeners_is_noop() {
        let bus = EventBus::default();
        let report = bus.emit("nobody:listens", json!(null));
        assert_eq!(report.listeners_notified, 0);
        assert_eq!(report.errors, 0);
        // Still archived and counted.
        assert_eq!(bus.history().len(), 1);
        assert_eq!(bus.stats().total_events_emitted, 1);
    }

    #[test]
    fn test_priority_order_descending() {
        let bus = EventBus::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        for priority in [1, 10, 5] {
            let order = order.clone();
            let _ = bus.on_with_priority("ordered", priority, move |_| {
                order.lock().unwrap().push(priority);
                Ok(())
            });
        }

        bus.emit("ordered", json!(null));
        assert_eq!(*order.lock().unwrap(), vec![10, 5, 1]);
    }

    #[test]
    fn test_equal_priority_keeps_registration_order() {
        let bus = EventBus::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        for n in 0..4 {
            let order = order.clone();
            let _ = bus.on("ordered", move |_| {
                order.lock().unwrap().push(n);
                Ok(())
            });
        }

        bus.emit("ordered", json!(null));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_failing_listener_does_not_stop_others() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));

        let _a = bus.on_with_priority("fragile", 10, |_| Err("listener broke".into()));
        let counter = count.clone();
        let _b = bus.on("fragile", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let system_errors = Arc::new(Mutex::new(Vec::new()));
        let captured = system_errors.clone();
        let _c = bus.on(SYSTEM_ERROR, move |data| {
            captured.lock().unwrap().push(data.clone());
            Ok(())
        });

        let report = bus.emit("fragile", json!(null));
        assert_eq!(report.listeners_notified, 2);
        assert_eq!(report.errors, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let captured = system_errors.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0]["context"], json!("event:fragile"));
        assert_eq!(captured[0]["severity"], json!("medium"));
    }

    #[test]
    fn test_failing_system_error_listener_does_not_recurse() {
        let bus = EventBus::default();
        let invocations = Arc::new(AtomicUsize::new(0));

        let counter = invocations.clone();
        let _sub = bus.on(SYSTEM_ERROR, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("error handler broke".into())
        });

        let report = bus.emit(SYSTEM_ERROR, json!({ "error": "original" }));
        assert_eq!(report.errors, 1);
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_once_listener_fires_exactly_once() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = count.clone();
        let sub = bus.once("boot", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit("boot", json!(null));
        bus.emit("boot", json!(null));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count("boot"), 0);

        // Cancel after expiry is a no-op.
        sub.cancel();
        sub.cancel();
    }

    #[test]
    fn test_once_with_priority_fires_first_then_expires() {
        let bus = EventBus::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        let seen = order.clone();
        let _steady = bus.on("sync", move |_| {
            seen.lock().unwrap().push("steady");
            Ok(())
        });
        let seen = order.clone();
        let _first = bus.once_with_priority("sync", 10, move |_| {
            seen.lock().unwrap().push("first");
            Ok(())
        });

        bus.emit("sync", json!(null));
        bus.emit("sync", json!(null));

        assert_eq!(*order.lock().unwrap(), vec!["first", "steady", "steady"]);
        assert_eq!(bus.listener_count("sync"), 1);
    }

    #[test]
    fn test_once_listener_removed_even_after_error() {
        let bus = EventBus::default();
        let _sub = bus.once("boot", |_| Err("broke".into()));

        let report = bus.emit("boot", json!(null));
        assert_eq!(report.errors, 1);
        assert_eq!(bus.listener_count("boot"), 0);
    }

    #[test]
    fn test_cancel_removes_only_that_registration() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = count.clone();
        let keep = bus.on("evt", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let counter = count.clone();
        let cancel = bus.on("evt", move |_| {
            counter.fetch_add(10, Ordering::SeqCst);
            Ok(())
        });

        cancel.cancel();
        cancel.cancel();
        bus.emit("evt", json!(null));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count("evt"), 1);
        drop(keep);
    }

    #[test]
    fn test_cancel_last_listener_drops_the_event_entry() {
        let bus = EventBus::default();
        let sub = bus.on("solo", |_| Ok(()));
        assert_eq!(bus.listener_count("solo"), 1);

        sub.cancel();
        assert_eq!(bus.listener_count("solo"), 0);
        assert_eq!(bus.total_listeners(), 0);
        // Emitting to the now-unknown event is back to a silent no-op.
        assert_eq!(bus.emit("solo", json!(null)).listeners_notified, 0);
    }

    #[test]
    fn test_off_and_clear() {
        let bus = EventBus::default();
        let _a = bus.on("a", |_| Ok(()));
        let _b = bus.on("a", |_| Ok(()));
        let _c = bus.on("b", |_| Ok(()));

        assert_eq!(bus.off("a"), 2);
        assert_eq!(bus.listener_count("a"), 0);
        assert_eq!(bus.total_listeners(), 1);

        bus.clear();
        assert_eq!(bus.total_listeners(), 0);
    }

    #[test]
    fn test_listener_can_subscribe_during_emit() {
        let bus = Arc::new(EventBus::default());

        let bus_ref = bus.clone();
        let _sub = bus.on("outer", move |_| {
            let _inner = bus_ref.on("inner", |_| Ok(()));
            Ok(())
        });

        bus.emit("outer", json!(null));
        assert_eq!(bus.listener_count("inner"), 1);
    }

    #[test]
    fn test_replay_reinvokes_in_order() {
        let bus = EventBus::default();
        bus.emit(DATA_LOADED, json!({ "n": 1 }));
        bus.emit(CACHE_UPDATED, json!({ "n": 2 }));
        bus.emit(DATA_LOADED, json!({ "n": 3 }));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let _sub = bus.on(DATA_LOADED, move |data| {
            captured.lock().unwrap().push(data["n"].clone());
            Ok(())
        });

        let replayed = bus.replay(0, Some(3));
        assert_eq!(replayed, 3);
        assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(3)]);
        // Replayed emits are archived again.
        assert_eq!(bus.history().len(), 6);
    }

    #[test]
    fn test_stats_track_counts_and_errors() {
        let bus = EventBus::default();
        let _ok = bus.on("a", |_| Ok(()));
        let _bad = bus.on("b", |_| Err("broke".into()));

        bus.emit("a", json!(null));
        bus.emit("a", json!(null));
        bus.emit("b", json!(null));

        let stats = bus.stats();
        // The failing emit also publishes one system:error event.
        assert_eq!(stats.total_events_emitted, 4);
        assert_eq!(stats.event_counts["a"], 2);
        assert_eq!(stats.event_counts["b"], 1);
        assert_eq!(stats.event_counts[SYSTEM_ERROR], 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.total_listeners, 2);
        assert!(stats.average_emit_time >= 0.0);

        let summary = bus.event_summary();
        assert_eq!(summary[0], ("a".to_string(), 2));

        bus.reset_stats();
        assert_eq!(bus.stats().total_events_emitted, 0);
        assert_eq!(bus.stats().total_listeners, 2);
    }

    #[test]
    fn test_history_is_bounded() {
        let bus = EventBus::new(EventBusConfig { max_history: 5 });
        for n in 0..12 {
            bus.emit("tick", json!({ "n": n }));
        }

        let history = bus.history();
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].data["n"], json!(7));
        assert_eq!(history[4].data["n"], json!(11));

        assert_eq!(bus.last_events(2)[0].data["n"], json!(10));
        bus.clear_history();
        assert!(bus.history().is_empty());
    }
}
