use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

/// Fixed-window admission counter.
///
/// A window opens on its first acquisition after expiry and admits at
/// most `max_per_window` calls until `window` has elapsed. Overflow is
/// the caller's problem; the client queues it.
pub(crate) struct FixedWindowLimiter {
    max_per_window: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

struct WindowState {
    window_start: Instant,
    admitted: u32,
}

impl FixedWindowLimiter {
    pub(crate) fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window,
            // Floor keeps reset deadlines strictly in the future.
            window: window.max(Duration::from_millis(1)),
            state: Mutex::new(WindowState {
                window_start: Instant::now(),
                admitted: 0,
            }),
        }
    }

    /// Admits one call if the current window has capacity.
    pub(crate) fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        let now = Instant::now();
        if now.duration_since(state.window_start) >= self.window {
            state.window_start = now;
            state.admitted = 0;
        }
        if state.admitted < self.max_per_window {
            state.admitted += 1;
            true
        } else {
            false
        }
    }

    /// When the current window expires. Sleeping until this instant and
    /// retrying [`try_acquire`](Self::try_acquire) is the drain task's
    /// capacity wait.
    pub(crate) fn window_reset_at(&self) -> Instant {
        self.lock().window_start + self.window
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
