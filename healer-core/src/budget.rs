//! Windowed retry budget counters.
//!
//! A budget is a per-key counter that resets once its window expires. Two
//! concurrent `consume` calls for the same key can never both succeed past
//! the limit: the count lives behind a single mutex, so the check and the
//! increment are one critical section.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::clock::{Clock, system_clock};

/// Default budget window: 24 hours.
pub const DEFAULT_BUDGET_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    started_ms: u64,
}

/// Process-wide windowed counter keyed by string.
///
/// Shared between every Transport invocation in the process; also reused as
/// the endpoint repair window by the toolkit.
pub struct RetryBudgetStore {
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, Window>>,
}

impl RetryBudgetStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// The shared process-wide store.
    pub fn global() -> Arc<RetryBudgetStore> {
        static GLOBAL: Lazy<Arc<RetryBudgetStore>> =
            Lazy::new(|| Arc::new(RetryBudgetStore::new(system_clock())));
        GLOBAL.clone()
    }

    /// Attempts to consume one unit of budget for `key`.
    ///
    /// A missing or expired window resets to `{count: 1}` and succeeds. A
    /// live window succeeds while `count < limit`, incrementing the count.
    pub fn consume(&self, key: &str, limit: u32, window_ms: u64) -> bool {
        let now = self.clock.now_ms();
        let mut windows = self.windows.lock().expect("budget store poisoned");
        let window = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            started_ms: now,
        });
        if now.saturating_sub(window.started_ms) >= window_ms {
            *window = Window {
                count: 0,
                started_ms: now,
            };
        }
        if window.count >= limit {
            tracing::debug!(key, limit, count = window.count, "retry budget denied");
            return false;
        }
        window.count += 1;
        true
    }

    /// Remaining units in the current window, `limit` when no window is live.
    pub fn remaining(&self, key: &str, limit: u32, window_ms: u64) -> u32 {
        let now = self.clock.now_ms();
        let windows = self.windows.lock().expect("budget store poisoned");
        match windows.get(key) {
            Some(window) if now.saturating_sub(window.started_ms) < window_ms => {
                limit.saturating_sub(window.count)
            }
            _ => limit,
        }
    }
}
