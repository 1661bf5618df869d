//! Process-wide event counters for cache and registration activity.
//!
//! Counters are cheap enough to stay on in release builds; they back the
//! diagnostics surfaced by [`snapshot`] and the assertions in the test suite.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

static EVENTS: Lazy<Mutex<HashMap<&'static str, u64>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Records one occurrence of a named cache or registry event.
pub fn cache_event(name: &'static str) {
    let mut events = EVENTS.lock().expect("event table poisoned");
    *events.entry(name).or_insert(0) += 1;
}

pub fn event_count(name: &str) -> u64 {
    let events = EVENTS.lock().expect("event table poisoned");
    events.get(name).copied().unwrap_or(0)
}

/// Returns every counter sorted by event name.
pub fn snapshot() -> Vec<(&'static str, u64)> {
    let events = EVENTS.lock().expect("event table poisoned");
    let mut rows: Vec<_> = events.iter().map(|(name, count)| (*name, *count)).collect();
    rows.sort_by(|a, b| a.0.cmp(b.0));
    rows
}
