//! Bounded once-per-key warning de-duplication.
//!
//! Owned and injected by whichever component issues the warnings, rather
//! than held as ambient global state, so behavior stays testable and
//! nothing leaks between tests.

use std::collections::HashMap;

/// Remembers which warning keys have already been emitted, evicting the
/// least recently seen key once full.
#[derive(Debug)]
pub struct WarningCache {
    seen: HashMap<String, u64>,
    capacity: usize,
}

impl WarningCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// True exactly once per distinct key (until eviction recycles it).
    pub fn first_sighting(&mut self, key: &str, now: u64) -> bool {
        if let Some(last) = self.seen.get_mut(key) {
            *last = now;
            return false;
        }
        if self.seen.len() >= self.capacity {
            if let Some(oldest) = self
                .seen
                .iter()
                .min_by_key(|(_, last)| **last)
                .map(|(key, _)| key.clone())
            {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.to_string(), now);
        true
    }
}

impl Default for WarningCache {
    fn default() -> Self {
        Self::new(64)
    }
}
