//! Outstanding payload resolutions.
//!
//! A fetch tracks one `(key, keyId)` whose payload has been requested but
//! not yet delivered. Timeouts retry with exponential back-off measured in
//! timer ticks; the advertisement expiring underneath abandons the fetch.

use beacon_core::NodeAddress;
use std::collections::{BTreeMap, HashMap, VecDeque};
use uuid::Uuid;

/// Retry delay cap, in ticks.
pub const MAX_DELAY_TICKS: u64 = 16;

/// One in-flight resolution.
#[derive(Debug)]
pub struct Fetch {
    /// Address the advertisement named.
    pub node: NodeAddress,
    /// Current retry delay in ticks; doubles per timeout.
    pub delay: u64,
    /// Deadline of the currently armed timeout. Lets the expiration queue
    /// carry stale entries without firing early retries.
    at_ms: u64,
}

#[derive(Debug)]
struct FetchExp {
    key: String,
    key_id: Uuid,
    at_ms: u64,
}

/// All outstanding fetches plus their timeout queue.
#[derive(Debug, Default)]
pub struct FetchTable {
    fetches: HashMap<String, BTreeMap<Uuid, Fetch>>,
    expiration: VecDeque<FetchExp>,
}

impl FetchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str, key_id: &Uuid) -> bool {
        self.fetches
            .get(key)
            .map(|m| m.contains_key(key_id))
            .unwrap_or(false)
    }

    /// Total outstanding fetches.
    pub fn len(&self) -> usize {
        self.fetches.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.fetches.is_empty()
    }

    /// Record a fresh fetch with a one-tick timeout.
    pub fn schedule(&mut self, key: &str, key_id: Uuid, node: NodeAddress, now: u64, period: u64) {
        let at_ms = now.saturating_add(period);
        self.fetches.entry(key.to_string()).or_default().insert(
            key_id,
            Fetch {
                node,
                delay: 1,
                at_ms,
            },
        );
        self.expiration.push_back(FetchExp {
            key: key.to_string(),
            key_id,
            at_ms,
        });
    }

    /// Double the delay (capped) and arm the next timeout. Returns the new
    /// delay, or `None` if the fetch is no longer outstanding.
    pub fn reschedule(&mut self, key: &str, key_id: &Uuid, now: u64, period: u64) -> Option<u64> {
        let fetch = self.fetches.get_mut(key)?.get_mut(key_id)?;
        fetch.delay = (fetch.delay * 2).min(MAX_DELAY_TICKS);
        fetch.at_ms = now.saturating_add(fetch.delay.saturating_mul(period));
        let at_ms = fetch.at_ms;
        let delay = fetch.delay;
        self.expiration.push_back(FetchExp {
            key: key.to_string(),
            key_id: *key_id,
            at_ms,
        });
        Some(delay)
    }

    /// Drop a fetch, payload delivered (or resolution abandoned).
    pub fn resolve(&mut self, key: &str, key_id: &Uuid) -> Option<Fetch> {
        let entries = self.fetches.get_mut(key)?;
        let fetch = entries.remove(key_id);
        if entries.is_empty() {
            self.fetches.remove(key);
        }
        fetch
    }

    /// Drop every fetch for a key (its last watch was forgotten).
    pub fn cancel_key(&mut self, key: &str) {
        self.fetches.remove(key);
    }

    /// Pop every timeout that has come due and return the fetches that are
    /// still outstanding and were armed for exactly this deadline.
    pub fn due(&mut self, now: u64) -> Vec<(String, Uuid)> {
        let mut out = Vec::new();
        while self.expiration.front().is_some_and(|front| front.at_ms <= now) {
            let Some(entry) = self.expiration.pop_front() else {
                break;
            };
            if let Some(fetch) = self.fetches.get(&entry.key).and_then(|m| m.get(&entry.key_id)) {
                if fetch.at_ms == entry.at_ms {
                    out.push((entry.key, entry.key_id));
                }
            }
        }
        out
    }
}
