//! Key observers.
//!
//! A watch pairs a caller-chosen handle with a callback and remembers which
//! key ids it has already seen, so one publication is delivered at most once
//! per watch no matter how many peers advertise it.

use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Notification passed to a watch callback.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent {
    /// A payload arrived for a publication of the watched key.
    Arrived { key_id: Uuid, payload: Vec<u8> },
    /// A previously delivered publication expired or was retracted.
    Lost { key_id: Uuid },
}

/// Watch callback. Runs inline on the driver task; must not block.
pub type WatchFn = Box<dyn Fn(WatchEvent) + Send>;

struct Watch {
    handle: u64,
    watch: WatchFn,
    delivered: HashSet<Uuid>,
}

/// Watches per key.
#[derive(Default)]
pub struct WatchTable {
    watches: HashMap<String, Vec<Watch>>,
}

impl WatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a watch. Returns false when the handle is already taken
    /// for this key.
    pub fn add(&mut self, key: &str, handle: u64, watch: WatchFn) -> bool {
        let watches = self.watches.entry(key.to_string()).or_default();
        if watches.iter().any(|w| w.handle == handle) {
            return false;
        }
        watches.push(Watch {
            handle,
            watch,
            delivered: HashSet::new(),
        });
        true
    }

    /// Remove a watch. Returns true when the key has no watches left.
    pub fn remove(&mut self, key: &str, handle: u64) -> bool {
        if let Some(watches) = self.watches.get_mut(key) {
            watches.retain(|w| w.handle != handle);
            if watches.is_empty() {
                self.watches.remove(key);
                return true;
            }
        }
        false
    }

    pub fn is_watched(&self, key: &str) -> bool {
        self.watches.contains_key(key)
    }

    /// Keys with at least one watch.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.watches.keys()
    }

    /// Total registered watches.
    pub fn len(&self) -> usize {
        self.watches.values().map(|w| w.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Deliver a payload to every watch on `key` that has not seen this
    /// key id yet. Returns the number of callbacks invoked.
    pub fn arrived(&mut self, key: &str, key_id: Uuid, payload: &[u8]) -> usize {
        let Some(watches) = self.watches.get_mut(key) else {
            return 0;
        };
        let mut delivered = 0;
        for watch in watches.iter_mut() {
            if watch.delivered.insert(key_id) {
                (watch.watch)(WatchEvent::Arrived {
                    key_id,
                    payload: payload.to_vec(),
                });
                delivered += 1;
            }
        }
        delivered
    }

    /// Report a lost publication to every watch it was delivered to, and
    /// forget the delivery record so the id could be learned afresh.
    pub fn lost(&mut self, key: &str, key_id: Uuid) -> usize {
        let Some(watches) = self.watches.get_mut(key) else {
            return 0;
        };
        let mut notified = 0;
        for watch in watches.iter_mut() {
            if watch.delivered.remove(&key_id) {
                (watch.watch)(WatchEvent::Lost { key_id });
                notified += 1;
            }
        }
        notified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn recording() -> (WatchFn, mpsc::Receiver<WatchEvent>) {
        let (tx, rx) = mpsc::channel();
        (Box::new(move |ev| tx.send(ev).unwrap()), rx)
    }

    #[test]
    fn test_duplicate_handle_rejected() {
        let mut table = WatchTable::new();
        assert!(table.add("svc", 1, Box::new(|_| {})));
        assert!(!table.add("svc", 1, Box::new(|_| {})));
        assert!(table.add("svc", 2, Box::new(|_| {})));
        // Same handle on a different key is fine.
        assert!(table.add("other", 1, Box::new(|_| {})));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_arrival_delivered_once_per_watch() {
        let mut table = WatchTable::new();
        let (watch, rx) = recording();
        table.add("svc", 1, watch);

        let id = Uuid::new_v4();
        assert_eq!(table.arrived("svc", id, b"v1"), 1);
        assert_eq!(table.arrived("svc", id, b"v1"), 0);

        let ev = rx.try_recv().unwrap();
        assert_eq!(
            ev,
            WatchEvent::Arrived {
                key_id: id,
                payload: b"v1".to_vec()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_distinct_ids_both_delivered() {
        let mut table = WatchTable::new();
        let (watch, rx) = recording();
        table.add("svc", 1, watch);

        table.arrived("svc", Uuid::new_v4(), b"v1");
        table.arrived("svc", Uuid::new_v4(), b"v2");
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_lost_only_after_arrival() {
        let mut table = WatchTable::new();
        let (watch, rx) = recording();
        table.add("svc", 1, watch);

        let id = Uuid::new_v4();
        assert_eq!(table.lost("svc", id), 0);

        table.arrived("svc", id, b"v1");
        let _ = rx.try_recv();
        assert_eq!(table.lost("svc", id), 1);
        assert_eq!(rx.try_recv().unwrap(), WatchEvent::Lost { key_id: id });

        // The delivery record is gone; the id can arrive again.
        assert_eq!(table.arrived("svc", id, b"v1"), 1);
    }

    #[test]
    fn test_remove_reports_empty_key() {
        let mut table = WatchTable::new();
        table.add("svc", 1, Box::new(|_| {}));
        table.add("svc", 2, Box::new(|_| {}));

        assert!(!table.remove("svc", 1));
        assert!(table.remove("svc", 2));
        assert!(!table.is_watched("svc"));
        // Removing from a gone key is harmless.
        assert!(!table.remove("svc", 2));
    }
}
