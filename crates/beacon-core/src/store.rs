//! TTL'd item store.
//!
//! A set of `(id, addrs, expiration)` records kept sorted by id, with set
//! semantics on merge and a linear expiration sweep. Both the node table and
//! each per-key advertisement table are instances of this store.

use crate::types::NodeAddress;
use uuid::Uuid;

/// One stored advertisement. `expiration` is an absolute wall-clock
/// millisecond deadline.
#[derive(Clone, Debug, PartialEq)]
pub struct Item {
    pub id: Uuid,
    pub addrs: NodeAddress,
    pub expiration: u64,
}

impl Item {
    /// Remaining lifetime in milliseconds, zero once expired.
    pub fn ttl(&self, now: u64) -> u64 {
        self.expiration.saturating_sub(now)
    }
}

/// Outcome of [`ItemStore::merge`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Merge {
    /// The id was not present and has been inserted.
    New,
    /// The id was present; the expiration was raised if later, addresses
    /// replaced.
    Refreshed,
    /// A zero TTL removed the stored entry.
    Retracted,
    /// A zero TTL for an id that was never stored.
    Unknown,
}

/// Ordered set of [`Item`]s keyed by id.
#[derive(Debug, Default)]
pub struct ItemStore {
    items: Vec<Item>,
}

impl ItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// All items, ordered by id.
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn get(&self, id: &Uuid) -> Option<&Item> {
        self.position(id).ok().map(|i| &self.items[i])
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.position(id).is_ok()
    }

    /// Merge an advertisement. A refresh never lowers the stored expiration;
    /// a zero TTL is an explicit retraction rather than a refresh.
    pub fn merge(&mut self, id: Uuid, addrs: NodeAddress, ttl_ms: u64, now: u64) -> Merge {
        match self.position(&id) {
            Ok(i) => {
                if ttl_ms == 0 {
                    self.items.remove(i);
                    return Merge::Retracted;
                }
                let item = &mut self.items[i];
                item.expiration = item.expiration.max(now.saturating_add(ttl_ms));
                item.addrs = addrs;
                Merge::Refreshed
            }
            Err(i) => {
                if ttl_ms == 0 {
                    return Merge::Unknown;
                }
                self.items.insert(
                    i,
                    Item {
                        id,
                        addrs,
                        expiration: now.saturating_add(ttl_ms),
                    },
                );
                Merge::New
            }
        }
    }

    pub fn remove(&mut self, id: &Uuid) -> bool {
        match self.position(id) {
            Ok(i) => {
                self.items.remove(i);
                true
            }
            Err(_) => false,
        }
    }

    /// Remove every item whose deadline has passed, returning the removed
    /// ids so the caller can drive loss notifications.
    pub fn expire(&mut self, now: u64) -> Vec<Uuid> {
        let mut removed = Vec::new();
        self.items.retain(|item| {
            if item.expiration <= now {
                removed.push(item.id);
                false
            } else {
                true
            }
        });
        removed
    }

    fn position(&self, id: &Uuid) -> Result<usize, usize> {
        self.items.binary_search_by(|item| item.id.cmp(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> NodeAddress {
        NodeAddress::single("127.0.0.1", port)
    }

    #[test]
    fn test_merge_inserts_sorted() {
        let mut store = ItemStore::new();
        let mut ids: Vec<Uuid> = (0..8).map(|_| Uuid::new_v4()).collect();

        for id in &ids {
            assert_eq!(store.merge(*id, addr(1), 1000, 0), Merge::New);
        }

        ids.sort();
        let stored: Vec<Uuid> = store.items().iter().map(|i| i.id).collect();
        assert_eq!(stored, ids);
    }

    #[test]
    fn test_refresh_never_lowers_expiration() {
        let mut store = ItemStore::new();
        let id = Uuid::new_v4();

        store.merge(id, addr(1), 10_000, 0);
        assert_eq!(store.get(&id).unwrap().expiration, 10_000);

        // A shorter TTL refresh keeps the later deadline.
        assert_eq!(store.merge(id, addr(2), 1000, 100), Merge::Refreshed);
        assert_eq!(store.get(&id).unwrap().expiration, 10_000);

        // A later deadline wins.
        assert_eq!(store.merge(id, addr(3), 20_000, 100), Merge::Refreshed);
        assert_eq!(store.get(&id).unwrap().expiration, 20_100);
    }

    #[test]
    fn test_refresh_replaces_addrs() {
        let mut store = ItemStore::new();
        let id = Uuid::new_v4();

        store.merge(id, addr(1), 1000, 0);
        store.merge(id, addr(2), 1000, 0);
        assert_eq!(store.get(&id).unwrap().addrs, addr(2));
    }

    #[test]
    fn test_zero_ttl_retracts() {
        let mut store = ItemStore::new();
        let id = Uuid::new_v4();

        assert_eq!(store.merge(id, addr(1), 0, 0), Merge::Unknown);
        assert!(store.is_empty());

        store.merge(id, addr(1), 1000, 0);
        assert_eq!(store.merge(id, addr(1), 0, 5), Merge::Retracted);
        assert!(!store.contains(&id));
    }

    #[test]
    fn test_expire_returns_removed_ids() {
        let mut store = ItemStore::new();
        let short = Uuid::new_v4();
        let long = Uuid::new_v4();

        store.merge(short, addr(1), 100, 0);
        store.merge(long, addr(1), 10_000, 0);

        let removed = store.expire(100);
        assert_eq!(removed, vec![short]);
        assert_eq!(store.len(), 1);
        assert!(store.contains(&long));

        assert!(store.expire(99).is_empty());
    }

    #[test]
    fn test_item_ttl_saturates() {
        let item = Item {
            id: Uuid::new_v4(),
            addrs: addr(1),
            expiration: 500,
        };
        assert_eq!(item.ttl(200), 300);
        assert_eq!(item.ttl(500), 0);
        assert_eq!(item.ttl(900), 0);
    }
}
