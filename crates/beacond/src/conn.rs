//! Per-connection state and the connection table.

use beacon_net::SocketId;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// State for one live socket.
#[derive(Debug)]
pub struct ConnState {
    pub sock: SocketId,
    /// Monotonically increasing connection id. Socket slots get reused;
    /// queued expiration entries carry the seq they were armed for so a
    /// stale entry cannot tear down the slot's next occupant.
    pub seq: u64,
    /// Peer node id, known once `Init` arrives.
    pub node_id: Option<Uuid>,
    /// Peer protocol version; nonzero means the handshake completed.
    pub version: u64,
    /// Fetches issued while the handshake was still in flight, flushed on
    /// initialization.
    pub pending_fetch: Vec<(String, Uuid)>,
}

impl ConnState {
    pub fn initialized(&self) -> bool {
        self.version != 0
    }
}

/// One handshake-timeout entry.
#[derive(Debug)]
struct ConnExp {
    sock: SocketId,
    seq: u64,
    at_ms: u64,
}

/// Table of live connections: socket state, the node-to-socket index,
/// initialized edges, and the handshake expiration queue.
#[derive(Debug, Default)]
pub struct ConnTable {
    conns: HashMap<SocketId, ConnState>,
    by_node: HashMap<Uuid, SocketId>,
    edges: Vec<SocketId>,
    expiration: VecDeque<ConnExp>,
    next_seq: u64,
}

impl ConnTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and arm its handshake timeout.
    pub fn open(&mut self, sock: SocketId, now: u64) -> &mut ConnState {
        self.next_seq += 1;
        self.expiration.push_back(ConnExp {
            sock,
            seq: self.next_seq,
            at_ms: now,
        });
        self.conns.entry(sock).or_insert(ConnState {
            sock,
            seq: self.next_seq,
            node_id: None,
            version: 0,
            pending_fetch: Vec::new(),
        })
    }

    pub fn get(&self, sock: SocketId) -> Option<&ConnState> {
        self.conns.get(&sock)
    }

    pub fn get_mut(&mut self, sock: SocketId) -> Option<&mut ConnState> {
        self.conns.get_mut(&sock)
    }

    /// Mark a connection initialized and index it by node id. The caller
    /// has already rejected duplicates for this node.
    pub fn initialize(&mut self, sock: SocketId, node_id: Uuid, version: u64) {
        if let Some(conn) = self.conns.get_mut(&sock) {
            conn.node_id = Some(node_id);
            conn.version = version;
            self.by_node.insert(node_id, sock);
            self.edges.push(sock);
        }
    }

    pub fn lookup_node(&self, node_id: &Uuid) -> Option<SocketId> {
        self.by_node.get(node_id).copied()
    }

    pub fn is_connected(&self, node_id: &Uuid) -> bool {
        self.by_node.contains_key(node_id)
    }

    /// Reap a connection, cleaning the node index and edge set.
    pub fn remove(&mut self, sock: SocketId) -> Option<ConnState> {
        let conn = self.conns.remove(&sock)?;
        if let Some(node_id) = conn.node_id {
            if self.by_node.get(&node_id) == Some(&sock) {
                self.by_node.remove(&node_id);
            }
        }
        self.edges.retain(|s| *s != sock);
        Some(conn)
    }

    /// Initialized sockets.
    pub fn edges(&self) -> &[SocketId] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Pop every expiration entry older than `thresh_ms` and return the
    /// sockets that still exist, match the armed seq and never completed
    /// their handshake. Stale entries for reused slots or initialized
    /// connections are dropped silently.
    pub fn expired(&mut self, now: u64, thresh_ms: u64) -> Vec<SocketId> {
        let mut out = Vec::new();
        while self
            .expiration
            .front()
            .is_some_and(|front| front.at_ms.saturating_add(thresh_ms) <= now)
        {
            let Some(entry) = self.expiration.pop_front() else {
                break;
            };
            if let Some(conn) = self.conns.get(&entry.sock) {
                if conn.seq == entry.seq && !conn.initialized() {
                    out.push(entry.sock);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_net::Endpoint;

    // Socket ids only come out of an endpoint; spin one up to mint a few.
    async fn socks(n: usize) -> Vec<SocketId> {
        let (endpoint, _rx, _) = Endpoint::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let out = (0..n)
            .map(|_| endpoint.connect(vec![("127.0.0.1".to_string(), 1)]))
            .collect();
        endpoint.close();
        out
    }

    #[tokio::test]
    async fn test_open_initialize_remove() {
        let ids = socks(2).await;
        let mut table = ConnTable::new();
        let peer = Uuid::new_v4();

        table.open(ids[0], 0);
        assert!(!table.get(ids[0]).unwrap().initialized());
        assert!(table.edges().is_empty());

        table.initialize(ids[0], peer, 1);
        assert!(table.get(ids[0]).unwrap().initialized());
        assert_eq!(table.lookup_node(&peer), Some(ids[0]));
        assert_eq!(table.edges(), &[ids[0]]);

        let conn = table.remove(ids[0]).unwrap();
        assert_eq!(conn.node_id, Some(peer));
        assert!(table.lookup_node(&peer).is_none());
        assert!(table.edges().is_empty());
    }

    #[tokio::test]
    async fn test_handshake_expiry_skips_initialized() {
        let ids = socks(2).await;
        let mut table = ConnTable::new();

        table.open(ids[0], 0);
        table.open(ids[1], 0);
        table.initialize(ids[1], Uuid::new_v4(), 1);

        // Not yet due.
        assert!(table.expired(99, 100).is_empty());

        // Only the uninitialized connection expires.
        assert_eq!(table.expired(100, 100), vec![ids[0]]);

        // Queue is drained.
        assert!(table.expired(10_000, 100).is_empty());
    }

    #[tokio::test]
    async fn test_stale_entry_spares_reopened_conn() {
        let ids = socks(1).await;
        let mut table = ConnTable::new();

        // First occupant of the socket never completes its handshake and
        // is torn down out of band.
        table.open(ids[0], 0);
        table.remove(ids[0]);

        // The socket id is reused for a fresh connection before the old
        // expiration entry comes due.
        table.open(ids[0], 90);

        // The stale entry (armed at t=0) must not report the new conn; the
        // new entry (armed at t=90) is not yet due.
        assert!(table.expired(100, 100).is_empty());

        // The new occupant's own entry still works.
        assert_eq!(table.expired(190, 100), vec![ids[0]]);
    }
}
