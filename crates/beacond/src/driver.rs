//! The discovery driver.
//!
//! One task owns every store and table. It pumps endpoint events, facade
//! commands and the jittered maintenance tick; nothing else touches state,
//! so handlers run without locks and in arrival order.

use crate::config::Config;
use crate::conn::ConnTable;
use crate::discovery::{Command, DiscoveryStats};
use crate::fetch::FetchTable;
use crate::watch::WatchTable;
use beacon_core::{ItemStore, NodeAddress, Payload};
use beacon_net::{Endpoint, NetEvent, SocketId};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// A locally published value.
pub(crate) struct Publication {
    pub id: Uuid,
    pub payload: Payload,
}

pub(crate) struct Driver {
    pub(crate) ttl_ms: u64,
    pub(crate) period_ms: u64,
    pub(crate) conn_exp_thresh_ms: u64,
    pub(crate) seeds: Vec<(String, u16)>,

    pub(crate) my_id: Uuid,
    pub(crate) my_node: NodeAddress,
    pub(crate) endpoint: Endpoint,

    /// Known peers.
    pub(crate) nodes: ItemStore,
    /// Advertised key versions, per key.
    pub(crate) keys: HashMap<String, ItemStore>,
    /// Locally published values.
    pub(crate) data: HashMap<String, Publication>,

    pub(crate) conns: ConnTable,
    pub(crate) fetches: FetchTable,
    pub(crate) watches: WatchTable,
}

/// Wall-clock milliseconds.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Driver {
    pub(crate) fn new(
        config: &Config,
        my_id: Uuid,
        my_node: NodeAddress,
        endpoint: Endpoint,
    ) -> Self {
        Self {
            ttl_ms: config.ttl_ms,
            period_ms: config.period_ms,
            conn_exp_thresh_ms: config.conn_exp_thresh_ms,
            seeds: config
                .seed
                .iter()
                .map(|addr| (addr.ip().to_string(), addr.port()))
                .collect(),
            my_id,
            my_node,
            endpoint,
            nodes: ItemStore::new(),
            keys: HashMap::new(),
            data: HashMap::new(),
            conns: ConnTable::new(),
            fetches: FetchTable::new(),
            watches: WatchTable::new(),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut net_rx: mpsc::Receiver<NetEvent>,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    ) {
        info!(id = %self.my_id, node = %self.my_node, "discovery driver started");

        // Join the mesh without waiting a full period for the first tick.
        self.seed_connect(now_ms());

        let mut next_tick = Instant::now() + self.timer_period();
        loop {
            tokio::select! {
                ev = net_rx.recv() => match ev {
                    Some(ev) => self.on_net(ev),
                    None => break,
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd),
                },
                _ = tokio::time::sleep_until(next_tick) => {
                    self.on_tick(now_ms());
                    next_tick = Instant::now() + self.timer_period();
                }
            }
        }

        info!("discovery driver stopped");
        self.endpoint.close();
    }

    /// Base period perturbed by up to 25% either way, so tick phases drift
    /// apart across the fleet.
    fn timer_period(&self) -> Duration {
        let low = self.period_ms - self.period_ms / 4;
        let high = self.period_ms + self.period_ms / 4;
        Duration::from_millis(rand::thread_rng().gen_range(low..=high))
    }

    fn on_net(&mut self, ev: NetEvent) {
        match ev {
            NetEvent::Accepted { sock, peer } => {
                debug!(%sock, %peer, "accepted connection");
                self.conns.open(sock, now_ms());
                let init = self.init_message();
                self.send_message(sock, &init);
            }
            NetEvent::Closed { sock } => {
                if let Some(conn) = self.conns.remove(sock) {
                    debug!(%sock, node = ?conn.node_id, "connection lost");
                }
            }
            NetEvent::Frame { sock, frame } => self.on_frame(sock, frame),
        }
    }

    fn on_command(&mut self, cmd: Command) {
        let now = now_ms();
        match cmd {
            Command::Publish { key, payload } => self.publish(&key, payload, now),
            Command::Retract { key } => self.retract(&key),
            Command::Discover { key, handle, watch } => self.discover(&key, handle, watch, now),
            Command::Forget { key, handle } => self.forget(&key, handle),
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown => {}
        }
    }

    fn stats(&self) -> DiscoveryStats {
        DiscoveryStats {
            nodes: self.nodes.len(),
            connections: self.conns.len(),
            edges: self.conns.edges().len(),
            keys: self.keys.len(),
            key_entries: self.keys.values().map(|s| s.len()).sum(),
            fetches: self.fetches.len(),
            watches: self.watches.len(),
            publications: self.data.len(),
        }
    }

    /// One maintenance pass: expiry first, then mesh churn.
    fn on_tick(&mut self, now: u64) {
        self.refresh_own_keys(now);

        for sock in self.conns.expired(now, self.conn_exp_thresh_ms) {
            debug!(%sock, "handshake timed out");
            self.teardown(sock);
        }

        let gone = self.nodes.expire(now);
        if !gone.is_empty() {
            debug!(count = gone.len(), "expired nodes");
        }

        self.expire_keys(now);
        self.expire_fetches(now);

        self.random_disconnect();
        self.random_connect(now);
        self.seed_connect(now);
    }

    /// Keep our own publications advertised at full TTL; learned copies of
    /// them on other nodes decay independently.
    fn refresh_own_keys(&mut self, now: u64) {
        for (key, publication) in &self.data {
            self.keys.entry(key.clone()).or_default().merge(
                publication.id,
                self.my_node.clone(),
                self.ttl_ms,
                now,
            );
        }
    }

    fn expire_keys(&mut self, now: u64) {
        let mut lost = Vec::new();
        let mut emptied = Vec::new();
        for (key, store) in self.keys.iter_mut() {
            for id in store.expire(now) {
                lost.push((key.clone(), id));
            }
            if store.is_empty() {
                emptied.push(key.clone());
            }
        }
        for (key, id) in lost {
            debug!(%key, key_id = %id, "key advertisement expired");
            self.watches.lost(&key, id);
        }
        for key in emptied {
            self.keys.remove(&key);
        }
    }

    fn expire_fetches(&mut self, now: u64) {
        for (key, key_id) in self.fetches.due(now) {
            if !self.watches.is_watched(&key) {
                // Last consumer forgot the key since the fetch went out.
                self.fetches.resolve(&key, &key_id);
                continue;
            }
            let advertised = self
                .keys
                .get(&key)
                .map(|s| s.contains(&key_id))
                .unwrap_or(false);
            if !advertised {
                debug!(%key, key_id = %key_id, "abandoning fetch, advertisement expired");
                self.fetches.resolve(&key, &key_id);
                continue;
            }
            if let Some(delay) = self.fetches.reschedule(&key, &key_id, now, self.period_ms) {
                debug!(%key, key_id = %key_id, delay, "fetch timed out, retrying");
                self.send_fetch(&key, key_id, now);
            }
        }
    }

    /// Drop one random edge now and then so advertisements keep finding new
    /// paths through the mesh.
    fn random_disconnect(&mut self) {
        let victim = {
            let edges = self.conns.edges();
            if edges.len() < 2 {
                None
            } else {
                let mut rng = rand::thread_rng();
                if rng.gen::<f64>() < 1.0 / edges.len() as f64 {
                    edges.choose(&mut rng).copied()
                } else {
                    None
                }
            }
        };
        if let Some(sock) = victim {
            debug!(%sock, "rotating random edge");
            self.teardown(sock);
        }
    }

    fn random_connect(&mut self, now: u64) {
        let target = {
            let mut rng = rand::thread_rng();
            let candidates: Vec<_> = self
                .nodes
                .items()
                .iter()
                .filter(|item| item.ttl(now) > 0 && !self.conns.is_connected(&item.id))
                .collect();
            candidates
                .choose(&mut rng)
                .map(|item| (item.id, item.addrs.clone()))
        };
        if let Some((id, addrs)) = target {
            debug!(node = %id, "dialing random node");
            self.dial(&addrs, now);
        }
    }

    /// An empty edge set means the node fell off the mesh; start over from
    /// the static seed list.
    fn seed_connect(&mut self, now: u64) {
        if !self.conns.edges().is_empty() || self.seeds.is_empty() {
            return;
        }
        info!(seeds = self.seeds.len(), "no edges, dialing seeds");
        for (host, port) in self.seeds.clone() {
            self.dial(&NodeAddress::single(host, port), now);
        }
    }

    /// Open an outbound connection and start its handshake.
    pub(crate) fn dial(&mut self, addrs: &NodeAddress, now: u64) -> SocketId {
        let targets = addrs
            .iter()
            .map(|addr| (addr.host.clone(), addr.port))
            .collect();
        let sock = self.endpoint.connect(targets);
        self.conns.open(sock, now);
        let init = self.init_message();
        self.send_message(sock, &init);
        sock
    }

    /// Close a connection and reap its state immediately. The endpoint's
    /// later `Closed` event finds nothing and is ignored.
    pub(crate) fn teardown(&mut self, sock: SocketId) {
        self.endpoint.disconnect(sock);
        self.conns.remove(sock);
    }
}
