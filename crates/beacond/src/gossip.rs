//! The gossip protocol: handshake, inbound handling, and the operations the
//! facade triggers.

use crate::driver::{now_ms, Driver, Publication};
use crate::watch::WatchFn;
use beacon_core::{
    DataItem, FetchReq, KeyAd, Merge, Message, NodeAd, NodeAddress, Payload, PROTO_VERSION,
};
use beacon_net::{Frame, SocketId};
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Largest peer sample volunteered during a handshake.
const NODES_SAMPLE: usize = 64;

fn frame(msg: &Message) -> Frame {
    Frame::new(msg.tag(), msg.encode_body())
}

impl Driver {
    pub(crate) fn init_message(&self) -> Message {
        Message::Init {
            version: PROTO_VERSION,
            id: self.my_id,
            node: self.my_node.clone(),
            ttl_ms: self.ttl_ms,
        }
    }

    pub(crate) fn send_message(&self, sock: SocketId, msg: &Message) {
        self.endpoint.send(sock, frame(msg));
    }

    /// Send to every initialized peer.
    fn broadcast(&self, msg: &Message) {
        let frame = frame(msg);
        for sock in self.conns.edges() {
            self.endpoint.send(*sock, frame.clone());
        }
    }

    pub(crate) fn on_frame(&mut self, sock: SocketId, frame: Frame) {
        let initialized = match self.conns.get(sock) {
            Some(conn) => conn.initialized(),
            // Already reaped; late frames are expected and harmless.
            None => return,
        };

        let msg = match Message::decode(frame.tag, &frame.body) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(%sock, "protocol violation: {e}");
                self.teardown(sock);
                return;
            }
        };

        // Init opens every conversation; nothing else is valid before it.
        if !initialized && !matches!(msg, Message::Init { .. }) {
            warn!(%sock, tag = frame.tag, "frame before handshake");
            self.teardown(sock);
            return;
        }

        let now = now_ms();
        match msg {
            Message::Init {
                version,
                id,
                node,
                ttl_ms,
            } => self.on_init(sock, version, id, node, ttl_ms, now),
            Message::Keys(ads) => self.on_keys(ads, now),
            Message::Query(keys) => self.on_query(sock, &keys, now),
            Message::Nodes(ads) => self.on_nodes(ads, now),
            Message::Fetch(reqs) => self.on_fetch(sock, &reqs),
            Message::Data(items) => self.on_data(items),
        }
    }

    fn on_init(
        &mut self,
        sock: SocketId,
        version: u64,
        id: Uuid,
        node: NodeAddress,
        ttl_ms: u64,
        now: u64,
    ) {
        if version == 0 {
            warn!(%sock, "zero protocol version");
            self.teardown(sock);
            return;
        }
        match self.conns.get(sock) {
            None => return,
            Some(conn) if conn.initialized() => {
                warn!(%sock, "duplicate init");
                self.teardown(sock);
                return;
            }
            Some(_) => {}
        }
        if id == self.my_id {
            // Dialed ourselves through the seed list.
            debug!(%sock, "connected to self");
            self.teardown(sock);
            return;
        }

        if let Some(existing) = self.conns.lookup_node(&id) {
            // One socket per peer: keep the older connection and route any
            // fetches the newer one was dialed for through it.
            debug!(%sock, node = %id, "duplicate connection, dropping newer");
            let pending = self
                .conns
                .get_mut(sock)
                .map(|c| std::mem::take(&mut c.pending_fetch))
                .unwrap_or_default();
            if !pending.is_empty() {
                let reqs = pending
                    .into_iter()
                    .map(|(key, key_id)| FetchReq { key, key_id })
                    .collect();
                self.send_message(existing, &Message::Fetch(reqs));
            }
            self.teardown(sock);
            return;
        }

        self.nodes.merge(id, node, ttl_ms, now);
        self.conns.initialize(sock, id, version);
        debug!(%sock, node = %id, "handshake complete");

        self.send_init_queries(sock);
        self.send_init_keys(sock, now);
        self.send_init_nodes(sock, now);

        let pending = self
            .conns
            .get_mut(sock)
            .map(|c| std::mem::take(&mut c.pending_fetch))
            .unwrap_or_default();
        if !pending.is_empty() {
            let reqs = pending
                .into_iter()
                .map(|(key, key_id)| FetchReq { key, key_id })
                .collect();
            self.send_message(sock, &Message::Fetch(reqs));
        }
    }

    /// Query the new peer for everything we are watching.
    fn send_init_queries(&self, sock: SocketId) {
        let watched: Vec<String> = self.watches.keys().cloned().collect();
        if !watched.is_empty() {
            self.send_message(sock, &Message::Query(watched));
        }
    }

    /// Volunteer every advertisement we carry, our own and learned alike;
    /// this diffusion is what lets keys cross nodes that never met their
    /// publisher.
    fn send_init_keys(&self, sock: SocketId, now: u64) {
        let mut ads = Vec::new();
        for (key, store) in &self.keys {
            for item in store.items() {
                let ttl = item.ttl(now);
                if ttl == 0 {
                    continue;
                }
                ads.push(KeyAd {
                    key: key.clone(),
                    key_id: item.id,
                    addrs: item.addrs.clone(),
                    ttl_ms: ttl,
                });
            }
        }
        if !ads.is_empty() {
            self.send_message(sock, &Message::Keys(ads));
        }
    }

    /// Introduce ourselves first, then a bounded random sample of peers.
    fn send_init_nodes(&self, sock: SocketId, now: u64) {
        let mut ads = vec![NodeAd {
            id: self.my_id,
            addrs: self.my_node.clone(),
            ttl_ms: self.ttl_ms,
        }];
        let mut rng = rand::thread_rng();
        let live: Vec<_> = self
            .nodes
            .items()
            .iter()
            .filter(|item| item.ttl(now) > 0)
            .collect();
        for item in live.choose_multiple(&mut rng, NODES_SAMPLE) {
            ads.push(NodeAd {
                id: item.id,
                addrs: item.addrs.clone(),
                ttl_ms: item.ttl(now),
            });
        }
        self.send_message(sock, &Message::Nodes(ads));
    }

    fn on_keys(&mut self, ads: Vec<KeyAd>, now: u64) {
        for ad in ads {
            let store = self.keys.entry(ad.key.clone()).or_default();
            match store.merge(ad.key_id, ad.addrs.clone(), ad.ttl_ms, now) {
                Merge::New => {
                    let owned = self
                        .data
                        .get(&ad.key)
                        .map(|p| p.id == ad.key_id)
                        .unwrap_or(false);
                    if self.watches.is_watched(&ad.key)
                        && !owned
                        && !self.fetches.contains(&ad.key, &ad.key_id)
                    {
                        self.schedule_fetch(&ad.key, ad.key_id, ad.addrs, now);
                    }
                }
                Merge::Refreshed | Merge::Unknown => {}
                Merge::Retracted => {
                    debug!(key = %ad.key, key_id = %ad.key_id, "advertisement retracted");
                    self.watches.lost(&ad.key, ad.key_id);
                    self.fetches.resolve(&ad.key, &ad.key_id);
                    if self.keys.get(&ad.key).map(|s| s.is_empty()).unwrap_or(false) {
                        self.keys.remove(&ad.key);
                    }
                }
            }
        }
    }

    fn on_query(&mut self, sock: SocketId, keys: &[String], now: u64) {
        let mut ads = Vec::new();
        for key in keys {
            if let Some(store) = self.keys.get(key) {
                for item in store.items() {
                    let ttl = item.ttl(now);
                    if ttl == 0 {
                        continue;
                    }
                    ads.push(KeyAd {
                        key: key.clone(),
                        key_id: item.id,
                        addrs: item.addrs.clone(),
                        ttl_ms: ttl,
                    });
                }
            }
        }
        if !ads.is_empty() {
            self.send_message(sock, &Message::Keys(ads));
        }
    }

    fn on_nodes(&mut self, ads: Vec<NodeAd>, now: u64) {
        for ad in ads {
            if ad.id == self.my_id {
                continue;
            }
            self.nodes.merge(ad.id, ad.addrs, ad.ttl_ms, now);
        }
    }

    fn on_fetch(&mut self, sock: SocketId, reqs: &[FetchReq]) {
        let mut items = Vec::new();
        for req in reqs {
            if let Some(publication) = self.data.get(&req.key) {
                if publication.id == req.key_id {
                    items.push(DataItem {
                        key: req.key.clone(),
                        key_id: req.key_id,
                        payload: publication.payload.clone(),
                    });
                }
            }
            // Anything else: the version is gone or was never ours; say nothing.
        }
        if !items.is_empty() {
            self.send_message(sock, &Message::Data(items));
        }
    }

    fn on_data(&mut self, items: Vec<DataItem>) {
        for item in items {
            self.fetches.resolve(&item.key, &item.key_id);
            let delivered = self.watches.arrived(&item.key, item.key_id, &item.payload);
            debug!(key = %item.key, key_id = %item.key_id, delivered, "payload arrived");
        }
    }

    pub(crate) fn publish(&mut self, key: &str, payload: Payload, now: u64) {
        let key_id = Uuid::new_v4();
        info!(%key, %key_id, "publishing");
        self.data
            .insert(key.to_string(), Publication { id: key_id, payload });
        self.keys.entry(key.to_string()).or_default().merge(
            key_id,
            self.my_node.clone(),
            self.ttl_ms,
            now,
        );
        self.broadcast(&Message::Keys(vec![KeyAd {
            key: key.to_string(),
            key_id,
            addrs: self.my_node.clone(),
            ttl_ms: self.ttl_ms,
        }]));
    }

    pub(crate) fn retract(&mut self, key: &str) {
        let Some(publication) = self.data.remove(key) else {
            debug!(%key, "retract of unpublished key");
            return;
        };
        info!(%key, key_id = %publication.id, "retracting");
        if let Some(store) = self.keys.get_mut(key) {
            store.remove(&publication.id);
            if store.is_empty() {
                self.keys.remove(key);
            }
        }
        // A zero TTL tells peers to drop the entry on their next sweep.
        self.broadcast(&Message::Keys(vec![KeyAd {
            key: key.to_string(),
            key_id: publication.id,
            addrs: self.my_node.clone(),
            ttl_ms: 0,
        }]));
    }

    pub(crate) fn discover(&mut self, key: &str, handle: u64, watch: WatchFn, now: u64) {
        if !self.watches.add(key, handle, watch) {
            warn!(%key, handle, "duplicate watch handle");
            return;
        }
        debug!(%key, handle, "watching");

        // Resolve everything already known about the key.
        let known: Vec<(Uuid, NodeAddress)> = self
            .keys
            .get(key)
            .map(|store| {
                store
                    .items()
                    .iter()
                    .filter(|item| item.ttl(now) > 0)
                    .map(|item| (item.id, item.addrs.clone()))
                    .collect()
            })
            .unwrap_or_default();
        for (key_id, addrs) in known {
            let owned = self.data.get(key).map(|p| p.id == key_id).unwrap_or(false);
            if !owned && !self.fetches.contains(key, &key_id) {
                self.schedule_fetch(key, key_id, addrs, now);
            }
        }

        self.broadcast(&Message::Query(vec![key.to_string()]));
    }

    pub(crate) fn forget(&mut self, key: &str, handle: u64) {
        debug!(%key, handle, "forgetting");
        if self.watches.remove(key, handle) {
            // Last watch gone: outstanding fetches have no consumer, and the
            // advertisement table only matters if we publish the key ourselves.
            self.fetches.cancel_key(key);
            if !self.data.contains_key(key) {
                self.keys.remove(key);
            }
        }
    }

    fn schedule_fetch(&mut self, key: &str, key_id: Uuid, addrs: NodeAddress, now: u64) {
        self.fetches
            .schedule(key, key_id, addrs, now, self.period_ms);
        self.send_fetch(key, key_id, now);
    }

    /// Issue one `Fetch`, over an existing edge when the advertiser is a
    /// recognisable node, otherwise by dialing the advertised address and
    /// letting the handshake flush the request.
    pub(crate) fn send_fetch(&mut self, key: &str, key_id: Uuid, now: u64) {
        let Some(addrs) = self
            .keys
            .get(key)
            .and_then(|s| s.get(&key_id))
            .map(|item| item.addrs.clone())
        else {
            // The advertisement raced away; the timeout path abandons the fetch.
            return;
        };

        let req = Message::Fetch(vec![FetchReq {
            key: key.to_string(),
            key_id,
        }]);

        if let Some(sock) = self
            .node_for_addrs(&addrs)
            .and_then(|id| self.conns.lookup_node(&id))
        {
            self.send_message(sock, &req);
            return;
        }

        debug!(%key, key_id = %key_id, %addrs, "dialing advertiser for fetch");
        let sock = self.dial(&addrs, now);
        if let Some(conn) = self.conns.get_mut(sock) {
            conn.pending_fetch.push((key.to_string(), key_id));
        }
    }

    fn node_for_addrs(&self, addrs: &NodeAddress) -> Option<Uuid> {
        self.nodes
            .items()
            .iter()
            .find(|item| item.addrs == *addrs)
            .map(|item| item.id)
    }
}
