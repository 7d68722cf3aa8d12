//! Core protocol types for the beacon discovery mesh.
//!
//! These are plain data; the wire encoding lives in [`crate::wire`].

use std::fmt;
use uuid::Uuid;

/// Protocol version advertised in `Init`. Nonzero by construction: a peer's
/// recorded version doubles as its handshake-completed flag.
pub const PROTO_VERSION: u64 = 1;

/// Opaque published value.
pub type Payload = Vec<u8>;

/// One `(host, port)` interface on which a node can be reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Ordered list of interfaces advertised for one node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeAddress(pub Vec<Address>);

impl NodeAddress {
    /// A single-interface address.
    pub fn single(host: impl Into<String>, port: u16) -> Self {
        Self(vec![Address::new(host, port)])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Address> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, addr) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{addr}")?;
        }
        Ok(())
    }
}

/// One key advertisement: a specific publication (`key_id`) of `key`,
/// fetchable at `addrs`, valid for `ttl_ms` from receipt. A TTL of zero
/// retracts the advertisement.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyAd {
    pub key: String,
    pub key_id: Uuid,
    pub addrs: NodeAddress,
    pub ttl_ms: u64,
}

/// One node advertisement.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeAd {
    pub id: Uuid,
    pub addrs: NodeAddress,
    pub ttl_ms: u64,
}

/// A request for the payload behind one advertised key version.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchReq {
    pub key: String,
    pub key_id: Uuid,
}

/// A delivered payload.
#[derive(Clone, Debug, PartialEq)]
pub struct DataItem {
    pub key: String,
    pub key_id: Uuid,
    pub payload: Payload,
}

/// The six gossip messages. Tag values are fixed by the wire protocol and
/// follow declaration order.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Handshake, sent first on every connection in both directions.
    Init {
        version: u64,
        id: Uuid,
        node: NodeAddress,
        ttl_ms: u64,
    },
    /// Advertises known key bindings.
    Keys(Vec<KeyAd>),
    /// Requests all known bindings for the listed keys.
    Query(Vec<String>),
    /// Advertises known peers.
    Nodes(Vec<NodeAd>),
    /// Requests payloads for specific advertised key versions.
    Fetch(Vec<FetchReq>),
    /// Delivers requested payloads.
    Data(Vec<DataItem>),
}

impl Message {
    pub const TAG_INIT: u8 = 1;
    pub const TAG_KEYS: u8 = 2;
    pub const TAG_QUERY: u8 = 3;
    pub const TAG_NODES: u8 = 4;
    pub const TAG_FETCH: u8 = 5;
    pub const TAG_DATA: u8 = 6;

    pub fn tag(&self) -> u8 {
        match self {
            Message::Init { .. } => Self::TAG_INIT,
            Message::Keys(_) => Self::TAG_KEYS,
            Message::Query(_) => Self::TAG_QUERY,
            Message::Nodes(_) => Self::TAG_NODES,
            Message::Fetch(_) => Self::TAG_FETCH,
            Message::Data(_) => Self::TAG_DATA,
        }
    }
}
