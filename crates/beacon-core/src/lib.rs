//! beacon-core - protocol types for the beacon discovery mesh
//!
//! This crate holds everything two nodes must agree on to gossip:
//! - [`types`] - message and address types
//! - [`wire`] - the tagged wire encoding of the six gossip messages
//! - [`store`] - the TTL'd item store shared by the node and key tables
//!
//! No I/O lives here; transport and framing are in `beacon-net`.

pub mod store;
pub mod types;
pub mod wire;

pub use store::{Item, ItemStore, Merge};
pub use types::{
    Address, DataItem, FetchReq, KeyAd, Message, NodeAd, NodeAddress, Payload, PROTO_VERSION,
};
pub use wire::WireError;
