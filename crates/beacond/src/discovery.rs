//! The public discovery facade.
//!
//! [`Discovery`] is a cheap handle to a running node. Operations are posted
//! to the driver task as messages, so they are safe to call from any thread
//! and never touch discovery state directly.

use crate::config::Config;
use crate::driver::Driver;
use crate::watch::{WatchEvent, WatchFn};
use beacon_core::NodeAddress;
use beacon_net::Endpoint;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Facade errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("bind failed: {0}")]
    Bind(#[from] std::io::Error),
    #[error("discovery driver stopped")]
    Stopped,
}

/// Counters describing a node's current state.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiscoveryStats {
    /// Known peers.
    pub nodes: usize,
    /// Live sockets, handshaken or not.
    pub connections: usize,
    /// Initialized connections.
    pub edges: usize,
    /// Keys with at least one advertisement.
    pub keys: usize,
    /// Advertised key versions across all keys.
    pub key_entries: usize,
    /// Outstanding payload fetches.
    pub fetches: usize,
    /// Registered watches.
    pub watches: usize,
    /// Locally published keys.
    pub publications: usize,
}

pub(crate) enum Command {
    Publish {
        key: String,
        payload: Vec<u8>,
    },
    Retract {
        key: String,
    },
    Discover {
        key: String,
        handle: u64,
        watch: WatchFn,
    },
    Forget {
        key: String,
        handle: u64,
    },
    Stats(oneshot::Sender<DiscoveryStats>),
    Shutdown,
}

/// Handle to a running discovery node. Clones share the node.
#[derive(Clone)]
pub struct Discovery {
    id: Uuid,
    node: NodeAddress,
    cmd: mpsc::UnboundedSender<Command>,
}

impl Discovery {
    /// Bind the listen socket and start the driver. Bind failures surface
    /// here; everything after construction recovers on its own.
    pub async fn start(config: Config) -> Result<Discovery, DiscoveryError> {
        let (endpoint, net_rx, local) = Endpoint::bind(config.listen_addr()).await?;

        let id = Uuid::new_v4();
        let node = NodeAddress::single(config.advertise.clone(), local.port());
        let (cmd, cmd_rx) = mpsc::unbounded_channel();

        let driver = Driver::new(&config, id, node.clone(), endpoint);
        tokio::spawn(driver.run(net_rx, cmd_rx));

        Ok(Discovery { id, node, cmd })
    }

    /// This node's id, fixed at startup.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// This node's advertised address.
    pub fn node(&self) -> &NodeAddress {
        &self.node
    }

    /// Advertise `key` under a fresh key id. Republishing the same key
    /// assigns a new id; the old one fades out with its TTL on peers.
    pub fn publish(&self, key: impl Into<String>, payload: Vec<u8>) {
        let _ = self.cmd.send(Command::Publish {
            key: key.into(),
            payload,
        });
    }

    /// Withdraw a local publication.
    pub fn retract(&self, key: impl Into<String>) {
        let _ = self.cmd.send(Command::Retract { key: key.into() });
    }

    /// Watch a key. The callback runs on the driver task and must not
    /// block; it sees each discovered publication exactly once, plus a loss
    /// notification when a delivered publication goes away.
    pub fn discover(
        &self,
        key: impl Into<String>,
        handle: u64,
        watch: impl Fn(WatchEvent) + Send + 'static,
    ) {
        let _ = self.cmd.send(Command::Discover {
            key: key.into(),
            handle,
            watch: Box::new(watch),
        });
    }

    /// Drop the watch registered under `handle`.
    pub fn forget(&self, key: impl Into<String>, handle: u64) {
        let _ = self.cmd.send(Command::Forget {
            key: key.into(),
            handle,
        });
    }

    /// Snapshot of the node's counters.
    pub async fn stats(&self) -> Result<DiscoveryStats, DiscoveryError> {
        let (tx, rx) = oneshot::channel();
        self.cmd
            .send(Command::Stats(tx))
            .map_err(|_| DiscoveryError::Stopped)?;
        rx.await.map_err(|_| DiscoveryError::Stopped)
    }

    /// Stop the driver and close every connection.
    pub fn shutdown(&self) {
        let _ = self.cmd.send(Command::Shutdown);
    }
}
