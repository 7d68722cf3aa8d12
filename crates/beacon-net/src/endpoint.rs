//! TCP endpoint for the discovery mesh.
//!
//! One task owns each connection and pumps frames in both directions; every
//! connection event lands on a single channel so the consumer sees a
//! serialized stream, with per-socket ordering matching arrival order on the
//! wire. Socket ids are fd-like reusable slots plus a generation counter.

use crate::framing::{Frame, FrameCodec};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// Per-address budget for an outbound dial attempt.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the event channel; connection tasks block when the consumer
/// lags, which is the backpressure we want.
const EVENT_BUFFER: usize = 1024;

/// Socket identifier: a reusable slot index plus a generation counter.
///
/// Slots behave like file descriptors (the lowest free slot is reused
/// first); the generation keeps events from an old occupant apart from the
/// slot's next user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId {
    slot: u32,
    gen: u32,
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.slot, self.gen)
    }
}

/// Connection events, serialized onto one channel.
#[derive(Debug)]
pub enum NetEvent {
    /// An inbound connection was accepted. Outbound connections do not
    /// produce this event; [`Endpoint::connect`] hands their id back
    /// synchronously.
    Accepted { sock: SocketId, peer: SocketAddr },
    /// The connection is gone: peer close, I/O error, failed dial or local
    /// disconnect. Emitted exactly once per socket, always after any of its
    /// frames and before its slot can be reused.
    Closed { sock: SocketId },
    /// One inbound frame.
    Frame { sock: SocketId, frame: Frame },
}

enum Slot {
    Vacant,
    /// Connection task still winding down after a local disconnect.
    Draining,
    Open(mpsc::UnboundedSender<Frame>),
}

struct Table {
    slots: Vec<(u32, Slot)>,
    free: BinaryHeap<Reverse<u32>>,
}

impl Table {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: BinaryHeap::new(),
        }
    }

    fn alloc(&mut self, tx: mpsc::UnboundedSender<Frame>) -> SocketId {
        let slot = match self.free.pop() {
            Some(Reverse(slot)) => slot,
            None => {
                self.slots.push((0, Slot::Vacant));
                (self.slots.len() - 1) as u32
            }
        };
        let entry = &mut self.slots[slot as usize];
        entry.0 = entry.0.wrapping_add(1);
        entry.1 = Slot::Open(tx);
        SocketId { slot, gen: entry.0 }
    }

    fn entry(&mut self, sock: SocketId) -> Option<&mut Slot> {
        match self.slots.get_mut(sock.slot as usize) {
            Some((gen, slot)) if *gen == sock.gen => Some(slot),
            _ => None,
        }
    }

    fn sender(&mut self, sock: SocketId) -> Option<mpsc::UnboundedSender<Frame>> {
        match self.entry(sock) {
            Some(Slot::Open(tx)) => Some(tx.clone()),
            _ => None,
        }
    }

    /// Drop the writer so the connection task winds down; the slot stays
    /// reserved until the task releases it.
    fn detach(&mut self, sock: SocketId) {
        if let Some(slot) = self.entry(sock) {
            if matches!(slot, Slot::Open(_)) {
                *slot = Slot::Draining;
            }
        }
    }

    fn release(&mut self, sock: SocketId) {
        if let Some(slot) = self.entry(sock) {
            if !matches!(slot, Slot::Vacant) {
                *slot = Slot::Vacant;
                self.free.push(Reverse(sock.slot));
            }
        }
    }
}

struct Shared {
    table: Mutex<Table>,
    events: mpsc::Sender<NetEvent>,
}

/// Framed TCP endpoint. Cheap to clone through its inner `Arc`.
pub struct Endpoint {
    shared: Arc<Shared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: SocketAddr,
}

impl Endpoint {
    /// Bind the listen socket and start accepting. Binding failure is a
    /// construction error and surfaces to the caller.
    pub async fn bind(
        addr: SocketAddr,
    ) -> io::Result<(Endpoint, mpsc::Receiver<NetEvent>, SocketAddr)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let (events, rx) = mpsc::channel(EVENT_BUFFER);
        let shared = Arc::new(Shared {
            table: Mutex::new(Table::new()),
            events,
        });

        let accept_shared = shared.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => accept_conn(&accept_shared, stream, peer).await,
                    Err(e) => {
                        warn!("accept error: {e}");
                    }
                }
            }
        });

        let endpoint = Endpoint {
            shared,
            accept_task: Mutex::new(Some(accept_task)),
            local_addr,
        };
        Ok((endpoint, rx, local_addr))
    }

    /// The actually-bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start an outbound connection and return its socket id immediately,
    /// the way a non-blocking connect returns an fd. Frames sent before the
    /// dial completes are queued; if every target fails, the socket reports
    /// `Closed` like any other dead connection.
    pub fn connect(&self, targets: Vec<(String, u16)>) -> SocketId {
        let (tx, rx) = mpsc::unbounded_channel();
        let sock = self.shared.table.lock().alloc(tx);

        let shared = self.shared.clone();
        tokio::spawn(async move {
            match dial(&targets).await {
                Some(stream) => run_conn(shared, sock, stream, rx).await,
                None => {
                    debug!(%sock, "dial failed");
                    let _ = shared.events.send(NetEvent::Closed { sock }).await;
                    shared.table.lock().release(sock);
                }
            }
        });
        sock
    }

    /// Queue a frame for a socket. Sending to a dead socket is a no-op.
    pub fn send(&self, sock: SocketId, frame: Frame) {
        if let Some(tx) = self.shared.table.lock().sender(sock) {
            let _ = tx.send(frame);
        }
    }

    /// Close a socket. Queued outbound frames are flushed first; `Closed`
    /// is still reported for it.
    pub fn disconnect(&self, sock: SocketId) {
        self.shared.table.lock().detach(sock);
    }

    /// Stop accepting and close every connection.
    pub fn close(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        let mut table = self.shared.table.lock();
        for (_, slot) in table.slots.iter_mut() {
            if matches!(slot, Slot::Open(_)) {
                *slot = Slot::Draining;
            }
        }
    }
}

fn configure(stream: &TcpStream) {
    // Gossip frames are small; never wait on Nagle.
    let _ = stream.set_nodelay(true);
}

async fn accept_conn(shared: &Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    configure(&stream);
    let (tx, rx) = mpsc::unbounded_channel();
    let sock = shared.table.lock().alloc(tx);

    if shared
        .events
        .send(NetEvent::Accepted { sock, peer })
        .await
        .is_err()
    {
        shared.table.lock().release(sock);
        return;
    }

    let shared = shared.clone();
    tokio::spawn(run_conn(shared, sock, stream, rx));
}

async fn dial(targets: &[(String, u16)]) -> Option<TcpStream> {
    for (host, port) in targets {
        let attempt = tokio::time::timeout(DIAL_TIMEOUT, async {
            let addrs = lookup_host((host.as_str(), *port)).await.ok()?;
            for addr in addrs {
                if let Ok(stream) = TcpStream::connect(addr).await {
                    return Some(stream);
                }
            }
            None
        })
        .await;

        match attempt {
            Ok(Some(stream)) => {
                configure(&stream);
                return Some(stream);
            }
            _ => continue,
        }
    }
    None
}

async fn run_conn(
    shared: Arc<Shared>,
    sock: SocketId,
    stream: TcpStream,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) {
    let mut framed = Framed::new(stream, FrameCodec);

    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(frame) => {
                    if let Err(e) = framed.send(frame).await {
                        debug!(%sock, "write error: {e}");
                        break;
                    }
                }
                // Writer detached: local disconnect, queued frames drained.
                None => break,
            },
            inbound = framed.next() => match inbound {
                Some(Ok(frame)) => {
                    if shared.events.send(NetEvent::Frame { sock, frame }).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!(%sock, "read error: {e}");
                    break;
                }
                None => break,
            },
        }
    }

    // Closed goes out before the slot is freed so a reused slot can never
    // appear in the event stream ahead of its predecessor's close.
    let _ = shared.events.send(NetEvent::Closed { sock }).await;
    shared.table.lock().release(sock);
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair() -> (
        Endpoint,
        mpsc::Receiver<NetEvent>,
        Endpoint,
        mpsc::Receiver<NetEvent>,
        SocketId,
    ) {
        let (server, server_rx, addr) = Endpoint::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let (client, client_rx, _) = Endpoint::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let sock = client.connect(vec![(addr.ip().to_string(), addr.port())]);
        (server, server_rx, client, client_rx, sock)
    }

    #[tokio::test]
    async fn test_basics() {
        let (server, mut server_rx, client, mut client_rx, client_sock) = pair().await;

        let accepted = match server_rx.recv().await.unwrap() {
            NetEvent::Accepted { sock, .. } => sock,
            other => panic!("unexpected event: {other:?}"),
        };

        client.send(client_sock, Frame::new(1, vec![42]));
        match server_rx.recv().await.unwrap() {
            NetEvent::Frame { sock, frame } => {
                assert_eq!(sock, accepted);
                assert_eq!(frame, Frame::new(1, vec![42]));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        server.send(accepted, Frame::new(2, vec![7, 7]));
        match client_rx.recv().await.unwrap() {
            NetEvent::Frame { sock, frame } => {
                assert_eq!(sock, client_sock);
                assert_eq!(frame.tag, 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        server.close();
        client.close();
    }

    #[tokio::test]
    async fn test_disconnect_reports_closed_on_both_sides() {
        let (server, mut server_rx, client, mut client_rx, client_sock) = pair().await;

        let accepted = match server_rx.recv().await.unwrap() {
            NetEvent::Accepted { sock, .. } => sock,
            other => panic!("unexpected event: {other:?}"),
        };

        client.disconnect(client_sock);

        match client_rx.recv().await.unwrap() {
            NetEvent::Closed { sock } => assert_eq!(sock, client_sock),
            other => panic!("unexpected event: {other:?}"),
        }
        match server_rx.recv().await.unwrap() {
            NetEvent::Closed { sock } => assert_eq!(sock, accepted),
            other => panic!("unexpected event: {other:?}"),
        }

        server.close();
        client.close();
    }

    #[tokio::test]
    async fn test_slot_reuse_bumps_generation() {
        let (server, mut server_rx, client, mut client_rx, first) = pair().await;

        match server_rx.recv().await.unwrap() {
            NetEvent::Accepted { .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }

        client.disconnect(first);
        match client_rx.recv().await.unwrap() {
            NetEvent::Closed { sock } => assert_eq!(sock, first),
            other => panic!("unexpected event: {other:?}"),
        }

        let addr = server.local_addr();
        let second = client.connect(vec![(addr.ip().to_string(), addr.port())]);
        assert_ne!(first, second);

        server.close();
        client.close();
    }

    #[tokio::test]
    async fn test_failed_dial_reports_closed() {
        let (client, mut client_rx, _) = Endpoint::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        // Nothing listens on port 1.
        let sock = client.connect(vec![("127.0.0.1".to_string(), 1)]);
        match client_rx.recv().await.unwrap() {
            NetEvent::Closed { sock: closed } => assert_eq!(closed, sock),
            other => panic!("unexpected event: {other:?}"),
        }

        client.close();
    }
}
