//! Per-socket link tasks.
//!
//! Each TCP connection gets one task owning the socket and its framed
//! codec. The task forwards decoded packets to the node loop and drains
//! an outbound queue in the other direction. All protocol state lives in
//! the node loop; a link task only moves frames.

use std::net::SocketAddr;

use canopy_protocol::{Packet, PacketCodec};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

pub type LinkId = u64;

/// Node-loop record for one live connection.
///
/// A link is `available` once connected and until either end announces a
/// departure over it. Potentials default to 1: a peer is worth at least
/// itself until it advertises something better.
#[derive(Debug)]
pub struct Link {
    pub id: LinkId,
    pub peer_addr: SocketAddr,
    pub local_addr: Option<SocketAddr>,
    /// Last potential the remote advertised over this link.
    pub potential: i32,
    pub remote_app_id: Option<i32>,
    pub is_parent: bool,
    pub connected: bool,
    pub leaving: bool,
    /// Departure packet held until the peer actually closes the socket.
    pub pending_leave: Option<Packet>,
    outbound: Outbound,
}

impl Link {
    pub fn new(id: LinkId, peer_addr: SocketAddr, outbound: Outbound, is_parent: bool, connected: bool) -> Self {
        Self {
            id,
            peer_addr,
            local_addr: None,
            potential: 1,
            remote_app_id: None,
            is_parent,
            connected,
            leaving: false,
            pending_leave: None,
            outbound,
        }
    }

    pub fn available(&self) -> bool {
        self.connected && !self.leaving
    }

    /// Queue a packet for the wire. A dead link task drops it silently;
    /// the matching `Closed` event is already on its way.
    pub fn send(&self, packet: Packet) {
        let _ = self.outbound.send(packet);
    }
}

/// What a link task reports back to the node loop.
#[derive(Debug)]
pub enum LinkEvent {
    /// An outbound dial finished successfully.
    Connected {
        link: LinkId,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    },
    /// A full packet was decoded off the wire.
    Packet { link: LinkId, packet: Packet },
    /// The socket is gone. `error` is `None` on a clean remote close.
    Closed { link: LinkId, error: Option<String> },
}

/// Handle to a spawned link task: the queue of packets to write out.
/// Dropping the sender flushes pending frames and closes the socket.
pub type Outbound = mpsc::UnboundedSender<Packet>;

/// Spawn a task for an already-accepted socket.
pub fn spawn_accepted(
    link: LinkId,
    stream: TcpStream,
    peer_addr: SocketAddr,
    events: mpsc::Sender<LinkEvent>,
) -> Outbound {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        debug!(link, peer = %peer_addr, "net: link task up (accepted)");
        run_link(link, stream, out_rx, events).await;
    });
    out_tx
}

/// Spawn a task that dials `peer_addr` and then runs the link.
///
/// `bind_local` pins the local endpoint of the new socket; a node
/// re-attaching after its parent left reuses its previous local address
/// so the new parent can match the connection to the old child.
pub fn spawn_outbound(
    link: LinkId,
    peer_addr: SocketAddr,
    bind_local: Option<SocketAddr>,
    events: mpsc::Sender<LinkEvent>,
) -> Outbound {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = match dial(peer_addr, bind_local).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(link, peer = %peer_addr, %err, "net: dial failed");
                let _ = events
                    .send(LinkEvent::Closed { link, error: Some(err.to_string()) })
                    .await;
                return;
            }
        };
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                let _ = events
                    .send(LinkEvent::Closed { link, error: Some(err.to_string()) })
                    .await;
                return;
            }
        };
        debug!(link, peer = %peer_addr, local = %local_addr, "net: link task up (dialed)");
        if events
            .send(LinkEvent::Connected { link, local_addr, peer_addr })
            .await
            .is_err()
        {
            return;
        }
        run_link(link, stream, out_rx, events).await;
    });
    out_tx
}

async fn dial(peer_addr: SocketAddr, bind_local: Option<SocketAddr>) -> std::io::Result<TcpStream> {
    let socket = match peer_addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if let Some(local) = bind_local {
        socket.set_reuseaddr(true)?;
        if let Err(err) = socket.bind(local) {
            warn!(%local, %err, "net: could not pin local address, dialing unbound");
        }
    }
    socket.connect(peer_addr).await
}

async fn run_link(
    link: LinkId,
    stream: TcpStream,
    mut out_rx: mpsc::UnboundedReceiver<Packet>,
    events: mpsc::Sender<LinkEvent>,
) {
    let mut framed = Framed::new(stream, PacketCodec::new());
    loop {
        tokio::select! {
            queued = out_rx.recv() => match queued {
                Some(packet) => {
                    trace!(link, kind = packet.kind(), "net: send");
                    if let Err(err) = framed.send(packet).await {
                        let _ = events
                            .send(LinkEvent::Closed { link, error: Some(err.to_string()) })
                            .await;
                        return;
                    }
                }
                // Node loop dropped the handle: flush and close.
                None => {
                    let _ = framed.flush().await;
                    return;
                }
            },
            decoded = framed.next() => match decoded {
                Some(Ok(packet)) => {
                    trace!(link, kind = packet.kind(), "net: recv");
                    if events.send(LinkEvent::Packet { link, packet }).await.is_err() {
                        return;
                    }
                }
                Some(Err(err)) => {
                    let _ = events
                        .send(LinkEvent::Closed { link, error: Some(err.to_string()) })
                        .await;
                    return;
                }
                None => {
                    let _ = events.send(LinkEvent::Closed { link, error: None }).await;
                    return;
                }
            },
        }
    }
}
