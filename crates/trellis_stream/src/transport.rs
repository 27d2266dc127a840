//! Transports.
//!
//! A stream is a [`Channel`]: an outbound sender and an inbound receiver of
//! [`StreamMessage`]s. Border outlets send from worker threads without
//! awaiting, so both directions are unbounded. The in-process transport
//! hands one end of a channel pair straight to a [`StreamServer`]; the TCP
//! transport pumps a channel through a length-delimited postcard framing.

use crate::error::TransportError;
use crate::message::StreamMessage;
use crate::server::StreamServer;
use futures::{SinkExt, StreamExt};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use trellis_core::{BorderFrame, SessionId};
use trellis_runtime::BorderOutlet;

/// One end of a stream
#[derive(Debug)]
pub struct Channel {
    /// Messages to the other end
    pub sender: mpsc::UnboundedSender<StreamMessage>,
    /// Messages from the other end
    pub receiver: mpsc::UnboundedReceiver<StreamMessage>,
}

impl Channel {
    /// Two connected ends
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                sender: a_tx,
                receiver: b_rx,
            },
            Self {
                sender: b_tx,
                receiver: a_rx,
            },
        )
    }
}

/// Border outlet writing frames onto a stream
#[derive(Debug, Clone)]
pub struct ChannelOutlet {
    session: SessionId,
    sender: mpsc::UnboundedSender<StreamMessage>,
}

impl ChannelOutlet {
    /// Create an outlet for `session`
    #[must_use]
    pub fn new(session: SessionId, sender: mpsc::UnboundedSender<StreamMessage>) -> Self {
        Self { session, sender }
    }
}

impl BorderOutlet for ChannelOutlet {
    fn send(&self, frame: BorderFrame) -> Result<(), String> {
        self.sender
            .send(StreamMessage::frames(self.session, vec![frame]))
            .map_err(|_| TransportError::Closed.to_string())
    }
}

/// Opens streams to named peers
pub trait Connector: Send + Sync {
    /// Open a stream to `peer`. Connecting may finish in the background; a
    /// failure then shows up as the channel closing.
    ///
    /// # Errors
    ///
    /// Returns error if the peer is unknown or refuses at once
    fn connect(&self, peer: &str) -> Result<Channel, TransportError>;
}

/// In-process transport to servers registered by name
#[derive(Default)]
pub struct LocalConnector {
    servers: RwLock<IndexMap<String, Arc<StreamServer>>>,
}

impl LocalConnector {
    /// Create an empty connector
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `peer` to `server`
    pub fn add_peer(&self, peer: impl Into<String>, server: Arc<StreamServer>) {
        self.servers.write().insert(peer.into(), server);
    }

    /// Forget `peer`
    pub fn remove_peer(&self, peer: &str) -> bool {
        self.servers.write().shift_remove(peer).is_some()
    }
}

impl Connector for LocalConnector {
    fn connect(&self, peer: &str) -> Result<Channel, TransportError> {
        let server = self
            .servers
            .read()
            .get(peer)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeer(peer.to_string()))?;
        let (ours, theirs) = Channel::pair();
        server
            .accept(theirs)
            .map_err(|e| TransportError::Refused(e.to_string()))?;
        Ok(ours)
    }
}

impl std::fmt::Debug for LocalConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConnector")
            .field("peers", &self.servers.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// TCP transport to peers listed by address
#[derive(Debug, Clone)]
pub struct TcpConnector {
    peers: IndexMap<String, SocketAddr>,
    runtime: Handle,
    connect_timeout_ms: u64,
}

impl TcpConnector {
    /// Create a connector spawning its pumps on `runtime`
    #[must_use]
    pub fn new(runtime: Handle) -> Self {
        Self {
            peers: IndexMap::new(),
            runtime,
            connect_timeout_ms: 5000,
        }
    }

    /// Add a peer
    #[must_use]
    pub fn with_peer(mut self, peer: impl Into<String>, addr: SocketAddr) -> Self {
        self.peers.insert(peer.into(), addr);
        self
    }

    /// Set the connect timeout
    #[must_use]
    pub fn with_connect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }
}

impl Connector for TcpConnector {
    fn connect(&self, peer: &str) -> Result<Channel, TransportError> {
        let addr = *self
            .peers
            .get(peer)
            .ok_or_else(|| TransportError::UnknownPeer(peer.to_string()))?;
        let (ours, theirs) = Channel::pair();
        let timeout_ms = self.connect_timeout_ms;
        let peer = peer.to_string();
        self.runtime.spawn(async move {
            let connect = TcpStream::connect(addr);
            match tokio::time::timeout(Duration::from_millis(timeout_ms), connect).await {
                Ok(Ok(stream)) => pump(stream, theirs).await,
                Ok(Err(e)) => {
                    let err = TransportError::ConnectionFailed(e.to_string());
                    tracing::warn!(peer = %peer, addr = %addr, error = %err, "Connect failed");
                }
                Err(_) => {
                    let err = TransportError::Timeout(timeout_ms);
                    tracing::warn!(peer = %peer, addr = %addr, error = %err, "Connect failed");
                }
            }
        });
        Ok(ours)
    }
}

/// Move messages between `channel` and a framed socket until both
/// directions end
pub async fn pump(stream: TcpStream, channel: Channel) {
    let Channel {
        sender,
        mut receiver,
    } = channel;
    let (mut sink, mut source) = Framed::new(stream, LengthDelimitedCodec::new()).split();

    let writer = async move {
        while let Some(message) = receiver.recv().await {
            let bytes = match message.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(session = %message.session, error = %e, "Dropping unencodable message");
                    continue;
                }
            };
            if let Err(e) = sink.send(bytes).await {
                tracing::debug!(error = %e, "Socket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    };

    let reader = async move {
        while let Some(frame) = source.next().await {
            let message = match frame {
                Ok(buf) => StreamMessage::decode(&buf),
                Err(e) => Err(TransportError::ConnectionFailed(e.to_string())),
            };
            match message {
                Ok(message) => {
                    if sender.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Closing stream on bad frame");
                    break;
                }
            }
        }
    };

    tokio::join!(writer, reader);
}

/// Accept TCP streams for `server` until `shutdown` completes
///
/// # Errors
///
/// Returns error if accepting fails
pub async fn serve_tcp(
    listener: TcpListener,
    server: Arc<StreamServer>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), TransportError> {
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            accepted = listener.accept() => {
                let (stream, addr) = accepted.map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
                let (ours, theirs) = Channel::pair();
                if let Err(e) = server.accept(theirs) {
                    tracing::warn!(addr = %addr, error = %e, "Refusing stream");
                    continue;
                }
                tracing::debug!(addr = %addr, "Stream accepted");
                tokio::spawn(pump(stream, ours));
            }
        }
    }
    Ok(())
}
