//! Socket sessions
//!
//! A session owns one OS socket (client) or one bound/listening socket plus its
//! accepted peers (server). Sessions are established off the frame path, handed
//! back to the dispatcher as a [`SessionEvent`], and only start their I/O loop
//! once registered. Loops never touch the registry: when they end on their own
//! they report an ERR to the controller and post a close event.

mod tcp_client;
mod tcp_server;
mod udp_client;
mod udp_server;
mod writer;

pub use tcp_client::TcpClientSession;
pub use tcp_server::TcpServerSession;
pub use udp_client::UdpClientSession;
pub use udp_server::{UdpBindProfile, UdpServerSession};

use crate::outbound::Outbound;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wsrelay_protocol::{ConnectionToken, ConnectSpec, Endpoint, Host, Protocol, SocketData, Token};

/// Session errors; the `Display` text is what the controller sees in ERR
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Socket connect error: {0}")]
    Connect(io::Error),

    #[error("Socket bind error: {0}")]
    Bind(io::Error),

    #[error("Socket send error: {0}")]
    Send(io::Error),

    #[error("Socket send queue full")]
    Backlog,

    #[error("Socket recv error: {0}")]
    Recv(io::Error),

    #[error("Socket accept error: {0}")]
    Accept(io::Error),

    #[error("Connection closed by peer")]
    Eof,

    #[error("Cannot resolve {0}")]
    Resolve(String),

    #[error("Unknown connection token {0}")]
    UnknownConnection(ConnectionToken),

    #[error("Connection {0} closed: {1}")]
    ConnectionClosed(ConnectionToken, Box<SessionError>),

    #[error("Unsupported UDP bind profile {0}")]
    UnsupportedProfile(u8),

    #[error("not implemented")]
    NotImplemented,

    #[error("Addressed data is not supported on a TCP client session")]
    NotAddressable,

    #[error("Session stopped")]
    Stopped,
}

impl SessionError {
    /// Whether a client session that returned this error is gone
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Send(_) | Self::Backlog | Self::Stopped)
    }
}

/// Messages from session tasks back to the dispatcher
#[derive(Debug)]
pub enum SessionEvent {
    /// Outbound connect finished (or failed)
    ClientReady {
        token: Token,
        id: u64,
        result: Result<ClientSession, SessionError>,
    },
    /// Bind finished (or failed)
    ServerReady {
        token: Token,
        id: u64,
        result: Result<ServerSession, SessionError>,
    },
    /// A client session's loop ended on its own
    ClientClosed { token: Token, id: u64 },
    /// A server session's loop ended on its own
    ServerClosed { token: Token, id: u64 },
}

/// Everything a session task needs to talk back
#[derive(Clone)]
pub struct SessionContext {
    pub token: Token,
    pub id: u64,
    pub outbound: Outbound,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub cancel: CancellationToken,
    pub recv_buffer_size: usize,
    /// Capacity of each per-socket write queue
    pub write_queue: usize,
    pub resolve_timeout: Duration,
    /// Set once the session has reported its own end
    pub closed: Arc<AtomicBool>,
}

impl SessionContext {
    /// Report a self-inflicted end: ERR to the controller, close event to the dispatcher
    pub(crate) async fn report_closed(&self, reason: &SessionError, server: bool) {
        if self.cancel.is_cancelled() || self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.outbound.err(self.token, reason.to_string()).await;
        let event = if server {
            SessionEvent::ServerClosed {
                token: self.token,
                id: self.id,
            }
        } else {
            SessionEvent::ClientClosed {
                token: self.token,
                id: self.id,
            }
        };
        let _ = self.events.send(event);
    }
}

/// Resolve an endpoint to one socket address (first result wins)
pub(crate) async fn resolve(endpoint: &Endpoint, timeout: Duration) -> Result<SocketAddr, SessionError> {
    if let Some(addr) = endpoint.socket_addr() {
        return Ok(addr);
    }
    let authority = endpoint.authority();
    let lookup = tokio::net::lookup_host(authority.clone());
    match tokio::time::timeout(timeout, lookup).await {
        Ok(Ok(mut addrs)) => addrs.next().ok_or(SessionError::Resolve(authority)),
        Ok(Err(_)) | Err(_) => Err(SessionError::Resolve(authority)),
    }
}

/// Which session kind a CONNECT asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    TcpClient,
    UdpClient,
    TcpServer,
    UdpServer(UdpBindProfile),
}

impl SessionKind {
    /// Validate the `(protocol, bind, bindtype)` combination
    pub fn select(spec: &ConnectSpec) -> Result<Self, SessionError> {
        match (spec.protocol, spec.bind) {
            (Protocol::Tcp, false) => Ok(Self::TcpClient),
            (Protocol::Udp, false) => Ok(Self::UdpClient),
            (Protocol::Tcp, true) if spec.bindtype == 1 => Ok(Self::TcpServer),
            (Protocol::Tcp, true) => Err(SessionError::NotImplemented),
            (Protocol::Udp, true) => UdpBindProfile::from_bindtype(spec.bindtype)
                .map(Self::UdpServer)
                .ok_or(SessionError::UnsupportedProfile(spec.bindtype)),
        }
    }

    pub fn is_server(self) -> bool {
        matches!(self, Self::TcpServer | Self::UdpServer(_))
    }
}

/// A session addressed by plain SD
#[derive(Debug)]
pub enum ClientSession {
    Tcp(TcpClientSession),
    Udp(UdpClientSession),
}

impl ClientSession {
    pub fn id(&self) -> u64 {
        match self {
            Self::Tcp(s) => s.id(),
            Self::Udp(s) => s.id(),
        }
    }

    /// Start the receive loop
    pub fn start(&mut self) {
        match self {
            Self::Tcp(s) => s.start(),
            Self::Udp(s) => s.start(),
        }
    }

    /// SD: queue raw bytes for the connected peer / default remote
    pub fn send(&mut self, data: Bytes) -> Result<(), SessionError> {
        match self {
            Self::Tcp(s) => s.send(data),
            Self::Udp(s) => s.send(data),
        }
    }

    /// SDSRV on a client token; only UDP sessions are addressable
    pub fn send_to(&mut self, data: SocketData) -> Result<(), SessionError> {
        match self {
            Self::Tcp(_) => Err(SessionError::NotAddressable),
            Self::Udp(s) => s.send_to(data.endpoint, data.data),
        }
    }

    pub fn stop(&mut self) {
        match self {
            Self::Tcp(s) => s.stop(),
            Self::Udp(s) => s.stop(),
        }
    }
}

/// A session addressed by SDSRV
#[derive(Debug)]
pub enum ServerSession {
    Tcp(TcpServerSession),
    Udp(UdpServerSession),
}

impl ServerSession {
    pub fn id(&self) -> u64 {
        match self {
            Self::Tcp(s) => s.id(),
            Self::Udp(s) => s.id(),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(s) => s.local_addr(),
            Self::Udp(s) => s.local_addr(),
        }
    }

    /// Start the accept / receive loop
    pub fn start(&mut self) {
        match self {
            Self::Tcp(s) => s.start(),
            Self::Udp(s) => s.start(),
        }
    }

    /// Route addressed data to a child (TCP) or an explicit endpoint (UDP)
    pub fn send(&mut self, data: SocketData) -> Result<(), SessionError> {
        match self {
            Self::Tcp(s) => s.send(data.connection, data.data),
            Self::Udp(s) => s.send_to(data.endpoint, data.data),
        }
    }

    pub fn stop(&mut self) {
        match self {
            Self::Tcp(s) => s.stop(),
            Self::Udp(s) => s.stop(),
        }
    }
}

/// The owned tasks behind a session (receive loop, writer); cancelled and
/// aborted together on stop
#[derive(Debug, Default)]
pub(crate) struct SessionTask {
    handles: Vec<JoinHandle<()>>,
}

impl SessionTask {
    pub(crate) fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    pub(crate) fn stop(&mut self, cancel: &CancellationToken) {
        cancel.cancel();
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

/// Endpoint used when an SDSRV carries no explicit target
pub(crate) fn is_default_target(endpoint: &Endpoint) -> bool {
    endpoint.is_unspecified() || matches!(&endpoint.host, Host::Name(n) if n.is_empty())
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use wsrelay_protocol::{Frame, decode};

    pub struct Harness {
        pub ctx: SessionContext,
        pub frames: mpsc::Receiver<Bytes>,
        pub events: mpsc::UnboundedReceiver<SessionEvent>,
    }

    impl Harness {
        pub fn new() -> Self {
            let (outbound, frames) = Outbound::channel(64);
            let (events_tx, events) = mpsc::unbounded_channel();
            let ctx = SessionContext {
                token: Token([0x42; 16]),
                id: 7,
                outbound,
                events: events_tx,
                cancel: CancellationToken::new(),
                recv_buffer_size: 65000,
                write_queue: 16,
                resolve_timeout: std::time::Duration::from_millis(500),
                closed: Arc::default(),
            };
            Self {
                ctx,
                frames,
                events,
            }
        }

        pub async fn next_frame(&mut self) -> Frame {
            let raw = tokio::time::timeout(std::time::Duration::from_secs(5), self.frames.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("outbound closed");
            decode(&raw).unwrap()
        }
    }
}
