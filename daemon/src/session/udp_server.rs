//! Bound UDP socket with selectable bind profiles

use super::writer::{Datagram, WriteQueue};
use super::{SessionContext, SessionError, SessionTask, resolve};
use bytes::Bytes;
use std::fmt;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info};
use wsrelay_protocol::{ConnectionToken, Endpoint, SocketData};

const LLMNR_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 252);
const LLMNR_PORT: u16 = 5355;
const NETBIOS_PORT: u16 = 137;
const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const MDNS_PORT: u16 = 5353;

/// UDP bind behavior selected by CONNECT's bindtype
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpBindProfile {
    /// 1: bind the requested `ip:port`
    Plain,
    /// 2: `0.0.0.0:5355`, joined to 224.0.0.252
    Llmnr,
    /// 3: `0.0.0.0:137` with broadcast enabled
    NetbiosBroadcast,
    /// 4: `0.0.0.0:5353`, joined to 224.0.0.251
    Mdns,
}

impl UdpBindProfile {
    pub fn from_bindtype(bindtype: u8) -> Option<Self> {
        match bindtype {
            1 => Some(Self::Plain),
            2 => Some(Self::Llmnr),
            3 => Some(Self::NetbiosBroadcast),
            4 => Some(Self::Mdns),
            _ => None,
        }
    }

    fn fixed_addr(self) -> Option<SocketAddr> {
        let port = match self {
            Self::Plain => return None,
            Self::Llmnr => LLMNR_PORT,
            Self::NetbiosBroadcast => NETBIOS_PORT,
            Self::Mdns => MDNS_PORT,
        };
        Some(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
    }

    fn configure(self, socket: &UdpSocket) -> std::io::Result<()> {
        match self {
            Self::Plain => Ok(()),
            Self::Llmnr => socket.join_multicast_v4(LLMNR_GROUP, Ipv4Addr::UNSPECIFIED),
            Self::NetbiosBroadcast => socket.set_broadcast(true),
            Self::Mdns => socket.join_multicast_v4(MDNS_GROUP, Ipv4Addr::UNSPECIFIED),
        }
    }
}

pub struct UdpServerSession {
    ctx: SessionContext,
    socket: Arc<UdpSocket>,
    profile: UdpBindProfile,
    queue: WriteQueue<Datagram>,
    queued: Option<mpsc::Receiver<Datagram>>,
    task: SessionTask,
}

impl UdpServerSession {
    /// Bind according to `profile`; the receive loop is not started yet
    pub async fn bind(
        ctx: SessionContext,
        endpoint: &Endpoint,
        profile: UdpBindProfile,
    ) -> Result<Self, SessionError> {
        let addr = match profile.fixed_addr() {
            Some(addr) => addr,
            None => resolve(endpoint, ctx.resolve_timeout).await?,
        };
        let socket = UdpSocket::bind(addr).await.map_err(SessionError::Bind)?;
        profile.configure(&socket).map_err(SessionError::Bind)?;
        info!("[{}] UDP server bound on {} ({:?})", ctx.token, addr, profile);

        let (queue, queued) = WriteQueue::channel(ctx.write_queue);
        Ok(Self {
            ctx,
            socket: Arc::new(socket),
            profile,
            queue,
            queued: Some(queued),
            task: SessionTask::default(),
        })
    }

    pub fn id(&self) -> u64 {
        self.ctx.id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    pub fn start(&mut self) {
        if let Some(queued) = self.queued.take() {
            self.task
                .push(tokio::spawn(recv_loop(self.ctx.clone(), self.socket.clone())));
            self.task
                .push(tokio::spawn(write_loop(self.ctx.clone(), self.socket.clone(), queued)));
        }
    }

    /// Queue one datagram for an explicit endpoint; failures leave the socket bound
    pub fn send_to(&mut self, endpoint: Endpoint, data: Bytes) -> Result<(), SessionError> {
        if self.ctx.cancel.is_cancelled() {
            return Err(SessionError::Stopped);
        }
        self.queue.push(Datagram {
            target: Some(endpoint),
            data,
        })
    }

    pub fn stop(&mut self) {
        self.task.stop(&self.ctx.cancel);
        self.queued = None;
    }
}

impl fmt::Debug for UdpServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpServerSession")
            .field("token", &self.ctx.token)
            .field("id", &self.ctx.id)
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

impl Drop for UdpServerSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Send queued datagrams; every failure is reported and the loop goes on
async fn write_loop(ctx: SessionContext, socket: Arc<UdpSocket>, mut queued: mpsc::Receiver<Datagram>) {
    loop {
        let datagram = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            datagram = queued.recv() => match datagram {
                Some(datagram) => datagram,
                None => return,
            },
        };
        let Some(endpoint) = datagram.target else {
            continue;
        };
        let sent = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            result = async {
                let target = resolve(&endpoint, ctx.resolve_timeout).await?;
                socket
                    .send_to(&datagram.data, target)
                    .await
                    .map_err(SessionError::Send)
            } => result,
        };
        if let Err(e) = sent {
            debug!("[{}] UDP server send to {} failed: {}", ctx.token, endpoint, e);
            let _ = ctx.outbound.err(ctx.token, e.to_string()).await;
        }
    }
}

async fn recv_loop(ctx: SessionContext, socket: Arc<UdpSocket>) {
    let connection = ConnectionToken::from(ctx.token);
    let mut buf = vec![0u8; ctx.recv_buffer_size];
    let reason = loop {
        let received = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            result = socket.recv_from(&mut buf) => result,
        };
        match received {
            Ok((len, from)) => {
                let record = SocketData::new(
                    connection,
                    Endpoint::from(from),
                    Bytes::copy_from_slice(&buf[..len]),
                );
                if ctx.outbound.sdsrv(ctx.token, &record).await.is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
            Err(e) => break SessionError::Recv(e),
        }
    };

    debug!("[{}] UDP server loop ended: {}", ctx.token, reason);
    ctx.report_closed(&reason, true).await;
}
