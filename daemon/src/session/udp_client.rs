//! Connectionless UDP session with a default remote

use super::writer::{Datagram, WriteQueue};
use super::{SessionContext, SessionError, SessionTask, is_default_target, resolve};
use bytes::Bytes;
use std::fmt;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use wsrelay_protocol::{ConnectionToken, Endpoint, SocketData};

pub struct UdpClientSession {
    ctx: SessionContext,
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    queue: WriteQueue<Datagram>,
    queued: Option<mpsc::Receiver<Datagram>>,
    task: SessionTask,
}

impl UdpClientSession {
    /// Bind an ephemeral socket of the remote's family and remember the remote
    pub async fn connect(ctx: SessionContext, endpoint: &Endpoint) -> Result<Self, SessionError> {
        let remote = resolve(endpoint, ctx.resolve_timeout).await?;
        let local = match remote {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = UdpSocket::bind(local).await.map_err(SessionError::Bind)?;
        debug!(
            "[{}] UDP client bound on {:?}, default remote {}",
            ctx.token,
            socket.local_addr().ok(),
            remote
        );

        let (queue, queued) = WriteQueue::channel(ctx.write_queue);
        Ok(Self {
            ctx,
            socket: Arc::new(socket),
            remote,
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
            self.task.push(tokio::spawn(write_loop(
                self.ctx.clone(),
                self.socket.clone(),
                self.remote,
                queued,
            )));
        }
    }

    /// SD: one datagram to the default remote
    pub fn send(&mut self, data: Bytes) -> Result<(), SessionError> {
        self.enqueue(Datagram { target: None, data })
    }

    /// SDSRV: one datagram to an explicit endpoint
    pub fn send_to(&mut self, endpoint: Endpoint, data: Bytes) -> Result<(), SessionError> {
        let target = (!is_default_target(&endpoint)).then_some(endpoint);
        self.enqueue(Datagram { target, data })
    }

    fn enqueue(&mut self, datagram: Datagram) -> Result<(), SessionError> {
        if self.ctx.cancel.is_cancelled() {
            return Err(SessionError::Stopped);
        }
        if let Err(e) = self.queue.push(datagram) {
            self.stop();
            return Err(e);
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.task.stop(&self.ctx.cancel);
        self.queued = None;
    }
}

impl fmt::Debug for UdpClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpClientSession")
            .field("token", &self.ctx.token)
            .field("id", &self.ctx.id)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl Drop for UdpClientSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Send queued datagrams. An unresolvable target is reported and skipped; a
/// socket error ends the session.
async fn write_loop(
    ctx: SessionContext,
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    mut queued: mpsc::Receiver<Datagram>,
) {
    loop {
        let datagram = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            datagram = queued.recv() => match datagram {
                Some(datagram) => datagram,
                None => return,
            },
        };
        let sent = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            result = transmit(&ctx, &socket, remote, datagram) => result,
        };
        match sent {
            Ok(()) => {}
            Err(e @ SessionError::Resolve(_)) => {
                debug!("[{}] UDP datagram dropped: {}", ctx.token, e);
                let _ = ctx.outbound.err(ctx.token, e.to_string()).await;
            }
            Err(e) => {
                debug!("[{}] UDP write loop ended: {}", ctx.token, e);
                ctx.report_closed(&e, false).await;
                return;
            }
        }
    }
}

async fn transmit(
    ctx: &SessionContext,
    socket: &UdpSocket,
    remote: SocketAddr,
    datagram: Datagram,
) -> Result<(), SessionError> {
    let target = match &datagram.target {
        Some(endpoint) => resolve(endpoint, ctx.resolve_timeout).await?,
        None => remote,
    };
    socket
        .send_to(&datagram.data, target)
        .await
        .map_err(SessionError::Send)?;
    trace!("[{}] UDP sent {} bytes to {}", ctx.token, datagram.data.len(), target);
    Ok(())
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
            // ICMP unreachable from an earlier send; not fatal for a datagram socket
            Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
            Err(e) => break SessionError::Recv(e),
        }
    };

    debug!("[{}] UDP receive loop ended: {}", ctx.token, reason);
    ctx.report_closed(&reason, false).await;
}
