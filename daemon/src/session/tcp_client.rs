//! Outbound TCP connection relayed as SD frames

use super::writer::WriteQueue;
use super::{SessionContext, SessionError, SessionTask, resolve};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::debug;
use wsrelay_protocol::Endpoint;

/// Socket halves waiting for `start`
struct Idle {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    queued: mpsc::Receiver<Bytes>,
}

pub struct TcpClientSession {
    ctx: SessionContext,
    remote: SocketAddr,
    queue: WriteQueue<Bytes>,
    idle: Option<Idle>,
    task: SessionTask,
}

impl TcpClientSession {
    /// Connect to `endpoint`; the receive and write loops are not started yet
    pub async fn connect(ctx: SessionContext, endpoint: &Endpoint) -> Result<Self, SessionError> {
        let remote = resolve(endpoint, ctx.resolve_timeout).await?;
        let stream = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(SessionError::Stopped),
            result = TcpStream::connect(remote) => result.map_err(SessionError::Connect)?,
        };
        let _ = stream.set_nodelay(true);
        debug!("[{}] TCP connected to {}", ctx.token, remote);

        let (reader, writer) = stream.into_split();
        let (queue, queued) = WriteQueue::channel(ctx.write_queue);
        Ok(Self {
            ctx,
            remote,
            queue,
            idle: Some(Idle {
                reader,
                writer,
                queued,
            }),
            task: SessionTask::default(),
        })
    }

    pub fn id(&self) -> u64 {
        self.ctx.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn start(&mut self) {
        if let Some(idle) = self.idle.take() {
            self.task
                .push(tokio::spawn(recv_loop(self.ctx.clone(), idle.reader)));
            self.task.push(tokio::spawn(write_loop(
                self.ctx.clone(),
                idle.writer,
                idle.queued,
            )));
        }
    }

    /// Queue `data` for the peer; a full queue stops the session
    pub fn send(&mut self, data: Bytes) -> Result<(), SessionError> {
        if self.ctx.cancel.is_cancelled() {
            return Err(SessionError::Stopped);
        }
        if let Err(e) = self.queue.push(data) {
            self.stop();
            return Err(e);
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.task.stop(&self.ctx.cancel);
        self.idle = None;
    }
}

impl fmt::Debug for TcpClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpClientSession")
            .field("token", &self.ctx.token)
            .field("id", &self.ctx.id)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl Drop for TcpClientSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Drain the write queue into the socket; a write error ends the session
async fn write_loop(ctx: SessionContext, mut writer: OwnedWriteHalf, mut queued: mpsc::Receiver<Bytes>) {
    loop {
        let data = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            data = queued.recv() => match data {
                Some(data) => data,
                None => return,
            },
        };
        let written = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            result = writer.write_all(&data) => result,
        };
        if let Err(e) = written {
            let reason = SessionError::Send(e);
            debug!("[{}] TCP write loop ended: {}", ctx.token, reason);
            ctx.report_closed(&reason, false).await;
            return;
        }
    }
}

async fn recv_loop(ctx: SessionContext, mut reader: OwnedReadHalf) {
    let mut buf = BytesMut::with_capacity(ctx.recv_buffer_size);
    let reason = loop {
        buf.reserve(ctx.recv_buffer_size);
        let read = {
            let mut limited = (&mut reader).take(ctx.recv_buffer_size as u64);
            tokio::select! {
                _ = ctx.cancel.cancelled() => return,
                result = limited.read_buf(&mut buf) => result,
            }
        };
        match read {
            Ok(0) => break SessionError::Eof,
            Ok(_) => {
                let data = buf.split().freeze();
                if ctx.outbound.sd(ctx.token, data).await.is_err() {
                    return;
                }
            }
            Err(e) => break SessionError::Recv(e),
        }
    };

    debug!("[{}] TCP receive loop ended: {}", ctx.token, reason);
    ctx.report_closed(&reason, false).await;
}
