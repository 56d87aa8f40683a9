//! Listening TCP socket; every accepted peer becomes a child addressed by a
//! fresh connection token

use super::writer::WriteQueue;
use super::{SessionContext, SessionError, SessionTask, resolve};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use wsrelay_protocol::{ConnectionToken, Endpoint, SocketData};

type Children = Arc<DashMap<ConnectionToken, Arc<Child>>>;

/// One accepted peer
struct Child {
    peer: Endpoint,
    queue: WriteQueue<Bytes>,
    cancel: CancellationToken,
    tasks: Mutex<SessionTask>,
}

impl Child {
    fn stop(&self) {
        self.tasks.lock().stop(&self.cancel);
    }
}

pub struct TcpServerSession {
    ctx: SessionContext,
    local_addr: SocketAddr,
    listener: Option<TcpListener>,
    children: Children,
    task: SessionTask,
}

impl TcpServerSession {
    /// Bind and listen; the accept loop is not started yet
    pub async fn bind(ctx: SessionContext, endpoint: &Endpoint) -> Result<Self, SessionError> {
        let addr = resolve(endpoint, ctx.resolve_timeout).await?;
        let listener = TcpListener::bind(addr).await.map_err(SessionError::Bind)?;
        let local_addr = listener.local_addr().map_err(SessionError::Bind)?;
        info!("[{}] TCP server listening on {}", ctx.token, local_addr);

        Ok(Self {
            ctx,
            local_addr,
            listener: Some(listener),
            children: Arc::new(DashMap::new()),
            task: SessionTask::default(),
        })
    }

    pub fn id(&self) -> u64 {
        self.ctx.id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    /// Number of live accepted peers
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn start(&mut self) {
        if let Some(listener) = self.listener.take() {
            let handle = tokio::spawn(accept_loop(
                self.ctx.clone(),
                listener,
                self.children.clone(),
            ));
            self.task.push(handle);
        }
    }

    /// Queue data for the child registered under `connection`.
    ///
    /// A full queue closes only that child.
    pub fn send(&mut self, connection: ConnectionToken, data: Bytes) -> Result<(), SessionError> {
        if self.ctx.cancel.is_cancelled() {
            return Err(SessionError::Stopped);
        }
        let child = self
            .children
            .get(&connection)
            .map(|entry| entry.value().clone())
            .ok_or(SessionError::UnknownConnection(connection))?;

        if let Err(e) = child.queue.push(data) {
            self.children.remove(&connection);
            child.stop();
            return Err(SessionError::ConnectionClosed(connection, Box::new(e)));
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.task.stop(&self.ctx.cancel);
        self.listener = None;
        for entry in self.children.iter() {
            entry.value().stop();
        }
        self.children.clear();
    }
}

impl fmt::Debug for TcpServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServerSession")
            .field("token", &self.ctx.token)
            .field("id", &self.ctx.id)
            .field("local_addr", &self.local_addr)
            .field("children", &self.children.len())
            .finish_non_exhaustive()
    }
}

impl Drop for TcpServerSession {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(ctx: SessionContext, listener: TcpListener, children: Children) {
    let reason = loop {
        let accepted = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            result = listener.accept() => result,
        };
        let (stream, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => break SessionError::Accept(e),
        };
        let _ = stream.set_nodelay(true);

        let connection = loop {
            let candidate = ConnectionToken::random();
            if !children.contains_key(&candidate) {
                break candidate;
            }
        };
        let peer = Endpoint::from(peer_addr);
        let (reader, writer) = stream.into_split();
        let (queue, queued) = WriteQueue::channel(ctx.write_queue);
        let child = Arc::new(Child {
            peer: peer.clone(),
            queue,
            cancel: ctx.cancel.child_token(),
            tasks: Mutex::new(SessionTask::default()),
        });
        children.insert(connection, child.clone());
        debug!("[{}] Accepted {} as {}", ctx.token, peer, connection);

        // Connection-opened signal precedes any data from this peer
        let opened = SocketData::new(connection, peer, Bytes::new());
        if ctx.outbound.sdsrv(ctx.token, &opened).await.is_err() {
            return;
        }

        let recv = tokio::spawn(child_loop(
            ctx.clone(),
            connection,
            child.clone(),
            reader,
            children.clone(),
        ));
        let write = tokio::spawn(child_write_loop(
            ctx.clone(),
            connection,
            child.clone(),
            writer,
            queued,
            children.clone(),
        ));
        {
            let mut tasks = child.tasks.lock();
            tasks.push(recv);
            tasks.push(write);
        }
    };

    debug!("[{}] TCP accept loop ended: {}", ctx.token, reason);
    ctx.report_closed(&reason, true).await;
}

async fn child_loop(
    ctx: SessionContext,
    connection: ConnectionToken,
    child: Arc<Child>,
    mut reader: OwnedReadHalf,
    children: Children,
) {
    let mut buf = BytesMut::with_capacity(ctx.recv_buffer_size);
    let reason = loop {
        buf.reserve(ctx.recv_buffer_size);
        let read = {
            let mut limited = (&mut reader).take(ctx.recv_buffer_size as u64);
            tokio::select! {
                _ = child.cancel.cancelled() => return,
                result = limited.read_buf(&mut buf) => result,
            }
        };
        match read {
            Ok(0) => break SessionError::Eof,
            Ok(_) => {
                let record = SocketData::new(connection, child.peer.clone(), buf.split().freeze());
                if ctx.outbound.sdsrv(ctx.token, &record).await.is_err() {
                    return;
                }
            }
            Err(e) => break SessionError::Recv(e),
        }
    };

    child_ended(&ctx, connection, &child, &children, reason).await;
}

async fn child_write_loop(
    ctx: SessionContext,
    connection: ConnectionToken,
    child: Arc<Child>,
    mut writer: OwnedWriteHalf,
    mut queued: mpsc::Receiver<Bytes>,
    children: Children,
) {
    let reason = loop {
        let data = tokio::select! {
            _ = child.cancel.cancelled() => return,
            data = queued.recv() => match data {
                Some(data) => data,
                None => return,
            },
        };
        let written = tokio::select! {
            _ = child.cancel.cancelled() => return,
            result = writer.write_all(&data) => result,
        };
        if let Err(e) = written {
            break SessionError::Send(e);
        }
    };

    child_ended(&ctx, connection, &child, &children, reason).await;
}

/// A child's own loop ended: drop it and report on the listener token.
///
/// Only the first loop to remove the child reports.
async fn child_ended(
    ctx: &SessionContext,
    connection: ConnectionToken,
    child: &Child,
    children: &Children,
    reason: SessionError,
) {
    if children.remove(&connection).is_none() || child.cancel.is_cancelled() {
        return;
    }
    child.cancel.cancel();
    debug!("[{}] Child {} ended: {}", ctx.token, connection, reason);
    let closed = SessionError::ConnectionClosed(connection, Box::new(reason));
    let _ = ctx.outbound.err(ctx.token, closed.to_string()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testutil::Harness;
    use tokio::net::TcpStream;
    use wsrelay_protocol::{CommandType, ErrorReply, Frame, Payload};

    async fn listening(h: &Harness) -> TcpServerSession {
        let requested = Endpoint::from("127.0.0.1:0".parse::<SocketAddr>().unwrap());
        let mut server = TcpServerSession::bind(h.ctx.clone(), &requested).await.unwrap();
        server.start();
        server
    }

    fn record(frame: &Frame) -> SocketData {
        assert_eq!(frame.command, CommandType::SdSrv);
        SocketData::decode(&frame.payload).unwrap()
    }

    #[tokio::test]
    async fn test_open_signal_precedes_data() {
        let mut h = Harness::new();
        let server = listening(&h).await;

        let mut peer = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        peer.write_all(b"first").await.unwrap();

        let opened = record(&h.next_frame().await);
        assert!(opened.data.is_empty());
        assert_eq!(opened.endpoint, Endpoint::from(peer.local_addr().unwrap()));

        let data = record(&h.next_frame().await);
        assert_eq!(data.connection, opened.connection);
        assert_eq!(&data.data[..], b"first");
    }

    #[tokio::test]
    async fn test_children_are_isolated() {
        let mut h = Harness::new();
        let mut server = listening(&h).await;
        let addr = server.local_addr().unwrap();

        let mut a = TcpStream::connect(addr).await.unwrap();
        let conn_a = record(&h.next_frame().await).connection;
        let mut b = TcpStream::connect(addr).await.unwrap();
        let conn_b = record(&h.next_frame().await).connection;
        assert_ne!(conn_a, conn_b);
        assert_eq!(server.child_count(), 2);

        server.send(conn_a, Bytes::from_static(b"to-a")).unwrap();
        let mut buf = [0u8; 4];
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to-a");

        // Nothing for b
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            b.read(&mut buf),
        )
        .await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_child_close_keeps_server() {
        let mut h = Harness::new();
        let mut server = listening(&h).await;
        let addr = server.local_addr().unwrap();

        let peer = TcpStream::connect(addr).await.unwrap();
        let conn = record(&h.next_frame().await).connection;
        drop(peer);

        let frame = h.next_frame().await;
        assert_eq!(frame.command, CommandType::Err);
        let reply = ErrorReply::decode(&frame.payload).unwrap();
        assert!(reply.message.starts_with(&format!("Connection {} closed", conn)));

        assert!(matches!(
            server.send(conn, Bytes::from_static(b"gone")),
            Err(SessionError::UnknownConnection(_))
        ));
        assert!(h.events.try_recv().is_err());

        // Still accepting
        let _again = TcpStream::connect(addr).await.unwrap();
        let opened = record(&h.next_frame().await);
        assert_ne!(opened.connection, conn);
    }

    #[tokio::test]
    async fn test_stop_closes_children() {
        let mut h = Harness::new();
        let mut server = listening(&h).await;
        let mut peer = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        let conn = record(&h.next_frame().await).connection;
        let child = server.children.get(&conn).map(|e| e.value().clone()).unwrap();
        assert_eq!(child.tasks.lock().len(), 2);

        server.stop();
        assert_eq!(child.tasks.lock().len(), 0);
        assert!(child.cancel.is_cancelled());
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(std::time::Duration::from_secs(5), peer.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(server.child_count(), 0);
    }

    #[tokio::test]
    async fn test_stalled_child_closes_alone() {
        let mut h = Harness::new();
        let mut server = listening(&h).await;
        let addr = server.local_addr().unwrap();

        let _stalled = TcpStream::connect(addr).await.unwrap();
        let stalled = record(&h.next_frame().await).connection;
        let mut reading = TcpStream::connect(addr).await.unwrap();
        let live = record(&h.next_frame().await).connection;

        let chunk = Bytes::from(vec![0u8; 1 << 20]);
        let mut result = Ok(());
        for _ in 0..64 {
            result = server.send(stalled, chunk.clone());
            if result.is_err() {
                break;
            }
        }
        match result {
            Err(SessionError::ConnectionClosed(conn, reason)) => {
                assert_eq!(conn, stalled);
                assert!(matches!(*reason, SessionError::Backlog));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(server.child_count(), 1);

        server.send(live, Bytes::from_static(b"live")).unwrap();
        let mut buf = [0u8; 4];
        reading.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"live");
    }
}
