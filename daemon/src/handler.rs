//! Controller listener and per-connection serving

use crate::auth::{AuthProvider, UnsupportedProvider};
use crate::config::{AgentConfig, TransportMode};
use crate::dispatcher::CommandDispatcher;
use crate::metrics;
use crate::outbound::Outbound;
use crate::resolver::Resolver;
use anyhow::{Context, Result};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wsrelay_transport::{FrameSink, FrameSource, accept_websocket, split_stream};

/// Inbound frames buffered between the transport reader and the dispatcher
const INBOUND_QUEUE: usize = 64;

/// How long a finished connection waits for queued replies to flush
const WRITER_DRAIN: Duration = Duration::from_secs(5);

/// Serve one controller connection until the peer goes away or `cancel` fires
pub async fn serve_connection<K, S>(
    sink: K,
    source: S,
    config: &AgentConfig,
    auth_provider: Arc<dyn AuthProvider>,
    cancel: CancellationToken,
) where
    K: FrameSink + 'static,
    S: FrameSource + 'static,
{
    let (outbound, mut writer) = Outbound::spawn(sink, config.session.outbound_queue);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    let reader = tokio::spawn(read_loop(source, inbound_tx));

    let mut dispatcher = CommandDispatcher::new(
        outbound,
        cancel,
        auth_provider,
        Resolver::new(config.resolver.timeout()),
        &config.session,
    );
    dispatcher.run(inbound_rx).await;
    drop(dispatcher);
    reader.abort();

    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        debug!("Outbound writer did not drain in time");
        writer.abort();
    }
}

async fn read_loop<S: FrameSource>(mut source: S, tx: mpsc::Sender<Bytes>) {
    loop {
        match source.recv_frame().await {
            Ok(Some(frame)) => {
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("Controller disconnected");
                break;
            }
            Err(e) => {
                warn!("Transport receive error: {}", e);
                break;
            }
        }
    }
}

/// Counts a live controller connection
struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn try_acquire(active: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        let acquired = active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_ok();
        if !acquired {
            return None;
        }
        metrics::with(|m| m.active_connections.inc());
        Some(Self {
            active: active.clone(),
        })
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        metrics::with(|m| m.active_connections.dec());
    }
}

/// Controller listener
pub struct Server {
    listener: TcpListener,
    config: Arc<AgentConfig>,
    auth_provider: Arc<dyn AuthProvider>,
    active: Arc<AtomicUsize>,
}

impl Server {
    pub async fn bind(config: AgentConfig, auth_provider: Arc<dyn AuthProvider>) -> Result<Self> {
        let listener = TcpListener::bind(config.server.bind)
            .await
            .with_context(|| format!("Failed to bind {}", config.server.bind))?;
        info!(
            "Listening on {} ({})",
            listener.local_addr()?,
            config.server.mode
        );

        Ok(Self {
            listener,
            config: Arc::new(config),
            auth_provider,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever
    pub async fn run(self) -> Result<()> {
        self.run_until(CancellationToken::new()).await
    }

    /// Accept connections until `shutdown` fires; live connections are cancelled with it
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<()> {
        loop {
            let (stream, addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted?,
            };

            let Some(guard) =
                ConnectionGuard::try_acquire(&self.active, self.config.server.max_connections)
            else {
                warn!(
                    "Refusing {}: connection limit {} reached",
                    addr, self.config.server.max_connections
                );
                drop(stream);
                continue;
            };
            debug!("New connection from {}", addr);

            let config = self.config.clone();
            let auth_provider = self.auth_provider.clone();
            let cancel = shutdown.child_token();
            tokio::spawn(async move {
                let _guard = guard;
                if let Err(e) = handle_stream(stream, &config, auth_provider, cancel).await {
                    error!("Connection error from {}: {:#}", addr, e);
                }
                info!("Controller {} disconnected", addr);
            });
        }

        info!("Listener stopped");
        Ok(())
    }
}

async fn handle_stream(
    stream: TcpStream,
    config: &AgentConfig,
    auth_provider: Arc<dyn AuthProvider>,
    cancel: CancellationToken,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let max = config.server.max_frame_size;

    match config.server.mode {
        TransportMode::Websocket => {
            let (sink, source) = accept_websocket(stream, max)
                .await
                .context("WebSocket handshake failed")?;
            info!("Controller connected (websocket)");
            serve_connection(sink, source, config, auth_provider, cancel).await;
        }
        TransportMode::Stream => {
            let (sink, source) = split_stream(stream, max);
            info!("Controller connected (stream)");
            serve_connection(sink, source, config, auth_provider, cancel).await;
        }
    }
    Ok(())
}

/// Bind the configured listener and serve until the process exits
pub async fn run(config: &AgentConfig) -> Result<()> {
    let server = Server::bind(config.clone(), Arc::new(UnsupportedProvider)).await?;
    server.run().await
}
