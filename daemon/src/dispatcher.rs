//! Command dispatcher
//!
//! One dispatcher serves one controller connection. It is the only owner of
//! that connection's [`SessionRegistry`]: inbound frames and session events are
//! processed one at a time from [`CommandDispatcher::run`]. Anything that can
//! block for long (connect/bind, auth provider calls, name resolution, path
//! commands) runs in a spawned task that replies through the shared
//! [`Outbound`] queue or posts a [`SessionEvent`] back. SD/SDSRV only queue
//! onto the addressed session's own write queue.

use crate::auth::{self, AuthProvider, AuthRequest};
use crate::config::SessionConfig;
use crate::fileops::{self, FileOpError, OpenFile};
use crate::metrics;
use crate::outbound::{Outbound, OutboundClosed};
use crate::registry::SessionRegistry;
use crate::resolver::Resolver;
use crate::session::{
    ClientSession, ServerSession, SessionContext, SessionError, SessionEvent, SessionKind,
    TcpClientSession, TcpServerSession, UdpClientSession, UdpServerSession,
};
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use wsrelay_protocol::{
    CommandType, ConnectSpec, FileData, FileOpenRequest, FileReadRequest, FileStatRequest,
    Frame, FrameError, HEADER_LEN, MAX_FRAME_SIZE, NameList, PathPair, PathRequest, Payload,
    SocketData, Token, WireError, decode,
};

pub const TOKEN_EXISTS: &str = "Token already exists";
pub const NO_SOCKET_SESSION: &str = "No socket session found for token";
pub const NO_SERVER_SESSION: &str = "No socket server session found for token";
pub const NO_AUTH_SESSION: &str = "No session found for token";
pub const FILE_NOT_OPENED: &str = "File not opened for token!";
pub const FILE_ALREADY_OPENED: &str = "File already opened for token!";

/// FILEDATA reply overhead: offset + data length prefix
const FILE_DATA_OVERHEAD: usize = 8 + 4;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    File(#[from] FileOpError),

    #[error(transparent)]
    Closed(#[from] OutboundClosed),
}

type Result<T> = std::result::Result<T, DispatchError>;

pub struct CommandDispatcher {
    outbound: Outbound,
    cancel: CancellationToken,
    registry: SessionRegistry,
    auth_provider: Arc<dyn AuthProvider>,
    resolver: Resolver,
    recv_buffer_size: usize,
    write_queue: usize,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    stopped: bool,
}

impl CommandDispatcher {
    pub fn new(
        outbound: Outbound,
        cancel: CancellationToken,
        auth_provider: Arc<dyn AuthProvider>,
        resolver: Resolver,
        session: &SessionConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            outbound,
            cancel,
            registry: SessionRegistry::new(),
            auth_provider,
            resolver,
            recv_buffer_size: session.recv_buffer_size.max(1),
            write_queue: session.write_queue.max(1),
            events_tx,
            events_rx: Some(events_rx),
            stopped: false,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Process inbound frames and session events until the source ends or the
    /// connection is cancelled, then stop.
    pub async fn run(&mut self, mut inbound: mpsc::Receiver<Bytes>) {
        let Some(mut events) = self.events_rx.take() else {
            return;
        };
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = inbound.recv() => match frame {
                    Some(raw) => self.handle_raw(&raw).await,
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }

        self.events_rx = Some(events);
        self.stop();
    }

    /// Next session event; for driving the dispatcher by hand
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events_rx.as_mut()?.recv().await
    }

    /// Decode and handle one raw frame; malformed frames are dropped
    pub async fn handle_raw(&mut self, raw: &[u8]) {
        metrics::with(|m| m.frames_received.inc());
        match decode(raw) {
            Ok(frame) => self.handle_frame(frame).await,
            Err(FrameError::UnknownCommand { code, token }) => {
                warn!("[IN][{}] Unknown command type {}, ignoring", token, code);
                metrics::with(|m| m.frame_errors.inc());
            }
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                metrics::with(|m| m.frame_errors.inc());
            }
        }
    }

    pub async fn handle_frame(&mut self, frame: Frame) {
        let Frame {
            command,
            token,
            payload,
        } = frame;

        if self.stopped {
            debug!("[IN][{}][{}] Dispatcher stopped, dropping", token, command);
            return;
        }
        debug!("[IN][{}][{}]", token, command);

        let result = match command {
            CommandType::Connect => self.connect(token, &payload).await,
            CommandType::Sd => self.socket_data(token, payload).await,
            CommandType::SdSrv => self.socket_data_addressed(token, &payload).await,
            CommandType::Ok | CommandType::Err => self.close(token).await,
            CommandType::NtlmAuth
            | CommandType::NtlmChall
            | CommandType::Kerberos
            | CommandType::SessionKey
            | CommandType::Sequence => self.auth(command, token, &payload).await,
            CommandType::GetInfo => {
                self.outbound
                    .send_payload(CommandType::GetInfoReply, token, &crate::info::collect())
                    .await
                    .map_err(DispatchError::from)
            }
            CommandType::Resolv => self.resolve(token, &payload),
            CommandType::DirLs
            | CommandType::DirMk
            | CommandType::DirRm
            | CommandType::DirCopy
            | CommandType::DirMove
            | CommandType::FileCopy
            | CommandType::FileMove
            | CommandType::FileRm => {
                self.path_command(command, token, payload);
                Ok(())
            }
            CommandType::FileOpen
            | CommandType::FileRead
            | CommandType::FileData
            | CommandType::FileStat => self.file_command(command, token, &payload).await,
            _ => {
                debug!("[IN][{}][{}] Not handled by the agent, ignoring", token, command);
                Ok(())
            }
        };

        match result {
            Ok(()) => {}
            Err(DispatchError::Closed(_)) => {
                debug!("[{}] Outbound closed while handling {}", token, command);
            }
            Err(e) => {
                warn!("[{}] Error handling {}: {}", token, command, e);
                let _ = self
                    .outbound
                    .err(token, format!("Error in message processing! {}", e))
                    .await;
            }
        }
    }

    pub async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::ClientReady { token, id, result } => {
                let claimed = self.registry.take_pending(&token, id).is_some();
                match result {
                    Ok(mut session) if !claimed || self.stopped => session.stop(),
                    Ok(mut session) => {
                        let _ = self.outbound.continue_(token).await;
                        session.start();
                        self.registry.insert_client(token, session);
                    }
                    Err(e) if claimed && !self.stopped => {
                        debug!("[{}] Connect failed: {}", token, e);
                        let _ = self.outbound.err(token, e.to_string()).await;
                    }
                    Err(_) => {}
                }
            }
            SessionEvent::ServerReady { token, id, result } => {
                let claimed = self.registry.take_pending(&token, id).is_some();
                match result {
                    Ok(mut session) if !claimed || self.stopped => session.stop(),
                    Ok(mut session) => {
                        info!("[{}] Serving on {:?}", token, session.local_addr());
                        let _ = self.outbound.continue_(token).await;
                        session.start();
                        self.registry.insert_server(token, session);
                    }
                    Err(e) if claimed && !self.stopped => {
                        debug!("[{}] Bind failed: {}", token, e);
                        let _ = self.outbound.err(token, e.to_string()).await;
                    }
                    Err(_) => {}
                }
            }
            SessionEvent::ClientClosed { token, id } => {
                if self.registry.remove_client_if(&token, id) {
                    debug!("[{}] Client session {} closed itself", token, id);
                }
            }
            SessionEvent::ServerClosed { token, id } => {
                if self.registry.remove_server_if(&token, id) {
                    debug!("[{}] Server session {} closed itself", token, id);
                }
            }
        }
    }

    /// Cancel every session and forget every token; idempotent
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.cancel.cancel();
        self.registry.clear();
        info!("Dispatcher stopped");
    }

    async fn connect(&mut self, token: Token, payload: &[u8]) -> Result<()> {
        let spec = ConnectSpec::decode(payload)?;
        if self.registry.is_occupied(&token) {
            self.outbound.err(token, TOKEN_EXISTS).await?;
            return Ok(());
        }
        let kind = match SessionKind::select(&spec) {
            Ok(kind) => kind,
            Err(e) => {
                self.outbound.err(token, e.to_string()).await?;
                return Ok(());
            }
        };
        debug!(
            "[{}] CONNECT {} {} bind={} bindtype={}",
            token, spec.protocol, spec.endpoint, spec.bind, spec.bindtype
        );

        let cancel = self.cancel.child_token();
        let id = self.registry.reserve(token, cancel.clone());
        let ctx = SessionContext {
            token,
            id,
            outbound: self.outbound.clone(),
            events: self.events_tx.clone(),
            cancel,
            recv_buffer_size: self.recv_buffer_size,
            write_queue: self.write_queue,
            resolve_timeout: self.resolver.timeout(),
            closed: Arc::default(),
        };
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            let endpoint = spec.endpoint;
            let event = match kind {
                SessionKind::TcpClient => SessionEvent::ClientReady {
                    token,
                    id,
                    result: TcpClientSession::connect(ctx, &endpoint)
                        .await
                        .map(ClientSession::Tcp),
                },
                SessionKind::UdpClient => SessionEvent::ClientReady {
                    token,
                    id,
                    result: UdpClientSession::connect(ctx, &endpoint)
                        .await
                        .map(ClientSession::Udp),
                },
                SessionKind::TcpServer => SessionEvent::ServerReady {
                    token,
                    id,
                    result: TcpServerSession::bind(ctx, &endpoint)
                        .await
                        .map(ServerSession::Tcp),
                },
                SessionKind::UdpServer(profile) => SessionEvent::ServerReady {
                    token,
                    id,
                    result: UdpServerSession::bind(ctx, &endpoint, profile)
                        .await
                        .map(ServerSession::Udp),
                },
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    async fn socket_data(&mut self, token: Token, payload: Bytes) -> Result<()> {
        let Some(session) = self.registry.client_mut(&token) else {
            self.outbound.err(token, NO_SOCKET_SESSION).await?;
            return Ok(());
        };
        if let Err(e) = session.send(payload) {
            self.client_send_failed(token, e).await?;
        }
        Ok(())
    }

    async fn socket_data_addressed(&mut self, token: Token, payload: &[u8]) -> Result<()> {
        let data = SocketData::decode(payload)?;

        if let Some(server) = self.registry.server_mut(&token) {
            // Failures stay scoped to the addressed peer
            if let Err(e) = server.send(data) {
                debug!("[{}] Server send failed: {}", token, e);
                self.outbound.err(token, e.to_string()).await?;
            }
            return Ok(());
        }

        if let Some(client) = self.registry.client_mut(&token) {
            if let Err(e) = client.send_to(data) {
                self.client_send_failed(token, e).await?;
            }
            return Ok(());
        }

        self.outbound.err(token, NO_SERVER_SESSION).await?;
        Ok(())
    }

    async fn client_send_failed(&mut self, token: Token, error: SessionError) -> Result<()> {
        debug!("[{}] Client send failed: {}", token, error);
        if error.is_fatal() {
            self.registry.remove_client(&token);
        }
        self.outbound.err(token, error.to_string()).await?;
        Ok(())
    }

    /// OK/ERR from the controller: it is done with whatever lives under `token`
    async fn close(&mut self, token: Token) -> Result<()> {
        if self.registry.remove_client(&token).is_some() {
            debug!("[{}] Client session closed by controller", token);
        } else if self.registry.remove_server(&token).is_some() {
            debug!("[{}] Server session closed by controller", token);
        } else if self.registry.remove_file(&token).is_some() {
            debug!("[{}] File closed by controller", token);
        } else if self.registry.cancel_pending(&token) {
            debug!("[{}] Pending connect cancelled by controller", token);
        } else {
            self.outbound.err(token, NO_SOCKET_SESSION).await?;
        }
        Ok(())
    }

    async fn auth(&mut self, command: CommandType, token: Token, payload: &[u8]) -> Result<()> {
        let Some(request) = AuthRequest::decode(command, payload) else {
            return Ok(());
        };
        let request = request?;

        let session = if request.opens_session() {
            self.registry
                .auth_session_or_insert(token, self.auth_provider.as_ref())
        } else {
            match self.registry.auth_session(&token) {
                Some(session) => session,
                None => {
                    self.outbound
                        .auth_err(token, auth::status::GENERIC as i64, NO_AUTH_SESSION)
                        .await?;
                    return Ok(());
                }
            }
        };

        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let sent = match auth::execute(session, request).await {
                Ok((reply, payload)) => outbound.send(Frame::new(reply, token, payload)).await,
                Err(failure) => {
                    debug!("[{}] Auth step failed: {}", token, failure);
                    outbound
                        .auth_err(token, failure.status as i64, failure.message)
                        .await
                }
            };
            if sent.is_err() {
                trace!("[{}] Auth reply dropped, connection closed", token);
            }
        });
        Ok(())
    }

    fn resolve(&mut self, token: Token, payload: &[u8]) -> Result<()> {
        let NameList(names) = NameList::decode(payload)?;
        let resolver = self.resolver;
        let outbound = self.outbound.clone();

        tokio::spawn(async move {
            let resolved = resolver.resolve_all(&names).await;
            let _ = outbound
                .send_payload(CommandType::Resolv, token, &NameList(resolved))
                .await;
        });
        Ok(())
    }

    fn path_command(&mut self, command: CommandType, token: Token, payload: Bytes) {
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            match run_path_command(&outbound, command, token, &payload).await {
                Ok(()) | Err(DispatchError::Closed(_)) => {}
                Err(e) => {
                    debug!("[{}] {} failed: {}", token, command, e);
                    let _ = outbound.err(token, format!("Error! {}", e)).await;
                }
            }
        });
    }

    async fn file_command(&mut self, command: CommandType, token: Token, payload: &[u8]) -> Result<()> {
        match self.open_file_command(command, token, payload).await {
            Err(DispatchError::Closed(e)) => Err(e.into()),
            Err(e) => {
                debug!("[{}] {} failed: {}", token, command, e);
                self.outbound.err(token, format!("Error! {}", e)).await?;
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    async fn open_file_command(&mut self, command: CommandType, token: Token, payload: &[u8]) -> Result<()> {
        match command {
            CommandType::FileOpen => {
                let req = FileOpenRequest::decode(payload)?;
                if self.registry.has_file(&token) {
                    self.outbound.err(token, FILE_ALREADY_OPENED).await?;
                    return Ok(());
                }
                let file = OpenFile::open(&req.path, &req.mode).await?;
                debug!("[{}] Opened {} ({:?})", token, file.path(), req.mode);
                if self.registry.insert_file(token, file).is_err() {
                    self.outbound.err(token, FILE_ALREADY_OPENED).await?;
                    return Ok(());
                }
                self.outbound.continue_(token).await?;
            }
            CommandType::FileRead => {
                let req = FileReadRequest::decode(payload)?;
                let Some(file) = self.registry.file_mut(&token) else {
                    self.outbound.err(token, FILE_NOT_OPENED).await?;
                    return Ok(());
                };
                let max = MAX_FRAME_SIZE - HEADER_LEN - FILE_DATA_OVERHEAD;
                let data = file.read_at(req.offset, (req.size as usize).min(max)).await?;
                let reply = FileData {
                    offset: req.offset,
                    data,
                };
                self.outbound
                    .send_payload(CommandType::FileData, token, &reply)
                    .await?;
            }
            CommandType::FileData => {
                let req = FileData::decode(payload)?;
                let Some(file) = self.registry.file_mut(&token) else {
                    self.outbound.err(token, FILE_NOT_OPENED).await?;
                    return Ok(());
                };
                file.write_at(req.offset, &req.data).await?;
                self.outbound.continue_(token).await?;
            }
            CommandType::FileStat => {
                let req = FileStatRequest::decode(payload)?;
                let entry = match req.path {
                    Some(path) => fileops::stat(&path).await?,
                    None => match self.registry.file_mut(&token) {
                        Some(file) => file.stat().await?,
                        None => {
                            self.outbound.err(token, FILE_NOT_OPENED).await?;
                            return Ok(());
                        }
                    },
                };
                self.outbound
                    .send_payload(CommandType::FileEntry, token, &entry)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_path_command(
    outbound: &Outbound,
    command: CommandType,
    token: Token,
    payload: &[u8],
) -> Result<()> {
    match command {
        CommandType::DirLs => {
            let req = PathRequest::decode(payload)?;
            for entry in fileops::list_dir(&req.path).await? {
                outbound
                    .send_payload(CommandType::FileEntry, token, &entry)
                    .await?;
            }
        }
        CommandType::DirMk => fileops::make_dir(&PathRequest::decode(payload)?.path).await?,
        CommandType::DirRm => fileops::remove_dir(&PathRequest::decode(payload)?.path).await?,
        CommandType::FileRm => fileops::remove_file(&PathRequest::decode(payload)?.path).await?,
        CommandType::DirCopy => {
            let req = PathPair::decode(payload)?;
            fileops::copy_dir(&req.src, &req.dst).await?
        }
        CommandType::DirMove => {
            let req = PathPair::decode(payload)?;
            fileops::move_dir(&req.src, &req.dst).await?
        }
        CommandType::FileCopy => {
            let req = PathPair::decode(payload)?;
            fileops::copy_file(&req.src, &req.dst).await?
        }
        CommandType::FileMove => {
            let req = PathPair::decode(payload)?;
            fileops::move_file(&req.src, &req.dst).await?
        }
        _ => return Ok(()),
    }
    outbound.ok(token).await?;
    Ok(())
}
