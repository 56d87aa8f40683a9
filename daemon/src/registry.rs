//! Token-keyed session state of one controller connection
//!
//! Owned by the connection's dispatcher; nothing else mutates it, so plain
//! maps are enough.

use crate::auth::{AuthProvider, AuthSession, SharedAuthSession};
use crate::fileops::OpenFile;
use crate::metrics;
use crate::session::{ClientSession, ServerSession};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use wsrelay_protocol::Token;

/// A CONNECT whose connect/bind is still running
#[derive(Debug)]
pub struct Pending {
    pub id: u64,
    pub cancel: CancellationToken,
}

#[derive(Default)]
pub struct SessionRegistry {
    clients: HashMap<Token, ClientSession>,
    servers: HashMap<Token, ServerSession>,
    pending: HashMap<Token, Pending>,
    auth: HashMap<Token, SharedAuthSession>,
    files: HashMap<Token, OpenFile>,
    next_id: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a socket session (established or pending) holds `token`
    pub fn is_occupied(&self, token: &Token) -> bool {
        self.clients.contains_key(token)
            || self.servers.contains_key(token)
            || self.pending.contains_key(token)
    }

    /// Reserve `token` for a CONNECT in flight; returns the session id
    pub fn reserve(&mut self, token: Token, cancel: CancellationToken) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.pending.insert(token, Pending { id, cancel });
        id
    }

    /// Claim the reservation made for session `id`
    pub fn take_pending(&mut self, token: &Token, id: u64) -> Option<Pending> {
        match self.pending.get(token) {
            Some(pending) if pending.id == id => self.pending.remove(token),
            _ => None,
        }
    }

    /// Abort a CONNECT in flight
    pub fn cancel_pending(&mut self, token: &Token) -> bool {
        match self.pending.remove(token) {
            Some(pending) => {
                pending.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn insert_client(&mut self, token: Token, session: ClientSession) {
        trace!("[{}] Registered client session {}", token, session.id());
        if let Some(mut old) = self.clients.insert(token, session) {
            old.stop();
        } else {
            metrics::with(|m| m.active_sessions.inc());
        }
        metrics::with(|m| m.sessions_opened.inc());
    }

    pub fn insert_server(&mut self, token: Token, session: ServerSession) {
        trace!("[{}] Registered server session {}", token, session.id());
        if let Some(mut old) = self.servers.insert(token, session) {
            old.stop();
        } else {
            metrics::with(|m| m.active_sessions.inc());
        }
        metrics::with(|m| m.sessions_opened.inc());
    }

    pub fn client_mut(&mut self, token: &Token) -> Option<&mut ClientSession> {
        self.clients.get_mut(token)
    }

    pub fn server_mut(&mut self, token: &Token) -> Option<&mut ServerSession> {
        self.servers.get_mut(token)
    }

    /// Stop and remove the client session under `token`
    pub fn remove_client(&mut self, token: &Token) -> Option<ClientSession> {
        let mut session = self.clients.remove(token)?;
        session.stop();
        metrics::with(|m| m.active_sessions.dec());
        Some(session)
    }

    /// Remove only if the registered session is still `id`
    pub fn remove_client_if(&mut self, token: &Token, id: u64) -> bool {
        match self.clients.get(token) {
            Some(session) if session.id() == id => self.remove_client(token).is_some(),
            _ => false,
        }
    }

    pub fn remove_server(&mut self, token: &Token) -> Option<ServerSession> {
        let mut session = self.servers.remove(token)?;
        session.stop();
        metrics::with(|m| m.active_sessions.dec());
        Some(session)
    }

    pub fn remove_server_if(&mut self, token: &Token, id: u64) -> bool {
        match self.servers.get(token) {
            Some(session) if session.id() == id => self.remove_server(token).is_some(),
            _ => false,
        }
    }

    pub fn auth_session(&self, token: &Token) -> Option<SharedAuthSession> {
        self.auth.get(token).cloned()
    }

    pub fn auth_session_or_insert(&mut self, token: Token, provider: &dyn AuthProvider) -> SharedAuthSession {
        self.auth
            .entry(token)
            .or_insert_with(|| Arc::new(Mutex::new(AuthSession::new(provider))))
            .clone()
    }

    /// Register an open file; hands it back if the token already has one
    pub fn insert_file(&mut self, token: Token, file: OpenFile) -> Result<(), OpenFile> {
        if self.files.contains_key(&token) {
            return Err(file);
        }
        self.files.insert(token, file);
        Ok(())
    }

    pub fn has_file(&self, token: &Token) -> bool {
        self.files.contains_key(token)
    }

    pub fn file_mut(&mut self, token: &Token) -> Option<&mut OpenFile> {
        self.files.get_mut(token)
    }

    pub fn remove_file(&mut self, token: &Token) -> Option<OpenFile> {
        self.files.remove(token)
    }

    /// Socket sessions currently registered
    pub fn session_count(&self) -> usize {
        self.clients.len() + self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
            && self.servers.is_empty()
            && self.pending.is_empty()
            && self.auth.is_empty()
            && self.files.is_empty()
    }

    /// Stop everything and forget every token
    pub fn clear(&mut self) {
        let sessions = self.session_count() as i64;
        for (_, mut session) in self.clients.drain() {
            session.stop();
        }
        for (_, mut session) in self.servers.drain() {
            session.stop();
        }
        for (_, pending) in self.pending.drain() {
            pending.cancel.cancel();
        }
        self.auth.clear();
        self.files.clear();
        metrics::with(|m| m.active_sessions.sub(sessions));
    }
}
