//! Per-session write queues
//!
//! Socket writes never run on the dispatcher. Each writing side owns a bounded
//! queue drained by its own writer task, so a peer that stops reading only
//! backs up its own queue.

use super::SessionError;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use wsrelay_protocol::Endpoint;

/// Sending half of a session's write queue
#[derive(Debug)]
pub(crate) struct WriteQueue<T> {
    tx: mpsc::Sender<T>,
}

impl<T> WriteQueue<T> {
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue without waiting; a full or closed queue is a send failure
    pub(crate) fn push(&self, item: T) -> Result<(), SessionError> {
        self.tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => SessionError::Backlog,
            TrySendError::Closed(_) => SessionError::Stopped,
        })
    }
}

/// One queued UDP datagram; `None` targets the session's default remote
#[derive(Debug)]
pub(crate) struct Datagram {
    pub target: Option<Endpoint>,
    pub data: Bytes,
}
