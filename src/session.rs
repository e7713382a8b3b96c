//! Per-tunnel session state.
//!
//! A [`Session`] represents one connected client. Many public requests may be
//! in flight over the one socket at a time; each is assigned a fresh request
//! id, parked in the `pending` table, and woken by the session's reader task
//! when the matching response frame arrives. Responses may come back in any
//! order.
//!
//! Socket writes are serialized through a bounded channel drained by a single
//! writer task (owned by the upgrade handler in [`crate::relay`]), so no two
//! callers ever interleave frames on the wire.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

use crate::protocol::{self, Frame, RequestFrame, ResponseFrame};
use crate::registry::TunnelRegistry;

/// Outbound traffic for the session's writer task.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// An encoded text frame.
    Frame(String),
    /// Close the socket with the given code and reason, then stop.
    Close { code: u16, reason: String },
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet in the registry.
    Registering,
    /// Registered and relaying requests.
    Active,
    /// Tearing down; in-flight waiters are being failed.
    Draining,
    /// Fully torn down. `pending` is empty and stays empty.
    Closed,
}

/// Why a session left the Active state.
#[derive(Debug, Clone)]
pub enum CloseCause {
    /// The peer sent a frame the codec rejects, or one it may not send.
    ProtocolError,
    /// The peer closed the socket.
    PeerClosed,
    /// Transport failure.
    Io(String),
    /// Server-driven shutdown.
    Shutdown,
}

impl CloseCause {
    fn close_code(&self) -> u16 {
        match self {
            Self::ProtocolError => 1002,
            _ => 1000,
        }
    }
}

impl std::fmt::Display for CloseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProtocolError => write!(f, "protocol error"),
            Self::PeerClosed => write!(f, "peer closed"),
            Self::Io(detail) => write!(f, "transport error: {detail}"),
            Self::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// Why a dispatched request produced no response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// The deadline elapsed before the client answered. Any late response is
    /// discarded.
    UpstreamTimeout,
    /// The session closed before or while the request was in flight.
    TunnelClosed,
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpstreamTimeout => write!(f, "upstream timeout"),
            Self::TunnelClosed => write!(f, "tunnel closed"),
        }
    }
}

impl std::error::Error for DispatchError {}

struct Inner {
    state: SessionState,
    pending: HashMap<Uuid, oneshot::Sender<ResponseFrame>>,
    closed_cause: Option<CloseCause>,
}

/// One connected tunnel client.
pub struct Session {
    conn_id: Uuid,
    outbound: mpsc::Sender<Outbound>,
    inner: Mutex<Inner>,
    registry: Arc<TunnelRegistry>,
}

impl Session {
    pub(crate) fn new(
        conn_id: Uuid,
        outbound: mpsc::Sender<Outbound>,
        registry: Arc<TunnelRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            conn_id,
            outbound,
            inner: Mutex::new(Inner {
                state: SessionState::Registering,
                pending: HashMap::new(),
                closed_cause: None,
            }),
            registry,
        })
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().expect("session lock").state
    }

    /// Number of in-flight requests awaiting a response.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().expect("session lock").pending.len()
    }

    /// Why the session closed, once it has.
    pub fn closed_cause(&self) -> Option<CloseCause> {
        self.inner.lock().expect("session lock").closed_cause.clone()
    }

    pub(crate) fn mark_active(&self) {
        self.inner.lock().expect("session lock").state = SessionState::Active;
    }

    /// Forward one public request over the tunnel and await its response.
    ///
    /// The waiter is removed from `pending` on every exit path, including
    /// cancellation of the returned future (public caller disconnect).
    pub async fn dispatch(
        &self,
        method: String,
        path: String,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        deadline: Duration,
    ) -> Result<ResponseFrame, DispatchError> {
        let (request_id, rx) = {
            let mut inner = self.inner.lock().expect("session lock");
            if inner.state != SessionState::Active {
                return Err(DispatchError::TunnelClosed);
            }
            let request_id = Uuid::new_v4();
            let (tx, rx) = oneshot::channel();
            inner.pending.insert(request_id, tx);
            (request_id, rx)
        };
        let _guard = PendingGuard {
            session: self,
            request_id,
        };

        let frame = protocol::encode(&Frame::Request(RequestFrame {
            request_id,
            method,
            path,
            headers,
            body,
        }));
        if self.outbound.send(Outbound::Frame(frame)).await.is_err() {
            self.drain(CloseCause::Io("tunnel writer stopped".into()));
            return Err(DispatchError::TunnelClosed);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped: the session drained while we waited.
            Ok(Err(_)) => Err(DispatchError::TunnelClosed),
            Err(_) => Err(DispatchError::UpstreamTimeout),
        }
    }

    /// Hand an inbound response to its waiter. A miss means the waiter timed
    /// out or the caller went away; the response is discarded.
    pub(crate) fn deliver(&self, response: ResponseFrame) {
        let waiter = {
            let mut inner = self.inner.lock().expect("session lock");
            inner.pending.remove(&response.request_id)
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => {
                debug!(
                    conn_id = %self.conn_id,
                    request_id = %response.request_id,
                    "discarding response with no waiter"
                );
            }
        }
    }

    /// Tear the session down: fail every in-flight waiter, close the socket,
    /// and leave the registry. Idempotent; the first cause wins.
    pub fn drain(&self, cause: CloseCause) {
        let failed = {
            let mut inner = self.inner.lock().expect("session lock");
            if inner.state == SessionState::Closed {
                return;
            }
            inner.state = SessionState::Draining;
            // Dropping the senders fails each waiter with TunnelClosed.
            let pending = std::mem::take(&mut inner.pending);
            inner.state = SessionState::Closed;
            inner.closed_cause = Some(cause.clone());
            pending.len()
        };
        let _ = self.outbound.try_send(Outbound::Close {
            code: cause.close_code(),
            reason: cause.to_string(),
        });
        self.registry.unregister(self.conn_id, self);
        if failed > 0 {
            info!(conn_id = %self.conn_id, failed, "failed in-flight requests: {cause}");
        }
    }
}

/// Removes the pending entry when the dispatch future exits, however it
/// exits. On the success path the reader has already removed it and the
/// second removal is a no-op.
struct PendingGuard<'a> {
    session: &'a Session,
    request_id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.session.inner.lock() {
            inner.pending.remove(&self.request_id);
        }
    }
}
