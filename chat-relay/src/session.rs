use std::{
    fmt,
    io,
    net::SocketAddr,
    sync::{Arc, OnceLock},
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    select,
    sync::{Mutex, MutexGuard, mpsc, watch},
};
use tracing::{debug, warn};

use crate::{
    envelope::{Envelope, UserStatus, write_envelope},
    rooms::Room,
};

pub type SessionId = u64;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Why a session ended. Only the first reason given to [`Session::close`] sticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Quit,
    PeerClosed,
    ReadError,
    IdleTimeout,
    Overflow,
    Evicted,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::Quit => "quit",
            CloseReason::PeerClosed => "peer closed the connection",
            CloseReason::ReadError => "read error",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::Overflow => "outbound queue overflow",
            CloseReason::Evicted => "logged in elsewhere",
            CloseReason::Shutdown => "server shutdown",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Default)]
pub struct SessionState {
    pub username: String,
    pub authenticated: bool,
    pub current_room: Option<Arc<Room>>,
    pub status: UserStatus,
}

/// Server-side half of one client connection.
///
/// The reader loop owns inbound traffic; everything else talks to the client
/// through [`Session::send`], which never waits on a slow peer.
pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    state: Mutex<SessionState>,
    outbound: mpsc::Sender<Arc<Envelope>>,
    close_reason: OnceLock<CloseReason>,
    closed: watch::Sender<bool>,
}

/// Receiving end of a session's outbound queue, consumed by [`run_writer`].
pub struct Outbox {
    queue: mpsc::Receiver<Arc<Envelope>>,
    closed: watch::Receiver<bool>,
}

impl Session {
    pub fn new(id: SessionId, peer: Option<SocketAddr>, capacity: usize) -> (Arc<Self>, Outbox) {
        let (outbound, queue) = mpsc::channel(capacity.max(1));
        let (closed, closed_rx) = watch::channel(false);
        let session = Arc::new(Self {
            id,
            peer,
            state: Mutex::new(SessionState::default()),
            outbound,
            close_reason: OnceLock::new(),
            closed,
        });
        (
            session,
            Outbox {
                queue,
                closed: closed_rx,
            },
        )
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub async fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    /// Username if the session has logged in.
    pub async fn username(&self) -> Option<String> {
        let state = self.state.lock().await;
        state.authenticated.then(|| state.username.clone())
    }

    /// Queues `envelope` without waiting. A full queue closes the session
    /// instead of blocking the caller.
    pub fn send(&self, envelope: impl Into<Arc<Envelope>>) -> bool {
        if self.is_closed() {
            return false;
        }

        match self.outbound.try_send(envelope.into()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session = self.id, peer = ?self.peer, "outbound queue full, disconnecting");
                self.close(CloseReason::Overflow);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close(CloseReason::PeerClosed);
                false
            }
        }
    }

    /// Marks the session closed. Returns `true` only for the call that
    /// actually closed it; later calls are no-ops.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.close_reason.set(reason).is_err() {
            return false;
        }
        debug!(session = self.id, %reason, "closing session");
        self.closed.send_replace(true);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason.get().is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    pub fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("close_reason", &self.close_reason.get())
            .finish()
    }
}

/// Resolves once the watched session has been closed.
pub async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Drains the outbound queue onto `writer` until the session closes.
///
/// Anything already queued at close time is still flushed, except after an
/// overflow, where the peer is known not to keep up.
pub async fn run_writer<W>(mut writer: W, mut outbox: Outbox, session: Arc<Session>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        select! {
            biased;
            _ = wait_closed(&mut outbox.closed) => {
                if session.close_reason() != Some(CloseReason::Overflow) {
                    while let Ok(envelope) = outbox.queue.try_recv() {
                        write_envelope(&mut writer, &envelope).await?;
                    }
                }
                break;
            }
            next = outbox.queue.recv() => match next {
                Some(envelope) => write_envelope(&mut writer, &envelope).await?,
                None => break,
            },
        }
    }

    writer.shutdown().await
}
