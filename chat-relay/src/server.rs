use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, BufReader},
    net::{TcpListener, TcpStream},
    select,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    auth::MemoryCredentials,
    config::RelayConfig,
    directory::Directory,
    envelope::{decode, read_frame},
    history::{HistoryStore, JsonFileHistory, MemoryHistory},
    rooms::RoomHub,
    router::Router,
    session::{CloseReason, Session, SessionId, run_writer, wait_closed},
    storage::DiskFileStore,
};

pub struct Relay {
    listener: TcpListener,
    router: Arc<Router>,
    config: RelayConfig,
}

impl Relay {
    pub fn new(listener: TcpListener, router: Router, config: RelayConfig) -> Self {
        Self {
            listener,
            router: Arc::new(router),
            config,
        }
    }

    /// Binds `config.listen` and wires up the default collaborators:
    /// in-memory credentials, history per `history_dir`, and uploads on disk.
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        let router = default_router(&config);
        Ok(Self::new(listener, router, config))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            listener,
            router,
            config,
        } = self;
        let config = Arc::new(config);
        let next_id = AtomicU64::new(1);
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    router.shutdown().await;
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            let id = next_id.fetch_add(1, Ordering::Relaxed);
                            spawn_connection(stream, peer, id, &router, &config);
                        }
                        Err(err) => warn!(error = ?err, "failed to accept connection"),
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

pub fn default_router(config: &RelayConfig) -> Router {
    let history: Arc<dyn HistoryStore> = match &config.history_dir {
        Some(dir) => Arc::new(JsonFileHistory::new(dir)),
        None => Arc::new(MemoryHistory::default()),
    };
    Router::new(
        Arc::new(RoomHub::with_rooms(config.default_rooms.iter().cloned())),
        Arc::new(Directory::default()),
        Arc::new(MemoryCredentials::default()),
        history,
        Arc::new(DiskFileStore::new(&config.uploads_dir)),
    )
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    id: SessionId,
    router: &Arc<Router>,
    config: &Arc<RelayConfig>,
) {
    let router = Arc::clone(router);
    let config = Arc::clone(config);
    tokio::spawn(async move {
        handle_connection(stream, peer, id, router, config).await;
    });
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    id: SessionId,
    router: Arc<Router>,
    config: Arc<RelayConfig>,
) {
    let (reader, writer) = stream.into_split();
    let (session, outbox) = Session::new(id, Some(peer), config.queue_capacity);
    router.connect(&session).await;

    let mut writer_task = tokio::spawn(run_writer(writer, outbox, Arc::clone(&session)));

    let mut reader = BufReader::new(reader);
    let reason = read_loop(&mut reader, &session, &router, config.idle_timeout).await;
    router.disconnect(&session, reason).await;

    match timeout(config.writer_linger, &mut writer_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => debug!(session = id, error = ?err, "writer ended with error"),
        Ok(Err(err)) => warn!(session = id, error = ?err, "writer task failed"),
        Err(_) => {
            debug!(session = id, "writer did not drain in time, aborting");
            writer_task.abort();
        }
    }
}

/// Decodes one envelope per line and routes it until the peer goes away,
/// the session is closed elsewhere, or the connection idles out.
async fn read_loop<R>(
    reader: &mut R,
    session: &Arc<Session>,
    router: &Router,
    idle_timeout: Duration,
) -> CloseReason
where
    R: AsyncBufRead + Unpin,
{
    let mut closed = session.subscribe_closed();
    let mut line = String::new();

    loop {
        let next = select! {
            biased;
            _ = wait_closed(&mut closed) => {
                return session.close_reason().unwrap_or(CloseReason::Shutdown);
            }
            next = timeout(idle_timeout, read_frame(reader, &mut line)) => next,
        };

        match next {
            Err(_) => {
                info!(session = session.id(), "connection idle, closing");
                return CloseReason::IdleTimeout;
            }
            Ok(Err(err)) => {
                debug!(session = session.id(), error = ?err, "read failed");
                return CloseReason::ReadError;
            }
            Ok(Ok(false)) => return CloseReason::PeerClosed,
            Ok(Ok(true)) => {
                let decoded = decode(&line);
                line.clear();
                match decoded {
                    Ok(envelope) => router.route(session, envelope).await,
                    Err(err) => {
                        warn!(session = session.id(), error = %err, "discarding malformed envelope");
                    }
                }
            }
        }
    }
}
