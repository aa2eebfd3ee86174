//! TCP server: accept loop and per-connection dispatch.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::error::StreamError;
use crate::header::{self, Header, HeaderError};
use crate::stateful::handle_stateful;
use crate::stateless::handle_stateless;
use crate::store::SessionStore;
use crate::stream::{self, StreamSettings};

/// Identifier for a TCP connection, used to correlate log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ConnectionId`].
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Pause after a failed `accept` before polling the listener again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Configuration for [`StreamServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to. Default: `127.0.0.1:8080`.
    pub bind_addr: SocketAddr,
    /// How long a session survives without a keepalive. Default: 30 s.
    pub idle_deadline: Duration,
    /// Tick and per-connection I/O deadline.
    pub stream: StreamSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
            idle_deadline: Duration::from_secs(30),
            stream: StreamSettings::default(),
        }
    }
}

/// Accepts connections and streams sequences to them.
pub struct StreamServer {
    config: ServerConfig,
    /// Session store shared by every connection (public for test inspection).
    pub store: Arc<SessionStore>,
    id_gen: IdGenerator,
    active: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl StreamServer {
    /// Create a new server. Must be called within a tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store: Arc::new(SessionStore::new(config.idle_deadline)),
            id_gen: IdGenerator::new(),
            active: Arc::new(AtomicUsize::new(0)),
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Bind to the configured address and run the accept loop.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("Listening on {}", listener.local_addr()?);
        self.run_with_listener(listener).await
    }

    /// Run the accept loop with a pre-bound listener (useful for tests).
    pub async fn run_with_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            Self::pause_after_accept_error(&e).await;
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("Could not set TCP_NODELAY for {peer_addr}: {e}");
                    }

                    let id = self.id_gen.next_id();
                    tracing::info!("Accepted connection {id:?} from {peer_addr}");

                    let store = Arc::clone(&self.store);
                    let settings = self.config.stream;
                    let active = Arc::clone(&self.active);
                    let mut task_shutdown = self.shutdown_rx.clone();
                    active.fetch_add(1, Ordering::Relaxed);

                    tokio::spawn(async move {
                        let mut stream = stream;
                        tokio::select! {
                            result = Self::handle_connection(&mut stream, &store, &settings) => {
                                Self::log_result(id, result);
                            }
                            _ = Self::stop_requested(&mut task_shutdown) => {
                                tracing::debug!("Connection {id:?} interrupted by shutdown");
                            }
                        }
                        let _ = stream.shutdown().await;
                        active.fetch_sub(1, Ordering::Relaxed);
                        tracing::info!("Connection {id:?} closed");
                    });
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Signal the server and every connection task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Number of connection tasks still running.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Read the header and hand the connection to the matching stream.
    async fn handle_connection(
        conn: &mut TcpStream,
        store: &SessionStore,
        settings: &StreamSettings,
    ) -> Result<(), StreamError> {
        let header = match header::read_header(conn, settings.io_deadline).await {
            Ok(header) => header,
            Err(e) => {
                if Self::should_echo(&e) {
                    let _ = stream::write_line(conn, &format!("error: {e}"), settings.io_deadline)
                        .await;
                }
                return Err(e.into());
            }
        };

        match header {
            Header::Stateful(params) => {
                tracing::debug!(
                    "Stateful request: id={}, n={}, m={}",
                    params.id,
                    params.length,
                    params.resume_from
                );
                let outcome = handle_stateful(conn, store, params, settings).await?;
                tracing::debug!("Stateful stream delivered {} values", outcome.delivered);
            }
            Header::Stateless(params) => {
                tracing::debug!(
                    "Stateless request: a={}, n={}, m={}",
                    params.initial,
                    params.count,
                    params.shift
                );
                let outcome = handle_stateless(conn, params, settings).await?;
                tracing::debug!(
                    "Stateless stream delivered {} values (a={})",
                    outcome.delivered,
                    outcome.initial
                );
            }
        }
        Ok(())
    }

    async fn pause_after_accept_error(error: &std::io::Error) {
        tracing::warn!("Accept failed: {error}; retrying in {ACCEPT_RETRY_DELAY:?}");
        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
    }

    /// Resolves once shutdown is signalled or the server is gone.
    async fn stop_requested(shutdown_rx: &mut watch::Receiver<bool>) {
        while !*shutdown_rx.borrow_and_update() {
            if shutdown_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Validation failures are reported to the client; transport failures
    /// have nobody to report to.
    fn should_echo(error: &HeaderError) -> bool {
        !matches!(
            error,
            HeaderError::ConnectionClosed | HeaderError::Timeout | HeaderError::Io(_)
        )
    }

    fn log_result(id: ConnectionId, result: Result<(), StreamError>) {
        match result {
            Ok(()) => tracing::debug!("Connection {id:?} finished its stream"),
            Err(e) if e.is_client_gone() => tracing::debug!("Connection {id:?} client gone: {e}"),
            Err(e) => tracing::warn!("Connection {id:?} aborted: {e}"),
        }
    }
}
