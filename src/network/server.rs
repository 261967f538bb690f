//! Hubwire Server
//!
//! The server accepts streams, gives each one a fresh [`ConnectionId`],
//! lets the application register handlers through the accept callback,
//! and only then makes the connection reachable through the registry.

use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::connection::{drive, CloseReason, Connection, ConnectionError, HandlerTable};
use super::registry::{ConnectionId, Registry};
use super::transport::{self, BoxedStream, Listener, PeerAddr, TransportKind};
use super::NetworkConfig;
use crate::protocol::Payload;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Server has been stopped")]
    Stopped,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Callback run for every admitted connection before it becomes reachable
pub type AcceptHandler = Arc<dyn Fn(&Connection, ConnectionId) + Send + Sync>;

/// Server lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Listening,
    ShuttingDown,
    Stopped,
}

/// Hubwire Server
pub struct Server {
    /// Server configuration
    config: NetworkConfig,
    /// Admitted connections by identity
    registry: Registry,
    /// Application admission callback
    on_accept: Option<AcceptHandler>,
    /// Lifecycle state
    state: Arc<RwLock<ServerState>>,
    /// Address the listener is bound to
    local_addr: Arc<RwLock<Option<PeerAddr>>>,
    /// Shutdown signal for the accept loop
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    /// The accept loop task
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Create a new server
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            registry: Registry::new(),
            on_accept: None,
            state: Arc::new(RwLock::new(ServerState::Created)),
            local_addr: Arc::new(RwLock::new(None)),
            shutdown_tx: Mutex::new(None),
            accept_task: Mutex::new(None),
        }
    }

    /// Set the callback run for each new connection
    ///
    /// The callback runs before the connection is registered and before its
    /// first message is read, so handlers it registers never miss a message.
    pub fn on_accept<F>(&mut self, handler: F)
    where
        F: Fn(&Connection, ConnectionId) + Send + Sync + 'static,
    {
        self.on_accept = Some(Arc::new(handler));
    }

    /// Listen for TCP connections on `port` of the configured bind address
    pub async fn listen(&self, port: u16) -> ServerResult<PeerAddr> {
        let address = format!("{}:{}", self.config.bind_address, port);
        self.listen_on(TransportKind::Tcp, &address).await
    }

    /// Listen on any supported transport
    ///
    /// Returns the bound address once the accept loop is running. A bind
    /// failure is returned here and leaves the server in `Created`.
    pub async fn listen_on(&self, kind: TransportKind, address: &str) -> ServerResult<PeerAddr> {
        let mut state = self.state.write().await;
        match *state {
            ServerState::Created => {}
            ServerState::Listening | ServerState::ShuttingDown => {
                return Err(ServerError::AlreadyRunning)
            }
            ServerState::Stopped => return Err(ServerError::Stopped),
        }

        let listener = transport::bind(kind, address).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {} ({}): {}", address, kind, e))
        })?;

        let local_addr = listener.local_addr()?;
        tracing::info!("Server listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.lock().await = Some(shutdown_tx);
        *self.local_addr.write().await = Some(local_addr.clone());

        let admission = Admission {
            config: self.config.clone(),
            registry: self.registry.clone(),
            on_accept: self.on_accept.clone(),
        };
        let task = tokio::spawn(accept_loop(
            listener,
            admission,
            shutdown_rx,
            self.state.clone(),
        ));
        *self.accept_task.lock().await = Some(task);

        *state = ServerState::Listening;
        Ok(local_addr)
    }

    /// Stop accepting, disconnect every connection, and wait for teardown
    pub async fn shutdown(&self) -> ServerResult<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                ServerState::Listening => *state = ServerState::ShuttingDown,
                ServerState::Created => {
                    *state = ServerState::Stopped;
                    return Ok(());
                }
                ServerState::ShuttingDown | ServerState::Stopped => {
                    return Err(ServerError::NotRunning)
                }
            }
        }

        tracing::info!("Server shutdown requested");

        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(()).await;
        }

        if let Some(task) = self.accept_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::error!("Accept loop ended abnormally: {}", e);
            }
        }

        disconnect_all(&self.registry).await;

        *self.state.write().await = ServerState::Stopped;
        tracing::info!("Server stopped");
        Ok(())
    }

    /// Send a value to one connection
    ///
    /// Returns `Ok(false)` when the identity is not (or no longer) present;
    /// a peer that has already gone is not an error.
    pub async fn send_to<T: Serialize + ?Sized>(
        &self,
        id: &ConnectionId,
        message_type: &str,
        value: &T,
    ) -> ServerResult<bool> {
        self.send_payload_to(id, message_type, Payload::encode(value).map_err(ConnectionError::from)?)
            .await
    }

    /// Send a pre-built payload to one connection
    pub async fn send_payload_to(
        &self,
        id: &ConnectionId,
        message_type: &str,
        payload: Payload,
    ) -> ServerResult<bool> {
        let Some(connection) = self.registry.get(id).await else {
            tracing::trace!("Dropping '{}' for {}: not connected", message_type, id);
            return Ok(false);
        };

        match connection.send_payload(message_type, payload) {
            Ok(()) => Ok(true),
            Err(ConnectionError::Closed) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Disconnect one connection and wait for its teardown
    ///
    /// Returns whether the identity was present. Calling it again, or after
    /// the peer already dropped, is a no-op.
    pub async fn disconnect(&self, id: &ConnectionId) -> bool {
        let Some(connection) = self.registry.get(id).await else {
            return false;
        };

        connection.close();
        self.registry.remove(id).await;
        connection.closed().await;
        true
    }

    /// Look up a connection by identity
    pub async fn connection(&self, id: &ConnectionId) -> Option<Connection> {
        self.registry.get(id).await
    }

    /// Identities of the currently admitted connections
    pub async fn connection_ids(&self) -> Vec<ConnectionId> {
        self.registry.ids().await
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.len().await
    }

    /// Get the current state
    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// Check if the server is running
    pub async fn is_running(&self) -> bool {
        *self.state.read().await == ServerState::Listening
    }

    /// The bound address, once listening
    pub async fn local_addr(&self) -> Option<PeerAddr> {
        self.local_addr.read().await.clone()
    }
}

/// Everything the accept loop needs to admit a stream
struct Admission {
    config: NetworkConfig,
    registry: Registry,
    on_accept: Option<AcceptHandler>,
}

impl Admission {
    async fn admit(&self, stream: BoxedStream, addr: PeerAddr) {
        let id = ConnectionId::new();
        let (connection, driver) =
            Connection::new(stream, addr.clone(), HandlerTable::new(), &self.config);

        if let Some(on_accept) = &self.on_accept {
            if catch_unwind(AssertUnwindSafe(|| on_accept(&connection, id))).is_err() {
                tracing::error!("Accept callback panicked for {}; dropping connection", addr);
                connection.finish(CloseReason::Failed("accept callback panicked".to_string()));
                return;
            }
        }

        if !self.registry.insert(id, connection.clone()).await {
            tracing::error!("Duplicate connection id {}; dropping connection", id);
            connection.finish(CloseReason::Failed("duplicate connection id".to_string()));
            return;
        }

        tracing::info!("Accepted connection {} from {}", id, addr);

        let registry = self.registry.clone();
        tokio::spawn(drive(driver, move |reason| async move {
            tracing::debug!("Retiring connection {}: {}", id, reason);
            registry.remove(&id).await;
        }));
    }
}

async fn accept_loop(
    mut listener: Box<dyn Listener>,
    admission: Admission,
    mut shutdown_rx: mpsc::Receiver<()>,
    state: Arc<RwLock<ServerState>>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                tracing::debug!("Accept loop stopping");
                return;
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => admission.admit(stream, addr).await,
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    // A failed accept is not retried: the whole server goes down.
    {
        let mut state = state.write().await;
        if *state != ServerState::Listening {
            return;
        }
        *state = ServerState::ShuttingDown;
    }

    drop(listener);
    disconnect_all(&admission.registry).await;
    *state.write().await = ServerState::Stopped;
    tracing::info!("Server stopped after accept failure");
}

/// Close every registered connection and wait until all are torn down
async fn disconnect_all(registry: &Registry) {
    let connections = registry.snapshot().await;

    for (_, connection) in &connections {
        connection.close();
    }
    for (id, _) in &connections {
        registry.remove(id).await;
    }
    for (id, connection) in &connections {
        let reason = connection.closed().await;
        tracing::debug!("Connection {} closed: {}", id, reason);
    }
}
