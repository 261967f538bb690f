//! Hubwire Client
//!
//! Connects to a Hubwire server and exchanges messages over a single
//! connection.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

use super::connection::{
    drive, CloseReason, Connection, ConnectionError, HandlerResult, HandlerTable,
};
use super::transport::{self, PeerAddr, TransportKind};
use super::NetworkConfig;
use crate::protocol::Payload;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Client is closed")]
    Closed,

    #[error("Connection timeout")]
    Timeout,

    #[error("Server closed the connection")]
    ServerClosed,

    #[error("Connection failed: {0}")]
    Failed(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Client state
///
/// `Closed` is terminal; construct a new client to reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Active,
    Closed,
}

/// Hubwire Client
pub struct Client {
    /// Client configuration
    config: NetworkConfig,
    /// Handlers shared with the connection once it exists
    handlers: HandlerTable,
    /// Current state
    state: Arc<RwLock<ClientState>>,
    /// The connection to the server, once established
    connection: RwLock<Option<Connection>>,
}

impl Client {
    /// Create a new client
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            handlers: HandlerTable::new(),
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
            connection: RwLock::new(None),
        }
    }

    /// Register (or replace) the handler for `message_type`
    ///
    /// May be called before or after `connect`.
    pub fn handle<F>(&self, message_type: impl Into<String>, handler: F)
    where
        F: Fn(Payload) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers.handle(message_type, handler);
    }

    /// Register a handler that receives the payload decoded as `T`
    pub fn on<T, F>(&self, message_type: impl Into<String>, handler: F)
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers.on(message_type, handler);
    }

    /// Register the handler invoked when the connection ends
    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn(String) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers.on_disconnect(handler);
    }

    /// Connect to a server
    ///
    /// On success the receive loop is running and the client is `Active`.
    /// On failure the client returns to `Disconnected`.
    pub async fn connect(&self, address: &str, kind: TransportKind) -> ClientResult<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                ClientState::Disconnected => *state = ClientState::Connecting,
                ClientState::Connecting | ClientState::Active => {
                    return Err(ClientError::AlreadyConnected)
                }
                ClientState::Closed => return Err(ClientError::Closed),
            }
        }

        tracing::info!("Connecting to {} over {}", address, kind);

        let (stream, remote_addr) = match tokio::time::timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            transport::connect(kind, address),
        )
        .await
        {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                self.reset_if_connecting().await;
                return Err(ClientError::Io(e));
            }
            Err(_) => {
                self.reset_if_connecting().await;
                return Err(ClientError::Timeout);
            }
        };

        let (connection, driver) =
            Connection::new(stream, remote_addr.clone(), self.handlers.clone(), &self.config);

        {
            let mut state = self.state.write().await;
            if *state != ClientState::Connecting {
                // close() won the race; the stream is dropped unused.
                return Err(ClientError::Closed);
            }
            *self.connection.write().await = Some(connection);
            *state = ClientState::Active;
        }

        tracing::info!("Connected to {}", remote_addr);

        let state = self.state.clone();
        tokio::spawn(drive(driver, move |_| async move {
            *state.write().await = ClientState::Closed;
        }));

        Ok(())
    }

    /// Connect to a server by hostname over TCP
    pub async fn connect_hostname(&self, hostname: &str, port: u16) -> ClientResult<()> {
        let addr = transport::resolve_host(hostname, port).await?;
        self.connect(&addr.to_string(), TransportKind::Tcp).await
    }

    /// Wait for the connection to end and report why
    ///
    /// `Ok(())` after a local `close()`; otherwise the terminal cause.
    pub async fn wait(&self) -> ClientResult<()> {
        let connection = self
            .connection
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)?;

        match connection.closed().await {
            CloseReason::Local => Ok(()),
            CloseReason::PeerClosed => Err(ClientError::ServerClosed),
            CloseReason::Failed(e) => Err(ClientError::Failed(e)),
        }
    }

    /// Close the connection and wait until it is torn down
    ///
    /// Safe to call from any task and more than once. The client ends up
    /// `Closed` either way.
    pub async fn close(&self) {
        let connection = {
            let mut state = self.state.write().await;
            *state = ClientState::Closed;
            self.connection.read().await.clone()
        };

        if let Some(connection) = connection {
            connection.close();
            connection.closed().await;
        }
    }

    /// Send a value to the server
    pub async fn send<T: Serialize + ?Sized>(&self, message_type: &str, value: &T) -> ClientResult<()> {
        self.send_payload(message_type, Payload::encode(value).map_err(ConnectionError::from)?)
            .await
    }

    /// Send a pre-built payload to the server
    pub async fn send_payload(&self, message_type: &str, payload: Payload) -> ClientResult<()> {
        let connection = self.active_connection().await?;
        connection.send_payload(message_type, payload)?;
        Ok(())
    }

    /// The connection handle, while active
    pub async fn connection(&self) -> Option<Connection> {
        self.active_connection().await.ok()
    }

    /// Get the current state
    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    /// Check if connected
    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ClientState::Active
    }

    /// Address of the server, once connected
    pub async fn remote_addr(&self) -> Option<PeerAddr> {
        self.connection
            .read()
            .await
            .as_ref()
            .map(|c| c.remote_addr().clone())
    }

    async fn active_connection(&self) -> ClientResult<Connection> {
        if *self.state.read().await != ClientState::Active {
            return Err(ClientError::NotConnected);
        }
        match &*self.connection.read().await {
            Some(connection) if !connection.is_closed() => Ok(connection.clone()),
            _ => Err(ClientError::NotConnected),
        }
    }

    async fn reset_if_connecting(&self) {
        let mut state = self.state.write().await;
        if *state == ClientState::Connecting {
            *state = ClientState::Disconnected;
        }
    }
}
