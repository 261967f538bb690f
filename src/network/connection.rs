//! Connection handling for Hubwire
//!
//! A [`Connection`] is the application's view of one peer:
//! - its handler table (type tag -> handler)
//! - an outbound queue drained by the connection's driver task
//! - close signalling and teardown status
//!
//! The stream itself is owned by a [`ConnectionDriver`]. Exactly one task
//! runs the driver, so writes to a stream are totally ordered and handler
//! invocations for one connection never overlap.

use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};

use super::transport::{BoxedStream, PeerAddr};
use super::NetworkConfig;
use crate::protocol::{
    CodecError, Decoder, Encoder, Envelope, Frame, Payload, DISCONNECT_MESSAGE_TYPE,
};

/// How long a locally closed connection may spend flushing queued envelopes
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("Outbound queue full")]
    QueueFull,

    #[error("Connection timeout")]
    Timeout,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Result returned by message handlers
pub type HandlerResult = anyhow::Result<()>;

/// A registered message handler
pub type MessageHandler = Arc<dyn Fn(Payload) -> HandlerResult + Send + Sync>;

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called on this side
    Local,
    /// The peer closed the stream cleanly
    PeerClosed,
    /// Transport or codec failure
    Failed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => write!(f, "Closed locally"),
            CloseReason::PeerClosed => write!(f, "Connection closed by peer"),
            CloseReason::Failed(e) => write!(f, "Error: {}", e),
        }
    }
}

/// Mapping from message type to handler
///
/// Registering a handler for a type that already has one silently replaces
/// it. There is one handler per type, never a list of subscribers.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: Arc<RwLock<HashMap<String, MessageHandler>>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `message_type`
    pub fn handle<F>(&self, message_type: impl Into<String>, handler: F)
    where
        F: Fn(Payload) -> HandlerResult + Send + Sync + 'static,
    {
        let message_type = message_type.into();
        let previous = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message_type.clone(), Arc::new(handler));

        if previous.is_some() {
            tracing::debug!("Replaced handler for message type '{}'", message_type);
        }
    }

    /// Register a handler that receives the payload decoded as `T`
    ///
    /// A payload that does not decode as `T` is reported like any other
    /// handler error.
    pub fn on<T, F>(&self, message_type: impl Into<String>, handler: F)
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> HandlerResult + Send + Sync + 'static,
    {
        self.handle(message_type, move |payload: Payload| {
            let value = payload.decode::<T>()?;
            handler(value)
        });
    }

    /// Register the handler invoked with the reason when the connection ends
    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn(String) -> HandlerResult + Send + Sync + 'static,
    {
        self.on::<String, _>(DISCONNECT_MESSAGE_TYPE, handler);
    }

    /// Remove the handler for `message_type`, returning whether one existed
    pub fn remove(&self, message_type: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(message_type)
            .is_some()
    }

    pub fn contains(&self, message_type: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(message_type)
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registered handler
    pub fn clear(&self) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Invoke the handler for the envelope's type
    ///
    /// Returns false if no handler is registered. Handler errors and panics
    /// are logged and swallowed so one faulty handler cannot stop the
    /// receive loop.
    pub(crate) fn dispatch(&self, envelope: Envelope) -> bool {
        let (message_type, payload) = envelope.into_parts();

        // Clone the handler out so the lock is not held while it runs.
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message_type)
            .cloned();

        let Some(handler) = handler else {
            tracing::trace!("No handler for message type '{}', dropping", message_type);
            return false;
        };

        match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("Handler for '{}' failed: {:#}", message_type, e);
            }
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!("Handler for '{}' panicked: {}", message_type, detail);
            }
        }

        true
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_set().entries(handlers.keys()).finish()
    }
}

/// Connection statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Envelopes sent
    pub messages_sent: u64,
    /// Envelopes received
    pub messages_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

#[derive(Default)]
struct StatsCounters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    remote_addr: PeerAddr,
    handlers: HandlerTable,
    outbound: mpsc::Sender<Envelope>,
    max_message_size: usize,
    closing: AtomicBool,
    shutdown: watch::Sender<bool>,
    status: watch::Sender<Option<CloseReason>>,
    stats: StatsCounters,
}

/// Handle to one peer connection
///
/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Shared>,
}

impl Connection {
    /// Wrap an established stream
    ///
    /// The returned driver owns the stream and must be run by exactly one
    /// task (see [`ConnectionDriver::run`]).
    pub fn new(
        stream: BoxedStream,
        remote_addr: PeerAddr,
        handlers: HandlerTable,
        config: &NetworkConfig,
    ) -> (Connection, ConnectionDriver) {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, _) = watch::channel(None);

        let connection = Connection {
            inner: Arc::new(Shared {
                remote_addr,
                handlers,
                outbound: outbound_tx,
                max_message_size: config.max_message_size,
                closing: AtomicBool::new(false),
                shutdown: shutdown_tx,
                status: status_tx,
                stats: StatsCounters::default(),
            }),
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let driver = ConnectionDriver {
            connection: connection.clone(),
            reader: FramedReader::new(read_half, config.max_message_size),
            writer: FramedWriter::new(write_half, config.max_message_size),
            outbound_rx,
            shutdown_rx,
        };

        (connection, driver)
    }

    /// Get the remote address
    pub fn remote_addr(&self) -> &PeerAddr {
        &self.inner.remote_addr
    }

    /// The connection's handler table
    pub fn handlers(&self) -> &HandlerTable {
        &self.inner.handlers
    }

    /// Register (or replace) the handler for `message_type`
    pub fn handle<F>(&self, message_type: impl Into<String>, handler: F)
    where
        F: Fn(Payload) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.handlers.handle(message_type, handler);
    }

    /// Register a handler that receives the payload decoded as `T`
    pub fn on<T, F>(&self, message_type: impl Into<String>, handler: F)
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.handlers.on(message_type, handler);
    }

    /// Register the handler invoked when this connection ends
    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn(String) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.handlers.on_disconnect(handler);
    }

    /// Send a value as a message of type `message_type`
    pub fn send<T: Serialize + ?Sized>(&self, message_type: &str, value: &T) -> ConnectionResult<()> {
        self.send_payload(message_type, Payload::encode(value)?)
    }

    /// Send a pre-built payload
    pub fn send_payload(&self, message_type: &str, payload: Payload) -> ConnectionResult<()> {
        self.send_envelope(Envelope::new(message_type, payload)?)
    }

    /// Queue an envelope for the driver to write
    ///
    /// Never waits: a peer that stopped reading fills its own queue and
    /// further sends fail with [`ConnectionError::QueueFull`].
    pub fn send_envelope(&self, envelope: Envelope) -> ConnectionResult<()> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        // Same measure the encoder applies to the frame body
        let size = bincode::serialized_size(&envelope).map_err(CodecError::from)? as usize;
        if size > self.inner.max_message_size {
            return Err(CodecError::MessageTooLarge(size, self.inner.max_message_size).into());
        }

        self.inner.outbound.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    /// Ask the driver to close the stream
    ///
    /// Returns immediately; await [`Connection::closed`] to observe the
    /// completed teardown.
    pub fn close(&self) {
        if !self.inner.closing.swap(true, Ordering::SeqCst) {
            tracing::debug!("Closing connection to {}", self.inner.remote_addr);
        }
        self.inner.shutdown.send_replace(true);
    }

    /// Wait until the connection is fully torn down
    pub async fn closed(&self) -> CloseReason {
        let mut status = self.inner.status.subscribe();
        loop {
            let current = status.borrow_and_update().clone();
            if let Some(reason) = current {
                return reason;
            }
            if status.changed().await.is_err() {
                return CloseReason::Local;
            }
        }
    }

    /// True once the connection is closing or closed; sends are refused
    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Why the connection ended, once teardown is complete
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.status.borrow().clone()
    }

    /// Get connection statistics
    pub fn stats(&self) -> ConnectionStats {
        self.inner.stats.snapshot()
    }

    /// Invoke the handler for an inbound envelope
    ///
    /// Frames carrying the reserved disconnect type are dropped; that notice
    /// is only ever raised locally by [`Connection::finish`].
    pub(crate) fn dispatch(&self, envelope: Envelope) -> bool {
        if envelope.message_type() == DISCONNECT_MESSAGE_TYPE {
            tracing::debug!(
                "Ignoring reserved '{}' frame from {}",
                DISCONNECT_MESSAGE_TYPE,
                self.inner.remote_addr
            );
            return false;
        }
        if self.is_closed() {
            tracing::trace!(
                "Dropping '{}' from {}: connection closing",
                envelope.message_type(),
                self.inner.remote_addr
            );
            return false;
        }
        self.inner.handlers.dispatch(envelope)
    }

    /// Publish the final status and notify the disconnect handler
    pub(crate) fn finish(&self, reason: CloseReason) {
        self.inner.closing.store(true, Ordering::SeqCst);

        tracing::info!("Connection to {} ended: {}", self.inner.remote_addr, reason);

        match Envelope::disconnect(&reason.to_string()) {
            Ok(notice) => {
                self.inner.handlers.dispatch(notice);
            }
            Err(e) => tracing::error!("Failed to build disconnect notice: {}", e),
        }

        // Handlers often capture a clone of this connection; release them.
        self.inner.handlers.clear();
        self.inner.status.send_replace(Some(reason));
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.inner.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Reads whole frames from the read side of a stream
struct FramedReader<R> {
    half: R,
    decoder: Decoder,
    read_buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    fn new(half: R, max_message_size: usize) -> Self {
        Self {
            half,
            decoder: Decoder::with_max_message_size(max_message_size),
            read_buf: BytesMut::with_capacity(4096),
        }
    }

    /// Receive the next frame; `Ok(None)` on a clean end of stream
    ///
    /// Cancel safe: bytes already read stay buffered for the next call.
    async fn recv(&mut self, stats: &StatsCounters) -> ConnectionResult<Option<Frame>> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
                return Ok(Some(frame));
            }

            let n = self.half.read_buf(&mut self.read_buf).await?;

            if n == 0 {
                if self.read_buf.is_empty() && self.decoder.is_idle() {
                    return Ok(None);
                } else {
                    return Err(ConnectionError::Closed);
                }
            }

            stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        }
    }
}

/// Writes frames to the write side of a stream
struct FramedWriter<W> {
    half: W,
    encoder: Encoder,
    write_buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    fn new(half: W, max_message_size: usize) -> Self {
        Self {
            half,
            encoder: Encoder::with_max_message_size(max_message_size),
            write_buf: BytesMut::with_capacity(4096),
        }
    }

    /// Encode and write one envelope
    ///
    /// Envelopes that cannot be encoded are skipped; only IO errors are
    /// fatal to the stream.
    async fn send(&mut self, envelope: &Envelope, stats: &StatsCounters) -> ConnectionResult<()> {
        self.write_buf.clear();
        if let Err(e) = self.encoder.encode(envelope, &mut self.write_buf) {
            tracing::warn!("Dropping unencodable '{}': {}", envelope.message_type(), e);
            return Ok(());
        }

        self.half.write_all(&self.write_buf).await?;
        self.half.flush().await?;

        stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        stats
            .bytes_sent
            .fetch_add(self.write_buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// Owner of a connection's stream
pub struct ConnectionDriver {
    connection: Connection,
    reader: FramedReader<ReadHalf<BoxedStream>>,
    writer: FramedWriter<WriteHalf<BoxedStream>>,
    outbound_rx: mpsc::Receiver<Envelope>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ConnectionDriver {
    /// The connection this driver serves
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Run the receive/dispatch/write loop until the connection ends
    ///
    /// Inbound envelopes are dispatched inline, outbound envelopes are
    /// written in queue order. The stream stays open until
    /// [`ConnectionDriver::shutdown`] is called, so the owner can retire
    /// the connection from shared state first.
    pub async fn run(&mut self) -> CloseReason {
        let stats = &self.connection.inner.stats;
        // Set when a close cut a frame short; nothing may follow it.
        let mut interrupted = false;

        let reason = loop {
            tokio::select! {
                biased;

                _ = shutdown_requested(&mut self.shutdown_rx) => {
                    break CloseReason::Local;
                }

                // Queued replies go out before the next inbound frame is read,
                // otherwise a burst of buffered requests fills the queue.
                Some(envelope) = self.outbound_rx.recv() => {
                    tokio::select! {
                        biased;

                        _ = shutdown_requested(&mut self.shutdown_rx) => {
                            interrupted = true;
                            break CloseReason::Local;
                        }
                        result = self.writer.send(&envelope, stats) => {
                            if let Err(e) = result {
                                break CloseReason::Failed(format!("Send error: {}", e));
                            }
                        }
                    }
                }

                result = self.reader.recv(stats) => {
                    match result {
                        Ok(Some(frame)) => {
                            stats.messages_received.fetch_add(1, Ordering::Relaxed);
                            self.connection.dispatch(frame.envelope);
                        }
                        Ok(None) => break CloseReason::PeerClosed,
                        Err(e) => break CloseReason::Failed(e.to_string()),
                    }
                }
            }
        };

        self.connection.inner.closing.store(true, Ordering::SeqCst);

        let flush = reason == CloseReason::Local && !interrupted;
        if flush
            && tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, self.flush_pending())
                .await
                .is_err()
        {
            tracing::warn!(
                "Timed out flushing queued messages to {}",
                self.connection.inner.remote_addr
            );
        }

        reason
    }

    /// Write whatever was queued before the close was requested
    async fn flush_pending(&mut self) {
        let stats = &self.connection.inner.stats;
        while let Ok(envelope) = self.outbound_rx.try_recv() {
            if let Err(e) = self.writer.send(&envelope, stats).await {
                tracing::debug!("Flush to {} aborted: {}", self.connection.inner.remote_addr, e);
                return;
            }
        }
    }

    /// Close the stream
    pub async fn shutdown(mut self) {
        if let Err(e) = self.writer.half.shutdown().await {
            tracing::trace!(
                "Stream shutdown for {} failed: {}",
                self.connection.inner.remote_addr,
                e
            );
        }
    }
}

/// Resolves once `close()` has been requested
async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        let closed = *shutdown_rx.borrow_and_update();
        if closed || shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Drive a connection to completion on the current task
///
/// `retire` runs after the loop ends but before the stream is closed and the
/// disconnect notice is dispatched.
pub(crate) async fn drive<F, Fut>(mut driver: ConnectionDriver, retire: F) -> CloseReason
where
    F: FnOnce(CloseReason) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let connection = driver.connection.clone();
    let reason = driver.run().await;
    retire(reason.clone()).await;
    driver.shutdown().await;
    connection.finish(reason.clone());
    reason
}
