//! Network module - Connection lifecycle and message dispatch
//!
//! Provides:
//! - Server for accepting connections and addressing them by identity
//! - Client for connecting to a server
//! - Connection handles with per-connection handler tables

mod server;
mod client;
mod connection;
mod registry;
mod transport;

pub use server::*;
pub use client::*;
pub use connection::*;
pub use registry::*;
pub use transport::*;

use crate::protocol::DEFAULT_MAX_MESSAGE_SIZE;

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Interface the server binds to
    pub bind_address: String,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Envelopes that may wait in one connection's outbound queue
    pub outbound_queue_capacity: usize,
    /// Maximum frame body size
    pub max_message_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            connect_timeout_ms: 5000,
            outbound_queue_capacity: 256,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl NetworkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    pub fn with_connect_timeout_ms(mut self, connect_timeout_ms: u64) -> Self {
        self.connect_timeout_ms = connect_timeout_ms;
        self
    }

    pub fn with_outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity;
        self
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }
}
