//! Hubwire - Minimal bidirectional message bus
//!
//! A hub process ([`Server`]) accepts many stream connections from peer
//! processes ([`Client`]) and exchanges typed messages with them. Each side
//! registers one handler per message type; an incoming message invokes the
//! matching handler with its payload.
//!
//! ```no_run
//! use hubwire::{Client, NetworkConfig, Server, TransportKind};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let mut server = Server::new(NetworkConfig::default());
//! server.on_accept(|conn, id| {
//!     let reply_to = conn.clone();
//!     conn.on::<String, _>("greet", move |text| {
//!         println!("{} says {}", id, text);
//!         reply_to.send("reply", "hello")?;
//!         Ok(())
//!     });
//! });
//! let addr = server.listen(8080).await?;
//!
//! let client = Client::new(NetworkConfig::default());
//! client.on::<String, _>("reply", |text| {
//!     println!("server replied {}", text);
//!     Ok(())
//! });
//! client.connect(&addr.to_string(), TransportKind::Tcp).await?;
//! client.send("greet", "hi").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod network;
pub mod protocol;

pub use network::{
    AcceptHandler, Client, ClientError, ClientResult, ClientState, CloseReason, Connection,
    ConnectionError, ConnectionId, ConnectionResult, ConnectionStats, HandlerResult,
    HandlerTable, NetworkConfig, PeerAddr, Server, ServerError, ServerResult, ServerState,
    TransportKind,
};
pub use protocol::{Envelope, Payload, DISCONNECT_MESSAGE_TYPE};
