//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use hubwire::{Client, ConnectionId, NetworkConfig, Server, TransportKind};
use tokio::sync::mpsc;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn local_config() -> NetworkConfig {
    NetworkConfig::default().with_bind_address("127.0.0.1")
}

/// Await a future, failing the test if it takes longer than [`TIMEOUT`]
pub async fn within<F: Future>(what: &str, future: F) -> F::Output {
    tokio::time::timeout(TIMEOUT, future)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}

/// Poll `condition` until it holds, failing the test after [`TIMEOUT`]
pub async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    within(what, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

/// A listening server whose accept callback reports each new identity
pub async fn start_server<F>(on_accept: F) -> (Server, String, mpsc::UnboundedReceiver<ConnectionId>)
where
    F: Fn(&hubwire::Connection, ConnectionId) + Send + Sync + 'static,
{
    let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
    let mut server = Server::new(local_config());
    server.on_accept(move |conn, id| {
        on_accept(conn, id);
        let _ = accepted_tx.send(id);
    });

    let addr = server.listen(0).await.expect("listen");
    (server, addr.to_string(), accepted_rx)
}

pub async fn connect_client(addr: &str) -> Client {
    let client = Client::new(local_config());
    client
        .connect(addr, TransportKind::Tcp)
        .await
        .expect("connect");
    client
}
