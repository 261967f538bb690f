//! End-to-end message exchange between a server and its clients

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use common::{connect_client, eventually, start_server, within};
use hubwire::{ConnectionId, Payload};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_test::assert_ok;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Tick {
    client: u32,
    seq: u32,
}

fn greeter(conn: &hubwire::Connection, _id: ConnectionId) {
    let reply_to = conn.clone();
    conn.on::<String, _>("greet", move |name| {
        reply_to.send("reply", &format!("hello, {}", name))?;
        Ok(())
    });
}

#[tokio::test]
async fn test_greet_then_server_replies_by_identity() {
    let (greet_tx, mut greet_rx) = mpsc::unbounded_channel();
    let (server, addr, mut accepted) = start_server(move |conn, _| {
        let greet_tx = greet_tx.clone();
        conn.on::<String, _>("greet", move |text| {
            let _ = greet_tx.send(text);
            Ok(())
        });
    })
    .await;

    let client = connect_client(&addr).await;
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    client.on::<String, _>("reply", move |text| {
        let _ = reply_tx.send(text);
        Ok(())
    });

    assert_ok!(client.send("greet", "hi").await);
    assert_eq!(within("greet", greet_rx.recv()).await.unwrap(), "hi");

    let id = within("accept", accepted.recv()).await.unwrap();
    eventually("registration", || async { server.connection(&id).await.is_some() }).await;
    assert!(server.send_to(&id, "reply", "hello").await.unwrap());

    assert_eq!(within("reply", reply_rx.recv()).await.unwrap(), "hello");
    // Exactly once
    assert!(greet_rx.try_recv().is_err());

    client.close().await;
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_handler_replies_on_its_connection() {
    let (server, addr, _accepted) = start_server(greeter).await;

    let client = connect_client(&addr).await;
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    client.on::<String, _>("reply", move |text| {
        let _ = reply_tx.send(text);
        Ok(())
    });

    assert_ok!(client.send("greet", "alice").await);
    assert_eq!(within("reply", reply_rx.recv()).await.unwrap(), "hello, alice");

    client.close().await;
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_server_push_to_identity() {
    let (server, addr, mut accepted) = start_server(|_, _| {}).await;

    let client = connect_client(&addr).await;
    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
    client.handle("notice", move |payload: Payload| {
        let _ = notice_tx.send(payload.decode::<u64>()?);
        Ok(())
    });

    let id = within("accept", accepted.recv()).await.unwrap();
    eventually("registration", || async { server.connection(&id).await.is_some() }).await;

    assert!(server.send_to(&id, "notice", &42u64).await.unwrap());
    assert_eq!(within("notice", notice_rx.recv()).await, Some(42));

    assert!(!server.send_to(&ConnectionId::new(), "notice", &1u64).await.unwrap());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unregistered_type_is_dropped() {
    let (server, addr, mut accepted) = start_server(greeter).await;

    let client = connect_client(&addr).await;
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    client.on::<String, _>("reply", move |text| {
        let _ = reply_tx.send(text);
        Ok(())
    });

    assert_ok!(client.send("mystery", &[1u8, 2, 3]).await);
    assert_ok!(client.send("greet", "bob").await);

    assert_eq!(within("reply", reply_rx.recv()).await.unwrap(), "hello, bob");

    let id = within("accept", accepted.recv()).await.unwrap();
    eventually("registration", || async { server.connection(&id).await.is_some() }).await;
    assert!(client.is_connected().await);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failing_handlers_leave_connection_usable() {
    let (server, addr, _accepted) = start_server(|conn, id| {
        greeter(conn, id);
        conn.handle("fail", |_| Err(anyhow::anyhow!("rejected")));
        conn.handle("boom", |_| panic!("handler panicked"));
        conn.on::<u32, _>("typed", |_| Ok(()));
    })
    .await;

    let client = connect_client(&addr).await;
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    client.on::<String, _>("reply", move |text| {
        let _ = reply_tx.send(text);
        Ok(())
    });

    assert_ok!(client.send("fail", &()).await);
    assert_ok!(client.send("boom", &()).await);
    // Too short to decode as u32
    assert_ok!(client.send_payload("typed", Payload::from_bytes(vec![7u8])).await);
    assert_ok!(client.send("greet", "carol").await);

    assert_eq!(within("reply", reply_rx.recv()).await.unwrap(), "hello, carol");
    assert!(client.is_connected().await);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_clients_stay_isolated() {
    const CLIENTS: u32 = 8;
    const MESSAGES: u32 = 50;

    let received: Arc<Mutex<HashMap<ConnectionId, Vec<Tick>>>> = Arc::default();
    let seen = received.clone();

    let (server, addr, _accepted) = start_server(move |conn, id| {
        let seen = seen.clone();
        let ack_to = conn.clone();
        conn.on::<Tick, _>("tick", move |tick| {
            seen.lock().unwrap().entry(id).or_default().push(tick.clone());
            ack_to.send("ack", &tick)?;
            Ok(())
        });
    })
    .await;

    let mut tasks = Vec::new();
    for client_index in 0..CLIENTS {
        let addr = addr.clone();
        tasks.push(tokio::spawn(async move {
            let client = connect_client(&addr).await;
            let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
            client.on::<Tick, _>("ack", move |tick| {
                let _ = ack_tx.send(tick);
                Ok(())
            });

            for seq in 0..MESSAGES {
                client
                    .send("tick", &Tick { client: client_index, seq })
                    .await
                    .unwrap();
            }

            for seq in 0..MESSAGES {
                let ack = within("ack", ack_rx.recv()).await.unwrap();
                assert_eq!(ack, Tick { client: client_index, seq });
            }

            client.close().await;
        }));
    }

    for task in tasks {
        within("client task", task).await.unwrap();
    }

    let received = received.lock().unwrap().clone();
    assert_eq!(received.len(), CLIENTS as usize);

    let mut clients_seen: Vec<u32> = received
        .values()
        .map(|ticks| {
            assert_eq!(ticks.len(), MESSAGES as usize);
            let client = ticks[0].client;
            for (seq, tick) in ticks.iter().enumerate() {
                assert_eq!(*tick, Tick { client, seq: seq as u32 });
            }
            client
        })
        .collect();
    clients_seen.sort_unstable();
    assert_eq!(clients_seen, (0..CLIENTS).collect::<Vec<_>>());

    server.shutdown().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_exchange() {
    use hubwire::{Client, Server, TransportKind};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hub.sock").display().to_string();

    let mut server = Server::new(common::local_config());
    server.on_accept(greeter);
    server.listen_on(TransportKind::Unix, &path).await.unwrap();

    let client = Client::new(common::local_config());
    client.connect(&path, TransportKind::Unix).await.unwrap();

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    client.on::<String, _>("reply", move |text| {
        let _ = reply_tx.send(text);
        Ok(())
    });

    assert_ok!(client.send("greet", "dave").await);
    assert_eq!(within("reply", reply_rx.recv()).await.unwrap(), "hello, dave");

    client.close().await;
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_request_burst_gets_every_reply() {
    use bytes::BytesMut;
    use hubwire::protocol::{Decoder, Encoder, Envelope};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const REQUESTS: u32 = 2000;

    let (server, addr, _accepted) = start_server(|conn, _| {
        let reply_to = conn.clone();
        conn.on::<u32, _>("ping", move |n| {
            reply_to.send("pong", &n)?;
            Ok(())
        });
    })
    .await;

    // Far more requests than the outbound queue holds, in a single write.
    let mut encoder = Encoder::new();
    let mut burst = BytesMut::new();
    for n in 0..REQUESTS {
        encoder
            .encode(&Envelope::with_value("ping", &n).unwrap(), &mut burst)
            .unwrap();
    }

    let stream = tokio::net::TcpStream::connect(addr.as_str()).await.unwrap();
    let (mut read_half, mut write_half) = stream.into_split();
    let writer = tokio::spawn(async move {
        write_half.write_all(&burst).await.unwrap();
        write_half
    });

    let mut decoder = Decoder::new();
    let mut buf = BytesMut::new();
    let replies = within("replies", async {
        let mut replies = Vec::new();
        while replies.len() < REQUESTS as usize {
            if let Some(frame) = decoder.decode(&mut buf).unwrap() {
                assert_eq!(frame.envelope.message_type(), "pong");
                replies.push(frame.envelope.payload().decode::<u32>().unwrap());
                continue;
            }
            let n = read_half.read_buf(&mut buf).await.unwrap();
            assert!(n > 0, "server closed after {} replies", replies.len());
        }
        replies
    })
    .await;

    assert_eq!(replies, (0..REQUESTS).collect::<Vec<_>>());

    drop(within("writer", writer).await.unwrap());
    server.shutdown().await.unwrap();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Chunk {
    task: u8,
    seq: u32,
    body: Vec<u8>,
}

#[tokio::test]
async fn test_concurrent_senders_never_interleave() {
    use hubwire::{ConnectionError, ServerError};

    const TASKS: u8 = 8;
    const SENDS: u32 = 100;
    const BODY_LEN: usize = 512;

    let (server, addr, mut accepted) = start_server(|_, _| {}).await;
    let server = Arc::new(server);

    let client = connect_client(&addr).await;
    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
    client.on::<Chunk, _>("chunk", move |chunk| {
        let _ = chunk_tx.send(chunk);
        Ok(())
    });

    let id = within("accept", accepted.recv()).await.unwrap();
    eventually("registration", || async { server.connection(&id).await.is_some() }).await;

    let mut senders = Vec::new();
    for task in 0..TASKS {
        let server = server.clone();
        senders.push(tokio::spawn(async move {
            for seq in 0..SENDS {
                let chunk = Chunk {
                    task,
                    seq,
                    body: vec![task; BODY_LEN],
                };
                // A full queue is backpressure, not loss; try again.
                loop {
                    match server.send_to(&id, "chunk", &chunk).await {
                        Ok(sent) => {
                            assert!(sent);
                            break;
                        }
                        Err(ServerError::Connection(ConnectionError::QueueFull)) => {
                            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                        }
                        Err(e) => panic!("send failed: {}", e),
                    }
                }
            }
        }));
    }
    for sender in senders {
        within("sender", sender).await.unwrap();
    }

    let mut next_seq = vec![0u32; TASKS as usize];
    for _ in 0..(TASKS as u32 * SENDS) {
        let chunk = within("chunk", chunk_rx.recv()).await.unwrap();
        assert_eq!(chunk.body.len(), BODY_LEN);
        assert!(chunk.body.iter().all(|b| *b == chunk.task));
        assert_eq!(chunk.seq, next_seq[chunk.task as usize]);
        next_seq[chunk.task as usize] += 1;
    }
    assert!(next_seq.iter().all(|n| *n == SENDS));
    assert!(client.is_connected().await);

    client.close().await;
    server.shutdown().await.unwrap();
}
