//! Connection state transitions, packet primitives and concurrency

use anyhow::Result;
use irods_client::{ConnectionConfig, ConnectionManager, ConnectionState, Error};
use irods_integration_tests::*;
use irods_protocol::api::numbers::AUTH_REQUEST_AN;
use irods_protocol::messages::AuthRequestOut;
use irods_protocol::{Message, MessageType};
use std::sync::Arc;
use std::time::Duration;

const TASKS: usize = 3;
const ROUNDS: usize = 50;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connect_disconnect() -> Result<()> {
    init_tracing();
    let server = TestServer::start().await?;
    let manager = Arc::new(ConnectionManager::new(ConnectionConfig::default())?);
    let account = server.account("rods", "rods");

    let mut tasks = Vec::new();
    for _ in 0..TASKS {
        let manager = manager.clone();
        let account = account.clone();
        tasks.push(tokio::spawn(async move {
            let mut connections = Vec::with_capacity(ROUNDS);
            for _ in 0..ROUNDS {
                let (connection, auth) = manager.current_connection(&account).await?;
                anyhow::ensure!(auth.is_successful(), "login failed");
                anyhow::ensure!(connection.is_connected(), "not connected after login");
                connection.disconnect().await;
                connections.push(connection);
            }
            Ok::<_, anyhow::Error>(connections)
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await??);
    }
    assert_eq!(all.len(), TASKS * ROUNDS);
    assert!(all.iter().all(|c| !c.is_connected()));
    assert!(all
        .iter()
        .all(|c| c.state() == ConnectionState::Disconnected));

    let record = server.record();
    wait_for_condition(|| async move { record.disconnects() == TASKS * ROUNDS }).await?;
    assert_eq!(record.connections(), TASKS * ROUNDS);
    Ok(())
}

#[tokio::test]
async fn test_disconnect_twice_is_harmless() -> Result<()> {
    init_tracing();
    let server = TestServer::start().await?;
    let manager = ConnectionManager::new(ConnectionConfig::default())?;

    let (connection, _) = manager
        .current_connection(&server.account("rods", "rods"))
        .await?;
    assert_eq!(connection.state(), ConnectionState::Connected);

    connection.disconnect().await;
    connection.disconnect().await;
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(!connection.is_channel_open());

    let record = server.record();
    wait_for_condition(|| async move { record.disconnects() >= 1 }).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(record.disconnects(), 1);
    Ok(())
}

#[tokio::test]
async fn test_request_after_login() -> Result<()> {
    init_tracing();
    let server = TestServer::start().await?;
    let manager = ConnectionManager::new(ConnectionConfig::default())?;
    let (connection, _) = manager
        .current_connection(&server.account("rods", "rods"))
        .await?;

    let reply = connection
        .request(&Message::api_request(AUTH_REQUEST_AN, None))
        .await?;
    assert_eq!(reply.int_info(), 0);
    let challenge = AuthRequestOut::from_pack(&reply.body_pack()?)?.challenge;
    assert!(!challenge.is_empty());

    // the first challenge stays cached
    assert_ne!(connection.cached_challenge(), Some(challenge.as_str()));

    connection.send_packet(&Message::api_request(AUTH_REQUEST_AN, None)).await?;
    let reply = connection.receive_packet().await?;
    assert_eq!(reply.int_info(), 0);

    connection.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn test_packet_io_after_disconnect() -> Result<()> {
    init_tracing();
    let server = TestServer::start().await?;
    let manager = ConnectionManager::new(ConnectionConfig::default())?;
    let (connection, _) = manager
        .current_connection(&server.account("rods", "rods"))
        .await?;
    connection.disconnect().await;

    let err = connection
        .request(&Message::api_request(AUTH_REQUEST_AN, None))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotConnected));
    Ok(())
}

#[tokio::test]
async fn test_read_timeout_moves_to_disconnected() -> Result<()> {
    init_tracing();
    let server = TestServer::start().await?;
    let config =
        ConnectionConfig::default().with_socket_timeout(Some(Duration::from_millis(200)));
    let manager = ConnectionManager::new(config)?;
    let (connection, _) = manager
        .current_connection(&server.account("rods", "rods"))
        .await?;

    // nothing was asked, so nothing arrives
    let err = connection.receive_packet().await.unwrap_err();
    assert!(err.is_timeout(), "{}", err);
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(!connection.is_connected());
    assert!(!connection.is_channel_open());

    // already closed; a graceful disconnect has nothing left to do
    connection.disconnect().await;
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert_eq!(server.record().disconnects(), 0);
    Ok(())
}

#[tokio::test]
async fn test_disconnect_with_error_skips_server_notice() -> Result<()> {
    init_tracing();
    let server = TestServer::start().await?;
    let manager = ConnectionManager::new(ConnectionConfig::default())?;
    let (connection, _) = manager
        .current_connection(&server.account("rods", "rods"))
        .await?;

    connection.disconnect_with_error().await;
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(!connection.is_connected());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.record().disconnects(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_requests_interleave_with_socket_renewal() -> Result<()> {
    init_tracing();
    let server =
        TestServer::start_with_config(ServerConfig::default().with_reconnect(4242)).await?;
    let config = ConnectionConfig::default().with_reconnect(Duration::from_millis(150));
    let manager = ConnectionManager::new(config)?;
    let (connection, _) = manager
        .current_connection(&server.account("rods", "rods"))
        .await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let mut workers = Vec::new();
    for worker in 0..2 {
        let connection = connection.clone();
        let record = server.record_handle();
        workers.push(tokio::spawn(async move {
            let mut sent = 0usize;
            while record.reconnects() < 3 {
                anyhow::ensure!(
                    tokio::time::Instant::now() < deadline,
                    "socket was not renewed in time"
                );
                let payload = format!("<seq>{}-{}</seq>", worker, sent);
                let request = Message::new(MessageType::ApiRequest, payload.clone().into_bytes())
                    .with_int_info(ECHO_AN);
                let reply = connection.request(&request).await?;
                anyhow::ensure!(reply.int_info() == 0, "status {}", reply.int_info());
                anyhow::ensure!(
                    reply.body.as_ref() == payload.as_bytes(),
                    "reply {:?} does not answer {}",
                    String::from_utf8_lossy(&reply.body),
                    payload
                );
                sent += 1;
            }
            Ok::<_, anyhow::Error>(sent)
        }));
    }

    let mut total = 0;
    for worker in workers {
        total += worker.await??;
    }
    assert!(total > 0);

    let stats = connection.reconnect_stats().expect("reconnection running");
    assert_eq!(stats.failures, 0, "{:?}", stats);
    assert!(stats.successes >= 2, "{:?}", stats);
    assert!(connection.is_connected());

    connection.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn test_oversized_reply_closes_connection() -> Result<()> {
    init_tracing();
    let server = TestServer::start().await?;
    let config = ConnectionConfig::default().with_max_message_size(1024);
    let manager = ConnectionManager::new(config)?;
    let (connection, _) = manager
        .current_connection(&server.account("rods", "rods"))
        .await?;

    let err = connection
        .request(&Message::api_request(OVERSIZED_REPLY_AN, None))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Framing { .. }), "{}", err);

    // the rest of the frame is still on the socket, so nothing after it
    // may be read as a header
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(!connection.is_channel_open());
    let err = connection
        .request(&Message::api_request(AUTH_REQUEST_AN, None))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotConnected), "{}", err);
    Ok(())
}

#[tokio::test]
async fn test_unreachable_server() -> Result<()> {
    init_tracing();
    let server = TestServer::start().await?;
    let port = server.port();
    server.shutdown().await;

    let config = ConnectionConfig::default().with_connect_timeout(Duration::from_secs(2));
    let manager = ConnectionManager::new(config)?;
    let account = irods_client::Account::new("127.0.0.1", port, "rods", TEST_ZONE, "rods");
    let connection = manager.connection_for(&account);
    let err = manager.connect(&connection).await.unwrap_err();

    assert!(
        matches!(err, Error::ConnectionError(_) | Error::Timeout(_)),
        "{}",
        err
    );
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    Ok(())
}
