//! End-to-end tests: decoder, command pipeline, and pool working together
//! over real loopback TCP connections.

use crate::connection::Connection;
use crate::error::{Error, NoopMetrics};
use crate::pipeline;
use crate::pool::{Pool, PoolConfig};
use crate::resp::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn bind_loopback() -> (TcpListener, std::net::SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

#[tokio::test]
async fn pipeline_round_trips_several_commands_over_real_tcp() {
    let (listener, addr) = bind_loopback().await;

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut conn = Connection::from_tcp(socket);
        for _ in 0..3 {
            let request = conn.read_value().await.unwrap().unwrap();
            let Value::Array(Some(args)) = request else {
                panic!("expected a command array");
            };
            let Value::BulkString(Some(key)) = &args[1] else {
                panic!("expected a bulk string key");
            };
            conn.write_value(&Value::bulk(format!("value-for-{}", String::from_utf8_lossy(key))))
                .await
                .unwrap();
        }
    });

    let client = TcpStream::connect(addr).await.unwrap();
    let (handle, _join) = pipeline::spawn(Connection::from_tcp(client), Arc::new(NoopMetrics));

    for key in ["a", "b", "c"] {
        let response = handle.call(Value::command(["GET", key])).await.unwrap();
        assert_eq!(response, Value::bulk(format!("value-for-{key}")));
    }

    server.await.unwrap();
}

#[tokio::test]
async fn transport_failure_cascades_to_every_in_flight_sink() {
    let (listener, addr) = bind_loopback().await;
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        // Read the first request, then vanish without responding to it or
        // the two that follow.
        let mut buf = vec![0u8; 64];
        let _ = socket.read(&mut buf).await.unwrap();
    });

    let client = TcpStream::connect(addr).await.unwrap();
    let (handle, _join) = pipeline::spawn(Connection::from_tcp(client), Arc::new(NoopMetrics));

    let calls: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|key| {
            let handle = handle.clone();
            tokio::spawn(async move { handle.call(Value::command(["GET", key])).await })
        })
        .collect();

    server.await.unwrap();

    for call in calls {
        assert!(matches!(call.await.unwrap(), Err(Error::ConnectionClosed)));
    }
}

fn tcp_factory(addr: std::net::SocketAddr) -> impl Fn() -> Pin<Box<dyn Future<Output = crate::error::Result<Connection>> + Send>> + Clone {
    move || Box::pin(async move { Connection::connect_tcp(addr).await }) as Pin<Box<dyn Future<Output = _> + Send>>
}

async fn echo_server() -> std::net::SocketAddr {
    let (listener, addr) = bind_loopback().await;
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    let n = match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn pool_lease_round_trips_a_command_end_to_end() {
    let addr = echo_server().await;
    let pool = Pool::new(PoolConfig::new(2, 0), move || tcp_factory(addr)());

    let conn = pool.lease_with_timeout(Duration::from_secs(1)).await.unwrap();
    let response = conn.call(Value::command(["PING"])).await.unwrap();
    assert_eq!(response, Value::command(["PING"]));
}

#[tokio::test]
async fn pool_close_resolves_after_available_connections_close() {
    let addr = echo_server().await;
    let pool = Pool::new(PoolConfig::new(2, 2), move || tcp_factory(addr)());
    pool.activate();

    // Give activation a moment to bring the pool up to its minimum.
    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.close().await;

    let result = pool.lease_with_timeout(Duration::from_millis(10)).await;
    assert!(matches!(result, Err(Error::PoolClosed)));
}
