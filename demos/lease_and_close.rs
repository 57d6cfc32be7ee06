//! Spins up a loopback echo server, builds a small pool against it, leases
//! a connection, sends a command, and shuts the pool down cleanly.

use respool::connection::Connection;
use respool::pool::{Pool, PoolConfig};
use respool::resp::Value;
use std::error::Error;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

async fn spawn_echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let addr = spawn_echo_server().await;
    let pool = Pool::new(PoolConfig::new(4, 1), move || async move {
        Connection::connect_tcp(addr).await
    });
    pool.activate();

    let conn = pool.lease_with_timeout(Duration::from_secs(1)).await?;
    println!("leased a connection: connected = {}", conn.is_connected());

    let response = conn.call(Value::command(["PING"])).await?;
    println!("-> PING");
    println!("<- {response:?}");

    drop(conn);
    pool.close().await;
    println!("pool closed");

    Ok(())
}
