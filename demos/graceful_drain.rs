//! Issues a handful of overlapping requests on a single command pipeline,
//! then triggers a graceful drain while some are still outstanding, to
//! show that queued requests complete before the transport closes.

use respool::connection::Connection;
use respool::error::NoopMetrics;
use respool::pipeline;
use respool::resp::Value;
use std::error::Error;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut conn = Connection::from_tcp(socket);
        for i in 0..3 {
            let _request = conn.read_value().await.unwrap().unwrap();
            conn.write_value(&Value::Integer(i)).await.unwrap();
        }
    });

    let client = Connection::connect_tcp(addr).await?;
    let (handle, join) = pipeline::spawn(client, Arc::new(NoopMetrics));

    let mut calls = Vec::new();
    for i in 0..3 {
        let handle = handle.clone();
        calls.push(tokio::spawn(async move {
            handle.call(Value::command(["GET", &i.to_string()])).await
        }));
    }

    // Request a graceful drain while the three requests above are still
    // in flight; they are expected to complete before the transport
    // closes, and any write attempted after this point fails immediately.
    let drain_handle = handle.clone();
    let drain_task = tokio::spawn(async move { drain_handle.drain().await });

    // `drain()` and `call()` travel through independent channels with no
    // ordering guarantee between them, so give the drain request a moment
    // to land before issuing a write that must observe the drained state.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let late_write = handle.call(Value::command(["GET", "too-late"])).await;
    println!("write issued after drain(): {late_write:?}");

    for (i, call) in calls.into_iter().enumerate() {
        println!("response {i}: {:?}", call.await?);
    }

    drain_task.await?;
    join.await?;
    server.await?;
    println!("connection drained and closed");

    Ok(())
}
