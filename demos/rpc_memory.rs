//! Worker and client in one process over the in-memory broker.
//!
//! Run with: cargo run --example rpc_memory
//!
//! Set `RUST_LOG=queue_rpc=debug` to watch requests and replies flow.

use bytes::Bytes;
use std::time::Duration;

use queue_rpc::{create_transport, RpcClient, RpcConfig, RpcWorker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = RpcConfig::memory("rpc-memory");
    let transport = create_transport(&config).await?;

    let worker = RpcWorker::new(transport.clone(), &config.request_queue, |payload: Bytes| async move {
        let message = String::from_utf8_lossy(&payload).into_owned();
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(Bytes::from(format!("processed {message}")))
    });
    let worker_task = worker.spawn();

    let client = RpcClient::with_transport(transport.clone(), &config).await?;

    let calls = (1..=3).map(|i| {
        let client = client.clone();
        tokio::spawn(async move { client.call_default(Bytes::from(format!("Hello, worker! {i}"))).await })
    });

    for call in calls.collect::<Vec<_>>() {
        let reply = call.await??;
        println!("{}", String::from_utf8_lossy(&reply));
    }

    client.shutdown();
    worker.shutdown();
    worker_task.await??;
    transport.close().await?;
    Ok(())
}
