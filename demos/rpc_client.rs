//! RPC client on RabbitMQ.
//!
//! Sends three requests concurrently and prints each reply as it is
//! paired back to its caller.
//!
//! Run with: cargo run --example rpc_client --features transport_lapin
//!
//! Requires the same `RABBITMQ_*` variables as `rpc_worker`, and a worker
//! consuming `request_queue`.

use bytes::Bytes;
use queue_rpc::{RpcClient, RpcConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = RpcConfig::from_env("rpc-client")?;
    let client = RpcClient::new(&config).await?;

    let messages = ["Hello, worker! 1", "Hello, worker! 2", "Hello, worker! 3"];
    let calls: Vec<_> = messages
        .into_iter()
        .map(|message| {
            let client = client.clone();
            tokio::spawn(async move { client.call_default(Bytes::from(message)).await })
        })
        .collect();

    for (message, call) in messages.iter().zip(calls) {
        match call.await? {
            Ok(reply) => println!("{message} -> {}", String::from_utf8_lossy(&reply)),
            Err(e) => eprintln!("{message} failed: {e}"),
        }
    }

    client.shutdown();
    client.transport().close().await?;
    Ok(())
}
