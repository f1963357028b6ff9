//! RPC worker on RabbitMQ.
//!
//! Consumes `request_queue` one message at a time and replies with
//! `processed <message>`.
//!
//! Run with: cargo run --example rpc_worker --features transport_lapin
//!
//! Requires `RABBITMQ_HOST`, `RABBITMQ_DEFAULT_USER`, `RABBITMQ_DEFAULT_PASS`
//! and `RABBITMQ_DEFAULT_VHOST` pointing at a reachable broker.

use bytes::Bytes;
use queue_rpc::{create_transport, RpcConfig, RpcWorker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = RpcConfig::from_env("rpc-worker")?;
    let transport = create_transport(&config).await?;

    let worker = RpcWorker::new(transport.clone(), &config.request_queue, |payload: Bytes| async move {
        let message = String::from_utf8_lossy(&payload).into_owned();
        println!("received request: {message}");
        Ok(Bytes::from(format!("processed {message}")))
    });

    let worker_clone = worker.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("Received Ctrl+C, shutting down...");
            worker_clone.shutdown();
        }
    });

    // Blocks until shutdown() or connection loss.
    worker.run().await?;

    transport.close().await?;
    Ok(())
}
