//! Request/reply RPC over a message broker with correlation-id matching.
//!
//! A caller ([`RpcClient`]) publishes a request carrying a fresh correlation
//! ID and the name of its private reply queue, then awaits the reply under
//! a timeout. A worker ([`RpcWorker`]) consumes the request queue one
//! message at a time, runs a processing function, and publishes the result
//! back to the reply queue under the same correlation ID. The
//! [`CorrelationTable`] pairs replies with waiting callers regardless of
//! arrival order.
//!
//! The broker sits behind the [`Transport`] trait. An in-memory broker is
//! always available; RabbitMQ is supported through the `transport_lapin`
//! feature.
//!
//! ```no_run
//! use bytes::Bytes;
//! use queue_rpc::{create_transport, RpcClient, RpcConfig, RpcWorker};
//! use std::time::Duration;
//!
//! # async fn example() -> queue_rpc::Result<()> {
//! let config = RpcConfig::memory("demo");
//! let transport = create_transport(&config).await?;
//!
//! let worker = RpcWorker::new(transport.clone(), &config.request_queue, |p: Bytes| async move {
//!     Ok(p)
//! });
//! let _task = worker.spawn();
//!
//! let client = RpcClient::with_transport(transport, &config).await?;
//! let reply = client.call(Bytes::from_static(b"ping"), Duration::from_secs(5)).await?;
//! assert_eq!(reply, Bytes::from_static(b"ping"));
//! # Ok(())
//! # }
//! ```

mod macros;
pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

mod client;
mod domain;
mod transport;
mod worker;

mod correlation;
mod error;
mod rpc_config;

// Re-export main types
pub use client::{AbandonReason, CorrelationTable, PendingCompletion, RpcClient};
pub use worker::RpcWorker;

pub use rpc_config::{
    //
    BrokerConfig,
    RpcConfig,
    DEFAULT_REQUEST_QUEUE,
    ENV_HOST,
    ENV_PASS,
    ENV_USER,
    ENV_VHOST,
};

pub use correlation::CorrelationId;
pub use error::{Result, RpcError};

pub use transport::{
    //
    create_lapin_transport,
    create_memory_transport,
    create_memory_transport_with_hub,
    MemoryHub,
};

// --- public re-exports
pub use domain::{
    //
    AckToken,
    Address,
    Delivery,
    Envelope,
    SubscribeOptions,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

/// Create the transport selected by `config`.
///
/// A configured broker connects over AMQP (requires the `transport_lapin`
/// feature); no broker selects the in-memory transport on the
/// process-global hub.
///
/// # Errors
///
/// Returns `RpcError::Connection` if the broker cannot be reached or AMQP
/// support is not compiled in.
pub async fn create_transport(config: &RpcConfig) -> Result<TransportPtr> {
    match config.broker {
        Some(_) => create_lapin_transport(config).await,
        None => create_memory_transport(config).await,
    }
}
