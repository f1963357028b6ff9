// src/client/rpc_client.rs
//! RPC client implementation.
//!
//! The client declares an exclusive, auto-named reply queue on its
//! transport and runs a background receive loop that routes each reply
//! into the [`CorrelationTable`] by correlation ID.
//!
//! Each call generates a UUID v4 correlation ID, registers a pending
//! completion, publishes the request with `reply_to` set to the private
//! queue, and awaits the completion under a caller-supplied timeout.
//!
//! # Concurrency
//!
//! Calls are independent tasks. The table is mutex-protected but the lock
//! is only held for a single map operation, so one slow request never
//! delays another.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time;

use super::pending::{AbandonReason, CorrelationTable};
use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    Address,
    CorrelationId,
    Delivery,
    Envelope,
    Result,
    RpcConfig,
    RpcError,
    SubscribeOptions,
    TransportPtr,
};

/// Running RPC client instance.
///
/// Cheap to clone (internally `Arc`-backed); clones share the reply queue
/// and the correlation table.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    transport: TransportPtr,
    request_queue: Address,
    reply_to: Address,
    default_timeout: Duration,
    table: Arc<CorrelationTable>,

    /// Reply receive loop; taken on shutdown.
    rx_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.rx_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

/// Removes the table entry when a call ends on any path other than a
/// resolved reply: publish failure, timeout, or the call future being
/// dropped by its owner.
struct PendingGuard<'a> {
    table: &'a CorrelationTable,
    id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.abandon(&self.id);
    }
}

impl RpcClient {
    // ---
    /// Create a client on an explicitly provided transport.
    ///
    /// Declares the request queue (durable) and a private reply queue, then
    /// starts consuming replies.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Transport` if a queue cannot be declared or the
    /// reply subscription cannot be established.
    pub async fn with_transport(transport: TransportPtr, config: &RpcConfig) -> Result<Self> {
        // ---
        transport.declare_queue(&config.request_queue, true).await?;

        let reply_to = transport.declare_private_queue().await?;
        let mut handle = transport
            .subscribe(reply_to.as_str(), SubscribeOptions::auto_ack())
            .await?;

        log_info!(
            "[{}] rpc client ready, replies on {reply_to}",
            transport.transport_id()
        );

        let table = Arc::new(CorrelationTable::new());

        let rx_table = table.clone();
        let rx_reply_to = reply_to.clone();
        let rx_task = tokio::spawn(async move {
            // ---
            while let Some(delivery) = handle.inbox.recv().await {
                route_reply(&rx_table, delivery);
            }

            // Connection gone: nobody will ever resolve what is left.
            let abandoned = rx_table.abandon_all(AbandonReason::ConnectionLost);
            log_warn!("reply queue {rx_reply_to} closed, abandoned {abandoned} pending request(s)");
        });

        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                request_queue: Address::from(config.request_queue.as_str()),
                reply_to,
                default_timeout: config.request_timeout,
                table,
                rx_task: Mutex::new(Some(rx_task)),
            }),
        })
    }

    /// Convenience constructor that creates the transport from `config`.
    ///
    /// The transport is owned by this client; [`shutdown`](Self::shutdown)
    /// does not close it, call [`transport`](Self::transport)`().close()`
    /// when done.
    pub async fn new(config: &RpcConfig) -> Result<Self> {
        let transport = crate::create_transport(config).await?;
        Self::with_transport(transport, config).await
    }

    /// Send `payload` to the request queue and wait for the matching reply.
    ///
    /// # Errors
    ///
    /// - `RpcError::Timeout` if no reply arrives within `timeout`
    /// - `RpcError::Publish` if the transport rejects the request
    /// - `RpcError::Cancelled` if the client is shut down, before or while
    ///   waiting; nothing is published after shutdown
    /// - `RpcError::ConnectionLost` if the reply stream has ended, before or
    ///   while waiting
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use queue_rpc::{RpcClient, RpcConfig};
    /// # use bytes::Bytes;
    /// # use std::time::Duration;
    /// # async fn example() -> queue_rpc::Result<()> {
    /// let config = RpcConfig::memory("caller");
    /// let client = RpcClient::new(&config).await?;
    ///
    /// let reply = client
    ///     .call(Bytes::from_static(b"ping"), Duration::from_secs(5))
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn call(&self, payload: Bytes, timeout: Duration) -> Result<Bytes> {
        // ---
        let inner = &self.inner;

        let correlation_id = CorrelationId::generate();
        let completion = inner.table.register(correlation_id.clone())?;
        let _guard = PendingGuard {
            table: &inner.table,
            id: correlation_id.clone(),
        };

        let env = Envelope::request(
            inner.request_queue.clone(),
            payload,
            correlation_id.as_arc(),
            inner.reply_to.clone(),
        );

        inner.transport.publish(env).await.map_err(|e| match e {
            RpcError::Publish(msg) => RpcError::Publish(msg),
            other => RpcError::Publish(other.to_string()),
        })?;

        log_debug!("published request {correlation_id} to {}", inner.request_queue);

        match time::timeout(timeout, completion.wait()).await {
            Ok(reply) => reply,
            Err(_) => {
                log_debug!("request {correlation_id} timed out after {timeout:?}");
                Err(RpcError::Timeout)
            }
        }
    }

    /// [`call`](Self::call) using the configured `request_timeout`.
    pub async fn call_default(&self, payload: Bytes) -> Result<Bytes> {
        self.call(payload, self.inner.default_timeout).await
    }

    /// Typed convenience over [`call`](Self::call) using JSON payloads.
    ///
    /// # Errors
    ///
    /// Same as `call`, plus `RpcError::Serialization` if the request cannot
    /// be encoded or the reply cannot be decoded as `TResp`.
    pub async fn request<TReq, TResp>(&self, req: &TReq, timeout: Duration) -> Result<TResp>
    where
        TReq: Serialize,
        TResp: DeserializeOwned,
    {
        let req_bytes = Bytes::from(serde_json::to_vec(req)?);
        let reply = self.call(req_bytes, timeout).await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// The private queue replies are delivered to.
    pub fn reply_to(&self) -> &Address {
        &self.inner.reply_to
    }

    /// Number of requests currently awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.table.len()
    }

    /// Replies dropped because no pending request matched.
    pub fn unmatched_responses(&self) -> u64 {
        self.inner.table.unmatched()
    }

    pub fn transport(&self) -> TransportPtr {
        self.inner.transport.clone()
    }

    /// Stop routing replies and cancel every pending call. Idempotent.
    ///
    /// Later calls fail with `RpcError::Cancelled` without publishing.
    ///
    /// Does not close the transport.
    pub fn shutdown(&self) {
        // ---
        let task = match self.inner.rx_task.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(task) = task {
            task.abort();
            let abandoned = self.inner.table.abandon_all(AbandonReason::Shutdown);
            log_debug!("rpc client shut down, cancelled {abandoned} pending request(s)");
        }
    }
}

/// Route one delivered reply into the table.
fn route_reply(table: &CorrelationTable, delivery: Delivery) {
    // ---
    let env = delivery.envelope;

    let Some(correlation_id) = env.correlation_id else {
        log_warn!("reply without correlation_id on {}, dropped", env.address);
        return;
    };

    table.resolve(&CorrelationId::from(correlation_id), env.payload);
}
