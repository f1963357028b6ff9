//! RPC worker: consumes requests and publishes replies.
//!
//! A worker subscribes to the request queue with a prefetch bound of one
//! and manual acknowledgement, so the broker never hands it a second
//! request before the first is acknowledged or rejected. Each delivery is
//! handled to completion before the next is received:
//!
//! 1. run the processing function on its own task (a panic is contained),
//! 2. publish the reply to the request's `reply_to` with the same
//!    correlation ID,
//! 3. acknowledge the request.
//!
//! # Failure policy
//!
//! Requests that cannot be answered (missing attributes, processing
//! failure, reply publish failure) are rejected **without requeue**. The
//! caller experiences a timeout. Requeueing would redeliver a poison
//! message to the same worker forever, and AMQP gives no redelivery count
//! to bound it with.
//!
//! Scale-out is achieved by running more worker instances on the same
//! queue, never by processing concurrently inside one.

mod handler;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use handler::{wrap_handler, wrap_json_handler, BoxedHandler};

use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    Delivery,
    Envelope,
    Result,
    RpcError,
    SubscribeOptions,
    TransportPtr,
};

/// Unacknowledged deliveries a worker may hold.
const PREFETCH: u16 = 1;

/// RPC worker bound to one request queue.
///
/// Cheap to clone; clones share the shutdown signal, so a clone can stop a
/// worker whose `run()` is executing elsewhere.
///
/// # Example
///
/// ```no_run
/// use queue_rpc::{create_transport, RpcConfig, RpcWorker};
/// use bytes::Bytes;
///
/// # async fn example() -> queue_rpc::Result<()> {
/// let config = RpcConfig::memory("worker");
/// let transport = create_transport(&config).await?;
///
/// let worker = RpcWorker::new(transport, &config.request_queue, |payload: Bytes| async move {
///     let mut reply = b"processed ".to_vec();
///     reply.extend_from_slice(&payload);
///     Ok(Bytes::from(reply))
/// });
///
/// worker.run().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcWorker {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    transport: TransportPtr,
    request_queue: String,
    handler: BoxedHandler,
    shutdown_tx: watch::Sender<bool>,

    /// Held by the one `run()` consuming for this worker and its clones.
    running: AtomicBool,
}

/// Releases the running slot when `run()` returns.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Outcome of handling one delivery.
enum Disposition {
    Ack,
    Reject,
}

impl RpcWorker {
    // ---
    /// Create a worker with a raw bytes processing function.
    pub fn new<F, Fut>(transport: TransportPtr, request_queue: &str, handler: F) -> Self
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        Self::from_boxed(transport, request_queue, wrap_handler(handler))
    }

    /// Create a worker with a typed processing function over JSON payloads.
    pub fn json<F, Fut, Req, Resp>(transport: TransportPtr, request_queue: &str, handler: F) -> Self
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        Self::from_boxed(transport, request_queue, wrap_json_handler(handler))
    }

    fn from_boxed(transport: TransportPtr, request_queue: &str, handler: BoxedHandler) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                transport,
                request_queue: request_queue.to_string(),
                handler,
                shutdown_tx,
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Consume requests until shutdown or connection loss.
    ///
    /// Returns `Ok(())` after [`shutdown`](Self::shutdown). The in-flight
    /// request, if any, is finished first.
    ///
    /// Only one `run()` may be active per worker, clones included; scale
    /// out with separate workers instead.
    ///
    /// # Errors
    ///
    /// - `RpcError::Transport` if this worker is already running
    /// - `RpcError::ConnectionLost` if the delivery stream ends without a
    ///   shutdown request
    /// - `RpcError::Transport` if the queue cannot be declared or consumed,
    ///   or an ack/nack fails
    pub async fn run(&self) -> Result<()> {
        // ---
        let inner = &self.inner;

        if inner.running.swap(true, Ordering::AcqRel) {
            return Err(RpcError::Transport(format!(
                "worker on {} already running",
                inner.request_queue
            )));
        }
        let _running = RunningGuard(&inner.running);

        let mut shutdown_rx = inner.shutdown_tx.subscribe();

        inner.transport.declare_queue(&inner.request_queue, true).await?;

        let mut handle = inner
            .transport
            .subscribe(&inner.request_queue, SubscribeOptions::manual_ack(PREFETCH))
            .await?;

        log_info!(
            "[{}] awaiting requests on {}",
            inner.transport.transport_id(),
            inner.request_queue
        );

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            let delivery = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => continue,
                next = handle.inbox.recv() => next,
            };

            let Some(delivery) = delivery else {
                if *shutdown_rx.borrow() {
                    break;
                }
                log_error!("request queue {} stream ended", inner.request_queue);
                return Err(RpcError::ConnectionLost);
            };

            let token = delivery.ack_token;
            match self.process(delivery).await {
                Disposition::Ack => inner.transport.ack(token).await?,
                Disposition::Reject => inner.transport.nack(token, false).await?,
            }
        }

        log_info!("worker on {} stopped", inner.request_queue);
        Ok(())
    }

    /// Run the worker on a background task.
    pub fn spawn(&self) -> JoinHandle<Result<()>> {
        let worker = self.clone();
        tokio::spawn(async move { worker.run().await })
    }

    /// Ask `run()` to return after the in-flight request. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
    }

    /// Steps 1 and 2 of the per-message contract. The caller acks or
    /// rejects based on the returned disposition.
    async fn process(&self, delivery: Delivery) -> Disposition {
        // ---
        let env = delivery.envelope;

        let (Some(correlation_id), Some(reply_to)) = (env.correlation_id, env.reply_to) else {
            log_warn!("request on {} lacks correlation_id or reply_to, rejected", env.address);
            return Disposition::Reject;
        };

        if delivery.redelivered {
            log_debug!("request {correlation_id} is a redelivery");
        }

        let handler = self.inner.handler.clone();
        let payload = env.payload;
        let outcome = tokio::spawn(async move { handler(payload).await }).await;

        let reply_payload = match outcome {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                log_error!("processing request {correlation_id} failed: {e}");
                return Disposition::Reject;
            }
            Err(join_err) => {
                log_error!("processing request {correlation_id} panicked: {join_err}");
                return Disposition::Reject;
            }
        };

        let reply = Envelope::response(reply_to, reply_payload, correlation_id.clone());

        if let Err(e) = self.inner.transport.publish(reply).await {
            log_error!("failed to publish reply for {correlation_id}: {e}");
            return Disposition::Reject;
        }

        log_debug!("replied to request {correlation_id}");
        Disposition::Ack
    }
}
