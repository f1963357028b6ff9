// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the broker-facing interface used by the client and
//! worker layers. It intentionally avoids any reference to concrete brokers
//! or client libraries.
//!
//! The transport layer is responsible only for queues and for delivering
//! opaque envelopes to subscribed consumers. RPC correlation and timeouts
//! are handled by the client; processing and acknowledgement policy by the
//! worker.
//!
//! Concrete implementations of this interface live under `src/transport/`.

use crate::Result;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

/// A transport address.
///
/// Names a queue to which messages may be published. For the AMQP
/// transport this is the routing key on the default exchange, which equals
/// the queue name.
///
/// Addresses are immutable, cheap to clone, and safe to share across threads.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address(pub Arc<str>);

impl Address {
    /// Borrow the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for Address
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        Address(value.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An opaque message envelope.
///
/// Carries a payload plus the two attributes the RPC layer needs: the
/// correlation identifier and, on requests, the reply destination.
///
/// # Examples
///
/// ```
/// # use queue_rpc::{Address, Envelope};
/// # use bytes::Bytes;
/// # use std::sync::Arc;
/// let request = Envelope::request(
///     Address::from("request_queue"),
///     Bytes::from_static(b"ping"),
///     Arc::from("correlation-123"),
///     Address::from("amq.gen-reply"),
/// );
/// assert!(request.reply_to.is_some());
///
/// let response = Envelope::response(
///     Address::from("amq.gen-reply"),
///     Bytes::from_static(b"pong"),
///     Arc::from("correlation-123"),
/// );
/// assert!(response.reply_to.is_none());
/// ```
#[derive(Clone, Debug)]
pub struct Envelope {
    // ---
    /// Queue the envelope is published to.
    pub address: Address,

    /// Opaque payload bytes.
    pub payload: Bytes,

    /// Correlation identifier used to associate requests with responses.
    pub correlation_id: Option<Arc<str>>,

    /// Queue the response must be published to. Set on requests only.
    pub reply_to: Option<Address>,

    /// Optional content type metadata (e.g. "application/json").
    ///
    /// Informational only; not enforced by the RPC layer.
    pub content_type: Option<Arc<str>>,
}

impl Envelope {
    // ---
    /// Create a request envelope.
    pub fn request(
        address: Address,
        payload: Bytes,
        correlation_id: Arc<str>,
        reply_to: Address,
    ) -> Self {
        Self {
            address,
            payload,
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to),
            content_type: None,
        }
    }

    /// Create a response envelope addressed to a request's `reply_to`.
    pub fn response(address: Address, payload: Bytes, correlation_id: Arc<str>) -> Self {
        Self {
            address,
            payload,
            correlation_id: Some(correlation_id),
            reply_to: None,
            content_type: None,
        }
    }

    /// Attach content type metadata.
    pub fn with_content_type(mut self, content_type: impl Into<Arc<str>>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Broker-assigned token identifying one delivery for ack/nack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AckToken(pub u64);

/// A message handed to a subscriber.
#[derive(Clone, Debug)]
pub struct Delivery {
    // ---
    pub envelope: Envelope,

    /// Token for [`Transport::ack`] / [`Transport::nack`].
    ///
    /// Meaningless for subscriptions opened with `auto_ack`.
    pub ack_token: AckToken,

    /// True if the broker delivered this message before and it was
    /// requeued.
    pub redelivered: bool,
}

/// Consumer options for [`Transport::subscribe`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Upper bound on unacknowledged deliveries to this subscriber.
    /// `None` means unlimited.
    pub prefetch: Option<u16>,

    /// Deliveries count as acknowledged the moment they are sent.
    pub auto_ack: bool,
}

impl SubscribeOptions {
    /// Manual acknowledgement with the given prefetch bound.
    pub fn manual_ack(prefetch: u16) -> Self {
        Self {
            prefetch: Some(prefetch),
            auto_ack: false,
        }
    }

    /// Broker acknowledges on send; no prefetch bound.
    pub fn auto_ack() -> Self {
        Self {
            prefetch: None,
            auto_ack: true,
        }
    }
}

/// Handle returned from a successful subscription.
///
/// The inbox yields deliveries until the transport is closed or the
/// connection is lost, at which point `recv()` returns `None`.
///
/// # Example
///
/// ```no_run
/// # use queue_rpc::{RpcConfig, SubscribeOptions};
/// # async fn example() -> queue_rpc::Result<()> {
/// let transport = queue_rpc::create_transport(&RpcConfig::memory("app")).await?;
/// transport.declare_queue("jobs", true).await?;
///
/// let mut handle = transport
///     .subscribe("jobs", SubscribeOptions::manual_ack(1))
///     .await?;
///
/// while let Some(delivery) = handle.inbox.recv().await {
///     println!("received: {:?}", delivery.envelope.payload);
///     transport.ack(delivery.ack_token).await?;
/// }
/// # Ok(())
/// # }
/// ```
pub struct SubscriptionHandle {
    // ---
    /// Receiver channel for deliveries on the subscribed queue.
    pub inbox: mpsc::UnboundedReceiver<Delivery>,
}

/// Broker transport abstraction.
///
/// Implementations must ensure that:
/// - `declare_queue()` is idempotent for identical arguments.
/// - `publish()` returns once the envelope is handed to the broker; it does
///   not wait for consumers.
/// - A subscription never holds more than `prefetch` unacknowledged
///   deliveries.
/// - Closing the transport ends every inbox it handed out.
///
/// The in-memory transport serves as the reference implementation of these
/// semantics.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Identifier of this transport instance, used for logging.
    fn transport_id(&self) -> &str;

    /// Declare a named queue. Idempotent.
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<()>;

    /// Declare an exclusive, auto-named, non-durable queue that lives as
    /// long as this transport's connection.
    async fn declare_private_queue(&self) -> Result<Address>;

    /// Publish an envelope to `env.address`. Fire-and-forget.
    async fn publish(&self, env: Envelope) -> Result<()>;

    /// Start consuming `queue`.
    async fn subscribe(&self, queue: &str, opts: SubscribeOptions) -> Result<SubscriptionHandle>;

    /// Acknowledge a delivery.
    async fn ack(&self, token: AckToken) -> Result<()>;

    /// Reject a delivery, optionally returning it to its queue.
    async fn nack(&self, token: AckToken, requeue: bool) -> Result<()>;

    /// Close the transport and release any associated resources. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// `.clone()` is cheap and every clone shares the same underlying
/// connection. The owner passes it explicitly into clients and workers.
pub type TransportPtr = Arc<dyn Transport>;
