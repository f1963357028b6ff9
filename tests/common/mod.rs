#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};

use queue_rpc::{
    //
    create_memory_transport_with_hub,
    AckToken,
    Address,
    Envelope,
    MemoryHub,
    Result,
    RpcConfig,
    RpcError,
    SubscribeOptions,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Two transports on a fresh hub: one for the worker, one for the client.
pub async fn hub_pair(test: &str) -> (Arc<MemoryHub>, TransportPtr, TransportPtr) {
    // ---
    let hub = MemoryHub::new();
    let worker = create_memory_transport_with_hub(&RpcConfig::memory(format!("{test}-worker")), hub.clone())
        .await
        .expect("worker transport");
    let client = create_memory_transport_with_hub(&RpcConfig::memory(format!("{test}-client")), hub.clone())
        .await
        .expect("client transport");
    (hub, worker, client)
}

/// Ordered log of events shared between a handler and a transport wrapper.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Wraps a transport, recording acks and nacks and optionally failing
/// every publish.
pub struct InstrumentedTransport {
    pub inner: TransportPtr,
    pub log: EventLog,
    pub fail_publish: bool,
}

impl InstrumentedTransport {
    pub fn wrap(inner: TransportPtr, log: EventLog) -> TransportPtr {
        Arc::new(Self {
            inner,
            log,
            fail_publish: false,
        })
    }

    pub fn failing_publish(inner: TransportPtr) -> TransportPtr {
        Arc::new(Self {
            inner,
            log: EventLog::default(),
            fail_publish: true,
        })
    }
}

#[async_trait::async_trait]
impl Transport for InstrumentedTransport {
    fn transport_id(&self) -> &str {
        self.inner.transport_id()
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<()> {
        self.inner.declare_queue(name, durable).await
    }

    async fn declare_private_queue(&self) -> Result<Address> {
        self.inner.declare_private_queue().await
    }

    async fn publish(&self, env: Envelope) -> Result<()> {
        if self.fail_publish {
            return Err(RpcError::Publish("injected failure".into()));
        }
        self.inner.publish(env).await
    }

    async fn subscribe(&self, queue: &str, opts: SubscribeOptions) -> Result<SubscriptionHandle> {
        self.inner.subscribe(queue, opts).await
    }

    async fn ack(&self, token: AckToken) -> Result<()> {
        self.log.push("ack");
        self.inner.ack(token).await
    }

    async fn nack(&self, token: AckToken, requeue: bool) -> Result<()> {
        self.log.push(format!("nack requeue={requeue}"));
        self.inner.nack(token, requeue).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
