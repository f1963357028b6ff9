//! In-memory transport implementation.
//!
//! This module provides a pure in-process broker implementing the
//! domain-level `Transport` trait. It is intended for testing, local
//! execution, and as the reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! - Named queues hold messages until a consumer with spare capacity takes
//!   them. Publishing to an undeclared queue drops the message, like the
//!   AMQP default exchange.
//! - Several consumers on one queue compete; messages are handed out
//!   round-robin among consumers with capacity.
//! - A manual-ack consumer never holds more than `prefetch` unacknowledged
//!   deliveries. Ack frees a slot; nack frees it and optionally requeues
//!   the message at the head of its queue, flagged as redelivered.
//! - Private queues are exclusive to the transport that declared them and
//!   are deleted when it closes.
//! - Closing a transport ends its subscriptions and requeues whatever its
//!   consumers had not acknowledged. A consumer whose inbox was dropped is
//!   treated the same way.
//!
//! ## Non-Goals
//!
//! No persistence, no network behavior, no exchanges or routing keys
//! beyond queue names.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    // ---
    log_debug,
    AckToken,
    Address,
    Delivery,
    Envelope,
    Result,
    RpcConfig,
    RpcError,
    SubscribeOptions,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Message {
    envelope: Envelope,
    redelivered: bool,
}

struct Consumer {
    id: u64,
    connection: u64,
    tx: mpsc::UnboundedSender<Delivery>,
    prefetch: Option<u16>,
    auto_ack: bool,
    in_flight: usize,
}

impl Consumer {
    fn has_capacity(&self) -> bool {
        if self.auto_ack {
            return true;
        }
        match self.prefetch {
            Some(limit) => self.in_flight < usize::from(limit),
            None => true,
        }
    }
}

struct Queue {
    durable: bool,
    /// Connection holding the queue exclusively.
    owner: Option<u64>,
    ready: VecDeque<Message>,
    consumers: Vec<Consumer>,
    cursor: usize,
}

impl Queue {
    fn new(durable: bool, owner: Option<u64>) -> Self {
        Self {
            durable,
            owner,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            cursor: 0,
        }
    }

    fn accessible_by(&self, connection: u64) -> bool {
        self.owner.map_or(true, |owner| owner == connection)
    }

    /// Round-robin pick among consumers with spare capacity.
    fn next_consumer(&mut self) -> Option<usize> {
        // ---
        let n = self.consumers.len();
        for step in 0..n {
            let idx = (self.cursor + step) % n;
            if self.consumers[idx].has_capacity() {
                self.cursor = (idx + 1) % n;
                return Some(idx);
            }
        }
        None
    }
}

struct Unacked {
    queue: String,
    consumer: u64,
    /// Delivery tags are scoped to the connection that received them.
    connection: u64,
    message: Message,
}

#[derive(Default)]
struct HubState {
    queues: HashMap<String, Queue>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    next_consumer: u64,
}

impl HubState {
    /// Hand ready messages to consumers until one side runs out.
    fn dispatch(&mut self, queue_name: &str) {
        // ---
        self.reap_closed_consumers(queue_name);

        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.ready.is_empty() {
                return;
            }
            let Some(idx) = queue.next_consumer() else {
                return;
            };
            let Some(message) = queue.ready.pop_front() else {
                return;
            };

            self.next_tag += 1;
            let tag = self.next_tag;

            let consumer = &mut queue.consumers[idx];
            let delivery = Delivery {
                envelope: message.envelope.clone(),
                ack_token: AckToken(tag),
                redelivered: message.redelivered,
            };

            if consumer.tx.send(delivery).is_ok() {
                if !consumer.auto_ack {
                    consumer.in_flight += 1;
                    self.unacked.insert(
                        tag,
                        Unacked {
                            queue: queue_name.to_string(),
                            consumer: consumer.id,
                            connection: consumer.connection,
                            message,
                        },
                    );
                }
            } else {
                let dead = consumer.id;
                queue.consumers.remove(idx);
                queue.ready.push_front(message);
                self.requeue_consumer(dead);
            }
        }
    }

    fn reap_closed_consumers(&mut self, queue_name: &str) {
        // ---
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        let closed: Vec<u64> = queue
            .consumers
            .iter()
            .filter(|c| c.tx.is_closed())
            .map(|c| c.id)
            .collect();

        if closed.is_empty() {
            return;
        }

        queue.consumers.retain(|c| !c.tx.is_closed());
        for id in closed {
            self.requeue_consumer(id);
        }
    }

    /// Return every unacknowledged delivery of `consumer` to the head of its
    /// queue, preserving the original order.
    fn requeue_consumer(&mut self, consumer: u64) {
        // ---
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.consumer == consumer)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));

        for tag in tags {
            if let Some(entry) = self.unacked.remove(&tag) {
                self.requeue(entry);
            }
        }
    }

    fn requeue(&mut self, entry: Unacked) {
        if let Some(queue) = self.queues.get_mut(&entry.queue) {
            queue.ready.push_front(Message {
                envelope: entry.message.envelope,
                redelivered: true,
            });
        }
    }

    /// Remove an unacked delivery and release its consumer's slot.
    ///
    /// Only the connection the message was delivered on may settle it.
    fn settle(&mut self, connection: u64, tag: u64) -> Result<Unacked> {
        // ---
        let owned = self
            .unacked
            .get(&tag)
            .is_some_and(|entry| entry.connection == connection);
        if !owned {
            return Err(RpcError::Transport(format!("unknown delivery tag {tag}")));
        }

        let entry = self
            .unacked
            .remove(&tag)
            .ok_or_else(|| RpcError::Transport(format!("unknown delivery tag {tag}")))?;

        if let Some(queue) = self.queues.get_mut(&entry.queue) {
            if let Some(c) = queue.consumers.iter_mut().find(|c| c.id == entry.consumer) {
                c.in_flight = c.in_flight.saturating_sub(1);
            }
        }

        Ok(entry)
    }
}

/// Shared message bus for the in-memory transport.
///
/// Simulates a message broker within a single process. All transports that
/// share a `MemoryHub` see the same queues, exactly as connections to one
/// real broker would.
///
/// Construct a hub explicitly for test isolation and pass it to
/// [`create_memory_transport_with_hub`]:
///
/// ```
/// # use queue_rpc::{MemoryHub, RpcConfig};
/// # async fn example() -> queue_rpc::Result<()> {
/// let hub = MemoryHub::new();
///
/// let worker_side = queue_rpc::create_memory_transport_with_hub(&RpcConfig::memory("worker"), hub.clone()).await?;
/// let client_side = queue_rpc::create_memory_transport_with_hub(&RpcConfig::memory("client"), hub.clone()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct MemoryHub {
    // ---
    state: Mutex<HubState>,
    next_connection: AtomicU64,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Messages waiting in `queue` for a consumer. `None` if undeclared.
    pub fn ready_count(&self, queue: &str) -> Option<usize> {
        let state = lock_ignore_poison(&self.state);
        state.queues.get(queue).map(|q| q.ready.len())
    }

    /// Deliveries handed out and not yet acknowledged, across all queues.
    pub fn unacked_count(&self) -> usize {
        lock_ignore_poison(&self.state).unacked.len()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        lock_ignore_poison(&self.state).queues.contains_key(queue)
    }

    fn declare_queue(&self, connection: u64, name: &str, durable: bool) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        match state.queues.get(name) {
            Some(queue) if !queue.accessible_by(connection) => Err(RpcError::Transport(format!(
                "queue {name} is exclusive to another connection"
            ))),
            Some(queue) if queue.durable != durable => Err(RpcError::Transport(format!(
                "queue {name} already declared with durable={}",
                queue.durable
            ))),
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(name.to_string(), Queue::new(durable, None));
                Ok(())
            }
        }
    }

    fn declare_private_queue(&self, connection: u64) -> Address {
        // ---
        let name = format!("amq.gen-{}", Uuid::new_v4().simple());

        lock_ignore_poison(&self.state)
            .queues
            .insert(name.clone(), Queue::new(false, Some(connection)));

        Address::from(name)
    }

    fn publish(&self, transport_id: &str, env: Envelope) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        let queue_name = env.address.as_str().to_string();

        let Some(queue) = state.queues.get_mut(&queue_name) else {
            log_debug!("{transport_id}: no queue {queue_name}, message dropped");
            return;
        };

        queue.ready.push_back(Message {
            envelope: env,
            redelivered: false,
        });
        state.dispatch(&queue_name);
    }

    fn subscribe(
        &self,
        connection: u64,
        queue_name: &str,
        opts: SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        state.next_consumer += 1;
        let id = state.next_consumer;

        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| RpcError::Transport(format!("no queue {queue_name}")))?;

        if !queue.accessible_by(connection) {
            return Err(RpcError::Transport(format!(
                "queue {queue_name} is exclusive to another connection"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        queue.consumers.push(Consumer {
            id,
            connection,
            tx,
            prefetch: opts.prefetch,
            auto_ack: opts.auto_ack,
            in_flight: 0,
        });

        state.dispatch(queue_name);

        Ok(SubscriptionHandle { inbox: rx })
    }

    fn ack(&self, connection: u64, tag: u64) -> Result<()> {
        let mut state = lock_ignore_poison(&self.state);
        let entry = state.settle(connection, tag)?;
        state.dispatch(&entry.queue);
        Ok(())
    }

    fn nack(&self, connection: u64, tag: u64, requeue: bool) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        let entry = state.settle(connection, tag)?;
        let queue = entry.queue.clone();

        if requeue {
            state.requeue(entry);
        }
        state.dispatch(&queue);
        Ok(())
    }

    fn close(&self, connection: u64) {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        let mut dropped = Vec::new();
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| {
                let mine = c.connection == connection;
                if mine {
                    dropped.push(c.id);
                }
                !mine
            });
            queue.cursor = 0;
        }

        // Exclusive queues go away with their connection; requeueing into a
        // deleted queue discards the message.
        state.queues.retain(|_, q| q.owner != Some(connection));

        for id in dropped {
            state.requeue_consumer(id);
        }

        let names: Vec<String> = state.queues.keys().cloned().collect();
        for name in names {
            state.dispatch(&name);
        }
    }
}

/// Process-global hub used by [`create_memory_transport`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// In-memory transport: one "connection" to a [`MemoryHub`].
struct MemoryTransport {
    // ---
    transport_id: String,
    connection: u64,
    hub: Arc<MemoryHub>,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::Transport(format!(
                "{}: transport closed",
                self.transport_id
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<()> {
        self.ensure_open()?;
        self.hub.declare_queue(self.connection, name, durable)
    }

    async fn declare_private_queue(&self) -> Result<Address> {
        self.ensure_open()?;
        Ok(self.hub.declare_private_queue(self.connection))
    }

    async fn publish(&self, env: Envelope) -> Result<()> {
        // ---
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::Publish(format!(
                "{}: transport closed",
                self.transport_id
            )));
        }
        self.hub.publish(&self.transport_id, env);
        Ok(())
    }

    async fn subscribe(&self, queue: &str, opts: SubscribeOptions) -> Result<SubscriptionHandle> {
        self.ensure_open()?;
        log_debug!("{}: subscribe to {queue} ({opts:?})", self.transport_id);
        self.hub.subscribe(self.connection, queue, opts)
    }

    async fn ack(&self, token: AckToken) -> Result<()> {
        self.ensure_open()?;
        self.hub.ack(self.connection, token.0)
    }

    async fn nack(&self, token: AckToken, requeue: bool) -> Result<()> {
        self.ensure_open()?;
        self.hub.nack(self.connection, token.0, requeue)
    }

    /// Deletes this transport's private queues, ends its subscriptions and
    /// requeues its unacknowledged deliveries. Other transports on the same
    /// hub are unaffected.
    async fn close(&self) -> Result<()> {
        // ---
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log_debug!("{}: closing transport", self.transport_id);
        self.hub.close(self.connection);
        Ok(())
    }
}

/// Create a new in-memory transport on the process-global hub.
///
/// All transports created with this function share a single broker. For
/// isolated parallel tests use [`create_memory_transport_with_hub`].
///
/// # Errors
///
/// Currently infallible.
pub async fn create_memory_transport(config: &RpcConfig) -> Result<TransportPtr> {
    create_memory_transport_with_hub(config, global_hub()).await
}

/// Create a new in-memory transport on the provided hub.
///
/// # Errors
///
/// Currently infallible.
pub async fn create_memory_transport_with_hub(
    config: &RpcConfig,
    hub: Arc<MemoryHub>,
) -> Result<TransportPtr> {
    // ---
    let connection = hub.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
    log_debug!("{}: create memory transport", config.transport_id);

    Ok(Arc::new(MemoryTransport {
        transport_id: config.transport_id.clone(),
        connection,
        hub,
        closed: AtomicBool::new(false),
    }))
}
