//! AMQP transport implementation using `lapin`.
//!
//! ## Concurrency model
//!
//! - A single background **actor task** owns the AMQP connection and channel.
//! - The actor serializes every channel operation: queue declaration,
//!   publishing, consumer setup, ack/nack and shutdown.
//! - One **consumer task** per subscription forwards deliveries from the
//!   lapin consumer stream into that subscription's inbox.
//!
//! This keeps the public `Transport` contract (`Send + Sync`) while every
//! AMQP call goes through one owner, so delivery tags are always acked on
//! the channel that issued them.
//!
//! ## Message mapping
//!
//! Envelopes map directly onto AMQP properties: the payload is the message
//! body, `correlation_id` and `reply_to` are the standard basic properties.
//! Publishing uses the default exchange with the queue name as routing key.
//!
//! ## Connection loss
//!
//! When the broker connection drops, every consumer stream yields an error
//! or ends; the consumer task exits and its inbox closes. Nothing is
//! retried here. Owners see the closed inbox (the worker reports
//! `ConnectionLost`) and decide whether to restart.

use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicConsumeOptions,
        BasicNackOptions,
        BasicPublishOptions,
        BasicQosOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
};

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
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

//
// Actor commands
//

enum Cmd {
    //
    DeclareQueue {
        name: String,
        durable: bool,
        resp: oneshot::Sender<Result<()>>,
    },
    DeclarePrivateQueue {
        resp: oneshot::Sender<Result<Address>>,
    },
    Publish {
        env: Envelope,
        resp: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        queue: String,
        opts: SubscribeOptions,
        inbox: mpsc::UnboundedSender<Delivery>,
        resp: oneshot::Sender<Result<()>>,
    },
    Ack {
        tag: u64,
        resp: oneshot::Sender<Result<()>>,
    },
    Nack {
        tag: u64,
        requeue: bool,
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

/// AMQP transport implementation using lapin.
pub struct AmqpTransport {
    // ---
    transport_id: String,
    cmd_tx: mpsc::Sender<Cmd>,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl AmqpTransport {
    /// Spawn the actor that owns `connection` and `channel`.
    fn create(transport_id: &str, connection: Connection, channel: Channel) -> TransportPtr {
        // ---
        let transport_id = transport_id.to_string();
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let actor = Actor {
            transport_id: transport_id.clone(),
            connection,
            channel,
            cmd_rx,
            consumers: Vec::new(),
            next_consumer: 0,
        };

        let handle = tokio::spawn(actor.run());

        Arc::new(Self {
            transport_id,
            cmd_tx,
            actor: Mutex::new(Some(handle)),
        })
    }

    /// Send a command and wait for the actor's reply.
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Cmd) -> Result<T> {
        // ---
        let (tx, rx) = oneshot::channel();

        self.cmd_tx.send(make(tx)).await.map_err(|_| {
            RpcError::Transport(format!("{}: actor command channel closed", self.transport_id))
        })?;

        rx.await.map_err(|_| {
            RpcError::Transport(format!("{}: actor dropped the request", self.transport_id))
        })?
    }
}

/// Background actor task that owns the AMQP connection and channel.
struct Actor {
    // ---
    transport_id: String,
    connection: Connection,
    channel: Channel,
    cmd_rx: mpsc::Receiver<Cmd>,
    consumers: Vec<JoinHandle<()>>,
    next_consumer: u64,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_info!("[{}] AMQP actor started", self.transport_id);

        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Cmd::Close { resp } => {
                    self.shutdown().await;
                    let _ = resp.send(Ok(()));
                    return;
                }
                other => self.handle_cmd(other).await,
            }
        }

        // Every transport handle dropped without close().
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        // ---
        self.cmd_rx.close();

        for handle in self.consumers.drain(..) {
            handle.abort();
        }

        let _ = self.channel.close(200, "Normal shutdown".into()).await;
        let _ = self.connection.close(200, "Normal shutdown".into()).await;

        log_info!("[{}] AMQP actor stopped", self.transport_id);
    }

    async fn handle_cmd(&mut self, cmd: Cmd) {
        // ---
        match cmd {
            Cmd::DeclareQueue {
                name,
                durable,
                resp,
            } => {
                let _ = resp.send(self.do_declare(name, durable).await);
            }
            Cmd::DeclarePrivateQueue { resp } => {
                let _ = resp.send(self.do_declare_private().await);
            }
            Cmd::Publish { env, resp } => {
                let _ = resp.send(self.do_publish(env).await);
            }
            Cmd::Subscribe {
                queue,
                opts,
                inbox,
                resp,
            } => {
                let _ = resp.send(self.do_subscribe(queue, opts, inbox).await);
            }
            Cmd::Ack { tag, resp } => {
                let result = self
                    .channel
                    .basic_ack(tag, BasicAckOptions::default())
                    .await
                    .map_err(|e| RpcError::Transport(format!("amqp: ack failed: {e}")));
                let _ = resp.send(result);
            }
            Cmd::Nack { tag, requeue, resp } => {
                let opts = BasicNackOptions {
                    multiple: false,
                    requeue,
                };
                let result = self
                    .channel
                    .basic_nack(tag, opts)
                    .await
                    .map_err(|e| RpcError::Transport(format!("amqp: nack failed: {e}")));
                let _ = resp.send(result);
            }
            Cmd::Close { resp } => {
                // Intercepted by run(); never reaches here.
                let _ = resp.send(Ok(()));
            }
        }
    }

    async fn do_declare(&mut self, name: String, durable: bool) -> Result<()> {
        // ---
        let opts = QueueDeclareOptions {
            durable,
            ..QueueDeclareOptions::default()
        };

        self.channel
            .queue_declare(name.clone().into(), opts, FieldTable::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: queue declare failed: {e}")))?;

        log_info!("[{}] Declared queue: {name} (durable={durable})", self.transport_id);
        Ok(())
    }

    async fn do_declare_private(&mut self) -> Result<Address> {
        // ---
        let opts = QueueDeclareOptions {
            exclusive: true,
            auto_delete: true,
            ..QueueDeclareOptions::default()
        };

        // Empty name asks the broker to generate one.
        let queue = self
            .channel
            .queue_declare("".into(), opts, FieldTable::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: private queue declare failed: {e}")))?;

        let name = queue.name().as_str().to_string();
        log_info!("[{}] Declared private queue: {name}", self.transport_id);

        Ok(Address::from(name))
    }

    async fn do_publish(&mut self, env: Envelope) -> Result<()> {
        // ---
        let queue = env.address.as_str();

        let mut props = BasicProperties::default();
        if let Some(id) = env.correlation_id.as_deref() {
            props = props.with_correlation_id(id.into());
        }
        if let Some(reply_to) = env.reply_to.as_ref() {
            props = props.with_reply_to(reply_to.as_str().into());
        }
        if let Some(content_type) = env.content_type.as_deref() {
            props = props.with_content_type(content_type.into());
        }

        // Fire-and-forget: the publisher confirm is not awaited.
        self.channel
            .basic_publish(
                "".into(),    // default exchange
                queue.into(), // routing key = queue name
                BasicPublishOptions::default(),
                &env.payload,
                props,
            )
            .await
            .map_err(|e| RpcError::Publish(format!("amqp: publish failed: {e}")))?;

        log_debug!("[{}] Published to queue: {queue}", self.transport_id);
        Ok(())
    }

    async fn do_subscribe(
        &mut self,
        queue: String,
        opts: SubscribeOptions,
        inbox: mpsc::UnboundedSender<Delivery>,
    ) -> Result<()> {
        // ---
        if let (false, Some(prefetch)) = (opts.auto_ack, opts.prefetch) {
            self.channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(|e| RpcError::Transport(format!("amqp: qos failed: {e}")))?;
        }

        self.next_consumer += 1;
        let n = self.next_consumer;
        let consume_opts = BasicConsumeOptions {
            no_ack: opts.auto_ack,
            ..BasicConsumeOptions::default()
        };

        let consumer = self
            .channel
            .basic_consume(
                queue.clone().into(),
                format!("{}-consumer-{n}", self.transport_id).into(),
                consume_opts,
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: consume failed: {e}")))?;

        log_info!("[{}] Started consuming queue: {queue}", self.transport_id);

        let transport_id = self.transport_id.clone();
        let handle = tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let mut consumer = consumer;
            while let Some(delivery_result) = consumer.next().await {
                let delivery = match delivery_result {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        log_error!("[{transport_id}] Consumer error on {queue}: {e}");
                        break;
                    }
                };

                let props = &delivery.properties;
                let envelope = Envelope {
                    address: Address::from(queue.as_str()),
                    payload: delivery.data.into(),
                    correlation_id: props.correlation_id().as_ref().map(|s| s.as_str().into()),
                    reply_to: props
                        .reply_to()
                        .as_ref()
                        .map(|s| Address::from(s.as_str())),
                    content_type: props.content_type().as_ref().map(|s| s.as_str().into()),
                };

                let forwarded = Delivery {
                    envelope,
                    ack_token: AckToken(delivery.delivery_tag),
                    redelivered: delivery.redelivered,
                };

                if inbox.send(forwarded).is_err() {
                    log_warn!("[{transport_id}] Subscriber for {queue} went away");
                    break;
                }
            }

            log_info!("[{transport_id}] Consumer task ended for queue: {queue}");
        });

        self.consumers.push(handle);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<()> {
        let name = name.to_string();
        self.request(|resp| Cmd::DeclareQueue {
            name,
            durable,
            resp,
        })
        .await
    }

    async fn declare_private_queue(&self) -> Result<Address> {
        self.request(|resp| Cmd::DeclarePrivateQueue { resp }).await
    }

    async fn publish(&self, env: Envelope) -> Result<()> {
        self.request(|resp| Cmd::Publish { env, resp })
            .await
            .map_err(|e| match e {
                RpcError::Transport(msg) => RpcError::Publish(msg),
                other => other,
            })
    }

    async fn subscribe(&self, queue: &str, opts: SubscribeOptions) -> Result<SubscriptionHandle> {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = queue.to_string();

        self.request(|resp| Cmd::Subscribe {
            queue,
            opts,
            inbox: tx,
            resp,
        })
        .await?;

        Ok(SubscriptionHandle { inbox: rx })
    }

    async fn ack(&self, token: AckToken) -> Result<()> {
        self.request(|resp| Cmd::Ack { tag: token.0, resp }).await
    }

    async fn nack(&self, token: AckToken, requeue: bool) -> Result<()> {
        self.request(|resp| Cmd::Nack {
            tag: token.0,
            requeue,
            resp,
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();

        // A closed command channel means we already shut down.
        if self.cmd_tx.send(Cmd::Close { resp: tx }).await.is_ok() {
            let _ = rx.await;
        }

        let handle = match self.actor.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        Ok(())
    }
}

/// Connect to the broker named in `config.broker` and return a transport.
///
/// # Errors
///
/// Returns `RpcError::MissingConfig` if no broker is configured, and
/// `RpcError::Connection` if the broker is unreachable, rejects the
/// credentials, or does not have the virtual host.
pub async fn create_transport(config: &RpcConfig) -> Result<TransportPtr> {
    // ---
    let (connection, channel) = create_amqp_connection(config).await?;
    Ok(AmqpTransport::create(
        &config.transport_id,
        connection,
        channel,
    ))
}

/// Creates an AMQP connection and channel from the given configuration.
async fn create_amqp_connection(config: &RpcConfig) -> Result<(Connection, Channel)> {
    // ---
    let broker = config
        .broker
        .as_ref()
        .ok_or_else(|| RpcError::MissingConfig("broker".to_string()))?;

    let uri = broker.amqp_uri()?;

    log_info!(
        "Connecting to AMQP broker {} (vhost {})",
        broker.host,
        broker.vhost
    );

    let connection = Connection::connect(&uri, ConnectionProperties::default())
        .await
        .map_err(|e| {
            let msg = format!("amqp: connection failed: {e}");
            log_error!("{msg}");
            RpcError::Connection(msg)
        })?;

    let channel = connection.create_channel().await.map_err(|e| {
        let msg = format!("amqp: channel creation failed: {e}");
        log_error!("{msg}");
        RpcError::Connection(msg)
    })?;

    log_info!("Connected to AMQP broker");

    Ok((connection, channel))
}
