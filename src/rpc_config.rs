//! Public RPC configuration.
//!
//! [`BrokerConfig`] carries the four broker connection settings read from
//! the environment. [`RpcConfig`] wraps it together with the queue name and
//! default timeout shared by clients and workers.

use std::time::Duration;

use url::Url;

use crate::{Result, RpcError};

/// Environment variable holding the broker host (optionally `host:port`).
pub const ENV_HOST: &str = "RABBITMQ_HOST";
/// Environment variable holding the broker username.
pub const ENV_USER: &str = "RABBITMQ_DEFAULT_USER";
/// Environment variable holding the broker password.
pub const ENV_PASS: &str = "RABBITMQ_DEFAULT_PASS";
/// Environment variable holding the broker virtual host.
pub const ENV_VHOST: &str = "RABBITMQ_DEFAULT_VHOST";

/// Default name of the shared request queue.
pub const DEFAULT_REQUEST_QUEUE: &str = "request_queue";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Broker connection settings.
///
/// Values are opaque strings supplied externally; nothing here validates
/// them beyond building a URI.
#[derive(Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    pub vhost: String,
}

impl BrokerConfig {
    /// Read all four settings from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::MissingConfig`] naming the first unset variable.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary lookup function.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // ---
        let get = |key: &str| lookup(key).ok_or_else(|| RpcError::MissingConfig(key.to_string()));

        Ok(Self {
            host: get(ENV_HOST)?,
            username: get(ENV_USER)?,
            password: get(ENV_PASS)?,
            vhost: get(ENV_VHOST)?,
        })
    }

    /// Build the `amqp://` connection URI.
    ///
    /// Credentials and the virtual host are percent-encoded, so the default
    /// vhost `/` becomes `%2F`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Connection`] if the host does not form a valid URI.
    pub fn amqp_uri(&self) -> Result<String> {
        // ---
        let invalid = |what: &str| RpcError::Connection(format!("invalid broker {what}"));

        let mut url =
            Url::parse(&format!("amqp://{}", self.host)).map_err(|_| invalid("host"))?;

        url.set_username(&self.username)
            .map_err(|_| invalid("username"))?;
        url.set_password(Some(&self.password))
            .map_err(|_| invalid("password"))?;
        url.path_segments_mut()
            .map_err(|_| invalid("host"))?
            .clear()
            .push(&self.vhost);

        Ok(url.to_string())
    }
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("vhost", &self.vhost)
            .finish()
    }
}

/// Configuration shared by [`RpcClient`](crate::RpcClient) and
/// [`RpcWorker`](crate::RpcWorker).
#[derive(Debug, Clone)]
pub struct RpcConfig {
    // ---
    /// Broker settings. `None` selects the in-memory transport.
    pub broker: Option<BrokerConfig>,

    /// Unique identifier for this transport instance, used for logging.
    pub transport_id: String,

    /// Queue requests are published to and consumed from.
    pub request_queue: String,

    /// Deadline used by [`RpcClient::call_default`](crate::RpcClient::call_default).
    ///
    /// Default: 30 seconds
    pub request_timeout: Duration,
}

impl RpcConfig {
    /// Create a config that connects to the given broker.
    pub fn with_broker(broker: BrokerConfig, transport_id: impl Into<String>) -> Self {
        Self {
            broker: Some(broker),
            transport_id: transport_id.into(),
            request_queue: DEFAULT_REQUEST_QUEUE.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Create a broker config from the `RABBITMQ_*` environment variables.
    pub fn from_env(transport_id: impl Into<String>) -> Result<Self> {
        Ok(Self::with_broker(BrokerConfig::from_env()?, transport_id))
    }

    /// Create a memory transport config (no broker).
    pub fn memory(transport_id: impl Into<String>) -> Self {
        Self {
            broker: None,
            transport_id: transport_id.into(),
            request_queue: DEFAULT_REQUEST_QUEUE.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Use a custom request queue name.
    pub fn with_request_queue(mut self, name: impl Into<String>) -> Self {
        self.request_queue = name.into();
        self
    }

    /// Set the default request timeout.
    ///
    /// # Example
    ///
    /// ```
    /// use queue_rpc::RpcConfig;
    /// use std::time::Duration;
    ///
    /// let config = RpcConfig::memory("client")
    ///     .with_request_timeout(Duration::from_secs(5));
    /// assert_eq!(config.request_timeout, Duration::from_secs(5));
    /// ```
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
