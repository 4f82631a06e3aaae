//! Connection pool with a dedicated Pub/Sub lease.
//!
//! The pool keeps a bounded set of connections to one server. Ordinary
//! commands lease a connection, run, and return it. Because a subscribed
//! connection can only execute the Pub/Sub allowlist, the pool dedicates a
//! single connection to host all pool-level subscriptions; that connection
//! stays leased until its last subscription is confirmed gone, at which
//! point it rejoins the free set.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use regex::Regex;
use thiserror::Error;
use tokio::time::{sleep, Instant};

use crate::connection::{Connection, ConnectionError};
use crate::resp::RespValue;
use crate::subscriptions::{MessageHandler, PatternMessageHandler, SubscriptionChangeHandler};

const POOL_LOCK_MSG: &str = "pool state lock poisoned";

/// Errors surfaced by pool operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("invalid server address")]
    InvalidAddress,
    #[error("invalid pool configuration")]
    InvalidConfiguration,
    #[error("connection attempts timed out")]
    ConnectTimeout,
    #[error("connection pool exhausted")]
    Exhausted,
    #[error("pool closed")]
    Closed,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Configuration for a [`ConnectionPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Server address in `host:port` form, e.g. "127.0.0.1:6379".
    pub address: String,
    /// Connections the pool establishes lazily and keeps around.
    pub minimum_connection_count: usize,
    /// Upper bound on live connections, idle and leased combined.
    pub maximum_connection_count: usize,
    /// Delay before the second attempt when dialing fails.
    pub initial_connection_backoff_delay: Duration,
    /// Multiplier applied to the backoff delay after each failed attempt.
    pub connection_backoff_factor: f64,
    /// Total time budget for establishing one connection.
    pub connection_retry_timeout: Duration,
    /// Password sent via AUTH on every newly established connection.
    pub password: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            address: "127.0.0.1:6379".to_string(),
            minimum_connection_count: 1,
            maximum_connection_count: 8,
            initial_connection_backoff_delay: Duration::from_millis(100),
            connection_backoff_factor: 2.0,
            connection_retry_timeout: Duration::from_secs(10),
            password: None,
        }
    }
}

struct PoolState {
    idle: VecDeque<Arc<Connection>>,
    /// Live connections, idle and leased combined.
    total: usize,
    leased: usize,
    /// The connection dedicated to pool-level subscriptions, counted as
    /// leased while present.
    pub_sub: Option<Arc<Connection>>,
    closed: bool,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
}

/// A bounded pool of connections to a single server.
///
/// Cloning the pool clones a handle to the same underlying state.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a pool for the configured endpoint.
    ///
    /// No connection is dialed here; the pool fills lazily on first use.
    ///
    /// # Returns
    ///
    /// * `Ok(ConnectionPool)` - The validated, empty pool
    /// * `Err(PoolError::InvalidAddress)` - The address is not `host:port`
    /// * `Err(PoolError::InvalidConfiguration)` - Zero maximum, or minimum
    ///   above maximum
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        validate_address(&config.address)?;

        if config.maximum_connection_count == 0
            || config.minimum_connection_count > config.maximum_connection_count
        {
            return Err(PoolError::InvalidConfiguration);
        }

        let state = PoolState {
            idle: VecDeque::with_capacity(config.maximum_connection_count),
            total: 0,
            leased: 0,
            pub_sub: None,
            closed: false,
        };

        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(state),
            }),
        })
    }

    /// Number of connections currently leased out, the Pub/Sub lease
    /// included.
    pub fn leased_connection_count(&self) -> usize {
        let state = self.inner.state.lock().expect(POOL_LOCK_MSG);
        state.leased
    }

    /// True while the pool's dedicated Pub/Sub connection holds at least
    /// one subscription.
    pub fn is_subscribed(&self) -> bool {
        let state = self.inner.state.lock().expect(POOL_LOCK_MSG);
        state
            .pub_sub
            .as_ref()
            .map(|connection| connection.is_subscribed())
            .unwrap_or(false)
    }

    /// Sends one command on a leased connection and returns the reply.
    pub async fn send(&self, command: &str, args: &[&[u8]]) -> Result<RespValue, PoolError> {
        let connection = self.acquire().await?;
        let result = connection.send(command, args).await;
        self.release(connection);

        Ok(result?)
    }

    /// Checks the server is reachable through a pooled connection.
    pub async fn ping(&self, payload: Option<&[u8]>) -> Result<Vec<u8>, PoolError> {
        let connection = self.acquire().await?;
        let result = connection.ping(payload).await;
        self.release(connection);

        Ok(result?)
    }

    /// Publishes `payload` to `channel`, returning the number of
    /// subscribers the server delivered it to.
    pub async fn publish(&self, channel: &[u8], payload: &[u8]) -> Result<i64, PoolError> {
        let connection = self.acquire().await?;
        let result = connection.publish(channel, payload).await;
        self.release(connection);

        Ok(result?)
    }

    /// Fetches a value through a pooled connection.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PoolError> {
        let connection = self.acquire().await?;
        let result = connection.get(key).await;
        self.release(connection);

        Ok(result?)
    }

    /// Stores a value through a pooled connection.
    pub async fn set(&self, key: &[u8], value: &[u8]) -> Result<(), PoolError> {
        let connection = self.acquire().await?;
        let result = connection.set(key, value).await;
        self.release(connection);

        Ok(result?)
    }

    /// Deletes keys through a pooled connection, returning how many
    /// existed.
    pub async fn del(&self, keys: &[&[u8]]) -> Result<i64, PoolError> {
        let connection = self.acquire().await?;
        let result = connection.del(keys).await;
        self.release(connection);

        Ok(result?)
    }

    /// Subscribes to channels on the pool's dedicated Pub/Sub connection.
    ///
    /// The first subscription leases a connection and keeps it leased;
    /// later subscriptions reuse it without taking another lease.
    pub async fn subscribe(
        &self,
        channels: &[&[u8]],
        handler: MessageHandler,
        on_subscribe: Option<SubscriptionChangeHandler>,
        on_unsubscribe: Option<SubscriptionChangeHandler>,
    ) -> Result<(), PoolError> {
        let connection = self.lease_pub_sub().await?;
        let result = connection
            .subscribe(channels, handler, on_subscribe, on_unsubscribe)
            .await;

        if result.is_err() {
            self.release_pub_sub_if_idle();
        }

        Ok(result?)
    }

    /// Subscribes to patterns on the pool's dedicated Pub/Sub connection.
    pub async fn psubscribe(
        &self,
        patterns: &[&[u8]],
        handler: PatternMessageHandler,
        on_subscribe: Option<SubscriptionChangeHandler>,
        on_unsubscribe: Option<SubscriptionChangeHandler>,
    ) -> Result<(), PoolError> {
        let connection = self.lease_pub_sub().await?;
        let result = connection
            .psubscribe(patterns, handler, on_subscribe, on_unsubscribe)
            .await;

        if result.is_err() {
            self.release_pub_sub_if_idle();
        }

        Ok(result?)
    }

    /// Unsubscribes from channels on the dedicated Pub/Sub connection.
    ///
    /// Without an active Pub/Sub lease nothing is subscribed, so this
    /// succeeds locally without leasing a connection. Once the connection
    /// has confirmed its last subscription gone it returns to the free
    /// set and the lease count drops.
    pub async fn unsubscribe(&self, channels: &[&[u8]]) -> Result<(), PoolError> {
        let Some(connection) = self.pub_sub_connection() else {
            return Ok(());
        };

        let result = connection.unsubscribe(channels).await;
        self.release_pub_sub_if_idle();

        Ok(result?)
    }

    /// Unsubscribes from patterns on the dedicated Pub/Sub connection.
    pub async fn punsubscribe(&self, patterns: &[&[u8]]) -> Result<(), PoolError> {
        let Some(connection) = self.pub_sub_connection() else {
            return Ok(());
        };

        let result = connection.punsubscribe(patterns).await;
        self.release_pub_sub_if_idle();

        Ok(result?)
    }

    /// Closes every pooled connection and rejects future leases.
    pub async fn close(&self) {
        let (idle, pub_sub) = {
            let mut state = self.inner.state.lock().expect(POOL_LOCK_MSG);
            state.closed = true;
            state.total = 0;
            state.leased = 0;
            (std::mem::take(&mut state.idle), state.pub_sub.take())
        };

        for connection in idle {
            connection.close().await;
        }

        if let Some(connection) = pub_sub {
            connection.close().await;
        }
    }

    async fn acquire(&self) -> Result<Arc<Connection>, PoolError> {
        self.ensure_minimum().await;

        {
            let mut state = self.inner.state.lock().expect(POOL_LOCK_MSG);

            if state.closed {
                return Err(PoolError::Closed);
            }

            // Connections may have died while idle; skip past them.
            while let Some(connection) = state.idle.pop_front() {
                if connection.is_closed() {
                    state.total = state.total.saturating_sub(1);
                    continue;
                }

                state.leased += 1;
                return Ok(connection);
            }

            if state.total >= self.inner.config.maximum_connection_count {
                return Err(PoolError::Exhausted);
            }

            // Reserve the slot before dialing so concurrent leases cannot
            // overshoot the maximum.
            state.total += 1;
            state.leased += 1;
        }

        match self.open_connection().await {
            Ok(connection) => Ok(connection),
            Err(error) => {
                let mut state = self.inner.state.lock().expect(POOL_LOCK_MSG);
                state.total = state.total.saturating_sub(1);
                state.leased = state.leased.saturating_sub(1);
                Err(error)
            }
        }
    }

    fn release(&self, connection: Arc<Connection>) {
        let mut state = self.inner.state.lock().expect(POOL_LOCK_MSG);
        state.leased = state.leased.saturating_sub(1);

        if state.closed || connection.is_closed() {
            state.total = state.total.saturating_sub(1);
            return;
        }

        state.idle.push_back(connection);
    }

    /// Lazily brings the pool up to its configured minimum size.
    async fn ensure_minimum(&self) {
        loop {
            {
                let mut state = self.inner.state.lock().expect(POOL_LOCK_MSG);

                if state.closed || state.total >= self.inner.config.minimum_connection_count {
                    return;
                }

                state.total += 1;
            }

            match self.open_connection().await {
                Ok(connection) => {
                    let mut state = self.inner.state.lock().expect(POOL_LOCK_MSG);
                    state.idle.push_back(connection);
                }
                Err(error) => {
                    let mut state = self.inner.state.lock().expect(POOL_LOCK_MSG);
                    state.total = state.total.saturating_sub(1);
                    debug!("could not pre-establish pool connection: {}", error);
                    return;
                }
            }
        }
    }

    fn pub_sub_connection(&self) -> Option<Arc<Connection>> {
        let state = self.inner.state.lock().expect(POOL_LOCK_MSG);
        state.pub_sub.clone()
    }

    /// Returns the dedicated Pub/Sub connection, leasing one if none is
    /// held yet.
    async fn lease_pub_sub(&self) -> Result<Arc<Connection>, PoolError> {
        let existing = {
            let mut state = self.inner.state.lock().expect(POOL_LOCK_MSG);

            if state.closed {
                return Err(PoolError::Closed);
            }

            match state.pub_sub.take() {
                Some(connection) if !connection.is_closed() => {
                    state.pub_sub = Some(Arc::clone(&connection));
                    Some(connection)
                }
                Some(_) => {
                    // The dedicated connection died; its subscriptions are
                    // gone and will not be restored.
                    state.leased = state.leased.saturating_sub(1);
                    state.total = state.total.saturating_sub(1);
                    None
                }
                None => None,
            }
        };

        if let Some(connection) = existing {
            return Ok(connection);
        }

        let connection = self.acquire().await?;

        let mut state = self.inner.state.lock().expect(POOL_LOCK_MSG);
        match &state.pub_sub {
            Some(winner) if !winner.is_closed() => {
                // Another caller installed the lease while we were
                // dialing; hand our connection back to the free set.
                let winner = Arc::clone(winner);
                state.leased = state.leased.saturating_sub(1);
                state.idle.push_back(connection);
                Ok(winner)
            }
            _ => {
                state.pub_sub = Some(Arc::clone(&connection));
                Ok(connection)
            }
        }
    }

    /// Returns the Pub/Sub connection to the free set once its last
    /// subscription is confirmed gone.
    fn release_pub_sub_if_idle(&self) {
        let mut state = self.inner.state.lock().expect(POOL_LOCK_MSG);

        let Some(connection) = state.pub_sub.take() else {
            return;
        };

        if connection.is_subscribed() {
            state.pub_sub = Some(connection);
            return;
        }

        state.leased = state.leased.saturating_sub(1);

        if connection.is_closed() {
            state.total = state.total.saturating_sub(1);
        } else {
            state.idle.push_back(connection);
        }
    }

    /// Dials the configured endpoint, backing off exponentially until the
    /// retry timeout is spent, then authenticates if a password is set.
    async fn open_connection(&self) -> Result<Arc<Connection>, PoolError> {
        let config = &self.inner.config;
        let deadline = Instant::now() + config.connection_retry_timeout;
        let mut delay = config.initial_connection_backoff_delay;

        let connection = loop {
            match Connection::connect(&config.address).await {
                Ok(connection) => break connection,
                Err(error) => {
                    if Instant::now() + delay > deadline {
                        warn!("giving up connecting to {}: {}", config.address, error);
                        return Err(PoolError::ConnectTimeout);
                    }

                    debug!("retrying connection to {} in {:?}", config.address, delay);
                    sleep(delay).await;
                    delay = delay.mul_f64(config.connection_backoff_factor);
                }
            }
        };

        if let Some(password) = &config.password {
            connection.auth(password.as_bytes()).await?;
        }

        Ok(Arc::new(connection))
    }
}

/// Validates a `host:port` server address.
///
/// The host may be an IPv4 dotted quad or a hostname; the port must fall
/// in 1-65535.
fn validate_address(address: &str) -> Result<(), PoolError> {
    let ipv4_regex = Regex::new(r"^(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})$").unwrap();
    let hostname_regex = Regex::new(r"^[a-zA-Z0-9\-\.]+$").unwrap();

    let Some((host, port)) = address.rsplit_once(':') else {
        return Err(PoolError::InvalidAddress);
    };

    let valid_host = if let Some(caps) = ipv4_regex.captures(host) {
        caps.iter().skip(1).all(|octet| {
            octet
                .map(|m| m.as_str().parse::<u16>().map(|v| v <= 255).unwrap_or(false))
                .unwrap_or(false)
        })
    } else {
        hostname_regex.is_match(host)
    };

    if !valid_host {
        return Err(PoolError::InvalidAddress);
    }

    let port_number = port.parse::<u32>().map_err(|_| PoolError::InvalidAddress)?;

    if port_number < 1 || port_number > 65535 {
        return Err(PoolError::InvalidAddress);
    }

    Ok(())
}
