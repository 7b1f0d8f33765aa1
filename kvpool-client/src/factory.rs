//! # Connection Factory
//!
//! Purpose: Combine shared client resources, a pool policy and an endpoint
//! into a factory handing out logical connections backed by pooled physical
//! connections.
//!
//! ## Design Principles
//! 1. **Fail Fast**: Endpoint and pool parameters are validated at construction.
//! 2. **RAII Return**: A `LogicalConnection` goes back to the pool when it is
//!    closed or dropped, on every exit path.
//! 3. **Per-Command Timeout**: Each command round trip is bounded; a timed-out
//!    connection is discarded since its stream may still carry the late reply.
//! 4. **No Hidden Retries**: Every failure reaches the caller as a typed error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::endpoint::EndpointConfig;
use crate::error::{ClientError, ClientResult};
use crate::pool::{run_evictor, Checkout, ConnectionPool, PoolPolicy, PoolStats};
use crate::resources::{ClientResources, ResourceLease};
use crate::resp::RespValue;

/// Default per-command timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default time `close` waits for borrowed connections to come back.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_millis(100);

struct FactoryShared {
    endpoint: Arc<EndpointConfig>,
    command_timeout: Duration,
    close_timeout: Duration,
    pool: Arc<ConnectionPool>,
    resources: ClientResources,
    lease: Mutex<Option<ResourceLease>>,
    evictor: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`ConnectionFactory`].
pub struct ConnectionFactoryBuilder {
    endpoint: EndpointConfig,
    resources: ClientResources,
    policy: PoolPolicy,
    command_timeout: Duration,
    close_timeout: Duration,
}

impl ConnectionFactoryBuilder {
    pub fn pool(mut self, policy: PoolPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Grace period `close` gives borrowed connections.
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn build(self) -> ClientResult<ConnectionFactory> {
        self.endpoint.validate()?;
        self.policy.validate()?;
        if self.command_timeout.is_zero() {
            return Err(ClientError::invalid("command timeout must be positive"));
        }
        if self.resources.is_shut_down() {
            return Err(ClientError::ResourcesShutdown);
        }

        let address = self.endpoint.address();
        let pool = Arc::new(ConnectionPool::new(
            self.policy.clone(),
            address.clone(),
            self.resources.event_bus().clone(),
        ));
        let evictor = match self.policy.time_between_eviction_runs {
            Some(every) => Some(self.resources.spawn_compute(run_evictor(pool.clone(), every))?),
            None => None,
        };

        info!(
            address = %address,
            max_total = self.policy.max_total,
            max_idle = self.policy.max_idle,
            min_idle = self.policy.min_idle,
            command_timeout_ms = self.command_timeout.as_millis() as u64,
            "connection factory created"
        );

        let lease = self.resources.lease();
        Ok(ConnectionFactory {
            shared: Arc::new(FactoryShared {
                endpoint: Arc::new(self.endpoint),
                command_timeout: self.command_timeout,
                close_timeout: self.close_timeout,
                pool,
                resources: self.resources,
                lease: Mutex::new(Some(lease)),
                evictor: Mutex::new(evictor),
            }),
        })
    }
}

/// Produces logical connections to one endpoint from a bounded pool.
///
/// Safe to share across threads; `acquire` and `release` may be called
/// concurrently. Blocking calls must not be made from inside an async context.
pub struct ConnectionFactory {
    shared: Arc<FactoryShared>,
}

impl ConnectionFactory {
    pub fn builder(endpoint: EndpointConfig, resources: &ClientResources) -> ConnectionFactoryBuilder {
        ConnectionFactoryBuilder {
            endpoint,
            resources: resources.clone(),
            policy: PoolPolicy::default(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    /// Validates the configuration and builds a factory.
    pub fn create(
        endpoint: EndpointConfig,
        pool: PoolPolicy,
        resources: &ClientResources,
        command_timeout: Duration,
    ) -> ClientResult<Self> {
        Self::builder(endpoint, resources)
            .pool(pool)
            .command_timeout(command_timeout)
            .build()
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.shared.endpoint
    }

    pub fn policy(&self) -> &PoolPolicy {
        self.shared.pool.policy()
    }

    pub fn command_timeout(&self) -> Duration {
        self.shared.command_timeout
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.pool.is_closed()
    }

    /// Borrows a connection, opening a new one or waiting as the policy allows.
    pub fn acquire(&self) -> ClientResult<LogicalConnection> {
        let conn = match self.shared.pool.checkout()? {
            Checkout::Idle(conn) => conn,
            Checkout::Reserved => self.open()?,
        };
        self.shared.pool.note_borrowed();
        Ok(LogicalConnection {
            shared: self.shared.clone(),
            conn: Some(conn),
        })
    }

    /// Returns a connection to the pool. Same as [`LogicalConnection::close`].
    pub fn release(&self, connection: LogicalConnection) {
        connection.close();
    }

    /// Opens idle connections until `min_idle` of them exist.
    ///
    /// Returns how many connections were opened.
    pub fn prepare(&self) -> ClientResult<usize> {
        let mut opened = 0;
        while self.shared.pool.reserve_for_min_idle()? {
            let conn = self.open()?;
            self.shared.pool.checkin(conn);
            opened += 1;
        }
        Ok(opened)
    }

    /// Closes every pooled connection and releases the resources lease.
    ///
    /// Idle connections close at once; borrowed ones get the close timeout to
    /// come back, after which their handles fail with `FactoryClosed`. Does
    /// not shut the resources down. Idempotent.
    pub fn close(&self) {
        let lease = self.shared.lease.lock().take();
        let Some(lease) = lease else {
            return;
        };
        if let Some(evictor) = self.shared.evictor.lock().take() {
            evictor.abort();
        }

        let outstanding = self.shared.pool.close(self.shared.close_timeout);
        if outstanding > 0 {
            warn!(
                outstanding,
                "connections still borrowed after close timeout; they close on return"
            );
        }
        info!(address = %self.shared.endpoint.address(), "connection factory closed");
        drop(lease);
        debug!(leases = self.shared.resources.lease_count(), "released client resources lease");
    }

    fn open(&self) -> ClientResult<Connection> {
        let pool = &self.shared.pool;
        let id = pool.next_id();
        let endpoint = self.shared.endpoint.clone();
        let result = self
            .shared
            .resources
            .run_io(async move { Connection::connect(id, &endpoint).await })
            .and_then(|connected| connected);

        match result {
            Ok(conn) => {
                pool.register_created(&conn);
                Ok(conn)
            }
            Err(err) => {
                pool.cancel_reservation();
                warn!(id, error = %err, "failed to open physical connection");
                Err(err)
            }
        }
    }
}

impl Drop for ConnectionFactory {
    fn drop(&mut self) {
        self.close();
    }
}

/// A caller's handle on one pooled physical connection.
///
/// Commands on one handle are answered in the order they were issued.
/// Closing or dropping the handle returns the connection to the pool.
pub struct LogicalConnection {
    shared: Arc<FactoryShared>,
    conn: Option<Connection>,
}

impl LogicalConnection {
    /// Physical connection id, or `None` once the connection was discarded.
    pub fn id(&self) -> Option<u64> {
        self.conn.as_ref().map(Connection::id)
    }

    /// Executes one command and returns the raw reply.
    pub fn exec(&mut self, args: &[&[u8]]) -> ClientResult<RespValue> {
        let mut replies = self.pipeline(&[args])?;
        replies.pop().ok_or(ClientError::Protocol)
    }

    /// Sends all commands in one write and returns the replies in order.
    ///
    /// The command timeout bounds the whole batch. Latency is recorded once
    /// per batch: under the command name for a single command, under
    /// `PIPELINE[n]` otherwise.
    pub fn pipeline(&mut self, commands: &[&[&[u8]]]) -> ClientResult<Vec<RespValue>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let pool = &self.shared.pool;
        if pool.is_closed() {
            if let Some(conn) = self.conn.take() {
                pool.discard(conn);
            }
            return Err(ClientError::FactoryClosed);
        }
        let mut conn = self.conn.take().ok_or(ClientError::ConnectionBroken)?;

        let names: Vec<String> = commands.iter().map(|args| command_name(args)).collect();
        for args in commands {
            conn.queue(args);
        }

        let command_timeout = self.shared.command_timeout;
        let started = Instant::now();
        let outcome = self.shared.resources.run_io(async move {
            let result = timeout(command_timeout, conn.flush()).await;
            (conn, result)
        });
        let (conn, result) = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                pool.forget();
                return Err(err);
            }
        };

        match result {
            Ok(Ok(replies)) => {
                self.shared
                    .resources
                    .latency()
                    .record(&batch_label(&names), started.elapsed());
                self.conn = Some(conn);
                Ok(replies)
            }
            Ok(Err(err)) => {
                debug!(id = conn.id(), error = %err, "transport failure; discarding connection");
                pool.discard(conn);
                Err(err)
            }
            Err(_) => {
                let command = batch_label(&names);
                warn!(id = conn.id(), command = %command, "command timed out; discarding connection");
                pool.discard(conn);
                Err(ClientError::CommandTimeout {
                    command,
                    timeout: command_timeout,
                })
            }
        }
    }

    /// Pings the server. Returns the raw response payload.
    pub fn ping(&mut self) -> ClientResult<Vec<u8>> {
        match self.exec(&[b"PING"])? {
            RespValue::Simple(text) => Ok(text),
            RespValue::Bulk(Some(data)) => Ok(data),
            RespValue::Error(message) => Err(ClientError::server(&message)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Fetches a value by key. Returns `Ok(None)` when the key is missing.
    pub fn get(&mut self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        match self.exec(&[b"GET", key])? {
            RespValue::Bulk(data) => Ok(data),
            RespValue::Error(message) => Err(ClientError::server(&message)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        match self.exec(&[b"SET", key, value])? {
            RespValue::Simple(_) => Ok(()),
            RespValue::Error(message) => Err(ClientError::server(&message)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Deletes a key. Returns true when a key was removed.
    pub fn del(&mut self, key: &[u8]) -> ClientResult<bool> {
        match self.exec(&[b"DEL", key])? {
            RespValue::Integer(count) => Ok(count > 0),
            RespValue::Error(message) => Err(ClientError::server(&message)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Returns the connection to the pool.
    pub fn close(self) {}
}

impl Drop for LogicalConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.pool.release(conn);
        }
    }
}

fn command_name(args: &[&[u8]]) -> String {
    args.first()
        .map(|name| String::from_utf8_lossy(name).to_ascii_uppercase())
        .unwrap_or_default()
}

fn batch_label(names: &[String]) -> String {
    match names {
        [single] => single.clone(),
        _ => format!("PIPELINE[{}]", names.len()),
    }
}
