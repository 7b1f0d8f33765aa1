//! # KvPool Client
//!
//! Purpose: Provide a pooled, observable connection factory for
//! Redis-compatible key-value stores.
//!
//! ## Design Principles
//! 1. **Shared Resources**: One `ClientResources` owns the I/O and computation
//!    thread pools plus the event bus for every factory in the process.
//! 2. **Object Pool Pattern**: Physical connections are bounded, reused and
//!    returned through RAII handles.
//! 3. **Observable**: Command latencies are aggregated off the data path and
//!    published on the event bus at a fixed cadence.
//! 4. **Explicit Wiring**: Startup composes resources, policy, factory and
//!    subscriber through plain constructors.
//!
//! ```no_run
//! use std::time::Duration;
//! use kvpool_client::{
//!     ClientResources, ConnectionFactory, EndpointConfig, LatencyEventSubscriber, LogSink,
//!     PoolPolicy,
//! };
//!
//! # fn main() -> kvpool_client::ClientResult<()> {
//! let resources = ClientResources::create(1, 1, Duration::from_secs(600))?;
//! let policy = PoolPolicy::new(8, 8, 0, Some(Duration::from_millis(500)));
//! let factory = ConnectionFactory::create(
//!     EndpointConfig::new("127.0.0.1", 6379),
//!     policy,
//!     &resources,
//!     Duration::from_secs(1),
//! )?;
//! let subscription = LatencyEventSubscriber::attach(&resources, LogSink)?;
//!
//! let mut conn = factory.acquire()?;
//! conn.set(b"greeting", b"hello")?;
//! conn.close();
//!
//! subscription.detach();
//! factory.close();
//! resources.shutdown(Duration::from_secs(2));
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod endpoint;
mod error;
mod event;
mod factory;
mod latency;
mod pool;
mod resources;
mod resp;
mod subscriber;

pub use config::{ClientSettings, PoolSettings, PASSWORD_ENV};
pub use endpoint::{Credential, EndpointConfig, DEFAULT_CONNECT_TIMEOUT};
pub use error::{ClientError, ClientResult};
pub use event::{
    CommandLatencies, CommandLatencyEvent, EventBus, LatencyStats, RuntimeEvent,
    DEFAULT_EVENT_BUS_CAPACITY,
};
pub use factory::{
    ConnectionFactory, ConnectionFactoryBuilder, LogicalConnection, DEFAULT_CLOSE_TIMEOUT,
    DEFAULT_COMMAND_TIMEOUT,
};
pub use latency::{CommandLatencyCollector, LatencyHistogram, DEFAULT_LATENCY_BUCKETS_US};
pub use pool::{PoolPolicy, PoolStats, DEFAULT_MIN_EVICTABLE_IDLE_TIME};
pub use resources::{ClientResources, ClientResourcesBuilder, DEFAULT_EVENT_EMIT_INTERVAL};
pub use resp::RespValue;
pub use subscriber::{LatencyEventSubscriber, LatencySink, LatencySubscription, LogSink, SinkResult};
