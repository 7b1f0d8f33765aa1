//! # Client Settings
//!
//! Purpose: Deserialize connection, pool and runtime settings from TOML and
//! turn them into the explicit startup objects, in order: resources, pool
//! policy, endpoint, factory.
//!
//! Every field has a default, so an empty document yields a local standalone
//! endpoint with a small pool.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::endpoint::{Credential, EndpointConfig};
use crate::error::{ClientError, ClientResult};
use crate::factory::ConnectionFactory;
use crate::pool::{PoolPolicy, DEFAULT_MIN_EVICTABLE_IDLE_TIME};
use crate::resources::ClientResources;

/// Environment variable overriding the configured password.
pub const PASSWORD_ENV: &str = "KVPOOL_PASSWORD";

/// Top-level client settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: u32,
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub io_thread_pool_size: usize,
    pub computation_thread_pool_size: usize,
    pub event_emit_interval_secs: u64,
    pub pool: PoolSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        ClientSettings {
            host: "127.0.0.1".to_string(),
            port: 6379,
            username: None,
            password: None,
            database: 0,
            connect_timeout_ms: 10_000,
            command_timeout_ms: 1_000,
            io_thread_pool_size: 1,
            computation_thread_pool_size: 1,
            event_emit_interval_secs: 600, // 10 minutes
            pool: PoolSettings::default(),
        }
    }
}

/// Pool sizing as configured; `max_wait_ms < 0` waits forever.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_max_active")]
    pub max_active: usize,
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    #[serde(default)]
    pub min_idle: usize,
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: i64,
    /// Evictor cadence; absent or non-positive disables eviction.
    #[serde(default)]
    pub time_between_eviction_runs_ms: Option<i64>,
    #[serde(default = "default_min_evictable_idle_time_ms")]
    pub min_evictable_idle_time_ms: u64,
}

fn default_max_active() -> usize {
    8
}

fn default_max_idle() -> usize {
    8
}

fn default_max_wait_ms() -> i64 {
    -1
}

fn default_min_evictable_idle_time_ms() -> u64 {
    DEFAULT_MIN_EVICTABLE_IDLE_TIME.as_millis() as u64
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            max_active: default_max_active(),
            max_idle: default_max_idle(),
            min_idle: 0,
            max_wait_ms: default_max_wait_ms(),
            time_between_eviction_runs_ms: None,
            min_evictable_idle_time_ms: default_min_evictable_idle_time_ms(),
        }
    }
}

impl PoolSettings {
    pub fn policy(&self) -> PoolPolicy {
        let max_wait = u64::try_from(self.max_wait_ms).ok().map(Duration::from_millis);
        let mut policy = PoolPolicy::new(self.max_active, self.max_idle, self.min_idle, max_wait);
        policy.min_evictable_idle_time = Duration::from_millis(self.min_evictable_idle_time_ms);
        policy.time_between_eviction_runs = self
            .time_between_eviction_runs_ms
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(ms as u64));
        policy
    }
}

impl ClientSettings {
    /// Parses settings from TOML, applying the password environment override.
    pub fn parse_toml(content: &str) -> ClientResult<Self> {
        let mut settings: Self = toml::from_str(content)
            .map_err(|err| ClientError::invalid(format!("malformed settings: {err}")))?;
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            settings.password = Some(password);
        }
        Ok(settings)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> ClientResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn endpoint(&self) -> EndpointConfig {
        let mut endpoint = EndpointConfig::new(self.host.clone(), self.port)
            .with_database(self.database)
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms));
        if let Some(password) = &self.password {
            let credential = match &self.username {
                Some(user) => Credential::with_username(user.clone(), password.clone()),
                None => Credential::password(password.clone()),
            };
            endpoint = endpoint.with_credential(credential);
        }
        endpoint
    }

    pub fn build_resources(&self) -> ClientResult<ClientResources> {
        ClientResources::create(
            self.io_thread_pool_size,
            self.computation_thread_pool_size,
            Duration::from_secs(self.event_emit_interval_secs),
        )
    }

    pub fn build_factory(&self, resources: &ClientResources) -> ClientResult<ConnectionFactory> {
        ConnectionFactory::create(self.endpoint(), self.pool.policy(), resources, self.command_timeout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let settings: ClientSettings = toml::from_str("").unwrap();
        assert_eq!(settings.host, "127.0.0.1");
        assert_eq!(settings.port, 6379);
        assert_eq!(settings.command_timeout(), Duration::from_millis(1000));
        assert_eq!(settings.io_thread_pool_size, 1);
        assert_eq!(settings.computation_thread_pool_size, 1);
        assert_eq!(settings.event_emit_interval_secs, 600);

        let policy = settings.pool.policy();
        assert_eq!(policy, PoolPolicy::default());
        assert_eq!(policy.max_wait, None);
    }

    #[test]
    fn parses_full_document() {
        let settings: ClientSettings = toml::from_str(
            r#"
            host = "cache.internal"
            port = 6380
            username = "app"
            password = "s3cret"
            database = 2
            command_timeout_ms = 250
            io_thread_pool_size = 4

            [pool]
            max_active = 16
            max_idle = 4
            min_idle = 1
            max_wait_ms = 50
            time_between_eviction_runs_ms = 1000
            "#,
        )
        .unwrap();

        let endpoint = settings.endpoint();
        assert_eq!(endpoint.address(), "cache.internal:6380");
        assert_eq!(endpoint.database, 2);
        assert_eq!(
            endpoint.credential.as_ref().and_then(|c| c.username()),
            Some("app")
        );

        let policy = settings.pool.policy();
        assert_eq!(policy.max_total, 16);
        assert_eq!(policy.max_idle, 4);
        assert_eq!(policy.min_idle, 1);
        assert_eq!(policy.max_wait, Some(Duration::from_millis(50)));
        assert_eq!(policy.time_between_eviction_runs, Some(Duration::from_secs(1)));
        assert_eq!(settings.command_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn malformed_document_is_invalid_configuration() {
        let err = ClientSettings::parse_toml("port = \"not a number\"").err().unwrap();
        assert!(matches!(err, ClientError::InvalidConfiguration(_)));
    }

    #[test]
    fn builds_factory_in_startup_order() {
        let settings = ClientSettings {
            event_emit_interval_secs: 3600,
            ..ClientSettings::default()
        };
        let resources = settings.build_resources().unwrap();
        let factory = settings.build_factory(&resources).unwrap();
        assert_eq!(factory.command_timeout(), Duration::from_millis(1000));
        assert_eq!(resources.lease_count(), 1);
        factory.close();
        resources.shutdown(Duration::from_secs(1));
    }
}
