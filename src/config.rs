//! Startup configuration for the primary and replica data sources

use std::time::Duration;

use serde::Deserialize;
use sqlx_replica_pool::{EndpointConfig, PoolConfig};

use crate::{Error, Result};

/// Prefix of environment variables read by [`RouterConfig::from_env`]
pub const ENV_PREFIX: &str = "REPLICA_ROUTER";

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_VALIDATION_THRESHOLD_MS: u64 = 30_000;

fn default_max_connections() -> u32 {
   DEFAULT_MAX_CONNECTIONS
}

fn default_acquire_timeout_ms() -> u64 {
   DEFAULT_ACQUIRE_TIMEOUT_MS
}

fn default_validation_threshold_ms() -> u64 {
   DEFAULT_VALIDATION_THRESHOLD_MS
}

/// One endpoint plus the pool settings used to reach it
///
/// # Examples
///
/// ```
/// use sqlx_replica_router::DataSourceConfig;
///
/// let config = DataSourceConfig {
///     max_connections: 4,
///     acquire_timeout_ms: 500,
///     ..DataSourceConfig::new("sqlite://data/primary.db")
/// };
/// assert_eq!(config.pool_config().max_connections, 4);
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DataSourceConfig {
   #[serde(flatten)]
   pub endpoint: EndpointConfig,

   /// Default: 10
   #[serde(default = "default_max_connections")]
   pub max_connections: u32,

   /// Default: 30000
   #[serde(default = "default_acquire_timeout_ms")]
   pub acquire_timeout_ms: u64,

   /// Default: 30000
   #[serde(default = "default_validation_threshold_ms")]
   pub validation_threshold_ms: u64,

   #[serde(default)]
   pub max_lifetime_ms: Option<u64>,
}

impl DataSourceConfig {
   pub fn new(url: impl Into<String>) -> Self {
      Self {
         endpoint: EndpointConfig::new(url),
         max_connections: DEFAULT_MAX_CONNECTIONS,
         acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
         validation_threshold_ms: DEFAULT_VALIDATION_THRESHOLD_MS,
         max_lifetime_ms: None,
      }
   }

   pub fn pool_config(&self) -> PoolConfig {
      PoolConfig {
         max_connections: self.max_connections,
         acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
         validation_threshold: Duration::from_millis(self.validation_threshold_ms),
         max_lifetime: self.max_lifetime_ms.map(Duration::from_millis),
      }
   }

   fn validate(&self, role: &str) -> Result<()> {
      if self.endpoint.url.trim().is_empty() {
         return Err(Error::RoutingConfig(format!("{role} endpoint url is missing")));
      }
      if self.max_connections == 0 {
         return Err(Error::RoutingConfig(format!(
            "{role} max_connections must be greater than zero"
         )));
      }
      Ok(())
   }

   fn from_lookup<F>(role: &str, lookup: &F) -> Result<Self>
   where
      F: Fn(&str) -> Option<String>,
   {
      let key = |field: &str| format!("{ENV_PREFIX}_{}_{field}", role.to_ascii_uppercase());

      let url = lookup(&key("URL"))
         .filter(|url| !url.trim().is_empty())
         .ok_or_else(|| Error::RoutingConfig(format!("{} is not set", key("URL"))))?;

      let mut config = Self::new(url);
      config.endpoint.username = lookup(&key("USERNAME"));
      config.endpoint.password = lookup(&key("PASSWORD"));

      if let Some(value) = lookup(&key("MAX_CONNECTIONS")) {
         config.max_connections = parse_number(&key("MAX_CONNECTIONS"), &value)?;
      }
      if let Some(value) = lookup(&key("ACQUIRE_TIMEOUT_MS")) {
         config.acquire_timeout_ms = parse_number(&key("ACQUIRE_TIMEOUT_MS"), &value)?;
      }
      if let Some(value) = lookup(&key("VALIDATION_THRESHOLD_MS")) {
         config.validation_threshold_ms = parse_number(&key("VALIDATION_THRESHOLD_MS"), &value)?;
      }
      if let Some(value) = lookup(&key("MAX_LIFETIME_MS")) {
         config.max_lifetime_ms = Some(parse_number(&key("MAX_LIFETIME_MS"), &value)?);
      }

      Ok(config)
   }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
   value
      .trim()
      .parse()
      .map_err(|_| Error::RoutingConfig(format!("{key} must be a number, got '{value}'")))
}

/// Endpoints and pool sizing for both data sources.
///
/// Supplied once at process start; changing it requires building a new
/// data source.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RouterConfig {
   pub primary: DataSourceConfig,
   pub replica: DataSourceConfig,
}

impl RouterConfig {
   pub fn new(primary_url: impl Into<String>, replica_url: impl Into<String>) -> Self {
      Self {
         primary: DataSourceConfig::new(primary_url),
         replica: DataSourceConfig::new(replica_url),
      }
   }

   /// Read configuration from `REPLICA_ROUTER_{PRIMARY,REPLICA}_*` variables.
   ///
   /// `URL` is required for both roles; `USERNAME`, `PASSWORD`,
   /// `MAX_CONNECTIONS`, `ACQUIRE_TIMEOUT_MS`, `VALIDATION_THRESHOLD_MS` and
   /// `MAX_LIFETIME_MS` are optional.
   pub fn from_env() -> Result<Self> {
      Self::from_lookup(|key| std::env::var(key).ok())
   }

   /// Like [`from_env`](Self::from_env), reading values through `lookup`
   pub fn from_lookup<F>(lookup: F) -> Result<Self>
   where
      F: Fn(&str) -> Option<String>,
   {
      let config = Self {
         primary: DataSourceConfig::from_lookup("primary", &lookup)?,
         replica: DataSourceConfig::from_lookup("replica", &lookup)?,
      };
      config.validate()?;
      Ok(config)
   }

   pub fn validate(&self) -> Result<()> {
      self.primary.validate("primary")?;
      self.replica.validate("replica")
   }
}
