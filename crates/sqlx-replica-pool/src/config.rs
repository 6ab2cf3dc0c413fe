//! Configuration for routed connection pools

use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

/// Sizing and health-check configuration for a [`ConnectionPool`](crate::ConnectionPool)
///
/// # Examples
///
/// ```
/// use sqlx_replica_pool::PoolConfig;
/// use std::time::Duration;
///
/// // Use defaults
/// let config = PoolConfig::default();
///
/// // Override just a few fields
/// let config = PoolConfig {
///     max_connections: 4,
///     acquire_timeout: Duration::from_millis(250),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
   /// Maximum number of connections checked out at the same time
   ///
   /// Default: 10
   pub max_connections: u32,

   /// How long `acquire` waits for a free connection before failing with
   /// [`Error::PoolExhausted`]
   ///
   /// A zero timeout fails immediately when the pool is exhausted.
   ///
   /// Default: 30 seconds
   pub acquire_timeout: Duration,

   /// Idle connections older than this are probed for liveness before being
   /// handed out. Zero probes every reused connection.
   ///
   /// Default: 30 seconds
   pub validation_threshold: Duration,

   /// Connections older than this are closed instead of reused
   ///
   /// Default: unlimited
   pub max_lifetime: Option<Duration>,
}

impl Default for PoolConfig {
   fn default() -> Self {
      Self {
         max_connections: 10,
         acquire_timeout: Duration::from_secs(30),
         validation_threshold: Duration::from_secs(30),
         max_lifetime: None,
      }
   }
}

impl PoolConfig {
   pub fn validate(&self) -> Result<()> {
      if self.max_connections == 0 {
         return Err(Error::InvalidConfig(
            "max_connections must be greater than zero".into(),
         ));
      }
      Ok(())
   }
}

/// Network location and credentials of one database endpoint
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct EndpointConfig {
   /// Connection URL understood by the driver (e.g. `sqlite://data/primary.db`)
   pub url: String,

   #[serde(default)]
   pub username: Option<String>,

   #[serde(default)]
   pub password: Option<String>,
}

impl EndpointConfig {
   pub fn new(url: impl Into<String>) -> Self {
      Self {
         url: url.into(),
         ..Default::default()
      }
   }

   pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
      self.username = Some(username.into());
      self.password = Some(password.into());
      self
   }

   pub fn validate(&self) -> Result<()> {
      if self.url.trim().is_empty() {
         return Err(Error::InvalidConfig("endpoint url is empty".into()));
      }
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_defaults() {
      let config = PoolConfig::default();
      assert_eq!(config.max_connections, 10);
      assert_eq!(config.acquire_timeout, Duration::from_secs(30));
      assert!(config.max_lifetime.is_none());
      assert!(config.validate().is_ok());
   }

   #[test]
   fn test_zero_size_rejected() {
      let config = PoolConfig {
         max_connections: 0,
         ..Default::default()
      };
      assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
   }

   #[test]
   fn test_endpoint_validation() {
      assert!(EndpointConfig::new("sqlite://a.db").validate().is_ok());
      assert!(EndpointConfig::new("  ").validate().is_err());

      let endpoint = EndpointConfig::new("sqlite://a.db").with_credentials("app", "secret");
      assert_eq!(endpoint.username.as_deref(), Some("app"));
      assert_eq!(endpoint.password.as_deref(), Some("secret"));
   }
}
