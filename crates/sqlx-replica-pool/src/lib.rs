//! # sqlx-replica-pool
//!
//! Bounded connection pools for routing traffic between a primary database and
//! its read replica.
//!
//! ## Core Types
//!
//! - **[`ConnectionPool`]**: Bounded set of reusable connections to one endpoint
//! - **[`PooledConnection`]**: RAII guard that returns its connection to the pool it came from
//! - **[`Connect`]**: Driver seam (open, probe, begin/commit/rollback, close)
//! - **[`SqliteConnector`]**: SQLx-backed SQLite implementation of [`Connect`]
//! - **[`PoolConfig`]** / **[`EndpointConfig`]**: Sizing and endpoint settings
//! - **[`Error`]**: Error type for pool operations
//!
//! ## Behavior
//!
//! - **Bounded checkout**: never more than `max_connections` connections out at once
//! - **Timeout-bounded waits**: exhausted pools fail with [`Error::PoolExhausted`]
//! - **Lazy liveness probes**: idle connections are pinged before reuse past a threshold
//! - **Abandoned transactions**: guards dropped mid-transaction are rolled back before reuse

mod config;
mod connector;
mod error;
#[cfg(any(test, feature = "test-util"))]
mod mock;
mod pool;

// Re-export public types
pub use config::{EndpointConfig, PoolConfig};
pub use connector::{Connect, SqliteConnector};
pub use error::{Error, Result};
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockConnection, MockConnector};
pub use pool::{ConnectionPool, PoolStatus, PooledConnection};
