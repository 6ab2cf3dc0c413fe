//! # sqlx-replica-router
//!
//! Routes each transaction to a primary or a read replica connection pool
//! based on its declared intent, so callers never pick a physical database.
//!
//! ## Core Types
//!
//! - **[`RoutingDataSource`]**: Façade for begin / execute / commit / rollback
//! - **[`RoutingPolicy`]**: Pure mapping from [`IntentState`] to [`PoolIdentifier`]
//! - **[`TransactionContext`]**: Per-transaction intent, routed pool and bound connection
//! - **[`LazyAcquisitionProxy`]**: Defers connection checkout to the first query
//! - **[`ReplicaPools`]**: The primary/replica [`ConnectionPool`] pair behind a [`PoolProvider`]
//! - **[`RouterConfig`]**: Startup configuration for both endpoints
//!
//! ## Routing
//!
//! | Intent              | Pool    |
//! |---------------------|---------|
//! | read-only           | replica |
//! | read-write          | primary |
//! | no transaction      | primary |
//!
//! There is no cross-pool fallback: an exhausted or unreachable pool fails
//! the transaction instead of sending it to the other database.
//!
//! ## Example
//!
//! ```no_run
//! use serde_json::json;
//! use sqlx_replica_router::{Intent, RouterConfig, SqliteRoutingDataSource};
//!
//! # async fn run() -> sqlx_replica_router::Result<()> {
//! let config = RouterConfig::from_env()?;
//! let ds = SqliteRoutingDataSource::from_config(&config)?;
//!
//! let mut tx = ds.begin_transaction(Intent::ReadWrite);
//! ds.execute_statement(&mut tx, "INSERT INTO products (name) VALUES ($1)".into(), vec![json!("lamp")])
//!    .await?;
//! ds.commit(&mut tx).await?;
//!
//! let mut tx = ds.begin_transaction(Intent::ReadOnly);
//! let rows = ds.fetch_all(&mut tx, "SELECT * FROM products".into(), vec![]).await?;
//! ds.commit(&mut tx).await?;
//! # let _ = rows;
//! # Ok(())
//! # }
//! ```

mod config;
mod datasource;
mod decode;
mod error;
mod lazy;
mod policy;
mod pools;
mod transaction;
mod wrapper;

pub use config::{DataSourceConfig, ENV_PREFIX, RouterConfig};
pub use datasource::{ConnectionOf, RoutingDataSource, SqliteRoutingDataSource};
pub use error::{Error, Result};
pub use lazy::LazyAcquisitionProxy;
pub use policy::{Intent, IntentState, PoolIdentifier, RoutingPolicy};
pub use pools::{PoolProvider, ReplicaPools};
pub use transaction::{TransactionContext, TransactionState};
pub use wrapper::{JsonRow, WriteQueryResult};

pub use sqlx_replica_pool::{
   Connect, ConnectionPool, EndpointConfig, PoolConfig, PoolStatus, PooledConnection,
   SqliteConnector,
};
