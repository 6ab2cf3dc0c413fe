//! Routing façade: begin, execute, commit, rollback

use futures::future::BoxFuture;
use sqlx_replica_pool::{Connect, ConnectionPool, PoolStatus, SqliteConnector};
use tracing::{debug, warn};

use crate::config::RouterConfig;
use crate::lazy::LazyAcquisitionProxy;
use crate::policy::{Intent, IntentState, PoolIdentifier, RoutingPolicy};
use crate::pools::{PoolProvider, ReplicaPools};
use crate::transaction::TransactionContext;
use crate::{Error, Result};

/// Connection type produced by a provider's connector
pub type ConnectionOf<P> = <<P as PoolProvider>::Connector as Connect>::Connection;

/// Entry point callers use instead of a raw pool.
///
/// Each transaction declares its intent up front. [`begin_transaction`]
/// routes it through the [`RoutingPolicy`] without touching any pool; the first
/// [`execute`] acquires a connection from the chosen pool and keeps it until
/// [`commit`] or [`rollback`] returns it.
///
/// ## Usage Pattern
///
/// ```text
/// 1. begin_transaction(intent)  -> context routed to primary or replica
/// 2. execute(context, op)       -> first call acquires + BEGIN, later calls reuse
/// 3. commit / rollback(context) -> connection back to its pool, context closed
/// ```
///
/// [`begin_transaction`]: Self::begin_transaction
/// [`execute`]: Self::execute
/// [`commit`]: Self::commit
/// [`rollback`]: Self::rollback
#[derive(Debug)]
pub struct RoutingDataSource<P: PoolProvider> {
   policy: RoutingPolicy,
   proxy: LazyAcquisitionProxy<P>,
}

/// Data source over a pair of SQLite pools
pub type SqliteRoutingDataSource = RoutingDataSource<ReplicaPools<SqliteConnector>>;

impl SqliteRoutingDataSource {
   /// Build primary and replica SQLite pools from startup configuration.
   ///
   /// No connection is opened here. Invalid configuration fails with
   /// [`Error::RoutingConfig`].
   pub fn from_config(config: &RouterConfig) -> Result<Self> {
      config.validate()?;

      let primary = ConnectionPool::new(
         PoolIdentifier::Primary.as_str(),
         SqliteConnector::primary(&config.primary.endpoint).map_err(config_error)?,
         config.primary.pool_config(),
      )
      .map_err(config_error)?;

      let replica = ConnectionPool::new(
         PoolIdentifier::Replica.as_str(),
         SqliteConnector::replica(&config.replica.endpoint).map_err(config_error)?,
         config.replica.pool_config(),
      )
      .map_err(config_error)?;

      Ok(Self::new(ReplicaPools::new(primary, replica)))
   }
}

fn config_error(e: sqlx_replica_pool::Error) -> Error {
   Error::RoutingConfig(e.to_string())
}

impl<P: PoolProvider> RoutingDataSource<P> {
   pub fn new(pools: P) -> Self {
      Self {
         policy: RoutingPolicy::new(),
         proxy: LazyAcquisitionProxy::new(pools),
      }
   }

   pub fn policy(&self) -> &RoutingPolicy {
      &self.policy
   }

   pub fn pools(&self) -> &P {
      self.proxy.pools()
   }

   pub fn pool_status(&self, id: PoolIdentifier) -> PoolStatus {
      self.pools().pool(id).status()
   }

   /// Open a transaction and route it. Does not acquire a connection.
   pub fn begin_transaction(&self, intent: Intent) -> TransactionContext<P::Connector> {
      let mut ctx = TransactionContext::declare(intent);
      ctx.resolve(&self.policy);
      ctx
   }

   /// Run `operation` on the transaction's connection, binding one first if needed.
   ///
   /// When the operation fails and the connection no longer answers a
   /// liveness probe, the connection is evicted, the context is closed and
   /// a connection-dead error is returned. Other failures leave the
   /// transaction open so the caller can still commit or roll back.
   ///
   /// # Example
   ///
   /// ```ignore
   /// let mut tx = ds.begin_transaction(Intent::ReadWrite);
   /// ds.execute(&mut tx, |conn| {
   ///    Box::pin(async move {
   ///       sqlx::query("INSERT INTO products (name) VALUES ('lamp')")
   ///          .execute(&mut *conn)
   ///          .await?;
   ///       Ok::<_, Error>(())
   ///    })
   /// })
   /// .await?;
   /// ds.commit(&mut tx).await?;
   /// ```
   pub async fn execute<T, F>(
      &self,
      ctx: &mut TransactionContext<P::Connector>,
      operation: F,
   ) -> Result<T>
   where
      F: for<'c> FnOnce(&'c mut ConnectionOf<P>) -> BoxFuture<'c, Result<T>>,
   {
      let (result, dead) = {
         let conn = self.proxy.connection(ctx).await?;
         match operation(&mut **conn).await {
            Ok(value) => (Ok(value), false),
            Err(e) => {
               let dead = e.is_connection_dead() || conn.ping().await.is_err();
               (Err(e), dead)
            }
         }
      };

      match result {
         Err(e) if dead => {
            let pool = ctx.resolved_pool().unwrap_or_default();
            warn!(transaction_id = ctx.id(), %pool, error = %e, "Connection died during transaction");
            self.proxy.discard_bound(ctx).await;

            if e.is_connection_dead() {
               Err(e)
            } else {
               Err(Error::Pool(sqlx_replica_pool::Error::ConnectionDead {
                  pool: pool.to_string(),
                  reason: e.to_string(),
               }))
            }
         }
         other => other,
      }
   }

   /// Commit and release the bound connection, if any.
   ///
   /// The connection goes back to its pool whether or not COMMIT succeeds.
   /// A transaction already closed by a failed acquisition or a dead
   /// connection has nothing to commit and fails with
   /// [`Error::TransactionClosed`]. Releasing a context twice fails with
   /// [`Error::DoubleRelease`].
   pub async fn commit(&self, ctx: &mut TransactionContext<P::Connector>) -> Result<()> {
      let aborted = ctx.is_closed();
      ctx.mark_released()?;
      if aborted {
         return Err(Error::TransactionClosed {
            transaction_id: ctx.id().to_string(),
         });
      }

      let Some(mut conn) = ctx.take_connection() else {
         debug!(transaction_id = ctx.id(), "Committed transaction that never ran a query");
         return Ok(());
      };

      match conn.commit().await {
         Ok(()) => {
            debug!(transaction_id = ctx.id(), pool = conn.pool_name(), "Transaction committed");
            conn.release();
            Ok(())
         }
         Err(e) => {
            warn!(transaction_id = ctx.id(), error = %e, "Commit failed");
            if e.is_connection_dead() {
               conn.evict().await;
            }
            // A live connection still in a transaction is rolled back as the guard drops
            Err(e.into())
         }
      }
   }

   /// Roll back and release the bound connection, if any.
   ///
   /// The connection goes back to its pool whether or not ROLLBACK succeeds.
   /// On a transaction already closed by a failed acquisition or a dead
   /// connection this only releases the context. Releasing a context twice
   /// fails with [`Error::DoubleRelease`].
   pub async fn rollback(&self, ctx: &mut TransactionContext<P::Connector>) -> Result<()> {
      let aborted = ctx.is_closed();
      ctx.mark_released()?;
      if aborted {
         debug!(transaction_id = ctx.id(), "Released transaction closed after a connection failure");
         return Ok(());
      }

      let Some(mut conn) = ctx.take_connection() else {
         debug!(transaction_id = ctx.id(), "Rolled back transaction that never ran a query");
         return Ok(());
      };

      match conn.rollback().await {
         Ok(()) => {
            debug!(transaction_id = ctx.id(), pool = conn.pool_name(), "Transaction rolled back");
            conn.release();
            Ok(())
         }
         Err(e) => {
            warn!(transaction_id = ctx.id(), error = %e, "Rollback failed, evicting connection");
            conn.evict().await;
            Err(e.into())
         }
      }
   }

   /// Run `operation` in its own transaction.
   ///
   /// Commits on success and rolls back on failure. If the rollback fails
   /// too, both errors are reported.
   pub async fn transaction<T, F>(&self, intent: Intent, operation: F) -> Result<T>
   where
      F: for<'c> FnOnce(&'c mut ConnectionOf<P>) -> BoxFuture<'c, Result<T>>,
   {
      let mut ctx = self.begin_transaction(intent);

      match self.execute(&mut ctx, operation).await {
         Ok(value) => {
            self.commit(&mut ctx).await?;
            Ok(value)
         }
         Err(e) => match self.rollback(&mut ctx).await {
            // Rollback succeeded, return original error
            Ok(()) => Err(e),

            // Rollback also failed, return the rollback error and the original error
            Err(rollback_err) => Err(Error::TransactionRollbackFailed {
               transaction_error: e.to_string(),
               rollback_error: rollback_err.to_string(),
            }),
         },
      }
   }

   /// Run `operation` outside any transaction, in autocommit mode.
   ///
   /// With no transaction to consult, routing falls to the primary. The
   /// connection is checked out for this call only; a connection found dead
   /// afterwards is evicted.
   pub async fn execute_autocommit<T, F>(&self, operation: F) -> Result<T>
   where
      F: for<'c> FnOnce(&'c mut ConnectionOf<P>) -> BoxFuture<'c, Result<T>>,
   {
      let pool_id = self.policy.resolve(IntentState::NoTransaction);
      let mut conn = self.pools().pool(pool_id).acquire().await?;

      match operation(&mut *conn).await {
         Ok(value) => {
            conn.release();
            Ok(value)
         }
         Err(e) => {
            if e.is_connection_dead() || conn.ping().await.is_err() {
               warn!(pool = %pool_id, error = %e, "Connection died outside a transaction");
               conn.evict().await;
            }
            Err(e)
         }
      }
   }

   /// Close both pools. Pending acquisitions fail and idle connections are closed.
   pub async fn close(&self) {
      self.pools().close().await;
   }
}
