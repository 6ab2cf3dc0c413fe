//! Deferred connection acquisition

use sqlx_replica_pool::{ConnectionPool, PooledConnection};
use tracing::{debug, warn};

use crate::pools::PoolProvider;
use crate::policy::Intent;
use crate::transaction::TransactionContext;
use crate::{Error, Result};

/// Defers taking a physical connection until a transaction runs its first query.
///
/// Transactions that are opened and closed without a statement never occupy a
/// pool slot. Once bound, the same connection serves every later statement of
/// the transaction.
#[derive(Debug)]
pub struct LazyAcquisitionProxy<P: PoolProvider> {
   pools: P,
}

impl<P: PoolProvider> LazyAcquisitionProxy<P> {
   pub fn new(pools: P) -> Self {
      Self { pools }
   }

   pub fn pools(&self) -> &P {
      &self.pools
   }

   /// Return the context's connection, acquiring and binding one on first use.
   ///
   /// If acquisition fails the context is closed with nothing bound and the
   /// error is returned; there is no fallback to the other pool. The caller's
   /// rollback then only releases the context.
   pub async fn connection<'c>(
      &self,
      ctx: &'c mut TransactionContext<P::Connector>,
   ) -> Result<&'c mut PooledConnection<P::Connector>> {
      ctx.ensure_open()?;

      if !ctx.is_bound() {
         // Contexts built by the data source are always resolved; anything else
         // takes the safe default.
         let pool_id = ctx.resolved_pool().unwrap_or_default();
         let pool = self.pools.pool(pool_id);

         match acquire_and_begin(pool, ctx.intent()).await {
            Ok(conn) => ctx.bind(conn),
            Err(e) => {
               warn!(
                  transaction_id = ctx.id(),
                  pool = %pool_id,
                  error = %e,
                  "Connection acquisition failed, closing transaction"
               );
               ctx.abort();
               return Err(e);
            }
         }
      }

      ctx
         .connection_mut()
         .ok_or_else(|| Error::Other("transaction has no bound connection".into()))
   }

   /// Evict the context's connection after it was found dead and close the context
   pub(crate) async fn discard_bound(&self, ctx: &mut TransactionContext<P::Connector>) {
      if let Some(conn) = ctx.take_connection() {
         conn.evict().await;
      }
      ctx.abort();
   }
}

/// Acquire from `pool` and open a transaction matching `intent`.
///
/// A connection that dies between checkout and `BEGIN` is evicted and one
/// fresh acquisition is attempted before giving up. Both acquisitions share
/// the pool's acquire timeout.
async fn acquire_and_begin<C: sqlx_replica_pool::Connect>(
   pool: &ConnectionPool<C>,
   intent: Intent,
) -> Result<PooledConnection<C>> {
   let read_only = intent.is_read_only();
   let deadline = pool.acquire_deadline();
   let mut conn = pool.acquire_until(deadline).await?;

   match conn.begin(read_only).await {
      Ok(()) => Ok(conn),
      Err(e) if e.is_connection_dead() => {
         debug!(pool = pool.name(), error = %e, "Connection died before BEGIN, retrying once");
         conn.evict().await;

         let mut conn = pool.acquire_until(deadline).await?;
         if let Err(e) = conn.begin(read_only).await {
            if e.is_connection_dead() {
               conn.evict().await;
            }
            return Err(e.into());
         }
         Ok(conn)
      }
      Err(e) => Err(e.into()),
   }
}
