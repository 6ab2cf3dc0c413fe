//! Pool provider abstraction over the primary/replica pair

use std::future::Future;

use sqlx_replica_pool::{Connect, ConnectionPool, PoolStatus};
use tracing::debug;

use crate::policy::PoolIdentifier;

/// Hands out the pool that serves a routing key.
///
/// The data source never touches pool internals; it only asks for a pool by
/// identifier and acquires from it.
pub trait PoolProvider: Send + Sync + 'static {
   type Connector: Connect;

   fn pool(&self, id: PoolIdentifier) -> &ConnectionPool<Self::Connector>;

   /// Close every pool this provider owns
   fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Explicitly constructed primary and replica pools
#[derive(Debug, Clone)]
pub struct ReplicaPools<C: Connect> {
   primary: ConnectionPool<C>,
   replica: ConnectionPool<C>,
}

impl<C: Connect> ReplicaPools<C> {
   pub fn new(primary: ConnectionPool<C>, replica: ConnectionPool<C>) -> Self {
      Self { primary, replica }
   }

   pub fn primary(&self) -> &ConnectionPool<C> {
      &self.primary
   }

   pub fn replica(&self) -> &ConnectionPool<C> {
      &self.replica
   }

   pub fn status(&self, id: PoolIdentifier) -> PoolStatus {
      self.pool(id).status()
   }
}

impl<C: Connect> PoolProvider for ReplicaPools<C> {
   type Connector = C;

   fn pool(&self, id: PoolIdentifier) -> &ConnectionPool<C> {
      match id {
         PoolIdentifier::Primary => &self.primary,
         PoolIdentifier::Replica => &self.replica,
      }
   }

   async fn close(&self) {
      debug!("Closing primary and replica pools");
      self.primary.close().await;
      self.replica.close().await;
   }
}
