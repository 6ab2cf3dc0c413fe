//! Per-transaction routing state

use std::fmt;
use std::time::Instant;

use sqlx_replica_pool::{Connect, PooledConnection};
use tracing::{debug, error};
use uuid::Uuid;

use crate::policy::{Intent, IntentState, PoolIdentifier, RoutingPolicy};
use crate::{Error, Result};

/// Lifecycle of a [`TransactionContext`].
///
/// ```text
/// IntentDeclared -> PoolResolved -> ConnectionBound -> Closed
///                         \__________________________/
///                      (closed without a query, or acquisition failed)
/// ```
///
/// A context is created with its intent already declared; there is no
/// observable state before that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
   IntentDeclared,
   PoolResolved,
   ConnectionBound,
   Closed,
}

/// State for one logical operation: its intent, the pool chosen for it, and
/// once the first query runs, the connection it exclusively owns.
///
/// The pool is resolved at most once and never changes afterwards. Dropping a
/// context that still holds a connection rolls the transaction back and
/// returns the connection to its pool.
#[must_use = "a transaction must be committed or rolled back"]
pub struct TransactionContext<C: Connect> {
   id: String,
   intent: Intent,
   resolved_pool: Option<PoolIdentifier>,
   bound: Option<PooledConnection<C>>,
   state: TransactionState,
   /// Set by the caller's commit or rollback, not by an internal close
   released: bool,
   started_at: Instant,
}

impl<C: Connect> TransactionContext<C> {
   pub(crate) fn declare(intent: Intent) -> Self {
      let id = Uuid::new_v4().to_string();
      debug!(transaction_id = %id, %intent, "Transaction intent declared");

      Self {
         id,
         intent,
         resolved_pool: None,
         bound: None,
         state: TransactionState::IntentDeclared,
         released: false,
         started_at: Instant::now(),
      }
   }

   pub fn id(&self) -> &str {
      &self.id
   }

   pub fn intent(&self) -> Intent {
      self.intent
   }

   /// Pool chosen for this transaction, once routing has run
   pub fn resolved_pool(&self) -> Option<PoolIdentifier> {
      self.resolved_pool
   }

   pub fn state(&self) -> TransactionState {
      self.state
   }

   pub fn started_at(&self) -> Instant {
      self.started_at
   }

   pub fn is_bound(&self) -> bool {
      self.bound.is_some()
   }

   pub fn is_closed(&self) -> bool {
      self.state == TransactionState::Closed
   }

   /// Id of the bound physical connection, if a query has run
   pub fn connection_id(&self) -> Option<u64> {
      self.bound.as_ref().map(PooledConnection::id)
   }

   /// Consult the policy the first time; later calls return the cached pool
   pub(crate) fn resolve(&mut self, policy: &RoutingPolicy) -> PoolIdentifier {
      if let Some(pool) = self.resolved_pool {
         return pool;
      }

      let pool = policy.resolve(IntentState::from(self.intent));
      self.resolved_pool = Some(pool);
      self.state = TransactionState::PoolResolved;
      debug!(transaction_id = %self.id, intent = %self.intent, %pool, "Transaction routed");
      pool
   }

   pub(crate) fn ensure_open(&self) -> Result<()> {
      if self.is_closed() {
         return Err(Error::TransactionClosed {
            transaction_id: self.id.clone(),
         });
      }
      Ok(())
   }

   pub(crate) fn bind(&mut self, conn: PooledConnection<C>) {
      debug!(
         transaction_id = %self.id,
         pool = conn.pool_name(),
         connection_id = conn.id(),
         "Connection bound to transaction"
      );
      self.bound = Some(conn);
      self.state = TransactionState::ConnectionBound;
   }

   pub(crate) fn connection_mut(&mut self) -> Option<&mut PooledConnection<C>> {
      self.bound.as_mut()
   }

   pub(crate) fn take_connection(&mut self) -> Option<PooledConnection<C>> {
      self.bound.take()
   }

   /// Close after a failed acquisition or a dead connection. The caller still
   /// gets one commit or rollback to release the context.
   pub(crate) fn abort(&mut self) {
      self.state = TransactionState::Closed;
   }

   /// Record the caller's commit or rollback and move to `Closed`.
   ///
   /// A context can only be released once; the second release fails with
   /// [`Error::DoubleRelease`].
   pub(crate) fn mark_released(&mut self) -> Result<()> {
      if self.released {
         error!(transaction_id = %self.id, "Transaction released twice");
         return Err(Error::DoubleRelease {
            transaction_id: self.id.clone(),
         });
      }
      self.released = true;
      self.state = TransactionState::Closed;
      Ok(())
   }
}

impl<C: Connect> Drop for TransactionContext<C> {
   fn drop(&mut self) {
      if self.bound.is_some() {
         // The pooled connection rolls back its open transaction on drop
         debug!(
            transaction_id = %self.id,
            "Dropping transaction without commit or rollback (will auto-rollback)"
         );
      }
   }
}

impl<C: Connect> fmt::Debug for TransactionContext<C> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("TransactionContext")
         .field("id", &self.id)
         .field("intent", &self.intent)
         .field("resolved_pool", &self.resolved_pool)
         .field("state", &self.state)
         .field("connection_id", &self.connection_id())
         .finish()
   }
}
