//! Bounded connection pool with lazy liveness probing

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace, warn};

use crate::{Connect, Error, PoolConfig, Result};

/// Point-in-time view of a pool's bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
   pub max_size: u32,
   /// Open physical connections, idle or checked out
   pub live: usize,
   pub idle: usize,
   pub checked_out: usize,
   pub total_acquired: u64,
   pub total_created: u64,
   pub total_evicted: u64,
   pub total_timeouts: u64,
}

struct IdleConnection<T> {
   conn: T,
   id: u64,
   created_at: Instant,
   idle_since: Instant,
}

/// Stand-in deadline for timeouts too large to add to the current instant
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Accounts for an idle connection taken out for reuse.
///
/// If the acquisition is cancelled while the connection is being pinged, the
/// connection is dropped with the acquire future; the guard then removes it
/// from `live` and counts it as evicted.
struct ReuseGuard<'a, C: Connect> {
   pool: &'a PoolInner<C>,
   armed: bool,
}

impl<'a, C: Connect> ReuseGuard<'a, C> {
   fn new(pool: &'a PoolInner<C>) -> Self {
      Self { pool, armed: true }
   }

   /// The connection was checked out or discarded through the pool
   fn disarm(&mut self) {
      self.armed = false;
   }
}

impl<C: Connect> Drop for ReuseGuard<'_, C> {
   fn drop(&mut self) {
      if self.armed {
         debug!(pool = %self.pool.name, "Acquisition cancelled while pinging an idle connection");
         self.pool.live.fetch_sub(1, Ordering::SeqCst);
         self.pool.total_evicted.fetch_add(1, Ordering::Relaxed);
      }
   }
}

fn deadline_after(timeout: Duration) -> tokio::time::Instant {
   let now = tokio::time::Instant::now();
   now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

struct PoolInner<C: Connect> {
   name: String,
   connector: C,
   config: PoolConfig,
   /// One permit per connection that may be checked out
   semaphore: Arc<Semaphore>,
   idle: Mutex<VecDeque<IdleConnection<C::Connection>>>,
   live: AtomicUsize,
   checked_out: AtomicUsize,
   next_id: AtomicU64,
   total_acquired: AtomicU64,
   total_created: AtomicU64,
   total_evicted: AtomicU64,
   total_timeouts: AtomicU64,
   closed: AtomicBool,
}

impl<C: Connect> PoolInner<C> {
   fn is_closed(&self) -> bool {
      self.closed.load(Ordering::Acquire)
   }

   fn is_expired(&self, created_at: Instant) -> bool {
      self
         .config
         .max_lifetime
         .is_some_and(|max| created_at.elapsed() >= max)
   }

   fn checkout(
      self: &Arc<Self>,
      conn: C::Connection,
      id: u64,
      created_at: Instant,
      permit: OwnedSemaphorePermit,
   ) -> PooledConnection<C> {
      self.checked_out.fetch_add(1, Ordering::SeqCst);
      self.total_acquired.fetch_add(1, Ordering::Relaxed);
      trace!(pool = %self.name, connection_id = id, "Checked out connection");

      PooledConnection {
         conn: Some(conn),
         id,
         created_at,
         in_transaction: false,
         pool: Arc::clone(self),
         permit: Some(permit),
      }
   }

   /// Return a connection to the idle set. Must run before the permit is released.
   fn checkin(self: &Arc<Self>, conn: C::Connection, id: u64, created_at: Instant) {
      self.checked_out.fetch_sub(1, Ordering::SeqCst);

      let over_capacity = self.live.load(Ordering::SeqCst) > self.config.max_connections as usize;
      if self.is_closed() || self.is_expired(created_at) || over_capacity {
         trace!(pool = %self.name, connection_id = id, "Closing connection at checkin");
         self.discard_detached(conn, id);
         return;
      }

      trace!(pool = %self.name, connection_id = id, "Checked in connection");
      self.idle.lock().push_back(IdleConnection {
         conn,
         id,
         created_at,
         idle_since: Instant::now(),
      });
   }

   /// Like [`discard`](Self::discard), for callers that cannot await. The
   /// close runs on the current runtime; without one the connection is dropped.
   fn discard_detached(self: &Arc<Self>, conn: C::Connection, id: u64) {
      self.live.fetch_sub(1, Ordering::SeqCst);

      match tokio::runtime::Handle::try_current() {
         Ok(handle) => {
            let pool = Arc::clone(self);
            handle.spawn(async move {
               if let Err(e) = pool.connector.close(conn).await {
                  debug!(pool = %pool.name, connection_id = id, error = %e, "Error closing discarded connection");
               }
            });
         }
         Err(_) => drop(conn),
      }
   }

   async fn discard(&self, conn: C::Connection) {
      self.live.fetch_sub(1, Ordering::SeqCst);
      if let Err(e) = self.connector.close(conn).await {
         debug!(pool = %self.name, error = %e, "Error closing discarded connection");
      }
   }

   async fn open(&self) -> Result<(C::Connection, u64)> {
      let conn = self.connector.connect().await?;
      let id = self.next_id.fetch_add(1, Ordering::Relaxed);
      self.live.fetch_add(1, Ordering::SeqCst);
      self.total_created.fetch_add(1, Ordering::Relaxed);
      debug!(pool = %self.name, connection_id = id, "Opened new connection");
      Ok((conn, id))
   }
}

/// A bounded set of reusable connections to one database endpoint.
///
/// ## Invariants
///
/// - At most `max_connections` connections are checked out at any time,
///   enforced by a semaphore permit carried by every [`PooledConnection`]
/// - Every handed-out connection is tracked until it is checked back in or
///   evicted; both paths go through the guard, so a connection always
///   returns to the pool it came from
/// - Idle connections are probed before reuse once they have been idle longer
///   than `validation_threshold`
///
/// Cloning is cheap and yields another handle to the same pool.
pub struct ConnectionPool<C: Connect> {
   inner: Arc<PoolInner<C>>,
}

impl<C: Connect> Clone for ConnectionPool<C> {
   fn clone(&self) -> Self {
      Self {
         inner: Arc::clone(&self.inner),
      }
   }
}

impl<C: Connect> ConnectionPool<C> {
   /// Create a pool. No connection is opened until the first acquisition or [`warmup`](Self::warmup).
   pub fn new(name: impl Into<String>, connector: C, config: PoolConfig) -> Result<Self> {
      config.validate()?;

      let name = name.into();
      debug!(pool = %name, max_connections = config.max_connections, "Creating connection pool");

      Ok(Self {
         inner: Arc::new(PoolInner {
            name,
            connector,
            semaphore: Arc::new(Semaphore::new(config.max_connections as usize)),
            config,
            idle: Mutex::new(VecDeque::new()),
            live: AtomicUsize::new(0),
            checked_out: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            total_acquired: AtomicU64::new(0),
            total_created: AtomicU64::new(0),
            total_evicted: AtomicU64::new(0),
            total_timeouts: AtomicU64::new(0),
            closed: AtomicBool::new(false),
         }),
      })
   }

   pub fn name(&self) -> &str {
      &self.inner.name
   }

   pub fn config(&self) -> &PoolConfig {
      &self.inner.config
   }

   pub fn connector(&self) -> &C {
      &self.inner.connector
   }

   /// Acquire a connection using the configured `acquire_timeout`
   pub async fn acquire(&self) -> Result<PooledConnection<C>> {
      self.acquire_timeout(self.inner.config.acquire_timeout).await
   }

   /// Acquire a connection, taking at most `timeout` in total.
   ///
   /// The budget covers waiting for a free slot, probing idle connections and
   /// opening a new one. Reused connections idle past the validation threshold
   /// are pinged first; ones that fail are evicted and the next candidate is
   /// tried, falling back to opening a fresh connection. A zero timeout only
   /// succeeds when a connection is ready without waiting.
   pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection<C>> {
      self.acquire_until(deadline_after(timeout)).await
   }

   /// Deadline for an acquisition starting now under the configured `acquire_timeout`
   pub fn acquire_deadline(&self) -> tokio::time::Instant {
      deadline_after(self.inner.config.acquire_timeout)
   }

   /// Acquire a connection, failing with [`Error::PoolExhausted`] once `deadline` passes.
   ///
   /// Lets a caller spread one budget over several acquisitions.
   pub async fn acquire_until(&self, deadline: tokio::time::Instant) -> Result<PooledConnection<C>> {
      let inner = &self.inner;
      if inner.is_closed() {
         return Err(Error::PoolClosed(inner.name.clone()));
      }

      let budget = deadline.saturating_duration_since(tokio::time::Instant::now());
      match tokio::time::timeout_at(deadline, self.checkout_next()).await {
         Ok(result) => result,
         Err(_) => {
            inner.total_timeouts.fetch_add(1, Ordering::Relaxed);
            warn!(pool = %inner.name, timeout = ?budget, "Timed out acquiring a connection");
            Err(Error::PoolExhausted {
               pool: inner.name.clone(),
               timeout: budget,
            })
         }
      }
   }

   /// Wait for a slot, then reuse a healthy idle connection or open one
   async fn checkout_next(&self) -> Result<PooledConnection<C>> {
      let inner = &self.inner;
      let permit = Arc::clone(&inner.semaphore)
         .acquire_owned()
         .await
         .map_err(|_| Error::PoolClosed(inner.name.clone()))?;

      loop {
         let candidate = inner.idle.lock().pop_front();
         let Some(idle) = candidate else {
            break;
         };
         let mut reuse = ReuseGuard::new(inner);

         if inner.is_expired(idle.created_at) {
            trace!(pool = %inner.name, connection_id = idle.id, "Closing connection past max lifetime");
            reuse.disarm();
            inner.discard(idle.conn).await;
            continue;
         }

         let mut conn = idle.conn;
         if idle.idle_since.elapsed() >= inner.config.validation_threshold
            && let Err(e) = inner.connector.ping(&mut conn).await
         {
            warn!(
               pool = %inner.name,
               connection_id = idle.id,
               error = %e,
               "Idle connection failed liveness probe, evicting"
            );
            reuse.disarm();
            inner.total_evicted.fetch_add(1, Ordering::Relaxed);
            inner.discard(conn).await;
            continue;
         }

         reuse.disarm();
         return Ok(inner.checkout(conn, idle.id, idle.created_at, permit));
      }

      let (conn, id) = inner.open().await?;
      Ok(inner.checkout(conn, id, Instant::now(), permit))
   }

   /// Return a connection to its pool. Equivalent to dropping the guard.
   pub fn release(&self, conn: PooledConnection<C>) {
      conn.release();
   }

   /// Close and forget a connection that was found dead
   pub async fn evict(&self, conn: PooledConnection<C>) {
      conn.evict().await;
   }

   /// Open idle connections until `count` are live, never exceeding the pool size.
   ///
   /// Returns how many connections were opened. A failure on the first
   /// connection is returned; later failures stop the warmup early.
   pub async fn warmup(&self, count: usize) -> Result<usize> {
      let inner = &self.inner;
      if inner.is_closed() {
         return Err(Error::PoolClosed(inner.name.clone()));
      }

      let target = count.min(inner.config.max_connections as usize);
      let to_create = target.saturating_sub(inner.live.load(Ordering::SeqCst));
      let mut created = 0;

      for _ in 0..to_create {
         match inner.open().await {
            Ok((conn, id)) => {
               let now = Instant::now();
               inner.idle.lock().push_back(IdleConnection {
                  conn,
                  id,
                  created_at: now,
                  idle_since: now,
               });
               created += 1;
            }
            Err(e) => {
               warn!(pool = %inner.name, error = %e, "Warmup connection failed");
               if created == 0 {
                  return Err(e);
               }
               break;
            }
         }
      }

      debug!(pool = %inner.name, created, "Warmup complete");
      Ok(created)
   }

   pub fn status(&self) -> PoolStatus {
      let inner = &self.inner;
      PoolStatus {
         max_size: inner.config.max_connections,
         live: inner.live.load(Ordering::SeqCst),
         idle: inner.idle.lock().len(),
         checked_out: inner.checked_out.load(Ordering::SeqCst),
         total_acquired: inner.total_acquired.load(Ordering::Relaxed),
         total_created: inner.total_created.load(Ordering::Relaxed),
         total_evicted: inner.total_evicted.load(Ordering::Relaxed),
         total_timeouts: inner.total_timeouts.load(Ordering::Relaxed),
      }
   }

   pub fn is_closed(&self) -> bool {
      self.inner.is_closed()
   }

   /// Close the pool.
   ///
   /// Pending and future acquisitions fail with [`Error::PoolClosed`]. Idle
   /// connections are closed now; checked-out ones are closed as they come back.
   pub async fn close(&self) {
      let inner = &self.inner;
      if inner.closed.swap(true, Ordering::AcqRel) {
         return;
      }
      inner.semaphore.close();

      let drained: Vec<_> = inner.idle.lock().drain(..).collect();
      debug!(pool = %inner.name, idle = drained.len(), "Closing connection pool");

      for idle in drained {
         inner.discard(idle.conn).await;
      }
   }
}

impl<C: Connect> fmt::Debug for ConnectionPool<C> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("ConnectionPool")
         .field("name", &self.inner.name)
         .field("status", &self.status())
         .field("closed", &self.is_closed())
         .finish()
   }
}

/// RAII guard for a checked-out connection.
///
/// Dereferences to the driver's connection type so callers can use it like a
/// direct connection. Dropping the guard returns the connection to its pool;
/// if a transaction started through [`begin`](Self::begin) is still open, it
/// is rolled back on the runtime first.
#[must_use = "if unused, the connection is immediately returned to the pool"]
pub struct PooledConnection<C: Connect> {
   conn: Option<C::Connection>,
   id: u64,
   created_at: Instant,
   in_transaction: bool,
   pool: Arc<PoolInner<C>>,
   permit: Option<OwnedSemaphorePermit>,
}

impl<C: Connect> PooledConnection<C> {
   pub fn id(&self) -> u64 {
      self.id
   }

   /// Name of the pool this connection returns to
   pub fn pool_name(&self) -> &str {
      &self.pool.name
   }

   pub fn created_at(&self) -> Instant {
      self.created_at
   }

   pub fn in_transaction(&self) -> bool {
      self.in_transaction
   }

   fn raw(&mut self) -> Result<&mut C::Connection> {
      self
         .conn
         .as_mut()
         .ok_or_else(|| Error::Other("connection already released".into()))
   }

   pub async fn begin(&mut self, read_only: bool) -> Result<()> {
      let pool = Arc::clone(&self.pool);
      pool.connector.begin(self.raw()?, read_only).await?;
      self.in_transaction = true;
      Ok(())
   }

   pub async fn commit(&mut self) -> Result<()> {
      let pool = Arc::clone(&self.pool);
      let result = pool.connector.commit(self.raw()?).await;
      // A failed COMMIT leaves the transaction state unknown; keep the flag so
      // the connection is reset before reuse.
      if result.is_ok() {
         self.in_transaction = false;
      }
      result
   }

   pub async fn rollback(&mut self) -> Result<()> {
      let pool = Arc::clone(&self.pool);
      let result = pool.connector.rollback(self.raw()?).await;
      if result.is_ok() {
         self.in_transaction = false;
      }
      result
   }

   /// Run the connector's liveness probe against this connection
   pub async fn ping(&mut self) -> Result<()> {
      let pool = Arc::clone(&self.pool);
      pool.connector.ping(self.raw()?).await
   }

   pub fn release(self) {
      drop(self);
   }

   /// Close this connection and remove it from its pool's bookkeeping
   pub async fn evict(mut self) {
      if let Some(conn) = self.conn.take() {
         let pool = Arc::clone(&self.pool);
         pool.checked_out.fetch_sub(1, Ordering::SeqCst);
         pool.total_evicted.fetch_add(1, Ordering::Relaxed);
         warn!(pool = %pool.name, connection_id = self.id, "Evicting dead connection");
         pool.discard(conn).await;
      }
   }
}

impl<C: Connect> Drop for PooledConnection<C> {
   fn drop(&mut self) {
      let Some(mut conn) = self.conn.take() else {
         return;
      };

      if !self.in_transaction {
         self.pool.checkin(conn, self.id, self.created_at);
         return;
      }

      let pool = Arc::clone(&self.pool);
      let (id, created_at) = (self.id, self.created_at);

      match tokio::runtime::Handle::try_current() {
         Ok(handle) => {
            debug!(pool = %pool.name, connection_id = id, "Rolling back abandoned transaction");
            // The permit moves into the task so the slot stays taken until reset finishes
            let permit = self.permit.take();
            handle.spawn(async move {
               match pool.connector.rollback(&mut conn).await {
                  Ok(()) => pool.checkin(conn, id, created_at),
                  Err(e) => {
                     warn!(pool = %pool.name, connection_id = id, error = %e, "Reset failed, discarding connection");
                     pool.checked_out.fetch_sub(1, Ordering::SeqCst);
                     pool.total_evicted.fetch_add(1, Ordering::Relaxed);
                     pool.discard(conn).await;
                  }
               }
               drop(permit);
            });
         }
         Err(_) => {
            warn!(pool = %pool.name, connection_id = id, "No runtime to reset connection, discarding");
            pool.checked_out.fetch_sub(1, Ordering::SeqCst);
            pool.discard_detached(conn, id);
         }
      }
   }
}

impl<C: Connect> Deref for PooledConnection<C> {
   type Target = C::Connection;

   fn deref(&self) -> &Self::Target {
      self.conn.as_ref().expect("connection already released")
   }
}

impl<C: Connect> DerefMut for PooledConnection<C> {
   fn deref_mut(&mut self) -> &mut Self::Target {
      self.conn.as_mut().expect("connection already released")
   }
}

impl<C: Connect> fmt::Debug for PooledConnection<C> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("PooledConnection")
         .field("pool", &self.pool.name)
         .field("id", &self.id)
         .field("age", &self.created_at.elapsed())
         .field("in_transaction", &self.in_transaction)
         .finish()
   }
}
