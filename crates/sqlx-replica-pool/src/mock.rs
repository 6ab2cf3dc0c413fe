//! In-memory [`Connect`] implementation for tests.
//!
//! Connections record the statements run on them and can be killed to
//! simulate a dropped network link.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::{Connect, Error, Result};

/// Connection produced by [`MockConnector`]
#[derive(Debug)]
pub struct MockConnection {
   id: u64,
   alive: Arc<AtomicBool>,
   in_transaction: bool,
   read_only: bool,
   statements: Vec<String>,
}

impl MockConnection {
   pub fn id(&self) -> u64 {
      self.id
   }

   pub fn is_alive(&self) -> bool {
      self.alive.load(Ordering::SeqCst)
   }

   /// Simulate the server dropping this connection
   pub fn kill(&self) {
      self.alive.store(false, Ordering::SeqCst);
   }

   pub fn in_transaction(&self) -> bool {
      self.in_transaction
   }

   /// Whether the open transaction was started read-only
   pub fn read_only(&self) -> bool {
      self.read_only
   }

   pub fn statements(&self) -> &[String] {
      &self.statements
   }

   /// Record a statement, failing if the connection has been killed
   pub fn execute(&mut self, statement: impl Into<String>) -> Result<()> {
      self.check_alive()?;
      self.statements.push(statement.into());
      Ok(())
   }

   fn check_alive(&self) -> Result<()> {
      if self.is_alive() {
         Ok(())
      } else {
         Err(Error::ConnectionDead {
            pool: "mock".into(),
            reason: format!("connection {} was killed", self.id),
         })
      }
   }
}

#[derive(Debug, Default)]
struct MockState {
   next_id: AtomicU64,
   opened: AtomicU64,
   closed: AtomicU64,
   pings: AtomicU64,
   commits: AtomicU64,
   rollbacks: AtomicU64,
   fail_connects: AtomicBool,
   connect_delay: Mutex<Duration>,
   ping_delay: Mutex<Duration>,
   handles: Mutex<Vec<Arc<AtomicBool>>>,
}

/// Connector whose connections live in memory. Clones share counters.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
   state: Arc<MockState>,
}

impl MockConnector {
   pub fn new() -> Self {
      Self::default()
   }

   /// Make subsequent `connect` calls fail
   pub fn fail_connects(&self, fail: bool) {
      self.state.fail_connects.store(fail, Ordering::SeqCst);
   }

   /// Delay every `connect` call, simulating a slow network handshake
   pub fn set_connect_delay(&self, delay: Duration) {
      *self.state.connect_delay.lock() = delay;
   }

   /// Delay every liveness probe, simulating a server that stopped answering
   pub fn set_ping_delay(&self, delay: Duration) {
      *self.state.ping_delay.lock() = delay;
   }

   /// Kill every connection opened so far
   pub fn kill_all(&self) {
      for handle in self.state.handles.lock().iter() {
         handle.store(false, Ordering::SeqCst);
      }
   }

   pub fn opened(&self) -> u64 {
      self.state.opened.load(Ordering::SeqCst)
   }

   pub fn closed(&self) -> u64 {
      self.state.closed.load(Ordering::SeqCst)
   }

   pub fn pings(&self) -> u64 {
      self.state.pings.load(Ordering::SeqCst)
   }

   pub fn commits(&self) -> u64 {
      self.state.commits.load(Ordering::SeqCst)
   }

   pub fn rollbacks(&self) -> u64 {
      self.state.rollbacks.load(Ordering::SeqCst)
   }
}

impl Connect for MockConnector {
   type Connection = MockConnection;

   async fn connect(&self) -> Result<MockConnection> {
      let delay = *self.state.connect_delay.lock();
      if !delay.is_zero() {
         tokio::time::sleep(delay).await;
      }

      if self.state.fail_connects.load(Ordering::SeqCst) {
         return Err(Error::Other("connection refused".into()));
      }

      let alive = Arc::new(AtomicBool::new(true));
      self.state.handles.lock().push(Arc::clone(&alive));
      self.state.opened.fetch_add(1, Ordering::SeqCst);

      Ok(MockConnection {
         id: self.state.next_id.fetch_add(1, Ordering::SeqCst),
         alive,
         in_transaction: false,
         read_only: false,
         statements: Vec::new(),
      })
   }

   async fn ping(&self, conn: &mut MockConnection) -> Result<()> {
      self.state.pings.fetch_add(1, Ordering::SeqCst);
      let delay = *self.state.ping_delay.lock();
      if !delay.is_zero() {
         tokio::time::sleep(delay).await;
      }
      conn.check_alive()
   }

   async fn begin(&self, conn: &mut MockConnection, read_only: bool) -> Result<()> {
      conn.check_alive()?;
      conn.in_transaction = true;
      conn.read_only = read_only;
      Ok(())
   }

   async fn commit(&self, conn: &mut MockConnection) -> Result<()> {
      conn.check_alive()?;
      conn.in_transaction = false;
      self.state.commits.fetch_add(1, Ordering::SeqCst);
      Ok(())
   }

   async fn rollback(&self, conn: &mut MockConnection) -> Result<()> {
      conn.check_alive()?;
      conn.in_transaction = false;
      self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
      Ok(())
   }

   async fn close(&self, conn: MockConnection) -> Result<()> {
      self.state.closed.fetch_add(1, Ordering::SeqCst);
      drop(conn);
      Ok(())
   }
}
