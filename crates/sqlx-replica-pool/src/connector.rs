//! Driver seam between the pool and a physical database connection

use std::future::Future;
use std::str::FromStr;

use sqlx::Connection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use tracing::debug;

use crate::{EndpointConfig, Error, Result};

/// Opens, probes and drives transactions on connections to one endpoint.
///
/// The pool owns connection lifecycle and bookkeeping; implementors only
/// speak the database protocol.
pub trait Connect: Send + Sync + 'static {
   /// Physical connection handed to callers
   type Connection: Send + 'static;

   /// Open a brand new connection to the endpoint
   fn connect(&self) -> impl Future<Output = Result<Self::Connection>> + Send;

   /// Lightweight liveness probe
   fn ping(&self, conn: &mut Self::Connection) -> impl Future<Output = Result<()>> + Send;

   /// Start a transaction on `conn`
   fn begin(
      &self,
      conn: &mut Self::Connection,
      read_only: bool,
   ) -> impl Future<Output = Result<()>> + Send;

   fn commit(&self, conn: &mut Self::Connection) -> impl Future<Output = Result<()>> + Send;

   fn rollback(&self, conn: &mut Self::Connection) -> impl Future<Output = Result<()>> + Send;

   /// Gracefully close a connection the pool no longer wants
   fn close(&self, conn: Self::Connection) -> impl Future<Output = Result<()>> + Send;
}

/// [`Connect`] implementation for SQLite endpoints.
///
/// Replica connectors open every connection read-only, so a write that was
/// routed to the replica fails instead of silently diverging.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
   options: SqliteConnectOptions,
   read_only: bool,
}

impl SqliteConnector {
   /// Connector for the writable primary. Creates the database file if missing.
   pub fn primary(endpoint: &EndpointConfig) -> Result<Self> {
      Self::from_endpoint(endpoint, false)
   }

   /// Connector for a read-only replica. The database file must already exist.
   pub fn replica(endpoint: &EndpointConfig) -> Result<Self> {
      Self::from_endpoint(endpoint, true)
   }

   fn from_endpoint(endpoint: &EndpointConfig, read_only: bool) -> Result<Self> {
      endpoint.validate()?;

      if !endpoint.url.starts_with("sqlite:") {
         return Err(Error::InvalidConfig(format!(
            "'{}' is not a sqlite: url",
            endpoint.url
         )));
      }

      if endpoint.username.is_some() || endpoint.password.is_some() {
         debug!(url = %endpoint.url, "SQLite does not authenticate; ignoring credentials");
      }

      let options = SqliteConnectOptions::from_str(&endpoint.url)
         .map_err(|e| Error::InvalidConfig(format!("invalid url '{}': {}", endpoint.url, e)))?
         .read_only(read_only)
         .create_if_missing(!read_only);

      Ok(Self { options, read_only })
   }

   pub fn is_read_only(&self) -> bool {
      self.read_only
   }
}

impl Connect for SqliteConnector {
   type Connection = SqliteConnection;

   async fn connect(&self) -> Result<SqliteConnection> {
      Ok(SqliteConnection::connect_with(&self.options).await?)
   }

   async fn ping(&self, conn: &mut SqliteConnection) -> Result<()> {
      Ok(conn.ping().await?)
   }

   async fn begin(&self, conn: &mut SqliteConnection, read_only: bool) -> Result<()> {
      // IMMEDIATE takes the write lock up front so writers serialize at BEGIN
      let statement = if read_only { "BEGIN" } else { "BEGIN IMMEDIATE" };
      sqlx::query(statement).execute(&mut *conn).await?;
      Ok(())
   }

   async fn commit(&self, conn: &mut SqliteConnection) -> Result<()> {
      sqlx::query("COMMIT").execute(&mut *conn).await?;
      Ok(())
   }

   async fn rollback(&self, conn: &mut SqliteConnection) -> Result<()> {
      sqlx::query("ROLLBACK").execute(&mut *conn).await?;
      Ok(())
   }

   async fn close(&self, conn: SqliteConnection) -> Result<()> {
      Ok(conn.close().await?)
   }
}
