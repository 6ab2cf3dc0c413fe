//! Error types for sqlx-replica-pool

use std::time::Duration;

use thiserror::Error;

/// Errors that may occur when acquiring, probing or returning pooled connections
#[derive(Error, Debug)]
pub enum Error {
   /// Error from the sqlx library. Standard sqlx errors are converted to this variant
   #[error("Sqlx error: {0}")]
   Sqlx(#[from] sqlx::Error),

   /// No connection became free before the acquisition timeout elapsed
   #[error("Pool '{pool}' exhausted: no connection available within {timeout:?}")]
   PoolExhausted { pool: String, timeout: Duration },

   /// A connection failed its liveness probe or broke while checked out
   #[error("Connection in pool '{pool}' is dead: {reason}")]
   ConnectionDead { pool: String, reason: String },

   /// Pool has been closed and cannot hand out connections
   #[error("Pool '{0}' has been closed")]
   PoolClosed(String),

   /// Pool or endpoint configuration is unusable
   #[error("Invalid pool configuration: {0}")]
   InvalidConfig(String),

   /// Driver failure that doesn't fit other categories
   #[error("{0}")]
   Other(String),
}

impl Error {
   /// True for errors that mean the physical connection can no longer be used
   pub fn is_connection_dead(&self) -> bool {
      match self {
         Error::ConnectionDead { .. } => true,
         Error::Sqlx(e) => matches!(
            e,
            sqlx::Error::Io(_) | sqlx::Error::Protocol(_) | sqlx::Error::WorkerCrashed
         ),
         _ => false,
      }
   }
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_pool_exhausted_message() {
      let err = Error::PoolExhausted {
         pool: "replica".into(),
         timeout: Duration::from_millis(100),
      };
      assert!(err.to_string().contains("replica"));
      assert!(err.to_string().contains("100ms"));
      assert!(!err.is_connection_dead());
   }

   #[test]
   fn test_connection_dead_classification() {
      let err = Error::ConnectionDead {
         pool: "primary".into(),
         reason: "probe failed".into(),
      };
      assert!(err.is_connection_dead());

      let io = Error::Sqlx(sqlx::Error::Io(std::io::Error::new(
         std::io::ErrorKind::BrokenPipe,
         "gone",
      )));
      assert!(io.is_connection_dead());

      assert!(!Error::Sqlx(sqlx::Error::RowNotFound).is_connection_dead());
   }
}
