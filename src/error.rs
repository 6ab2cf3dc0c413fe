/// Result type alias for router operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for routed database operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from a connection pool (exhaustion, dead connection, closed pool).
   #[error(transparent)]
   Pool(#[from] sqlx_replica_pool::Error),

   /// Error from SQLx operations.
   #[error(transparent)]
   Sqlx(#[from] sqlx::Error),

   /// Startup configuration is missing or invalid. The router cannot start.
   #[error("routing configuration error: {0}")]
   RoutingConfig(String),

   /// A transaction context was committed or rolled back a second time.
   ///
   /// This is a programming error in the caller, not a database failure.
   #[error("transaction {transaction_id} has already been released")]
   DoubleRelease { transaction_id: String },

   /// Statement issued on a transaction context that is already closed.
   #[error("transaction {transaction_id} is closed")]
   TransactionClosed { transaction_id: String },

   /// Transaction failed and rollback also failed.
   #[error("transaction failed: {transaction_error}; rollback also failed: {rollback_error}")]
   TransactionRollbackFailed {
      transaction_error: String,
      rollback_error: String,
   },

   /// SQLite type that cannot be mapped to JSON.
   #[error("unsupported datatype: {0}")]
   UnsupportedDatatype(String),

   /// Multiple rows returned from fetch_one query.
   #[error("fetch_one() query returned {0} rows, expected 0 or 1")]
   MultipleRowsReturned(usize),

   /// Generic error for operations that don't fit other categories.
   #[error("{0}")]
   Other(String),
}

impl Error {
   /// Extract a structured error code from the error type.
   pub fn error_code(&self) -> String {
      use sqlx_replica_pool::Error as PoolError;

      match self {
         Error::Pool(e) => match e {
            PoolError::PoolExhausted { .. } => "POOL_EXHAUSTED",
            PoolError::ConnectionDead { .. } => "CONNECTION_DEAD",
            PoolError::PoolClosed(_) => "POOL_CLOSED",
            PoolError::InvalidConfig(_) => "ROUTING_CONFIG",
            PoolError::Sqlx(_) | PoolError::Other(_) => "CONNECTION_ERROR",
         }
         .to_string(),
         Error::Sqlx(e) => {
            if let Some(code) = e.as_database_error().and_then(|db_err| db_err.code()) {
               return format!("SQLITE_{}", code);
            }
            "SQLX_ERROR".to_string()
         }
         Error::RoutingConfig(_) => "ROUTING_CONFIG".to_string(),
         Error::DoubleRelease { .. } => "DOUBLE_RELEASE".to_string(),
         Error::TransactionClosed { .. } => "TRANSACTION_CLOSED".to_string(),
         Error::TransactionRollbackFailed { .. } => "TRANSACTION_ROLLBACK_FAILED".to_string(),
         Error::UnsupportedDatatype(_) => "UNSUPPORTED_DATATYPE".to_string(),
         Error::MultipleRowsReturned(_) => "MULTIPLE_ROWS_RETURNED".to_string(),
         Error::Other(_) => "ERROR".to_string(),
      }
   }

   /// True when the physical connection behind a transaction is unusable
   pub fn is_connection_dead(&self) -> bool {
      match self {
         Error::Pool(e) => e.is_connection_dead(),
         Error::Sqlx(e) => matches!(
            e,
            sqlx::Error::Io(_) | sqlx::Error::Protocol(_) | sqlx::Error::WorkerCrashed
         ),
         _ => false,
      }
   }

   /// True for failures to obtain or keep a usable connection
   pub fn is_acquisition_error(&self) -> bool {
      use sqlx_replica_pool::Error as PoolError;

      matches!(
         self,
         Error::Pool(PoolError::PoolExhausted { .. } | PoolError::PoolClosed(_))
      ) || self.is_connection_dead()
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use std::time::Duration;
   use sqlx_replica_pool::Error as PoolError;

   #[test]
   fn test_error_code_pool_exhausted() {
      let err = Error::from(PoolError::PoolExhausted {
         pool: "replica".into(),
         timeout: Duration::from_millis(100),
      });
      assert_eq!(err.error_code(), "POOL_EXHAUSTED");
      assert!(err.is_acquisition_error());
      assert!(!err.is_connection_dead());
   }

   #[test]
   fn test_error_code_connection_dead() {
      let err = Error::from(PoolError::ConnectionDead {
         pool: "primary".into(),
         reason: "reset by peer".into(),
      });
      assert_eq!(err.error_code(), "CONNECTION_DEAD");
      assert!(err.is_acquisition_error());
      assert!(err.is_connection_dead());
   }

   #[test]
   fn test_error_code_routing_config() {
      let err = Error::RoutingConfig("missing replica url".into());
      assert_eq!(err.error_code(), "ROUTING_CONFIG");
      assert!(err.to_string().contains("missing replica url"));

      let err = Error::from(PoolError::InvalidConfig("max_connections".into()));
      assert_eq!(err.error_code(), "ROUTING_CONFIG");
   }

   #[test]
   fn test_error_code_double_release() {
      let err = Error::DoubleRelease {
         transaction_id: "abc".into(),
      };
      assert_eq!(err.error_code(), "DOUBLE_RELEASE");
      assert!(err.to_string().contains("abc"));
      assert!(!err.is_acquisition_error());
   }

   #[test]
   fn test_error_code_transaction_rollback_failed() {
      let err = Error::TransactionRollbackFailed {
         transaction_error: "constraint".into(),
         rollback_error: "busy".into(),
      };
      assert_eq!(err.error_code(), "TRANSACTION_ROLLBACK_FAILED");
      assert!(err.to_string().contains("constraint"));
      assert!(err.to_string().contains("busy"));
   }

   #[test]
   fn test_error_code_multiple_rows_returned() {
      let err = Error::MultipleRowsReturned(5);
      assert_eq!(err.error_code(), "MULTIPLE_ROWS_RETURNED");
      assert!(err.to_string().contains("5 rows"));
   }

   #[test]
   fn test_error_code_sqlx_non_database() {
      let err = Error::Sqlx(sqlx::Error::RowNotFound);
      assert_eq!(err.error_code(), "SQLX_ERROR");
      assert!(!err.is_connection_dead());
   }
}
