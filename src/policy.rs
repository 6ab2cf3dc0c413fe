//! Routing decision: which pool serves a transaction

use std::fmt;

use serde::{Deserialize, Serialize};

/// Routing key naming one of the two connection pools
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolIdentifier {
   /// Writable, authoritative database
   #[default]
   Primary,
   /// Read-only copy fed by asynchronous replication; may lag
   Replica,
}

impl PoolIdentifier {
   pub fn as_str(&self) -> &'static str {
      match self {
         PoolIdentifier::Primary => "primary",
         PoolIdentifier::Replica => "replica",
      }
   }
}

impl fmt::Display for PoolIdentifier {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

/// A transaction's declared nature, fixed before any query runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
   ReadOnly,
   ReadWrite,
}

impl Intent {
   pub fn is_read_only(&self) -> bool {
      matches!(self, Intent::ReadOnly)
   }

   /// Classify an HTTP request method.
   ///
   /// Safe methods (`GET`, `HEAD`, `OPTIONS`) read; everything else,
   /// including methods we don't recognize, is treated as a write.
   pub fn from_http_method(method: &str) -> Self {
      match method.trim().to_ascii_uppercase().as_str() {
         "GET" | "HEAD" | "OPTIONS" => Intent::ReadOnly,
         _ => Intent::ReadWrite,
      }
   }
}

impl fmt::Display for Intent {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Intent::ReadOnly => f.write_str("read-only"),
         Intent::ReadWrite => f.write_str("read-write"),
      }
   }
}

/// Everything the routing decision may depend on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentState {
   NoTransaction,
   ReadOnly,
   ReadWrite,
}

impl From<Intent> for IntentState {
   fn from(intent: Intent) -> Self {
      match intent {
         Intent::ReadOnly => IntentState::ReadOnly,
         Intent::ReadWrite => IntentState::ReadWrite,
      }
   }
}

/// Static mapping from intent to pool.
///
/// | State            | Pool      |
/// |------------------|-----------|
/// | `ReadOnly`       | `Replica` |
/// | `ReadWrite`      | `Primary` |
/// | `NoTransaction`  | `Primary` |
///
/// Anything not explicitly read-only goes to the primary: a stale read is
/// never traded for availability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutingPolicy;

impl RoutingPolicy {
   pub const fn new() -> Self {
      Self
   }

   pub const fn resolve(&self, state: IntentState) -> PoolIdentifier {
      match state {
         IntentState::ReadOnly => PoolIdentifier::Replica,
         IntentState::ReadWrite | IntentState::NoTransaction => PoolIdentifier::Primary,
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   const ALL_STATES: [IntentState; 3] = [
      IntentState::NoTransaction,
      IntentState::ReadOnly,
      IntentState::ReadWrite,
   ];

   #[test]
   fn test_routing_table() {
      let policy = RoutingPolicy::new();
      assert_eq!(policy.resolve(IntentState::ReadOnly), PoolIdentifier::Replica);
      assert_eq!(policy.resolve(IntentState::ReadWrite), PoolIdentifier::Primary);
      assert_eq!(policy.resolve(IntentState::NoTransaction), PoolIdentifier::Primary);
   }

   #[test]
   fn test_resolve_is_deterministic() {
      let policy = RoutingPolicy::new();
      for state in ALL_STATES {
         let first = policy.resolve(state);
         for _ in 0..100 {
            assert_eq!(policy.resolve(state), first);
         }
      }
   }

   #[test]
   fn test_only_read_only_reaches_replica() {
      let policy = RoutingPolicy::new();
      for state in ALL_STATES {
         let pool = policy.resolve(state);
         assert_eq!(pool == PoolIdentifier::Replica, state == IntentState::ReadOnly);
      }
   }

   #[test]
   fn test_intent_state_conversion() {
      assert_eq!(IntentState::from(Intent::ReadOnly), IntentState::ReadOnly);
      assert_eq!(IntentState::from(Intent::ReadWrite), IntentState::ReadWrite);
   }

   #[test]
   fn test_intent_from_http_method() {
      assert_eq!(Intent::from_http_method("GET"), Intent::ReadOnly);
      assert_eq!(Intent::from_http_method("head"), Intent::ReadOnly);
      assert_eq!(Intent::from_http_method("OPTIONS"), Intent::ReadOnly);
      assert_eq!(Intent::from_http_method("POST"), Intent::ReadWrite);
      assert_eq!(Intent::from_http_method("PUT"), Intent::ReadWrite);
      assert_eq!(Intent::from_http_method("DELETE"), Intent::ReadWrite);
      assert_eq!(Intent::from_http_method("BREW"), Intent::ReadWrite);
   }

   #[test]
   fn test_default_pool_is_primary() {
      assert_eq!(PoolIdentifier::default(), PoolIdentifier::Primary);
      assert_eq!(PoolIdentifier::Replica.to_string(), "replica");
   }
}
