//! JSON statement helpers for routed SQLite transactions

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, Row, Sqlite};

use crate::datasource::SqliteRoutingDataSource;
use crate::transaction::TransactionContext;
use crate::{Error, Result};

use sqlx_replica_pool::SqliteConnector;

/// Row decoded to column name / JSON value pairs, in column order
pub type JsonRow = IndexMap<String, JsonValue>;

/// Result returned from write operations (e.g. INSERT, UPDATE, DELETE).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteQueryResult {
   /// The number of rows affected by the write operation.
   pub rows_affected: u64,
   /// The last inserted row ID (SQLite ROWID).
   ///
   /// Only set for INSERT operations on tables with a ROWID.
   /// Tables created with `WITHOUT ROWID` will not set this value (returns 0).
   pub last_insert_id: i64,
}

impl SqliteRoutingDataSource {
   /// Execute a write statement (INSERT/UPDATE/DELETE/DDL) inside `ctx`
   pub async fn execute_statement(
      &self,
      ctx: &mut TransactionContext<SqliteConnector>,
      query: String,
      values: Vec<JsonValue>,
   ) -> Result<WriteQueryResult> {
      self
         .execute(ctx, move |conn| {
            Box::pin(async move {
               let result = bind_values(sqlx::query(&query), values)
                  .execute(&mut *conn)
                  .await?;
               Ok::<_, Error>(WriteQueryResult {
                  rows_affected: result.rows_affected(),
                  last_insert_id: result.last_insert_rowid(),
               })
            })
         })
         .await
   }

   /// Execute a SELECT query inside `ctx`, returning every row
   pub async fn fetch_all(
      &self,
      ctx: &mut TransactionContext<SqliteConnector>,
      query: String,
      values: Vec<JsonValue>,
   ) -> Result<Vec<JsonRow>> {
      self
         .execute(ctx, move |conn| {
            Box::pin(async move {
               let rows = bind_values(sqlx::query(&query), values)
                  .fetch_all(&mut *conn)
                  .await?;
               decode_rows(rows)
            })
         })
         .await
   }

   /// Execute a SELECT query inside `ctx` expecting zero or one row
   pub async fn fetch_one(
      &self,
      ctx: &mut TransactionContext<SqliteConnector>,
      query: String,
      values: Vec<JsonValue>,
   ) -> Result<Option<JsonRow>> {
      // Fetch up to 2 rows to detect queries matching more than one. Wrapping
      // keeps any LIMIT the query already has.
      let limited_query = format!(
         "SELECT * FROM ({}) LIMIT 2",
         query.trim_end().trim_end_matches(';')
      );
      let rows = self.fetch_all(ctx, limited_query, values).await?;

      match rows.len() {
         0 | 1 => Ok(rows.into_iter().next()),
         count => Err(Error::MultipleRowsReturned(count)),
      }
   }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_values(query: SqliteQuery<'_>, values: Vec<JsonValue>) -> SqliteQuery<'_> {
   values.into_iter().fold(query, bind_value)
}

/// Helper function to bind a JSON value to a SQLx query
pub(crate) fn bind_value(query: SqliteQuery<'_>, value: JsonValue) -> SqliteQuery<'_> {
   match value {
      JsonValue::Null => query.bind(None::<JsonValue>),
      JsonValue::String(s) => query.bind(s),
      JsonValue::Bool(b) => query.bind(b),
      JsonValue::Number(number) => {
         // Preserve integer precision by binding as i64 when possible
         if let Some(int_val) = number.as_i64() {
            query.bind(int_val)
         } else if let Some(uint_val) = number.as_u64() {
            // Value too large for i64, use f64 (will lose precision)
            query.bind(uint_val as f64)
         } else {
            query.bind(number.as_f64().unwrap_or_default())
         }
      }
      other => query.bind(other),
   }
}

fn decode_rows(rows: Vec<SqliteRow>) -> Result<Vec<JsonRow>> {
   let mut values = Vec::with_capacity(rows.len());
   for row in rows {
      let mut value = IndexMap::default();
      for (i, column) in row.columns().iter().enumerate() {
         let v = row.try_get_raw(i)?;
         let v = crate::decode::to_json(v)?;
         value.insert(column.name().to_string(), v);
      }
      values.push(value);
   }
   Ok(values)
}
