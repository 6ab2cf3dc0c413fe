//! SQLite value to JSON conversion

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{Sqlite, SqliteValueRef};
use sqlx::{Decode, TypeInfo, ValueRef};

use crate::{Error, Result};

/// Convert a raw SQLite value to JSON.
///
/// Integers keep full i64 precision, BLOBs become base64 strings.
pub(crate) fn to_json(value: SqliteValueRef<'_>) -> Result<JsonValue> {
   if value.is_null() {
      return Ok(JsonValue::Null);
   }

   let type_name = value.type_info().name().to_string();
   let json = match type_name.as_str() {
      "INTEGER" | "BOOLEAN" | "NUMERIC" => JsonValue::from(decode::<i64>(value)?),
      "REAL" => serde_json::Number::from_f64(decode::<f64>(value)?)
         .map(JsonValue::Number)
         .unwrap_or(JsonValue::Null),
      "TEXT" | "DATE" | "TIME" | "DATETIME" => JsonValue::String(decode::<String>(value)?),
      "BLOB" => JsonValue::String(STANDARD.encode(decode::<Vec<u8>>(value)?)),
      _ => return Err(Error::UnsupportedDatatype(type_name)),
   };

   Ok(json)
}

fn decode<'r, T: Decode<'r, Sqlite>>(value: SqliteValueRef<'r>) -> Result<T> {
   T::decode(value).map_err(|e| Error::Sqlx(sqlx::Error::Decode(e)))
}
