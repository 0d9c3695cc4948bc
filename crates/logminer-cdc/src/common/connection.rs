//! Backend connection contract
//!
//! The mining core never opens sockets itself. It talks to the database
//! through [`SqlConnection`] handles obtained from a [`ConnectionSupplier`],
//! and backends express their metadata queries and session calls as
//! parameterized SQL over that trait.

use crate::common::{CdcError, PositionToken, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// SQL parameter or column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    Int64(i64),
    /// Text (VARCHAR, TEXT, CHAR)
    Text(String),
    /// Binary data (BYTEA, RAW, BLOB)
    Bytes(Vec<u8>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(v) => Some(*v),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int64(v) => Some(*v != 0),
            Self::Text(s) => match s.as_str() {
                "Y" | "YES" | "y" | "t" | "true" | "1" => Some(true),
                "N" | "NO" | "n" | "f" | "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            Self::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// A result row: column names with their values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SqlRow {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl SqlRow {
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Build a row from `(column, value)` pairs.
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, SqlValue)>,
        K: Into<String>,
    {
        let (columns, values) = pairs.into_iter().map(|(k, v)| (k.into(), v)).unzip();
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn get(&self, idx: usize) -> Option<&SqlValue> {
        self.values.get(idx)
    }

    /// Value by case-insensitive column name.
    pub fn get_by_name(&self, name: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|idx| self.values.get(idx))
    }

    fn required(&self, name: &str) -> Result<&SqlValue> {
        self.get_by_name(name)
            .ok_or_else(|| CdcError::decode(format!("missing column {}", name)))
    }

    /// Non-null integer column.
    pub fn i64(&self, name: &str) -> Result<i64> {
        self.required(name)?
            .as_i64()
            .ok_or_else(|| CdcError::decode(format!("column {} is not an integer", name)))
    }

    /// Nullable integer column.
    pub fn opt_i64(&self, name: &str) -> Result<Option<i64>> {
        match self.get_by_name(name) {
            None | Some(SqlValue::Null) => Ok(None),
            Some(v) => v
                .as_i64()
                .map(Some)
                .ok_or_else(|| CdcError::decode(format!("column {} is not an integer", name))),
        }
    }

    /// Nullable text column.
    pub fn opt_str(&self, name: &str) -> Option<&str> {
        self.get_by_name(name).and_then(SqlValue::as_str)
    }

    /// Non-null text column.
    pub fn str(&self, name: &str) -> Result<&str> {
        self.opt_str(name)
            .ok_or_else(|| CdcError::decode(format!("column {} is not text", name)))
    }

    /// Boolean column; NULL reads as `false`.
    pub fn flag(&self, name: &str) -> bool {
        self.get_by_name(name)
            .and_then(SqlValue::as_bool)
            .unwrap_or(false)
    }

    /// Position column. NULL maps to [`PositionToken::Null`]; numbers may
    /// arrive as integers or as decimal text for values above `i64`.
    pub fn position(&self, name: &str) -> Result<PositionToken> {
        match self.get_by_name(name) {
            None | Some(SqlValue::Null) => Ok(PositionToken::Null),
            Some(SqlValue::Int64(v)) if *v >= 0 => Ok(PositionToken::Value(i128::from(*v))),
            Some(SqlValue::Text(s)) => PositionToken::parse(s),
            Some(other) => Err(CdcError::malformed_position(format!(
                "column {} holds {:?}",
                name, other
            ))),
        }
    }
}

/// A live database connection.
#[async_trait]
pub trait SqlConnection: Send + Sync {
    /// Execute a query that returns rows
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>>;

    /// Execute a statement, returns affected row count
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Execute a query and stream its rows. The default fetches every row
    /// up front; drivers with server-side cursors override it.
    async fn query_stream(&self, sql: &str, params: &[SqlValue]) -> Result<Pin<Box<dyn RowStream>>> {
        let rows = self.query(sql, params).await?;
        Ok(Box::pin(VecRowStream::new(rows)))
    }

    /// Execute a query and return the first row
    async fn query_one(&self, sql: &str, params: &[SqlValue]) -> Result<Option<SqlRow>> {
        let rows = self.query(sql, params).await?;
        Ok(rows.into_iter().next())
    }

    /// Check if the connection is still usable
    async fn is_valid(&self) -> bool {
        true
    }
}

/// Streaming row iterator
pub trait RowStream: Send + Unpin {
    /// Get the next row; `None` once the result set is exhausted
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<SqlRow>>> + Send + '_>>;
}

/// Row stream over rows already in memory.
pub struct VecRowStream {
    rows: std::vec::IntoIter<SqlRow>,
}

impl VecRowStream {
    pub fn new(rows: Vec<SqlRow>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

impl RowStream for VecRowStream {
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<SqlRow>>> + Send + '_>> {
        Box::pin(async move { Ok(self.rows.next()) })
    }
}

/// Source of connections for the mining loop.
///
/// Every connection handed out by `acquire` is given back through `release`
/// on every exit path, including failures.
#[async_trait]
pub trait ConnectionSupplier: Send + Sync {
    type Connection: SqlConnection + 'static;

    async fn acquire(&self) -> Result<Self::Connection>;

    async fn release(&self, conn: Self::Connection);
}


/// Connection double that answers queries from a script and records every
/// statement it sees.
#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct ScriptedConnection {
        responses: Vec<(String, Vec<SqlRow>)>,
        failures: Vec<(String, String)>,
        log: Mutex<Vec<(String, Vec<SqlValue>)>>,
    }

    impl ScriptedConnection {
        pub fn new() -> Self {
            Self::default()
        }

        /// Answer queries whose text contains `marker` with `rows`.
        pub fn on_query(mut self, marker: &str, rows: Vec<SqlRow>) -> Self {
            self.responses.push((marker.to_string(), rows));
            self
        }

        /// Fail statements whose text or any text parameter contains `marker`.
        pub fn fail_when(mut self, marker: &str, message: &str) -> Self {
            self.failures.push((marker.to_string(), message.to_string()));
            self
        }

        pub fn calls(&self) -> Vec<(String, Vec<SqlValue>)> {
            self.log.lock().map(|l| l.clone()).unwrap_or_default()
        }

        /// Number of recorded statements containing `marker`.
        pub fn count(&self, marker: &str) -> usize {
            self.calls().iter().filter(|(sql, _)| sql.contains(marker)).count()
        }

        fn record(&self, sql: &str, params: &[SqlValue]) -> Result<()> {
            if let Ok(mut log) = self.log.lock() {
                log.push((sql.to_string(), params.to_vec()));
            }
            for (marker, message) in &self.failures {
                let in_params = params
                    .iter()
                    .any(|p| p.as_str().is_some_and(|s| s.contains(marker.as_str())));
                if sql.contains(marker.as_str()) || in_params {
                    return Err(CdcError::database(message.clone()));
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SqlConnection for ScriptedConnection {
        async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
            self.record(sql, params)?;
            Ok(self
                .responses
                .iter()
                .find(|(marker, _)| sql.contains(marker.as_str()))
                .map(|(_, rows)| rows.clone())
                .unwrap_or_default())
        }

        async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
            self.record(sql, params)?;
            Ok(1)
        }
    }
}
