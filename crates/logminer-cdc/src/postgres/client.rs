//! [`SqlConnection`] adapter over `tokio-postgres`.

use super::backend::redact_connection_string;
use crate::common::{ConnectionSupplier, Result, SqlConnection, SqlRow, SqlValue};
use async_trait::async_trait;
use tokio_postgres::types::{ToSql, Type};
use tracing::{debug, error};

fn value_to_sql(value: &SqlValue) -> Box<dyn ToSql + Sync + Send> {
    match value {
        SqlValue::Null => Box::new(Option::<String>::None),
        SqlValue::Bool(b) => Box::new(*b),
        SqlValue::Int64(n) => Box::new(*n),
        SqlValue::Text(s) => Box::new(s.clone()),
        SqlValue::Bytes(b) => Box::new(b.clone()),
    }
}

fn column_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> SqlValue {
    let value = match *pg_type {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx).ok().flatten().map(SqlValue::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(|v| SqlValue::Int64(i64::from(v))),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(|v| SqlValue::Int64(i64::from(v))),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx).ok().flatten().map(SqlValue::Int64),
        Type::OID => row
            .try_get::<_, Option<u32>>(idx)
            .ok()
            .flatten()
            .map(|v| SqlValue::Int64(i64::from(v))),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Bytes),
        // Text types and anything else with a text-compatible decoding
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(SqlValue::Text),
    };
    value.unwrap_or(SqlValue::Null)
}

fn convert_row(pg_row: &tokio_postgres::Row) -> SqlRow {
    let columns = pg_row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let values = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| column_value(pg_row, i, col.type_()))
        .collect();
    SqlRow::new(columns, values)
}

/// One `tokio-postgres` client.
pub struct PgConnection {
    client: tokio_postgres::Client,
}

impl PgConnection {
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }
}

#[async_trait]
impl SqlConnection for PgConnection {
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        let boxed: Vec<Box<dyn ToSql + Sync + Send>> = params.iter().map(value_to_sql).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = boxed
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let rows = self.client.query(sql, &refs).await?;
        Ok(rows.iter().map(convert_row).collect())
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let boxed: Vec<Box<dyn ToSql + Sync + Send>> = params.iter().map(value_to_sql).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = boxed
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();
        Ok(self.client.execute(sql, &refs).await?)
    }

    async fn is_valid(&self) -> bool {
        !self.client.is_closed()
    }
}

/// Opens a fresh connection per mining attempt.
pub struct PgConnectionSupplier {
    connection_string: String,
}

impl PgConnectionSupplier {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
        }
    }
}

impl std::fmt::Debug for PgConnectionSupplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnectionSupplier")
            .field(
                "connection_string",
                &redact_connection_string(&self.connection_string),
            )
            .finish()
    }
}

#[async_trait]
impl ConnectionSupplier for PgConnectionSupplier {
    type Connection = PgConnection;

    async fn acquire(&self) -> Result<PgConnection> {
        let (client, connection) =
            tokio_postgres::connect(&self.connection_string, tokio_postgres::NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });
        debug!(
            "Connected to {}",
            redact_connection_string(&self.connection_string)
        );
        Ok(PgConnection::new(client))
    }

    async fn release(&self, conn: PgConnection) {
        // Dropping the client ends the connection task.
        drop(conn);
    }
}
