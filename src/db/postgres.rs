// PostgreSQL backend for the store and the pool
//
// Connections are plain `sqlx::PgConnection`s; pooling is done by our own
// `Pool`. Result rows are decoded column by column into `Value`s based on
// the Postgres type name, so collectors never see driver types.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{Column, Connection as _, Executor, Row as _, TypeInfo};
use tracing::debug;

use super::{Connection, ConnectionManager, Query, Row, Store, StoreError, Value};
use crate::config::DatabaseSettings;

/// Opens connections to the Open WebUI database
pub struct PgConnectionManager {
    options: PgConnectOptions,
}

impl PgConnectionManager {
    pub fn new(settings: &DatabaseSettings) -> Self {
        let options = PgConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .username(&settings.user)
            .password(&settings.password)
            .database(&settings.name);

        PgConnectionManager { options }
    }
}

#[async_trait]
impl ConnectionManager for PgConnectionManager {
    type Connection = PgStoreConnection;

    async fn connect(&self) -> Result<PgStoreConnection, StoreError> {
        let conn = PgConnection::connect_with(&self.options).await?;
        debug!("Opened PostgreSQL connection");
        Ok(PgStoreConnection { conn })
    }
}

/// A single PostgreSQL connection usable as a `Store`
pub struct PgStoreConnection {
    conn: PgConnection,
}

impl PgStoreConnection {
    async fn run(&mut self, sql: &str) -> Result<(), StoreError> {
        (&mut self.conn).execute(sql).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStoreConnection {
    async fn fetch(&mut self, query: &Query) -> Result<Vec<Row>, StoreError> {
        let mut statement = sqlx::query(query.sql());
        for param in query.params() {
            statement = match param {
                Value::Null => statement.bind(None::<i64>),
                Value::Bool(v) => statement.bind(v),
                Value::Int(v) => statement.bind(v),
                Value::Float(v) => statement.bind(v),
                Value::Text(v) => statement.bind(v),
                Value::Json(v) => statement.bind(v),
            };
        }

        let rows = statement.fetch_all(&mut self.conn).await?;
        debug!("Query '{}' returned {} row(s)", query.name(), rows.len());

        rows.iter().map(decode_row).collect()
    }
}

#[async_trait]
impl Connection for PgStoreConnection {
    async fn begin(&mut self) -> Result<(), StoreError> {
        self.run("BEGIN").await
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.run("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.run("ROLLBACK").await
    }

    async fn savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.run(&format!("SAVEPOINT {}", savepoint_ident(name)))
            .await
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.run(&format!("ROLLBACK TO SAVEPOINT {}", savepoint_ident(name)))
            .await
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.run(&format!("RELEASE SAVEPOINT {}", savepoint_ident(name)))
            .await
    }

    async fn ping(&mut self) -> Result<(), StoreError> {
        self.conn.ping().await?;
        Ok(())
    }

    async fn close(self) -> Result<(), StoreError> {
        self.conn.close().await?;
        Ok(())
    }
}

/// Quotes a savepoint name as an identifier
fn savepoint_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn decode_row(row: &PgRow) -> Result<Row, StoreError> {
    let mut values = Vec::with_capacity(row.len());
    for (index, column) in row.columns().iter().enumerate() {
        values.push(decode_value(row, index, column.type_info().name())?);
    }
    Ok(Row::new(values))
}

/// Decodes one column according to its Postgres type
///
/// Aggregates that Postgres returns as NUMERIC (e.g. `EXTRACT`) are cast
/// to `float8`/`bigint` in the SQL text, so NUMERIC is not handled here.
fn decode_value(row: &PgRow, index: usize, type_name: &str) -> Result<Value, StoreError> {
    let value = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(index)?.map(Value::Bool),
        "INT2" => row
            .try_get::<Option<i16>, _>(index)?
            .map(|v| Value::Int(v.into())),
        "INT4" => row
            .try_get::<Option<i32>, _>(index)?
            .map(|v| Value::Int(v.into())),
        "INT8" => row.try_get::<Option<i64>, _>(index)?.map(Value::Int),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(index)?
            .map(|v| Value::Float(v.into())),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index)?.map(Value::Float),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
            row.try_get::<Option<String>, _>(index)?.map(Value::Text)
        }
        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(index)?
            .map(Value::Json),
        other => {
            return Err(StoreError::UnsupportedType {
                column: index,
                type_name: other.to_string(),
            })
        }
    };

    Ok(value.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_savepoint_ident_is_quoted() {
        assert_eq!(savepoint_ident("users"), "\"users\"");
        assert_eq!(savepoint_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_manager_uses_settings() {
        let settings = DatabaseSettings {
            name: "openwebui".to_string(),
            user: "exporter".to_string(),
            password: "secret".to_string(),
            host: "db.internal".to_string(),
            port: 6543,
        };
        let manager = PgConnectionManager::new(&settings);

        assert_eq!(manager.options.get_host(), "db.internal");
        assert_eq!(manager.options.get_port(), 6543);
        assert_eq!(manager.options.get_username(), "exporter");
        assert_eq!(manager.options.get_database(), Some("openwebui"));
    }
}
