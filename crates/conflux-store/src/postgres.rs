//! Postgres-backed implementation of the repository contract.
//!
//! # Purpose
//! Implements [`Repository`] over a `sqlx` pool: schema discovery through
//! `information_schema`, single-row reads as JSON via `row_to_json`, and the
//! transactional partial UPDATE the engine commits drains with.
//!
//! # Notes
//! Connection pooling and timeouts are configured explicitly; hanging
//! forever on a dead database is not acceptable for a write-behind service.
//! Updates run under `REPEATABLE READ`, Postgres's snapshot isolation level.
use crate::statement::compile_update;
use crate::types::BindValue;
use crate::{Repository, Result, SchemaColumn, SchemaQuery, StoreError, TableIdent};
use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions};
use sqlx::query::{Query, QueryScalar};
use sqlx::{FromRow, PgPool, Postgres};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/conflux".to_string(),
            max_connections: 5,
            connect_timeout_ms: 5_000,
            acquire_timeout_ms: 5_000,
        }
    }
}

/// Repository backed by a shared `PgPool`.
#[derive(Debug, Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct ColumnRow {
    column_name: String,
    is_nullable: bool,
    is_identity: bool,
    sql_type: String,
    char_size: i32,
    num_precision: i32,
    num_scale: i32,
    is_primary_key: bool,
}

impl PostgresRepository {
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let options =
            PgConnectOptions::from_str(&config.url).map_err(|err| StoreError::Sqlx(err.into()))?;
        let connect = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect_with(options);
        let pool = tokio::time::timeout(Duration::from_millis(config.connect_timeout_ms), connect)
            .await
            .map_err(|_| StoreError::Unexpected(anyhow!("timed out connecting to postgres")))??;
        tracing::info!(
            max_connections = config.max_connections,
            "postgres pool established"
        );
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn get_schema(
        &self,
        table: &TableIdent,
        introspection_query: &str,
    ) -> Result<SchemaQuery> {
        let rows: Vec<ColumnRow> = sqlx::query_as(introspection_query)
            .fetch_all(&self.pool)
            .await?;

        let columns_all: Vec<SchemaColumn> = rows
            .into_iter()
            .map(|row| SchemaColumn {
                column_name: row.column_name,
                is_primary_key: row.is_primary_key,
                is_identity: row.is_identity,
                is_nullable: row.is_nullable,
                sql_type: row.sql_type,
                size: row.char_size,
                precision: row.num_precision,
                scale: row.num_scale,
            })
            .collect();

        // Composite keys are out of scope: the first key column wins and the
        // partition identity is its string form.
        let primary_key = columns_all.iter().find(|c| c.is_primary_key).cloned();
        let columns_no_pk = columns_all
            .iter()
            .filter(|c| !c.is_primary_key)
            .cloned()
            .collect();

        Ok(SchemaQuery {
            query: introspection_query.to_string(),
            table: table.clone(),
            primary_key,
            columns_all,
            columns_no_pk,
        })
    }

    async fn get_json(
        &self,
        select: &str,
        primary_key: &SchemaColumn,
        partition_key: &str,
    ) -> Result<Option<String>> {
        let key = crate::types::bind_partition_key(primary_key, partition_key)?;
        let query = bind_scalar(sqlx::query_scalar::<_, String>(select), key);
        Ok(query.fetch_optional(&self.pool).await?)
    }

    async fn update_partition(
        &self,
        template: &str,
        partition_key: &str,
        schema: &SchemaQuery,
        changes: &Value,
    ) -> Result<()> {
        let statement = compile_update(template, partition_key, schema, changes)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;

        let mut query = sqlx::query(&statement.sql);
        for param in statement.params {
            query = bind(query, param);
        }
        query.execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }
}

fn bind(query: Query<'_, Postgres, PgArguments>, value: BindValue) -> Query<'_, Postgres, PgArguments> {
    match value {
        BindValue::SmallInt(v) => query.bind(v),
        BindValue::Int(v) => query.bind(v),
        BindValue::BigInt(v) => query.bind(v),
        BindValue::Bool(v) => query.bind(v),
        BindValue::Text(v) => query.bind(v),
        BindValue::Date(v) => query.bind(v),
        BindValue::Timestamp(v) => query.bind(v),
        BindValue::TimestampTz(v) => query.bind(v),
        BindValue::Numeric(v) => query.bind(v),
        BindValue::Real(v) => query.bind(v),
        BindValue::Double(v) => query.bind(v),
        BindValue::Uuid(v) => query.bind(v),
        BindValue::Bytea(v) => query.bind(v),
        BindValue::Json(v) => query.bind(v),
    }
}

fn bind_scalar<O>(
    query: QueryScalar<'_, Postgres, O, PgArguments>,
    value: BindValue,
) -> QueryScalar<'_, Postgres, O, PgArguments> {
    match value {
        BindValue::SmallInt(v) => query.bind(v),
        BindValue::Int(v) => query.bind(v),
        BindValue::BigInt(v) => query.bind(v),
        BindValue::Bool(v) => query.bind(v),
        BindValue::Text(v) => query.bind(v),
        BindValue::Date(v) => query.bind(v),
        BindValue::Timestamp(v) => query.bind(v),
        BindValue::TimestampTz(v) => query.bind(v),
        BindValue::Numeric(v) => query.bind(v),
        BindValue::Real(v) => query.bind(v),
        BindValue::Double(v) => query.bind(v),
        BindValue::Uuid(v) => query.bind(v),
        BindValue::Bytea(v) => query.bind(v),
        BindValue::Json(v) => query.bind(v),
    }
}
