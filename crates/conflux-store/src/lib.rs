// Schema model, repository contract, and partial-update SQL compilation.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;
pub mod postgres;
pub mod statement;
pub mod types;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no store type mapping for column {column} of type {sql_type}")]
    UnmappedType { column: String, sql_type: String },
    #[error("table {0} has no primary key")]
    NoPrimaryKey(String),
    #[error("column {column} rejected value: {reason}")]
    InvalidValue { column: String, reason: String },
    #[error("no changed field matched a writable column")]
    NoMappedColumns,
    #[error("row not found for partition key {0}")]
    NotFound(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

/// Identity of the target table. The optional database segment only
/// participates in the resource key; connections are already scoped to one
/// database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableIdent {
    pub database: Option<String>,
    pub schema: String,
    pub table: String,
}

impl TableIdent {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: None,
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Cache/resource key: `database_schema_table`, omitted segments absent.
    pub fn resource_key(&self) -> String {
        match &self.database {
            Some(database) => format!("{}_{}_{}", database, self.schema, self.table),
            None => format!("{}_{}", self.schema, self.table),
        }
    }

    /// Schema-qualified, quoted name for use in generated SQL.
    pub fn qualified(&self) -> String {
        format!(
            "{}.{}",
            statement::quote_ident(&self.schema),
            statement::quote_ident(&self.table)
        )
    }
}

impl std::fmt::Display for TableIdent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// One column of the discovered schema. Immutable after discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaColumn {
    pub column_name: String,
    pub is_primary_key: bool,
    pub is_identity: bool,
    pub is_nullable: bool,
    /// Lower-cased store type name (`int4`, `varchar`, `numeric`, ...).
    pub sql_type: String,
    pub size: i32,
    pub precision: i32,
    pub scale: i32,
}

/// Discovered schema for one table, built once at manager initialization and
/// shared read-only by every partition of the resource.
#[derive(Debug, Clone)]
pub struct SchemaQuery {
    /// The introspection statement the schema was produced from.
    pub query: String,
    pub table: TableIdent,
    pub primary_key: Option<SchemaColumn>,
    pub columns_all: Vec<SchemaColumn>,
    pub columns_no_pk: Vec<SchemaColumn>,
}

impl SchemaQuery {
    pub fn has_primary_key(&self) -> bool {
        self.primary_key.is_some()
    }

    pub fn primary_key(&self) -> Result<&SchemaColumn> {
        self.primary_key
            .as_ref()
            .ok_or_else(|| StoreError::NoPrimaryKey(self.table.to_string()))
    }

    /// Writable column matching a changed field, if any. Case-sensitive:
    /// payload fields are expected to carry the exact column names.
    pub fn column_no_pk(&self, name: &str) -> Option<&SchemaColumn> {
        self.columns_no_pk.iter().find(|c| c.column_name == name)
    }
}

/// Relational store contract consumed by the coalescing engine.
///
/// `update_partition` must apply the changed fields in a single transaction;
/// the engine treats any error from it as a recoverable commit failure and
/// carries the fields forward to the next drain.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_schema(&self, table: &TableIdent, introspection_query: &str)
        -> Result<SchemaQuery>;

    /// Fetch one full row as a JSON object string, or `None` when the row
    /// does not exist.
    async fn get_json(
        &self,
        select: &str,
        primary_key: &SchemaColumn,
        partition_key: &str,
    ) -> Result<Option<String>>;

    async fn update_partition(
        &self,
        template: &str,
        partition_key: &str,
        schema: &SchemaQuery,
        changes: &serde_json::Value,
    ) -> Result<()>;
}
