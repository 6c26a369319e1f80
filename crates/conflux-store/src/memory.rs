//! In-memory implementation of the repository contract.
//!
//! # Purpose
//! Holds a fixed schema and a map of JSON rows guarded by a
//! `tokio::sync::RwLock`. It exists for local development, tests, and
//! deployments that want the coalescing behavior without a durable store.
//! Updates still flow through the statement compiler so type mapping and
//! field filtering behave exactly as they do against Postgres.
use crate::statement::compile_update;
use crate::{Repository, Result, SchemaColumn, SchemaQuery, StoreError, TableIdent};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Non-durable repository over in-memory JSON rows, keyed by the partition
/// key's string form.
#[derive(Debug)]
pub struct InMemoryRepository {
    schema: SchemaQuery,
    rows: RwLock<HashMap<String, Value>>,
}

impl InMemoryRepository {
    pub fn new(schema: SchemaQuery) -> Self {
        Self {
            schema,
            rows: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert_row(&self, partition_key: impl Into<String>, row: Value) {
        self.rows.write().await.insert(partition_key.into(), row);
    }

    pub async fn row(&self, partition_key: &str) -> Option<Value> {
        self.rows.read().await.get(partition_key).cloned()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_schema(
        &self,
        _table: &TableIdent,
        introspection_query: &str,
    ) -> Result<SchemaQuery> {
        let mut schema = self.schema.clone();
        schema.query = introspection_query.to_string();
        Ok(schema)
    }

    async fn get_json(
        &self,
        _select: &str,
        _primary_key: &SchemaColumn,
        partition_key: &str,
    ) -> Result<Option<String>> {
        let rows = self.rows.read().await;
        match rows.get(partition_key) {
            Some(row) => Ok(Some(serde_json::to_string(row).map_err(|err| {
                StoreError::Unexpected(err.into())
            })?)),
            None => Ok(None),
        }
    }

    async fn update_partition(
        &self,
        template: &str,
        partition_key: &str,
        schema: &SchemaQuery,
        changes: &Value,
    ) -> Result<()> {
        // Compile first so type mapping errors surface like they would
        // against a real store.
        compile_update(template, partition_key, schema, changes)?;

        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(partition_key)
            .ok_or_else(|| StoreError::NotFound(partition_key.to_string()))?;
        let Some(row_fields) = row.as_object_mut() else {
            return Err(StoreError::Unexpected(anyhow::anyhow!(
                "stored row is not a JSON object"
            )));
        };
        if let Some(fields) = changes.as_object() {
            for (name, value) in fields {
                if schema.column_no_pk(name).is_some() {
                    row_fields.insert(name.clone(), value.clone());
                }
            }
        }
        Ok(())
    }
}
