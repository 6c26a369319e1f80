//! Shared fixtures: a managed entity, its schema, a repository wrapper with
//! commit-failure injection, and a fully wired manager harness.
use async_trait::async_trait;
use bytes::Bytes;
use conflux_cache::EphemeralResourceCache;
use conflux_engine::{EngineConfig, Resource, TableManager};
use conflux_store::memory::InMemoryRepository;
use conflux_store::{Repository, Result, SchemaColumn, SchemaQuery, TableIdent};
use conflux_transport::{InProcessQueue, MessageSource};
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const QUEUE: &str = "change-requests";
pub const RESOURCE_KEY: &str = "public_RudimentaryEntity";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
#[allow(dead_code)]
pub struct TestEntity {
    pub primary_key: i64,
    pub foreign_key: Option<i64>,
    pub reference_id: Option<Uuid>,
    pub is_yes: Option<bool>,
    pub lucky_number: Option<i64>,
    pub dollar_amount: Option<f64>,
    pub math_calculation: Option<f64>,
    pub label: Option<String>,
    pub right_now: Option<String>,
}

impl Resource for TestEntity {
    fn partition_key(&self) -> String {
        self.primary_key.to_string()
    }
}

fn col(name: &str, sql_type: &str, pk: bool) -> SchemaColumn {
    SchemaColumn {
        column_name: name.to_string(),
        is_primary_key: pk,
        is_identity: pk,
        is_nullable: !pk,
        sql_type: sql_type.to_string(),
        size: 0,
        precision: 0,
        scale: 0,
    }
}

pub fn rudimentary_schema() -> SchemaQuery {
    let columns = vec![
        col("PrimaryKey", "int4", true),
        col("ForeignKey", "int4", false),
        col("ReferenceId", "uuid", false),
        col("IsYes", "bool", false),
        col("LuckyNumber", "int4", false),
        col("DollarAmount", "numeric", false),
        col("MathCalculation", "float8", false),
        col("Label", "varchar", false),
        col("RightNow", "timestamp", false),
    ];
    SchemaQuery {
        query: String::new(),
        table: TableIdent::new("public", "RudimentaryEntity"),
        primary_key: Some(columns[0].clone()),
        columns_no_pk: columns[1..].to_vec(),
        columns_all: columns,
    }
}

pub fn seed_row(primary_key: i64) -> Value {
    json!({
        "PrimaryKey": primary_key,
        "ForeignKey": 10,
        "ReferenceId": "903988d3-b96d-430b-a34b-bb1f0db7c9f7",
        "IsYes": true,
        "LuckyNumber": 7,
        "DollarAmount": 100.00,
        "MathCalculation": 0.678593902,
        "Label": "Poisonous",
        "RightNow": "2021-10-17T03:19:54.5433333"
    })
}

/// In-memory repository with injectable commit failures; records every
/// changed-fields payload `update_partition` receives, failed or not.
pub struct FlakyRepository {
    inner: InMemoryRepository,
    fail_next: AtomicUsize,
    updates: Mutex<Vec<Value>>,
}

impl FlakyRepository {
    pub fn new(schema: SchemaQuery) -> Self {
        Self {
            inner: InMemoryRepository::new(schema),
            fail_next: AtomicUsize::new(0),
            updates: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next_updates(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn recorded_updates(&self) -> Vec<Value> {
        self.updates.lock().unwrap().clone()
    }

    pub async fn insert_row(&self, partition_key: impl Into<String>, row: Value) {
        self.inner.insert_row(partition_key, row).await;
    }

    pub async fn row(&self, partition_key: &str) -> Option<Value> {
        self.inner.row(partition_key).await
    }
}

#[async_trait]
impl Repository for FlakyRepository {
    async fn get_schema(
        &self,
        table: &TableIdent,
        introspection_query: &str,
    ) -> Result<SchemaQuery> {
        self.inner.get_schema(table, introspection_query).await
    }

    async fn get_json(
        &self,
        select: &str,
        primary_key: &SchemaColumn,
        partition_key: &str,
    ) -> Result<Option<String>> {
        self.inner.get_json(select, primary_key, partition_key).await
    }

    async fn update_partition(
        &self,
        template: &str,
        partition_key: &str,
        schema: &SchemaQuery,
        changes: &Value,
    ) -> Result<()> {
        self.updates.lock().unwrap().push(changes.clone());
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(anyhow::anyhow!("injected commit failure").into());
        }
        self.inner
            .update_partition(template, partition_key, schema, changes)
            .await
    }
}

pub struct Harness {
    pub manager: Arc<TableManager<TestEntity>>,
    pub repository: Arc<FlakyRepository>,
    pub cache: Arc<EphemeralResourceCache>,
    pub queue: Arc<InProcessQueue>,
}

impl Harness {
    pub async fn publish(&self, payload: Value) {
        self.publish_raw(Bytes::from(serde_json::to_vec(&payload).unwrap()))
            .await;
    }

    pub async fn publish_raw(&self, payload: Bytes) {
        self.queue.publish(QUEUE, payload).await.unwrap();
    }
}

pub async fn start_harness(chunk_size: usize, stale_after: Duration) -> Harness {
    let repository = Arc::new(FlakyRepository::new(rudimentary_schema()));
    let cache = Arc::new(EphemeralResourceCache::new());
    let queue = Arc::new(InProcessQueue::new());

    let config = EngineConfig {
        stale_after,
        cache_ttl: Duration::from_secs(3600),
    };
    let repository_dyn: Arc<dyn Repository> = repository.clone();
    let cache_dyn: Arc<dyn conflux_cache::ResourceCache> = cache.clone();
    let manager = Arc::new(
        TableManager::initialize(
            repository_dyn,
            cache_dyn,
            config,
            TableIdent::new("public", "RudimentaryEntity"),
            chunk_size,
        )
        .await
        .unwrap(),
    );
    let source: Arc<dyn MessageSource> = queue.clone();
    manager.start(source, QUEUE).await.unwrap();

    Harness {
        manager,
        repository,
        cache,
        queue,
    }
}

/// Poll until the condition holds, failing the test after two seconds.
pub async fn wait_for<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}
