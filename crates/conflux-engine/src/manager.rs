//! The table manager: one instance per resource.
//!
//! Receives inbound patch payloads, routes them into per-partition watchers,
//! and runs the drain pipeline: squash the batch, resolve the full row
//! through the cache, diff, compile a partial UPDATE, commit, and write the
//! new full row back through the cache.
use crate::merge::{merge, synchronize};
use crate::watcher::PartitionWatcher;
use crate::{ChangeRequest, EngineError, Resource, Result};
use conflux_cache::ResourceCache;
use conflux_store::{statement, Repository, SchemaColumn, SchemaQuery, TableIdent};
use conflux_transport::MessageSource;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Pending stale signals across all partitions of one resource.
const STALE_CHANNEL_BOUND: usize = 1024;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a partition's queue may sit below the chunk threshold
    /// before it is drained anyway.
    pub stale_after: Duration,
    /// Cache entry lifetime; refreshed on every successful commit.
    pub cache_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_millis(500),
            cache_ttl: Duration::from_secs(3600),
        }
    }
}

/// Write-coalescing manager for one table.
///
/// Partition watchers are created lazily on the first patch for a key and
/// never evicted; registry growth is bounded by the table's partition-key
/// cardinality. Failures inside one partition's drain never affect other
/// partitions or message intake.
pub struct TableManager<R: Resource> {
    repository: Arc<dyn Repository>,
    cache: Arc<dyn ResourceCache>,
    config: EngineConfig,
    chunk_size: usize,
    resource_key: String,
    schema: SchemaQuery,
    primary_key: SchemaColumn,
    select_by_partition_key: String,
    update_template: String,
    watchers: Mutex<HashMap<String, Arc<PartitionWatcher<R>>>>,
    stale_tx: mpsc::Sender<String>,
    // Taken by `start`; present means the manager has not started yet.
    stale_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

impl<R: Resource> TableManager<R> {
    /// Discover the target table's schema and prebuild the statement
    /// templates. Fails fatally when the table has no primary key: without
    /// one there is no partition identity.
    pub async fn initialize(
        repository: Arc<dyn Repository>,
        cache: Arc<dyn ResourceCache>,
        config: EngineConfig,
        table: TableIdent,
        chunk_size: usize,
    ) -> Result<Self> {
        if chunk_size < 1 {
            return Err(EngineError::InvalidChunkSize);
        }

        let resource_key = table.resource_key();
        let introspection = statement::introspection_query(&table);
        let schema = repository.get_schema(&table, &introspection).await?;
        if !schema.has_primary_key() {
            return Err(EngineError::SchemaMapping(table.to_string()));
        }
        let primary_key = schema.primary_key()?.clone();
        let select_by_partition_key = statement::select_row_json(&schema)?;
        let update_template = statement::update_template(&schema)?;
        let (stale_tx, stale_rx) = mpsc::channel(STALE_CHANNEL_BOUND);

        tracing::info!(
            resource = %resource_key,
            columns = schema.columns_all.len(),
            chunk_size,
            "table manager initialized"
        );

        Ok(Self {
            repository,
            cache,
            config,
            chunk_size,
            resource_key,
            schema,
            primary_key,
            select_by_partition_key,
            update_template,
            watchers: Mutex::new(HashMap::new()),
            stale_tx,
            stale_rx: Mutex::new(Some(stale_rx)),
        })
    }

    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    pub fn schema(&self) -> &SchemaQuery {
        &self.schema
    }

    /// Number of partitions seen so far.
    pub fn partition_count(&self) -> usize {
        self.watchers.lock().len()
    }

    /// Attach to the message source and start consuming. Spawns the stale
    /// listener and the consume loop; returns once both are running.
    pub async fn start(self: &Arc<Self>, source: Arc<dyn MessageSource>, queue: &str) -> Result<()> {
        let mut stale_rx = self
            .stale_rx
            .lock()
            .take()
            .ok_or(EngineError::AlreadyStarted)?;
        let mut stream = source.subscribe(queue).await?;

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(partition_key) = stale_rx.recv().await {
                manager.on_stale(&partition_key).await;
            }
        });

        let manager = Arc::clone(self);
        let queue_name = queue.to_string();
        tokio::spawn(async move {
            tracing::info!(queue = %queue_name, resource = %manager.resource_key, "consuming change requests");
            while let Some(payload) = stream.recv().await {
                manager.process_change_request(&payload).await;
            }
            tracing::info!(queue = %queue_name, "message stream closed");
        });

        Ok(())
    }

    /// Decode one inbound payload, route it to its partition, and drain
    /// immediately when the chunk threshold is reached. Decode failures drop
    /// the message; they must never take down the consume loop.
    async fn process_change_request(&self, payload: &[u8]) {
        let resource: R = match serde_json::from_slice(payload) {
            Ok(resource) => resource,
            Err(err) => {
                tracing::warn!(error = %err, "dropping change request that does not decode");
                return;
            }
        };
        let patch_json: Value = match serde_json::from_slice(payload) {
            Ok(patch @ Value::Object(_)) => patch,
            Ok(_) => {
                tracing::warn!("dropping non-object change request payload");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "dropping change request that is not JSON");
                return;
            }
        };
        // The partition key always comes from the decoded payload, never
        // from the transport.
        let partition_key = resource.partition_key();

        let watcher = {
            let mut watchers = self.watchers.lock();
            Arc::clone(watchers.entry(partition_key.clone()).or_insert_with(|| {
                Arc::new(PartitionWatcher::new(
                    partition_key.clone(),
                    self.config.stale_after,
                    self.stale_tx.clone(),
                ))
            }))
        };

        watcher.enqueue(ChangeRequest {
            request_token: Uuid::new_v4(),
            modified_resource: resource,
            patch_json,
            partition_key,
        });
        watcher.start_timer();
        tracing::debug!(
            partition = watcher.partition_key(),
            queued = watcher.len(),
            "change request queued"
        );

        // Below the threshold, wait for more items; the staleness timer
        // bounds how long they can sit. A busy partition defers to the
        // re-check at the end of the running drain.
        if watcher.len() >= self.chunk_size && watcher.try_begin_drain() {
            self.process_partition(&watcher).await;
        }
    }

    async fn on_stale(&self, partition_key: &str) {
        let watcher = self.watchers.lock().get(partition_key).cloned();
        let Some(watcher) = watcher else {
            return;
        };
        if watcher.try_begin_drain() {
            self.process_partition(&watcher).await;
        }
    }

    /// Run drains for a partition whose busy flag the caller has acquired.
    /// Releases the flag before returning.
    async fn process_partition(&self, watcher: &Arc<PartitionWatcher<R>>) {
        loop {
            watcher.stop_timer();
            if let Err(err) = self.drain(watcher).await {
                tracing::error!(
                    partition = watcher.partition_key(),
                    error = %err,
                    "drain failed"
                );
            }
            watcher.finish_drain();

            // Items that arrived during the drain trigger the next cycle.
            if watcher.len() >= self.chunk_size {
                if watcher.try_begin_drain() {
                    continue;
                }
            } else if !watcher.is_empty() {
                watcher.start_timer();
            }
            return;
        }
    }

    async fn drain(&self, watcher: &PartitionWatcher<R>) -> Result<()> {
        let length = watcher.len().min(self.chunk_size);
        if length == 0 {
            return Ok(());
        }

        // Reverse dequeue order: index 0 holds the most recent arrival of
        // the batch, the representative with final say in the squash.
        let mut batch = Vec::with_capacity(length);
        for _ in 0..length {
            batch.push(
                watcher
                    .dequeue()
                    .expect("partition queue shrank during an exclusive drain"),
            );
        }
        batch.reverse();

        let partition_key = watcher.partition_key();
        let mut representative = batch[0].patch_json.clone();

        let cached = match self.resolve_partition(partition_key).await {
            Ok(cached) => cached,
            Err(err) => {
                // The batch must survive a transient read outage: squash it
                // and retain it like a failed commit.
                for request in batch.iter().skip(1) {
                    representative = merge(&representative, &request.patch_json);
                }
                if let Some(failed) = watcher.failed_commit() {
                    representative = merge(&representative, &failed);
                }
                watcher.set_failed_commit(representative);
                self.cache.delete(&self.resource_key, partition_key).await;
                return Err(err);
            }
        };
        let Some(cached_copy) = cached else {
            tracing::warn!(
                partition = partition_key,
                resource = %self.resource_key,
                dropped = length,
                "row not found in cache or store; dropping batch"
            );
            return Ok(());
        };

        // Earlier patches only contribute fields the representative and
        // later patches left untouched.
        for request in batch.iter().skip(1) {
            representative = merge(&representative, &request.patch_json);
        }
        // Changed fields from a previously failed commit are folded back in
        // so they are never silently dropped.
        if let Some(failed) = watcher.failed_commit() {
            representative = merge(&representative, &failed);
        }

        // The cached row always carries every field, the representative
        // does not; restrict before comparing.
        let partial = synchronize(&representative, &cached_copy);
        if representative == partial {
            tracing::debug!(
                partition = partition_key,
                "merged batch introduces no change; nothing to commit"
            );
            return Ok(());
        }

        // Pre-merge clone bound to the UPDATE statement.
        let sql_copy = representative.clone();
        // New full row for the cache; update payload restricted to the
        // fields the cache also carries.
        let full_row = merge(&representative, &cached_copy);
        let sql_changes = merge(&sql_copy, &partial);

        let final_json = serde_json::to_string(&full_row)?;

        match self
            .repository
            .update_partition(&self.update_template, partition_key, &self.schema, &sql_changes)
            .await
        {
            Ok(()) => {
                self.cache
                    .set(
                        &self.resource_key,
                        partition_key,
                        final_json,
                        self.config.cache_ttl,
                    )
                    .await;
                watcher.clear_failed_commit();
                tracing::debug!(
                    partition = partition_key,
                    coalesced = length,
                    "partition committed"
                );
            }
            Err(err) => {
                // Commit failures are usually write conflicts at the store;
                // the cached row can no longer be trusted.
                tracing::error!(
                    partition = partition_key,
                    error = %err,
                    "transaction failed to commit; retaining changed fields for the next drain"
                );
                watcher.set_failed_commit(sql_changes);
                self.cache.delete(&self.resource_key, partition_key).await;
            }
        }

        Ok(())
    }

    /// Resolve the partition's full current row: cache first, then the
    /// store with write-through so the next drain starts from cache.
    async fn resolve_partition(&self, partition_key: &str) -> Result<Option<Value>> {
        if let Some(cached) = self.cache.get(&self.resource_key, partition_key).await {
            return Ok(Some(serde_json::from_str(&cached)?));
        }
        let Some(row_json) = self
            .repository
            .get_json(&self.select_by_partition_key, &self.primary_key, partition_key)
            .await?
        else {
            return Ok(None);
        };
        self.cache
            .set(
                &self.resource_key,
                partition_key,
                row_json.clone(),
                self.config.cache_ttl,
            )
            .await;
        Ok(Some(serde_json::from_str(&row_json)?))
    }
}
