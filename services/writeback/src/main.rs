//! Write-behind service entry point.
//!
//! Wires configuration, the repository backend, the ephemeral cache, and an
//! in-process queue into a table manager, then feeds the queue from stdin:
//! each line is one JSON change-request payload. An external broker would
//! replace the stdin feed by implementing `MessageSource`.
mod config;
mod entities;
mod observability;

use bytes::Bytes;
use conflux_cache::{EphemeralResourceCache, ResourceCache};
use conflux_engine::{EngineConfig, Resource, TableManager};
use conflux_store::memory::InMemoryRepository;
use conflux_store::postgres::PostgresRepository;
use conflux_store::Repository;
use conflux_transport::{InProcessQueue, MessageSource};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::WritebackConfig::from_env_or_yaml()?;
    run_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(config: config::WritebackConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    observability::init_tracing();

    // The manager is generic over the record type; pick it here, once.
    match config.entity {
        config::Entity::Rudimentary => {
            run_manager::<entities::RudimentaryEntity, F>(config, shutdown).await
        }
        config::Entity::Integers => {
            run_manager::<entities::IntegersEntity, F>(config, shutdown).await
        }
    }
}

async fn run_manager<R, F>(config: config::WritebackConfig, shutdown: F) -> anyhow::Result<()>
where
    R: Resource,
    F: Future<Output = ()> + Send + 'static,
{
    let repository = build_repository(&config).await?;
    let cache: Arc<dyn ResourceCache> = Arc::new(EphemeralResourceCache::new());
    let queue = Arc::new(InProcessQueue::new());

    let engine_config = EngineConfig {
        stale_after: Duration::from_millis(config.stale_after_ms),
        cache_ttl: Duration::from_secs(config.cache_ttl_seconds),
    };
    let manager = Arc::new(
        TableManager::<R>::initialize(
            repository,
            cache,
            engine_config,
            config.table.clone(),
            config.chunk_size,
        )
        .await?,
    );
    let source: Arc<dyn MessageSource> = queue.clone();
    manager.start(source, &config.queue).await?;
    tracing::info!(
        queue = %config.queue,
        resource = %manager.resource_key(),
        "write-behind service started"
    );

    let intake = tokio::spawn(feed_from_stdin(queue, config.queue.clone()));

    tokio::pin!(shutdown);
    (&mut shutdown).await;
    tracing::info!("shutting down");
    intake.abort();
    let _ = intake.await;
    Ok(())
}

async fn build_repository(config: &config::WritebackConfig) -> anyhow::Result<Arc<dyn Repository>> {
    match config.backend {
        config::Backend::Postgres => {
            let repository = PostgresRepository::connect(&config.postgres).await?;
            tracing::info!(table = %config.table, "postgres repository connected");
            Ok(Arc::new(repository))
        }
        config::Backend::Memory => {
            let (schema, key, row) = entities::memory_fixture(config.entity);
            let repository = InMemoryRepository::new(schema);
            repository.insert_row(key, row).await;
            tracing::info!("in-memory repository seeded with one sample row");
            Ok(Arc::new(repository))
        }
    }
}

/// Publish each non-empty stdin line as one change-request payload. The
/// engine validates and drops malformed lines on its side.
async fn feed_from_stdin(queue: Arc<InProcessQueue>, queue_name: String) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Err(err) = queue.publish(&queue_name, Bytes::from(line.to_string())).await {
                    tracing::warn!(error = %err, "failed to publish change request");
                    return;
                }
            }
            Ok(None) => {
                tracing::info!("stdin closed; no further change requests");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "stdin read failed");
                return;
            }
        }
    }
}
