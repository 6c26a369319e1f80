use anyhow::{bail, Context, Result};
use conflux_store::postgres::PostgresConfig;
use conflux_store::TableIdent;
use serde::Deserialize;
use std::fs;

// Write-behind service configuration sourced from environment variables,
// with an optional YAML override file.
#[derive(Debug, Clone)]
pub struct WritebackConfig {
    pub backend: Backend,
    pub entity: Entity,
    pub queue: String,
    pub table: TableIdent,
    pub chunk_size: usize,
    pub stale_after_ms: u64,
    pub cache_ttl_seconds: u64,
    pub postgres: PostgresConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Postgres,
}

/// Which record type the manager is instantiated over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Rudimentary,
    Integers,
}

#[derive(Debug, Deserialize)]
struct WritebackConfigOverride {
    backend: Option<String>,
    entity: Option<String>,
    queue: Option<String>,
    database: Option<String>,
    schema: Option<String>,
    table: Option<String>,
    chunk_size: Option<usize>,
    stale_after_ms: Option<u64>,
    cache_ttl_seconds: Option<u64>,
    postgres_url: Option<String>,
    postgres_max_connections: Option<u32>,
}

fn parse_backend(value: &str) -> Result<Backend> {
    match value {
        "memory" => Ok(Backend::Memory),
        "postgres" => Ok(Backend::Postgres),
        other => bail!("unknown backend {other:?}; expected \"memory\" or \"postgres\""),
    }
}

fn parse_entity(value: &str) -> Result<Entity> {
    match value {
        "rudimentary" => Ok(Entity::Rudimentary),
        "integers" => Ok(Entity::Integers),
        other => bail!("unknown entity {other:?}; expected \"rudimentary\" or \"integers\""),
    }
}

impl WritebackConfig {
    pub fn from_env() -> Result<Self> {
        let backend = parse_backend(
            &std::env::var("CONFLUX_BACKEND").unwrap_or_else(|_| "memory".to_string()),
        )
        .with_context(|| "parse CONFLUX_BACKEND")?;
        let entity = parse_entity(
            &std::env::var("CONFLUX_ENTITY").unwrap_or_else(|_| "rudimentary".to_string()),
        )
        .with_context(|| "parse CONFLUX_ENTITY")?;
        let queue =
            std::env::var("CONFLUX_QUEUE").unwrap_or_else(|_| "change-requests".to_string());
        let table = TableIdent {
            database: std::env::var("CONFLUX_TABLE_DATABASE").ok(),
            schema: std::env::var("CONFLUX_TABLE_SCHEMA").unwrap_or_else(|_| "public".to_string()),
            table: std::env::var("CONFLUX_TABLE_NAME")
                .unwrap_or_else(|_| "RudimentaryEntity".to_string()),
        };
        let chunk_size = std::env::var("CONFLUX_CHUNK_SIZE")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .with_context(|| "parse CONFLUX_CHUNK_SIZE")?;
        let stale_after_ms = std::env::var("CONFLUX_STALE_AFTER_MS")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .with_context(|| "parse CONFLUX_STALE_AFTER_MS")?;
        let cache_ttl_seconds = std::env::var("CONFLUX_CACHE_TTL_SECONDS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()
            .with_context(|| "parse CONFLUX_CACHE_TTL_SECONDS")?;

        let mut postgres = PostgresConfig::default();
        if let Ok(url) = std::env::var("CONFLUX_POSTGRES_URL") {
            postgres.url = url;
        }
        if let Ok(value) = std::env::var("CONFLUX_POSTGRES_MAX_CONNECTIONS") {
            postgres.max_connections = value
                .parse()
                .with_context(|| "parse CONFLUX_POSTGRES_MAX_CONNECTIONS")?;
        }

        Ok(Self {
            backend,
            entity,
            queue,
            table,
            chunk_size,
            stale_after_ms,
            cache_ttl_seconds,
            postgres,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("CONFLUX_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read CONFLUX_CONFIG: {path}"))?;
            let override_cfg: WritebackConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse writeback config yaml")?;
            config.apply_override(override_cfg)?;
        }
        Ok(config)
    }

    fn apply_override(&mut self, override_cfg: WritebackConfigOverride) -> Result<()> {
        if let Some(value) = override_cfg.backend {
            self.backend = parse_backend(&value)?;
        }
        if let Some(value) = override_cfg.entity {
            self.entity = parse_entity(&value)?;
        }
        if let Some(value) = override_cfg.queue {
            self.queue = value;
        }
        if let Some(value) = override_cfg.database {
            self.table.database = Some(value);
        }
        if let Some(value) = override_cfg.schema {
            self.table.schema = value;
        }
        if let Some(value) = override_cfg.table {
            self.table.table = value;
        }
        if let Some(value) = override_cfg.chunk_size {
            self.chunk_size = value;
        }
        if let Some(value) = override_cfg.stale_after_ms {
            self.stale_after_ms = value;
        }
        if let Some(value) = override_cfg.cache_ttl_seconds {
            self.cache_ttl_seconds = value;
        }
        if let Some(value) = override_cfg.postgres_url {
            self.postgres.url = value;
        }
        if let Some(value) = override_cfg.postgres_max_connections {
            self.postgres.max_connections = value;
        }
        Ok(())
    }
}
