use crate::config::ServerConfig;
use crate::rule_seed::{self, SeedSummary};
use deskmon_alert::MonitoringEngine;
use deskmon_notify::dispatcher::NotificationDispatcher;
use deskmon_notify::registry::ChannelRegistry;
use deskmon_storage::sqlite::SqliteStore;
use std::sync::Arc;

/// Opens the store, wires the notification channels and constructs the
/// engine. The engine is not started.
pub fn build_engine(config: &ServerConfig) -> anyhow::Result<MonitoringEngine> {
    std::fs::create_dir_all(&config.data_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create data dir '{}': {}", config.data_dir, e))?;
    let db_path = config.database_path();
    let store = Arc::new(SqliteStore::open(&db_path)?);

    let registry = ChannelRegistry::from_config(&config.notify)?;
    let dispatcher = Arc::new(NotificationDispatcher::new(registry));

    let engine = MonitoringEngine::new(config.monitoring.clone(), store.clone(), store, dispatcher)?;
    Ok(engine)
}

/// Loads the configured rule seed, if any, into the engine.
pub async fn seed_from_config(
    engine: &MonitoringEngine,
    config: &ServerConfig,
) -> anyhow::Result<Option<SeedSummary>> {
    let Some(path) = &config.rules_seed else {
        return Ok(None);
    };
    let seed = rule_seed::load_seed(path)?;
    Ok(Some(rule_seed::seed_rules(engine, seed).await))
}
