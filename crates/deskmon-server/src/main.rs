use anyhow::Result;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use deskmon_server::config::ServerConfig;
use deskmon_server::rule_seed;
use deskmon_server::runtime;

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  deskmon-server [config.toml]            Start the monitoring engine");
    eprintln!("  deskmon-server check-rules <seed.json>  Validate an alert rule seed file");
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)?,
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("check-rules") => {
            let seed_path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("check-rules requires <seed.json> argument")
            })?;
            run_check_rules(seed_path)
        }
        Some("--help" | "-h") => {
            print_usage();
            Ok(())
        }
        _ => {
            let config_path = args
                .get(1)
                .map(|s| s.as_str())
                .unwrap_or("config/server.toml");
            run_server(config_path).await
        }
    }
}

fn run_check_rules(seed_path: &str) -> Result<()> {
    init_tracing("deskmon=info")?;
    deskmon_common::id::init(1, 1);

    let seed = rule_seed::load_seed(seed_path)?;
    let rules = rule_seed::check_rules(&seed)?;
    tracing::info!(path = seed_path, rules = rules.len(), "Rule seed is valid");
    Ok(())
}

async fn run_server(config_path: &str) -> Result<()> {
    let config = ServerConfig::load(config_path)?;
    init_tracing(&config.log_filter)?;
    deskmon_common::id::init(config.machine_id, config.node_id);
    tracing::info!(config = config_path, "Starting deskmon server");

    let engine = runtime::build_engine(&config)?;
    runtime::seed_from_config(&engine, &config).await?;
    engine.init().await?;

    let cfg = engine.config();
    tracing::info!(
        interval_secs = cfg.interval_secs,
        max_buffer_size = cfg.max_buffer_size,
        enabled = cfg.enabled,
        "Monitoring engine running"
    );

    signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    engine.cleanup().await;
    let stats = engine.engine_stats().await;
    tracing::info!(
        recorded = stats.samples_recorded,
        flushed = stats.samples_flushed,
        dropped = stats.samples_dropped,
        alerts_triggered = stats.alerts_triggered,
        notifications_failed = stats.notifications_failed,
        "Server stopped"
    );
    Ok(())
}
