use deskmon_alert::MonitoringConfig;
use deskmon_notify::config::NotifyConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_database_file")]
    pub database_file: String,
    /// `EnvFilter` directives, used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Snowflake machine/node pair, each in `0..32`.
    #[serde(default = "default_id_part")]
    pub machine_id: i32,
    #[serde(default = "default_id_part")]
    pub node_id: i32,
    /// JSON rule seed loaded into the engine at startup.
    #[serde(default)]
    pub rules_seed: Option<String>,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_database_file() -> String {
    "deskmon.db".to_string()
}

fn default_log_filter() -> String {
    "deskmon=info".to_string()
}

fn default_id_part() -> i32 {
    1
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_file: default_database_file(),
            log_filter: default_log_filter(),
            machine_id: default_id_part(),
            node_id: default_id_part(),
            rules_seed: None,
            monitoring: MonitoringConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path, e))?;
        let config = Self::parse(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config file '{}': {}", path, e))?;
        Ok(config)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0..32).contains(&self.machine_id) || !(0..32).contains(&self.node_id) {
            anyhow::bail!("machine_id and node_id must be in 0..32");
        }
        if self.database_file.trim().is_empty() {
            anyhow::bail!("database_file must not be empty");
        }
        self.monitoring.validate()?;
        self.notify.validate()?;
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.database_file)
    }
}
