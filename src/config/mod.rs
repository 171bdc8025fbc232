// chrestore/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::utils::databases::DEFAULT_SKIP_TABLES;

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonClickHouseConfig {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: Option<u64>,
    pub restart_command: Option<String>,
    pub config_dir: Option<PathBuf>,
    pub embedded_backup_disk: Option<String>,
    pub use_embedded_backup_restore: Option<bool>,
    pub disk_mapping: Option<HashMap<String, PathBuf>>,
    pub skip_tables: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonGeneralConfig {
    pub restore_schema_on_cluster: Option<String>,
    pub restore_database_mapping: Option<serde_json::Value>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub clickhouse: Option<JsonClickHouseConfig>,
    pub general: Option<JsonGeneralConfig>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub timeout_secs: u64,
    pub restart_command: String,
    pub config_dir: PathBuf,
    pub embedded_backup_disk: String,
    pub use_embedded_backup_restore: bool,
    pub disk_mapping: HashMap<String, PathBuf>,
    pub skip_tables: Vec<String>,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            username: "default".to_string(),
            password: String::new(),
            timeout_secs: 300,
            restart_command: "systemctl restart clickhouse-server".to_string(),
            config_dir: PathBuf::from("/etc/clickhouse-server"),
            embedded_backup_disk: String::new(),
            use_embedded_backup_restore: false,
            disk_mapping: HashMap::new(),
            skip_tables: DEFAULT_SKIP_TABLES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneralConfig {
    pub restore_schema_on_cluster: String,
    pub restore_database_mapping: HashMap<String, String>,
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            restore_schema_on_cluster: String::new(),
            restore_database_mapping: HashMap::new(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub clickhouse: ClickHouseConfig,
    pub general: GeneralConfig,
}

impl AppConfig {
    /// Loads `config_path`, falling back to defaults when the file is absent.
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            warn!(
                "config file {} not found, using default configuration",
                config_path.display()
            );
            return Ok(AppConfig::default());
        }
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })?;
        AppConfig::from_raw(raw_json_config)
    }

    pub fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let defaults = ClickHouseConfig::default();
        let ch = raw.clickhouse.unwrap_or_default();
        let clickhouse = ClickHouseConfig {
            url: ch.url.filter(|s| !s.is_empty()).unwrap_or(defaults.url),
            username: ch.username.unwrap_or(defaults.username),
            password: ch.password.unwrap_or(defaults.password),
            timeout_secs: ch.timeout_secs.unwrap_or(defaults.timeout_secs),
            restart_command: ch
                .restart_command
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.restart_command),
            config_dir: ch.config_dir.unwrap_or(defaults.config_dir),
            embedded_backup_disk: ch.embedded_backup_disk.unwrap_or_default(),
            use_embedded_backup_restore: ch.use_embedded_backup_restore.unwrap_or(false),
            disk_mapping: ch.disk_mapping.unwrap_or_default(),
            skip_tables: ch.skip_tables.unwrap_or(defaults.skip_tables),
        };

        let general_raw = raw.general.unwrap_or_default();
        let general = GeneralConfig {
            restore_schema_on_cluster: general_raw.restore_schema_on_cluster.unwrap_or_default(),
            restore_database_mapping: parse_restore_database_mapping(&general_raw.restore_database_mapping)?,
            log_level: general_raw.log_level.unwrap_or_else(|| "info".to_string()),
        };

        Ok(AppConfig { clickhouse, general })
    }

    /// Applies `CLICKHOUSE_URL`, `CLICKHOUSE_USERNAME` and `CLICKHOUSE_PASSWORD`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("CLICKHOUSE_URL").filter(|s| !s.is_empty()) {
            self.clickhouse.url = url;
        }
        if let Some(username) = lookup("CLICKHOUSE_USERNAME") {
            self.clickhouse.username = username;
        }
        if let Some(password) = lookup("CLICKHOUSE_PASSWORD") {
            self.clickhouse.password = password;
        }
    }
}

/// Parses `general.restore_database_mapping`.
/// Accepts a mapping object `{"src": "dst"}` or an array of `"src:dst"` rules.
fn parse_restore_database_mapping(value: &Option<serde_json::Value>) -> Result<HashMap<String, String>> {
    match value {
        Some(value) if value.is_object() => serde_json::from_value(value.clone())
            .context("Failed to parse restore_database_mapping as mapping object"),
        Some(value) if value.is_array() => {
            let rules: Vec<String> = serde_json::from_value(value.clone())
                .context("Failed to parse restore_database_mapping as array")?;
            let mut mapping = HashMap::new();
            for rule in rules {
                let (src, dst) = rule
                    .split_once(':')
                    .filter(|(src, dst)| !src.is_empty() && !dst.is_empty() && !dst.contains(':'))
                    .with_context(|| format!("restore_database_mapping rule '{}' must be src:dst", rule))?;
                mapping.insert(src.to_string(), dst.to_string());
            }
            Ok(mapping)
        }
        Some(serde_json::Value::Null) | None => Ok(HashMap::new()),
        Some(_) => Err(anyhow::anyhow!(
            "restore_database_mapping must be either a mapping object or an array of src:dst rules"
        )),
    }
}
