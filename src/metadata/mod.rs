//! Captured backup metadata: the `metadata.json` manifest and the per-table
//! schema files stored under `<backup>/metadata/<db>/<table>.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::errors::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableTitle {
    pub database: String,
    pub table: String,
}

impl TableTitle {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }
}

impl std::fmt::Display for TableTitle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabasesMeta {
    pub name: String,
    #[serde(default)]
    pub engine: String,
    #[serde(default)]
    pub query: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionsMeta {
    pub name: String,
    pub create_query: String,
}

/// The backup manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupMetadata {
    #[serde(default)]
    pub backup_name: String,
    #[serde(default)]
    pub disks: BTreeMap<String, String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub creation_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: String,
    #[serde(default)]
    pub clickhouse_version: String,
    #[serde(default)]
    pub data_size: u64,
    #[serde(default)]
    pub metadata_size: u64,
    #[serde(default)]
    pub compressed_size: u64,
    #[serde(default)]
    pub databases: Vec<DatabasesMeta>,
    #[serde(default)]
    pub tables: Vec<TableTitle>,
    #[serde(default)]
    pub functions: Vec<FunctionsMeta>,
    #[serde(default)]
    pub data_format: String,
    #[serde(default)]
    pub required_backup: String,
}

impl BackupMetadata {
    pub fn load(path: &Path) -> Result<Self> {
        let body = fs::read(path)?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub name: String,
}

impl Part {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Partition id encoded in the part name, e.g. `202301` for `202301_1_5_2`.
    pub fn partition_id(&self) -> &str {
        self.name.split('_').next().unwrap_or_default()
    }
}

/// Schema and part list of one captured table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableMetadata {
    pub database: String,
    pub table: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub parts: BTreeMap<String, Vec<Part>>,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub metadata_only: bool,
}

impl TableMetadata {
    pub fn load(path: &Path) -> Result<Self> {
        let body = fs::read(path)?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub fn title(&self) -> TableTitle {
        TableTitle::new(&self.database, &self.table)
    }

    pub fn has_parts(&self) -> bool {
        self.parts.values().any(|parts| !parts.is_empty())
    }
}
