// chrestore/src/restore/selector.rs
use regex::Regex;
use std::cmp::Reverse;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::errors::{RestoreError, Result};
use crate::metadata::{Part, TableMetadata};
use crate::restore::mapping::DatabaseMapping;
use crate::restore::partitions::PartitionFilter;
use crate::utils::databases::{is_information_schema, is_system_database};
use crate::utils::pattern::TablePattern;
use crate::utils::table_path_decode;

static OBJECT_KIND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*(?:CREATE|ATTACH)\s+(MATERIALIZED\s+VIEW|LIVE\s+VIEW|WINDOW\s+VIEW|VIEW|DICTIONARY|TABLE)\b")
        .expect("static regex")
});

static STREAMING_ENGINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)ENGINE\s*=\s*(Distributed|Kafka|RabbitMQ)\b").expect("static regex"));

/// Rank used to order object creation: storage tables first, then the
/// objects reading from them.
fn creation_rank(query: &str) -> u8 {
    let kind = OBJECT_KIND_RE
        .captures(query)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_ascii_uppercase())
        .unwrap_or_default();
    if kind.starts_with("MATERIALIZED") {
        1
    } else if kind.ends_with("VIEW") {
        2
    } else if kind == "DICTIONARY" {
        3
    } else if STREAMING_ENGINE_RE.is_match(query) {
        4
    } else {
        0
    }
}

/// Selection rules applied to the tables captured in a backup.
pub struct TableSelector<'a> {
    pub pattern: &'a TablePattern,
    pub skip_tables: &'a [String],
    pub partitions: &'a PartitionFilter,
    pub mapping: &'a DatabaseMapping,
    /// Leave out `system` and information-schema databases.
    pub skip_system: bool,
    /// Order for dropping: dependents before the tables they read from.
    pub drop_order: bool,
}

impl TableSelector<'_> {
    /// Reads `<metadata_path>/<db>/<table>.json` (or legacy `.sql`) files and
    /// returns the ones matching the selection, ordered for creation or drop.
    pub fn select_local(&self, metadata_path: &Path, backup_name: &str) -> Result<Vec<TableMetadata>> {
        let meta = match fs::metadata(metadata_path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RestoreError::MetadataNotFound(metadata_path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        if !meta.is_dir() {
            return Err(RestoreError::NotADirectory(metadata_path.to_path_buf()));
        }
        let skip = if self.skip_tables.is_empty() {
            None
        } else {
            Some(TablePattern::new(&self.skip_tables.join(","))?)
        };

        let mut result = Vec::new();
        let walker = WalkDir::new(metadata_path)
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name();
        for entry in walker {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(db_dir) = path.parent().and_then(Path::file_name).and_then(|s| s.to_str()) else {
                continue;
            };
            let database = table_path_decode(db_dir);
            let table_name = table_path_decode(stem);

            if !self.pattern.matches_table(&database, &table_name) {
                continue;
            }
            if skip.as_ref().is_some_and(|s| s.matches_table(&database, &table_name)) {
                debug!(table = %format!("{}.{}", database, table_name), "skipped by skip_tables");
                continue;
            }
            if self.skip_system && (is_system_database(&database) || is_information_schema(&database)) {
                continue;
            }

            let mut table = match ext {
                "json" => {
                    let mut table = TableMetadata::load(path)?;
                    if table.database.is_empty() {
                        table.database = database;
                    }
                    if table.table.is_empty() {
                        table.table = table_name;
                    }
                    table
                }
                "sql" => legacy_table(metadata_path, path, database, table_name)?,
                _ => continue,
            };
            self.partitions.retain_parts(&mut table);
            if !self.mapping.is_empty() {
                table.query = self.mapping.rewrite_query(&table.query);
            }
            result.push(table);
        }

        if result.is_empty() {
            return Err(RestoreError::NoMatchingTables {
                pattern: self.pattern.as_str().to_string(),
                backup: backup_name.to_string(),
            });
        }
        if self.drop_order {
            result.sort_by_key(|t| Reverse(creation_rank(&t.query)));
        } else {
            result.sort_by_key(|t| creation_rank(&t.query));
        }
        Ok(result)
    }
}

/// Table captured by a backup without per-table JSON: the schema comes from
/// the `.sql` file and parts from `shadow/<db>/<table>/`, all on `default`.
fn legacy_table(metadata_path: &Path, sql_path: &Path, database: String, table: String) -> Result<TableMetadata> {
    let query = fs::read_to_string(sql_path)?;
    let mut parts = Vec::new();
    let db_dir = sql_path.parent().and_then(Path::file_name);
    let table_dir = sql_path.file_stem();
    if let (Some(backup_root), Some(db_dir), Some(table_dir)) = (metadata_path.parent(), db_dir, table_dir) {
        let shadow = backup_root.join("shadow").join(db_dir).join(table_dir);
        if let Ok(entries) = fs::read_dir(&shadow) {
            for entry in entries.flatten() {
                if entry.file_type().is_ok_and(|t| t.is_dir()) {
                    if let Some(name) = entry.file_name().to_str() {
                        parts.push(Part::new(name));
                    }
                }
            }
        } else {
            warn!("legacy table {}.{} has no shadow directory", database, table);
        }
    }
    parts.sort_by(|a, b| a.name.cmp(&b.name));
    let mut meta = TableMetadata {
        database,
        table,
        query,
        ..Default::default()
    };
    if !parts.is_empty() {
        meta.parts.insert("default".to_string(), parts);
    }
    Ok(meta)
}
