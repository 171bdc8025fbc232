//! Driver seam between the restore engine and a live ClickHouse server.
//!
//! [`ClickHouseClient`] only requires the transport primitives (`connect`,
//! `execute`, `select`); every metadata query and DDL statement the restore
//! engine needs is a provided method built on top of them, so alternative
//! transports override as little as they want.

pub mod http;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::errors::{RestoreError, Result};
use crate::metadata::{TableMetadata, TableTitle};
use crate::utils::pattern::TablePattern;

pub type Row = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disk {
    pub name: String,
    pub path: PathBuf,
    pub disk_type: String,
}

impl Disk {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, disk_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            disk_type: disk_type.into(),
        }
    }
}

/// A table as reported by `system.tables` on the live server.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub database: String,
    pub name: String,
    pub engine: String,
    pub data_paths: Vec<PathBuf>,
    pub create_table_query: String,
}

impl Table {
    pub fn title(&self) -> TableTitle {
        TableTitle::new(&self.database, &self.name)
    }
}

#[async_trait]
pub trait ClickHouseClient: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn close(&self) {}

    /// Runs a statement that returns no rows.
    async fn execute(&self, sql: &str) -> Result<()>;

    /// Runs a query and returns its rows as JSON objects.
    async fn select(&self, sql: &str) -> Result<Vec<Row>>;

    async fn get_disks(&self) -> Result<Vec<Disk>> {
        let rows = self.select("SELECT name, path, type FROM system.disks").await?;
        Ok(rows
            .iter()
            .map(|row| {
                Disk::new(
                    row_str(row, "name"),
                    row_str(row, "path").trim_end_matches('/'),
                    row_str(row, "type"),
                )
            })
            .collect())
    }

    /// Server version as `VERSION_INTEGER`, e.g. `23003001` for 23.3.1.
    async fn get_version(&self) -> Result<i64> {
        let rows = self
            .select("SELECT value FROM system.build_options WHERE name = 'VERSION_INTEGER'")
            .await?;
        let raw = rows.first().map(|row| row_str(row, "value")).unwrap_or_default();
        raw.trim()
            .parse()
            .map_err(|_| RestoreError::query(format!("can't parse clickhouse version '{}'", raw)))
    }

    async fn get_tables(&self, pattern: &TablePattern) -> Result<Vec<Table>> {
        let rows = self
            .select(
                "SELECT database, name, engine, data_paths, create_table_query \
                 FROM system.tables WHERE is_temporary = 0",
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| Table {
                database: row_str(row, "database"),
                name: row_str(row, "name"),
                engine: row_str(row, "engine"),
                data_paths: row
                    .get("data_paths")
                    .and_then(Value::as_array)
                    .map(|paths| paths.iter().filter_map(Value::as_str).map(PathBuf::from).collect())
                    .unwrap_or_default(),
                create_table_query: row_str(row, "create_table_query"),
            })
            .filter(|t| pattern.matches_table(&t.database, &t.name))
            .collect())
    }

    async fn create_database(&self, database: &str, on_cluster: &str) -> Result<()> {
        self.execute(&format!(
            "CREATE DATABASE IF NOT EXISTS {}{}",
            quote_ident(database),
            on_cluster_clause(on_cluster)
        ))
        .await
    }

    async fn create_database_from_query(&self, query: &str, on_cluster: &str) -> Result<()> {
        self.execute(&with_on_cluster_after_database(query, on_cluster)).await
    }

    async fn create_table(&self, table: &TableTitle, query: &str, on_cluster: &str, _version: i64) -> Result<()> {
        debug!(table = %table, "create table");
        self.execute(&create_table_sql(query, on_cluster)).await
    }

    async fn drop_table(
        &self,
        table: &TableTitle,
        query: &str,
        on_cluster: &str,
        ignore_dependencies: bool,
        version: i64,
    ) -> Result<()> {
        self.execute(&drop_table_sql(table, query, on_cluster, ignore_dependencies, version))
            .await
    }

    /// Attaches every part listed in `table` from the table's `detached`
    /// directories. `database` is the destination database.
    async fn attach_partitions(&self, database: &str, table: &TableMetadata) -> Result<()> {
        for part in table.parts.values().flatten() {
            self.execute(&format!(
                "ALTER TABLE {}.{} ATTACH PART {}",
                quote_ident(database),
                quote_ident(&table.table),
                quote_string(&part.name)
            ))
            .await?;
        }
        Ok(())
    }

    async fn create_user_defined_function(&self, name: &str, query: &str, on_cluster: &str) -> Result<()> {
        debug!(function = name, "create function");
        self.execute(&create_function_sql(query, on_cluster)).await
    }

    /// Directory where the server keeps its access entities.
    async fn get_access_management_path(&self, default_data_path: &Path) -> Result<PathBuf> {
        let fallback = default_data_path.join("access");
        match self
            .select("SELECT value FROM system.server_settings WHERE name = 'access_control_path'")
            .await
        {
            Ok(rows) => Ok(rows
                .first()
                .map(|row| row_str(row, "value"))
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(fallback)),
            Err(e) => {
                warn!("can't read access_control_path, using {}: {}", fallback.display(), e);
                Ok(fallback)
            }
        }
    }

    /// Replaces `{macro}` placeholders with the server's `system.macros` values.
    async fn apply_macros(&self, value: &str) -> Result<String> {
        if !value.contains('{') {
            return Ok(value.to_string());
        }
        let rows = self.select("SELECT macro, substitution FROM system.macros").await?;
        let mut out = value.to_string();
        for row in &rows {
            out = out.replace(&format!("{{{}}}", row_str(row, "macro")), &row_str(row, "substitution"));
        }
        Ok(out)
    }

    /// Computes the partition id the server assigns to `partition_tuple`
    /// (the comma-separated values of the partition key) for a table defined
    /// by `create_query`. Non-MergeTree tables and tables without
    /// `PARTITION BY` have no partition id.
    async fn get_partition_id(
        &self,
        database: &str,
        table: &str,
        create_query: &str,
        partition_tuple: &str,
    ) -> Result<Option<String>> {
        if !create_query.contains("MergeTree") || !PARTITION_BY_RE.is_match(create_query) {
            return Ok(None);
        }
        let id_table = format!("__partition_id_{}_{}", database, table);
        let id_title = format!("{}.{}", quote_ident("default"), quote_ident(&id_table));
        let create_sql = partition_id_table_sql(create_query, &id_title);
        self.execute(&format!("DROP TABLE IF EXISTS {} SYNC", id_title)).await?;
        self.execute(&create_sql).await?;
        let result = compute_partition_id(self, &id_table, &id_title, partition_tuple).await;
        self.execute(&format!("DROP TABLE IF EXISTS {} SYNC", id_title)).await?;
        result
    }
}

async fn compute_partition_id<C: ClickHouseClient + ?Sized>(
    client: &C,
    id_table: &str,
    id_title: &str,
    partition_tuple: &str,
) -> Result<Option<String>> {
    let columns = client
        .select(&format!(
            "SELECT name FROM system.columns WHERE database = 'default' AND table = {} AND is_in_partition_key",
            quote_string(id_table)
        ))
        .await?;
    let columns: Vec<String> = columns.iter().map(|row| quote_ident(&row_str(row, "name"))).collect();
    if columns.is_empty() {
        return Ok(None);
    }
    client
        .execute(&format!(
            "INSERT INTO {} ({}) VALUES ({})",
            id_title,
            columns.join(", "),
            partition_tuple
        ))
        .await?;
    let rows = client
        .select(&format!(
            "SELECT partition_id FROM system.parts WHERE active AND database = 'default' AND table = {}",
            quote_string(id_table)
        ))
        .await?;
    Ok(rows.first().map(|row| row_str(row, "partition_id")))
}

static PARTITION_BY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)\bPARTITION\s+BY\b").expect("static regex"));

static OBJECT_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)^\s*(CREATE|ATTACH)\s+(TABLE|DICTIONARY|MATERIALIZED\s+VIEW|LIVE\s+VIEW|WINDOW\s+VIEW|VIEW)\s+(?:IF\s+NOT\s+EXISTS\s+)?((?:`[^`]+`|\w+)(?:\.(?:`[^`]+`|\w+))?)(\s+UUID\s+'[^']+')?",
    )
    .expect("static regex")
});

static CREATE_DATABASE_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*(CREATE\s+DATABASE\s+(?:IF\s+NOT\s+EXISTS\s+)?(?:`[^`]+`|\w+))").expect("static regex")
});

static CREATE_FUNCTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*CREATE\s+(?:OR\s+REPLACE\s+)?FUNCTION\s+(`[^`]+`|\w+)").expect("static regex")
});

static ENGINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)ENGINE\s*=\s*\w*MergeTree(\([^)]*\))?").expect("static regex"));

pub fn row_str(row: &Row, key: &str) -> String {
    match row.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
}

pub fn quote_string(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

pub fn on_cluster_clause(cluster: &str) -> String {
    if cluster.is_empty() {
        String::new()
    } else {
        format!(" ON CLUSTER {}", quote_string(cluster))
    }
}

fn with_on_cluster_after_database(query: &str, on_cluster: &str) -> String {
    if on_cluster.is_empty() {
        return query.to_string();
    }
    CREATE_DATABASE_HEADER_RE
        .replacen(query, 1, |caps: &Captures| format!("{}{}", &caps[1], on_cluster_clause(on_cluster)))
        .into_owned()
}

/// Normalises a captured CREATE/ATTACH statement so it is idempotent
/// (`IF NOT EXISTS`) and, when requested, distributed `ON CLUSTER`.
pub fn create_table_sql(query: &str, on_cluster: &str) -> String {
    OBJECT_HEADER_RE
        .replacen(query, 1, |caps: &Captures| {
            format!(
                "{} {} IF NOT EXISTS {}{}{}",
                &caps[1],
                &caps[2],
                &caps[3],
                caps.get(4).map_or("", |m| m.as_str()),
                on_cluster_clause(on_cluster)
            )
        })
        .into_owned()
}

pub fn drop_table_sql(
    table: &TableTitle,
    query: &str,
    on_cluster: &str,
    ignore_dependencies: bool,
    version: i64,
) -> String {
    let kind = if query.contains("CREATE DICTIONARY") || query.contains("ATTACH DICTIONARY") {
        "DICTIONARY"
    } else {
        "TABLE"
    };
    let mut sql = format!(
        "DROP {} IF EXISTS {}.{}{}",
        kind,
        quote_ident(&table.database),
        quote_ident(&table.table),
        on_cluster_clause(on_cluster)
    );
    if version >= 21_008_000 {
        sql.push_str(" SYNC");
    } else if version > 19_017_000 {
        sql.push_str(" NO DELAY");
    }
    if ignore_dependencies && version >= 21_012_000 {
        sql.push_str(" SETTINGS check_table_dependencies=0");
    }
    sql
}

pub fn create_function_sql(query: &str, on_cluster: &str) -> String {
    CREATE_FUNCTION_RE
        .replacen(query, 1, |caps: &Captures| {
            format!("CREATE OR REPLACE FUNCTION {}{}", &caps[1], on_cluster_clause(on_cluster))
        })
        .into_owned()
}

/// Clone of `create_query` as a plain local MergeTree named `id_title`, used to
/// let the server compute a partition id.
fn partition_id_table_sql(create_query: &str, id_title: &str) -> String {
    let renamed = OBJECT_HEADER_RE
        .replacen(create_query, 1, |_: &Captures| format!("CREATE TABLE {}", id_title))
        .into_owned();
    ENGINE_RE.replacen(&renamed, 1, "ENGINE = MergeTree").into_owned()
}

/// Path of the disk named `default`, or of the first disk when none is.
pub fn get_default_path(disks: &[Disk]) -> Result<PathBuf> {
    disks
        .iter()
        .find(|d| d.name == "default")
        .or_else(|| disks.first())
        .map(|d| d.path.clone())
        .ok_or_else(|| RestoreError::UnknownDataPath("system.disks is empty".to_string()))
}

pub fn get_embedded_backup_path(disks: &[Disk], embedded_backup_disk: &str) -> Result<PathBuf> {
    if embedded_backup_disk.is_empty() {
        return Err(RestoreError::configuration("clickhouse.embedded_backup_disk is not defined"));
    }
    disks
        .iter()
        .find(|d| d.name == embedded_backup_disk)
        .map(|d| d.path.clone())
        .ok_or_else(|| {
            RestoreError::UnknownDataPath(format!(
                "embedded backup disk '{}' not found in system.disks",
                embedded_backup_disk
            ))
        })
}

/// Maps each disk name to the table data path located on that disk. A data
/// path belongs to the disk with the longest matching path prefix; disks that
/// share a path (remapped disks) share the data path.
pub fn get_disks_by_paths(disks: &[Disk], data_paths: &[PathBuf]) -> HashMap<String, PathBuf> {
    let mut result = HashMap::new();
    for data_path in data_paths {
        let best = disks
            .iter()
            .filter(|d| data_path.starts_with(&d.path))
            .map(|d| d.path.components().count())
            .max();
        let Some(depth) = best else {
            continue;
        };
        for disk in disks
            .iter()
            .filter(|d| data_path.starts_with(&d.path) && d.path.components().count() == depth)
        {
            result.entry(disk.name.clone()).or_insert_with(|| data_path.clone());
        }
    }
    result
}
