//! Scripted in-memory driver used by the restore tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::{ClickHouseClient, Disk, Row, Table};
use crate::errors::{RestoreError, Result};
use crate::metadata::{TableMetadata, TableTitle};
use crate::utils::pattern::TablePattern;
use crate::utils::table_path_encode;

#[derive(Debug, Default)]
pub struct MockState {
    pub disks: Vec<Disk>,
    pub tables: Vec<Table>,
    pub version: i64,
    pub executed: Vec<String>,
    pub created: Vec<TableTitle>,
    pub dropped: Vec<TableTitle>,
    pub attached: Vec<(String, String, Vec<String>)>,
    /// `CREATE` of the key fails until every listed table exists; `DROP` of a
    /// listed table fails while the key still exists.
    pub dependencies: HashMap<TableTitle, Vec<TableTitle>>,
    /// Any statement containing one of these substrings fails.
    pub fail_statements: Vec<String>,
    pub fail_attach: HashSet<TableTitle>,
    /// Partition tuple -> id for tables with a `PARTITION BY` clause.
    pub partition_ids: HashMap<String, String>,
    /// Tables `get_partition_id` was asked about.
    pub partition_lookups: Vec<TableTitle>,
    pub select_rows: Vec<Row>,
    pub connect_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct MockClickHouse {
    state: Mutex<MockState>,
}

impl MockClickHouse {
    pub fn new(disks: Vec<Disk>) -> Self {
        Self {
            state: Mutex::new(MockState {
                disks,
                version: 23_003_001,
                ..Default::default()
            }),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Registers an existing live table whose data lives under the default disk.
    pub fn add_table(&self, database: &str, table: &str) {
        let mut state = self.state();
        let path = table_data_path(&state.disks, database, table);
        state.tables.push(Table {
            database: database.to_string(),
            name: table.to_string(),
            engine: "MergeTree".to_string(),
            data_paths: vec![path],
            create_table_query: format!("CREATE TABLE {}.{} (d Date) ENGINE = MergeTree ORDER BY d", database, table),
        });
    }

    pub fn has_table(&self, database: &str, table: &str) -> bool {
        self.state().tables.iter().any(|t| t.database == database && t.name == table)
    }

    fn check_failure(state: &MockState, sql: &str) -> Result<()> {
        match state.fail_statements.iter().find(|s| sql.contains(s.as_str())) {
            Some(matched) => Err(RestoreError::query(format!("scripted failure on '{}'", matched))),
            None => Ok(()),
        }
    }
}

fn table_data_path(disks: &[Disk], database: &str, table: &str) -> PathBuf {
    let root = disks
        .iter()
        .find(|d| d.name == "default")
        .map(|d| d.path.clone())
        .unwrap_or_default();
    root.join("data")
        .join(table_path_encode(database))
        .join(table_path_encode(table))
}

#[async_trait]
impl ClickHouseClient for MockClickHouse {
    async fn connect(&self) -> Result<()> {
        match &self.state().connect_error {
            Some(e) => Err(RestoreError::Connection(e.clone())),
            None => Ok(()),
        }
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        let mut state = self.state();
        state.executed.push(sql.to_string());
        Self::check_failure(&state, sql)
    }

    async fn select(&self, sql: &str) -> Result<Vec<Row>> {
        let mut state = self.state();
        state.executed.push(sql.to_string());
        Self::check_failure(&state, sql)?;
        Ok(state.select_rows.clone())
    }

    async fn get_disks(&self) -> Result<Vec<Disk>> {
        Ok(self.state().disks.clone())
    }

    async fn get_version(&self) -> Result<i64> {
        Ok(self.state().version)
    }

    async fn get_tables(&self, pattern: &TablePattern) -> Result<Vec<Table>> {
        Ok(self
            .state()
            .tables
            .iter()
            .filter(|t| pattern.matches_table(&t.database, &t.name))
            .cloned()
            .collect())
    }

    async fn create_table(&self, table: &TableTitle, query: &str, _on_cluster: &str, _version: i64) -> Result<()> {
        let mut state = self.state();
        state.executed.push(query.to_string());
        Self::check_failure(&state, query)?;
        if let Some(deps) = state.dependencies.get(table) {
            if let Some(missing) = deps
                .iter()
                .find(|dep| !state.tables.iter().any(|t| t.title() == **dep))
            {
                return Err(RestoreError::query(format!("Table {} doesn't exist", missing)));
            }
        }
        if !state.tables.iter().any(|t| t.title() == *table) {
            let path = table_data_path(&state.disks, &table.database, &table.table);
            state.tables.push(Table {
                database: table.database.clone(),
                name: table.table.clone(),
                engine: "MergeTree".to_string(),
                data_paths: vec![path],
                create_table_query: query.to_string(),
            });
        }
        state.created.push(table.clone());
        Ok(())
    }

    async fn drop_table(
        &self,
        table: &TableTitle,
        query: &str,
        _on_cluster: &str,
        _ignore_dependencies: bool,
        _version: i64,
    ) -> Result<()> {
        let mut state = self.state();
        state.executed.push(format!("DROP {} ({})", table, query));
        Self::check_failure(&state, query)?;
        let blocking = state
            .dependencies
            .iter()
            .find(|(dependent, deps)| {
                deps.contains(table) && state.tables.iter().any(|t| t.title() == **dependent)
            })
            .map(|(dependent, _)| dependent.clone());
        if let Some(dependent) = blocking {
            return Err(RestoreError::query(format!(
                "Cannot drop table {}, because {} depends on it",
                table, dependent
            )));
        }
        state.tables.retain(|t| t.title() != *table);
        state.dropped.push(table.clone());
        Ok(())
    }

    async fn attach_partitions(&self, database: &str, table: &TableMetadata) -> Result<()> {
        let mut state = self.state();
        if state.fail_attach.contains(&TableTitle::new(database, &table.table)) {
            return Err(RestoreError::query("scripted attach failure"));
        }
        let parts = table.parts.values().flatten().map(|p| p.name.clone()).collect();
        state
            .attached
            .push((database.to_string(), table.table.clone(), parts));
        Ok(())
    }

    async fn get_access_management_path(&self, default_data_path: &Path) -> Result<PathBuf> {
        Ok(default_data_path.join("access"))
    }

    async fn get_partition_id(
        &self,
        database: &str,
        table: &str,
        create_query: &str,
        partition_tuple: &str,
    ) -> Result<Option<String>> {
        let mut state = self.state();
        state.partition_lookups.push(TableTitle::new(database, table));
        if partition_tuple.contains("error") {
            return Err(RestoreError::query("can't evaluate partition tuple"));
        }
        if !create_query.contains("PARTITION BY") {
            return Ok(None);
        }
        Ok(state.partition_ids.get(partition_tuple.trim()).cloned())
    }
}
