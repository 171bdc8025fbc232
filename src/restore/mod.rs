//! Restore of a local backup into the running ClickHouse server.
//!
//! [`Restorer::restore`] drives the whole operation: it locates the backup,
//! recreates databases, tables and functions, then places and attaches the
//! captured parts. Embedded backups are handed to the server's own
//! `RESTORE` command instead.

pub mod data;
pub mod db_restore;
pub mod embedded;
mod logic;
pub mod mapping;
pub mod partitions;
pub mod selector;
pub mod verification;

use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clickhouse::{ClickHouseClient, Disk};
use crate::config::AppConfig;
use crate::errors::{RestoreError, Result};
use crate::metadata::{BackupMetadata, TableMetadata};
use crate::utils::fs_helper::Ownership;
use crate::utils::is_clickhouse_shadow;
use crate::utils::pattern::TablePattern;

use self::data::DataRestorer;
use self::db_restore::SchemaRestorer;
use self::embedded::restore_embedded;
use self::mapping::DatabaseMapping;
use self::partitions::{PartitionFilter, resolve_partitions};
use self::selector::TableSelector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    SchemaOnly,
    DataOnly,
    Full,
}

impl RestoreMode {
    /// `--schema` and `--data` together mean the same as neither.
    pub fn from_flags(schema: bool, data: bool) -> Self {
        match (schema, data) {
            (true, false) => Self::SchemaOnly,
            (false, true) => Self::DataOnly,
            _ => Self::Full,
        }
    }

    pub fn restores_schema(self) -> bool {
        matches!(self, Self::SchemaOnly | Self::Full)
    }

    pub fn restores_data(self) -> bool {
        matches!(self, Self::DataOnly | Self::Full)
    }
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub backup_name: String,
    pub table_pattern: String,
    pub partitions: Vec<String>,
    /// Raw `src:dst` rules, merged over `general.restore_database_mapping`.
    pub database_mapping: Vec<String>,
    pub mode: RestoreMode,
    pub drop_table: bool,
    pub ignore_dependencies: bool,
    pub rbac_only: bool,
    pub configs_only: bool,
}

impl RestoreRequest {
    pub fn new(backup_name: impl Into<String>) -> Self {
        Self {
            backup_name: backup_name.into(),
            table_pattern: String::new(),
            partitions: Vec::new(),
            database_mapping: Vec::new(),
            mode: RestoreMode::Full,
            drop_table: false,
            ignore_dependencies: false,
            rbac_only: false,
            configs_only: false,
        }
    }
}

/// Everything resolved about one backup before its schema or data is touched.
#[derive(Debug, Clone)]
pub struct RestoreSession {
    pub backup_name: String,
    pub disks: Vec<Disk>,
    pub default_path: PathBuf,
    pub embedded_path: Option<PathBuf>,
    pub is_embedded: bool,
    /// `None` for legacy backups that have no `metadata.json`.
    pub metadata: Option<BackupMetadata>,
    pub on_cluster: String,
    pub mapping: DatabaseMapping,
    pub ownership: Ownership,
}

impl RestoreSession {
    pub fn backup_path(&self) -> PathBuf {
        self.default_path.join("backup").join(&self.backup_name)
    }

    pub fn metadata_path(&self) -> PathBuf {
        match (&self.embedded_path, self.is_embedded) {
            (Some(embedded), true) => embedded.join(&self.backup_name).join("metadata"),
            _ => self.backup_path().join("metadata"),
        }
    }
}

pub struct Restorer<C: ClickHouseClient> {
    ch: C,
    config: AppConfig,
}

impl<C: ClickHouseClient> Restorer<C> {
    pub fn new(ch: C, config: AppConfig) -> Self {
        Self { ch, config }
    }

    #[cfg(test)]
    pub fn client(&self) -> &C {
        &self.ch
    }

    /// Runs `request` until it finishes or `cancel` fires.
    pub async fn restore(&self, request: RestoreRequest, cancel: CancellationToken) -> Result<()> {
        let backup_name = request.backup_name.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RestoreError::Cancelled(format!("restore of '{}'", backup_name))),
            result = self.run(request) => result,
        }
    }

    /// Drops (when requested) and recreates the selected tables.
    pub async fn restore_schema(&self, session: &RestoreSession, request: &RestoreRequest) -> Result<()> {
        let version = self.ch.get_version().await?;
        let pattern = TablePattern::new(&request.table_pattern)?;
        let no_partitions = PartitionFilter::default();
        let selector = TableSelector {
            pattern: &pattern,
            skip_tables: &self.config.clickhouse.skip_tables,
            partitions: &no_partitions,
            mapping: &session.mapping,
            skip_system: true,
            drop_order: false,
        };
        let metadata_path = session.metadata_path();
        let mut tables = selector.select_local(&metadata_path, &session.backup_name)?;
        let schema = SchemaRestorer {
            ch: &self.ch,
            mapping: &session.mapping,
            on_cluster: &session.on_cluster,
            version,
        };
        if request.drop_table {
            let mut drop_list = TableSelector {
                drop_order: true,
                ..selector
            }
            .select_local(&metadata_path, &session.backup_name)?;
            schema
                .drop_exists_tables(&mut drop_list, request.ignore_dependencies)
                .await?;
            keep_guessed_queries(&mut tables, &drop_list);
        }
        if session.is_embedded {
            restore_embedded(
                &self.ch,
                &session.backup_name,
                &self.config.clickhouse.embedded_backup_disk,
                &tables,
                &session.mapping,
                &[],
                true,
            )
            .await
        } else {
            schema.restore_schema_regular(&tables).await
        }
    }

    /// Places and attaches the captured parts of the selected tables.
    pub async fn restore_data(&self, session: &RestoreSession, request: &RestoreRequest) -> Result<()> {
        let start = std::time::Instant::now();
        if !session.is_embedded && is_clickhouse_shadow(&session.backup_path().join("shadow")) {
            return Err(RestoreError::UnsupportedBackup(
                "backups created in v0.0.1 is not supported now".to_string(),
            ));
        }
        let pattern = TablePattern::new(&request.table_pattern)?;
        let metadata_path = session.metadata_path();
        let unfiltered = PartitionFilter::default();
        let selector = TableSelector {
            pattern: &pattern,
            skip_tables: &self.config.clickhouse.skip_tables,
            partitions: &unfiltered,
            mapping: &session.mapping,
            skip_system: false,
            drop_order: false,
        };

        let (filter, partition_names) = if request.partitions.iter().any(|p| p.trim_start().starts_with('(')) {
            let captured = selector.select_local(&metadata_path, &session.backup_name)?;
            let live_pattern = TablePattern::new(&session.mapping.rewrite_table_pattern(pattern.as_str()))?;
            let live = self.ch.get_tables(&live_pattern).await?;
            resolve_partitions(&self.ch, &live, &captured, &request.partitions).await
        } else {
            resolve_partitions(&self.ch, &[], &[], &request.partitions).await
        };
        let tables = TableSelector {
            partitions: &filter,
            ..selector
        }
        .select_local(&metadata_path, &session.backup_name)?;
        tracing::debug!("found {} tables with data in backup", tables.len());

        if session.is_embedded {
            restore_embedded(
                &self.ch,
                &session.backup_name,
                &self.config.clickhouse.embedded_backup_disk,
                &tables,
                &session.mapping,
                &partition_names,
                false,
            )
            .await?;
        } else {
            let data = DataRestorer {
                ch: &self.ch,
                mapping: &session.mapping,
                ownership: &session.ownership,
                disk_mapping: &self.config.clickhouse.disk_mapping,
            };
            data.restore_data_regular(&session.backup_name, pattern.as_str(), &tables, &session.disks)
                .await?;
        }
        info!(
            backup = %session.backup_name,
            operation = "restore",
            duration = %crate::utils::humanize_duration(start.elapsed()),
            "data restored"
        );
        Ok(())
    }
}

/// Copies the DDL guessed while dropping onto the matching entries of the
/// creation list, which lack it.
fn keep_guessed_queries(tables: &mut [TableMetadata], dropped: &[TableMetadata]) {
    for table in tables.iter_mut().filter(|t| t.query.is_empty()) {
        if let Some(guessed) = dropped
            .iter()
            .find(|d| d.database == table.database && d.table == table.table)
        {
            table.query = guessed.query.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clickhouse::mock::MockClickHouse;
    use crate::metadata::TableTitle;
    use serde_json::json;
    use std::fs;
    use std::path::Path;

    const BACKUP: &str = "2023-01-01";

    fn write_backup(root: &Path) -> anyhow::Result<()> {
        let backup = root.join("backup").join(BACKUP);
        fs::create_dir_all(backup.join("metadata/db1"))?;
        fs::write(
            backup.join("metadata.json"),
            json!({
                "backup_name": BACKUP,
                "creation_date": "2023-01-01T00:00:00Z",
                "databases": [{"name": "db1", "engine": "Atomic", "query": "CREATE DATABASE db1 ENGINE = Atomic"}],
                "tables": [{"database": "db1", "table": "t1"}]
            })
            .to_string(),
        )?;
        fs::write(
            backup.join("metadata/db1/t1.json"),
            json!({
                "database": "db1",
                "table": "t1",
                "query": "CREATE TABLE db1.t1 (d Date) ENGINE = MergeTree PARTITION BY toYYYYMM(d) ORDER BY d",
                "parts": {"default": [{"name": "202301_1_1_0"}]}
            })
            .to_string(),
        )?;
        let part = backup.join("shadow/db1/t1/default/202301_1_1_0");
        fs::create_dir_all(&part)?;
        fs::write(part.join("data.bin"), b"rows")?;
        Ok(())
    }

    fn restorer(root: &Path) -> Restorer<MockClickHouse> {
        let ch = MockClickHouse::new(vec![Disk::new("default", root, "local")]);
        Restorer::new(ch, AppConfig::default())
    }

    #[tokio::test]
    async fn test_full_restore_creates_table_and_attaches_parts() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_backup(dir.path())?;
        let restorer = restorer(dir.path());

        restorer
            .restore(RestoreRequest::new(BACKUP), CancellationToken::new())
            .await?;

        assert!(restorer.client().has_table("db1", "t1"));
        assert!(dir.path().join("data/db1/t1/detached/202301_1_1_0/data.bin").is_file());
        let state = restorer.client().state();
        assert_eq!(state.created, vec![TableTitle::new("db1", "t1")]);
        assert_eq!(
            state.attached,
            vec![("db1".to_string(), "t1".to_string(), vec!["202301_1_1_0".to_string()])]
        );
        assert!(state
            .executed
            .contains(&"CREATE DATABASE IF NOT EXISTS `db1` ENGINE = Atomic".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_full_restore_with_database_mapping() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_backup(dir.path())?;
        let restorer = restorer(dir.path());
        let mut request = RestoreRequest::new(BACKUP);
        request.database_mapping = vec!["db1:db2".to_string()];

        restorer.restore(request, CancellationToken::new()).await?;

        assert!(restorer.client().has_table("db2", "t1"));
        assert!(!restorer.client().has_table("db1", "t1"));
        assert!(dir.path().join("data/db2/t1/detached/202301_1_1_0/data.bin").is_file());
        let state = restorer.client().state();
        assert_eq!(state.attached[0].0, "db2");
        assert!(state
            .executed
            .iter()
            .any(|sql| sql.starts_with("CREATE TABLE db2.t1")));
        Ok(())
    }

    #[tokio::test]
    async fn test_data_only_requires_existing_tables() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_backup(dir.path())?;
        let restorer = restorer(dir.path());
        let mut request = RestoreRequest::new(BACKUP);
        request.mode = RestoreMode::from_flags(false, true);

        let err = restorer
            .restore(request, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::DestinationTableMissing(ref missing) if missing == &["'db1.t1'".to_string()]));
        assert!(restorer.client().state().created.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_literal_partition_filter_skips_other_parts() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_backup(dir.path())?;
        let restorer = restorer(dir.path());
        let mut request = RestoreRequest::new(BACKUP);
        request.partitions = vec!["202302".to_string()];

        restorer.restore(request, CancellationToken::new()).await?;

        assert!(restorer.client().has_table("db1", "t1"));
        assert!(restorer.client().state().attached.is_empty());
        assert!(!dir.path().join("data/db1/t1/detached/202301_1_1_0").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_tuple_partitions_resolve_against_mapped_live_tables() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_backup(dir.path())?;
        let backup = dir.path().join("backup").join(BACKUP);
        fs::write(
            backup.join("metadata/db1/t1.json"),
            json!({
                "database": "db1",
                "table": "t1",
                "query": "CREATE TABLE db1.t1 (d Date) ENGINE = MergeTree PARTITION BY toYYYYMM(d) ORDER BY d",
                "parts": {"default": [{"name": "202301_1_1_0"}, {"name": "202302_2_2_0"}]}
            })
            .to_string(),
        )?;
        let part = backup.join("shadow/db1/t1/default/202302_2_2_0");
        fs::create_dir_all(&part)?;
        fs::write(part.join("data.bin"), b"rows")?;

        let restorer = restorer(dir.path());
        restorer
            .client()
            .state()
            .partition_ids
            .insert("'2023-02-03'".to_string(), "202302".to_string());
        let mut request = RestoreRequest::new(BACKUP);
        request.table_pattern = "db1.*".to_string();
        request.database_mapping = vec!["db1:db2".to_string()];
        request.partitions = vec!["('2023-02-03')".to_string()];

        restorer.restore(request, CancellationToken::new()).await?;

        let state = restorer.client().state();
        assert_eq!(
            state.attached,
            vec![("db2".to_string(), "t1".to_string(), vec!["202302_2_2_0".to_string()])]
        );
        assert!(state.partition_lookups.contains(&TableTitle::new("db2", "t1")));
        assert!(state.partition_lookups.contains(&TableTitle::new("db1", "t1")));
        assert!(dir.path().join("data/db2/t1/detached/202302_2_2_0").is_dir());
        assert!(!dir.path().join("data/db2/t1/detached/202301_1_1_0").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_schema_restore_reuses_kind_guessed_while_dropping() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_backup(dir.path())?;
        fs::write(
            dir.path().join("backup").join(BACKUP).join("metadata/db1/d1.json"),
            json!({"database": "db1", "table": "d1", "query": ""}).to_string(),
        )?;
        let restorer = restorer(dir.path());
        let mut request = RestoreRequest::new(BACKUP);
        request.mode = RestoreMode::SchemaOnly;
        request.drop_table = true;

        restorer.restore(request, CancellationToken::new()).await?;

        let state = restorer.client().state();
        assert!(state
            .executed
            .contains(&"DROP db1.d1 (CREATE DICTIONARY `db1`.`d1`)".to_string()));
        assert!(state.executed.contains(&"CREATE DICTIONARY `db1`.`d1`".to_string()));
        assert!(!state.executed.iter().any(|sql| sql.is_empty()));
        assert_eq!(state.created.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_backup_name_lists_backups() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_backup(dir.path())?;
        let restorer = restorer(dir.path());
        let err = restorer
            .restore(RestoreRequest::new(""), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::NoBackupSelected));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_restore() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_backup(dir.path())?;
        let restorer = restorer(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = restorer.restore(RestoreRequest::new(BACKUP), cancel).await.unwrap_err();
        assert!(matches!(err, RestoreError::Cancelled(_)));
        assert!(restorer.client().state().created.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_connection_failure() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let restorer = restorer(dir.path());
        restorer.client().state().connect_error = Some("connection refused".to_string());
        let err = restorer
            .restore(RestoreRequest::new(BACKUP), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::Connection(_)));
        Ok(())
    }

    #[test]
    fn test_restore_mode_from_flags() {
        assert_eq!(RestoreMode::from_flags(true, false), RestoreMode::SchemaOnly);
        assert_eq!(RestoreMode::from_flags(false, true), RestoreMode::DataOnly);
        assert_eq!(RestoreMode::from_flags(true, true), RestoreMode::Full);
        assert_eq!(RestoreMode::from_flags(false, false), RestoreMode::Full);
        assert!(!RestoreMode::SchemaOnly.restores_data());
    }
}
