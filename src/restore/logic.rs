// chrestore/src/restore/logic.rs
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::db_restore::SchemaRestorer;
use super::mapping::DatabaseMapping;
use super::{RestoreRequest, RestoreSession, Restorer};
use crate::clickhouse::{ClickHouseClient, get_default_path, get_embedded_backup_path};
use crate::errors::{RestoreError, Result};
use crate::metadata::BackupMetadata;
use crate::utils::fs_helper::{Ownership, copy_dir_merge};
use crate::utils::pattern::TablePattern;
use crate::utils::{clean_backup_name, humanize_duration};

const RESTART_TIMEOUT: Duration = Duration::from_secs(180);

impl<C: ClickHouseClient> Restorer<C> {
    pub(super) async fn run(&self, request: RestoreRequest) -> Result<()> {
        let start = Instant::now();
        let backup_name = clean_backup_name(&request.backup_name);
        let mut mapping = DatabaseMapping::default();
        for (src, dst) in &self.config.general.restore_database_mapping {
            mapping.insert(src, dst);
        }
        mapping.extend_from_args(&request.database_mapping)?;

        self.ch.connect().await?;
        let result = self.run_connected(&backup_name, mapping, &request).await;
        self.ch.close().await;
        result?;
        info!(
            backup = %backup_name,
            operation = "restore",
            duration = %humanize_duration(start.elapsed()),
            "done"
        );
        Ok(())
    }

    async fn run_connected(&self, backup_name: &str, mapping: DatabaseMapping, request: &RestoreRequest) -> Result<()> {
        if backup_name.is_empty() {
            let disks = self.ch.get_disks().await?;
            let default_path = get_default_path(&disks)?;
            for (name, created) in list_local_backups(&default_path)? {
                let created = created.map(|c| c.to_rfc3339()).unwrap_or_else(|| "???".to_string());
                info!("{}\t{}", name, created);
            }
            return Err(RestoreError::NoBackupSelected);
        }

        let session = self.open_session(backup_name, mapping).await?;
        if let Some(metadata) = &session.metadata {
            if request.mode.restores_schema() && !request.rbac_only && !request.configs_only {
                self.restore_empty_databases(&session, metadata, request).await?;
            }
            if metadata.tables.is_empty() {
                warn!("'{}' doesn't contains tables for restore", backup_name);
                if !request.rbac_only && !request.configs_only {
                    return Ok(());
                }
            }
        }

        let mut need_restart = false;
        if request.rbac_only && !session.is_embedded {
            self.restore_rbac(&session).await?;
            need_restart = true;
        }
        if request.configs_only && !session.is_embedded {
            self.restore_configs(&session)?;
            need_restart = true;
        }
        if need_restart {
            let command = &self.config.clickhouse.restart_command;
            warn!(
                "{} contains `access` or `configs` directory, so we need exec {}",
                backup_name, command
            );
            return run_restart_command(command).await;
        }

        if request.mode.restores_schema() {
            self.restore_schema(&session, request).await?;
        }
        if request.mode.restores_data() {
            self.restore_data(&session, request).await?;
        }
        Ok(())
    }

    /// Resolves disks, the backup location and its manifest.
    pub async fn open_session(&self, backup_name: &str, mapping: DatabaseMapping) -> Result<RestoreSession> {
        let config = &self.config.clickhouse;
        let disks = self.ch.get_disks().await?;
        let default_path = get_default_path(&disks)?;

        let embedded_path = match get_embedded_backup_path(&disks, &config.embedded_backup_disk) {
            Ok(path) => Some(path),
            Err(e) if config.embedded_backup_disk.is_empty() => {
                if config.use_embedded_backup_restore {
                    warn!("{}", e);
                }
                None
            }
            Err(e) => return Err(e),
        };

        let mut candidates = Vec::with_capacity(2);
        if let Some(embedded) = &embedded_path {
            candidates.push((embedded.join(backup_name).join("metadata.json"), true));
        }
        candidates.push((default_path.join("backup").join(backup_name).join("metadata.json"), false));

        let mut metadata = None;
        let mut is_embedded = false;
        for (path, embedded) in candidates {
            match BackupMetadata::load(&path) {
                Ok(meta) => {
                    debug!(path = %path.display(), "found backup metadata");
                    metadata = Some(meta);
                    is_embedded = embedded;
                    break;
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        if metadata.is_none() {
            info!("{} doesn't contain metadata.json, restoring it as a legacy backup", backup_name);
        }

        let on_cluster = if self.config.general.restore_schema_on_cluster.is_empty() {
            String::new()
        } else {
            self.ch
                .apply_macros(&self.config.general.restore_schema_on_cluster)
                .await?
        };
        let ownership = Ownership::resolve(&default_path)?;

        Ok(RestoreSession {
            backup_name: backup_name.to_string(),
            disks,
            default_path,
            embedded_path,
            is_embedded,
            metadata,
            on_cluster,
            mapping,
            ownership,
        })
    }

    async fn restore_empty_databases(
        &self,
        session: &RestoreSession,
        metadata: &BackupMetadata,
        request: &RestoreRequest,
    ) -> Result<()> {
        let version = self.ch.get_version().await?;
        let schema = SchemaRestorer {
            ch: &self.ch,
            mapping: &session.mapping,
            on_cluster: &session.on_cluster,
            version,
        };
        let pattern = TablePattern::new(&request.table_pattern)?;
        let skip_tables = &self.config.clickhouse.skip_tables;
        let skip = if skip_tables.is_empty() {
            None
        } else {
            Some(TablePattern::new(&skip_tables.join(","))?)
        };
        let drop_first = request.mode == super::RestoreMode::SchemaOnly && request.drop_table;
        for database in &metadata.databases {
            schema
                .restore_empty_database(database, &pattern, skip.as_ref(), drop_first)
                .await?;
        }
        schema.restore_functions(&metadata.functions).await
    }

    /// Copies `<backup>/access` into the server's access storage and asks the
    /// server to rebuild its entity lists on the next start.
    async fn restore_rbac(&self, session: &RestoreSession) -> Result<()> {
        let access_path = self.ch.get_access_management_path(&session.default_path).await?;
        if !restore_backup_related_dir(session, "access", &access_path)? {
            return Ok(());
        }
        let mark_file = access_path.join("need_rebuild_lists.mark");
        info!(
            "create {} for properly rebuild RBAC after restart clickhouse-server",
            mark_file.display()
        );
        fs::File::create(&mark_file)?;
        session.ownership.apply(&mark_file)?;
        info!(
            "remove {}/*.list for properly rebuild RBAC after restart clickhouse-server",
            access_path.display()
        );
        for entry in fs::read_dir(&access_path)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "list") {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn restore_configs(&self, session: &RestoreSession) -> Result<()> {
        restore_backup_related_dir(session, "configs", &self.config.clickhouse.config_dir).map(|_| ())
    }
}

/// Copies `<backup>/<prefix>` over `destination`. Returns `false` when the
/// backup has no such directory.
fn restore_backup_related_dir(session: &RestoreSession, prefix: &str, destination: &Path) -> Result<bool> {
    let src = session.backup_path().join(prefix);
    match fs::metadata(&src) {
        Ok(meta) if !meta.is_dir() => return Err(RestoreError::NotADirectory(src)),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} not found, nothing to restore", src.display());
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    }
    debug!("copy {} -> {}", src.display(), destination.display());
    copy_dir_merge(&src, destination, &session.ownership)
}

/// Runs the configured server restart command.
pub async fn run_restart_command(command: &str) -> Result<()> {
    let words = shell_words::split(command)
        .map_err(|e| RestoreError::RestartFailed(format!("can't parse '{}': {}", command, e)))?;
    let mut args = words.iter();
    let program = args
        .next()
        .ok_or_else(|| RestoreError::RestartFailed("restart command is empty".to_string()))?;
    let program_path = which::which(program)
        .map_err(|e| RestoreError::RestartFailed(format!("{} not found: {}", program, e)))?;
    info!("run {}", command);
    let output = tokio::time::timeout(
        RESTART_TIMEOUT,
        tokio::process::Command::new(program_path)
            .args(args)
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| RestoreError::RestartFailed(format!("'{}' timed out after {:?}", command, RESTART_TIMEOUT)))??;
    debug!("{}", String::from_utf8_lossy(&output.stdout));
    if !output.status.success() {
        return Err(RestoreError::RestartFailed(format!(
            "'{}' exited with {}: {}",
            command,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Local backups under `<default>/backup`, sorted by name, with their
/// creation date when the manifest has one.
pub fn list_local_backups(default_path: &Path) -> Result<Vec<(String, Option<DateTime<Utc>>)>> {
    let root: PathBuf = default_path.join("backup");
    let entries = match fs::read_dir(&root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut backups = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let created = BackupMetadata::load(&entry.path().join("metadata.json"))
            .ok()
            .and_then(|m| m.creation_date);
        backups.push((name, created));
    }
    backups.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(backups)
}
