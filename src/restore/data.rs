// chrestore/src/restore/data.rs
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::clickhouse::{ClickHouseClient, Disk, get_default_path, get_disks_by_paths};
use crate::errors::{RestoreError, Result};
use crate::metadata::TableMetadata;
use crate::restore::mapping::DatabaseMapping;
use crate::restore::verification::{find_destination, verify_destination_tables};
use crate::utils::fs_helper::{Ownership, copy_data_to_detached};
use crate::utils::humanize_duration;
use crate::utils::pattern::TablePattern;

/// Moves captured parts into live tables: hard links into `detached`, then
/// `ATTACH PART`.
pub struct DataRestorer<'a, C: ClickHouseClient + ?Sized> {
    pub ch: &'a C,
    pub mapping: &'a DatabaseMapping,
    pub ownership: &'a Ownership,
    /// Paths for backup disks the live server doesn't have.
    pub disk_mapping: &'a HashMap<String, PathBuf>,
}

impl<C: ClickHouseClient + ?Sized> DataRestorer<'_, C> {
    /// Live disks plus a synthetic local disk for every disk the backup
    /// references but the server lacks.
    pub fn resolve_disks(&self, tables: &[TableMetadata], disks: &[Disk]) -> Result<Vec<Disk>> {
        let mut resolved = disks.to_vec();
        let default_path = get_default_path(disks)?;
        for table in tables {
            for disk_name in table.parts.keys() {
                if resolved.iter().any(|d| &d.name == disk_name) {
                    continue;
                }
                let path = self
                    .disk_mapping
                    .get(disk_name)
                    .cloned()
                    .unwrap_or_else(|| default_path.clone());
                warn!(
                    "table '{}' require disk '{}' that not found in clickhouse table system.disks, you can add nonexistent disks to `disk_mapping` in `clickhouse` config section, data will restored to {}",
                    table.title(),
                    disk_name,
                    path.display()
                );
                resolved.push(Disk::new(disk_name.as_str(), path, "local"));
            }
        }
        Ok(resolved)
    }

    /// Restores the data of `tables`, whose destination tables must exist.
    ///
    /// A placement failure stops the restore at once. An attach failure is
    /// kept, the remaining tables are still restored, and the first attach
    /// failure is returned at the end.
    pub async fn restore_data_regular(
        &self,
        backup_name: &str,
        table_pattern: &str,
        tables: &[TableMetadata],
        disks: &[Disk],
    ) -> Result<()> {
        let live_pattern = if self.mapping.is_empty() {
            table_pattern.to_string()
        } else {
            self.mapping.rewrite_table_pattern(table_pattern)
        };
        let live_tables = self.ch.get_tables(&TablePattern::new(&live_pattern)?).await?;
        let disks = self.resolve_disks(tables, disks)?;
        verify_destination_tables(tables, &live_tables, self.mapping)?;

        let mut attach_error = None;
        for table in tables {
            let start = Instant::now();
            let database = self.mapping.lookup(&table.database);
            let destination = find_destination(table, &live_tables, self.mapping).ok_or_else(|| {
                RestoreError::part_placement(database, &table.table, "can't find table in current system.tables")
            })?;
            if !table.has_parts() {
                debug!(table = %destination.title(), "no parts to restore");
                continue;
            }
            let dst_data_paths = get_disks_by_paths(&disks, &destination.data_paths);
            copy_data_to_detached(backup_name, table, &disks, &dst_data_paths, self.ownership)
                .map_err(|e| RestoreError::part_placement(&table.database, &table.table, e))?;
            debug!(table = %destination.title(), "copied data to 'detached'");

            if let Err(e) = self.ch.attach_partitions(database, table).await {
                warn!("can't attach partitions for table '{}': {}", destination.title(), e);
                if attach_error.is_none() {
                    attach_error = Some(RestoreError::AttachPartitions {
                        database: database.to_string(),
                        table: table.table.clone(),
                        source: Box::new(e),
                    });
                }
                continue;
            }
            info!(
                table = %destination.title(),
                duration = %humanize_duration(start.elapsed()),
                "done"
            );
        }
        match attach_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
