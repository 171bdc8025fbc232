// chrestore/src/restore/verification.rs
use crate::clickhouse::Table;
use crate::errors::{RestoreError, Result};
use crate::metadata::TableMetadata;
use crate::restore::mapping::DatabaseMapping;

/// Checks that every table about to receive data exists on the live server
/// under its destination name.
///
/// All missing tables are reported at once in a single
/// [`RestoreError::DestinationTableMissing`].
pub fn verify_destination_tables(
    tables: &[TableMetadata],
    live_tables: &[Table],
    mapping: &DatabaseMapping,
) -> Result<()> {
    let missing: Vec<String> = tables
        .iter()
        .map(|t| (mapping.lookup(&t.database), t.table.as_str()))
        .filter(|(db, name)| !live_tables.iter().any(|l| l.database == *db && l.name == *name))
        .map(|(db, name)| format!("'{}.{}'", db, name))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(RestoreError::DestinationTableMissing(missing))
    }
}

/// Live table that receives the data of `table`.
pub fn find_destination<'a>(
    table: &TableMetadata,
    live_tables: &'a [Table],
    mapping: &DatabaseMapping,
) -> Option<&'a Table> {
    let database = mapping.lookup(&table.database);
    live_tables
        .iter()
        .find(|l| l.database == database && l.name == table.table)
}
