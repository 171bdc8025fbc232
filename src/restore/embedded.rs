// chrestore/src/restore/embedded.rs
use tracing::info;

use crate::clickhouse::{ClickHouseClient, quote_ident, quote_string, row_str};
use crate::errors::{RestoreError, Result};
use crate::metadata::TableMetadata;
use crate::restore::mapping::DatabaseMapping;

/// Builds the native `RESTORE ... FROM Disk(...)` statement for `tables`.
pub fn build_restore_sql(
    tables: &[TableMetadata],
    mapping: &DatabaseMapping,
    partitions: &[String],
    disk: &str,
    backup_name: &str,
    schema_only: bool,
) -> String {
    let items: Vec<String> = tables
        .iter()
        .filter(|t| !t.query.is_empty())
        .map(|t| {
            let is_dictionary = t.query.contains(" DICTIONARY ");
            let kind = if is_dictionary { "DICTIONARY" } else { "TABLE" };
            let mut item = format!("{} {}.{}", kind, quote_ident(&t.database), quote_ident(&t.table));
            if let Some(dst) = mapping.get(&t.database) {
                item.push_str(&format!(" AS {}.{}", quote_ident(dst), quote_ident(&t.table)));
            }
            let is_view = t.query.contains(" VIEW ");
            if !is_dictionary && !is_view && !partitions.is_empty() {
                let list: Vec<String> = partitions.iter().map(|p| quote_string(p)).collect();
                item.push_str(&format!(" PARTITIONS {}", list.join(",")));
            }
            item
        })
        .collect();
    let mut sql = format!(
        "RESTORE {} FROM Disk({},{})",
        items.join(", "),
        quote_string(disk),
        quote_string(backup_name)
    );
    if schema_only {
        sql.push_str(" SETTINGS structure_only=true");
    }
    sql
}

/// Delegates the restore of `tables` to the server's own `RESTORE` command.
pub async fn restore_embedded<C: ClickHouseClient + ?Sized>(
    ch: &C,
    backup_name: &str,
    embedded_disk: &str,
    tables: &[TableMetadata],
    mapping: &DatabaseMapping,
    partitions: &[String],
    schema_only: bool,
) -> Result<()> {
    let sql = build_restore_sql(tables, mapping, partitions, embedded_disk, backup_name, schema_only);
    info!(backup = backup_name, schema_only, "embedded restore");
    let rows = ch
        .select(&sql)
        .await
        .map_err(|e| RestoreError::EmbeddedRestore(format!("restore error: {}", e)))?;
    match rows.first() {
        Some(row) if row_str(row, "status") == "RESTORED" => Ok(()),
        _ => Err(RestoreError::EmbeddedRestore(serde_json::to_string(&rows)?)),
    }
}
