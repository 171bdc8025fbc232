// chrestore/src/restore/partitions.rs
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;
use tracing::error;

use crate::clickhouse::{ClickHouseClient, Table};
use crate::metadata::{Part, TableMetadata};

static PARTITION_TUPLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\)\s*,\s*\(").expect("static regex"));

/// Canonical partition ids selected by the user. Empty means all partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionFilter {
    ids: BTreeSet<String>,
    names: Vec<String>,
}

impl PartitionFilter {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &BTreeSet<String> {
        &self.ids
    }

    /// Normalised list, used to render `PARTITIONS '...'` for embedded restore.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains_part(&self, part: &Part) -> bool {
        self.ids.contains(part.partition_id())
    }

    /// Drops every part of `table` that is outside the filter.
    pub fn retain_parts(&self, table: &mut TableMetadata) {
        if self.is_empty() {
            return;
        }
        for parts in table.parts.values_mut() {
            parts.retain(|p| self.contains_part(p));
        }
    }

    fn from_ids(ids: BTreeSet<String>) -> Self {
        let names = ids.iter().cloned().collect();
        Self { ids, names }
    }
}

/// Resolves raw `--partitions` arguments.
///
/// Plain arguments are comma lists of partition ids. Arguments starting with
/// `(` are lists of partition-key tuples, `(v1,v2),(v3,v4)`, which are turned
/// into ids by the server for every live and every captured table. A single
/// evaluation failure discards the whole tuple resolution: the returned filter
/// is empty and the raw arguments are returned unchanged.
pub async fn resolve_partitions<C: ClickHouseClient + ?Sized>(
    ch: &C,
    live_tables: &[Table],
    backup_tables: &[TableMetadata],
    partitions: &[String],
) -> (PartitionFilter, Vec<String>) {
    if partitions.is_empty() {
        return (PartitionFilter::default(), Vec::new());
    }
    let mut ids = BTreeSet::new();
    for arg in partitions {
        let arg = arg.trim_matches(|c| c == ' ' || c == '\t');
        if let Some(inner) = arg.strip_prefix('(') {
            let inner = inner.strip_suffix(')').unwrap_or(inner);
            for tuple in PARTITION_TUPLE_RE.split(inner) {
                let candidates = live_tables
                    .iter()
                    .map(|t| (t.database.as_str(), t.name.as_str(), t.create_table_query.as_str()))
                    .chain(
                        backup_tables
                            .iter()
                            .map(|t| (t.database.as_str(), t.table.as_str(), t.query.as_str())),
                    );
                for (database, table, query) in candidates {
                    match ch.get_partition_id(database, table, query, tuple).await {
                        Ok(Some(id)) if !id.is_empty() => {
                            ids.insert(id);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("partition id for {}.{} and ({}) error: {}", database, table, tuple, e);
                            return (PartitionFilter::default(), partitions.to_vec());
                        }
                    }
                }
            }
        } else {
            ids.extend(
                arg.split(',')
                    .map(|item| item.trim_matches(|c| c == ' ' || c == '\t'))
                    .filter(|item| !item.is_empty())
                    .map(str::to_string),
            );
        }
    }
    let filter = PartitionFilter::from_ids(ids);
    let names = filter.names().to_vec();
    (filter, names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clickhouse::Disk;
    use crate::clickhouse::mock::MockClickHouse;

    fn backup_table(query: &str) -> TableMetadata {
        TableMetadata {
            database: "db1".to_string(),
            table: "t1".to_string(),
            query: query.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_literal_partitions() {
        let ch = MockClickHouse::new(vec![Disk::new("default", "/var/lib/clickhouse", "local")]);
        let (filter, names) =
            resolve_partitions(&ch, &[], &[], &["20230101,20230102".to_string(), " 20230101 ".to_string()]).await;
        let expected: BTreeSet<String> = ["20230101", "20230102"].iter().map(|s| s.to_string()).collect();
        assert_eq!(filter.ids(), &expected);
        assert_eq!(names, vec!["20230101".to_string(), "20230102".to_string()]);
    }

    #[tokio::test]
    async fn test_tuple_partitions_use_engine_ids() {
        let ch = MockClickHouse::new(vec![Disk::new("default", "/var/lib/clickhouse", "local")]);
        {
            let mut state = ch.state();
            state.partition_ids.insert("'2023-01-15'".to_string(), "202301".to_string());
            state.partition_ids.insert("'2023-02-03'".to_string(), "202302".to_string());
        }
        let tables = vec![backup_table(
            "CREATE TABLE db1.t1 (d Date) ENGINE = MergeTree PARTITION BY toYYYYMM(d) ORDER BY d",
        )];
        let (filter, names) =
            resolve_partitions(&ch, &[], &tables, &["('2023-01-15'),('2023-02-03')".to_string()]).await;
        assert_eq!(names, vec!["202301".to_string(), "202302".to_string()]);
        assert!(!filter.ids().contains("'2023-01-15'"));
    }

    #[tokio::test]
    async fn test_tuple_evaluation_failure_returns_empty_filter() {
        let ch = MockClickHouse::new(vec![Disk::new("default", "/var/lib/clickhouse", "local")]);
        ch.state().partition_ids.insert("1".to_string(), "1".to_string());
        let tables = vec![backup_table(
            "CREATE TABLE db1.t1 (x UInt8) ENGINE = MergeTree PARTITION BY x ORDER BY x",
        )];
        let raw = vec!["(1),(error)".to_string()];
        let (filter, names) = resolve_partitions(&ch, &[], &tables, &raw).await;
        assert!(filter.is_empty());
        assert_eq!(names, raw);
    }

    #[test]
    fn test_retain_parts() {
        let mut table = backup_table("");
        table.parts.insert(
            "default".to_string(),
            vec![Part::new("202301_1_1_0"), Part::new("202302_2_2_0")],
        );
        let filter = PartitionFilter::from_ids(["202302".to_string()].into_iter().collect());
        filter.retain_parts(&mut table);
        assert_eq!(table.parts["default"], vec![Part::new("202302_2_2_0")]);
    }
}
