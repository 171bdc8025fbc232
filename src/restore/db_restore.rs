// chrestore/src/restore/db_restore.rs
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clickhouse::{ClickHouseClient, on_cluster_clause, quote_ident};
use crate::errors::{RestoreError, Result};
use crate::metadata::{DatabasesMeta, FunctionsMeta, TableMetadata, TableTitle};
use crate::restore::mapping::DatabaseMapping;
use crate::utils::databases::{is_information_schema, is_system_database};
use crate::utils::pattern::TablePattern;

static UUID_WITH_REPLICATED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^(.+)(UUID)(\s+)'([^']+)'(.+)(\{uuid\})(.*)").expect("static regex")
});

static CREATE_DATABASE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^CREATE DATABASE (\s*)(\S+)(\s*)").expect("static regex"));

const ATTACH_REWRITES: [(&str, &str); 3] = [
    ("CREATE MATERIALIZED VIEW", "ATTACH MATERIALIZED VIEW"),
    ("CREATE WINDOW VIEW", "ATTACH WINDOW VIEW"),
    ("CREATE LIVE VIEW", "ATTACH LIVE VIEW"),
];

/// Rewrites a captured CREATE statement into the statement sent to the server.
///
/// Materialized, window and live views are attached so their stored state is
/// reused. Outside `ON CLUSTER` restores, a replicated engine path templated
/// with `{uuid}` gets the table's explicit UUID so replicas keep their
/// ZooKeeper path.
pub fn prepare_schema_query(query: &str, on_cluster: &str) -> String {
    let mut query = query.to_string();
    for (from, to) in ATTACH_REWRITES {
        query = query.replacen(from, to, 1);
    }
    if on_cluster.is_empty() && query.contains("{uuid}") && query.contains("Replicated") {
        match UUID_WITH_REPLICATED_RE.captures(&query) {
            None => {
                warn!("table query doesn't contains UUID, can't guarantee properly restore for ReplicatedMergeTree");
            }
            Some(caps) if Uuid::parse_str(&caps[4]).is_err() => {
                warn!("table UUID '{}' is not valid, keep {{uuid}} macro as is", &caps[4]);
            }
            Some(_) => {
                query = UUID_WITH_REPLICATED_RE
                    .replace(&query, "${1}${2}${3}'${4}'${5}${4}${7}")
                    .into_owned();
            }
        }
    }
    query
}

/// Recreates captured databases, tables and functions on the live server.
pub struct SchemaRestorer<'a, C: ClickHouseClient + ?Sized> {
    pub ch: &'a C,
    pub mapping: &'a DatabaseMapping,
    pub on_cluster: &'a str,
    pub version: i64,
}

impl<C: ClickHouseClient + ?Sized> SchemaRestorer<'_, C> {
    fn destination(&self, table: &TableMetadata) -> TableTitle {
        TableTitle::new(self.mapping.lookup(&table.database), &table.table)
    }

    /// Drops the destination of every table in `tables`, which must be in
    /// drop order. Tables refused because of dependents are retried in the
    /// next pass; the number of passes is bounded by the table count.
    pub async fn drop_exists_tables(&self, tables: &mut [TableMetadata], ignore_dependencies: bool) -> Result<()> {
        let total = tables.len();
        let mut pending: Vec<usize> = (0..total).collect();
        let mut last_error = None;
        for _ in 0..total {
            let mut not_dropped = Vec::new();
            for i in pending {
                let title = self.destination(&tables[i]);
                let result = if tables[i].query.is_empty() {
                    self.drop_guessing_kind(&mut tables[i], &title, ignore_dependencies).await
                } else {
                    self.ch
                        .drop_table(&title, &tables[i].query, self.on_cluster, ignore_dependencies, self.version)
                        .await
                };
                if let Err(e) = result {
                    warn!("can't drop table '{}': {}, will try again", title, e);
                    last_error = Some((title, e));
                    not_dropped.push(i);
                }
            }
            pending = not_dropped;
            if pending.is_empty() {
                return Ok(());
            }
        }
        match last_error {
            Some((title, source)) if !pending.is_empty() => Err(RestoreError::DependencyResolutionFailed {
                action: "drop",
                database: title.database,
                table: title.table,
                retries: total,
                source: Box::new(source),
            }),
            _ => Ok(()),
        }
    }

    /// Captured metadata without DDL does not tell the object kind, so each
    /// plausible kind is tried in turn. The first accepted guess is kept.
    async fn drop_guessing_kind(
        &self,
        table: &mut TableMetadata,
        title: &TableTitle,
        ignore_dependencies: bool,
    ) -> Result<()> {
        let ident = format!("{}.{}", quote_ident(&title.database), quote_ident(&title.table));
        let mut guesses = Vec::with_capacity(3);
        if table.has_parts() {
            guesses.push(format!("CREATE TABLE {}", ident));
        }
        guesses.push(format!("CREATE DICTIONARY {}", ident));
        guesses.push(format!("CREATE MATERIALIZED VIEW {}", ident));

        let mut last_error = None;
        for query in guesses {
            match self
                .ch
                .drop_table(title, &query, self.on_cluster, ignore_dependencies, self.version)
                .await
            {
                Ok(()) => {
                    table.query = query;
                    return Ok(());
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| RestoreError::query(format!("can't guess object kind of {}", title))))
    }

    /// Creates every table in `tables` (in creation order) with pass-based
    /// retry, creating each destination database first.
    pub async fn restore_schema_regular(&self, tables: &[TableMetadata]) -> Result<()> {
        let total = tables.len();
        let mut created_databases = HashSet::new();
        let mut pending: Vec<&TableMetadata> = tables.iter().collect();
        let mut last_error = None;
        for _ in 0..total {
            let mut not_restored = Vec::new();
            for table in pending {
                let title = self.destination(table);
                if !created_databases.contains(&title.database) {
                    self.ch
                        .create_database(&title.database, self.on_cluster)
                        .await
                        .map_err(|e| RestoreError::query(format!("can't create database '{}': {}", title.database, e)))?;
                    created_databases.insert(title.database.clone());
                }
                let query = prepare_schema_query(&table.query, self.on_cluster);
                if let Err(e) = self.ch.create_table(&title, &query, self.on_cluster, self.version).await {
                    warn!("can't create table '{}': {}, will try again", title, e);
                    last_error = Some((title, e));
                    not_restored.push(table);
                }
            }
            pending = not_restored;
            if pending.is_empty() {
                return Ok(());
            }
        }
        match last_error {
            Some((title, source)) if !pending.is_empty() => Err(RestoreError::DependencyResolutionFailed {
                action: "create",
                database: title.database,
                table: title.table,
                retries: total,
                source: Box::new(source),
            }),
            _ => Ok(()),
        }
    }

    /// Recreates a captured database under its destination name, even when
    /// none of its tables are selected.
    pub async fn restore_empty_database(
        &self,
        database: &DatabasesMeta,
        pattern: &TablePattern,
        skip_tables: Option<&TablePattern>,
        drop_first: bool,
    ) -> Result<()> {
        if shall_skip_database(&database.name, pattern, skip_tables) {
            return Ok(());
        }
        let target = self.mapping.lookup(&database.name);
        if drop_first {
            self.ch
                .execute(&format!(
                    "DROP DATABASE IF EXISTS {}{} SYNC",
                    quote_ident(target),
                    on_cluster_clause(self.on_cluster)
                ))
                .await?;
        }
        if database.query.is_empty() {
            return self.ch.create_database(target, self.on_cluster).await;
        }
        let substitution = format!("CREATE DATABASE IF NOT EXISTS ${{1}}{}${{3}}", quote_ident(target));
        let query = CREATE_DATABASE_RE.replace_all(&database.query, substitution.as_str());
        info!(database = target, "create database");
        self.ch.create_database_from_query(&query, self.on_cluster).await
    }

    pub async fn restore_functions(&self, functions: &[FunctionsMeta]) -> Result<()> {
        for function in functions {
            self.ch
                .create_user_defined_function(&function.name, &function.create_query, self.on_cluster)
                .await?;
        }
        Ok(())
    }
}

/// System databases, databases excluded by `skip_tables` as a whole and
/// databases the table pattern can't reach are not recreated.
pub fn shall_skip_database(database: &str, pattern: &TablePattern, skip_tables: Option<&TablePattern>) -> bool {
    if is_system_database(database) || is_information_schema(database) {
        return true;
    }
    if skip_tables.is_some_and(|skip| skip.matches(&format!("{}.*", database))) {
        return true;
    }
    !pattern.may_match_database(database)
}
