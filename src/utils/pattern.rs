// chrestore/src/utils/pattern.rs
use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::errors::{RestoreError, Result};

/// Comma-separated list of shell-style globs matched against `db.table`.
///
/// Supports `*`, `?` and `[...]` classes. An empty pattern matches everything.
#[derive(Debug, Clone)]
pub struct TablePattern {
    raw: String,
    tables: GlobSet,
    databases: GlobSet,
}

impl TablePattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let raw = if pattern.trim().is_empty() { "*" } else { pattern.trim() };
        let items: Vec<&str> = raw.split(',').map(str::trim).filter(|item| !item.is_empty()).collect();
        let tables = build_globset(items.iter().copied())?;
        let databases = build_globset(
            items
                .iter()
                .map(|item| item.split_once('.').map_or(*item, |(db, _)| db)),
        )?;
        Ok(Self {
            raw: raw.to_string(),
            tables,
            databases,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, name: &str) -> bool {
        self.tables.is_match(name)
    }

    pub fn matches_table(&self, database: &str, table: &str) -> bool {
        self.matches(&format!("{}.{}", database, table))
    }

    /// True when at least one item could select a table in `database`.
    pub fn may_match_database(&self, database: &str) -> bool {
        self.databases.is_match(database)
    }
}

fn build_globset<'a>(patterns: impl Iterator<Item = &'a str>) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| RestoreError::configuration(format!("invalid table pattern '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| RestoreError::configuration(format!("invalid table pattern: {}", e)))
}
