// chrestore/src/restore/mapping.rs
use regex::{Captures, Regex};
use std::collections::{BTreeMap, HashSet};

use crate::errors::{RestoreError, Result};

/// Source database name -> destination database name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseMapping {
    rules: BTreeMap<String, String>,
}

impl DatabaseMapping {
    /// Builds the mapping from `src:dst` rules; each argument may hold several
    /// comma-separated rules. Later rules override earlier ones.
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        let mut mapping = Self::default();
        mapping.extend_from_args(args)?;
        Ok(mapping)
    }

    pub fn extend_from_args<S: AsRef<str>>(&mut self, args: &[S]) -> Result<()> {
        for arg in args {
            for rule in arg.as_ref().split(',').map(str::trim).filter(|r| !r.is_empty()) {
                let parts: Vec<&str> = rule.split(':').map(str::trim).collect();
                match parts.as_slice() {
                    [src, dst] if !src.is_empty() && !dst.is_empty() => {
                        self.insert(src, dst);
                    }
                    _ => {
                        return Err(RestoreError::configuration(format!(
                            "restore-database-mapping {} should only have srcDatabase:destinationDatabase format for each map rule",
                            rule
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, source: &str, destination: &str) {
        self.rules.insert(source.to_string(), destination.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, source: &str) -> Option<&str> {
        self.rules.get(source).map(String::as_str)
    }

    /// Destination name for `source`; identity when unmapped.
    pub fn lookup<'a>(&'a self, source: &'a str) -> &'a str {
        self.get(source).unwrap_or(source)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.rules.iter().map(|(s, d)| (s.as_str(), d.as_str()))
    }

    /// Alternation of every source name, longest first.
    fn sources_alternation(&self) -> String {
        let mut sources: Vec<&str> = self.rules.keys().map(String::as_str).collect();
        sources.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
        sources.iter().map(|s| regex::escape(s)).collect::<Vec<_>>().join("|")
    }

    /// Rewrites every `src.`-qualified identifier and every `Distributed`
    /// engine database argument in `query` to the destination database.
    /// Each name is resolved once, so chained or swapped rules agree with
    /// [`DatabaseMapping::lookup`].
    pub fn rewrite_query(&self, query: &str) -> String {
        if self.is_empty() {
            return query.to_string();
        }
        let sources = self.sources_alternation();
        let Ok(qualifier) = Regex::new(&format!(r#"(^|[\s(,=])([`"]?)({})([`"]?)\."#, sources)) else {
            return query.to_string();
        };
        let Ok(distributed) = Regex::new(&format!(
            r#"(Distributed\(\s*[^,]+,\s*)(['"`]?)({})(['"`]?)(\s*,)"#,
            sources
        )) else {
            return query.to_string();
        };
        let out = qualifier.replace_all(query, |caps: &Captures| {
            format!("{}{}{}{}.", &caps[1], &caps[2], self.lookup(&caps[3]), &caps[4])
        });
        distributed
            .replace_all(&out, |caps: &Captures| {
                format!(
                    "{}{}{}{}{}",
                    &caps[1],
                    &caps[2],
                    self.lookup(&caps[3]),
                    &caps[4],
                    &caps[5]
                )
            })
            .into_owned()
    }

    /// Rewrites a table pattern written in source names so it selects the
    /// destination tables on the live server.
    pub fn rewrite_table_pattern(&self, pattern: &str) -> String {
        let mut referenced = HashSet::new();
        let mut items: Vec<String> = pattern
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| match item.split_once('.') {
                Some((database, rest)) if self.rules.contains_key(database) => {
                    referenced.insert(database.to_string());
                    format!("{}.{}", self.lookup(database), rest)
                }
                _ => item.to_string(),
            })
            .collect();
        for (src, dst) in self.iter() {
            if !referenced.contains(src) {
                items.push(format!("{}.*", dst));
            }
        }
        items.join(",")
    }
}
