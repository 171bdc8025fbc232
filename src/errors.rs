use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("can't connect to clickhouse: {0}")]
    Connection(String),

    #[error("select backup for restore")]
    NoBackupSelected,

    #[error("metadata directory not found: {}", .0.display())]
    MetadataNotFound(PathBuf),

    #[error("{} is not a dir", .0.display())]
    NotADirectory(PathBuf),

    #[error("no have found schemas by {pattern} in {backup}")]
    NoMatchingTables { pattern: String, backup: String },

    #[error(
        "can't {action} table `{database}`.`{table}`: {source} after {retries} times, please check your schema dependencies"
    )]
    DependencyResolutionFailed {
        action: &'static str,
        database: String,
        table: String,
        retries: usize,
        #[source]
        source: Box<RestoreError>,
    },

    #[error("{} is not created. Restore schema first or create missing tables manually", .0.join(", "))]
    DestinationTableMissing(Vec<String>),

    #[error("can't restore '{database}.{table}': {message}")]
    PartPlacement {
        database: String,
        table: String,
        message: String,
    },

    #[error("can't attach partitions for table '{database}.{table}': {source}")]
    AttachPartitions {
        database: String,
        table: String,
        #[source]
        source: Box<RestoreError>,
    },

    #[error("restore wrong result: {0}")]
    EmbeddedRestore(String),

    #[error("clickhouse data path is unknown: {0}")]
    UnknownDataPath(String),

    #[error("unsupported backup: {0}")]
    UnsupportedBackup(String),

    #[error("restart command failed: {0}")]
    RestartFailed(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serde JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl RestoreError {
    pub fn query<S: Into<String>>(msg: S) -> Self {
        Self::Query(msg.into())
    }

    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn part_placement(database: &str, table: &str, message: impl std::fmt::Display) -> Self {
        Self::PartPlacement {
            database: database.to_string(),
            table: table.to_string(),
            message: message.to_string(),
        }
    }

    /// True when the error is an I/O "not found", which several restore steps
    /// treat as "nothing to do".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, RestoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_tables_message_lists_every_table() {
        let err = RestoreError::DestinationTableMissing(vec![
            "'db2.t1'".to_string(),
            "'db2.t2'".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "'db2.t1', 'db2.t2' is not created. Restore schema first or create missing tables manually"
        );
    }

    #[test]
    fn test_dependency_error_keeps_underlying_cause() {
        let err = RestoreError::DependencyResolutionFailed {
            action: "create",
            database: "db1".to_string(),
            table: "mv".to_string(),
            retries: 3,
            source: Box::new(RestoreError::query("Table db1.src doesn't exist")),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("can't create table `db1`.`mv`"));
        assert!(msg.contains("Table db1.src doesn't exist"));
        assert!(msg.contains("after 3 times"));
    }

    #[test]
    fn test_is_not_found() {
        let err: RestoreError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert!(err.is_not_found());
        assert!(!RestoreError::query("boom").is_not_found());
    }
}
