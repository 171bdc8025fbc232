// chrestore/src/clickhouse/http.rs
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{ClickHouseClient, Row};
use crate::config::ClickHouseConfig;
use crate::errors::{RestoreError, Result};

/// ClickHouse client speaking the HTTP interface (port 8123 by default).
pub struct HttpClickHouse {
    client: reqwest::Client,
    base_url: Url,
    username: String,
    password: String,
}

impl HttpClickHouse {
    pub fn new(config: &ClickHouseConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    async fn post(&self, sql: &str) -> Result<String> {
        debug!(sql, "clickhouse query");
        let response = self
            .client
            .post(self.base_url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .body(sql.to_string())
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(RestoreError::query(format!("{}: {}", status, body.trim())));
        }
        Ok(body)
    }
}

#[async_trait]
impl ClickHouseClient for HttpClickHouse {
    async fn connect(&self) -> Result<()> {
        self.post("SELECT 1")
            .await
            .map(|_| ())
            .map_err(|e| RestoreError::Connection(format!("{}: {}", self.base_url, e)))
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        self.post(sql).await.map(|_| ())
    }

    async fn select(&self, sql: &str) -> Result<Vec<Row>> {
        let body = self.post(&format!("{} FORMAT JSON", sql.trim_end().trim_end_matches(';'))).await?;
        parse_json_rows(&body)
    }
}

/// Extracts the `data` array of a `FORMAT JSON` response.
fn parse_json_rows(body: &str) -> Result<Vec<Row>> {
    let value: Value = serde_json::from_str(body)?;
    let rows = value
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| RestoreError::query(format!("unexpected response: {}", body.trim())))?;
    Ok(rows
        .iter()
        .filter_map(|row| row.as_object().cloned())
        .collect())
}
