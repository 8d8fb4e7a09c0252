//! ClickHouse client for the sinker, speaking the HTTP interface. A batch is
//! written with a single `INSERT ... FORMAT JSONEachRow` request so the whole
//! batch lands in one store-side operation.
//!
//! Errors are split into two kinds because the caller's retry policy depends
//! on it: [`Error::Transport`] (connection loss, timeout) is retryable after a
//! reconnect, [`Error::Rejected`] (the server refused the data or the query)
//! is not.

use std::time::Duration;

use tracing::debug;

pub type Result<T> = core::result::Result<T, Error>;

/// One row, already shaped for `JSONEachRow`: column name to JSON value.
pub type JsonRow = serde_json::Map<String, serde_json::Value>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("ClickHouse transport - {0}")]
    Transport(String),

    #[error("ClickHouse rejected the request (HTTP {status}) - {message}")]
    Rejected { status: u16, message: String },

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when a reconnect plus retry might succeed.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClickHouseConfig {
    /// Base URL of the HTTP interface, e.g. `http://localhost:8123`.
    pub url: String,
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Per-request timeout; an elapsed timeout is a transport error.
    pub request_timeout: Duration,
}

#[derive(Debug)]
pub struct ClickHouseClient {
    http: reqwest::Client,
    config: ClickHouseConfig,
}

impl ClickHouseClient {
    /// Builds the HTTP client and verifies the server is reachable via
    /// `/ping`. A failed ping is a transport error, the connection is simply
    /// not established yet.
    pub async fn connect(config: ClickHouseConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| Error::Other(format!("Building HTTP client: {err}")))?;

        let client = Self { http, config };
        client.ping().await?;
        Ok(client)
    }

    pub async fn ping(&self) -> Result<()> {
        let response = self
            .http
            .get(format!("{}/ping", self.config.url))
            .send()
            .await
            .map_err(|err| Error::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "Ping returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Inserts the whole row set with a single request. Either the server
    /// acknowledges all of it or the call errors and nothing should be
    /// treated as written.
    pub async fn bulk_insert(&self, table: &str, rows: &[JsonRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let body = encode_rows(&self.config.database, table, rows)?;
        let mut request = self
            .http
            .post(&self.config.url)
            .header("Content-Type", "text/plain; charset=UTF-8")
            .body(body);
        if let Some(user) = &self.config.user {
            request = request.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.config.password {
            request = request.header("X-ClickHouse-Key", password);
        }

        let response = request
            .send()
            .await
            .map_err(|err| Error::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        debug!(table, rows = rows.len(), "Inserted batch");
        Ok(())
    }

    /// Row count per table, used by the feature-gated integration tests.
    pub async fn count(&self, table: &str) -> Result<u64> {
        let query = format!(
            "SELECT count() FROM `{}`.`{}` FORMAT TabSeparated",
            self.config.database, table
        );
        let response = self
            .http
            .post(&self.config.url)
            .body(query)
            .send()
            .await
            .map_err(|err| Error::Transport(err.to_string()))?;
        let text = response
            .text()
            .await
            .map_err(|err| Error::Transport(err.to_string()))?;
        text.trim()
            .parse()
            .map_err(|err| Error::Other(format!("Parsing count: {err}")))
    }
}

/// Builds the full request body: the insert statement followed by one JSON
/// object per line.
fn encode_rows(database: &str, table: &str, rows: &[JsonRow]) -> Result<String> {
    let mut body = format!("INSERT INTO `{database}`.`{table}` FORMAT JSONEachRow\n");
    for row in rows {
        let line = serde_json::to_string(row)
            .map_err(|err| Error::Other(format!("Encoding row: {err}")))?;
        body.push_str(&line);
        body.push('\n');
    }
    Ok(body)
}

/// Convenience for tests and callers assembling rows by hand.
pub fn row_from_pairs(pairs: Vec<(&str, serde_json::Value)>) -> JsonRow {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
