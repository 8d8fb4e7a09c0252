//! The store contract as the writer sees it: establish a connection, insert a
//! whole batch in one operation. Errors carry the transport-vs-rejection
//! split the retry policy keys off. ClickHouse is the production
//! implementation; tests run against a mock with scripted failures.

use sinker_clickhouse::ClickHouseClient;

use crate::message::Row;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub(crate) enum StoreError {
    /// Connection-level failure; worth a reconnect and a retry.
    #[error("Store transport - {0}")]
    Transport(String),

    /// The store itself refused the data or the query; retrying cannot help.
    #[error("Store rejection - {0}")]
    Rejected(String),
}

impl StoreError {
    pub(crate) fn is_transport(&self) -> bool {
        matches!(self, StoreError::Transport(_))
    }
}

impl From<sinker_clickhouse::Error> for StoreError {
    fn from(err: sinker_clickhouse::Error) -> Self {
        match err {
            sinker_clickhouse::Error::Transport(message) => StoreError::Transport(message),
            sinker_clickhouse::Error::Rejected { status, message } => {
                StoreError::Rejected(format!("HTTP {status}: {message}"))
            }
            sinker_clickhouse::Error::Other(message) => StoreError::Rejected(message),
        }
    }
}

pub(crate) enum StoreClient {
    ClickHouse(ClickHouseClient),
    #[cfg(test)]
    Mock(mock::MockStore),
}

impl StoreClient {
    /// (Re-)establishes the connection. For the HTTP-based store this is a
    /// liveness probe; a failure means the connection is not usable.
    pub(crate) async fn connect(&self) -> Result<(), StoreError> {
        match self {
            StoreClient::ClickHouse(client) => client.ping().await.map_err(StoreError::from),
            #[cfg(test)]
            StoreClient::Mock(store) => store.connect(),
        }
    }

    /// One bulk insert for the whole batch; all rows in one store-side
    /// operation.
    pub(crate) async fn bulk_insert(&self, table: &str, rows: &[Row]) -> Result<(), StoreError> {
        match self {
            StoreClient::ClickHouse(client) => client
                .bulk_insert(table, rows)
                .await
                .map_err(StoreError::from),
            #[cfg(test)]
            StoreClient::Mock(store) => store.bulk_insert(table, rows),
        }
    }
}
