//! Store writer: owns the one store connection of its task, tracks its
//! health, and drives the bounded retry/reconnect loop around the bulk
//! insert. Never shared between tasks, so the hot path takes no locks.

use std::sync::Arc;

use tokio::time::sleep;
use tracing::warn;

use crate::backoff::RetryPolicy;
use crate::message::Row;
use crate::metrics::SinkerMetrics;
use crate::store::{StoreClient, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Disconnected,
    Connected,
    Reconnecting,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum WriteError {
    /// The store refused the batch; retrying the same rows cannot help.
    #[error("Write rejected - {0}")]
    Rejected(StoreError),

    /// The retry budget ran out on transport failures.
    #[error("Write failed after {attempts} attempts - {last}")]
    RetriesExhausted { attempts: u16, last: StoreError },
}

pub(crate) struct StoreWriter {
    client: StoreClient,
    table: String,
    state: ConnectionState,
    policy: RetryPolicy,
    metrics: Arc<SinkerMetrics>,
    labels: Vec<(String, String)>,
}

impl StoreWriter {
    pub(crate) fn new(
        client: StoreClient,
        table: String,
        policy: RetryPolicy,
        metrics: Arc<SinkerMetrics>,
        labels: Vec<(String, String)>,
    ) -> Self {
        StoreWriter {
            client,
            table,
            state: ConnectionState::Disconnected,
            policy,
            metrics,
            labels,
        }
    }

    /// Initial connection at task init. Unlike the reconnects inside
    /// `write`, this does not touch the reconnect counter.
    pub(crate) async fn connect(&mut self) -> Result<(), StoreError> {
        self.client.connect().await?;
        self.state = ConnectionState::Connected;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn connection_state(&self) -> ConnectionState {
        self.state
    }

    /// Writes the whole batch with bounded retries. Every attempt resends the
    /// identical row set, so the call is idempotent from the task's side as
    /// long as the batch is unchanged. Returns a terminal error once the
    /// budget is exhausted or the store rejects the data; no silent retries
    /// happen beyond that point.
    pub(crate) async fn write(&mut self, rows: &[Row]) -> Result<(), WriteError> {
        let max_attempts = self.policy.max_attempts();
        let mut last_error = StoreError::Transport("no attempt made".to_string());

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                sleep(self.policy.delay_after(attempt - 1)).await;
            }

            if self.state != ConnectionState::Connected {
                self.state = ConnectionState::Reconnecting;
                self.metrics
                    .reconnect_total
                    .get_or_create(&self.labels)
                    .inc();
                match self.client.connect().await {
                    Ok(()) => self.state = ConnectionState::Connected,
                    Err(err) => {
                        warn!(attempt, table = self.table, %err, "Store reconnect failed");
                        self.state = ConnectionState::Disconnected;
                        last_error = err;
                        continue;
                    }
                }
            }

            match self.client.bulk_insert(&self.table, rows).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transport() => {
                    warn!(attempt, table = self.table, %err, "Store write failed, connection lost");
                    self.state = ConnectionState::Disconnected;
                    last_error = err;
                }
                Err(err) => return Err(WriteError::Rejected(err)),
            }
        }

        Err(WriteError::RetriesExhausted {
            attempts: max_attempts,
            last: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::metrics::task_labels;
    use crate::store::mock::MockStore;

    fn policy(max_attempts: u16) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(50), max_attempts)
            .without_jitter()
    }

    fn writer(store: MockStore, max_attempts: u16) -> (StoreWriter, Arc<SinkerMetrics>) {
        let metrics = Arc::new(SinkerMetrics::new());
        let writer = StoreWriter::new(
            StoreClient::Mock(store),
            "events".to_string(),
            policy(max_attempts),
            Arc::clone(&metrics),
            task_labels("events"),
        );
        (writer, metrics)
    }

    fn rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| {
                let mut row = Row::new();
                row.insert("n".to_string(), serde_json::Value::from(i));
                row
            })
            .collect()
    }

    fn reconnects(metrics: &SinkerMetrics) -> u64 {
        metrics
            .reconnect_total
            .get_or_create(&task_labels("events"))
            .get()
    }

    #[tokio::test]
    async fn write_on_a_healthy_connection_succeeds_without_reconnects() {
        let store = MockStore::default();
        let (mut writer, metrics) = writer(store.clone(), 3);
        writer.connect().await.unwrap();

        writer.write(&rows(5)).await.unwrap();
        assert_eq!(store.total_rows(), 5);
        assert_eq!(reconnects(&metrics), 0);
        assert_eq!(writer.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnect_budget_surfaces_a_terminal_error() {
        // Five consecutive connection failures against a budget of three:
        // the error must surface after the third attempt, with exactly one
        // reconnect counted per attempt and nothing retried beyond that.
        let store = MockStore::failing_connects(5);
        let (mut writer, metrics) = writer(store.clone(), 3);

        let err = writer.write(&rows(1)).await.unwrap_err();
        assert!(matches!(
            err,
            WriteError::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(reconnects(&metrics), 3);
        assert_eq!(store.connect_attempts(), 3);
        assert_eq!(store.total_rows(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_triggers_reconnect_then_retry_succeeds() {
        let store = MockStore::default();
        store.queue_insert_error(StoreError::Transport("broken pipe".to_string()));
        let (mut writer, metrics) = writer(store.clone(), 3);
        writer.connect().await.unwrap();

        writer.write(&rows(2)).await.unwrap();
        // First attempt fails in flight, second reconnects and succeeds.
        assert_eq!(reconnects(&metrics), 1);
        assert_eq!(store.total_rows(), 2);
        assert_eq!(writer.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn rejection_is_terminal_and_not_retried() {
        let store = MockStore::default();
        store.queue_insert_error(StoreError::Rejected("Unknown column `x`".to_string()));
        let (mut writer, metrics) = writer(store.clone(), 3);
        writer.connect().await.unwrap();

        let err = writer.write(&rows(1)).await.unwrap_err();
        assert!(matches!(err, WriteError::Rejected(_)));
        // No reconnect, no second insert with the same batch.
        assert_eq!(reconnects(&metrics), 0);
        assert_eq!(store.total_rows(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_resend_the_identical_row_set() {
        let store = MockStore::default();
        store.queue_insert_error(StoreError::Transport("timeout".to_string()));
        store.queue_insert_error(StoreError::Transport("timeout".to_string()));
        let (mut writer, _metrics) = writer(store.clone(), 3);
        writer.connect().await.unwrap();

        let batch = rows(4);
        writer.write(&batch).await.unwrap();
        let batches = store.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], batch);
    }
}
