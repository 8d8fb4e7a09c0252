//! One task drives one partitioned stream into one store table: poll, parse,
//! batch, flush with retries, then commit the covered offsets. Offsets are
//! only ever committed after the store has acknowledged the batch, so a crash
//! at any point means redelivery, never loss.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sinker_clickhouse::{ClickHouseClient, ClickHouseConfig};
use sinker_kafka::{KafkaConsumer, KafkaConsumerConfig};

use crate::backoff::RetryPolicy;
use crate::batch::BatchBuffer;
use crate::config::{ClickHouseSettings, TaskConfig, WriteFailureStrategy};
use crate::error::{Error, Result};
use crate::metrics::{SinkerMetrics, task_labels};
use crate::parser::parse_row;
use crate::source::SourceClient;
use crate::store::StoreClient;
use crate::writer::{StoreWriter, WriteError};

/// This many consumer errors in a row mean the subscription is broken, not
/// hiccuping.
const MAX_CONSECUTIVE_CONSUMER_ERRORS: u32 = 10;

const CONSUMER_ERROR_BACKOFF: Duration = Duration::from_millis(100);

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    Created,
    Initialized,
    Running,
    Stopping,
    Stopped,
    Failed,
}

pub(crate) struct Task {
    config: TaskConfig,
    clickhouse: Option<ClickHouseSettings>,
    state: TaskState,
    source: Option<SourceClient>,
    writer: Option<StoreWriter>,
    buffer: BatchBuffer,
    metrics: Arc<SinkerMetrics>,
    labels: Vec<(String, String)>,
    cancel: CancellationToken,
    /// How long to wait between write attempts once the writer's own budget
    /// is exhausted and the strategy says keep the batch.
    retry_window: Duration,
}

impl Task {
    pub(crate) fn new(
        config: TaskConfig,
        clickhouse: ClickHouseSettings,
        metrics: Arc<SinkerMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let buffer = BatchBuffer::new(config.batch_size, config.flush_interval());
        let labels = task_labels(&config.name);
        let retry_window = Duration::from_millis(config.retry.cap_delay_ms);
        Task {
            config,
            clickhouse: Some(clickhouse),
            state: TaskState::Created,
            source: None,
            writer: None,
            buffer,
            metrics,
            labels,
            cancel,
            retry_window,
        }
    }

    /// Builds a task with injected source and store clients.
    #[cfg(test)]
    pub(crate) fn with_clients(
        config: TaskConfig,
        source: SourceClient,
        store: StoreClient,
        metrics: Arc<SinkerMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let buffer = BatchBuffer::new(config.batch_size, config.flush_interval());
        let labels = task_labels(&config.name);
        let retry_window = Duration::from_millis(config.retry.cap_delay_ms);
        let writer = StoreWriter::new(
            store,
            config.table.clone(),
            RetryPolicy::from(&config.retry).without_jitter(),
            Arc::clone(&metrics),
            labels.clone(),
        );
        Task {
            config,
            clickhouse: None,
            state: TaskState::Created,
            source: Some(source),
            writer: Some(writer),
            buffer,
            metrics,
            labels,
            cancel,
            retry_window,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    /// Connects the consumer and the store. Init happens exactly once; a
    /// second call is rejected instead of silently reconnecting.
    pub(crate) async fn init(&mut self) -> Result<()> {
        if self.state != TaskState::Created {
            return Err(Error::Init(format!(
                "Task {} is already initialized",
                self.config.name
            )));
        }

        if self.source.is_none() {
            let consumer = KafkaConsumer::connect(
                KafkaConsumerConfig {
                    brokers: self.config.brokers.clone(),
                    topic: self.config.topic.clone(),
                    partitions: self.config.partitions.clone(),
                    consumer_group: self.config.consumer_group.clone(),
                    raw_config: self.config.kafka_raw_config.clone(),
                },
                self.config.poll_timeout(),
            )
            .await
            .map_err(|err| Error::Init(format!("Task {}: {err}", self.config.name)))?;
            self.source = Some(SourceClient::Kafka(consumer));
        }

        if self.writer.is_none() {
            let Some(settings) = &self.clickhouse else {
                return Err(Error::Init(format!(
                    "Task {} has no store settings",
                    self.config.name
                )));
            };
            let client = ClickHouseClient::connect(ClickHouseConfig {
                url: settings.url.clone(),
                database: settings.database.clone(),
                user: settings.user.clone(),
                password: settings.password.clone(),
                request_timeout: settings.request_timeout(),
            })
            .await
            .map_err(|err| Error::Init(format!("Task {}: {err}", self.config.name)))?;
            self.writer = Some(StoreWriter::new(
                StoreClient::ClickHouse(client),
                self.config.table.clone(),
                RetryPolicy::from(&self.config.retry),
                Arc::clone(&self.metrics),
                self.labels.clone(),
            ));
        }

        if let Some(writer) = self.writer.as_mut() {
            writer
                .connect()
                .await
                .map_err(|err| Error::Init(format!("Task {}: {err}", self.config.name)))?;
        }

        self.state = TaskState::Initialized;
        info!(
            task = self.config.name,
            topic = self.config.topic,
            table = self.config.table,
            "Task initialized"
        );
        Ok(())
    }

    /// The consume loop. Runs until cancellation or an unrecoverable failure,
    /// flushes whatever is buffered on the way out, and reports the terminal
    /// state.
    pub(crate) async fn run(mut self) -> TaskState {
        if self.state != TaskState::Initialized {
            error!(task = self.config.name, "Task started without init");
            return TaskState::Failed;
        }
        let (Some(source), Some(mut writer)) = (self.source.take(), self.writer.take()) else {
            error!(task = self.config.name, "Task started without clients");
            return TaskState::Failed;
        };
        self.state = TaskState::Running;
        info!(task = self.config.name, "Task running");

        let mut consecutive_errors: u32 = 0;
        let mut polled: u64 = 0;
        let mut last_progress = Instant::now();

        while !self.cancel.is_cancelled() {
            match source.poll().await {
                Ok(Some(record)) => {
                    consecutive_errors = 0;
                    polled += 1;
                    self.metrics.events_total.get_or_create(&self.labels).inc();
                    let cursor = record.cursor();
                    match parse_row(&self.config.columns, &record.value) {
                        Ok(row) => self.buffer.add(row, cursor),
                        Err(err) => {
                            warn!(
                                task = self.config.name,
                                partition = cursor.partition,
                                offset = cursor.offset,
                                %err,
                                "Skipping unparseable record"
                            );
                            self.metrics.events_error.get_or_create(&self.labels).inc();
                            self.buffer.add_cursor(cursor);
                        }
                    }
                }
                Ok(None) => {
                    consecutive_errors = 0;
                }
                Err(err) => {
                    self.metrics
                        .consumer_error_total
                        .get_or_create(&self.labels)
                        .inc();
                    consecutive_errors += 1;
                    error!(task = self.config.name, %err, "Consumer error");
                    if consecutive_errors >= MAX_CONSECUTIVE_CONSUMER_ERRORS {
                        error!(
                            task = self.config.name,
                            errors = consecutive_errors,
                            "Consumer looks broken, stopping the task"
                        );
                        self.state = TaskState::Failed;
                        return TaskState::Failed;
                    }
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = sleep(CONSUMER_ERROR_BACKOFF) => {}
                    }
                }
            }

            if self.buffer.should_flush() {
                if let Err(err) = self.flush(&source, &mut writer).await {
                    error!(task = self.config.name, %err, "Task failed");
                    self.state = TaskState::Failed;
                    return TaskState::Failed;
                }
            }

            if last_progress.elapsed() >= PROGRESS_LOG_INTERVAL {
                if polled > 0 {
                    info!(task = self.config.name, records = polled, "Consumed records");
                }
                polled = 0;
                last_progress = Instant::now();
            }
        }

        self.state = TaskState::Stopping;
        info!(task = self.config.name, "Task stopping, flushing remaining batch");
        if !self.buffer.is_empty() {
            if let Err(err) = self.flush(&source, &mut writer).await {
                error!(task = self.config.name, %err, "Final flush failed");
                self.state = TaskState::Failed;
                return TaskState::Failed;
            }
        }
        self.state = TaskState::Stopped;
        info!(task = self.config.name, "Task stopped");
        TaskState::Stopped
    }

    /// Drains the buffer, writes the rows, then commits every covered cursor.
    /// The commit strictly follows the acknowledged write; a batch that could
    /// not be written is either dropped (offsets still advance) or abandoned
    /// uncommitted, per the configured strategy.
    async fn flush(&mut self, source: &SourceClient, writer: &mut StoreWriter) -> Result<()> {
        let batch = self.buffer.drain();
        if batch.cursors.is_empty() {
            return Ok(());
        }

        if !batch.rows.is_empty() {
            loop {
                match writer.write(&batch.rows).await {
                    Ok(()) => {
                        self.metrics
                            .events_success
                            .get_or_create(&self.labels)
                            .inc_by(batch.rows.len() as u64);
                        break;
                    }
                    Err(WriteError::Rejected(err)) => match self.config.on_write_failure {
                        WriteFailureStrategy::Drop => {
                            error!(
                                task = self.config.name,
                                rows = batch.rows.len(),
                                %err,
                                "Store rejected the batch, dropping it"
                            );
                            self.metrics
                                .events_error
                                .get_or_create(&self.labels)
                                .inc_by(batch.rows.len() as u64);
                            break;
                        }
                        WriteFailureStrategy::Retry => {
                            // Retrying a rejection cannot succeed; failing the
                            // task keeps the offsets uncommitted so nothing is
                            // lost.
                            return Err(Error::Store(format!(
                                "Task {}: batch rejected: {err}",
                                self.config.name
                            )));
                        }
                    },
                    Err(err @ WriteError::RetriesExhausted { .. }) => {
                        match self.config.on_write_failure {
                            WriteFailureStrategy::Drop => {
                                error!(
                                    task = self.config.name,
                                    rows = batch.rows.len(),
                                    %err,
                                    "Dropping batch after exhausted retries"
                                );
                                self.metrics
                                    .events_error
                                    .get_or_create(&self.labels)
                                    .inc_by(batch.rows.len() as u64);
                                break;
                            }
                            WriteFailureStrategy::Retry => {
                                if self.cancel.is_cancelled() {
                                    error!(
                                        task = self.config.name,
                                        rows = batch.rows.len(),
                                        %err,
                                        "Abandoning batch at shutdown, offsets stay uncommitted"
                                    );
                                    return Ok(());
                                }
                                warn!(
                                    task = self.config.name,
                                    rows = batch.rows.len(),
                                    %err,
                                    "Write failed, keeping the batch for the next window"
                                );
                                tokio::select! {
                                    _ = self.cancel.cancelled() => {}
                                    _ = sleep(self.retry_window) => {}
                                }
                            }
                        }
                    }
                }
            }
        }

        if let Err(err) = source.commit(batch.cursors).await {
            warn!(
                task = self.config.name,
                %err,
                "Offset commit failed, records may be redelivered"
            );
            self.metrics
                .consumer_error_total
                .get_or_create(&self.labels)
                .inc();
        }
        Ok(())
    }
}
