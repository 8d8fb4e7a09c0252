//! Kafka consumer integration for the sinker. Wraps an rdkafka
//! [`StreamConsumer`] behind an actor so that the rest of the system only
//! deals with two operations: poll one record, commit a set of offsets.
//! Offsets are committed manually and synchronously; auto-commit is always
//! disabled because the sinker must never acknowledge a record before its
//! batch has been durably written.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rdkafka::Offset;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::message::Message;
use rdkafka::topic_partition_list::TopicPartitionList;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Connecting to Kafka {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Kafka - {0}")]
    Kafka(String),

    #[error("{0}")]
    Other(String),
}

/// Everything needed to build one consumer: one topic, one consumer group,
/// optionally pinned to an explicit partition set.
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaConsumerConfig {
    /// The list of Kafka brokers to connect to.
    pub brokers: Vec<String>,
    /// The topic to consume records from.
    pub topic: String,
    /// Explicit partition assignment. When empty, the consumer relies on
    /// consumer-group balancing for the whole topic.
    pub partitions: Vec<i32>,
    /// The consumer group id.
    pub consumer_group: String,
    /// Any supported kafka client configuration options from
    /// https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
    pub raw_config: HashMap<String, String>,
}

/// One record as read from a partition.
#[derive(Debug, Clone)]
pub struct KafkaRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: Bytes,
    /// Milliseconds since epoch, when the broker has one.
    pub timestamp: Option<i64>,
}

/// Position of a consumed record; what gets committed back after a durable
/// write.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KafkaCursor {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

// Callbacks invoked by librdkafka; we only log them.
struct SinkerConsumerContext;

impl ClientContext for SinkerConsumerContext {}

impl ConsumerContext for SinkerConsumerContext {
    fn pre_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!("Pre rebalance {:?}", rebalance);
    }

    fn post_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!("Post rebalance {:?}", rebalance);
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        debug!("Committed offsets: {:?}", result);
    }
}

type SinkerConsumer = StreamConsumer<SinkerConsumerContext>;

enum ActorMessage {
    Poll {
        respond_to: oneshot::Sender<Result<Option<KafkaRecord>>>,
    },
    Commit {
        cursors: Vec<KafkaCursor>,
        respond_to: oneshot::Sender<Result<()>>,
    },
}

struct ConsumerActor {
    consumer: Arc<SinkerConsumer>,
    poll_timeout: Duration,
    handler_rx: mpsc::Receiver<ActorMessage>,
}

impl ConsumerActor {
    async fn start(
        config: KafkaConsumerConfig,
        poll_timeout: Duration,
        handler_rx: mpsc::Receiver<ActorMessage>,
    ) -> Result<()> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("auto.offset.reset", "earliest");
        for (key, value) in &config.raw_config {
            client_config.set(key, value);
        }
        client_config
            .set("group.id", &config.consumer_group)
            .set("bootstrap.servers", config.brokers.join(","))
            .set("enable.auto.commit", "false")
            .set_log_level(RDKafkaLogLevel::Warning);

        let consumer: Arc<SinkerConsumer> = Arc::new(
            client_config
                .create_with_context(SinkerConsumerContext)
                .map_err(|err| Error::Connection {
                    server: config.brokers.join(","),
                    error: err.to_string(),
                })?,
        );

        if config.partitions.is_empty() {
            consumer
                .subscribe(&[config.topic.as_str()])
                .map_err(|err| Error::Kafka(format!("Failed to subscribe to topic: {err}")))?;
        } else {
            let mut tpl = TopicPartitionList::new();
            for partition in &config.partitions {
                tpl.add_partition_offset(&config.topic, *partition, Offset::Stored)
                    .map_err(|err| Error::Kafka(format!("Failed to build assignment: {err}")))?;
            }
            consumer
                .assign(&tpl)
                .map_err(|err| Error::Kafka(format!("Failed to assign partitions: {err}")))?;
        }

        // subscribe()/assign() succeed even when the broker is unreachable or
        // the credentials are bad; a metadata fetch is the cheapest way to
        // surface that at startup instead of on the first poll.
        let probe = Arc::clone(&consumer);
        let topic = config.topic.clone();
        tokio::task::spawn_blocking(move || {
            probe
                .fetch_metadata(Some(&topic), Duration::from_secs(5))
                .map(|_| ())
                .map_err(|err| Error::Connection {
                    server: config.brokers.join(","),
                    error: err.to_string(),
                })
        })
        .await
        .map_err(|err| Error::Other(format!("Metadata probe task: {err}")))??;

        let mut actor = ConsumerActor {
            consumer,
            poll_timeout,
            handler_rx,
        };

        tokio::spawn(async move {
            // Terminates when the sender side of handler_rx is dropped.
            actor.run().await;
        });

        Ok(())
    }

    async fn run(&mut self) {
        while let Some(msg) = self.handler_rx.recv().await {
            self.handle_message(msg).await;
        }
        debug!("Kafka consumer actor exiting");
    }

    async fn handle_message(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::Poll { respond_to } => {
                let record = self.poll_one().await;
                respond_to.send(record).unwrap_or_else(|_| {
                    error!("Failed to send polled record back to the task");
                });
            }
            ActorMessage::Commit {
                cursors,
                respond_to,
            } => {
                let status = self.commit_cursors(cursors).await;
                respond_to.send(status).unwrap_or_else(|_| {
                    error!("Failed to send commit status back to the task");
                });
            }
        }
    }

    /// Waits for the next record with a bounded timeout so that shutdown
    /// signals are observed promptly even on an idle partition.
    async fn poll_one(&mut self) -> Result<Option<KafkaRecord>> {
        let message = match tokio::time::timeout(self.poll_timeout, self.consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(Err(err)) => return Err(Error::Kafka(format!("Failed to read message: {err}"))),
            Ok(Ok(message)) => message,
        };

        let value = match message.payload() {
            Some(payload) => Bytes::copy_from_slice(payload),
            None => Bytes::new(),
        };

        Ok(Some(KafkaRecord {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(|k| String::from_utf8_lossy(k).to_string()),
            value,
            timestamp: message.timestamp().to_millis(),
        }))
    }

    async fn commit_cursors(&mut self, cursors: Vec<KafkaCursor>) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        for ((topic, partition), offset) in fold_highest_offsets(&cursors) {
            // Commit offset+1: the committed offset is the position of the
            // next record to be read, not the last one processed.
            tpl.add_partition_offset(&topic, partition, Offset::Offset(offset + 1))
                .map_err(|err| Error::Kafka(format!("Failed to build commit list: {err}")))?;
        }

        // commit() can block inside librdkafka, keep it off the runtime.
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || {
            consumer
                .commit(&tpl, CommitMode::Sync)
                .map_err(|err| Error::Kafka(format!("Failed to commit offsets: {err}")))
        })
        .await
        .map_err(|err| Error::Other(format!("Commit task: {err}")))?
    }
}

/// Keeps only the highest offset per (topic, partition) so a batch commits
/// exactly one position per partition.
fn fold_highest_offsets(cursors: &[KafkaCursor]) -> HashMap<(String, i32), i64> {
    let mut highest: HashMap<(String, i32), i64> = HashMap::new();
    for cursor in cursors {
        highest
            .entry((cursor.topic.clone(), cursor.partition))
            .and_modify(|current| {
                if cursor.offset > *current {
                    *current = cursor.offset;
                }
            })
            .or_insert(cursor.offset);
    }
    highest
}

/// Cloneable handle to the consumer actor. Dropping every handle shuts the
/// actor down.
#[derive(Clone)]
pub struct KafkaConsumer {
    actor_tx: mpsc::Sender<ActorMessage>,
}

impl KafkaConsumer {
    pub async fn connect(config: KafkaConsumerConfig, poll_timeout: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::channel(10);
        ConsumerActor::start(config, poll_timeout, rx).await?;
        Ok(Self { actor_tx: tx })
    }

    /// Returns the next record, or `None` when the bounded wait elapsed
    /// without data.
    pub async fn poll(&self) -> Result<Option<KafkaRecord>> {
        let (tx, rx) = oneshot::channel();
        let _ = self.actor_tx.send(ActorMessage::Poll { respond_to: tx }).await;
        rx.await
            .map_err(|_| Error::Other("Consumer actor terminated".into()))?
    }

    pub async fn commit(&self, cursors: Vec<KafkaCursor>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .actor_tx
            .send(ActorMessage::Commit {
                cursors,
                respond_to: tx,
            })
            .await;
        rx.await
            .map_err(|_| Error::Other("Consumer actor terminated".into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(partition: i32, offset: i64) -> KafkaCursor {
        KafkaCursor {
            topic: "events".to_string(),
            partition,
            offset,
        }
    }

    #[test]
    fn highest_offset_wins_per_partition() {
        let cursors = vec![cursor(0, 3), cursor(0, 7), cursor(1, 2), cursor(0, 5)];
        let folded = fold_highest_offsets(&cursors);
        assert_eq!(folded.len(), 2);
        assert_eq!(folded[&("events".to_string(), 0)], 7);
        assert_eq!(folded[&("events".to_string(), 1)], 2);
    }

    #[test]
    fn empty_cursors_fold_to_nothing() {
        assert!(fold_highest_offsets(&[]).is_empty());
    }

    #[cfg(feature = "kafka-tests")]
    #[tokio::test]
    async fn poll_and_commit_roundtrip() {
        use rdkafka::producer::{FutureProducer, FutureRecord};

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", "localhost:9092")
            .create()
            .expect("Failed to create producer");

        let topic = format!("sinker_kafka_test_{}", std::process::id());
        for i in 0..3 {
            let payload = format!("{{\"n\":{i}}}");
            producer
                .send(
                    FutureRecord::<(), _>::to(&topic).payload(&payload),
                    Duration::from_secs(5),
                )
                .await
                .expect("Failed to produce");
        }

        let config = KafkaConsumerConfig {
            brokers: vec!["localhost:9092".to_string()],
            topic: topic.clone(),
            partitions: vec![],
            consumer_group: format!("{topic}_group"),
            raw_config: HashMap::new(),
        };
        let consumer = KafkaConsumer::connect(config, Duration::from_secs(5))
            .await
            .expect("Failed to connect");

        let mut cursors = Vec::new();
        for _ in 0..3 {
            let record = consumer
                .poll()
                .await
                .expect("poll failed")
                .expect("expected a record");
            cursors.push(KafkaCursor {
                topic: record.topic,
                partition: record.partition,
                offset: record.offset,
            });
        }
        consumer.commit(cursors).await.expect("commit failed");

        // Idle topic: the bounded wait elapses and poll yields None.
        let consumer2 = KafkaConsumer::connect(
            KafkaConsumerConfig {
                brokers: vec!["localhost:9092".to_string()],
                topic,
                partitions: vec![],
                consumer_group: "another_group".to_string(),
                raw_config: HashMap::new(),
            },
            Duration::from_millis(200),
        )
        .await
        .expect("Failed to connect");
        // Drain whatever is there, then expect a timeout.
        loop {
            match consumer2.poll().await.expect("poll failed") {
                Some(_) => {}
                None => break,
            }
        }
    }
}
