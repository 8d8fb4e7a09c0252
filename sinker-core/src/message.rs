//! Core message model: the raw record as it arrives from the stream, the
//! cursor that must be committed once its data is durable, and the parsed row
//! shaped for the store.

use bytes::Bytes;
use sinker_kafka::{KafkaCursor, KafkaRecord};

/// One row, keyed by target column name. Serializes directly into the store's
/// row-per-line JSON format.
pub(crate) type Row = serde_json::Map<String, serde_json::Value>;

/// One raw record read from a partition.
#[derive(Debug, Clone)]
pub(crate) struct Record {
    pub(crate) topic: String,
    pub(crate) partition: i32,
    pub(crate) offset: i64,
    pub(crate) value: Bytes,
}

impl Record {
    pub(crate) fn cursor(&self) -> Cursor {
        Cursor {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }
}

/// Position of a consumed record. Committed back to the stream only after the
/// batch holding it has been acknowledged by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Cursor {
    pub(crate) topic: String,
    pub(crate) partition: i32,
    pub(crate) offset: i64,
}

impl From<KafkaRecord> for Record {
    fn from(record: KafkaRecord) -> Self {
        Record {
            topic: record.topic,
            partition: record.partition,
            offset: record.offset,
            value: record.value,
        }
    }
}

impl From<Cursor> for KafkaCursor {
    fn from(cursor: Cursor) -> Self {
        KafkaCursor {
            topic: cursor.topic,
            partition: cursor.partition,
            offset: cursor.offset,
        }
    }
}

#[cfg(test)]
impl Record {
    /// Builds a single-partition record for pipeline tests.
    pub(crate) fn for_test(offset: i64, payload: &str) -> Record {
        Record {
            topic: "test-topic".to_string(),
            partition: 0,
            offset,
            value: Bytes::copy_from_slice(payload.as_bytes()),
        }
    }
}
