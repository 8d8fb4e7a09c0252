//! The task's view of the stream: poll one record with a bounded wait,
//! commit a set of cursors. Kafka is the production implementation; tests run
//! against an in-memory source with scripted records and errors.

use crate::error::{Error, Result};
use crate::message::{Cursor, Record};
use sinker_kafka::KafkaConsumer;

pub(crate) enum SourceClient {
    Kafka(KafkaConsumer),
    #[cfg(test)]
    InMemory(in_memory::InMemorySource),
}

impl SourceClient {
    /// Returns the next record, or `None` when the bounded wait elapsed with
    /// no data. An `Err` is a consumer error; the task counts it and decides
    /// whether the subscription is broken.
    pub(crate) async fn poll(&self) -> Result<Option<Record>> {
        match self {
            SourceClient::Kafka(consumer) => {
                let record = consumer.poll().await?;
                Ok(record.map(Record::from))
            }
            #[cfg(test)]
            SourceClient::InMemory(source) => source.poll().await,
        }
    }

    /// Advances the consumed position. Called only after the store has
    /// acknowledged the batch covering these cursors.
    pub(crate) async fn commit(&self, cursors: Vec<Cursor>) -> Result<()> {
        match self {
            SourceClient::Kafka(consumer) => {
                let cursors = cursors.into_iter().map(Into::into).collect();
                consumer.commit(cursors).await.map_err(Error::from)
            }
            #[cfg(test)]
            SourceClient::InMemory(source) => source.commit(cursors).await,
        }
    }
}

#[cfg(test)]
pub(crate) mod in_memory {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    /// A poll either yields a record or fails like a broken consumer would.
    pub(crate) enum ScriptedPoll {
        Record(Record),
        Error(String),
    }

    #[derive(Default)]
    struct State {
        pending: VecDeque<ScriptedPoll>,
        committed: Vec<Cursor>,
    }

    /// Replays a scripted sequence of polls and logs every commit, so tests
    /// can assert exactly which offsets were acknowledged and when.
    #[derive(Clone, Default)]
    pub(crate) struct InMemorySource {
        state: Arc<Mutex<State>>,
    }

    impl InMemorySource {
        pub(crate) fn with_records(records: Vec<Record>) -> Self {
            let source = Self::default();
            source.state.lock().pending = records.into_iter().map(ScriptedPoll::Record).collect();
            source
        }

        pub(crate) fn push(&self, poll: ScriptedPoll) {
            self.state.lock().pending.push_back(poll);
        }

        pub(crate) async fn poll(&self) -> Result<Option<Record>> {
            // An exhausted script behaves like an idle partition: the bounded
            // wait elapses and the poll yields nothing. Yield so a spinning
            // task loop cannot starve the test runtime.
            tokio::task::yield_now().await;
            match self.state.lock().pending.pop_front() {
                Some(ScriptedPoll::Record(record)) => Ok(Some(record)),
                Some(ScriptedPoll::Error(message)) => Err(Error::Source(message)),
                None => Ok(None),
            }
        }

        pub(crate) async fn commit(&self, cursors: Vec<Cursor>) -> Result<()> {
            self.state.lock().committed.extend(cursors);
            Ok(())
        }

        pub(crate) fn committed(&self) -> Vec<Cursor> {
            self.state.lock().committed.clone()
        }

        pub(crate) fn highest_committed_offset(&self) -> Option<i64> {
            self.state.lock().committed.iter().map(|c| c.offset).max()
        }
    }
}
