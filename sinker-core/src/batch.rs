//! Batch buffer: parsed rows plus the cursors that produced them, flushed on
//! a row-count or age threshold, whichever trips first. Cursors of skipped
//! (unparseable) records are buffered too, so their offsets advance together
//! with the surrounding batch.

use std::time::Duration;

use tokio::time::Instant;

use crate::message::{Cursor, Row};

pub(crate) struct BatchBuffer {
    rows: Vec<Row>,
    cursors: Vec<Cursor>,
    started_at: Option<Instant>,
    size_threshold: usize,
    age_threshold: Duration,
}

/// What `drain` hands to the store writer: an ordered row set and every
/// cursor covered by it. Either all rows land and all cursors are committed,
/// or neither happens.
pub(crate) struct Batch {
    pub(crate) rows: Vec<Row>,
    pub(crate) cursors: Vec<Cursor>,
}

impl BatchBuffer {
    pub(crate) fn new(size_threshold: usize, age_threshold: Duration) -> Self {
        BatchBuffer {
            rows: Vec::with_capacity(size_threshold),
            cursors: Vec::with_capacity(size_threshold),
            started_at: None,
            size_threshold,
            age_threshold,
        }
    }

    pub(crate) fn add(&mut self, row: Row, cursor: Cursor) {
        self.touch();
        self.rows.push(row);
        self.cursors.push(cursor);
    }

    /// Buffers only the cursor, for a record that was skipped.
    pub(crate) fn add_cursor(&mut self, cursor: Cursor) {
        self.touch();
        self.cursors.push(cursor);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    pub(crate) fn should_flush(&self) -> bool {
        if self.rows.len() >= self.size_threshold {
            return true;
        }
        match self.started_at {
            Some(started_at) => started_at.elapsed() >= self.age_threshold,
            None => false,
        }
    }

    /// Atomically takes the buffered rows and cursors, resetting the buffer.
    pub(crate) fn drain(&mut self) -> Batch {
        self.started_at = None;
        Batch {
            rows: std::mem::take(&mut self.rows),
            cursors: std::mem::take(&mut self.cursors),
        }
    }

    fn touch(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
    }
}
