//! Instrumented shard cursors shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use shardmerge_common::datum::{Datum, OwnedRow};
use shardmerge_common::error::CursorError;
use shardmerge_engine::ShardCursor;

/// In-memory cursor that counts `close` calls and can fail after a number
/// of rows.
pub struct TrackingCursor {
    columns: Vec<String>,
    rows: Vec<Vec<Datum>>,
    position: usize,
    fail_after: Option<usize>,
    closes: Arc<AtomicUsize>,
}

impl TrackingCursor {
    pub fn new(columns: &[&str], rows: Vec<Vec<Datum>>) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
            position: 0,
            fail_after: None,
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail the `next` call that would move past `rows` rows.
    pub fn failing_after(mut self, rows: usize) -> Self {
        self.fail_after = Some(rows);
        self
    }

    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        self.closes.clone()
    }

    pub fn boxed(self) -> Box<dyn ShardCursor> {
        Box::new(self)
    }
}

impl ShardCursor for TrackingCursor {
    fn next(&mut self) -> Result<bool, CursorError> {
        if self.closes.load(Ordering::SeqCst) > 0 {
            return Err(CursorError::Closed);
        }
        if self.fail_after == Some(self.position) {
            return Err(CursorError::Io("injected failure".into()));
        }
        if self.position < self.rows.len() {
            self.position += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn value(&self, index: usize) -> Result<Datum, CursorError> {
        let row = self
            .position
            .checked_sub(1)
            .and_then(|pos| self.rows.get(pos))
            .ok_or(CursorError::NoCurrentRow)?;
        index
            .checked_sub(1)
            .and_then(|pos| row.get(pos))
            .cloned()
            .ok_or(CursorError::ColumnOutOfBounds(index))
    }

    fn column_count(&self) -> usize {
        self.columns.len()
    }

    fn column_label(&self, index: usize) -> Result<String, CursorError> {
        index
            .checked_sub(1)
            .and_then(|pos| self.columns.get(pos))
            .cloned()
            .ok_or(CursorError::ColumnOutOfBounds(index))
    }

    fn close(&mut self) -> Result<(), CursorError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn int(v: i64) -> Datum {
    Datum::Int64(v)
}

pub fn text(v: &str) -> Datum {
    Datum::Text(v.to_string())
}

/// Render a merged row as strings, NULL included, for easy comparison.
pub fn render(row: &OwnedRow) -> Vec<String> {
    row.values.iter().map(|d| d.to_string()).collect()
}

pub fn render_all(rows: &[OwnedRow]) -> Vec<Vec<String>> {
    rows.iter().map(render).collect()
}
