//! Row/cursor model: the shard cursor contract, case-insensitive column
//! labels, immutable row snapshots, and the close-once guard the strategies
//! hold cursors through.

use std::collections::HashMap;
use std::sync::Arc;

use shardmerge_common::datum::{Datum, OwnedRow};
use shardmerge_common::error::{ConfigError, CursorError, MergeError, MergeResult};
use shardmerge_common::types::ShardId;

use crate::shape::ColumnRef;

static NULL_DATUM: Datum = Datum::Null;

/// An open per-shard row cursor produced by the shard-execution layer.
///
/// Column indexes are 1-based. `close` releases the underlying shard
/// resources; the engine calls it exactly once per cursor.
pub trait ShardCursor: Send {
    /// Advance to the next row. `Ok(false)` once exhausted.
    fn next(&mut self) -> Result<bool, CursorError>;

    /// Value of the current row at 1-based `index`.
    fn value(&self, index: usize) -> Result<Datum, CursorError>;

    fn column_count(&self) -> usize;

    /// Label of the 1-based column `index`.
    fn column_label(&self, index: usize) -> Result<String, CursorError>;

    fn close(&mut self) -> Result<(), CursorError> {
        Ok(())
    }
}

/// Column labels of one logical projection, shared by every row of a merge.
#[derive(Debug, Clone, Default)]
pub struct ColumnLabels {
    labels: Vec<String>,
    by_lower: HashMap<String, usize>,
}

impl ColumnLabels {
    pub fn new<S: Into<String>>(labels: impl IntoIterator<Item = S>) -> Self {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        let mut by_lower = HashMap::with_capacity(labels.len());
        for (pos, label) in labels.iter().enumerate() {
            // First occurrence wins for duplicated labels.
            by_lower.entry(label.to_lowercase()).or_insert(pos);
        }
        Self { labels, by_lower }
    }

    pub fn from_cursor(cursor: &dyn ShardCursor) -> Result<Self, CursorError> {
        let labels = (1..=cursor.column_count())
            .map(|i| cursor.column_label(i))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(labels))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Label of the 1-based column `index`.
    pub fn label(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|pos| self.labels.get(pos))
            .map(String::as_str)
    }

    /// 0-based position of a column reference.
    pub fn position(&self, column: &ColumnRef) -> Result<usize, ConfigError> {
        match column {
            ColumnRef::Index(index) => {
                if *index == 0 || *index > self.labels.len() {
                    Err(ConfigError::ColumnOutOfBounds {
                        index: *index,
                        column_count: self.labels.len(),
                    })
                } else {
                    Ok(index - 1)
                }
            }
            ColumnRef::Label(label) => self
                .by_lower
                .get(&label.to_lowercase())
                .copied()
                .ok_or_else(|| ConfigError::UnknownColumn(label.clone())),
        }
    }

    /// Same column count and the same labels, compared case-insensitively.
    pub fn matches(&self, other: &ColumnLabels) -> bool {
        self.labels.len() == other.labels.len()
            && self
                .labels
                .iter()
                .zip(other.labels.iter())
                .all(|(a, b)| a.to_lowercase() == b.to_lowercase())
    }
}

/// Immutable snapshot of one row, addressable by index or label.
#[derive(Debug, Clone)]
pub struct Row {
    values: OwnedRow,
    labels: Arc<ColumnLabels>,
}

impl Row {
    pub fn new(values: OwnedRow, labels: Arc<ColumnLabels>) -> Self {
        Self { values, labels }
    }

    /// Snapshot the cursor's current row.
    pub fn read_from(
        cursor: &dyn ShardCursor,
        labels: &Arc<ColumnLabels>,
    ) -> Result<Self, CursorError> {
        let values = (1..=labels.len())
            .map(|i| cursor.value(i))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(OwnedRow::new(values), labels.clone()))
    }

    /// Value at 1-based `index`.
    pub fn value(&self, index: usize) -> Option<&Datum> {
        index.checked_sub(1).and_then(|pos| self.values.get(pos))
    }

    pub fn value_by_label(&self, label: &str) -> Option<&Datum> {
        let pos = self.labels.position(&ColumnRef::from(label)).ok()?;
        self.values.get(pos)
    }

    pub fn get(&self, column: &ColumnRef) -> Result<&Datum, ConfigError> {
        let pos = self.labels.position(column)?;
        Ok(self.datum_at(pos))
    }

    /// Value at a resolved 0-based position; NULL when out of range.
    pub fn datum_at(&self, pos: usize) -> &Datum {
        self.values.get(pos).unwrap_or(&NULL_DATUM)
    }

    pub fn values(&self) -> &OwnedRow {
        &self.values
    }

    pub fn into_values(self) -> OwnedRow {
        self.values
    }

    pub fn labels(&self) -> &Arc<ColumnLabels> {
        &self.labels
    }

    pub(crate) fn set(&mut self, pos: usize, value: Datum) {
        if let Some(slot) = self.values.values.get_mut(pos) {
            *slot = value;
        }
    }
}

/// A shard cursor owned by a merge strategy. Closes the cursor exactly once:
/// on exhaustion, on explicit `close`, or on drop.
pub(crate) struct ShardStream {
    shard_id: ShardId,
    cursor: Box<dyn ShardCursor>,
    closed: bool,
    rows_read: u64,
}

impl ShardStream {
    pub(crate) fn new(shard_id: ShardId, cursor: Box<dyn ShardCursor>) -> Self {
        Self {
            shard_id,
            cursor,
            closed: false,
            rows_read: 0,
        }
    }

    pub(crate) fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub(crate) fn rows_read(&self) -> u64 {
        self.rows_read
    }

    pub(crate) fn cursor(&self) -> &dyn ShardCursor {
        self.cursor.as_ref()
    }

    /// Pull the next row. Closes the cursor once it reports exhaustion.
    pub(crate) fn advance(&mut self, labels: &Arc<ColumnLabels>) -> MergeResult<Option<Row>> {
        if self.closed {
            return Ok(None);
        }
        let has_row = self
            .cursor
            .next()
            .map_err(|e| MergeError::shard_io(self.shard_id, e))?;
        if !has_row {
            self.close()?;
            return Ok(None);
        }
        let row = Row::read_from(self.cursor.as_ref(), labels)
            .map_err(|e| MergeError::shard_io(self.shard_id, e))?;
        self.rows_read += 1;
        Ok(Some(row))
    }

    pub(crate) fn close(&mut self) -> MergeResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.cursor
            .close()
            .map_err(|e| MergeError::shard_io(self.shard_id, e))
    }
}

impl Drop for ShardStream {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(shard = %self.shard_id, "failed to close shard cursor: {}", e);
        }
    }
}

/// Materialized result of one shard: labels plus rows.
#[derive(Debug, Clone)]
pub struct ShardResult {
    pub shard_id: ShardId,
    pub columns: Vec<String>,
    pub rows: Vec<OwnedRow>,
}

/// Cursor over an already materialized [`ShardResult`].
#[derive(Debug)]
pub struct ShardResultCursor {
    result: ShardResult,
    /// Position of the current row + 1; 0 before the first `next`.
    position: usize,
    closed: bool,
}

impl ShardResultCursor {
    pub fn new(result: ShardResult) -> Self {
        Self {
            result,
            position: 0,
            closed: false,
        }
    }

    pub fn shard_id(&self) -> ShardId {
        self.result.shard_id
    }
}

impl ShardCursor for ShardResultCursor {
    fn next(&mut self) -> Result<bool, CursorError> {
        if self.closed {
            return Err(CursorError::Closed);
        }
        if self.position < self.result.rows.len() {
            self.position += 1;
            Ok(true)
        } else {
            self.position = self.result.rows.len() + 1;
            Ok(false)
        }
    }

    fn value(&self, index: usize) -> Result<Datum, CursorError> {
        let row = self
            .position
            .checked_sub(1)
            .and_then(|pos| self.result.rows.get(pos))
            .ok_or(CursorError::NoCurrentRow)?;
        index
            .checked_sub(1)
            .and_then(|pos| row.get(pos))
            .cloned()
            .ok_or(CursorError::ColumnOutOfBounds(index))
    }

    fn column_count(&self) -> usize {
        self.result.columns.len()
    }

    fn column_label(&self, index: usize) -> Result<String, CursorError> {
        index
            .checked_sub(1)
            .and_then(|pos| self.result.columns.get(pos))
            .cloned()
            .ok_or(CursorError::ColumnOutOfBounds(index))
    }

    fn close(&mut self) -> Result<(), CursorError> {
        self.closed = true;
        Ok(())
    }
}
