//! The merged cursor facade over whichever strategy the engine selected.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use shardmerge_common::datum::{Datum, OwnedRow};
use shardmerge_common::error::{ConfigError, CursorError, MergeError, MergeResult};

use crate::cursor::{ColumnLabels, Row, ShardCursor};
use crate::shape::{ColumnRef, Pagination};

/// A lazily produced sequence of merged rows.
pub trait MergedStream: Send {
    /// Next merged row; `Ok(None)` once exhausted. After an error the stream
    /// stays exhausted.
    fn next_row(&mut self) -> MergeResult<Option<Row>>;

    /// Close every shard cursor still held. Idempotent.
    fn release(&mut self) -> MergeResult<()>;

    /// Distinct groups emitted so far (grouped strategies only).
    fn groups(&self) -> u64 {
        0
    }
}

/// Stream with no rows and no cursors.
pub(crate) struct EmptyStream;

impl MergedStream for EmptyStream {
    fn next_row(&mut self) -> MergeResult<Option<Row>> {
        Ok(None)
    }

    fn release(&mut self) -> MergeResult<()> {
        Ok(())
    }
}

/// Which merge strategy produced a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategyKind {
    Empty,
    Iteration,
    StreamOrder,
    StreamGroup,
    Memory,
}

impl MergeStrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategyKind::Empty => "empty",
            MergeStrategyKind::Iteration => "iteration",
            MergeStrategyKind::StreamOrder => "stream_order",
            MergeStrategyKind::StreamGroup => "stream_group",
            MergeStrategyKind::Memory => "memory",
        }
    }
}

impl fmt::Display for MergeStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observability snapshot of one merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeMetrics {
    pub strategy: MergeStrategyKind,
    pub shard_count: usize,
    /// Rows handed to the caller (after pagination).
    pub rows_emitted: u64,
    pub groups: u64,
    /// Memory strategy only: scan + local accumulation wall time.
    pub map_phase_us: u64,
    /// From construction until exhaustion, error or close.
    pub total_us: u64,
}

impl MergeMetrics {
    pub(crate) fn new(strategy: MergeStrategyKind, shard_count: usize) -> Self {
        Self {
            strategy,
            shard_count,
            rows_emitted: 0,
            groups: 0,
            map_phase_us: 0,
            total_us: 0,
        }
    }
}

/// The single output cursor of a merge.
///
/// Values are 1-based, like the shard cursors it was built from. Dropping
/// or closing it releases every shard cursor still open.
pub struct MergedCursor {
    stream: Box<dyn MergedStream>,
    labels: Arc<ColumnLabels>,
    current: Option<Row>,
    offset_remaining: usize,
    limit: Option<usize>,
    finished: bool,
    started: Instant,
    metrics: MergeMetrics,
}

impl MergedCursor {
    pub(crate) fn new(
        stream: Box<dyn MergedStream>,
        labels: Arc<ColumnLabels>,
        pagination: Option<Pagination>,
        metrics: MergeMetrics,
        started: Instant,
    ) -> Self {
        let pagination = pagination.unwrap_or_default();
        Self {
            stream,
            labels,
            current: None,
            offset_remaining: pagination.offset,
            limit: pagination.limit,
            finished: false,
            started,
            metrics,
        }
    }

    /// A cursor over nothing: the result of merging zero shard cursors.
    pub fn empty() -> Self {
        Self::new(
            Box::new(EmptyStream),
            Arc::new(ColumnLabels::default()),
            None,
            MergeMetrics::new(MergeStrategyKind::Empty, 0),
            Instant::now(),
        )
    }

    /// Advance to the next merged row.
    pub fn next(&mut self) -> MergeResult<bool> {
        self.current = None;
        if self.finished {
            return Ok(false);
        }
        if self.limit == Some(0) {
            self.finish(true)?;
            return Ok(false);
        }
        loop {
            let row = match self.stream.next_row() {
                Ok(Some(row)) => row,
                Ok(None) => {
                    self.finish(true)?;
                    return Ok(false);
                }
                Err(e) => {
                    if let Err(close_err) = self.finish(false) {
                        tracing::warn!("release after merge failure also failed: {}", close_err);
                    }
                    return Err(e);
                }
            };
            if self.offset_remaining > 0 {
                self.offset_remaining -= 1;
                continue;
            }
            self.current = Some(row);
            self.metrics.rows_emitted += 1;
            if let Some(limit) = self.limit.as_mut() {
                *limit -= 1;
            }
            return Ok(true);
        }
    }

    /// The current merged row.
    pub fn current(&self) -> MergeResult<&Row> {
        self.current
            .as_ref()
            .ok_or(MergeError::Cursor(CursorError::NoCurrentRow))
    }

    /// Value at 1-based `index` of the current row.
    pub fn value(&self, index: usize) -> MergeResult<&Datum> {
        self.current()?
            .value(index)
            .ok_or(MergeError::Cursor(CursorError::ColumnOutOfBounds(index)))
    }

    pub fn value_by_label(&self, label: &str) -> MergeResult<&Datum> {
        self.get(&ColumnRef::from(label))
    }

    pub fn get(&self, column: &ColumnRef) -> MergeResult<&Datum> {
        Ok(self.current()?.get(column)?)
    }

    pub fn column_count(&self) -> usize {
        self.labels.len()
    }

    /// Label of the 1-based column `index`.
    pub fn column_label(&self, index: usize) -> MergeResult<&str> {
        self.labels.label(index).ok_or_else(|| {
            ConfigError::ColumnOutOfBounds {
                index,
                column_count: self.labels.len(),
            }
            .into()
        })
    }

    pub fn labels(&self) -> &Arc<ColumnLabels> {
        &self.labels
    }

    pub fn strategy(&self) -> MergeStrategyKind {
        self.metrics.strategy
    }

    pub fn metrics(&self) -> MergeMetrics {
        let mut metrics = self.metrics;
        metrics.groups = self.stream.groups();
        if !self.finished {
            metrics.total_us = self.started.elapsed().as_micros() as u64;
        }
        metrics
    }

    /// Stop consuming: release every shard cursor still open.
    pub fn close(&mut self) -> MergeResult<()> {
        self.current = None;
        self.finish(true)
    }

    /// Drain the remaining rows.
    pub fn collect_rows(mut self) -> MergeResult<Vec<OwnedRow>> {
        let mut rows = Vec::new();
        while self.next()? {
            if let Some(row) = self.current.take() {
                rows.push(row.into_values());
            }
        }
        Ok(rows)
    }

    fn finish(&mut self, success: bool) -> MergeResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let released = self.stream.release();
        self.metrics.groups = self.stream.groups();
        self.metrics.total_us = self.started.elapsed().as_micros() as u64;
        let success = success && released.is_ok();
        shardmerge_observability::record_merge(
            self.metrics.strategy.as_str(),
            self.metrics.rows_emitted,
            self.metrics.total_us,
            success,
        );
        tracing::debug!(
            strategy = %self.metrics.strategy,
            shards = self.metrics.shard_count,
            rows = self.metrics.rows_emitted,
            groups = self.metrics.groups,
            total_us = self.metrics.total_us,
            success,
            "merge finished"
        );
        released
    }
}

impl Drop for MergedCursor {
    fn drop(&mut self) {
        if let Err(e) = self.finish(true) {
            tracing::warn!("failed to release shard cursors on drop: {}", e);
        }
    }
}

fn to_cursor_error(e: MergeError) -> CursorError {
    match e {
        MergeError::Cursor(e) => e,
        MergeError::ShardIo { source, .. } => source,
        other => CursorError::Io(other.to_string()),
    }
}

/// A merged result can itself be a shard of a further merge.
impl ShardCursor for MergedCursor {
    fn next(&mut self) -> Result<bool, CursorError> {
        MergedCursor::next(self).map_err(to_cursor_error)
    }

    fn value(&self, index: usize) -> Result<Datum, CursorError> {
        MergedCursor::value(self, index)
            .cloned()
            .map_err(to_cursor_error)
    }

    fn column_count(&self) -> usize {
        self.labels.len()
    }

    fn column_label(&self, index: usize) -> Result<String, CursorError> {
        self.labels
            .label(index)
            .map(str::to_string)
            .ok_or(CursorError::ColumnOutOfBounds(index))
    }

    fn close(&mut self) -> Result<(), CursorError> {
        MergedCursor::close(self).map_err(to_cursor_error)
    }
}
