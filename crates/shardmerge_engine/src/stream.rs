//! Stream merge strategies over cursors that are already sorted on the
//! order key: a k-way heap merge that folds contiguous groups, the same merge
//! emitting every row, and plain concatenation when nothing is ordered.
//!
//! All of them run on the caller's thread, one row per `next_row`.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use shardmerge_common::error::{ErrorKind, MergeError, MergeResult};

use crate::aggregation::GroupState;
use crate::cursor::{ColumnLabels, Row, ShardStream};
use crate::engine::MergeContext;
use crate::keys::{GroupKey, OrderKey};
use crate::merged::MergedStream;

/// Current front row of one cursor.
struct HeapEntry {
    order_key: OrderKey,
    group_key: GroupKey,
    row: Row,
    stream_idx: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    /// Order key first, shard position breaks ties.
    fn cmp(&self, other: &Self) -> Ordering {
        self.order_key
            .cmp(&other.order_key)
            .then_with(|| self.stream_idx.cmp(&other.stream_idx))
    }
}

/// Min-heap holding at most one front row per cursor.
struct CursorHeap {
    streams: Vec<ShardStream>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    ctx: MergeContext,
    primed: bool,
}

impl CursorHeap {
    fn new(streams: Vec<ShardStream>, ctx: MergeContext) -> Self {
        let capacity = streams.len();
        Self {
            streams,
            heap: BinaryHeap::with_capacity(capacity),
            ctx,
            primed: false,
        }
    }

    /// Load one row from every cursor; exhausted cursors close immediately.
    fn prime(&mut self) -> MergeResult<()> {
        if self.primed {
            return Ok(());
        }
        self.primed = true;
        for idx in 0..self.streams.len() {
            self.refill(idx)?;
        }
        Ok(())
    }

    /// Advance cursor `idx` and push its next row, if any.
    fn refill(&mut self, idx: usize) -> MergeResult<()> {
        let stream_count = self.streams.len();
        let Some(stream) = self.streams.get_mut(idx) else {
            return Err(MergeError::internal_bug(
                "E-HEAP-001",
                format!("refill of unknown stream {}", idx),
                format!("stream_count={}", stream_count),
            ));
        };
        let next = stream.advance(&self.ctx.labels).map_err(|e| {
            if e.kind() == ErrorKind::ShardIo {
                tracing::warn!(shard = %stream.shard_id(), "stream merge read failed: {}", e);
                shardmerge_observability::record_shard_failure("stream");
            }
            e
        })?;
        if let Some(row) = next {
            self.heap.push(Reverse(HeapEntry {
                order_key: self.ctx.extractor.order_key(&row),
                group_key: self.ctx.extractor.group_key(&row),
                row,
                stream_idx: idx,
            }));
        }
        Ok(())
    }

    /// Pop the front row and immediately replace it with its cursor's next.
    fn pop(&mut self) -> MergeResult<Option<HeapEntry>> {
        match self.heap.pop() {
            Some(Reverse(entry)) => {
                self.refill(entry.stream_idx)?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    fn peek(&self) -> Option<&HeapEntry> {
        self.heap.peek().map(|Reverse(entry)| entry)
    }

    fn release(&mut self) -> MergeResult<()> {
        self.heap.clear();
        close_streams(&mut self.streams)
    }
}

/// Close every cursor; reports the first failure after attempting all.
fn close_streams(streams: &mut [ShardStream]) -> MergeResult<()> {
    let mut first = None;
    for stream in streams.iter_mut() {
        if let Err(e) = stream.close() {
            tracing::warn!(shard = %stream.shard_id(), "failed to close cursor: {}", e);
            first.get_or_insert(e);
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Mark the stream done once it is exhausted or has failed. A failure
/// releases every cursor before it is returned.
fn settle<T>(
    result: MergeResult<Option<T>>,
    done: &mut bool,
    release: impl FnOnce() -> MergeResult<()>,
) -> MergeResult<Option<T>> {
    match result {
        Ok(Some(v)) => Ok(Some(v)),
        Ok(None) => {
            *done = true;
            Ok(None)
        }
        Err(e) => {
            *done = true;
            if let Err(close_err) = release() {
                tracing::warn!("release after stream merge failure also failed: {}", close_err);
            }
            Err(e)
        }
    }
}

/// GROUP BY / aggregate merge over pre-sorted cursors. Rows of one group
/// are contiguous in the merged order, so a group is complete as soon as the
/// heap front carries a different group key.
pub(crate) struct StreamGroupMerger {
    heap: CursorHeap,
    done: bool,
    groups: u64,
}

impl StreamGroupMerger {
    pub(crate) fn new(streams: Vec<ShardStream>, ctx: MergeContext) -> Self {
        Self {
            heap: CursorHeap::new(streams, ctx),
            done: false,
            groups: 0,
        }
    }

    fn next_group(&mut self) -> MergeResult<Option<Row>> {
        self.heap.prime()?;
        let Some(first) = self.heap.pop()? else {
            return Ok(None);
        };
        let key = first.group_key;
        let mut state = GroupState::start(&self.heap.ctx.plan, first.row)?;
        while self.heap.peek().map_or(false, |e| e.group_key == key) {
            let Some(entry) = self.heap.pop()? else {
                break;
            };
            state.accumulate(&self.heap.ctx.plan, &entry.row)?;
            state.set_representative(entry.row);
        }
        self.groups += 1;
        Ok(Some(state.finish(&self.heap.ctx.plan)))
    }
}

impl MergedStream for StreamGroupMerger {
    fn next_row(&mut self) -> MergeResult<Option<Row>> {
        if self.done {
            return Ok(None);
        }
        let result = self.next_group();
        settle(result, &mut self.done, || self.heap.release())
    }

    fn release(&mut self) -> MergeResult<()> {
        self.done = true;
        self.heap.release()
    }

    fn groups(&self) -> u64 {
        self.groups
    }
}

/// ORDER BY merge over pre-sorted cursors: every row, in merged order.
pub(crate) struct StreamOrderMerger {
    heap: CursorHeap,
    done: bool,
}

impl StreamOrderMerger {
    pub(crate) fn new(streams: Vec<ShardStream>, ctx: MergeContext) -> Self {
        Self {
            heap: CursorHeap::new(streams, ctx),
            done: false,
        }
    }

    fn next_entry(&mut self) -> MergeResult<Option<Row>> {
        self.heap.prime()?;
        Ok(self.heap.pop()?.map(|entry| entry.row))
    }
}

impl MergedStream for StreamOrderMerger {
    fn next_row(&mut self) -> MergeResult<Option<Row>> {
        if self.done {
            return Ok(None);
        }
        let result = self.next_entry();
        settle(result, &mut self.done, || self.heap.release())
    }

    fn release(&mut self) -> MergeResult<()> {
        self.done = true;
        self.heap.release()
    }
}

/// Concatenation of the cursors in shard order.
pub(crate) struct IterationMerger {
    streams: Vec<ShardStream>,
    labels: Arc<ColumnLabels>,
    position: usize,
    done: bool,
}

impl IterationMerger {
    pub(crate) fn new(streams: Vec<ShardStream>, labels: Arc<ColumnLabels>) -> Self {
        Self {
            streams,
            labels,
            position: 0,
            done: false,
        }
    }

    fn advance(&mut self) -> MergeResult<Option<Row>> {
        while let Some(stream) = self.streams.get_mut(self.position) {
            if let Some(row) = stream.advance(&self.labels)? {
                return Ok(Some(row));
            }
            self.position += 1;
        }
        Ok(None)
    }
}

impl MergedStream for IterationMerger {
    fn next_row(&mut self) -> MergeResult<Option<Row>> {
        if self.done {
            return Ok(None);
        }
        let result = self.advance();
        settle(result, &mut self.done, || close_streams(&mut self.streams))
    }

    fn release(&mut self) -> MergeResult<()> {
        self.done = true;
        close_streams(&mut self.streams)
    }
}
