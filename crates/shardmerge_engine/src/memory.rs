//! Memory merge strategy: scan every shard cursor to exhaustion on a pool of
//! scoped worker threads (map), fold the per-shard partials together (reduce),
//! then stable-sort the merged rows.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use shardmerge_common::error::{ErrorKind, MergeError, MergeResult};

use crate::aggregation::GroupState;
use crate::cursor::{Row, ShardStream};
use crate::engine::MergeContext;
use crate::keys::GroupKey;
use crate::merged::MergedStream;

/// Result of scanning one shard.
enum MapOutput {
    /// Group states in first-seen order.
    Groups(Vec<(GroupKey, GroupState)>),
    Rows(Vec<Row>),
}

/// Shared state of one map phase.
struct MapPhase {
    queue: Mutex<VecDeque<(usize, ShardStream)>>,
    outputs: Mutex<Vec<(usize, MapOutput)>>,
    first_error: Mutex<Option<MergeError>>,
    cancelled: AtomicBool,
    buffered: AtomicUsize,
}

impl MapPhase {
    /// Keep the first failure and tell every other task to stop.
    fn fail(&self, err: MergeError) {
        {
            let mut slot = self.first_error.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

pub(crate) struct MemoryMerger<'a> {
    ctx: &'a MergeContext,
    workers: usize,
    /// 0 = unlimited.
    max_rows_buffered: usize,
    grouped: bool,
}

impl<'a> MemoryMerger<'a> {
    pub(crate) fn new(
        ctx: &'a MergeContext,
        workers: usize,
        max_rows_buffered: usize,
        grouped: bool,
    ) -> Self {
        Self {
            ctx,
            workers: workers.max(1),
            max_rows_buffered,
            grouped,
        }
    }

    /// Run map and reduce. Returns the sorted rows and the map-phase latency.
    /// Every cursor is closed by the time this returns, on success or failure.
    pub(crate) fn run(&self, streams: Vec<ShardStream>) -> MergeResult<(MemoryMergedRows, u64)> {
        let shard_count = streams.len();
        let map_start = Instant::now();
        let phase = MapPhase {
            queue: Mutex::new(streams.into_iter().enumerate().collect()),
            outputs: Mutex::new(Vec::with_capacity(shard_count)),
            first_error: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            buffered: AtomicUsize::new(0),
        };

        std::thread::scope(|s| {
            let handles: Vec<_> = (0..self.workers)
                .map(|_| {
                    let phase = &phase;
                    s.spawn(move || self.map_worker(phase))
                })
                .collect();
            for handle in handles {
                if handle.join().is_err() {
                    phase.fail(MergeError::internal_bug(
                        "E-MAP-001",
                        "map worker panicked",
                        "std::thread::ScopedJoinHandle returned Err",
                    ));
                }
            }
        });

        let MapPhase {
            queue,
            outputs,
            first_error,
            buffered,
            ..
        } = phase;
        // Cursors never picked up because the phase was cancelled.
        for (_, mut stream) in queue.into_inner() {
            if let Err(e) = stream.close() {
                tracing::warn!(shard = %stream.shard_id(), "failed to close unscanned cursor: {}", e);
            }
        }
        let map_phase_us = map_start.elapsed().as_micros() as u64;
        let buffered = buffered.into_inner();
        shardmerge_observability::record_map_phase(shard_count, buffered, map_phase_us);

        if let Some(err) = first_error.into_inner() {
            return Err(err);
        }
        tracing::debug!(
            shards = shard_count,
            workers = self.workers,
            buffered,
            map_us = map_phase_us,
            "map phase complete"
        );

        let mut outputs = outputs.into_inner();
        outputs.sort_by_key(|(ordinal, _)| *ordinal);
        let rows = self.reduce(outputs)?;
        Ok((rows, map_phase_us))
    }

    fn map_worker(&self, phase: &MapPhase) {
        loop {
            if phase.is_cancelled() {
                return;
            }
            let next = phase.queue.lock().pop_front();
            let Some((ordinal, mut stream)) = next else {
                return;
            };
            match self.map_shard(&mut stream, phase) {
                Ok(output) => phase.outputs.lock().push((ordinal, output)),
                Err(e) => {
                    if e.kind() == ErrorKind::ShardIo {
                        tracing::warn!(shard = %stream.shard_id(), "map task failed: {}", e);
                        shardmerge_observability::record_shard_failure("map");
                    }
                    phase.fail(e);
                }
            }
            // Closes the cursor if the scan stopped early.
            drop(stream);
        }
    }

    fn map_shard(&self, stream: &mut ShardStream, phase: &MapPhase) -> MergeResult<MapOutput> {
        let labels = &self.ctx.labels;
        if self.grouped {
            let mut index: HashMap<GroupKey, usize> = HashMap::new();
            let mut groups: Vec<(GroupKey, GroupState)> = Vec::new();
            loop {
                self.check_cancelled(stream, phase)?;
                let Some(row) = stream.advance(labels)? else {
                    break;
                };
                let key = self.ctx.extractor.group_key(&row);
                match index.get(&key) {
                    Some(&i) => groups[i].1.accumulate(&self.ctx.plan, &row)?,
                    None => {
                        self.reserve(phase)?;
                        index.insert(key.clone(), groups.len());
                        groups.push((key, GroupState::start(&self.ctx.plan, row)?));
                    }
                }
            }
            Ok(MapOutput::Groups(groups))
        } else {
            let mut rows = Vec::new();
            loop {
                self.check_cancelled(stream, phase)?;
                let Some(row) = stream.advance(labels)? else {
                    break;
                };
                self.reserve(phase)?;
                rows.push(row);
            }
            Ok(MapOutput::Rows(rows))
        }
    }

    fn check_cancelled(&self, stream: &ShardStream, phase: &MapPhase) -> MergeResult<()> {
        if phase.is_cancelled() {
            return Err(MergeError::Cancelled(format!(
                "map task for {} stopped after {} rows",
                stream.shard_id(),
                stream.rows_read()
            )));
        }
        Ok(())
    }

    /// Count one more buffered group state or row against the limit.
    fn reserve(&self, phase: &MapPhase) -> MergeResult<()> {
        let total = phase.buffered.fetch_add(1, Ordering::Relaxed) + 1;
        if self.max_rows_buffered > 0 && total > self.max_rows_buffered {
            return Err(MergeError::transient(
                format!(
                    "memory merge exceeded max_rows_buffered ({})",
                    self.max_rows_buffered
                ),
                100,
            ));
        }
        Ok(())
    }

    /// Union per-shard outputs in shard order, combining identical groups,
    /// then stable-sort by the order key.
    fn reduce(&self, outputs: Vec<(usize, MapOutput)>) -> MergeResult<MemoryMergedRows> {
        let mut index: HashMap<GroupKey, usize> = HashMap::new();
        let mut states: Vec<GroupState> = Vec::new();
        let mut rows: Vec<Row> = Vec::new();
        for (_, output) in outputs {
            match output {
                MapOutput::Groups(groups) => {
                    for (key, state) in groups {
                        match index.get(&key) {
                            Some(&i) => states[i].combine(state)?,
                            None => {
                                index.insert(key, states.len());
                                states.push(state);
                            }
                        }
                    }
                }
                MapOutput::Rows(shard_rows) => rows.extend(shard_rows),
            }
        }

        let groups = states.len() as u64;
        if self.grouped {
            rows = states
                .into_iter()
                .map(|state| state.finish(&self.ctx.plan))
                .collect();
        }
        if self.ctx.extractor.has_order() {
            let extractor = &self.ctx.extractor;
            rows.sort_by(|a, b| extractor.compare(a, b));
        }
        Ok(MemoryMergedRows {
            rows: rows.into_iter(),
            groups,
        })
    }
}

/// Fully merged and sorted rows, handed out one at a time.
pub(crate) struct MemoryMergedRows {
    rows: std::vec::IntoIter<Row>,
    groups: u64,
}

impl MergedStream for MemoryMergedRows {
    fn next_row(&mut self) -> MergeResult<Option<Row>> {
        Ok(self.rows.next())
    }

    /// Cursors were closed by the map phase; only buffered rows remain.
    fn release(&mut self) -> MergeResult<()> {
        self.rows = Vec::new().into_iter();
        Ok(())
    }

    fn groups(&self) -> u64 {
        self.groups
    }
}
