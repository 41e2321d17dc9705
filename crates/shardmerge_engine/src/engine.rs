//! Merge entry point: validates the shard schemas against each other,
//! resolves the query shape, and picks a strategy.

use std::sync::Arc;
use std::time::Instant;

use shardmerge_common::config::MergeConfig;
use shardmerge_common::error::{ConfigError, MergeError, MergeResult};
use shardmerge_common::types::ShardId;

use crate::aggregation::AggregationPlan;
use crate::cursor::{ColumnLabels, ShardCursor, ShardStream};
use crate::keys::KeyExtractor;
use crate::memory::MemoryMerger;
use crate::merged::{MergeMetrics, MergeStrategyKind, MergedCursor, MergedStream};
use crate::shape::QueryShape;
use crate::stream::{IterationMerger, StreamGroupMerger, StreamOrderMerger};

/// Everything a strategy needs to interpret rows of one merge.
#[derive(Debug, Clone)]
pub(crate) struct MergeContext {
    pub(crate) labels: Arc<ColumnLabels>,
    pub(crate) extractor: KeyExtractor,
    pub(crate) plan: AggregationPlan,
}

/// Pick the strategy for a query shape over `shard_count` cursors.
pub fn select_strategy(shape: &QueryShape, shard_count: usize) -> MergeStrategyKind {
    if shard_count == 0 {
        return MergeStrategyKind::Empty;
    }
    match (shape.is_grouped(), shape.is_ordered(), shape.pre_sorted) {
        (true, _, true) => MergeStrategyKind::StreamGroup,
        (true, _, false) => MergeStrategyKind::Memory,
        (false, true, true) => MergeStrategyKind::StreamOrder,
        (false, true, false) => MergeStrategyKind::Memory,
        (false, false, _) => MergeStrategyKind::Iteration,
    }
}

/// Merges per-shard cursors of one logical query into one result.
#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    config: MergeConfig,
}

impl MergeEngine {
    pub fn new(config: MergeConfig) -> MergeResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Merge cursors, identifying shards by their position.
    pub fn merge(
        &self,
        cursors: Vec<Box<dyn ShardCursor>>,
        shape: &QueryShape,
    ) -> MergeResult<MergedCursor> {
        let cursors = cursors
            .into_iter()
            .enumerate()
            .map(|(i, cursor)| (ShardId(i as u64), cursor))
            .collect();
        self.merge_shards(cursors, shape)
    }

    /// Merge cursors of the given shards. Takes ownership of every cursor:
    /// each is closed exactly once, whether the merge succeeds, fails, or is
    /// abandoned by the caller.
    pub fn merge_shards(
        &self,
        cursors: Vec<(ShardId, Box<dyn ShardCursor>)>,
        shape: &QueryShape,
    ) -> MergeResult<MergedCursor> {
        let started = Instant::now();
        let shard_count = cursors.len();
        let kind = select_strategy(shape, shard_count);
        if kind == MergeStrategyKind::Empty {
            return Ok(MergedCursor::empty());
        }
        let streams: Vec<ShardStream> = cursors
            .into_iter()
            .map(|(shard_id, cursor)| ShardStream::new(shard_id, cursor))
            .collect();

        // Any early return from here on drops the streams, closing the cursors.
        let labels = Arc::new(resolve_labels(&streams)?);
        let ctx = MergeContext {
            extractor: KeyExtractor::new(
                &labels,
                &shape.group_items,
                &shape.order_items,
                self.config.null_ordering,
            )?,
            plan: AggregationPlan::new(
                &labels,
                &shape.aggregations,
                self.config.avg_decimal_scale,
            )?,
            labels: labels.clone(),
        };

        tracing::debug!(
            strategy = %kind,
            shards = shard_count,
            grouped = shape.is_grouped(),
            ordered = shape.is_ordered(),
            pre_sorted = shape.pre_sorted,
            "selected merge strategy"
        );
        let mut metrics = MergeMetrics::new(kind, shard_count);

        let stream: Box<dyn MergedStream> = match kind {
            MergeStrategyKind::Empty => {
                return Err(MergeError::internal_bug(
                    "E-ENGINE-002",
                    "empty strategy selected for non-empty input",
                    format!("shards={}", shard_count),
                ))
            }
            MergeStrategyKind::Iteration => Box::new(IterationMerger::new(streams, labels.clone())),
            MergeStrategyKind::StreamOrder => Box::new(StreamOrderMerger::new(streams, ctx)),
            MergeStrategyKind::StreamGroup => Box::new(StreamGroupMerger::new(streams, ctx)),
            MergeStrategyKind::Memory => {
                let merger = MemoryMerger::new(
                    &ctx,
                    self.config.effective_map_workers(shard_count),
                    self.config.max_rows_buffered,
                    shape.is_grouped(),
                );
                match merger.run(streams) {
                    Ok((rows, map_phase_us)) => {
                        metrics.map_phase_us = map_phase_us;
                        Box::new(rows)
                    }
                    Err(e) => {
                        shardmerge_observability::record_merge(
                            kind.as_str(),
                            0,
                            started.elapsed().as_micros() as u64,
                            false,
                        );
                        tracing::warn!(strategy = %kind, shards = shard_count, "merge failed: {}", e);
                        return Err(e);
                    }
                }
            }
        };

        Ok(MergedCursor::new(
            stream,
            labels,
            shape.pagination,
            metrics,
            started,
        ))
    }
}

/// Labels of the first cursor; every other cursor must agree on count and
/// (case-insensitively) on names.
fn resolve_labels(streams: &[ShardStream]) -> MergeResult<ColumnLabels> {
    let read = |stream: &ShardStream| {
        ColumnLabels::from_cursor(stream.cursor())
            .map_err(|e| MergeError::shard_io(stream.shard_id(), e))
    };
    let Some((first_stream, rest)) = streams.split_first() else {
        return Err(MergeError::internal_bug(
            "E-ENGINE-001",
            "label resolution over zero cursors",
            "empty input is handled before schema checks",
        ));
    };
    let first = read(first_stream)?;
    for stream in rest {
        let labels = read(stream)?;
        if !first.matches(&labels) {
            return Err(ConfigError::SchemaMismatch {
                shard_id: stream.shard_id(),
                reason: format!(
                    "{} columns differ from the {} columns of {}",
                    labels.len(),
                    first.len(),
                    first_stream.shard_id()
                ),
            }
            .into());
        }
    }
    Ok(first)
}
