//! Cross-shard result merging.
//!
//! The engine takes one open cursor per shard plus the query shape (group,
//! order, aggregations, pagination) and returns a single [`MergedCursor`].
//! Strategies:
//! - memory: parallel map over all cursors, reduce with `combine`, stable sort
//! - stream group / stream order: k-way heap merge over pre-sorted cursors
//! - iteration: plain concatenation when nothing is grouped or ordered

pub mod aggregation;
pub mod cursor;
pub mod engine;
pub mod keys;
mod memory;
pub mod merged;
pub mod shape;
mod stream;

pub use aggregation::{new_aggregation_unit, AggregationPlan, AggregationUnit};
pub use cursor::{ColumnLabels, Row, ShardCursor, ShardResult, ShardResultCursor};
pub use engine::{select_strategy, MergeEngine};
pub use keys::{compare_datums, compare_values, GroupKey, KeyExtractor, OrderKey};
pub use merged::{MergeMetrics, MergeStrategyKind, MergedCursor, MergedStream};
pub use shape::{
    AggregationKind, AggregationProjection, ColumnRef, CountMode, Direction, GroupItem, OrderItem,
    Pagination, QueryShape,
};
