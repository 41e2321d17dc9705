mod common;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{int, render_all, text, TrackingCursor};
use shardmerge_common::config::{MergeConfig, NullOrdering};
use shardmerge_common::datum::Datum;
use shardmerge_common::error::{ConfigError, ErrorKind, MergeError};
use shardmerge_engine::{
    compare_datums, AggregationProjection, Direction, MergeEngine, MergeStrategyKind, OrderItem,
    QueryShape, ShardCursor,
};

const AGG_COLUMNS: [&str; 5] = ["k", "s", "mx", "mn", "c"];

/// Rows `[k, v, v, v, v]`; v is NULL for some rows.
fn shard_rows(shard: i64) -> Vec<Vec<Datum>> {
    (0..6)
        .map(|j| {
            let k = (shard + j) % 3;
            let v = if (shard * 6 + j) % 5 == 0 {
                Datum::Null
            } else {
                int(shard * 10 + j)
            };
            vec![int(k), v.clone(), v.clone(), v.clone(), v]
        })
        .collect()
}

fn sorted_shard_rows(shard: i64) -> Vec<Vec<Datum>> {
    let mut rows = shard_rows(shard);
    rows.sort_by_key(|r| r[0].as_i64());
    rows
}

fn aggregate_shape() -> QueryShape {
    QueryShape::new()
        .group_by("k")
        .aggregate(AggregationProjection::sum("s"))
        .aggregate(AggregationProjection::max("mx"))
        .aggregate(AggregationProjection::min("mn"))
        .aggregate(AggregationProjection::count("c"))
}

fn tracked(
    shards: Vec<TrackingCursor>,
) -> (Vec<Box<dyn ShardCursor>>, Vec<Arc<AtomicUsize>>) {
    let counters = shards.iter().map(|c| c.close_counter()).collect();
    (shards.into_iter().map(TrackingCursor::boxed).collect(), counters)
}

fn assert_closed_once(counters: &[Arc<AtomicUsize>]) {
    for (i, counter) in counters.iter().enumerate() {
        assert_eq!(counter.load(Ordering::SeqCst), 1, "cursor {} close count", i);
    }
}

#[test]
fn test_avg_recombined_from_derived_columns() {
    let columns = ["avg_v", "sum_v", "cnt_v"];
    for pre_sorted in [false, true] {
        let shards = vec![
            TrackingCursor::new(&columns, vec![vec![Datum::Float64(10.0), int(10), int(1)]]),
            TrackingCursor::new(&columns, vec![vec![Datum::Float64(25.0), int(50), int(2)]]),
        ];
        let (cursors, counters) = tracked(shards);
        let shape = QueryShape::new()
            .aggregate(AggregationProjection::avg("avg_v", "sum_v", "cnt_v"))
            .pre_sorted(pre_sorted);
        let rows = MergeEngine::default()
            .merge(cursors, &shape)
            .unwrap()
            .collect_rows()
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values[0], Datum::Float64(20.0));
        assert_eq!(rows[0].values[1], int(60));
        assert_eq!(rows[0].values[2], int(3));
        assert_closed_once(&counters);
    }
}

#[test]
fn test_order_by_desc_across_shards() {
    let columns = ["col1", "col2"];
    for pre_sorted in [false, true] {
        let (cursors, _) = tracked(vec![
            TrackingCursor::new(&columns, vec![vec![int(1), text("b")]]),
            TrackingCursor::new(&columns, vec![vec![int(2), text("a")]]),
            TrackingCursor::new(&columns, vec![vec![int(3), text("c")]]),
        ]);
        let shape = QueryShape::new()
            .order_by(OrderItem::desc("col2"))
            .pre_sorted(pre_sorted);
        let merged = MergeEngine::default().merge(cursors, &shape).unwrap();
        let expected_strategy = if pre_sorted {
            MergeStrategyKind::StreamOrder
        } else {
            MergeStrategyKind::Memory
        };
        assert_eq!(merged.strategy(), expected_strategy);
        let rows = render_all(&merged.collect_rows().unwrap());
        assert_eq!(
            rows,
            vec![vec!["3", "c"], vec!["1", "b"], vec!["2", "a"]]
        );
    }
}

#[test]
fn test_grouped_aggregates_match_concatenation() {
    // Fold the concatenated input directly.
    let mut expected: BTreeMap<i64, Vec<Option<i64>>> = BTreeMap::new();
    for shard in 0..4 {
        for row in shard_rows(shard) {
            let k = row[0].as_i64().unwrap_or_default();
            expected.entry(k).or_default().push(row[1].as_i64());
        }
    }

    let (cursors, counters) = tracked(
        (0..4)
            .map(|shard| TrackingCursor::new(&AGG_COLUMNS, shard_rows(shard)))
            .collect(),
    );
    let merged = MergeEngine::default()
        .merge(cursors, &aggregate_shape())
        .unwrap();
    assert_eq!(merged.strategy(), MergeStrategyKind::Memory);
    let rows = merged.collect_rows().unwrap();
    assert_closed_once(&counters);

    // One row per distinct group key, in group-key order.
    assert_eq!(rows.len(), expected.len());
    for (row, (k, values)) in rows.iter().zip(expected.iter()) {
        let non_null: Vec<i64> = values.iter().flatten().copied().collect();
        assert_eq!(row.values[0], int(*k));
        let check = |got: &Datum, want: Option<i64>| match want {
            Some(v) => assert_eq!(got, &int(v), "group {}", k),
            None => assert!(got.is_null(), "group {}", k),
        };
        let sum: Option<i64> = if non_null.is_empty() {
            None
        } else {
            Some(non_null.iter().sum())
        };
        check(&row.values[1], sum);
        check(&row.values[2], non_null.iter().max().copied());
        check(&row.values[3], non_null.iter().min().copied());
        assert_eq!(row.values[4], int(non_null.len() as i64));
    }
}

#[test]
fn test_stream_and_memory_agree_on_sorted_input() {
    let run = |pre_sorted: bool| {
        let (cursors, counters) = tracked(
            (0..5)
                .map(|shard| TrackingCursor::new(&AGG_COLUMNS, sorted_shard_rows(shard)))
                .collect(),
        );
        let merged = MergeEngine::default()
            .merge(cursors, &aggregate_shape().pre_sorted(pre_sorted))
            .unwrap();
        let rows = render_all(&merged.collect_rows().unwrap());
        assert_closed_once(&counters);
        rows
    };
    let memory = run(false);
    let stream = run(true);
    assert_eq!(memory.len(), 3);
    assert_eq!(memory, stream);
}

#[test]
fn test_map_failure_closes_every_cursor_once() {
    let config = MergeConfig {
        map_workers: 1,
        ..MergeConfig::default()
    };
    let engine = MergeEngine::new(config).unwrap();
    let mut shards = vec![TrackingCursor::new(&AGG_COLUMNS, shard_rows(0)).failing_after(2)];
    shards.extend((1..4).map(|s| TrackingCursor::new(&AGG_COLUMNS, shard_rows(s))));
    let (cursors, counters) = tracked(shards);

    let err = engine.merge(cursors, &aggregate_shape()).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::ShardIo);
    assert!(matches!(err, MergeError::ShardIo { .. }));
    assert_closed_once(&counters);
}

#[test]
fn test_map_failure_with_parallel_workers() {
    let mut shards: Vec<TrackingCursor> = (0..6)
        .map(|s| TrackingCursor::new(&AGG_COLUMNS, shard_rows(s)))
        .collect();
    shards.push(TrackingCursor::new(&AGG_COLUMNS, shard_rows(6)).failing_after(0));
    let (cursors, counters) = tracked(shards);

    let engine = MergeEngine::new(MergeConfig {
        map_workers: 4,
        ..MergeConfig::default()
    })
    .unwrap();
    let err = engine.merge(cursors, &aggregate_shape()).err().unwrap();
    // The injected failure is reported, never a follow-on cancellation.
    assert_eq!(err.kind(), ErrorKind::ShardIo);
    assert_closed_once(&counters);
}

#[test]
fn test_stream_failure_closes_every_cursor_once() {
    let mut shards = vec![TrackingCursor::new(&AGG_COLUMNS, sorted_shard_rows(0))];
    shards.push(TrackingCursor::new(&AGG_COLUMNS, sorted_shard_rows(1)).failing_after(3));
    let (cursors, counters) = tracked(shards);

    let mut merged = MergeEngine::default()
        .merge(cursors, &aggregate_shape().pre_sorted(true))
        .unwrap();
    let err = loop {
        match merged.next() {
            Ok(true) => continue,
            Ok(false) => panic!("merge finished despite injected failure"),
            Err(e) => break e,
        }
    };
    assert_eq!(err.kind(), ErrorKind::ShardIo);
    assert_closed_once(&counters);
    assert!(!merged.next().unwrap());
    drop(merged);
    assert_closed_once(&counters);
}

#[test]
fn test_empty_inputs() {
    let mut merged = MergeEngine::default()
        .merge(Vec::new(), &aggregate_shape())
        .unwrap();
    assert!(!merged.next().unwrap());

    let shapes = [
        aggregate_shape(),
        aggregate_shape().pre_sorted(true),
        QueryShape::new().order_by(OrderItem::asc("k")),
        QueryShape::new().order_by(OrderItem::asc("k")).pre_sorted(true),
        QueryShape::new(),
    ];
    for shape in shapes {
        let (cursors, counters) = tracked(
            (0..3)
                .map(|_| TrackingCursor::new(&AGG_COLUMNS, Vec::new()))
                .collect(),
        );
        let mut merged = MergeEngine::default().merge(cursors, &shape).unwrap();
        assert!(!merged.next().unwrap());
        assert_closed_once(&counters);
    }
}

#[test]
fn test_pagination_releases_cursors_at_limit() {
    let (cursors, counters) = tracked(
        (0..3)
            .map(|shard| {
                TrackingCursor::new(
                    &["id"],
                    (0..5).map(|i| vec![int(shard * 10 + i)]).collect(),
                )
            })
            .collect(),
    );
    let shape = QueryShape::new().paginate(2, Some(3));
    let mut merged = MergeEngine::default().merge(cursors, &shape).unwrap();
    assert_eq!(merged.strategy(), MergeStrategyKind::Iteration);

    let mut ids = Vec::new();
    while merged.next().unwrap() {
        ids.push(merged.value(1).unwrap().clone());
    }
    assert_eq!(ids, vec![int(2), int(3), int(4)]);
    assert_closed_once(&counters);
    assert_eq!(merged.metrics().rows_emitted, 3);
}

#[test]
fn test_null_ordering_follows_config() {
    let rows = |nulls: NullOrdering| {
        let (cursors, _) = tracked(vec![
            TrackingCursor::new(&["v"], vec![vec![int(2)], vec![Datum::Null]]),
            TrackingCursor::new(&["v"], vec![vec![int(1)]]),
        ]);
        let engine = MergeEngine::new(MergeConfig {
            null_ordering: nulls,
            ..MergeConfig::default()
        })
        .unwrap();
        let shape = QueryShape::new().order_by(OrderItem::asc("v"));
        render_all(&engine.merge(cursors, &shape).unwrap().collect_rows().unwrap())
    };
    assert_eq!(rows(NullOrdering::Low), vec![vec!["NULL"], vec!["1"], vec!["2"]]);
    assert_eq!(rows(NullOrdering::High), vec![vec!["1"], vec!["2"], vec!["NULL"]]);
}

#[test]
fn test_construction_errors_close_cursors() {
    let (cursors, counters) = tracked(vec![
        TrackingCursor::new(&["a", "b"], vec![vec![int(1), int(2)]]),
        TrackingCursor::new(&["a"], vec![vec![int(1)]]),
    ]);
    let err = MergeEngine::default()
        .merge(cursors, &QueryShape::new())
        .err()
        .unwrap();
    assert!(matches!(
        err,
        MergeError::Config(ConfigError::SchemaMismatch { .. })
    ));
    assert_closed_once(&counters);

    let (cursors, counters) = tracked(vec![TrackingCursor::new(&["a"], Vec::new())]);
    let err = MergeEngine::default()
        .merge(cursors, &QueryShape::new().group_by("region"))
        .err()
        .unwrap();
    assert!(matches!(
        err,
        MergeError::Config(ConfigError::UnknownColumn(_))
    ));
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_closed_once(&counters);
}

#[test]
fn test_sum_over_text_is_type_error() {
    let (cursors, counters) = tracked(vec![
        TrackingCursor::new(&["k", "s"], vec![vec![int(1), int(5)]]),
        TrackingCursor::new(&["k", "s"], vec![vec![int(1), text("oops")]]),
    ]);
    let shape = QueryShape::new()
        .group_by("k")
        .aggregate(AggregationProjection::sum("s"))
        .pre_sorted(true);
    let mut merged = MergeEngine::default().merge(cursors, &shape).unwrap();
    let err = merged.next().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Type);
    assert_closed_once(&counters);
}

#[test]
fn test_merged_cursor_feeds_a_further_merge() {
    let engine = MergeEngine::default();
    let shape = QueryShape::new()
        .group_by("k")
        .aggregate(AggregationProjection::sum("s"));
    let (inner_cursors, inner_counters) = tracked(vec![
        TrackingCursor::new(&["k", "s"], vec![vec![int(1), int(1)], vec![int(2), int(2)]]),
        TrackingCursor::new(&["k", "s"], vec![vec![int(1), int(10)]]),
    ]);
    let inner = engine.merge(inner_cursors, &shape).unwrap();
    let (mut outer_cursors, outer_counters) = tracked(vec![TrackingCursor::new(
        &["K", "S"],
        vec![vec![int(2), int(100)], vec![int(3), int(7)]],
    )]);
    outer_cursors.insert(0, Box::new(inner));

    let rows = render_all(&engine.merge(outer_cursors, &shape).unwrap().collect_rows().unwrap());
    assert_eq!(
        rows,
        vec![vec!["1", "11"], vec!["2", "102"], vec!["3", "7"]]
    );
    assert_closed_once(&inner_counters);
    assert_closed_once(&outer_counters);
}

#[test]
fn test_abandoned_merge_closes_every_cursor_once() {
    let shapes = [
        (aggregate_shape().pre_sorted(true), MergeStrategyKind::StreamGroup),
        (
            QueryShape::new().order_by(OrderItem::asc("k")).pre_sorted(true),
            MergeStrategyKind::StreamOrder,
        ),
        (aggregate_shape(), MergeStrategyKind::Memory),
        (QueryShape::new().order_by(OrderItem::asc("k")), MergeStrategyKind::Memory),
    ];
    for (shape, strategy) in shapes {
        for explicit_close in [false, true] {
            let (cursors, counters) = tracked(
                (0..4)
                    .map(|shard| TrackingCursor::new(&AGG_COLUMNS, sorted_shard_rows(shard)))
                    .collect(),
            );
            let mut merged = MergeEngine::default().merge(cursors, &shape).unwrap();
            assert_eq!(merged.strategy(), strategy);
            assert!(merged.next().unwrap());
            if strategy != MergeStrategyKind::Memory {
                // The heap strategies still hold open cursors after one row.
                assert!(counters.iter().any(|c| c.load(Ordering::SeqCst) == 0));
            }
            if explicit_close {
                merged.close().unwrap();
                assert_closed_once(&counters);
                assert!(!merged.next().unwrap());
            }
            drop(merged);
            assert_closed_once(&counters);
        }
    }
}

#[test]
fn test_decimal_sum_overflow_is_type_error() {
    let big = Datum::Decimal(90_000_000_000_000_000_000_000_000_000_000_000_000, 0);
    let shape = QueryShape::new()
        .group_by("k")
        .aggregate(AggregationProjection::sum("s"));

    let (cursors, counters) = tracked(
        (0..2)
            .map(|_| TrackingCursor::new(&["k", "s"], vec![vec![int(1), big.clone()]]))
            .collect(),
    );
    let err = MergeEngine::default().merge(cursors, &shape).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Type);
    assert_eq!(err.sqlstate(), "22003");
    assert_closed_once(&counters);

    let (cursors, counters) = tracked(
        (0..2)
            .map(|_| TrackingCursor::new(&["k", "s"], vec![vec![int(1), big.clone()]]))
            .collect(),
    );
    let mut merged = MergeEngine::default()
        .merge(cursors, &shape.pre_sorted(true))
        .unwrap();
    let err = merged.next().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Type);
    assert_closed_once(&counters);
}

#[test]
fn test_nan_sorts_after_finite_values() {
    let value = |i: usize| {
        if i % 7 == 0 {
            Datum::Float64(f64::NAN)
        } else {
            Datum::Float64(((i * 37) % 200) as f64 - 100.5)
        }
    };
    for pre_sorted in [false, true] {
        let shards: Vec<TrackingCursor> = (0..3)
            .map(|shard| {
                let mut rows: Vec<Vec<Datum>> =
                    (0..200).filter(|i| i % 3 == shard).map(|i| vec![value(i)]).collect();
                if pre_sorted {
                    rows.sort_by(|a, b| {
                        compare_datums(&a[0], &b[0], Direction::Asc, NullOrdering::Low)
                    });
                }
                TrackingCursor::new(&["v"], rows)
            })
            .collect();
        let (cursors, counters) = tracked(shards);
        let shape = QueryShape::new()
            .order_by(OrderItem::asc("v"))
            .pre_sorted(pre_sorted);
        let rows = MergeEngine::default()
            .merge(cursors, &shape)
            .unwrap()
            .collect_rows()
            .unwrap();
        assert_closed_once(&counters);

        let values: Vec<f64> = rows.iter().filter_map(|r| r.values[0].as_f64()).collect();
        assert_eq!(values.len(), 200);
        let nan_count = (0..200).filter(|i| i % 7 == 0).count();
        let (finite, nans) = values.split_at(200 - nan_count);
        assert!(finite.windows(2).all(|w| w[0] <= w[1]), "pre_sorted={}", pre_sorted);
        assert!(nans.iter().all(|v| v.is_nan()), "pre_sorted={}", pre_sorted);
    }
}

#[test]
fn test_integral_keys_of_mixed_numeric_types_form_one_group() {
    for pre_sorted in [false, true] {
        let (cursors, counters) = tracked(vec![
            TrackingCursor::new(&["k", "s"], vec![vec![int(1), int(1)], vec![int(2), int(5)]]),
            TrackingCursor::new(&["k", "s"], vec![vec![Datum::Float64(1.0), int(10)]]),
            TrackingCursor::new(&["k", "s"], vec![vec![Datum::Decimal(10, 1), int(100)]]),
        ]);
        let shape = QueryShape::new()
            .group_by("k")
            .aggregate(AggregationProjection::sum("s"))
            .pre_sorted(pre_sorted);
        let rows = MergeEngine::default()
            .merge(cursors, &shape)
            .unwrap()
            .collect_rows()
            .unwrap();
        assert_closed_once(&counters);
        assert_eq!(rows.len(), 2, "pre_sorted={}", pre_sorted);
        assert_eq!(rows[0].values[0].integral_i64(), Some(1));
        assert_eq!(rows[0].values[1], int(111));
        assert_eq!(rows[1].values[1], int(5));
    }
}
