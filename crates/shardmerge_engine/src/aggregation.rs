//! Aggregation units: per-group accumulators for MAX, MIN, SUM, COUNT and
//! the derived AVG, plus the per-merge aggregation plan that feeds them.
//!
//! Every unit supports three operations:
//! - `merge`: fold one row's contribution
//! - `combine`: fold another unit of the same kind (map-phase partials)
//! - `result`: final value, NULL when nothing was merged

use std::cmp::Ordering;

use shardmerge_common::datum::{decimal_div, Datum};
use shardmerge_common::error::{ConfigError, MergeError, MergeResult, TypeError};

use crate::cursor::{ColumnLabels, Row};
use crate::keys::compare_values;
use crate::shape::{AggregationKind, AggregationProjection, CountMode};

/// Scale used for decimal AVG when no configuration is given.
pub const DEFAULT_AVG_SCALE: u8 = 4;

/// Running MAX or MIN.
#[derive(Debug, Clone)]
pub struct ExtremeUnit {
    keep: Ordering,
    value: Option<Datum>,
}

impl ExtremeUnit {
    pub fn max() -> Self {
        Self {
            keep: Ordering::Greater,
            value: None,
        }
    }

    pub fn min() -> Self {
        Self {
            keep: Ordering::Less,
            value: None,
        }
    }

    fn func(&self) -> &'static str {
        if self.keep == Ordering::Greater {
            "MAX"
        } else {
            "MIN"
        }
    }

    pub fn merge(&mut self, value: &Datum) -> MergeResult<()> {
        if value.is_null() {
            return Ok(());
        }
        match &self.value {
            None => self.value = Some(value.clone()),
            Some(current) => {
                let ord = compare_values(value, current).ok_or_else(|| TypeError::Incompatible {
                    func: self.func(),
                    left: current.type_name(),
                    right: value.type_name(),
                })?;
                if ord == self.keep {
                    self.value = Some(value.clone());
                }
            }
        }
        Ok(())
    }

    pub fn combine(&mut self, other: ExtremeUnit) -> MergeResult<()> {
        match other.value {
            Some(v) => self.merge(&v),
            None => Ok(()),
        }
    }

    pub fn result(&self) -> Datum {
        self.value.clone().unwrap_or(Datum::Null)
    }
}

/// Running SUM. Nulls are skipped.
#[derive(Debug, Clone, Default)]
pub struct SumUnit {
    sum: Option<Datum>,
}

impl SumUnit {
    pub fn new() -> Self {
        Self::default()
    }

    fn merge_as(&mut self, func: &'static str, value: &Datum) -> MergeResult<()> {
        if value.is_null() {
            return Ok(());
        }
        if !value.is_numeric() {
            return Err(TypeError::NotNumeric {
                func,
                got: value.type_name(),
            }
            .into());
        }
        let next = match &self.sum {
            None => value.clone(),
            Some(current) => match current.add(value) {
                Some(sum) => sum,
                // both sides are numeric, so only a decimal overflow lands here
                None if current.is_numeric() => {
                    return Err(TypeError::Overflow {
                        func,
                        ty: current.type_name(),
                    }
                    .into())
                }
                None => {
                    return Err(TypeError::Incompatible {
                        func,
                        left: current.type_name(),
                        right: value.type_name(),
                    }
                    .into())
                }
            },
        };
        self.sum = Some(next);
        Ok(())
    }

    pub fn merge(&mut self, value: &Datum) -> MergeResult<()> {
        self.merge_as("SUM", value)
    }

    pub fn combine(&mut self, other: SumUnit) -> MergeResult<()> {
        match other.sum {
            Some(v) => self.merge(&v),
            None => Ok(()),
        }
    }

    pub fn result(&self) -> Datum {
        match &self.sum {
            // Integer sums are reported at BIGINT width.
            Some(Datum::Int32(v)) => Datum::Int64(*v as i64),
            Some(v) => v.clone(),
            None => Datum::Null,
        }
    }
}

/// Running COUNT.
#[derive(Debug, Clone)]
pub struct CountUnit {
    mode: CountMode,
    count: i64,
    merges: u64,
}

impl CountUnit {
    pub fn new(mode: CountMode) -> Self {
        Self {
            mode,
            count: 0,
            merges: 0,
        }
    }

    pub fn merge(&mut self, value: &Datum) -> MergeResult<()> {
        self.merges += 1;
        match self.mode {
            CountMode::Star => self.count += 1,
            CountMode::NonNull => {
                if !value.is_null() {
                    self.count += 1;
                }
            }
            CountMode::Partial => {
                if !value.is_null() {
                    let partial = value.as_i64().ok_or_else(|| TypeError::NotNumeric {
                        func: "COUNT",
                        got: value.type_name(),
                    })?;
                    self.count += partial;
                }
            }
        }
        Ok(())
    }

    pub fn combine(&mut self, other: CountUnit) -> MergeResult<()> {
        self.count += other.count;
        self.merges += other.merges;
        Ok(())
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    pub fn result(&self) -> Datum {
        if self.merges == 0 {
            Datum::Null
        } else {
            Datum::Int64(self.count)
        }
    }
}

/// AVG recombined from shard-side SUM and COUNT columns.
#[derive(Debug, Clone)]
pub struct AvgUnit {
    sum: SumUnit,
    count: CountUnit,
    scale: u8,
}

impl AvgUnit {
    pub fn new(scale: u8) -> Self {
        Self {
            sum: SumUnit::new(),
            count: CountUnit::new(CountMode::Partial),
            scale,
        }
    }

    pub fn merge(&mut self, sum: &Datum, count: &Datum) -> MergeResult<()> {
        self.sum.merge_as("AVG", sum)?;
        self.count.merge(count)
    }

    pub fn combine(&mut self, other: AvgUnit) -> MergeResult<()> {
        self.sum.combine(other.sum)?;
        self.count.combine(other.count)
    }

    pub fn sum_result(&self) -> Datum {
        self.sum.result()
    }

    pub fn count_result(&self) -> Datum {
        self.count.result()
    }

    /// `sum / count`; NULL for an empty group or a zero count.
    pub fn result(&self) -> Datum {
        let count = self.count.count();
        if count == 0 {
            return Datum::Null;
        }
        match self.sum.result() {
            Datum::Null => Datum::Null,
            Datum::Decimal(m, s) => {
                decimal_div(m, s, count as i128, 0, self.scale).unwrap_or(Datum::Null)
            }
            sum => sum
                .as_f64()
                .map(|s| Datum::Float64(s / count as f64))
                .unwrap_or(Datum::Null),
        }
    }
}

/// A per-group accumulator for one aggregation projection.
#[derive(Debug, Clone)]
pub enum AggregationUnit {
    Max(ExtremeUnit),
    Min(ExtremeUnit),
    Sum(SumUnit),
    Count(CountUnit),
    Avg(AvgUnit),
}

/// Create a unit with default settings (COUNT(expr), decimal AVG scale 4).
pub fn new_aggregation_unit(kind: AggregationKind) -> AggregationUnit {
    AggregationUnit::new(kind, CountMode::default(), DEFAULT_AVG_SCALE)
}

impl AggregationUnit {
    pub fn new(kind: AggregationKind, count_mode: CountMode, avg_scale: u8) -> Self {
        match kind {
            AggregationKind::Max => AggregationUnit::Max(ExtremeUnit::max()),
            AggregationKind::Min => AggregationUnit::Min(ExtremeUnit::min()),
            AggregationKind::Sum => AggregationUnit::Sum(SumUnit::new()),
            AggregationKind::Count => AggregationUnit::Count(CountUnit::new(count_mode)),
            AggregationKind::Avg => AggregationUnit::Avg(AvgUnit::new(avg_scale)),
        }
    }

    pub fn kind(&self) -> AggregationKind {
        match self {
            AggregationUnit::Max(_) => AggregationKind::Max,
            AggregationUnit::Min(_) => AggregationKind::Min,
            AggregationUnit::Sum(_) => AggregationKind::Sum,
            AggregationUnit::Count(_) => AggregationKind::Count,
            AggregationUnit::Avg(_) => AggregationKind::Avg,
        }
    }

    /// Fold one row's contribution: one value, or `[sum, count]` for AVG.
    pub fn merge(&mut self, values: &[&Datum]) -> MergeResult<()> {
        match (self, values) {
            (AggregationUnit::Max(u) | AggregationUnit::Min(u), [v]) => u.merge(v),
            (AggregationUnit::Sum(u), [v]) => u.merge(v),
            (AggregationUnit::Count(u), [v]) => u.merge(v),
            (AggregationUnit::Avg(u), [sum, count]) => u.merge(sum, count),
            (unit, values) => Err(MergeError::internal_bug(
                "E-AGG-001",
                format!("{} unit fed {} values", unit.kind(), values.len()),
                "AVG takes [sum, count]; every other kind takes one value",
            )),
        }
    }

    /// Fold another unit of the same kind into this one.
    pub fn combine(&mut self, other: AggregationUnit) -> MergeResult<()> {
        match (self, other) {
            (AggregationUnit::Max(a), AggregationUnit::Max(b)) => a.combine(b),
            (AggregationUnit::Min(a), AggregationUnit::Min(b)) => a.combine(b),
            (AggregationUnit::Sum(a), AggregationUnit::Sum(b)) => a.combine(b),
            (AggregationUnit::Count(a), AggregationUnit::Count(b)) => a.combine(b),
            (AggregationUnit::Avg(a), AggregationUnit::Avg(b)) => a.combine(b),
            (a, b) => Err(MergeError::internal_bug(
                "E-AGG-002",
                format!("cannot combine {} unit with {} unit", a.kind(), b.kind()),
                "units of one projection must share a kind",
            )),
        }
    }

    pub fn result(&self) -> Datum {
        match self {
            AggregationUnit::Max(u) | AggregationUnit::Min(u) => u.result(),
            AggregationUnit::Sum(u) => u.result(),
            AggregationUnit::Count(u) => u.result(),
            AggregationUnit::Avg(u) => u.result(),
        }
    }
}

/// An aggregation projection resolved against the merge's labels.
#[derive(Debug, Clone)]
struct ResolvedProjection {
    kind: AggregationKind,
    count_mode: CountMode,
    position: usize,
    derived: Vec<usize>,
}

/// Resolved aggregation projections of one merge.
#[derive(Debug, Clone)]
pub struct AggregationPlan {
    projections: Vec<ResolvedProjection>,
    avg_scale: u8,
}

impl AggregationPlan {
    pub fn new(
        labels: &ColumnLabels,
        projections: &[AggregationProjection],
        avg_scale: u8,
    ) -> Result<Self, ConfigError> {
        let projections = projections
            .iter()
            .map(|p| {
                let expected = if p.kind == AggregationKind::Avg { 2 } else { 0 };
                if p.derived.len() != expected {
                    return Err(ConfigError::InvalidProjection(format!(
                        "{}({}) expects {} derived columns, got {}",
                        p.kind,
                        p.column,
                        expected,
                        p.derived.len()
                    )));
                }
                Ok(ResolvedProjection {
                    kind: p.kind,
                    count_mode: p.count_mode,
                    position: labels.position(&p.column)?,
                    derived: p
                        .derived
                        .iter()
                        .map(|c| labels.position(c))
                        .collect::<Result<Vec<_>, _>>()?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            projections,
            avg_scale,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.projections.is_empty()
    }

    pub fn new_units(&self) -> Vec<AggregationUnit> {
        self.projections
            .iter()
            .map(|p| AggregationUnit::new(p.kind, p.count_mode, self.avg_scale))
            .collect()
    }

    /// Feed one row into a group's units (one unit per projection, same order).
    pub fn accumulate(&self, units: &mut [AggregationUnit], row: &Row) -> MergeResult<()> {
        for (projection, unit) in self.projections.iter().zip(units.iter_mut()) {
            if projection.derived.is_empty() {
                unit.merge(&[row.datum_at(projection.position)])?;
            } else {
                let inputs: Vec<&Datum> =
                    projection.derived.iter().map(|&pos| row.datum_at(pos)).collect();
                unit.merge(&inputs)?;
            }
        }
        Ok(())
    }

    /// Overwrite aggregate output columns (and AVG's derived SUM/COUNT
    /// columns) in `row` with the units' results.
    pub fn apply(&self, units: &[AggregationUnit], row: &mut Row) {
        for (projection, unit) in self.projections.iter().zip(units.iter()) {
            if let (AggregationUnit::Avg(avg), [sum_pos, count_pos]) =
                (unit, projection.derived.as_slice())
            {
                row.set(*sum_pos, avg.sum_result());
                row.set(*count_pos, avg.count_result());
            }
            row.set(projection.position, unit.result());
        }
    }
}

/// Accumulation state of one group: its representative row and units.
#[derive(Debug, Clone)]
pub(crate) struct GroupState {
    representative: Row,
    units: Vec<AggregationUnit>,
}

impl GroupState {
    /// Open a group with `row` as representative and its first contribution.
    pub(crate) fn start(plan: &AggregationPlan, row: Row) -> MergeResult<Self> {
        let mut units = plan.new_units();
        plan.accumulate(&mut units, &row)?;
        Ok(Self {
            representative: row,
            units,
        })
    }

    pub(crate) fn accumulate(&mut self, plan: &AggregationPlan, row: &Row) -> MergeResult<()> {
        plan.accumulate(&mut self.units, row)
    }

    /// Fold another partial state of the same group; keeps this representative.
    pub(crate) fn combine(&mut self, other: GroupState) -> MergeResult<()> {
        for (unit, other_unit) in self.units.iter_mut().zip(other.units) {
            unit.combine(other_unit)?;
        }
        Ok(())
    }

    pub(crate) fn set_representative(&mut self, row: Row) {
        self.representative = row;
    }

    pub(crate) fn finish(self, plan: &AggregationPlan) -> Row {
        let mut row = self.representative;
        plan.apply(&self.units, &mut row);
        row
    }
}
