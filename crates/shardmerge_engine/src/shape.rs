//! Query-shape metadata handed over by the routing/rewriting layer.

use std::fmt;

/// Reference to a shard column: 1-based index or case-insensitive label.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnRef {
    Index(usize),
    Label(String),
}

impl From<usize> for ColumnRef {
    fn from(index: usize) -> Self {
        ColumnRef::Index(index)
    }
}

impl From<&str> for ColumnRef {
    fn from(label: &str) -> Self {
        ColumnRef::Label(label.to_string())
    }
}

impl From<String> for ColumnRef {
    fn from(label: String) -> Self {
        ColumnRef::Label(label)
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnRef::Index(i) => write!(f, "#{}", i),
            ColumnRef::Label(l) => write!(f, "{}", l),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// One GROUP BY item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupItem {
    pub column: ColumnRef,
}

impl GroupItem {
    pub fn new(column: impl Into<ColumnRef>) -> Self {
        Self {
            column: column.into(),
        }
    }
}

/// One ORDER BY item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderItem {
    pub column: ColumnRef,
    pub direction: Direction,
}

impl OrderItem {
    pub fn asc(column: impl Into<ColumnRef>) -> Self {
        Self {
            column: column.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(column: impl Into<ColumnRef>) -> Self {
        Self {
            column: column.into(),
            direction: Direction::Desc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregationKind {
    Max,
    Min,
    Sum,
    Count,
    Avg,
}

impl AggregationKind {
    pub fn name(&self) -> &'static str {
        match self {
            AggregationKind::Max => "MAX",
            AggregationKind::Min => "MIN",
            AggregationKind::Sum => "SUM",
            AggregationKind::Count => "COUNT",
            AggregationKind::Avg => "AVG",
        }
    }
}

impl fmt::Display for AggregationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How COUNT folds the values it is fed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CountMode {
    /// Count merges whose value is non-null: COUNT(expr).
    #[default]
    NonNull,
    /// Count every merge: COUNT(*).
    Star,
    /// The value is a count already computed by the shard; add it up.
    Partial,
}

/// One aggregate output column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationProjection {
    pub kind: AggregationKind,
    /// Output column the merged result is written to.
    pub column: ColumnRef,
    /// Hidden shard-computed columns feeding a composite aggregate.
    /// AVG: `[sum, count]`. Empty for every other kind.
    pub derived: Vec<ColumnRef>,
    pub count_mode: CountMode,
}

impl AggregationProjection {
    fn simple(kind: AggregationKind, column: impl Into<ColumnRef>) -> Self {
        Self {
            kind,
            column: column.into(),
            derived: Vec::new(),
            count_mode: CountMode::default(),
        }
    }

    pub fn max(column: impl Into<ColumnRef>) -> Self {
        Self::simple(AggregationKind::Max, column)
    }

    pub fn min(column: impl Into<ColumnRef>) -> Self {
        Self::simple(AggregationKind::Min, column)
    }

    pub fn sum(column: impl Into<ColumnRef>) -> Self {
        Self::simple(AggregationKind::Sum, column)
    }

    /// COUNT(expr): non-null values.
    pub fn count(column: impl Into<ColumnRef>) -> Self {
        Self::simple(AggregationKind::Count, column)
    }

    pub fn count_with_mode(column: impl Into<ColumnRef>, mode: CountMode) -> Self {
        Self {
            count_mode: mode,
            ..Self::simple(AggregationKind::Count, column)
        }
    }

    /// AVG decomposed into shard-side SUM and COUNT columns.
    pub fn avg(
        column: impl Into<ColumnRef>,
        sum: impl Into<ColumnRef>,
        count: impl Into<ColumnRef>,
    ) -> Self {
        Self {
            derived: vec![sum.into(), count.into()],
            ..Self::simple(AggregationKind::Avg, column)
        }
    }
}

/// OFFSET / LIMIT applied to the merged output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pagination {
    pub offset: usize,
    pub limit: Option<usize>,
}

impl Pagination {
    pub fn new(offset: usize, limit: Option<usize>) -> Self {
        Self { offset, limit }
    }
}

/// Everything the engine needs to know about the logical query.
#[derive(Debug, Clone, Default)]
pub struct QueryShape {
    pub group_items: Vec<GroupItem>,
    pub order_items: Vec<OrderItem>,
    pub aggregations: Vec<AggregationProjection>,
    /// Every shard cursor is already sorted on the order key (and rows of one
    /// group are contiguous). Selects the stream strategy. Not verified.
    pub pre_sorted: bool,
    pub pagination: Option<Pagination>,
}

impl QueryShape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group_by(mut self, column: impl Into<ColumnRef>) -> Self {
        self.group_items.push(GroupItem::new(column));
        self
    }

    pub fn order_by(mut self, item: OrderItem) -> Self {
        self.order_items.push(item);
        self
    }

    pub fn aggregate(mut self, projection: AggregationProjection) -> Self {
        self.aggregations.push(projection);
        self
    }

    pub fn pre_sorted(mut self, pre_sorted: bool) -> Self {
        self.pre_sorted = pre_sorted;
        self
    }

    pub fn paginate(mut self, offset: usize, limit: Option<usize>) -> Self {
        self.pagination = Some(Pagination::new(offset, limit));
        self
    }

    /// Rows collapse into groups: GROUP BY present or any aggregate present.
    pub fn is_grouped(&self) -> bool {
        !self.group_items.is_empty() || !self.aggregations.is_empty()
    }

    pub fn is_ordered(&self) -> bool {
        !self.order_items.is_empty()
    }
}
