//! Group/order key extraction.
//!
//! Column references are resolved once, at construction; extraction itself
//! cannot fail.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use shardmerge_common::config::NullOrdering;
use shardmerge_common::datum::{decimal_trim, Datum};
use shardmerge_common::error::ConfigError;

use crate::cursor::{ColumnLabels, Row};
use crate::shape::{Direction, GroupItem, OrderItem};

/// Grouping identity of a row.
///
/// Equality and hashing use a canonical binary encoding, so NULL groups with
/// NULL, Int32(n) with Int64(n), and 1.0 (scale 1) with 1.00 (scale 2).
#[derive(Debug, Clone)]
pub struct GroupKey {
    values: Vec<Datum>,
    encoded: Vec<u8>,
}

impl GroupKey {
    pub fn new(values: Vec<Datum>) -> Self {
        let encoded = encode_group_key(&values);
        Self { values, encoded }
    }

    pub fn values(&self) -> &[Datum] {
        &self.values
    }
}

impl PartialEq for GroupKey {
    fn eq(&self, other: &Self) -> bool {
        self.encoded == other.encoded
    }
}

impl Eq for GroupKey {}

impl Hash for GroupKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.encoded.hash(state);
    }
}

/// Encode key datums into a deterministic byte string.
/// Each datum is prefixed with a type tag byte, followed by its value bytes.
/// Integral numerics of any type share the integer tag, so `1`, `1.0` and
/// `1.00` are one group. Non-integral floats and decimals keep their own tags.
fn encode_group_key(values: &[Datum]) -> Vec<u8> {
    let mut key = Vec::with_capacity(values.len() * 9);
    for datum in values {
        if let Some(v) = datum.integral_i64() {
            key.push(2);
            key.extend_from_slice(&v.to_be_bytes());
            continue;
        }
        match datum {
            Datum::Null => key.push(0),
            Datum::Boolean(b) => {
                key.push(1);
                key.push(u8::from(*b));
            }
            // Int32 and Int64 share a tag so equal integers group together.
            Datum::Int32(v) => {
                key.push(2);
                key.extend_from_slice(&(*v as i64).to_be_bytes());
            }
            Datum::Int64(v) => {
                key.push(2);
                key.extend_from_slice(&v.to_be_bytes());
            }
            Datum::Float64(v) => {
                key.push(3);
                // -0.0 and 0.0 are one group.
                let v = if *v == 0.0 { 0.0f64 } else { *v };
                key.extend_from_slice(&v.to_bits().to_be_bytes());
            }
            Datum::Text(s) => {
                key.push(4);
                key.extend_from_slice(&(s.len() as u32).to_be_bytes());
                key.extend_from_slice(s.as_bytes());
            }
            Datum::Timestamp(v) => {
                key.push(5);
                key.extend_from_slice(&v.to_be_bytes());
            }
            Datum::Date(v) => {
                key.push(6);
                key.extend_from_slice(&v.to_be_bytes());
            }
            Datum::Decimal(m, s) => {
                let (m, s) = decimal_trim(*m, *s);
                key.push(7);
                key.push(s);
                key.extend_from_slice(&m.to_be_bytes());
            }
            Datum::Time(us) => {
                key.push(8);
                key.extend_from_slice(&us.to_be_bytes());
            }
            Datum::Uuid(v) => {
                key.push(9);
                key.extend_from_slice(&v.to_be_bytes());
            }
            Datum::Bytea(bytes) => {
                key.push(10);
                key.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                key.extend_from_slice(bytes);
            }
        }
    }
    key
}

/// One resolved ORDER BY component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortSpec {
    pub position: usize,
    pub direction: Direction,
}

/// Compare two datums for ORDER BY under a direction and null policy.
/// Pairs without a defined order compare equal.
pub fn compare_datums(
    a: &Datum,
    b: &Datum,
    direction: Direction,
    nulls: NullOrdering,
) -> Ordering {
    let ascending = match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => match nulls {
            NullOrdering::Low => Ordering::Less,
            NullOrdering::High => Ordering::Greater,
        },
        (false, true) => match nulls {
            NullOrdering::Low => Ordering::Greater,
            NullOrdering::High => Ordering::Less,
        },
        (false, false) => compare_values(a, b).unwrap_or(Ordering::Equal),
    };
    match direction {
        Direction::Asc => ascending,
        Direction::Desc => ascending.reverse(),
    }
}

/// SQL ordering of two non-null datums. NaN sorts above every other number
/// and equal to itself. `None` when the pair has no defined order.
pub fn compare_values(a: &Datum, b: &Datum) -> Option<Ordering> {
    let is_nan = |d: &Datum| matches!(d, Datum::Float64(v) if v.is_nan());
    match (is_nan(a), is_nan(b)) {
        (true, true) => Some(Ordering::Equal),
        (true, false) if b.is_numeric() => Some(Ordering::Greater),
        (false, true) if a.is_numeric() => Some(Ordering::Less),
        _ => a.partial_cmp(b),
    }
}

/// Ordering tuple of a row: (value, direction) pairs compared
/// lexicographically.
#[derive(Debug, Clone)]
pub struct OrderKey {
    values: Vec<Datum>,
    specs: Arc<[SortSpec]>,
    nulls: NullOrdering,
}

impl OrderKey {
    pub fn values(&self) -> &[Datum] {
        &self.values
    }
}

impl PartialEq for OrderKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderKey {}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for ((a, b), spec) in self
            .values
            .iter()
            .zip(other.values.iter())
            .zip(self.specs.iter())
        {
            let ord = compare_datums(a, b, spec.direction, self.nulls);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// Builds group and order keys for rows of one merge.
#[derive(Debug, Clone)]
pub struct KeyExtractor {
    group_positions: Vec<usize>,
    order_specs: Arc<[SortSpec]>,
    nulls: NullOrdering,
}

impl KeyExtractor {
    /// Resolve group and order items against the merge's labels. Without
    /// order items the group items (ascending) define the order.
    pub fn new(
        labels: &ColumnLabels,
        group_items: &[GroupItem],
        order_items: &[OrderItem],
        nulls: NullOrdering,
    ) -> Result<Self, ConfigError> {
        let group_positions = group_items
            .iter()
            .map(|item| labels.position(&item.column))
            .collect::<Result<Vec<_>, _>>()?;
        let order_specs: Vec<SortSpec> = if order_items.is_empty() {
            group_positions
                .iter()
                .map(|&position| SortSpec {
                    position,
                    direction: Direction::Asc,
                })
                .collect()
        } else {
            order_items
                .iter()
                .map(|item| {
                    Ok(SortSpec {
                        position: labels.position(&item.column)?,
                        direction: item.direction,
                    })
                })
                .collect::<Result<Vec<_>, ConfigError>>()?
        };
        Ok(Self {
            group_positions,
            order_specs: order_specs.into(),
            nulls,
        })
    }

    pub fn group_key(&self, row: &Row) -> GroupKey {
        GroupKey::new(
            self.group_positions
                .iter()
                .map(|&pos| row.datum_at(pos).clone())
                .collect(),
        )
    }

    pub fn order_key(&self, row: &Row) -> OrderKey {
        OrderKey {
            values: self
                .order_specs
                .iter()
                .map(|spec| row.datum_at(spec.position).clone())
                .collect(),
            specs: self.order_specs.clone(),
            nulls: self.nulls,
        }
    }

    /// Compare two rows by the order key without materializing it.
    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        for spec in self.order_specs.iter() {
            let ord = compare_datums(
                a.datum_at(spec.position),
                b.datum_at(spec.position),
                spec.direction,
                self.nulls,
            );
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    pub fn has_order(&self) -> bool {
        !self.order_specs.is_empty()
    }

    pub fn order_specs(&self) -> &[SortSpec] {
        &self.order_specs
    }
}
