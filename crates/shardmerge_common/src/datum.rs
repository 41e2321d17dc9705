use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::types::DataType;

/// A single scalar value read from a shard cursor.
/// Small enum, no heap allocation for fixed-size types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Text(String),
    Timestamp(i64), // microseconds since Unix epoch
    Date(i32),      // days since Unix epoch (1970-01-01)
    /// Fixed-point decimal: mantissa × 10^(-scale).
    /// e.g. Decimal(12345, 2) = 123.45
    Decimal(i128, u8),
    /// TIME without time zone: microseconds since midnight.
    Time(i64),
    Uuid(u128),
    Bytea(Vec<u8>),
}

impl Datum {
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Datum::Null => None,
            Datum::Boolean(_) => Some(DataType::Boolean),
            Datum::Int32(_) => Some(DataType::Int32),
            Datum::Int64(_) => Some(DataType::Int64),
            Datum::Float64(_) => Some(DataType::Float64),
            Datum::Text(_) => Some(DataType::Text),
            Datum::Timestamp(_) => Some(DataType::Timestamp),
            Datum::Date(_) => Some(DataType::Date),
            Datum::Decimal(_, scale) => Some(DataType::Decimal(38, *scale)),
            Datum::Time(_) => Some(DataType::Time),
            Datum::Uuid(_) => Some(DataType::Uuid),
            Datum::Bytea(_) => Some(DataType::Bytea),
        }
    }

    /// Type name for error messages; `NULL` for nulls.
    pub fn type_name(&self) -> String {
        self.data_type()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "NULL".to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn is_numeric(&self) -> bool {
        self.data_type().is_some_and(|t| t.is_numeric())
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int32(v) => Some(*v as i64),
            Datum::Int64(v) => Some(*v),
            Datum::Decimal(m, 0) => i64::try_from(*m).ok(),
            _ => None,
        }
    }

    /// The value as an i64 when it is an integral number of any numeric
    /// type: `Float64(3.0)` and `Decimal(300, 2)` both give 3.
    pub fn integral_i64(&self) -> Option<i64> {
        match self {
            Datum::Int32(v) => Some(*v as i64),
            Datum::Int64(v) => Some(*v),
            Datum::Float64(v) => {
                let in_range = *v >= i64::MIN as f64 && *v < i64::MAX as f64;
                (v.is_finite() && v.fract() == 0.0 && in_range).then_some(*v as i64)
            }
            Datum::Decimal(m, s) => match decimal_trim(*m, *s) {
                (m, 0) => i64::try_from(m).ok(),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Datum::Int32(v) => Some(*v as f64),
            Datum::Int64(v) => Some(*v as f64),
            Datum::Float64(v) => Some(*v),
            Datum::Decimal(m, s) => Some(*m as f64 / 10f64.powi(*s as i32)),
            _ => None,
        }
    }

    /// Try to add two datums (for SUM accumulation).
    ///
    /// Integer sums widen to Int64; an Int64 overflow is promoted to a
    /// scale-0 Decimal instead of wrapping. `None` for non-numeric operands
    /// and for decimal sums that overflow the 38-digit mantissa.
    pub fn add(&self, other: &Datum) -> Option<Datum> {
        match (self, other) {
            (Datum::Int32(a), Datum::Int32(b)) => Some(Datum::Int64(*a as i64 + *b as i64)),
            (Datum::Int64(a), Datum::Int64(b)) => Some(int64_add(*a, *b)),
            (Datum::Int64(a), Datum::Int32(b)) => Some(int64_add(*a, *b as i64)),
            (Datum::Int32(a), Datum::Int64(b)) => Some(int64_add(*a as i64, *b)),
            (Datum::Float64(a), Datum::Float64(b)) => Some(Datum::Float64(a + b)),
            (Datum::Float64(_), _) | (_, Datum::Float64(_)) => {
                Some(Datum::Float64(self.as_f64()? + other.as_f64()?))
            }
            (Datum::Decimal(a, sa), Datum::Decimal(b, sb)) => decimal_add(*a, *sa, *b, *sb),
            (Datum::Decimal(a, sa), Datum::Int64(_) | Datum::Int32(_)) => {
                decimal_add(*a, *sa, other.as_i64()? as i128, 0)
            }
            (Datum::Int64(_) | Datum::Int32(_), Datum::Decimal(b, sb)) => {
                decimal_add(self.as_i64()? as i128, 0, *b, *sb)
            }
            _ => None,
        }
    }
}

fn int64_add(a: i64, b: i64) -> Datum {
    match a.checked_add(b) {
        Some(v) => Datum::Int64(v),
        None => Datum::Decimal(a as i128 + b as i128, 0),
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Boolean(b) => write!(f, "{}", b),
            Datum::Int32(v) => write!(f, "{}", v),
            Datum::Int64(v) => write!(f, "{}", v),
            Datum::Float64(v) => write!(f, "{}", v),
            Datum::Text(s) => write!(f, "{}", s),
            Datum::Timestamp(us) => {
                let secs = us.div_euclid(1_000_000);
                let nsecs = (us.rem_euclid(1_000_000) * 1000) as u32;
                match chrono::DateTime::from_timestamp(secs, nsecs) {
                    Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
                    None => write!(f, "{}", us),
                }
            }
            Datum::Date(days) => {
                let epoch =
                    chrono::NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(chrono::NaiveDate::MIN);
                match epoch.checked_add_signed(chrono::Duration::days(*days as i64)) {
                    Some(d) => write!(f, "{}", d.format("%Y-%m-%d")),
                    None => write!(f, "{}", days),
                }
            }
            Datum::Decimal(m, s) => write!(f, "{}", decimal_to_string(*m, *s)),
            Datum::Time(us) => {
                let total_secs = *us / 1_000_000;
                let h = total_secs / 3600;
                let m = (total_secs % 3600) / 60;
                let s = total_secs % 60;
                let frac = *us % 1_000_000;
                if frac == 0 {
                    write!(f, "{:02}:{:02}:{:02}", h, m, s)
                } else {
                    write!(f, "{:02}:{:02}:{:02}.{:06}", h, m, s, frac)
                }
            }
            Datum::Uuid(v) => {
                let hex = format!("{:032x}", v);
                write!(
                    f,
                    "{}-{}-{}-{}-{}",
                    &hex[0..8],
                    &hex[8..12],
                    &hex[12..16],
                    &hex[16..20],
                    &hex[20..32]
                )
            }
            Datum::Bytea(bytes) => {
                write!(f, "\\x")?;
                for b in bytes {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Datum::Null, Datum::Null) => false, // NULL != NULL in SQL
            (Datum::Boolean(a), Datum::Boolean(b)) => a == b,
            (Datum::Int32(a), Datum::Int32(b)) => a == b,
            (Datum::Int64(a), Datum::Int64(b)) => a == b,
            (Datum::Int32(a), Datum::Int64(b)) => (*a as i64) == *b,
            (Datum::Int64(a), Datum::Int32(b)) => *a == (*b as i64),
            (Datum::Float64(a), Datum::Float64(b)) => a == b,
            (Datum::Float64(a), Datum::Int32(b)) => *a == (*b as f64),
            (Datum::Float64(a), Datum::Int64(b)) => *a == (*b as f64),
            (Datum::Int32(a), Datum::Float64(b)) => (*a as f64) == *b,
            (Datum::Int64(a), Datum::Float64(b)) => (*a as f64) == *b,
            (Datum::Text(a), Datum::Text(b)) => a == b,
            (Datum::Timestamp(a), Datum::Timestamp(b)) => a == b,
            (Datum::Date(a), Datum::Date(b)) => a == b,
            (Datum::Decimal(a, sa), Datum::Decimal(b, sb)) => {
                decimal_cmp(*a, *sa, *b, *sb) == Ordering::Equal
            }
            (Datum::Decimal(a, sa), Datum::Int64(b)) => {
                decimal_cmp(*a, *sa, *b as i128, 0) == Ordering::Equal
            }
            (Datum::Int64(a), Datum::Decimal(b, sb)) => {
                decimal_cmp(*a as i128, 0, *b, *sb) == Ordering::Equal
            }
            (Datum::Time(a), Datum::Time(b)) => a == b,
            (Datum::Uuid(a), Datum::Uuid(b)) => a == b,
            (Datum::Bytea(a), Datum::Bytea(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Datum {}

impl Hash for Datum {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Explicit type tags (NOT mem::discriminant): Int32(x) == Int64(x)
        // must produce the same hash, and so must integral floats and decimals.
        if let Some(v) = self.integral_i64() {
            2u8.hash(state);
            v.hash(state);
            return;
        }
        match self {
            Datum::Null => 0u8.hash(state),
            Datum::Boolean(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Datum::Int32(v) => {
                2u8.hash(state);
                (*v as i64).hash(state);
            }
            Datum::Int64(v) => {
                2u8.hash(state);
                v.hash(state);
            }
            Datum::Float64(v) => {
                3u8.hash(state);
                v.to_bits().hash(state);
            }
            Datum::Text(s) => {
                4u8.hash(state);
                s.hash(state);
            }
            Datum::Timestamp(us) => {
                5u8.hash(state);
                us.hash(state);
            }
            Datum::Date(days) => {
                6u8.hash(state);
                days.hash(state);
            }
            Datum::Decimal(m, s) => {
                7u8.hash(state);
                let (nm, ns) = decimal_trim(*m, *s);
                nm.hash(state);
                ns.hash(state);
            }
            Datum::Time(us) => {
                8u8.hash(state);
                us.hash(state);
            }
            Datum::Uuid(v) => {
                9u8.hash(state);
                v.hash(state);
            }
            Datum::Bytea(bytes) => {
                10u8.hash(state);
                bytes.hash(state);
            }
        }
    }
}

/// SQL ordering between two non-null values. `None` when either side is NULL
/// or the pair has no defined order (e.g. TEXT vs INT).
#[allow(clippy::non_canonical_partial_ord_impl)]
impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Datum::Null, _) | (_, Datum::Null) => None,
            (Datum::Boolean(a), Datum::Boolean(b)) => a.partial_cmp(b),
            (Datum::Int32(a), Datum::Int32(b)) => a.partial_cmp(b),
            (Datum::Int64(a), Datum::Int64(b)) => a.partial_cmp(b),
            (Datum::Int32(a), Datum::Int64(b)) => (*a as i64).partial_cmp(b),
            (Datum::Int64(a), Datum::Int32(b)) => a.partial_cmp(&(*b as i64)),
            (Datum::Float64(a), Datum::Float64(b)) => a.partial_cmp(b),
            (Datum::Float64(a), Datum::Int32(b)) => a.partial_cmp(&(*b as f64)),
            (Datum::Float64(a), Datum::Int64(b)) => a.partial_cmp(&(*b as f64)),
            (Datum::Int32(a), Datum::Float64(b)) => (*a as f64).partial_cmp(b),
            (Datum::Int64(a), Datum::Float64(b)) => (*a as f64).partial_cmp(b),
            (Datum::Text(a), Datum::Text(b)) => a.partial_cmp(b),
            (Datum::Timestamp(a), Datum::Timestamp(b)) => a.partial_cmp(b),
            (Datum::Date(a), Datum::Date(b)) => a.partial_cmp(b),
            (Datum::Decimal(a, sa), Datum::Decimal(b, sb)) => Some(decimal_cmp(*a, *sa, *b, *sb)),
            (Datum::Decimal(a, sa), Datum::Int64(_) | Datum::Int32(_)) => {
                Some(decimal_cmp(*a, *sa, other.as_i64()? as i128, 0))
            }
            (Datum::Int64(_) | Datum::Int32(_), Datum::Decimal(b, sb)) => {
                Some(decimal_cmp(self.as_i64()? as i128, 0, *b, *sb))
            }
            (Datum::Decimal(_, _), Datum::Float64(b)) => self.as_f64()?.partial_cmp(b),
            (Datum::Float64(a), Datum::Decimal(_, _)) => a.partial_cmp(&other.as_f64()?),
            (Datum::Time(a), Datum::Time(b)) => a.partial_cmp(b),
            (Datum::Uuid(a), Datum::Uuid(b)) => a.partial_cmp(b),
            (Datum::Bytea(a), Datum::Bytea(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl Ord for Datum {
    fn cmp(&self, other: &Self) -> Ordering {
        self.partial_cmp(other).unwrap_or(Ordering::Equal)
    }
}

/// A row is an ordered list of datums.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnedRow {
    pub values: Vec<Datum>,
}

impl OwnedRow {
    pub fn new(values: Vec<Datum>) -> Self {
        Self { values }
    }

    pub fn get(&self, idx: usize) -> Option<&Datum> {
        self.values.get(idx)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for OwnedRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

// ── Decimal helper functions ────────────────────────────────────────────

/// Convert a (mantissa, scale) decimal to its string representation.
/// e.g. (12345, 2) → "123.45", (-1, 3) → "-0.001", (100, 0) → "100"
pub fn decimal_to_string(mantissa: i128, scale: u8) -> String {
    if scale == 0 {
        return mantissa.to_string();
    }
    let negative = mantissa < 0;
    let s = mantissa.unsigned_abs().to_string();
    let scale = scale as usize;
    let result = if s.len() <= scale {
        format!("0.{}{}", "0".repeat(scale - s.len()), s)
    } else {
        let (int_part, frac_part) = s.split_at(s.len() - scale);
        format!("{}.{}", int_part, frac_part)
    };
    if negative {
        format!("-{}", result)
    } else {
        result
    }
}

/// Normalize two decimals to the same scale, returning (a_normalized, b_normalized).
/// `None` when rescaling the smaller-scale operand overflows i128.
fn decimal_normalize(a: i128, sa: u8, b: i128, sb: u8) -> Option<(i128, i128)> {
    if sa == sb {
        Some((a, b))
    } else if sa > sb {
        Some((a, b.checked_mul(10i128.checked_pow((sa - sb) as u32)?)?))
    } else {
        Some((a.checked_mul(10i128.checked_pow((sb - sa) as u32)?)?, b))
    }
}

/// Add two decimals, returning a Datum::Decimal with the larger scale.
fn decimal_add(a: i128, sa: u8, b: i128, sb: u8) -> Option<Datum> {
    let (na, nb) = decimal_normalize(a, sa, b, sb)?;
    Some(Datum::Decimal(na.checked_add(nb)?, sa.max(sb)))
}

/// Total order over decimals. When rescaling overflows, the rescaled
/// operand's magnitude exceeds the other's, so its sign decides.
fn decimal_cmp(a: i128, sa: u8, b: i128, sb: u8) -> Ordering {
    match decimal_normalize(a, sa, b, sb) {
        Some((na, nb)) => na.cmp(&nb),
        None if sa < sb => a.cmp(&0),
        None => 0.cmp(&b),
    }
}

/// Remove trailing zeros from a decimal for canonical form.
pub fn decimal_trim(mut mantissa: i128, mut scale: u8) -> (i128, u8) {
    if mantissa == 0 {
        return (0, 0);
    }
    while scale > 0 && mantissa % 10 == 0 {
        mantissa /= 10;
        scale -= 1;
    }
    (mantissa, scale)
}

/// Divide two decimals, rounding half away from zero at `result_scale`.
/// Returns `None` on division by zero.
pub fn decimal_div(a: i128, sa: u8, b: i128, sb: u8, result_scale: u8) -> Option<Datum> {
    if b == 0 {
        return None;
    }
    // a / 10^sa ÷ b / 10^sb = (a * 10^(rs + sb - sa)) / b / 10^rs, one extra digit for rounding
    let shift = result_scale as i32 + sb as i32 - sa as i32 + 1;
    let (num, den) = if shift >= 0 {
        (a.checked_mul(10i128.checked_pow(shift as u32)?)?, b)
    } else {
        (a, b.checked_mul(10i128.checked_pow((-shift) as u32)?)?)
    };
    let q = num / den;
    let rounded = if q >= 0 { (q + 5) / 10 } else { (q - 5) / 10 };
    Some(Datum::Decimal(rounded, result_scale))
}
