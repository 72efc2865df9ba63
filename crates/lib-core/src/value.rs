//! Owned database values.
//!
//! `DbValue` is the unit of data the expression machinery operates on.
//! Values are owned and cheaply clonable; the evaluator borrows them
//! ("peek") wherever possible.

use std::hash::{Hash, Hasher};

use itertools::Itertools;

use crate::domain::{CoercionTarget, DbType, Domain, coercion_target};
use crate::errors::{Result, SquillError};
use crate::oid::Oid;

/// Exact decimal. `unscaled * 10^-scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Numeric {
    pub unscaled: i128,
    pub scale: u8,
}

impl Numeric {
    pub fn new(unscaled: i128, scale: u8) -> Numeric {
        Numeric { unscaled, scale }
    }

    pub fn to_f64(self) -> f64 {
        self.unscaled as f64 / 10f64.powi(self.scale as i32)
    }

    /// Bring both operands to a common scale for exact comparison.
    pub fn align(self, other: Numeric) -> (i128, i128) {
        use std::cmp::Ordering;
        match self.scale.cmp(&other.scale) {
            Ordering::Equal => (self.unscaled, other.unscaled),
            Ordering::Less => {
                let shift = 10i128.pow((other.scale - self.scale) as u32);
                (self.unscaled.saturating_mul(shift), other.unscaled)
            }
            Ordering::Greater => {
                let shift = 10i128.pow((self.scale - other.scale) as u32);
                (self.unscaled, other.unscaled.saturating_mul(shift))
            }
        }
    }

    pub fn parse(text: &str) -> Option<Numeric> {
        let text = text.trim();
        let (int_part, frac_part) = match text.split_once('.') {
            Some((i, f)) => (i, f),
            None => (text, ""),
        };
        if frac_part.len() > 38 {
            return None;
        }
        let negative = int_part.starts_with('-');
        let digits: String = int_part
            .trim_start_matches(['-', '+'])
            .chars()
            .chain(frac_part.chars())
            .collect();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let mut unscaled: i128 = digits.parse().ok()?;
        if negative {
            unscaled = -unscaled;
        }
        Some(Numeric::new(unscaled, frac_part.len() as u8))
    }
}

impl std::fmt::Display for Numeric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.unscaled);
        }
        let sign = if self.unscaled < 0 { "-" } else { "" };
        let abs = self.unscaled.unsigned_abs();
        let pow = 10u128.pow(self.scale as u32);
        write!(
            f,
            "{sign}{}.{:0width$}",
            abs / pow,
            abs % pow,
            width = self.scale as usize
        )
    }
}

/// Calendar date, stored as days since 1970-01-01.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DbDate(pub i32);

/// Time of day, seconds since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DbTime(pub u32);

/// Date plus time of day with millisecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DbDatetime {
    pub days: i32,
    pub millis: u32,
}

impl DbDatetime {
    pub fn to_unix_millis(self) -> i64 {
        self.days as i64 * 86_400_000 + self.millis as i64
    }
}

/// Days since 1970-01-01 for a civil date. Hinnant's algorithm.
pub fn days_from_civil(y: i32, m: u32, d: u32) -> i32 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u32;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe as i32 - 719_468
}

/// Inverse of [`days_from_civil`].
pub fn civil_from_days(z: i32) -> (i32, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i32 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m, d)
}

fn is_valid_civil(y: i32, m: u32, d: u32) -> bool {
    if !(1..=12).contains(&m) || d == 0 {
        return false;
    }
    let leap = (y % 4 == 0 && y % 100 != 0) || y % 400 == 0;
    let dim = match m {
        2 => {
            if leap {
                29
            } else {
                28
            }
        }
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    };
    d <= dim
}

pub fn parse_date(text: &str) -> Option<DbDate> {
    let mut parts = text.trim().splitn(3, '-');
    let y: i32 = parts.next()?.parse().ok()?;
    let m: u32 = parts.next()?.parse().ok()?;
    let d: u32 = parts.next()?.parse().ok()?;
    if !is_valid_civil(y, m, d) {
        return None;
    }
    Some(DbDate(days_from_civil(y, m, d)))
}

pub fn parse_time(text: &str) -> Option<DbTime> {
    let mut parts = text.trim().splitn(3, ':');
    let h: u32 = parts.next()?.parse().ok()?;
    let m: u32 = parts.next()?.parse().ok()?;
    let s: u32 = match parts.next() {
        Some(s) => s.parse().ok()?,
        None => 0,
    };
    if h > 23 || m > 59 || s > 59 {
        return None;
    }
    Some(DbTime(h * 3600 + m * 60 + s))
}

pub fn parse_datetime(text: &str) -> Option<DbDatetime> {
    let text = text.trim();
    let (date_part, time_part) = match text.split_once([' ', 'T']) {
        Some((d, t)) => (d, Some(t)),
        None => (text, None),
    };
    let date = parse_date(date_part)?;
    let millis = match time_part {
        None => 0,
        Some(t) => {
            let (hms, frac) = match t.split_once('.') {
                Some((hms, frac)) => (hms, Some(frac)),
                None => (t, None),
            };
            let secs = parse_time(hms)?.0;
            let ms: u32 = match frac {
                None => 0,
                Some(frac) => {
                    let frac = format!("{frac:0<3}");
                    frac.get(..3)?.parse().ok()?
                }
            };
            secs * 1000 + ms
        }
    };
    Some(DbDatetime {
        days: date.0,
        millis,
    })
}

pub fn format_date(d: DbDate) -> String {
    let (y, m, day) = civil_from_days(d.0);
    format!("{y:04}-{m:02}-{day:02}")
}

pub fn format_time(t: DbTime) -> String {
    format!("{:02}:{:02}:{:02}", t.0 / 3600, (t.0 / 60) % 60, t.0 % 60)
}

pub fn format_datetime(dt: DbDatetime) -> String {
    let date = format_date(DbDate(dt.days));
    let time = format_time(DbTime(dt.millis / 1000));
    if dt.millis % 1000 == 0 {
        format!("{date} {time}")
    } else {
        format!("{date} {time}.{:03}", dt.millis % 1000)
    }
}

/// Collection kind of a [`DbSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetKind {
    /// Duplicate-free, unordered.
    Set,
    /// Unordered with duplicates.
    Multiset,
    /// Ordered with duplicates.
    Sequence,
}

/// An owned collection value.
#[derive(Debug, Clone, PartialEq)]
pub struct DbSet {
    pub kind: SetKind,
    pub values: Vec<DbValue>,
}

impl DbSet {
    pub fn new(kind: SetKind, values: Vec<DbValue>) -> DbSet {
        DbSet { kind, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Handle to a materialized tuple list owned by the cursor engine.
/// Carries enough metadata for the evaluator to short-circuit on emptiness
/// and for holdable cursors to keep the backing files alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListId {
    pub id: u64,
    pub tuple_cnt: u64,
    pub sorted: bool,
}

impl ListId {
    pub fn new(id: u64) -> ListId {
        ListId {
            id,
            tuple_cnt: 0,
            sorted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum DbValue {
    #[default]
    Null,
    Short(i16),
    Int(i32),
    Bigint(i64),
    Float(f32),
    Double(f64),
    Numeric(Numeric),
    Char(String),
    Varchar(String),
    Bit(Vec<u8>),
    Varbit(Vec<u8>),
    Date(DbDate),
    Time(DbTime),
    Datetime(DbDatetime),
    Timestamp(i64),
    Set(DbSet),
    Oid(Oid),
}

impl DbValue {
    pub fn is_null(&self) -> bool {
        match self {
            DbValue::Null => true,
            // An uninitialized object reference reads as NULL.
            DbValue::Oid(oid) => oid.is_null(),
            _ => false,
        }
    }

    pub fn db_type(&self) -> DbType {
        match self {
            DbValue::Null => DbType::Null,
            DbValue::Short(_) => DbType::Short,
            DbValue::Int(_) => DbType::Int,
            DbValue::Bigint(_) => DbType::Bigint,
            DbValue::Float(_) => DbType::Float,
            DbValue::Double(_) => DbType::Double,
            DbValue::Numeric(_) => DbType::Numeric,
            DbValue::Char(_) => DbType::Char,
            DbValue::Varchar(_) => DbType::Varchar,
            DbValue::Bit(_) => DbType::Bit,
            DbValue::Varbit(_) => DbType::Varbit,
            DbValue::Date(_) => DbType::Date,
            DbValue::Time(_) => DbType::Time,
            DbValue::Datetime(_) => DbType::Datetime,
            DbValue::Timestamp(_) => DbType::Timestamp,
            DbValue::Set(s) => match s.kind {
                SetKind::Set => DbType::Set,
                SetKind::Multiset => DbType::Multiset,
                SetKind::Sequence => DbType::Sequence,
            },
            DbValue::Oid(_) => DbType::Oid,
        }
    }

    pub fn domain(&self) -> Domain {
        match self {
            DbValue::Numeric(n) => Domain::numeric(38, n.scale),
            DbValue::Char(s) | DbValue::Varchar(s) => {
                Domain::with_precision(self.db_type(), s.chars().count() as u16)
            }
            _ => Domain::new(self.db_type()),
        }
    }

    pub fn as_set(&self) -> Option<&DbSet> {
        match self {
            DbValue::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DbValue::Char(s) | DbValue::Varchar(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view as a double, when the value is in the numeric family.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DbValue::Short(v) => Some(*v as f64),
            DbValue::Int(v) => Some(*v as f64),
            DbValue::Bigint(v) => Some(*v as f64),
            DbValue::Float(v) => Some(*v as f64),
            DbValue::Double(v) => Some(*v),
            DbValue::Numeric(n) => Some(n.to_f64()),
            _ => None,
        }
    }

    /// Integral view, when the value is an exact integer type.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DbValue::Short(v) => Some(*v as i64),
            DbValue::Int(v) => Some(*v as i64),
            DbValue::Bigint(v) => Some(*v),
            _ => None,
        }
    }

    /// Text rendering used by the session dump and variable coercion.
    pub fn to_text(&self) -> String {
        match self {
            DbValue::Null => "NULL".to_owned(),
            DbValue::Short(v) => v.to_string(),
            DbValue::Int(v) => v.to_string(),
            DbValue::Bigint(v) => v.to_string(),
            DbValue::Float(v) => v.to_string(),
            DbValue::Double(v) => v.to_string(),
            DbValue::Numeric(n) => n.to_string(),
            DbValue::Char(s) | DbValue::Varchar(s) => s.clone(),
            DbValue::Bit(b) | DbValue::Varbit(b) => {
                let mut out = String::with_capacity(b.len() * 2 + 2);
                out.push_str("X'");
                for byte in b {
                    out.push_str(&format!("{byte:02X}"));
                }
                out.push('\'');
                out
            }
            DbValue::Date(d) => format_date(*d),
            DbValue::Time(t) => format_time(*t),
            DbValue::Datetime(dt) => format_datetime(*dt),
            DbValue::Timestamp(ts) => {
                let dt = DbDatetime {
                    days: ts.div_euclid(86_400) as i32,
                    millis: (ts.rem_euclid(86_400) * 1000) as u32,
                };
                format_datetime(dt)
            }
            DbValue::Set(s) => {
                format!("{{{}}}", s.values.iter().map(|v| v.to_text()).join(", "))
            }
            DbValue::Oid(oid) => oid.to_string(),
        }
    }

    /// Estimated in-memory footprint, used by the subquery cache size bound.
    pub fn memory_size(&self) -> usize {
        let inner = match self {
            DbValue::Char(s) | DbValue::Varchar(s) => s.len(),
            DbValue::Bit(b) | DbValue::Varbit(b) => b.len(),
            DbValue::Set(s) => s.values.iter().map(DbValue::memory_size).sum(),
            _ => 0,
        };
        std::mem::size_of::<DbValue>() + inner
    }
}

impl Hash for DbValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            DbValue::Null => {}
            DbValue::Short(v) => v.hash(state),
            DbValue::Int(v) => v.hash(state),
            DbValue::Bigint(v) => v.hash(state),
            DbValue::Float(v) => v.to_bits().hash(state),
            DbValue::Double(v) => v.to_bits().hash(state),
            DbValue::Numeric(n) => n.hash(state),
            DbValue::Char(s) | DbValue::Varchar(s) => s.hash(state),
            DbValue::Bit(b) | DbValue::Varbit(b) => b.hash(state),
            DbValue::Date(d) => d.hash(state),
            DbValue::Time(t) => t.hash(state),
            DbValue::Datetime(dt) => dt.hash(state),
            DbValue::Timestamp(ts) => ts.hash(state),
            DbValue::Set(s) => {
                s.kind.hash(state);
                // Order-insensitive for unordered kinds: XOR of item hashes.
                match s.kind {
                    SetKind::Sequence => {
                        for v in &s.values {
                            v.hash(state);
                        }
                    }
                    _ => {
                        let mut acc = 0u64;
                        for v in &s.values {
                            acc ^= value_hash(v);
                        }
                        acc.hash(state);
                    }
                }
            }
            DbValue::Oid(oid) => oid.hash(state),
        }
    }
}

/// Stable per-value hash. The hash of a key vector is the XOR of the
/// per-value hashes.
pub fn value_hash(value: &DbValue) -> u64 {
    let mut hasher = ahash::AHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Outcome of a domain-aware comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareResult {
    Lt,
    Eq,
    Gt,
    /// Values are not comparable (NULL involved, or incompatible domains).
    Unknown,
}

impl CompareResult {
    fn from_ordering(ord: std::cmp::Ordering) -> CompareResult {
        match ord {
            std::cmp::Ordering::Less => CompareResult::Lt,
            std::cmp::Ordering::Equal => CompareResult::Eq,
            std::cmp::Ordering::Greater => CompareResult::Gt,
        }
    }
}

/// Domain-aware value comparison.
///
/// With `total_order` set, NULL compares equal to NULL and precedes every
/// other value; otherwise any NULL operand yields `Unknown`. With
/// `coercion` set, operands of differing families are brought together per
/// the promotion table before comparing.
pub fn compare_values(
    a: &DbValue,
    b: &DbValue,
    coercion: bool,
    total_order: bool,
) -> CompareResult {
    if a.is_null() || b.is_null() {
        if !total_order {
            return CompareResult::Unknown;
        }
        return match (a.is_null(), b.is_null()) {
            (true, true) => CompareResult::Eq,
            (true, false) => CompareResult::Lt,
            (false, true) => CompareResult::Gt,
            _ => unreachable!(),
        };
    }

    match (a, b) {
        (DbValue::Char(x), DbValue::Char(y))
        | (DbValue::Char(x), DbValue::Varchar(y))
        | (DbValue::Varchar(x), DbValue::Char(y))
        | (DbValue::Varchar(x), DbValue::Varchar(y)) => {
            CompareResult::from_ordering(x.as_str().cmp(y.as_str()))
        }
        (DbValue::Bit(x), DbValue::Bit(y))
        | (DbValue::Bit(x), DbValue::Varbit(y))
        | (DbValue::Varbit(x), DbValue::Bit(y))
        | (DbValue::Varbit(x), DbValue::Varbit(y)) => {
            CompareResult::from_ordering(x.as_slice().cmp(y.as_slice()))
        }
        (DbValue::Oid(x), DbValue::Oid(y)) => CompareResult::from_ordering(x.cmp(y)),
        (DbValue::Set(x), DbValue::Set(y)) => compare_sets(x, y),
        _ if a.db_type().is_numeric() && b.db_type().is_numeric() => compare_numeric(a, b),
        _ if a.db_type().is_date_family() && b.db_type() == a.db_type() => {
            compare_same_date_family(a, b)
        }
        _ if coercion => {
            // Comparison coercion targets are unbounded: the precision of
            // the value at hand is incidental, not a declared limit.
            let unbounded = |mut domain: Domain| {
                if domain.db_type.is_char_family() {
                    domain.precision = 0;
                }
                domain
            };
            match coercion_target(a.domain(), b.domain()) {
                CoercionTarget::Rhs(domain) => match coerce_value(b, &unbounded(domain)) {
                    Ok(coerced) => compare_values(a, &coerced, false, total_order),
                    Err(_) => CompareResult::Unknown,
                },
                CoercionTarget::None => {
                    // Try the symmetric direction before giving up.
                    match coercion_target(b.domain(), a.domain()) {
                        CoercionTarget::Rhs(domain) => match coerce_value(a, &unbounded(domain)) {
                            Ok(coerced) => compare_values(&coerced, b, false, total_order),
                            Err(_) => CompareResult::Unknown,
                        },
                        CoercionTarget::None => CompareResult::Unknown,
                    }
                }
            }
        }
        _ => CompareResult::Unknown,
    }
}

fn compare_numeric(a: &DbValue, b: &DbValue) -> CompareResult {
    // Exact integer pairs stay exact.
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return CompareResult::from_ordering(x.cmp(&y));
    }
    if let (DbValue::Numeric(x), DbValue::Numeric(y)) = (a, b) {
        let (xa, ya) = x.align(*y);
        return CompareResult::from_ordering(xa.cmp(&ya));
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x
            .partial_cmp(&y)
            .map(CompareResult::from_ordering)
            .unwrap_or(CompareResult::Unknown),
        _ => CompareResult::Unknown,
    }
}

fn compare_same_date_family(a: &DbValue, b: &DbValue) -> CompareResult {
    let ord = match (a, b) {
        (DbValue::Date(x), DbValue::Date(y)) => x.cmp(y),
        (DbValue::Time(x), DbValue::Time(y)) => x.cmp(y),
        (DbValue::Datetime(x), DbValue::Datetime(y)) => x.cmp(y),
        (DbValue::Timestamp(x), DbValue::Timestamp(y)) => x.cmp(y),
        _ => return CompareResult::Unknown,
    };
    CompareResult::from_ordering(ord)
}

/// Multiset comparison: equality when each element occurs the same number
/// of times on both sides. Sequences compare element-wise in order.
/// Ordinal comparison between collections is not defined.
fn compare_sets(a: &DbSet, b: &DbSet) -> CompareResult {
    if a.kind == SetKind::Sequence && b.kind == SetKind::Sequence {
        if a.len() != b.len() {
            return CompareResult::Unknown;
        }
        for (x, y) in a.values.iter().zip(&b.values) {
            match compare_values(x, y, false, true) {
                CompareResult::Eq => continue,
                _ => return CompareResult::Unknown,
            }
        }
        return CompareResult::Eq;
    }
    if a.len() != b.len() {
        return CompareResult::Unknown;
    }
    let mut matched = vec![false; b.len()];
    for x in &a.values {
        let mut found = false;
        for (i, y) in b.values.iter().enumerate() {
            if !matched[i] && compare_values(x, y, false, true) == CompareResult::Eq {
                matched[i] = true;
                found = true;
                break;
            }
        }
        if !found {
            return CompareResult::Unknown;
        }
    }
    CompareResult::Eq
}

fn type_rank(value: &DbValue) -> u8 {
    match value {
        DbValue::Null => 0,
        DbValue::Short(_) | DbValue::Int(_) | DbValue::Bigint(_) => 1,
        DbValue::Float(_) | DbValue::Double(_) => 2,
        DbValue::Numeric(_) => 3,
        DbValue::Char(_) | DbValue::Varchar(_) => 4,
        DbValue::Bit(_) | DbValue::Varbit(_) => 5,
        DbValue::Date(_) => 6,
        DbValue::Time(_) => 7,
        DbValue::Datetime(_) => 8,
        DbValue::Timestamp(_) => 9,
        DbValue::Set(_) => 10,
        DbValue::Oid(_) => 11,
    }
}

/// An arbitrary but deterministic total order over values, consistent with
/// structural equality. Used where container invariants need *some* stable
/// order (sorted hash chains, in-memory sorts), not for SQL semantics.
pub fn total_cmp(a: &DbValue, b: &DbValue) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (DbValue::Null, DbValue::Null) => Ordering::Equal,
        (DbValue::Float(_) | DbValue::Double(_), _) => {
            let (x, y) = (a.as_f64().unwrap(), b.as_f64().unwrap());
            x.total_cmp(&y)
        }
        (DbValue::Numeric(x), DbValue::Numeric(y)) => {
            let (xa, ya) = x.align(*y);
            xa.cmp(&ya)
        }
        (DbValue::Char(x) | DbValue::Varchar(x), DbValue::Char(y) | DbValue::Varchar(y)) => {
            x.cmp(y)
        }
        (DbValue::Bit(x) | DbValue::Varbit(x), DbValue::Bit(y) | DbValue::Varbit(y)) => x.cmp(y),
        (DbValue::Date(x), DbValue::Date(y)) => x.cmp(y),
        (DbValue::Time(x), DbValue::Time(y)) => x.cmp(y),
        (DbValue::Datetime(x), DbValue::Datetime(y)) => x.cmp(y),
        (DbValue::Timestamp(x), DbValue::Timestamp(y)) => x.cmp(y),
        (DbValue::Set(x), DbValue::Set(y)) => {
            let len = x.len().cmp(&y.len());
            if len != Ordering::Equal {
                return len;
            }
            for (u, v) in x.values.iter().zip(&y.values) {
                let ord = total_cmp(u, v);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        }
        (DbValue::Oid(x), DbValue::Oid(y)) => x.cmp(y),
        _ => {
            // Same rank, different exact integer widths.
            match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => Ordering::Equal,
            }
        }
    }
}

/// Cast `value` into `target`. NULL casts to NULL in any domain.
pub fn coerce_value(value: &DbValue, target: &Domain) -> Result<DbValue> {
    if value.is_null() {
        return Ok(DbValue::Null);
    }
    let src = value.db_type();
    let dst = target.db_type;
    if src == dst && !src.is_char_family() {
        return Ok(value.clone());
    }

    match dst {
        DbType::Short => coerce_to_integral(value, i16::MIN as i64, i16::MAX as i64)
            .map(|v| DbValue::Short(v as i16)),
        DbType::Int => coerce_to_integral(value, i32::MIN as i64, i32::MAX as i64)
            .map(|v| DbValue::Int(v as i32)),
        DbType::Bigint => coerce_to_integral(value, i64::MIN, i64::MAX).map(DbValue::Bigint),
        DbType::Float => coerce_to_double(value).map(|v| DbValue::Float(v as f32)),
        DbType::Double => coerce_to_double(value).map(DbValue::Double),
        DbType::Numeric => match value {
            DbValue::Numeric(n) => Ok(DbValue::Numeric(*n)),
            DbValue::Short(_) | DbValue::Int(_) | DbValue::Bigint(_) => Ok(DbValue::Numeric(
                Numeric::new(value.as_i64().unwrap() as i128, 0),
            )),
            DbValue::Float(_) | DbValue::Double(_) => {
                let text = value.to_text();
                Numeric::parse(&text)
                    .map(DbValue::Numeric)
                    .ok_or(SquillError::DomainConflict(src, dst))
            }
            DbValue::Char(s) | DbValue::Varchar(s) => Numeric::parse(s)
                .map(DbValue::Numeric)
                .ok_or(SquillError::DomainConflict(src, dst)),
            _ => Err(SquillError::DomainConflict(src, dst)),
        },
        DbType::Char | DbType::Varchar => {
            let text = match value {
                DbValue::Char(s) | DbValue::Varchar(s) => s.clone(),
                DbValue::Set(_) | DbValue::Oid(_) => {
                    return Err(SquillError::DomainConflict(src, dst));
                }
                other => other.to_text(),
            };
            if target.precision > 0 && text.chars().count() > target.precision as usize {
                return Err(SquillError::StringOverflow(dst, target.precision));
            }
            Ok(match dst {
                DbType::Char => DbValue::Char(text),
                _ => DbValue::Varchar(text),
            })
        }
        DbType::Bit | DbType::Varbit => match value {
            DbValue::Bit(b) | DbValue::Varbit(b) => Ok(match dst {
                DbType::Bit => DbValue::Bit(b.clone()),
                _ => DbValue::Varbit(b.clone()),
            }),
            _ => Err(SquillError::DomainConflict(src, dst)),
        },
        DbType::Date => match value {
            DbValue::Date(d) => Ok(DbValue::Date(*d)),
            DbValue::Datetime(dt) => Ok(DbValue::Date(DbDate(dt.days))),
            DbValue::Char(s) | DbValue::Varchar(s) => parse_date(s)
                .map(DbValue::Date)
                .ok_or(SquillError::DomainConflict(src, dst)),
            _ => Err(SquillError::DomainConflict(src, dst)),
        },
        DbType::Time => match value {
            DbValue::Time(t) => Ok(DbValue::Time(*t)),
            DbValue::Char(s) | DbValue::Varchar(s) => parse_time(s)
                .map(DbValue::Time)
                .ok_or(SquillError::DomainConflict(src, dst)),
            _ => Err(SquillError::DomainConflict(src, dst)),
        },
        DbType::Datetime => match value {
            DbValue::Datetime(dt) => Ok(DbValue::Datetime(*dt)),
            DbValue::Date(d) => Ok(DbValue::Datetime(DbDatetime {
                days: d.0,
                millis: 0,
            })),
            DbValue::Timestamp(ts) => Ok(DbValue::Datetime(DbDatetime {
                days: ts.div_euclid(86_400) as i32,
                millis: (ts.rem_euclid(86_400) * 1000) as u32,
            })),
            DbValue::Char(s) | DbValue::Varchar(s) => parse_datetime(s)
                .map(DbValue::Datetime)
                .ok_or(SquillError::DomainConflict(src, dst)),
            _ => Err(SquillError::DomainConflict(src, dst)),
        },
        DbType::Timestamp => match value {
            DbValue::Timestamp(ts) => Ok(DbValue::Timestamp(*ts)),
            DbValue::Date(d) => Ok(DbValue::Timestamp(d.0 as i64 * 86_400)),
            DbValue::Datetime(dt) => Ok(DbValue::Timestamp(dt.to_unix_millis() / 1000)),
            DbValue::Char(s) | DbValue::Varchar(s) => parse_datetime(s)
                .map(|dt| DbValue::Timestamp(dt.to_unix_millis() / 1000))
                .ok_or(SquillError::DomainConflict(src, dst)),
            _ => Err(SquillError::DomainConflict(src, dst)),
        },
        DbType::Set | DbType::Multiset | DbType::Sequence => match value {
            DbValue::Set(s) => {
                let kind = match dst {
                    DbType::Set => SetKind::Set,
                    DbType::Multiset => SetKind::Multiset,
                    _ => SetKind::Sequence,
                };
                Ok(DbValue::Set(DbSet::new(kind, s.values.clone())))
            }
            _ => Err(SquillError::DomainConflict(src, dst)),
        },
        DbType::Oid | DbType::Null => Err(SquillError::DomainConflict(src, dst)),
    }
}

fn coerce_to_integral(value: &DbValue, min: i64, max: i64) -> Result<i64> {
    let src = value.db_type();
    let v = match value {
        DbValue::Short(_) | DbValue::Int(_) | DbValue::Bigint(_) => value.as_i64().unwrap(),
        DbValue::Float(f) => *f as i64,
        DbValue::Double(f) => *f as i64,
        DbValue::Numeric(n) => {
            let scaled = n.unscaled / 10i128.pow(n.scale as u32);
            i64::try_from(scaled).map_err(|_| SquillError::DomainConflict(src, DbType::Bigint))?
        }
        DbValue::Char(s) | DbValue::Varchar(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| SquillError::DomainConflict(src, DbType::Bigint))?,
        _ => return Err(SquillError::DomainConflict(src, DbType::Bigint)),
    };
    if v < min || v > max {
        return Err(SquillError::DomainConflict(src, DbType::Bigint));
    }
    Ok(v)
}

fn coerce_to_double(value: &DbValue) -> Result<f64> {
    let src = value.db_type();
    match value {
        DbValue::Char(s) | DbValue::Varchar(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| SquillError::DomainConflict(src, DbType::Double)),
        other => other
            .as_f64()
            .ok_or(SquillError::DomainConflict(src, DbType::Double)),
    }
}
