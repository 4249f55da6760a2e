//! Scan filters and limits
//!
//! A [`Filter`] has two parts:
//! - an index range: lower/upper bounds over a prefix of the scanned index's
//!   key columns, enforced by the B+Tree cursor itself;
//! - a residual predicate over the whole row, applied to every row the range
//!   lets through.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;

use super::row::{Row, Value};

type Predicate = Box<dyn Fn(&Row) -> bool + Send>;

/// Row selection for [`Table::find`](super::Table::find)
#[derive(Default)]
pub struct Filter {
    lower: Option<(Vec<Value>, bool)>,
    upper: Option<(Vec<Value>, bool)>,
    residual: Option<Predicate>,
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("lower", &self.lower)
            .field("upper", &self.upper)
            .field("residual", &self.residual.is_some())
            .finish()
    }
}

impl Filter {
    /// Every row
    pub fn all() -> Self {
        Self::default()
    }

    /// Index key prefix equal to `prefix`
    pub fn eq(prefix: Vec<Value>) -> Self {
        Self::all().range(Bound::Included(prefix.clone()), Bound::Included(prefix))
    }

    /// Index key prefix within the given bounds
    pub fn range(mut self, lower: Bound<Vec<Value>>, upper: Bound<Vec<Value>>) -> Self {
        self.lower = bound(lower);
        self.upper = bound(upper);
        self
    }

    pub fn gte(mut self, prefix: Vec<Value>) -> Self {
        self.lower = Some((prefix, true));
        self
    }

    pub fn gt(mut self, prefix: Vec<Value>) -> Self {
        self.lower = Some((prefix, false));
        self
    }

    pub fn lte(mut self, prefix: Vec<Value>) -> Self {
        self.upper = Some((prefix, true));
        self
    }

    pub fn lt(mut self, prefix: Vec<Value>) -> Self {
        self.upper = Some((prefix, false));
        self
    }

    /// Add a predicate the index cannot evaluate
    pub fn matching<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Row) -> bool + Send + 'static,
    {
        self.residual = Some(Box::new(predicate));
        self
    }

    pub(crate) fn has_range(&self) -> bool {
        self.lower.is_some() || self.upper.is_some()
    }

    /// Where the range lies relative to `row` (indexed by `keys`)
    pub(crate) fn locate(&self, row: &Row, keys: &[usize]) -> Ordering {
        if let Some((prefix, inclusive)) = &self.lower {
            match row.compare_prefix(keys, prefix) {
                Ordering::Less => return Ordering::Greater,
                Ordering::Equal if !inclusive => return Ordering::Greater,
                _ => {}
            }
        }
        if let Some((prefix, inclusive)) = &self.upper {
            match row.compare_prefix(keys, prefix) {
                Ordering::Greater => return Ordering::Less,
                Ordering::Equal if !inclusive => return Ordering::Less,
                _ => {}
            }
        }
        Ordering::Equal
    }

    pub(crate) fn accepts(&self, row: &Row) -> bool {
        self.residual.as_ref().map_or(true, |p| p(row))
    }
}

fn bound(bound: Bound<Vec<Value>>) -> Option<(Vec<Value>, bool)> {
    match bound {
        Bound::Included(v) => Some((v, true)),
        Bound::Excluded(v) => Some((v, false)),
        Bound::Unbounded => None,
    }
}

/// Offset and row limit of a scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limit {
    pub offset: u64,
    pub limit: Option<u64>,
}

impl Limit {
    /// No offset, no limit
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(offset: u64, limit: u64) -> Self {
        Self {
            offset,
            limit: Some(limit),
        }
    }

    pub fn first(limit: u64) -> Self {
        Self::new(0, limit)
    }
}
