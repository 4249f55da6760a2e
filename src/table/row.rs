//! Row model, codec and row cache

use std::cmp::Ordering;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::meta::Meta;
use crate::error::{AtlasError, Result};
use crate::storage::BlockId;
use crate::wal::RefreshHook;

// =============================================================================
// Values
// =============================================================================

/// A single column value
///
/// Values are totally ordered: `Null` first, then numbers (integers and
/// floats compare numerically), then text, then bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Int(_) | Value::Float(_) => 1,
            Value::Text(_) => 2,
            Value::Bytes(_) => 3,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Int(a), Value::Float(b)) => cmp_int_float(*a, *b),
            (Value::Float(a), Value::Int(b)) => cmp_int_float(*b, *a).reverse(),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Exact order of an integer against a float, placing integers on the
/// `f64::total_cmp` line (`0` equals `0.0` and sorts after `-0.0`)
fn cmp_int_float(i: i64, f: f64) -> Ordering {
    // 2^63, the smallest float above every i64
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if f.is_nan() {
        return if f.is_sign_negative() {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    if f >= LIMIT {
        return Ordering::Less;
    }
    if f < -LIMIT {
        return Ordering::Greater;
    }
    // within [-2^63, 2^63) the integral part converts exactly
    let whole = f.trunc();
    match i.cmp(&(whole as i64)) {
        Ordering::Equal if f > whole => Ordering::Less,
        Ordering::Equal if f < whole => Ordering::Greater,
        Ordering::Equal if f == 0.0 && f.is_sign_negative() => Ordering::Greater,
        other => other,
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

// =============================================================================
// Rows
// =============================================================================

/// A table row; `rowid` is its block in row storage once stored
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub rowid: Option<BlockId>,
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { rowid: None, values }
    }

    pub fn with_rowid(rowid: BlockId, values: Vec<Value>) -> Self {
        Self {
            rowid: Some(rowid),
            values,
        }
    }

    pub fn get(&self, column: usize) -> Option<&Value> {
        self.values.get(column)
    }

    /// Compare the given columns of two rows, in order
    pub(crate) fn compare_columns(&self, other: &Row, columns: &[usize]) -> Ordering {
        for &column in columns {
            let a = self.values.get(column).unwrap_or(&Value::Null);
            let b = other.values.get(column).unwrap_or(&Value::Null);
            match a.cmp(b) {
                Ordering::Equal => continue,
                order => return order,
            }
        }
        Ordering::Equal
    }

    /// Compare the first `prefix.len()` of the given columns with `prefix`
    pub(crate) fn compare_prefix(&self, columns: &[usize], prefix: &[Value]) -> Ordering {
        for (&column, expected) in columns.iter().zip(prefix) {
            let value = self.values.get(column).unwrap_or(&Value::Null);
            match value.cmp(expected) {
                Ordering::Equal => continue,
                order => return order,
            }
        }
        Ordering::Equal
    }

    /// Values of the given columns, in order
    pub(crate) fn project(&self, columns: &[usize]) -> Vec<Value> {
        columns
            .iter()
            .map(|&c| self.values.get(c).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Turns rows into storage payloads and back
pub trait RowCodec: Send + Sync {
    fn encode(&self, meta: &Meta, row: &Row) -> Result<Vec<u8>>;

    fn decode(&self, meta: &Meta, rowid: BlockId, bytes: &[u8]) -> Result<Row>;
}

/// Default codec: the value list serialized with bincode
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl RowCodec for BincodeCodec {
    fn encode(&self, meta: &Meta, row: &Row) -> Result<Vec<u8>> {
        if row.values.len() != meta.columns.len() {
            return Err(AtlasError::Serialization(format!(
                "row has {} values, table has {} columns",
                row.values.len(),
                meta.columns.len()
            )));
        }
        Ok(bincode::serialize(&row.values)?)
    }

    fn decode(&self, meta: &Meta, rowid: BlockId, bytes: &[u8]) -> Result<Row> {
        let values: Vec<Value> = bincode::deserialize(bytes)?;
        if values.len() != meta.columns.len() {
            return Err(AtlasError::Serialization(format!(
                "row {} has {} values, table has {} columns",
                rowid,
                values.len(),
                meta.columns.len()
            )));
        }
        Ok(Row::with_rowid(rowid, values))
    }
}

// =============================================================================
// Row cache
// =============================================================================

/// LRU cache of decoded rows by rowid
#[derive(Clone)]
pub(crate) struct RowCache {
    inner: Arc<Mutex<LruCache<BlockId, Arc<Row>>>>,
}

impl RowCache {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(Meta::MIN_CACHE_ROWS)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    pub(crate) fn get(&self, rowid: BlockId) -> Option<Arc<Row>> {
        self.inner.lock().get(&rowid).cloned()
    }

    pub(crate) fn put(&self, rowid: BlockId, row: Arc<Row>) {
        self.inner.lock().put(rowid, row);
    }

    pub(crate) fn remove(&self, rowid: BlockId) {
        self.inner.lock().pop(&rowid);
    }

    pub(crate) fn clear(&self) {
        self.inner.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub(crate) fn refresh_hook(&self) -> RefreshHook {
        let cache = self.clone();
        Arc::new(move |rowid| cache.remove(rowid))
    }
}
