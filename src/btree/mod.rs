//! B+Tree Index Module
//!
//! Ordered set of 64-bit keys (row offsets) stored in a block storage file.
//! The tree never interprets keys itself: ordering comes from a caller
//! supplied comparator, which typically dereferences both keys into rows.
//!
//! ## Layout
//! ```text
//!                 ┌──────────────────┐
//!                 │ internal (root)  │   separators point at leaves
//!                 └──┬─────────┬─────┘
//!          ┌─────────┘         └─────────┐
//!   ┌──────▼──────┐  right  ┌────────────▼┐
//!   │ leaf [k k k]│ ──────► │ leaf [k k k] │
//!   │             │ ◄────── │              │
//!   └─────────────┘  left   └──────────────┘
//! ```
//!
//! Block 0 of the node file holds the `ROOT` record (signature plus root
//! block); the storage head holds the `B+T1` signature and the key count.
//! Both are written by [`BTree::flush_meta`], not on every mutation.
//!
//! ## Probes
//! Lookups and scans take a [`KeyProbe`]: a function telling, for a stored
//! key, where the target lies relative to it. `Greater` means the target is
//! further right, `Less` further left and `Equal` a match (or, for scans,
//! "inside the range").

mod cursor;
mod node;
mod tree;

use std::cmp::Ordering;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::config::TreeOptions;
use crate::error::Result;
use crate::storage::BlockId;
use crate::wal::RefreshHook;

pub use cursor::{Cursor, TreeCursor};
pub use node::{internal_capacity, leaf_capacity, Internal, Leaf, Node};
pub use tree::BTree;

/// Three-way comparison of two stored keys
pub trait KeyOrder {
    fn compare(&mut self, a: u64, b: u64) -> Result<Ordering>;
}

impl<F> KeyOrder for F
where
    F: FnMut(u64, u64) -> Result<Ordering>,
{
    fn compare(&mut self, a: u64, b: u64) -> Result<Ordering> {
        self(a, b)
    }
}

/// Orders keys by their numeric value
#[derive(Debug, Default, Clone, Copy)]
pub struct NaturalOrder;

impl KeyOrder for NaturalOrder {
    fn compare(&mut self, a: u64, b: u64) -> Result<Ordering> {
        Ok(a.cmp(&b))
    }
}

/// Position of a target relative to a stored key
pub trait KeyProbe {
    fn probe(&mut self, key: u64) -> Result<Ordering>;
}

impl<F> KeyProbe for F
where
    F: FnMut(u64) -> Result<Ordering>,
{
    fn probe(&mut self, key: u64) -> Result<Ordering> {
        self(key)
    }
}

/// Probe for one key under `order`
pub(crate) struct ExactProbe<'a, O: KeyOrder + ?Sized> {
    pub key: u64,
    pub order: &'a mut O,
}

impl<O: KeyOrder + ?Sized> KeyProbe for ExactProbe<'_, O> {
    fn probe(&mut self, key: u64) -> Result<Ordering> {
        self.order.compare(self.key, key)
    }
}

/// Scan direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// LRU cache of decoded nodes, shared with the refresh hook
#[derive(Clone)]
pub struct NodeCache {
    inner: Arc<Mutex<LruCache<BlockId, Node>>>,
}

impl NodeCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(TreeOptions::MIN_CACHE_NODES))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    pub fn get(&self, id: BlockId) -> Option<Node> {
        self.inner.lock().get(&id).cloned()
    }

    pub fn put(&self, id: BlockId, node: Node) {
        self.inner.lock().put(id, node);
    }

    pub fn invalidate(&self, id: BlockId) {
        self.inner.lock().pop(&id);
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invalidation hook to pass to [`Wal::wrap`](crate::wal::Wal::wrap)
    pub fn refresh_hook(&self) -> RefreshHook {
        let cache = self.clone();
        Arc::new(move |id| cache.invalidate(id))
    }
}
