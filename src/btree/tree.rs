//! B+Tree over a block storage

use std::cmp::Ordering;
use std::path::Path;

use super::cursor::TreeCursor;
use super::node::{internal_capacity, leaf_capacity, Internal, Leaf, Node};
use super::{ExactProbe, KeyOrder, KeyProbe, NodeCache, Order};
use crate::config::{StorageOptions, TreeOptions};
use crate::error::{AtlasError, Result};
use crate::storage::{open_storage, BlockId, BlockStorage, BLOCK_HEADER_BYTES};

/// Block holding the root pointer
const ROOT_BLOCK: BlockId = BlockId::new(0);

const ROOT_SIGNATURE: &[u8; 4] = b"ROOT";
const HEAD_SIGNATURE: &[u8; 4] = b"B+T1";
const META_BYTES: usize = 12;

/// Deeper than this means a pointer cycle
const MAX_DEPTH: usize = 64;

/// An internal node on the way down and the child taken
type Step = (BlockId, Internal, usize);

/// Ordered key index
///
/// Keys are opaque to the tree; every operation takes the comparator (or
/// probe) that orders them. Internal separators are leaf references whose
/// routing value is that leaf's smallest key, so they never need rewriting
/// when the smallest key changes.
pub struct BTree {
    storage: Box<dyn BlockStorage>,
    cache: NodeCache,
    root: BlockId,
    len: u64,
    meta_dirty: bool,
    leaf_max: usize,
    internal_max: usize,
}

impl BTree {
    /// Open or create a tree file at `path` with its own node cache
    pub fn open(path: &Path, options: &TreeOptions) -> Result<Self> {
        options.validate()?;
        let storage = open_storage(path, &Self::storage_options(options))?;
        Self::with_storage(storage, NodeCache::new(options.cache_nodes))
    }

    /// Storage options of a node file
    pub fn storage_options(options: &TreeOptions) -> StorageOptions {
        StorageOptions {
            backend: options.backend,
            block_capacity: options.node_bytes.saturating_sub(BLOCK_HEADER_BYTES),
            increment: options.increment,
            ..StorageOptions::default()
        }
    }

    /// Build a tree on an already opened storage.
    ///
    /// `cache` must be the cache whose refresh hook was given to the WAL
    /// that wraps `storage`, if any.
    pub fn with_storage(mut storage: Box<dyn BlockStorage>, cache: NodeCache) -> Result<Self> {
        let payload = storage.block_capacity();
        let leaf_max = leaf_capacity(payload);
        let internal_max = internal_capacity(payload);
        if leaf_max < 3 || internal_max < 2 {
            return Err(AtlasError::Config(format!(
                "node payload of {} bytes is too small for a B+Tree",
                payload
            )));
        }

        let head = storage.read_head(0, META_BYTES)?;
        let (root, len) = if &head[..4] == HEAD_SIGNATURE {
            let len = u64::from_le_bytes(head[4..12].try_into().unwrap_or_default());
            (read_root(storage.as_mut())?, len)
        } else if storage.count() == 0 {
            write_head(storage.as_mut(), 0)?;
            let id = storage.write(&encode_root(BlockId::NONE))?;
            if id != ROOT_BLOCK {
                return Err(AtlasError::Format(format!(
                    "root record landed in block {} instead of {}",
                    id, ROOT_BLOCK
                )));
            }
            tracing::debug!("Created B+Tree (leaf capacity {}, internal capacity {})", leaf_max, internal_max);
            (BlockId::NONE, 0)
        } else {
            return Err(AtlasError::Format("storage is not a B+Tree file".into()));
        };

        Ok(Self {
            storage,
            cache,
            root,
            len,
            meta_dirty: false,
            leaf_max,
            internal_max,
        })
    }

    /// Number of keys
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn root(&self) -> BlockId {
        self.root
    }

    /// Maximum keys per leaf
    pub fn leaf_capacity(&self) -> usize {
        self.leaf_max
    }

    /// Maximum separators per internal node
    pub fn internal_capacity(&self) -> usize {
        self.internal_max
    }

    pub fn cache(&self) -> &NodeCache {
        &self.cache
    }

    /// Bytes occupied by the node file
    pub fn bytes(&self) -> u64 {
        self.storage.bytes()
    }

    fn leaf_min(&self) -> usize {
        self.leaf_max / 2
    }

    fn internal_min(&self) -> usize {
        self.internal_max / 2
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Persist the root pointer and key count if they changed
    pub fn flush_meta(&mut self) -> Result<()> {
        if !self.meta_dirty {
            return Ok(());
        }
        write_head(self.storage.as_mut(), self.len)?;
        self.storage.write_at(ROOT_BLOCK, &encode_root(self.root))?;
        self.meta_dirty = false;
        Ok(())
    }

    /// Flush metadata and make the node file durable
    pub fn sync(&mut self) -> Result<()> {
        self.flush_meta()?;
        self.storage.sync()
    }

    /// Drop all in-memory state and re-read it from the node file
    pub fn reload(&mut self) -> Result<()> {
        self.cache.clear();
        let head = self.storage.read_head(0, META_BYTES)?;
        if &head[..4] != HEAD_SIGNATURE {
            return Err(AtlasError::Format("B+Tree signature lost".into()));
        }
        self.len = u64::from_le_bytes(head[4..12].try_into().unwrap_or_default());
        self.root = read_root(self.storage.as_mut())?;
        self.meta_dirty = false;
        Ok(())
    }

    /// Reset the key count to a known value (after a rollback)
    pub fn restore_len(&mut self, len: u64) {
        if self.len != len {
            tracing::warn!("B+Tree key count {} restored to {}", self.len, len);
            self.len = len;
            self.meta_dirty = true;
        }
    }

    // =========================================================================
    // Node access
    // =========================================================================

    fn load(&mut self, id: BlockId) -> Result<Node> {
        if let Some(node) = self.cache.get(id) {
            return Ok(node);
        }
        let buf = self.storage.read(id)?;
        let node = Node::decode(id, &buf)?;
        self.cache.put(id, node.clone());
        Ok(node)
    }

    pub(crate) fn load_leaf(&mut self, id: BlockId) -> Result<Leaf> {
        match self.load(id)? {
            Node::Leaf(leaf) => Ok(leaf),
            Node::Internal(_) => Err(AtlasError::CorruptChain(format!(
                "expected leaf at {}, found internal node",
                id
            ))),
        }
    }

    fn load_internal(&mut self, id: BlockId) -> Result<Internal> {
        match self.load(id)? {
            Node::Internal(node) => Ok(node),
            Node::Leaf(_) => Err(AtlasError::CorruptChain(format!(
                "expected internal node at {}, found leaf",
                id
            ))),
        }
    }

    fn store(&mut self, id: BlockId, node: Node) -> Result<()> {
        self.storage.write_at(id, &node.encode())?;
        self.cache.put(id, node);
        Ok(())
    }

    fn alloc(&mut self, node: Node) -> Result<BlockId> {
        let id = self.storage.write(&node.encode())?;
        self.cache.put(id, node);
        Ok(id)
    }

    fn free(&mut self, id: BlockId) -> Result<()> {
        self.cache.invalidate(id);
        self.storage.delete(id)?;
        Ok(())
    }

    /// Point the left link of `id` (if any) at `left`
    fn relink_left(&mut self, id: BlockId, left: BlockId) -> Result<()> {
        if id.is_none() {
            return Ok(());
        }
        let mut leaf = self.load_leaf(id)?;
        leaf.left = left;
        self.store(id, Node::Leaf(leaf))
    }

    /// Routing value of a separator: the smallest key of the leaf it names
    fn separator_key(&mut self, leaf: BlockId) -> Result<u64> {
        let node = self.load_leaf(leaf)?;
        node.keys.first().copied().ok_or_else(|| {
            AtlasError::CorruptChain(format!("separator leaf {} is empty", leaf))
        })
    }

    // =========================================================================
    // Search
    // =========================================================================

    /// Child index of `node` to descend into.
    ///
    /// Passes every separator whose key the probe puts the target right of
    /// (and, if `inclusive`, separators equal to the target).
    fn route<P: KeyProbe + ?Sized>(
        &mut self,
        node: &Internal,
        probe: &mut P,
        inclusive: bool,
    ) -> Result<usize> {
        let (mut lo, mut hi) = (0, node.separators.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            let key = self.separator_key(node.separators[mid])?;
            let right = match probe.probe(key)? {
                Ordering::Greater => true,
                Ordering::Equal => inclusive,
                Ordering::Less => false,
            };
            if right {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    fn descend<P: KeyProbe + ?Sized>(
        &mut self,
        probe: &mut P,
        inclusive: bool,
    ) -> Result<(Vec<Step>, BlockId, Leaf)> {
        let mut path = Vec::new();
        let mut id = self.root;
        loop {
            match self.load(id)? {
                Node::Leaf(leaf) => return Ok((path, id, leaf)),
                Node::Internal(node) => {
                    let index = self.route(&node, probe, inclusive)?;
                    let child = node.children[index];
                    path.push((id, node, index));
                    id = child;
                }
            }
            if path.len() > MAX_DEPTH {
                return Err(AtlasError::CorruptChain(format!(
                    "B+Tree deeper than {} levels",
                    MAX_DEPTH
                )));
            }
        }
    }

    /// Look up a key by probe: `Ok(Some(key))` for the stored key the probe
    /// reports `Equal` for
    pub fn compare_get<P: KeyProbe + ?Sized>(&mut self, probe: &mut P) -> Result<Option<u64>> {
        if self.root.is_none() {
            return Ok(None);
        }
        let (_, _, leaf) = self.descend(probe, true)?;
        Ok(match search(&leaf.keys, probe)? {
            Ok(pos) => Some(leaf.keys[pos]),
            Err(_) => None,
        })
    }

    /// Look up `key`
    pub fn get<O: KeyOrder + ?Sized>(&mut self, key: u64, order: &mut O) -> Result<Option<u64>> {
        self.compare_get(&mut ExactProbe { key, order })
    }

    pub fn contains<O: KeyOrder + ?Sized>(&mut self, key: u64, order: &mut O) -> Result<bool> {
        Ok(self.get(key, order)?.is_some())
    }

    /// Position a cursor on the first (ascending) or last (descending) key
    /// inside the probe's range
    pub fn cursor<P: KeyProbe + ?Sized>(&mut self, order: Order, probe: &mut P) -> Result<TreeCursor> {
        if self.root.is_none() {
            return Ok(TreeCursor::exhausted(order));
        }
        match order {
            Order::Asc => {
                let (_, _, leaf) = self.descend(probe, false)?;
                let pos = partition(&leaf.keys, probe, |o| o == Ordering::Greater)?;
                Ok(TreeCursor::new(order, leaf, pos as isize))
            }
            Order::Desc => {
                let (_, _, leaf) = self.descend(probe, true)?;
                let count = partition(&leaf.keys, probe, |o| o != Ordering::Less)?;
                Ok(TreeCursor::new(order, leaf, count as isize - 1))
            }
        }
    }

    /// Iterate the keys inside the probe's range
    pub fn find<P: KeyProbe>(&mut self, order: Order, mut probe: P) -> Result<super::Cursor<'_, P>> {
        let cursor = self.cursor(order, &mut probe)?;
        Ok(super::Cursor::new(self, cursor, probe))
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Insert `key`; returns `false` if it is already present
    pub fn put<O: KeyOrder + ?Sized>(&mut self, key: u64, order: &mut O) -> Result<bool> {
        if self.root.is_none() {
            let leaf = Leaf {
                keys: vec![key],
                ..Leaf::empty()
            };
            self.root = self.alloc(Node::Leaf(leaf))?;
            self.len = 1;
            self.meta_dirty = true;
            return Ok(true);
        }

        let mut probe = ExactProbe { key, order };
        let (path, leaf_id, mut leaf) = self.descend(&mut probe, true)?;
        let pos = match search(&leaf.keys, &mut probe)? {
            Ok(_) => return Ok(false),
            Err(pos) => pos,
        };
        leaf.keys.insert(pos, key);
        self.len += 1;
        self.meta_dirty = true;

        if leaf.keys.len() <= self.leaf_max {
            self.store(leaf_id, Node::Leaf(leaf))?;
            return Ok(true);
        }

        // Step 1: hand the smallest key to the left sibling if it has room.
        // Its keys are all below ours, so no separator ever decreases.
        if let Some((_, parent, index)) = path.last() {
            if *index > 0 {
                let left_id = parent.children[index - 1];
                let mut left = self.load_leaf(left_id)?;
                if left.keys.len() < self.leaf_max {
                    let moved = leaf.keys.remove(0);
                    left.keys.push(moved);
                    self.store(left_id, Node::Leaf(left))?;
                    self.store(leaf_id, Node::Leaf(leaf))?;
                    return Ok(true);
                }
            }
        }

        // Step 2: split; the lower half stays, the upper half moves right
        let upper = leaf.keys.split_off(leaf.keys.len() / 2);
        let old_right = leaf.right;
        let right_id = self.alloc(Node::Leaf(Leaf {
            left: leaf_id,
            right: old_right,
            keys: upper,
        }))?;
        self.relink_left(old_right, right_id)?;
        leaf.right = right_id;
        self.store(leaf_id, Node::Leaf(leaf))?;

        // Step 3: the new leaf is its own separator
        self.insert_separator(path, leaf_id, right_id, right_id)?;
        Ok(true)
    }

    /// Add `(separator, child)` right after the child taken at each level,
    /// splitting upwards as needed
    fn insert_separator(
        &mut self,
        mut path: Vec<Step>,
        mut left: BlockId,
        mut separator: BlockId,
        mut child: BlockId,
    ) -> Result<()> {
        while let Some((id, mut node, index)) = path.pop() {
            node.separators.insert(index, separator);
            node.children.insert(index + 1, child);
            if node.separators.len() <= self.internal_max {
                return self.store(id, Node::Internal(node));
            }

            let mid = node.separators.len() / 2;
            let right_separators = node.separators.split_off(mid + 1);
            let promoted = node.separators.pop().ok_or_else(|| {
                AtlasError::CorruptChain(format!("internal node {} split without separators", id))
            })?;
            let right_children = node.children.split_off(mid + 1);
            self.store(id, Node::Internal(node))?;
            let right_id = self.alloc(Node::Internal(Internal {
                children: right_children,
                separators: right_separators,
            }))?;

            left = id;
            separator = promoted;
            child = right_id;
        }

        self.root = self.alloc(Node::Internal(Internal {
            children: vec![left, child],
            separators: vec![separator],
        }))?;
        self.meta_dirty = true;
        tracing::trace!("B+Tree grew a new root at {}", self.root);
        Ok(())
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Remove `key`; returns whether it was present
    pub fn delete<O: KeyOrder + ?Sized>(&mut self, key: u64, order: &mut O) -> Result<bool> {
        if self.root.is_none() {
            return Ok(false);
        }
        let mut probe = ExactProbe { key, order };
        let (path, leaf_id, mut leaf) = self.descend(&mut probe, true)?;
        let pos = match search(&leaf.keys, &mut probe)? {
            Ok(pos) => pos,
            Err(_) => return Ok(false),
        };
        leaf.keys.remove(pos);
        self.len = self.len.saturating_sub(1);
        self.meta_dirty = true;

        if path.is_empty() || leaf.keys.len() >= self.leaf_min() {
            self.store(leaf_id, Node::Leaf(leaf))?;
            return Ok(true);
        }
        self.rebalance_leaf(path, leaf_id, leaf)?;
        Ok(true)
    }

    fn rebalance_leaf(&mut self, mut path: Vec<Step>, id: BlockId, mut leaf: Leaf) -> Result<()> {
        let Some((parent_id, mut parent, index)) = path.pop() else {
            return self.store(id, Node::Leaf(leaf));
        };
        let has_right = index + 1 < parent.children.len();
        let has_left = index > 0;

        // Step 1: borrow the right sibling's smallest key
        if has_right {
            let right_id = parent.children[index + 1];
            let mut right = self.load_leaf(right_id)?;
            if right.keys.len() > self.leaf_min() {
                leaf.keys.push(right.keys.remove(0));
                self.store(right_id, Node::Leaf(right))?;
                return self.store(id, Node::Leaf(leaf));
            }
        }

        // Step 2: borrow the left sibling's largest key
        if has_left {
            let left_id = parent.children[index - 1];
            let mut left = self.load_leaf(left_id)?;
            if left.keys.len() > self.leaf_min() {
                if let Some(moved) = left.keys.pop() {
                    leaf.keys.insert(0, moved);
                }
                self.store(left_id, Node::Leaf(left))?;
                return self.store(id, Node::Leaf(leaf));
            }
        }

        // Step 3: merge with a sibling and drop its separator
        if has_right {
            let right_id = parent.children[index + 1];
            let right = self.load_leaf(right_id)?;
            leaf.keys.extend(right.keys);
            leaf.right = right.right;
            self.relink_left(right.right, id)?;
            self.store(id, Node::Leaf(leaf))?;
            self.free(right_id)?;
            parent.separators.remove(index);
            parent.children.remove(index + 1);
        } else if has_left {
            let left_id = parent.children[index - 1];
            let mut left = self.load_leaf(left_id)?;
            left.keys.extend(leaf.keys);
            left.right = leaf.right;
            self.relink_left(leaf.right, left_id)?;
            self.store(left_id, Node::Leaf(left))?;
            self.free(id)?;
            parent.separators.remove(index - 1);
            parent.children.remove(index);
        } else {
            return self.store(id, Node::Leaf(leaf));
        }

        self.rebalance_internal(path, parent_id, parent)
    }

    fn rebalance_internal(&mut self, mut path: Vec<Step>, id: BlockId, mut node: Internal) -> Result<()> {
        if path.is_empty() {
            if node.separators.is_empty() {
                self.root = node.children[0];
                self.meta_dirty = true;
                self.free(id)?;
                tracing::trace!("B+Tree root collapsed into {}", self.root);
                return Ok(());
            }
            return self.store(id, Node::Internal(node));
        }
        if node.separators.len() >= self.internal_min() {
            return self.store(id, Node::Internal(node));
        }

        let Some((parent_id, mut parent, index)) = path.pop() else {
            return self.store(id, Node::Internal(node));
        };
        let has_right = index + 1 < parent.children.len();
        let has_left = index > 0;

        // Step 1: rotate the right sibling's first child through the parent
        if has_right {
            let right_id = parent.children[index + 1];
            let mut right = self.load_internal(right_id)?;
            if right.separators.len() > self.internal_min() {
                node.children.push(right.children.remove(0));
                node.separators.push(parent.separators[index]);
                parent.separators[index] = right.separators.remove(0);
                self.store(id, Node::Internal(node))?;
                self.store(right_id, Node::Internal(right))?;
                return self.store(parent_id, Node::Internal(parent));
            }
        }

        // Step 2: rotate the left sibling's last child through the parent
        if has_left {
            let left_id = parent.children[index - 1];
            let mut left = self.load_internal(left_id)?;
            if left.separators.len() > self.internal_min() {
                if let (Some(child), Some(separator)) = (left.children.pop(), left.separators.pop()) {
                    node.children.insert(0, child);
                    node.separators.insert(0, parent.separators[index - 1]);
                    parent.separators[index - 1] = separator;
                }
                self.store(id, Node::Internal(node))?;
                self.store(left_id, Node::Internal(left))?;
                return self.store(parent_id, Node::Internal(parent));
            }
        }

        // Step 3: merge, pulling the parent separator down between the halves
        if has_right {
            let right_id = parent.children[index + 1];
            let right = self.load_internal(right_id)?;
            node.separators.push(parent.separators.remove(index));
            parent.children.remove(index + 1);
            node.children.extend(right.children);
            node.separators.extend(right.separators);
            self.store(id, Node::Internal(node))?;
            self.free(right_id)?;
        } else if has_left {
            let left_id = parent.children[index - 1];
            let mut left = self.load_internal(left_id)?;
            left.separators.push(parent.separators.remove(index - 1));
            parent.children.remove(index);
            left.children.extend(node.children);
            left.separators.extend(node.separators);
            self.store(left_id, Node::Internal(left))?;
            self.free(id)?;
        } else {
            self.store(id, Node::Internal(node))?;
            return self.store(parent_id, Node::Internal(parent));
        }

        self.rebalance_internal(path, parent_id, parent)
    }

    // =========================================================================
    // Verification
    // =========================================================================

    /// Walk the whole tree checking ordering, separators, sibling links and
    /// the key count. Returns the number of keys found.
    pub fn verify<O: KeyOrder + ?Sized>(&mut self, order: &mut O) -> Result<u64> {
        if self.root.is_none() {
            return Ok(0);
        }
        let mut leaves = Vec::new();
        self.collect_leaves(self.root, 0, &mut leaves)?;

        let mut count = 0u64;
        let mut previous: Option<u64> = None;
        for (i, &id) in leaves.iter().enumerate() {
            let leaf = self.load_leaf(id)?;
            let expect_left = if i == 0 { BlockId::NONE } else { leaves[i - 1] };
            let expect_right = leaves.get(i + 1).copied().unwrap_or(BlockId::NONE);
            if leaf.left != expect_left || leaf.right != expect_right {
                return Err(AtlasError::CorruptChain(format!(
                    "leaf {} links ({}, {}) but neighbours are ({}, {})",
                    id, leaf.left, leaf.right, expect_left, expect_right
                )));
            }
            for &key in &leaf.keys {
                if let Some(prev) = previous {
                    if order.compare(prev, key)? != Ordering::Less {
                        return Err(AtlasError::CorruptChain(format!(
                            "keys {} and {} out of order in leaf {}",
                            prev, key, id
                        )));
                    }
                }
                previous = Some(key);
                count += 1;
            }
        }
        if count != self.len {
            return Err(AtlasError::CorruptChain(format!(
                "tree holds {} keys but counts {}",
                count, self.len
            )));
        }
        Ok(count)
    }

    /// Leaves in order; checks every separator names the leftmost leaf of
    /// the child after it. Returns the leftmost leaf of `id`.
    fn collect_leaves(&mut self, id: BlockId, depth: usize, out: &mut Vec<BlockId>) -> Result<BlockId> {
        if depth > MAX_DEPTH {
            return Err(AtlasError::CorruptChain(format!("B+Tree deeper than {} levels", MAX_DEPTH)));
        }
        match self.load(id)? {
            Node::Leaf(_) => {
                out.push(id);
                Ok(id)
            }
            Node::Internal(node) => {
                let mut leftmost = BlockId::NONE;
                for (i, &child) in node.children.iter().enumerate() {
                    let first = self.collect_leaves(child, depth + 1, out)?;
                    if i == 0 {
                        leftmost = first;
                    } else if node.separators[i - 1] != first {
                        return Err(AtlasError::CorruptChain(format!(
                            "separator {} of node {} should be {}",
                            node.separators[i - 1], id, first
                        )));
                    }
                }
                Ok(leftmost)
            }
        }
    }
}

/// Binary search a leaf: `Ok(i)` on a match, `Err(i)` for the insert position
fn search<P: KeyProbe + ?Sized>(keys: &[u64], probe: &mut P) -> Result<std::result::Result<usize, usize>> {
    let (mut lo, mut hi) = (0, keys.len());
    while lo < hi {
        let mid = (lo + hi) / 2;
        match probe.probe(keys[mid])? {
            Ordering::Greater => lo = mid + 1,
            Ordering::Less => hi = mid,
            Ordering::Equal => return Ok(Ok(mid)),
        }
    }
    Ok(Err(lo))
}

/// Length of the prefix of `keys` whose probe result satisfies `pred`
fn partition<P, F>(keys: &[u64], probe: &mut P, pred: F) -> Result<usize>
where
    P: KeyProbe + ?Sized,
    F: Fn(Ordering) -> bool,
{
    let (mut lo, mut hi) = (0, keys.len());
    while lo < hi {
        let mid = (lo + hi) / 2;
        if pred(probe.probe(keys[mid])?) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

fn encode_root(root: BlockId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(META_BYTES);
    buf.extend_from_slice(ROOT_SIGNATURE);
    buf.extend_from_slice(&root.to_disk().to_le_bytes());
    buf
}

fn read_root(storage: &mut dyn BlockStorage) -> Result<BlockId> {
    let buf = match storage.read(ROOT_BLOCK) {
        Ok(buf) => buf,
        Err(e) if e.is_not_found() && storage.count() == 0 => {
            // signature written but the root record never made it
            storage.write(&encode_root(BlockId::NONE))?;
            return Ok(BlockId::NONE);
        }
        Err(e) => return Err(e),
    };
    if buf.len() < META_BYTES || &buf[..4] != ROOT_SIGNATURE {
        return Err(AtlasError::Format("bad B+Tree root record".into()));
    }
    let raw = i64::from_le_bytes(buf[4..12].try_into().unwrap_or_default());
    Ok(BlockId::from_disk(raw))
}

fn write_head(storage: &mut dyn BlockStorage, len: u64) -> Result<()> {
    let mut head = [0u8; META_BYTES];
    head[..4].copy_from_slice(HEAD_SIGNATURE);
    head[4..].copy_from_slice(&len.to_le_bytes());
    storage.write_head(0, &head)
}
