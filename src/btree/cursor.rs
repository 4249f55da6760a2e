//! Range cursors
//!
//! A [`TreeCursor`] holds a copy of the current leaf and walks the sibling
//! chain lazily. It does not borrow the tree, so a caller that owns the tree
//! next to other state (the table does) can advance it with split borrows;
//! [`Cursor`] is the borrowing iterator for everyone else.

use std::cmp::Ordering;

use super::node::Leaf;
use super::{BTree, KeyProbe, Order};
use crate::error::Result;
use crate::storage::BlockId;

/// Position inside a leaf chain
#[derive(Debug, Clone)]
pub struct TreeCursor {
    order: Order,
    keys: Vec<u64>,
    left: BlockId,
    right: BlockId,
    pos: isize,
    done: bool,
}

impl TreeCursor {
    pub(crate) fn new(order: Order, leaf: Leaf, pos: isize) -> Self {
        Self {
            order,
            keys: leaf.keys,
            left: leaf.left,
            right: leaf.right,
            pos,
            done: false,
        }
    }

    pub(crate) fn exhausted(order: Order) -> Self {
        Self {
            order,
            keys: Vec::new(),
            left: BlockId::NONE,
            right: BlockId::NONE,
            pos: 0,
            done: true,
        }
    }

    pub fn order(&self) -> Order {
        self.order
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Next key inside the probe's range, `None` once the range is left
    pub fn next<P: KeyProbe + ?Sized>(&mut self, tree: &mut BTree, probe: &mut P) -> Result<Option<u64>> {
        while !self.done {
            if self.pos < 0 || self.pos as usize >= self.keys.len() {
                let sibling = match self.order {
                    Order::Asc => self.right,
                    Order::Desc => self.left,
                };
                if sibling.is_none() {
                    self.done = true;
                    break;
                }
                let leaf = match tree.load_leaf(sibling) {
                    Ok(leaf) => leaf,
                    Err(e) => {
                        self.done = true;
                        return Err(e);
                    }
                };
                self.pos = match self.order {
                    Order::Asc => 0,
                    Order::Desc => leaf.keys.len() as isize - 1,
                };
                self.keys = leaf.keys;
                self.left = leaf.left;
                self.right = leaf.right;
                continue;
            }

            let key = self.keys[self.pos as usize];
            self.pos += match self.order {
                Order::Asc => 1,
                Order::Desc => -1,
            };
            let (before, after) = match self.order {
                Order::Asc => (Ordering::Greater, Ordering::Less),
                Order::Desc => (Ordering::Less, Ordering::Greater),
            };
            match probe.probe(key) {
                Ok(Ordering::Equal) => return Ok(Some(key)),
                Ok(o) if o == before => continue,
                Ok(o) => {
                    debug_assert_eq!(o, after);
                    self.done = true;
                }
                Err(e) => {
                    self.done = true;
                    return Err(e);
                }
            }
        }
        Ok(None)
    }
}

/// Iterator over the keys of a range, borrowing the tree
pub struct Cursor<'a, P: KeyProbe> {
    tree: &'a mut BTree,
    cursor: TreeCursor,
    probe: P,
}

impl<'a, P: KeyProbe> Cursor<'a, P> {
    pub(crate) fn new(tree: &'a mut BTree, cursor: TreeCursor, probe: P) -> Self {
        Self { tree, cursor, probe }
    }
}

impl<P: KeyProbe> Iterator for Cursor<'_, P> {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.next(self.tree, &mut self.probe).transpose()
    }
}
