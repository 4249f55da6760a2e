//! Node layout
//!
//! ```text
//! Leaf:     [left:i64][right:i64][key:i64]*
//! Internal: [-2:i64][child0:i64]([separator:i64][child:i64])*
//! ```
//!
//! A separator is a reference to the leftmost leaf of the child that
//! follows it; its routing value is that leaf's smallest key.

use bytes::{Buf, BufMut};

use crate::error::{AtlasError, Result};
use crate::storage::BlockId;

const INTERNAL_MARKER: i64 = -2;

/// Bytes before the first key of a leaf (sibling links)
pub const LEAF_HEADER_BYTES: usize = 16;

/// Bytes before the first separator of an internal node (marker, child0)
pub const INTERNAL_HEADER_BYTES: usize = 16;

/// Maximum keys of a leaf stored in `payload` bytes
pub fn leaf_capacity(payload: usize) -> usize {
    payload.saturating_sub(LEAF_HEADER_BYTES) / 8
}

/// Maximum separators of an internal node stored in `payload` bytes
pub fn internal_capacity(payload: usize) -> usize {
    payload.saturating_sub(INTERNAL_HEADER_BYTES) / 16
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub left: BlockId,
    pub right: BlockId,
    pub keys: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Internal {
    /// `separators.len() + 1` children
    pub children: Vec<BlockId>,
    /// `separators[i]` is the leftmost leaf under `children[i + 1]`
    pub separators: Vec<BlockId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf(Leaf),
    Internal(Internal),
}

impl Leaf {
    pub fn empty() -> Self {
        Self {
            left: BlockId::NONE,
            right: BlockId::NONE,
            keys: Vec::new(),
        }
    }
}

impl Node {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Node::Leaf(leaf) => {
                let mut buf = Vec::with_capacity(LEAF_HEADER_BYTES + leaf.keys.len() * 8);
                buf.put_i64_le(leaf.left.to_disk());
                buf.put_i64_le(leaf.right.to_disk());
                for &key in &leaf.keys {
                    buf.put_i64_le(key as i64);
                }
                buf
            }
            Node::Internal(node) => {
                let mut buf =
                    Vec::with_capacity(INTERNAL_HEADER_BYTES + node.separators.len() * 16);
                buf.put_i64_le(INTERNAL_MARKER);
                buf.put_i64_le(node.children[0].to_disk());
                for (sep, child) in node.separators.iter().zip(&node.children[1..]) {
                    buf.put_i64_le(sep.to_disk());
                    buf.put_i64_le(child.to_disk());
                }
                buf
            }
        }
    }

    pub fn decode(id: BlockId, buf: &[u8]) -> Result<Self> {
        if buf.len() < 16 {
            return Err(AtlasError::Format(format!(
                "node {} is too short ({} bytes)",
                id,
                buf.len()
            )));
        }
        let mut src = buf;
        let first = src.get_i64_le();
        if first == INTERNAL_MARKER {
            let mut children = vec![BlockId::from_disk(src.get_i64_le())];
            let mut separators = Vec::with_capacity(src.remaining() / 16);
            while src.remaining() >= 16 {
                let sep = src.get_i64_le();
                let child = src.get_i64_le();
                if sep < 0 || child < 0 {
                    break;
                }
                separators.push(BlockId::new(sep as u64));
                children.push(BlockId::new(child as u64));
            }
            if children[0].is_none() {
                return Err(AtlasError::Format(format!("internal node {} has no children", id)));
            }
            return Ok(Node::Internal(Internal {
                children,
                separators,
            }));
        }

        let left = BlockId::from_disk(first);
        let right = BlockId::from_disk(src.get_i64_le());
        let mut keys = Vec::with_capacity(src.remaining() / 8);
        while src.remaining() >= 8 {
            let key = src.get_i64_le();
            if key < 0 {
                break;
            }
            keys.push(key as u64);
        }
        Ok(Node::Leaf(Leaf { left, right, keys }))
    }
}
