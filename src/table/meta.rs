//! Table description: columns, indexes and tuning knobs

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::row::Value;
use crate::config::{StorageBackend, TreeOptions, WalOptions};
use crate::error::{AtlasError, Result};

/// Name the first index must carry
pub const PRIMARY: &str = "primary";

/// Declared type of a column; `Null` is accepted in every column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Int,
    Float,
    Text,
    Bytes,
}

impl ColumnType {
    pub fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (ColumnType::Int, Value::Int(_))
                | (ColumnType::Float, Value::Float(_))
                | (ColumnType::Float, Value::Int(_))
                | (ColumnType::Text, Value::Text(_))
                | (ColumnType::Bytes, Value::Bytes(_))
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    /// Key column names, most significant first
    pub keys: Vec<String>,
}

/// Persisted part of a [`Meta`] (the `.desc` file)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Descriptor {
    pub version: u32,
    pub columns: Vec<Column>,
    pub indexes: Vec<IndexDef>,
    pub row_bytes: usize,
}

const DESCRIPTOR_VERSION: u32 = 1;

/// Everything needed to open a table
#[derive(Debug, Clone)]
pub struct Meta {
    pub columns: Vec<Column>,

    /// The first index is the primary (unique) index
    pub indexes: Vec<IndexDef>,

    /// Payload capacity of a row-storage block
    pub row_bytes: usize,

    /// Row cache size (in rows)
    pub cache_rows: usize,

    /// Backend of the row file and every index file
    pub backend: StorageBackend,

    /// Growth increment of the row file
    pub increment: usize,

    pub wal: WalOptions,

    pub tree: TreeOptions,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            columns: Vec::new(),
            indexes: Vec::new(),
            row_bytes: 512,
            cache_rows: 64 * 1024,
            backend: StorageBackend::Mmap,
            increment: 16 * 1024 * 1024, // 16 MB
            wal: WalOptions::default(),
            tree: TreeOptions::default(),
        }
    }
}

impl Meta {
    /// Smallest row cache the table will run with
    pub const MIN_CACHE_ROWS: usize = 64;

    /// Create a new meta builder
    pub fn builder() -> MetaBuilder {
        MetaBuilder::default()
    }

    /// Ordinal of a column by name
    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Ordinal of an index by name (case-insensitive)
    pub fn index(&self, name: &str) -> Option<usize> {
        self.indexes
            .iter()
            .position(|i| i.name.eq_ignore_ascii_case(name))
    }

    /// Column ordinals of every index key, in index order
    pub(crate) fn key_columns(&self) -> Result<Vec<Vec<usize>>> {
        self.indexes
            .iter()
            .map(|index| {
                index
                    .keys
                    .iter()
                    .map(|key| {
                        self.column(key).ok_or_else(|| {
                            AtlasError::Config(format!(
                                "index {} names unknown column {}",
                                index.name, key
                            ))
                        })
                    })
                    .collect()
            })
            .collect()
    }

    /// Check meta invariants
    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(AtlasError::Config("a table needs at least one column".into()));
        }
        for (i, column) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|c| c.name == column.name) {
                return Err(AtlasError::Config(format!("duplicate column {}", column.name)));
            }
        }
        match self.indexes.first() {
            Some(primary) if primary.name.eq_ignore_ascii_case(PRIMARY) => {}
            Some(other) => {
                return Err(AtlasError::Config(format!(
                    "first index must be named {}, got {}",
                    PRIMARY, other.name
                )))
            }
            None => return Err(AtlasError::Config("a table needs a primary index".into())),
        }
        for (i, index) in self.indexes.iter().enumerate() {
            if index.keys.is_empty() {
                return Err(AtlasError::Config(format!("index {} has no key columns", index.name)));
            }
            if self.indexes[..i]
                .iter()
                .any(|other| other.name.eq_ignore_ascii_case(&index.name))
            {
                return Err(AtlasError::Config(format!("duplicate index {}", index.name)));
            }
            if index.name.contains(|c: char| c == '/' || c == '\\') {
                return Err(AtlasError::Config(format!("invalid index name {}", index.name)));
            }
        }
        self.key_columns()?;
        if self.row_bytes == 0 || self.row_bytes > i16::MAX as usize {
            return Err(AtlasError::Config(format!(
                "row block capacity must be within 1..={}, got {}",
                i16::MAX,
                self.row_bytes
            )));
        }
        self.wal.validate()?;
        self.tree.validate()?;
        Ok(())
    }

    pub(crate) fn descriptor(&self) -> Descriptor {
        Descriptor {
            version: DESCRIPTOR_VERSION,
            columns: self.columns.clone(),
            indexes: self.indexes.clone(),
            row_bytes: self.row_bytes,
        }
    }

    /// Write the descriptor to `path`, or check it against the one there
    pub(crate) fn persist_or_check(&self, path: &Path) -> Result<()> {
        let mine = self.descriptor();
        match std::fs::read(path) {
            Ok(bytes) => {
                let stored: Descriptor = bincode::deserialize(&bytes)?;
                if stored != mine {
                    return Err(AtlasError::Format(format!(
                        "table schema in {} does not match the requested one",
                        path.display()
                    )));
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::write(path, bincode::serialize(&mine)?)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Builder for Meta
#[derive(Default)]
pub struct MetaBuilder {
    meta: Meta,
}

impl MetaBuilder {
    /// Append a column
    pub fn column(mut self, name: &str, kind: ColumnType) -> Self {
        self.meta.columns.push(Column {
            name: name.to_string(),
            kind,
        });
        self
    }

    /// Append an index over the given key columns
    pub fn index(mut self, name: &str, keys: &[&str]) -> Self {
        self.meta.indexes.push(IndexDef {
            name: name.to_string(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
        });
        self
    }

    /// Shorthand for the primary index
    pub fn primary(self, keys: &[&str]) -> Self {
        self.index(PRIMARY, keys)
    }

    /// Set the row block capacity (in bytes)
    pub fn row_bytes(mut self, bytes: usize) -> Self {
        self.meta.row_bytes = bytes;
        self
    }

    /// Set the row cache size (in rows)
    pub fn cache_rows(mut self, rows: usize) -> Self {
        self.meta.cache_rows = rows;
        self
    }

    /// Set the backend of every table file
    pub fn backend(mut self, backend: StorageBackend) -> Self {
        self.meta.backend = backend;
        self
    }

    /// Set the row file growth increment (in bytes)
    pub fn increment(mut self, bytes: usize) -> Self {
        self.meta.increment = bytes;
        self
    }

    pub fn wal(mut self, options: WalOptions) -> Self {
        self.meta.wal = options;
        self
    }

    pub fn tree(mut self, options: TreeOptions) -> Self {
        self.meta.tree = options;
        self
    }

    pub fn build(self) -> Meta {
        self.meta
    }
}
