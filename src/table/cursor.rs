//! Row cursors over an index

use std::ops::{Deref, DerefMut};

use parking_lot::MutexGuard;

use super::filter::{Filter, Limit};
use super::meta::Meta;
use super::row::Row;
use super::state::{FilterProbe, State};
use crate::btree::TreeCursor;
use crate::error::Result;
use crate::storage::BlockId;

/// The locked table state, owned by a cursor or borrowed from a transaction
pub(crate) enum StateRef<'a> {
    Locked(MutexGuard<'a, State>),
    Borrowed(&'a mut State),
}

impl Deref for StateRef<'_> {
    type Target = State;

    fn deref(&self) -> &State {
        match self {
            StateRef::Locked(guard) => guard,
            StateRef::Borrowed(state) => state,
        }
    }
}

impl DerefMut for StateRef<'_> {
    fn deref_mut(&mut self) -> &mut State {
        match self {
            StateRef::Locked(guard) => guard,
            StateRef::Borrowed(state) => state,
        }
    }
}

/// Iterator over the rows of an index range.
///
/// A cursor opened from [`Table::find`](super::Table::find) holds the table
/// lock until it is dropped.
pub struct RowCursor<'a> {
    state: StateRef<'a>,
    meta: &'a Meta,
    index: usize,
    cursor: TreeCursor,
    filter: Filter,
    limit: Limit,
    skipped: u64,
    returned: u64,
}

impl<'a> RowCursor<'a> {
    pub(crate) fn open(
        mut state: StateRef<'a>,
        meta: &'a Meta,
        index: usize,
        order: crate::btree::Order,
        filter: Filter,
        limit: Limit,
    ) -> Result<Self> {
        let cursor = {
            let (source, indexes) = state.split(meta);
            let target = &mut indexes[index];
            let mut probe = FilterProbe {
                source,
                keys: &target.keys,
                filter: &filter,
            };
            target.tree.cursor(order, &mut probe)?
        };
        Ok(Self {
            state,
            meta,
            index,
            cursor,
            filter,
            limit,
            skipped: 0,
            returned: 0,
        })
    }

    /// Rows returned so far
    pub fn returned(&self) -> u64 {
        self.returned
    }

    fn advance(&mut self) -> Result<Option<Row>> {
        loop {
            if self.limit.limit.is_some_and(|limit| self.returned >= limit) {
                return Ok(None);
            }
            let (mut source, indexes) = self.state.split(self.meta);
            let target = &mut indexes[self.index];
            let key = {
                let mut probe = FilterProbe {
                    source,
                    keys: &target.keys,
                    filter: &self.filter,
                };
                let key = self.cursor.next(&mut target.tree, &mut probe)?;
                source = probe.source;
                key
            };
            let Some(key) = key else {
                return Ok(None);
            };

            let row = source.row(BlockId::new(key))?;
            if !self.filter.accepts(&row) {
                continue;
            }
            if self.skipped < self.limit.offset {
                self.skipped += 1;
                continue;
            }
            self.returned += 1;
            return Ok(Some(row.as_ref().clone()));
        }
    }
}

impl Iterator for RowCursor<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().transpose()
    }
}
