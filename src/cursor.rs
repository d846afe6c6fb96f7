//! # Cursor
//!
//! Stack-based traversal over a bucket's committed B+tree pages. A cursor
//! walks the snapshot the transaction captured at begin time: it reads pages
//! only, so mutations made through the same write transaction become visible
//! to cursors after the transaction commits, not before.
//!
//! The stack holds one `(page, index)` frame per level from the root down to
//! the current leaf. Keys and values returned to the caller borrow straight
//! from the mapped file and stay valid for the life of the transaction.

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::page::{self, PageId, PageRef};
use crate::tx::Tx;

/// One level of the traversal stack.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ElemRef {
    pub pgid: PageId,
    pub index: usize,
}

pub(crate) type Stack = SmallVec<[ElemRef; 8]>;

/// An ordered iterator over the key/value pairs of one bucket.
pub struct Cursor<'tx, 'db> {
    tx: &'tx Tx<'db>,
    root: PageId,
    pub(crate) stack: Stack,
}

impl<'tx, 'db> Cursor<'tx, 'db> {
    pub(crate) fn new(tx: &'tx Tx<'db>, root: PageId) -> Self {
        Cursor {
            tx,
            root,
            stack: SmallVec::new(),
        }
    }

    /// Positions the cursor at the first key of the bucket.
    pub fn first(&mut self) -> Result<Option<(&'tx [u8], &'tx [u8])>> {
        self.stack.clear();
        if self.root == 0 {
            return Ok(None);
        }
        self.stack.push(ElemRef {
            pgid: self.root,
            index: 0,
        });
        self.descend_to_leaf()?;
        self.key_value()
    }

    /// Advances to the next key, popping exhausted levels as needed.
    pub fn next(&mut self) -> Result<Option<(&'tx [u8], &'tx [u8])>> {
        let mut depth = self.stack.len();
        while depth > 0 {
            let i = depth - 1;
            let p = self.page(self.stack[i].pgid)?;
            if self.stack[i].index + 1 < p.count {
                self.stack[i].index += 1;
                break;
            }
            self.stack.truncate(i);
            depth = i;
        }

        if self.stack.is_empty() {
            return Ok(None);
        }

        self.descend_to_leaf()?;
        self.key_value()
    }

    /// Positions the cursor at `key`, or at the next key after it. Returns
    /// `None` when the cursor lands past the end of the bucket.
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<(&'tx [u8], &'tx [u8])>> {
        self.stack.clear();
        if self.root == 0 {
            return Ok(None);
        }
        self.search(key)?;
        self.key_value()
    }

    fn page(&self, pgid: PageId) -> Result<PageRef<'tx>> {
        page::page_at(self.tx.data(), self.tx.page_size(), pgid)
    }

    /// Binary-searches from the root down to the leaf holding `key`'s slot.
    fn search(&mut self, key: &[u8]) -> Result<()> {
        let mut pgid = self.root;
        loop {
            let p = self.page(pgid)?;
            if !p.is_leaf() && !p.is_branch() {
                return Err(Error::CorruptPage(pgid));
            }

            if p.is_leaf() {
                let index = leaf_lower_bound(&p, key)?;
                self.stack.push(ElemRef { pgid, index });
                return Ok(());
            }

            // Pick the rightmost child whose key is <= the target: take the
            // lower bound and step back one when the match is inexact.
            let (mut index, exact) = branch_lower_bound(&p, key)?;
            if !exact && index > 0 {
                index -= 1;
            }
            self.stack.push(ElemRef { pgid, index });
            pgid = p.branch_element(index)?.pgid;
        }
    }

    /// Descends from the top frame's current child to the leftmost leaf
    /// below it.
    fn descend_to_leaf(&mut self) -> Result<()> {
        loop {
            let Some(&top) = self.stack.last() else {
                return Ok(());
            };
            let p = self.page(top.pgid)?;
            if p.is_leaf() {
                return Ok(());
            }
            let child = p.branch_element(top.index)?.pgid;
            self.stack.push(ElemRef {
                pgid: child,
                index: 0,
            });
        }
    }

    /// Key and value under the cursor, or `None` when positioned past the
    /// end of its leaf.
    fn key_value(&self) -> Result<Option<(&'tx [u8], &'tx [u8])>> {
        let Some(&top) = self.stack.last() else {
            return Ok(None);
        };
        let p = self.page(top.pgid)?;
        if top.index >= p.count {
            return Ok(None);
        }
        let item = p.leaf_element(top.index)?;
        Ok(Some((item.key, item.value)))
    }

    /// Hands the traversal stack to the write path, which materializes the
    /// node chain it describes.
    pub(crate) fn take_stack(self) -> Stack {
        self.stack
    }
}

fn leaf_lower_bound(p: &PageRef<'_>, key: &[u8]) -> Result<usize> {
    let mut lo = 0;
    let mut hi = p.count;
    while lo < hi {
        let mid = (lo + hi) / 2;
        if p.leaf_element(mid)?.key < key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

fn branch_lower_bound(p: &PageRef<'_>, key: &[u8]) -> Result<(usize, bool)> {
    let mut lo = 0;
    let mut hi = p.count;
    while lo < hi {
        let mid = (lo + hi) / 2;
        if p.branch_element(mid)?.key < key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    let exact = lo < p.count && p.branch_element(lo)?.key == key;
    Ok((lo, exact))
}
