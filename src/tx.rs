//! # Transactions
//!
//! The MVCC unit. A read transaction pins the mmap (shared lock) and a copy
//! of the current meta for its whole life: it sees exactly the generation it
//! began on and nothing later. A write transaction additionally holds the
//! database's single writer mutex and builds its changes in memory, as an
//! arena of materialized nodes plus a set of freshly allocated page buffers,
//! so nothing touches the file until commit.
//!
//! ## Commit Pipeline
//!
//! 1. Rebalance every node marked unbalanced by a delete.
//! 2. Dereference the arena: all mmap-backed key/value refs become owned, so
//!    the mapping may be replaced underneath us from here on.
//! 3. Spill dirty nodes bottom-up, splitting oversized nodes, freeing their
//!    old pages into the pending set and writing replacements into newly
//!    allocated pages; bucket roots are updated to the new page ids.
//! 4. Rewrite the buckets directory page and the freelist page (both
//!    copy-on-write, like everything else).
//! 5. Write all dirty pages in ascending page order, fdatasync.
//! 6. Write the new meta into slot `txid % 2`, sync again. Only now is the
//!    commit durable; a crash before this point leaves the previous
//!    generation as the current one.
//!
//! Any failure rolls the transaction back: in-memory state is dropped,
//! allocated page ids return to the freelist, and the file still ends in the
//! previous generation because no meta was written.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::{MutexGuard, RwLockReadGuard};
use tracing::trace;

use crate::bucket::{self, Bucket, BucketEntry};
use crate::cursor::{Cursor, ElemRef, Stack};
use crate::db::{Db, WriterState};
use crate::error::{Error, Result};
use crate::meta::{self, Meta};
use crate::mmap::MmapRegion;
use crate::node::{KvRef, Node, NodeArena, NodeId};
use crate::page::{self, PageId, PageRef, TxId};

/// Counters accumulated over the life of one transaction and merged into
/// [`crate::Stats`] when it closes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TxStats {
    /// Pages allocated.
    pub page_count: u64,
    /// Bytes allocated for pages.
    pub page_alloc: u64,
    /// Cursors created.
    pub cursor_count: u64,
    /// Nodes materialized.
    pub node_count: u64,
    /// Nodes dereferenced ahead of a remap.
    pub node_deref: u64,
    /// Node rebalances performed.
    pub rebalance: u64,
    /// Node splits performed.
    pub split: u64,
    /// Nodes spilled to pages.
    pub spill: u64,
    /// Pages written at commit.
    pub write: u64,
}

impl TxStats {
    pub(crate) fn add(&mut self, other: &TxStats) {
        self.page_count += other.page_count;
        self.page_alloc += other.page_alloc;
        self.cursor_count += other.cursor_count;
        self.node_count += other.node_count;
        self.node_deref += other.node_deref;
        self.rebalance += other.rebalance;
        self.split += other.split;
        self.spill += other.spill;
        self.write += other.write;
    }

    /// Difference between two snapshots, for deltas over a time span.
    pub fn sub(&self, other: &TxStats) -> TxStats {
        TxStats {
            page_count: self.page_count - other.page_count,
            page_alloc: self.page_alloc - other.page_alloc,
            cursor_count: self.cursor_count - other.cursor_count,
            node_count: self.node_count - other.node_count,
            node_deref: self.node_deref - other.node_deref,
            rebalance: self.rebalance - other.rebalance,
            split: self.split - other.split,
            spill: self.spill - other.spill,
            write: self.write - other.write,
        }
    }
}

pub(crate) struct TxState<'db> {
    closed: bool,
    meta: Meta,
    stats: TxStats,
    /// Bucket directory, loaded lazily from the snapshot's buckets page.
    buckets: Option<BTreeMap<String, BucketEntry>>,
    write: Option<TxWrite<'db>>,
}

/// Write-transaction-only state. Dropping it releases the writer mutex.
struct TxWrite<'db> {
    writer: MutexGuard<'db, WriterState>,
    arena: NodeArena,
    /// Dirty page buffers awaiting the commit write, by page id.
    pages: BTreeMap<PageId, Vec<u8>>,
    /// Page ids taken from the freelist; returned on rollback.
    allocated: Vec<PageId>,
}

/// A snapshot of the database, optionally with exclusive write access.
pub struct Tx<'db> {
    db: &'db Db,
    writable: bool,
    pub(crate) managed: bool,
    guard: Option<RwLockReadGuard<'db, MmapRegion>>,
    state: RefCell<TxState<'db>>,
}

impl<'db> Tx<'db> {
    pub(crate) fn new_read(db: &'db Db) -> Result<Tx<'db>> {
        let guard = db.mmap_read();
        let meta = meta::load_current(guard.data(), db.page_size())?;
        db.register_read(meta.txid());
        Ok(Tx {
            db,
            writable: false,
            managed: false,
            guard: Some(guard),
            state: RefCell::new(TxState {
                closed: false,
                meta,
                stats: TxStats::default(),
                buckets: None,
                write: None,
            }),
        })
    }

    pub(crate) fn new_write(
        db: &'db Db,
        mut writer: MutexGuard<'db, WriterState>,
    ) -> Result<Tx<'db>> {
        let guard = db.mmap_read();
        let mut meta = meta::load_current(guard.data(), db.page_size())?;
        meta.set_txid(meta.txid() + 1);

        // Pages freed by earlier generations become reusable once no open
        // reader can still reach them.
        let min_read = db.min_read_txid().unwrap_or(TxId::MAX);
        if min_read > 0 {
            writer.freelist.release(min_read - 1);
        }
        trace!(txid = meta.txid(), "begin write transaction");

        Ok(Tx {
            db,
            writable: true,
            managed: false,
            guard: Some(guard),
            state: RefCell::new(TxState {
                closed: false,
                meta,
                stats: TxStats::default(),
                buckets: None,
                write: Some(TxWrite {
                    writer,
                    arena: NodeArena::new(),
                    pages: BTreeMap::new(),
                    allocated: Vec::new(),
                }),
            }),
        })
    }

    /// Generation this transaction operates on.
    pub fn id(&self) -> TxId {
        self.state.borrow().meta.txid()
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Counters accumulated so far.
    pub fn stats(&self) -> TxStats {
        self.state.borrow().stats
    }

    pub(crate) fn data(&self) -> &[u8] {
        match &self.guard {
            Some(guard) => guard.data(),
            None => &[],
        }
    }

    pub(crate) fn page_size(&self) -> usize {
        self.db.page_size()
    }

    pub(crate) fn high_water(&self) -> PageId {
        self.state.borrow().meta.high_water()
    }

    fn check_open(&self) -> Result<()> {
        if self.state.borrow().closed {
            return Err(Error::TxClosed);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Buckets
    // ------------------------------------------------------------------

    /// Returns a handle to an existing bucket.
    pub fn bucket(&self, name: &str) -> Result<Bucket<'_, 'db>> {
        self.check_open()?;
        self.ensure_buckets_loaded()?;
        let state = self.state.borrow();
        let buckets = state.buckets.as_ref().ok_or(Error::BucketNotFound)?;
        if !buckets.contains_key(name) {
            return Err(Error::BucketNotFound);
        }
        Ok(Bucket::new(self, name.to_string()))
    }

    /// Creates a new, empty bucket.
    pub fn create_bucket(&self, name: &str) -> Result<Bucket<'_, 'db>> {
        self.check_open()?;
        if !self.writable {
            return Err(Error::TxNotWritable);
        }
        if name.is_empty() {
            return Err(Error::BucketNameRequired);
        }
        if name.len() > bucket::MAX_BUCKET_NAME_SIZE {
            return Err(Error::BucketNameTooLarge);
        }
        self.ensure_buckets_loaded()?;

        let mut state = self.state.borrow_mut();
        let buckets = state.buckets.as_mut().ok_or(Error::BucketNotFound)?;
        if buckets.contains_key(name) {
            return Err(Error::BucketExists);
        }
        buckets.insert(name.to_string(), BucketEntry::default());
        drop(state);

        Ok(Bucket::new(self, name.to_string()))
    }

    /// Removes a bucket and frees every page of its tree.
    pub fn delete_bucket(&self, name: &str) -> Result<()> {
        self.check_open()?;
        if !self.writable {
            return Err(Error::TxNotWritable);
        }
        self.ensure_buckets_loaded()?;

        let root = self.bucket_root(name)?;
        let txid = self.id();

        // Free the committed tree under the snapshot. Pages go to the
        // pending set, so open readers keep seeing them.
        if root != 0 {
            let mut spans: Vec<(PageId, u32)> = Vec::new();
            self.for_each_page(root, 0, &mut |p, _| spans.push((p.id, p.overflow)))?;

            let mut state = self.state.borrow_mut();
            let write = state.write.as_mut().ok_or(Error::TxNotWritable)?;
            for (pgid, overflow) in spans {
                write.writer.freelist.free(txid, pgid, overflow);
            }
        }

        let mut state = self.state.borrow_mut();
        let buckets = state.buckets.as_mut().ok_or(Error::BucketNotFound)?;
        buckets.remove(name);
        Ok(())
    }

    /// Names of all buckets, in order.
    pub fn buckets(&self) -> Result<Vec<String>> {
        self.check_open()?;
        self.ensure_buckets_loaded()?;
        let state = self.state.borrow();
        let buckets = state.buckets.as_ref().ok_or(Error::BucketNotFound)?;
        Ok(buckets.keys().cloned().collect())
    }

    fn ensure_buckets_loaded(&self) -> Result<()> {
        if self.state.borrow().buckets.is_some() {
            return Ok(());
        }
        let root = self.state.borrow().meta.buckets_root();
        let p = page::page_at(self.data(), self.page_size(), root)?;
        let map = bucket::read_directory(&p)?;
        self.state.borrow_mut().buckets = Some(map);
        Ok(())
    }

    pub(crate) fn bucket_root(&self, name: &str) -> Result<PageId> {
        self.ensure_buckets_loaded()?;
        let state = self.state.borrow();
        let buckets = state.buckets.as_ref().ok_or(Error::BucketNotFound)?;
        buckets
            .get(name)
            .map(|entry| entry.root)
            .ok_or(Error::BucketNotFound)
    }

    pub(crate) fn new_cursor(&self, name: &str) -> Result<Cursor<'_, 'db>> {
        let root = self.bucket_root(name)?;
        self.state.borrow_mut().stats.cursor_count += 1;
        Ok(Cursor::new(self, root))
    }

    pub(crate) fn bucket_next_sequence(&self, name: &str) -> Result<u64> {
        let mut state = self.state.borrow_mut();
        let buckets = state.buckets.as_mut().ok_or(Error::BucketNotFound)?;
        let entry = buckets.get_mut(name).ok_or(Error::BucketNotFound)?;
        if entry.sequence == u64::MAX {
            return Err(Error::SequenceOverflow);
        }
        entry.sequence += 1;
        Ok(entry.sequence)
    }

    // ------------------------------------------------------------------
    // Tree mutation
    // ------------------------------------------------------------------

    pub(crate) fn put_in_bucket(&self, name: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let stack = self.stack_for(name, key)?;
        let leaf = self.node_from_stack(name, &stack)?;

        let data = self.data();
        let state = &mut *self.state.borrow_mut();
        let write = state.write.as_mut().ok_or(Error::TxNotWritable)?;
        write.arena[leaf].put(data, key, key.to_vec(), value.to_vec(), 0, 0);
        Ok(())
    }

    pub(crate) fn delete_in_bucket(&self, name: &str, key: &[u8]) -> Result<()> {
        let stack = self.stack_for(name, key)?;
        if stack.is_empty() {
            // Empty committed tree; only an uncommitted root could hold the
            // key.
            let state = self.state.borrow();
            let has_root_node = state
                .buckets
                .as_ref()
                .and_then(|m| m.get(name))
                .is_some_and(|entry| entry.root_node.is_some());
            if !has_root_node {
                return Ok(());
            }
        }
        let leaf = self.node_from_stack(name, &stack)?;

        let data = self.data();
        let state = &mut *self.state.borrow_mut();
        let write = state.write.as_mut().ok_or(Error::TxNotWritable)?;
        write.arena[leaf].del(data, key);
        Ok(())
    }

    /// Seeks `key` through the committed pages and returns the traversal
    /// stack, empty when the bucket's tree has no pages yet.
    fn stack_for(&self, name: &str, key: &[u8]) -> Result<Stack> {
        let mut cursor = self.new_cursor(name)?;
        cursor.seek(key)?;
        Ok(cursor.take_stack())
    }

    /// Materializes the node chain described by a cursor stack and returns
    /// the leaf node. An empty stack yields the bucket's in-memory root,
    /// created as an empty leaf on first use.
    fn node_from_stack(&self, name: &str, stack: &[ElemRef]) -> Result<NodeId> {
        let data = self.data();
        let page_size = self.page_size();
        let state = &mut *self.state.borrow_mut();
        let TxState {
            buckets,
            write,
            stats,
            ..
        } = state;
        let entry = buckets
            .as_mut()
            .and_then(|m| m.get_mut(name))
            .ok_or(Error::BucketNotFound)?;
        let write = write.as_mut().ok_or(Error::TxNotWritable)?;

        if stack.is_empty() {
            if let Some(id) = entry.root_node {
                return Ok(id);
            }
            let id = write.arena.alloc(Node {
                is_leaf: true,
                ..Node::default()
            });
            stats.node_count += 1;
            entry.root_node = Some(id);
            return Ok(id);
        }

        let mut current = node_for(write, entry, stats, data, page_size, stack[0].pgid, None)?;
        for frame in &stack[..stack.len() - 1] {
            let child_pgid = write.arena[current].inodes[frame.index].pgid;
            current = node_for(write, entry, stats, data, page_size, child_pgid, Some(current))?;
        }
        Ok(current)
    }

    /// Recursively visits every page of a subtree, parents before children.
    pub(crate) fn for_each_page(
        &self,
        pgid: PageId,
        depth: usize,
        f: &mut dyn FnMut(&PageRef<'_>, usize),
    ) -> Result<()> {
        let p = page::page_at(self.data(), self.page_size(), pgid)?;
        f(&p, depth);
        if p.is_branch() {
            for i in 0..p.count {
                let child = p.branch_element(i)?.pgid;
                self.for_each_page(child, depth + 1, f)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commit / rollback
    // ------------------------------------------------------------------

    /// Writes all pending changes to disk and makes them the current
    /// generation. On error the transaction is rolled back.
    pub fn commit(&mut self) -> Result<()> {
        if self.state.get_mut().closed {
            return Err(Error::TxClosed);
        }
        if self.managed {
            return Err(Error::ManagedTx);
        }
        if !self.writable {
            return Err(Error::TxNotWritable);
        }

        match self.commit_inner() {
            Ok(()) => {
                self.close_write(true);
                Ok(())
            }
            Err(err) => {
                self.close_write(false);
                Err(err)
            }
        }
    }

    /// Discards all pending changes. Read transactions simply drop their
    /// snapshot.
    pub fn rollback(&mut self) -> Result<()> {
        if self.state.get_mut().closed {
            return Err(Error::TxClosed);
        }
        if self.managed {
            return Err(Error::ManagedTx);
        }
        self.close_any();
        Ok(())
    }

    fn commit_inner(&mut self) -> Result<()> {
        self.rebalance_all()?;
        self.dereference_all();
        let overflows = self.collect_overflows()?;

        // The arena owns all of its bytes now; release our hold on the
        // mapping so allocation may grow and remap it.
        self.guard = None;

        self.spill_all(&overflows)?;
        self.write_buckets_page(&overflows)?;
        self.write_freelist_page(&overflows)?;
        self.flush_pages()?;
        self.write_meta()?;
        Ok(())
    }

    fn close_write(&mut self, committed: bool) {
        let state = self.state.get_mut();
        state.closed = true;
        let txid = state.meta.txid();
        if let Some(mut write) = state.write.take() {
            if !committed {
                write.writer.freelist.rollback(txid, &write.allocated);
            }
            // Dropping the guard releases the writer mutex.
            drop(write);
        }
        self.guard = None;
        self.db.merge_stats(&state.stats);
        if committed {
            trace!(txid, "committed");
        } else {
            trace!(txid, "rolled back");
        }
    }

    fn close_any(&mut self) {
        if self.writable {
            self.close_write(false);
            return;
        }
        let state = self.state.get_mut();
        state.closed = true;
        self.db.deregister_read(state.meta.txid());
        self.guard = None;
        self.db.merge_stats(&state.stats);
    }

    // ------------------------------------------------------------------
    // Commit phases
    // ------------------------------------------------------------------

    fn rebalance_all(&mut self) -> Result<()> {
        let page_size = self.db.page_size();
        let data = match &self.guard {
            Some(guard) => guard.data(),
            None => &[],
        };
        let state = self.state.get_mut();
        let TxState {
            buckets,
            write,
            stats,
            meta,
            ..
        } = state;
        let (Some(buckets), Some(write)) = (buckets.as_mut(), write.as_mut()) else {
            return Ok(());
        };
        let txid = meta.txid();

        for entry in buckets.values_mut() {
            let mut ids: Vec<NodeId> = entry.nodes.values().copied().collect();
            if let Some(root) = entry.root_node {
                if !ids.contains(&root) {
                    ids.push(root);
                }
            }
            for id in ids {
                rebalance_node(write, entry, stats, data, page_size, txid, id)?;
            }
        }
        Ok(())
    }

    fn dereference_all(&mut self) {
        let data = match &self.guard {
            Some(guard) => guard.data(),
            None => &[],
        };
        let state = self.state.get_mut();
        if let Some(write) = state.write.as_mut() {
            for node in write.arena.iter_mut() {
                node.dereference(data);
                state.stats.node_deref += 1;
            }
        }
    }

    /// Records the overflow count of every page this commit may free, while
    /// the snapshot is still mapped.
    fn collect_overflows(&mut self) -> Result<HashMap<PageId, u32>> {
        let page_size = self.db.page_size();
        let data = match &self.guard {
            Some(guard) => guard.data(),
            None => &[],
        };
        let state = self.state.get_mut();
        let mut overflows = HashMap::new();

        if let Some(write) = state.write.as_ref() {
            for node in write.arena.iter() {
                if node.pgid != 0 {
                    let p = page::page_at(data, page_size, node.pgid)?;
                    overflows.insert(node.pgid, p.overflow);
                }
            }
        }
        for pgid in [state.meta.buckets_root(), state.meta.freelist_root()] {
            let p = page::page_at(data, page_size, pgid)?;
            overflows.insert(pgid, p.overflow);
        }
        Ok(overflows)
    }

    fn spill_all(&mut self, overflows: &HashMap<PageId, u32>) -> Result<()> {
        let db = self.db;
        let page_size = db.page_size();
        let state = self.state.get_mut();
        let TxState {
            buckets,
            write,
            stats,
            meta,
            ..
        } = state;
        let (Some(buckets), Some(write)) = (buckets.as_mut(), write.as_mut()) else {
            return Ok(());
        };
        let txid = meta.txid();

        for entry in buckets.values_mut() {
            let Some(start) = entry.root_node else {
                continue;
            };
            spill_node(db, meta, write, stats, overflows, txid, page_size, start)?;

            // A root split hangs a freshly written parent above the old
            // root; follow the chain up to find the new tree root.
            let top = write.arena.root_of(start);
            entry.root = write.arena[top].pgid;
            entry.root_node = Some(top);
        }
        Ok(())
    }

    fn write_buckets_page(&mut self, overflows: &HashMap<PageId, u32>) -> Result<()> {
        let db = self.db;
        let page_size = db.page_size();
        let state = self.state.get_mut();
        let TxState {
            buckets,
            write,
            stats,
            meta,
            ..
        } = state;
        // Untouched directory means unchanged roots: keep the old page.
        let (Some(buckets), Some(write)) = (buckets.as_ref(), write.as_mut()) else {
            return Ok(());
        };
        let txid = meta.txid();

        let old = meta.buckets_root();
        write
            .writer
            .freelist
            .free(txid, old, overflows.get(&old).copied().unwrap_or(0));

        let size = bucket::directory_size(buckets);
        let count = size / page_size + 1;
        let pgid = allocate(db, meta, write, stats, count)?;
        let buf = write.pages.get_mut(&pgid).ok_or(Error::AllocationFailed)?;
        bucket::write_directory(buckets, buf, pgid, page_size)?;
        meta.set_buckets_root(pgid);
        Ok(())
    }

    fn write_freelist_page(&mut self, overflows: &HashMap<PageId, u32>) -> Result<()> {
        let db = self.db;
        let page_size = db.page_size();
        let state = self.state.get_mut();
        let TxState {
            write,
            stats,
            meta,
            ..
        } = state;
        let Some(write) = write.as_mut() else {
            return Ok(());
        };
        let txid = meta.txid();

        let old = meta.freelist_root();
        write
            .writer
            .freelist
            .free(txid, old, overflows.get(&old).copied().unwrap_or(0));

        let size = write.writer.freelist.size();
        let count = size / page_size + 1;
        let pgid = allocate(db, meta, write, stats, count)?;
        let buf = write.pages.get_mut(&pgid).ok_or(Error::AllocationFailed)?;
        write.writer.freelist.write(buf, pgid, page_size)?;
        meta.set_freelist_root(pgid);
        Ok(())
    }

    fn flush_pages(&mut self) -> Result<()> {
        let db = self.db;
        let page_size = db.page_size() as u64;
        let state = self.state.get_mut();
        let Some(write) = state.write.as_ref() else {
            return Ok(());
        };

        for (&pgid, buf) in &write.pages {
            db.write_at(buf, pgid * page_size)?;
            state.stats.write += 1;
        }
        db.sync_data()?;
        Ok(())
    }

    fn write_meta(&mut self) -> Result<()> {
        let db = self.db;
        let page_size = db.page_size();
        let state = self.state.get_mut();
        let meta = state.meta;
        let slot = meta.txid() % 2;

        let mut buf = vec![0u8; page_size];
        meta::write_into(&mut buf, slot, &meta)?;
        db.write_at(&buf, slot * page_size as u64)?;
        db.sync_data()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Consistency check
    // ------------------------------------------------------------------

    /// Walks every reachable page and cross-checks the freelist, collecting
    /// all inconsistencies. Run inside a write transaction so the freelist
    /// is stable.
    pub(crate) fn run_check(&self) -> Result<Vec<String>> {
        let page_size = self.page_size();
        let data = self.data();
        let mut errors = Vec::new();

        let (high_water, buckets_root, freelist_root) = {
            let state = self.state.borrow();
            (
                state.meta.high_water(),
                state.meta.buckets_root(),
                state.meta.freelist_root(),
            )
        };

        let mut reachable: HashSet<PageId> = HashSet::new();
        reachable.insert(0);
        reachable.insert(1);
        for root in [buckets_root, freelist_root] {
            let p = page::page_at(data, page_size, root)?;
            for i in 0..=p.overflow as PageId {
                reachable.insert(root + i);
            }
        }

        for name in self.buckets()? {
            let root = self.bucket_root(&name)?;
            if root == 0 {
                continue;
            }
            self.for_each_page(root, 0, &mut |p, _| {
                for i in 0..=p.overflow as PageId {
                    let id = p.id + i;
                    if !reachable.insert(id) {
                        errors.push(format!("page {id}: multiple references"));
                    }
                }
                if !p.is_leaf() && !p.is_branch() {
                    errors.push(format!("page {}: invalid type", p.id));
                }
                if p.id + p.overflow as PageId >= high_water {
                    errors.push(format!("page {}: out of bounds", p.id));
                }
            })?;
        }

        // Every page below the high-water mark is either reachable or free.
        {
            let state = self.state.borrow();
            let write = state.write.as_ref().ok_or(Error::TxNotWritable)?;
            for id in 0..high_water {
                if !reachable.contains(&id) && !write.writer.freelist.is_free(id) {
                    errors.push(format!("page {id}: unreachable unfreed"));
                }
            }
        }

        // TODO: verify that only one buckets page exists.

        Ok(errors)
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if !self.state.get_mut().closed {
            self.close_any();
        }
    }
}

// ----------------------------------------------------------------------
// Tree helpers operating on a bucket's node cache
// ----------------------------------------------------------------------

/// Returns the cached node for `pgid`, materializing it from its page on
/// first access and linking it under `parent`.
fn node_for(
    write: &mut TxWrite<'_>,
    entry: &mut BucketEntry,
    stats: &mut TxStats,
    data: &[u8],
    page_size: usize,
    pgid: PageId,
    parent: Option<NodeId>,
) -> Result<NodeId> {
    if let Some(&id) = entry.nodes.get(&pgid) {
        return Ok(id);
    }

    let p = page::page_at(data, page_size, pgid)?;
    let mut node = Node {
        parent,
        ..Node::default()
    };
    node.read(&p)?;

    let id = write.arena.alloc(node);
    if let Some(parent) = parent {
        write.arena[parent].children.push(id);
    }
    entry.nodes.insert(pgid, id);
    if pgid == entry.root {
        entry.root_node = Some(id);
    }
    stats.node_count += 1;
    Ok(id)
}

/// Index of `child` within its parent's inodes, located by bound key.
fn child_index(arena: &NodeArena, data: &[u8], parent: NodeId, child: NodeId) -> usize {
    let key = arena[child].bound_key.resolve(data).to_vec();
    arena[parent].index_of(data, &key).0
}

/// Frees the page backing `id`, if any, into the pending set.
fn free_node_page(
    write: &mut TxWrite<'_>,
    data: &[u8],
    page_size: usize,
    txid: TxId,
    id: NodeId,
) -> Result<()> {
    let pgid = write.arena[id].pgid;
    if pgid != 0 {
        let overflow = page::page_at(data, page_size, pgid)?.overflow;
        write.writer.freelist.free(txid, pgid, overflow);
        write.arena[id].pgid = 0;
    }
    Ok(())
}

/// Re-establishes the fill invariants after deletes: merges or rotates the
/// node with a sibling when it falls below a quarter page or its minimum key
/// count, collapsing single-child roots.
#[allow(clippy::too_many_arguments)]
fn rebalance_node(
    write: &mut TxWrite<'_>,
    entry: &mut BucketEntry,
    stats: &mut TxStats,
    data: &[u8],
    page_size: usize,
    txid: TxId,
    id: NodeId,
) -> Result<()> {
    if !write.arena[id].unbalanced {
        return Ok(());
    }
    write.arena[id].unbalanced = false;
    stats.rebalance += 1;

    let threshold = page_size / 4;
    if write.arena[id].size() > threshold
        && write.arena[id].inodes.len() > write.arena[id].min_keys()
    {
        return Ok(());
    }

    let Some(parent) = write.arena[id].parent else {
        // A branch root with a single child collapses into that child.
        if !write.arena[id].is_leaf && write.arena[id].inodes.len() == 1 {
            let child_pgid = write.arena[id].inodes[0].pgid;
            let child = node_for(write, entry, stats, data, page_size, child_pgid, Some(id))?;

            write.arena[id].is_leaf = write.arena[child].is_leaf;
            let hoisted_inodes = std::mem::take(&mut write.arena[child].inodes);
            let hoisted_children = std::mem::take(&mut write.arena[child].children);
            write.arena[id].inodes = hoisted_inodes;
            write.arena[id].children = hoisted_children;

            let grandchildren = write.arena[id].children.clone();
            for grandchild in grandchildren {
                write.arena[grandchild].parent = Some(id);
            }

            write.arena[child].parent = None;
            write.arena[child].unbalanced = false;
            entry.nodes.remove(&child_pgid);
            free_node_page(write, data, page_size, txid, child)?;
        }
        return Ok(());
    };

    debug_assert!(
        write.arena[parent].inodes.len() > 1,
        "parent must have at least 2 children"
    );
    if write.arena[parent].inodes.len() < 2 {
        return Ok(());
    }

    // The right sibling absorbs the first child; everyone else leans left.
    let index = child_index(&write.arena, data, parent, id);
    let use_next = index == 0;
    let target_index = if use_next { index + 1 } else { index - 1 };
    let target_pgid = write.arena[parent].inodes[target_index].pgid;
    let target = node_for(write, entry, stats, data, page_size, target_pgid, Some(parent))?;

    if write.arena[target].inodes.len() > write.arena[target].min_keys() {
        // The sibling can spare an element; rotate one over.
        if use_next {
            let moved = write.arena[target].inodes.remove(0);
            reparent_inode_child(write, entry, &moved, id);
            write.arena[id].inodes.push(moved);

            let old_key = write.arena[target].bound_key.to_vec(data);
            let new_key = write.arena[target].inodes[0].key.to_vec(data);
            let target_pgid = write.arena[target].pgid;
            write.arena[parent].put(data, &old_key, new_key.clone(), Vec::new(), target_pgid, 0);
            write.arena[target].bound_key = KvRef::Heap(new_key);
        } else {
            let Some(moved) = write.arena[target].inodes.pop() else {
                return Ok(());
            };
            reparent_inode_child(write, entry, &moved, id);
            write.arena[id].inodes.insert(0, moved);
        }

        let old_key = write.arena[id].bound_key.to_vec(data);
        let new_key = write.arena[id].inodes[0].key.to_vec(data);
        let node_pgid = write.arena[id].pgid;
        write.arena[parent].put(data, &old_key, new_key.clone(), Vec::new(), node_pgid, 0);
        write.arena[id].bound_key = KvRef::Heap(new_key);
        return Ok(());
    }

    // Both nodes are underfull: merge them and drop one from the parent.
    if use_next {
        let moved = std::mem::take(&mut write.arena[target].inodes);
        for ino in &moved {
            reparent_inode_child(write, entry, ino, id);
        }
        write.arena[id].inodes.extend(moved);

        let target_key = write.arena[target].bound_key.to_vec(data);
        write.arena[parent].del(data, &target_key);
        write.arena.remove_child(parent, target);
        // Fully detach the absorbed node so later rebalance passes skip it.
        write.arena[target].parent = None;
        write.arena[target].unbalanced = false;
        entry.nodes.remove(&write.arena[target].pgid);
        free_node_page(write, data, page_size, txid, target)?;
    } else {
        let moved = std::mem::take(&mut write.arena[id].inodes);
        for ino in &moved {
            reparent_inode_child(write, entry, ino, target);
        }
        write.arena[target].inodes.extend(moved);

        let node_key = write.arena[id].bound_key.to_vec(data);
        write.arena[parent].del(data, &node_key);
        write.arena.remove_child(parent, id);
        write.arena[id].parent = None;

        let old_key = write.arena[target].bound_key.to_vec(data);
        let new_key = write.arena[target].inodes[0].key.to_vec(data);
        let target_pgid = write.arena[target].pgid;
        write.arena[parent].put(data, &old_key, new_key.clone(), Vec::new(), target_pgid, 0);
        write.arena[target].bound_key = KvRef::Heap(new_key);

        entry.nodes.remove(&write.arena[id].pgid);
        free_node_page(write, data, page_size, txid, id)?;
    }

    // The parent lost an entry; it may be underfull now too.
    rebalance_node(write, entry, stats, data, page_size, txid, parent)
}

/// When a moved inode's child subtree is materialized, rehang the child node
/// under its new parent.
fn reparent_inode_child(
    write: &mut TxWrite<'_>,
    entry: &BucketEntry,
    ino: &crate::node::Inode,
    new_parent: NodeId,
) {
    if ino.pgid == 0 {
        return;
    }
    let Some(&child) = entry.nodes.get(&ino.pgid) else {
        return;
    };
    if let Some(old_parent) = write.arena[child].parent {
        write.arena.remove_child(old_parent, child);
    }
    write.arena[child].parent = Some(new_parent);
    write.arena[new_parent].children.push(child);
}

// ----------------------------------------------------------------------
// Spill
// ----------------------------------------------------------------------

/// Writes a node subtree to freshly allocated pages, children first,
/// splitting oversized nodes and updating parent separators as it goes.
#[allow(clippy::too_many_arguments)]
fn spill_node(
    db: &Db,
    meta: &mut Meta,
    write: &mut TxWrite<'_>,
    stats: &mut TxStats,
    overflows: &HashMap<PageId, u32>,
    txid: TxId,
    page_size: usize,
    id: NodeId,
) -> Result<()> {
    if write.arena[id].spilled {
        return Ok(());
    }

    let children = write.arena[id].children.clone();
    for child in children {
        spill_node(db, meta, write, stats, overflows, txid, page_size, child)?;
    }

    // This node is about to be rewritten elsewhere; release its old page.
    let old = write.arena[id].pgid;
    if old > 0 {
        let overflow = overflows.get(&old).copied().unwrap_or(0);
        write.writer.freelist.free(txid, old, overflow);
    }

    let (parts, splits) = write.arena.split(id, page_size);
    stats.split += splits;

    for part in parts {
        let size = write.arena[part].size();
        let count = size / page_size + 1;
        let pgid = allocate(db, meta, write, stats, count)?;
        {
            let buf = write.pages.get_mut(&pgid).ok_or(Error::AllocationFailed)?;
            write.arena[part].write(&[], buf)?;
        }
        write.arena[part].pgid = pgid;
        write.arena[part].spilled = true;

        if let Some(parent) = write.arena[part].parent {
            let old_key = {
                let bound = &write.arena[part].bound_key;
                if bound.len() > 0 {
                    bound.to_vec(&[])
                } else {
                    write.arena[part].inodes[0].key.to_vec(&[])
                }
            };
            let first_key = write.arena[part].inodes[0].key.to_vec(&[]);
            write.arena[parent].put(&[], &old_key, first_key.clone(), Vec::new(), pgid, 0);
            write.arena[part].bound_key = KvRef::Heap(first_key);
        }
        stats.spill += 1;
    }

    // A root split created a brand-new parent; it has no old page and no
    // further splits, write it directly.
    if let Some(parent) = write.arena[id].parent {
        if write.arena[parent].pgid == 0 && !write.arena[parent].spilled {
            let size = write.arena[parent].size();
            let count = size / page_size + 1;
            let pgid = allocate(db, meta, write, stats, count)?;
            {
                let buf = write.pages.get_mut(&pgid).ok_or(Error::AllocationFailed)?;
                write.arena[parent].write(&[], buf)?;
            }
            write.arena[parent].pgid = pgid;
            write.arena[parent].spilled = true;
        }
    }

    Ok(())
}

/// Hands out a run of `count` contiguous pages: from the freelist when
/// possible, otherwise from the high-water mark, growing the mapping when
/// the file is about to outrun it.
fn allocate(
    db: &Db,
    meta: &mut Meta,
    write: &mut TxWrite<'_>,
    stats: &mut TxStats,
    count: usize,
) -> Result<PageId> {
    let page_size = db.page_size();

    let mut pgid = write.writer.freelist.allocate(count);
    if pgid != 0 {
        // Freelist pages must go back on rollback; high-water pages need no
        // tracking because an aborted transaction's high-water mark is never
        // persisted.
        for i in 0..count as u64 {
            write.allocated.push(pgid + i);
        }
    } else {
        pgid = meta.high_water();
        let min_size = (pgid + count as u64 + 1) * page_size as u64;
        if min_size > db.mapped_len() as u64 {
            db.grow_mmap(min_size).map_err(|err| {
                trace!(%err, "mmap grow failed");
                Error::AllocationFailed
            })?;
        }
        meta.set_high_water(pgid + count as u64);
    }

    let mut buf = vec![0u8; count * page_size];
    {
        let hdr = page::header_mut(&mut buf)?;
        hdr.set_id(pgid);
        hdr.set_overflow(count as u32 - 1);
    }
    write.pages.insert(pgid, buf);

    stats.page_count += 1;
    stats.page_alloc += (count * page_size) as u64;
    Ok(pgid)
}
