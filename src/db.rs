//! # Database
//!
//! Process-wide handle owning the data file, its exclusive OS lock, the
//! read-only mapping and the lock hierarchy:
//!
//! - `writer` mutex: held for the whole life of a write transaction, so
//!   there is exactly one writer at a time.
//! - `mmap` read/write lock: every transaction holds the shared side while
//!   it might read mapped pages; remapping (growth, close) takes the
//!   exclusive side and therefore waits for all live transactions.
//! - `state` mutex: short critical sections guarding the open-reader set
//!   and the accumulated statistics.
//!
//! Acquire order is writer → mmap → state; no code path holds a later lock
//! while blocking on an earlier one.
//!
//! A fresh file is initialized with a four-page skeleton: two meta pages
//! (generations 0 and 1), an empty freelist page and an empty buckets page.
//! The meta whose txid is higher and whose checksum validates is the
//! current generation on every open, which is the entire recovery story:
//! a crash mid-commit leaves a torn meta in one slot and the intact
//! previous generation in the other.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, trace};
use zerocopy::FromZeros;

use crate::error::{Error, Result};
use crate::freelist::Freelist;
use crate::meta::{self, Meta, MAGIC, VERSION};
use crate::mmap::{self, MmapRegion};
use crate::page::{self, PageFlags, TxId, PAGE_HEADER_SIZE};
use crate::tx::{Tx, TxStats};

/// Ongoing performance counters, updated as transactions close.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub tx_stats: TxStats,
}

impl Stats {
    /// Difference between two snapshots taken at different times.
    pub fn sub(&self, other: &Stats) -> Stats {
        Stats {
            tx_stats: self.tx_stats.sub(&other.tx_stats),
        }
    }
}

/// State only the single writer touches; owning the mutex guard IS the
/// write permission.
pub(crate) struct WriterState {
    pub freelist: Freelist,
}

struct SharedState {
    opened: bool,
    /// Snapshot txids of live read transactions.
    read_txs: Vec<TxId>,
    stats: Stats,
}

/// A collection of buckets persisted to a single file on disk. All access
/// goes through transactions obtained from [`Db::begin`], [`Db::update`] or
/// [`Db::view`].
pub struct Db {
    file: File,
    path: PathBuf,
    page_size: usize,
    mmap: RwLock<MmapRegion>,
    state: Mutex<SharedState>,
    writer: Mutex<WriterState>,
}

impl Db {
    /// Creates and opens a database at `path` with the given file mode. The
    /// file is created if missing and locked exclusively against other
    /// processes.
    pub fn open(path: impl AsRef<Path>, mode: u32) -> Result<Db> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(mode)
            .open(&path)?;

        // Two processes writing meta and free pages independently would
        // corrupt the file.
        flock_exclusive(&file)?;

        let size = file.metadata()?.len();
        let page_size = if size == 0 {
            let page_size = os_page_size();
            init_file(&file, page_size)?;
            debug!(page_size, "initialized new database file");
            page_size
        } else {
            // The page size lives in meta 0; read the smallest prefix that
            // must contain it.
            let take = size.min(4096) as usize;
            if take < PAGE_HEADER_SIZE + meta::META_SIZE {
                return Err(Error::InvalidMeta);
            }
            let mut buf = vec![0u8; take];
            file.read_exact_at(&mut buf, 0)?;
            meta::discover_page_size(&buf)? as usize
        };

        let db = Db {
            file,
            path,
            page_size,
            mmap: RwLock::new(MmapRegion::new()),
            state: Mutex::new(SharedState {
                opened: true,
                read_txs: Vec::new(),
                stats: Stats::default(),
            }),
            writer: Mutex::new(WriterState {
                freelist: Freelist::new(),
            }),
        };
        db.remap_to_fit(0)?;

        {
            let mut writer = db.writer.lock();
            let region = db.mmap.read();
            let current = meta::load_current(region.data(), db.page_size)?;
            let p = page::page_at(region.data(), db.page_size, current.freelist_root())?;
            writer.freelist.read(&p)?;
        }

        debug!(path = %db.path.display(), page_size = db.page_size, "opened database");
        Ok(db)
    }

    /// Path of the open database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Starts a transaction. Multiple read transactions may run
    /// concurrently; a second write transaction blocks until the first
    /// finishes. Read transactions must be closed (dropped or rolled back)
    /// promptly or the database cannot reclaim old pages.
    pub fn begin(&self, writable: bool) -> Result<Tx<'_>> {
        if !self.state.lock().opened {
            return Err(Error::DatabaseNotOpen);
        }
        if writable {
            let writer = self.writer.lock();
            if !self.state.lock().opened {
                return Err(Error::DatabaseNotOpen);
            }
            Tx::new_write(self, writer)
        } else {
            Tx::new_read(self)
        }
    }

    /// Runs `f` inside a managed write transaction: committed when `f`
    /// succeeds, rolled back when it fails. Calling commit or rollback
    /// inside `f` fails with [`Error::ManagedTx`].
    pub fn update<T>(&self, f: impl FnOnce(&mut Tx<'_>) -> Result<T>) -> Result<T> {
        let mut tx = self.begin(true)?;
        tx.managed = true;
        let result = f(&mut tx);
        tx.managed = false;
        match result {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                let _ = tx.rollback();
                Err(err)
            }
        }
    }

    /// Runs `f` inside a managed read-only transaction.
    pub fn view<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        let mut tx = self.begin(false)?;
        tx.managed = true;
        let result = f(&tx);
        tx.managed = false;
        match result {
            Ok(value) => {
                tx.rollback()?;
                Ok(value)
            }
            Err(err) => {
                let _ = tx.rollback();
                Err(err)
            }
        }
    }

    /// Streams a byte-identical image of the database to `writer`. A read
    /// transaction pins reclamation for the duration, so concurrent use is
    /// safe; the image covers the file up to the snapshot's high-water mark.
    pub fn copy_to<W: Write>(&self, writer: &mut W) -> Result<u64> {
        let tx = self.begin(false)?;
        let size = tx.high_water() * self.page_size as u64;

        let file = File::open(&self.path)?;
        let mut reader = file.take(size);
        let copied = io::copy(&mut reader, writer)?;
        drop(tx);

        if copied != size {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short database copy",
            )));
        }
        Ok(copied)
    }

    /// Copies the database to a new file at `path`.
    pub fn copy_file(&self, path: impl AsRef<Path>) -> Result<u64> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let copied = self.copy_to(&mut file)?;
        file.sync_all()?;
        Ok(copied)
    }

    /// Performance counters accumulated over closed transactions.
    pub fn stats(&self) -> Stats {
        self.state.lock().stats
    }

    /// Runs consistency checks over the whole file: every page below the
    /// high-water mark must be reachable from the current meta exactly once
    /// or tracked by the freelist. All findings are accumulated and returned
    /// together as [`Error::Check`].
    pub fn check(&self) -> Result<()> {
        self.update(|tx| {
            let errors = tx.run_check()?;
            if errors.is_empty() {
                Ok(())
            } else {
                Err(Error::Check(errors))
            }
        })
    }

    /// Releases the mapping and the OS file lock. Blocks until every live
    /// transaction has finished; new transactions fail with
    /// [`Error::DatabaseNotOpen`].
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if !state.opened {
                return Ok(());
            }
            state.opened = false;
        }

        let mut region = self.mmap.write();
        region.unmap();
        drop(region);

        self.file.sync_all()?;
        funlock(&self.file);
        debug!(path = %self.path.display(), "closed database");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internal services for transactions
    // ------------------------------------------------------------------

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    /// Shared hold on the mapping. Recursive acquisition is deliberate: a
    /// thread may run a write transaction while its own read transaction is
    /// still open without deadlocking against a queued exclusive request.
    pub(crate) fn mmap_read(&self) -> RwLockReadGuard<'_, MmapRegion> {
        self.mmap.read_recursive()
    }

    pub(crate) fn mapped_len(&self) -> usize {
        self.mmap.read_recursive().len()
    }

    /// Grows the mapping to cover at least `min_size` bytes. Blocks until
    /// all live transactions have released the shared side; the calling
    /// writer has already dereferenced its nodes and dropped its own hold.
    pub(crate) fn grow_mmap(&self, min_size: u64) -> Result<()> {
        trace!(min_size, "growing mmap");
        self.remap_to_fit(min_size)
    }

    fn remap_to_fit(&self, min_size: u64) -> Result<()> {
        let mut region = self.mmap.write();
        let file_len = self.file.metadata()?.len();
        if (file_len as usize) < self.page_size * 2 {
            return Err(Error::InvalidMeta);
        }
        let target = mmap::mmap_size(self.page_size, file_len.max(min_size));
        region.remap(&self.file, target as usize)?;

        // Both meta slots are re-read through the new mapping; at least one
        // generation must validate.
        meta::load_current(region.data(), self.page_size)?;
        Ok(())
    }

    pub(crate) fn register_read(&self, txid: TxId) {
        self.state.lock().read_txs.push(txid);
    }

    pub(crate) fn deregister_read(&self, txid: TxId) {
        let mut state = self.state.lock();
        if let Some(pos) = state.read_txs.iter().position(|&t| t == txid) {
            state.read_txs.swap_remove(pos);
        }
    }

    pub(crate) fn min_read_txid(&self) -> Option<TxId> {
        self.state.lock().read_txs.iter().min().copied()
    }

    pub(crate) fn merge_stats(&self, stats: &TxStats) {
        self.state.lock().stats.tx_stats.add(stats);
    }

    pub(crate) fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    pub(crate) fn sync_data(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Writes the four-page skeleton of a fresh database: meta generations 0
/// and 1, an empty freelist at page 2 and an empty buckets page at page 3.
fn init_file(file: &File, page_size: usize) -> Result<()> {
    let mut buf = vec![0u8; page_size * 4];

    for i in 0..2u64 {
        let mut m = Meta::new_zeroed();
        m.set_magic(MAGIC);
        m.set_version(VERSION);
        m.set_page_size(page_size as u32);
        m.set_freelist_root(2);
        m.set_buckets_root(3);
        m.set_high_water(4);
        m.set_txid(i);

        let start = i as usize * page_size;
        meta::write_into(&mut buf[start..start + page_size], i, &m)?;
    }

    {
        let hdr = page::header_mut(&mut buf[page_size * 2..])?;
        hdr.set_id(2);
        hdr.set_page_flags(PageFlags::FREELIST);
    }
    {
        let hdr = page::header_mut(&mut buf[page_size * 3..])?;
        hdr.set_id(3);
        hdr.set_page_flags(PageFlags::BUCKETS);
    }

    file.write_all_at(&buf, 0)?;
    file.sync_all()?;
    Ok(())
}

fn os_page_size() -> usize {
    // SAFETY: sysconf is always safe to call; a failure returns -1.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n <= 0 {
        4096
    } else {
        n as usize
    }
}

fn flock_exclusive(file: &File) -> Result<()> {
    // SAFETY: flock on a valid owned descriptor.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Err(Error::DatabaseInUse);
        }
        return Err(err.into());
    }
    Ok(())
}

fn funlock(file: &File) {
    // SAFETY: flock on a valid owned descriptor; the result only matters on
    // the lock path.
    let _ = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
}
