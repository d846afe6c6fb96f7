//! # Freelist
//!
//! Tracks page ids that are free for reuse plus pages freed by a transaction
//! that may still be visible to older readers. A page freed by transaction T
//! stays in `pending[T]` until every reader with a snapshot txid ≤ T has
//! finished; only then does [`Freelist::release`] move it into the reusable
//! set. This is the reclamation half of the MVCC story: copy-on-write makes
//! old generations immortal until nobody can see them.
//!
//! ## On-Disk Encoding
//!
//! A freelist page is a header followed by the page ids in ascending order.
//! The header's 16-bit count field saturates: when the list holds 0xFFFF or
//! more ids the count is stored as a u64 in the first 8 payload bytes. Both
//! the reusable ids and all pending ids are written out; pending entries
//! only matter to in-flight readers, which do not survive a restart.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::page::{self, PageFlags, PageId, PageRef, TxId, PAGE_HEADER_SIZE};

/// Raw count value signalling the u64 count extension.
const LARGE_COUNT: usize = 0xFFFF;

#[derive(Debug, Default)]
pub(crate) struct Freelist {
    /// Sorted page ids available for immediate reuse.
    ids: Vec<PageId>,
    /// Pages freed per transaction, awaiting release.
    pending: BTreeMap<TxId, Vec<PageId>>,
}

impl Freelist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of tracked page ids, reusable and pending.
    pub fn count(&self) -> usize {
        self.ids.len() + self.pending.values().map(Vec::len).sum::<usize>()
    }

    /// Returns the starting page of a contiguous run of `n` free pages, or 0
    /// if no such run exists and the caller must extend the file.
    pub fn allocate(&mut self, n: usize) -> PageId {
        if n == 0 {
            return 0;
        }

        let mut run = 0usize;
        let mut previd: PageId = 0;
        for (i, &id) in self.ids.iter().enumerate() {
            if previd == 0 || id - previd != 1 {
                run = 1;
            } else {
                run += 1;
            }

            if run == n {
                let base = id - (n as PageId - 1);
                self.ids.drain(i + 1 - n..=i);
                return base;
            }

            previd = id;
        }
        0
    }

    /// Queues a page (and its overflow pages) freed by `txid` for release
    /// once no older reader can reach it.
    pub fn free(&mut self, txid: TxId, pgid: PageId, overflow: u32) {
        assert!(pgid > 1, "cannot free meta page {pgid}");
        let entry = self.pending.entry(txid).or_default();
        for i in 0..=overflow as PageId {
            entry.push(pgid + i);
        }
    }

    /// Moves every pending entry freed by transactions ≤ `max_txid` into the
    /// reusable set.
    pub fn release(&mut self, max_txid: TxId) {
        let released: Vec<TxId> = self
            .pending
            .range(..=max_txid)
            .map(|(&txid, _)| txid)
            .collect();
        for txid in released {
            if let Some(mut ids) = self.pending.remove(&txid) {
                self.ids.append(&mut ids);
            }
        }
        self.ids.sort_unstable();
    }

    /// Undoes an aborted write transaction: its pending frees are forgotten
    /// (the pages remain live) and the ids it allocated return to the pool.
    pub fn rollback(&mut self, txid: TxId, allocated: &[PageId]) {
        self.pending.remove(&txid);
        self.ids.extend_from_slice(allocated);
        self.ids.sort_unstable();
    }

    /// Whether `pgid` is tracked as free or pending-free.
    pub fn is_free(&self, pgid: PageId) -> bool {
        self.ids.binary_search(&pgid).is_ok()
            || self.pending.values().any(|ids| ids.contains(&pgid))
    }

    /// Serialized byte length, header included.
    pub fn size(&self) -> usize {
        let n = self.count();
        let mut size = PAGE_HEADER_SIZE + 8 * n;
        if n >= LARGE_COUNT {
            size += 8;
        }
        size
    }

    /// Rebuilds the in-memory state from a freelist page.
    pub fn read(&mut self, p: &PageRef<'_>) -> Result<()> {
        let payload = p.payload();
        let (count, body) = if p.raw_count() == LARGE_COUNT {
            let bytes = payload.get(..8).ok_or(Error::FreelistCorrupt)?;
            let count = u64::from_le_bytes(bytes.try_into().map_err(|_| Error::FreelistCorrupt)?);
            (count as usize, &payload[8..])
        } else {
            (p.raw_count(), payload)
        };

        let bytes = count.checked_mul(8).ok_or(Error::FreelistCorrupt)?;
        let Some(body) = body.get(..bytes) else {
            return Err(Error::FreelistCorrupt);
        };

        self.ids = body
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap_or_default()))
            .collect();
        self.ids.sort_unstable();
        self.pending.clear();
        Ok(())
    }

    /// Serializes all tracked ids (reusable and pending, merged and sorted)
    /// into a page buffer whose length is a multiple of `page_size`.
    pub fn write(&self, buf: &mut [u8], id: PageId, page_size: usize) -> Result<()> {
        let mut all: Vec<PageId> = self.ids.clone();
        for ids in self.pending.values() {
            all.extend_from_slice(ids);
        }
        all.sort_unstable();

        let buf_len = buf.len();
        let hdr = page::header_mut(buf)?;
        hdr.set_id(id);
        hdr.set_page_flags(PageFlags::FREELIST);
        hdr.set_overflow((buf_len / page_size - 1) as u32);

        let payload_off = if all.len() >= LARGE_COUNT {
            hdr.set_count(LARGE_COUNT as u16);
            buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 8]
                .copy_from_slice(&(all.len() as u64).to_le_bytes());
            PAGE_HEADER_SIZE + 8
        } else {
            hdr.set_count(all.len() as u16);
            PAGE_HEADER_SIZE
        };

        for (i, pgid) in all.iter().enumerate() {
            let off = payload_off + i * 8;
            buf[off..off + 8].copy_from_slice(&pgid.to_le_bytes());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::page_at;

    #[test]
    fn allocate_finds_contiguous_run() {
        let mut f = Freelist {
            ids: vec![3, 4, 5, 6, 7, 9, 12, 13],
            pending: BTreeMap::new(),
        };

        assert_eq!(f.allocate(3), 3);
        assert_eq!(f.ids, vec![6, 7, 9, 12, 13]);

        assert_eq!(f.allocate(1), 6);
        assert_eq!(f.allocate(3), 0);
        assert_eq!(f.allocate(2), 12);
        assert_eq!(f.ids, vec![7, 9]);
    }

    #[test]
    fn allocate_on_empty_list_returns_zero() {
        let mut f = Freelist::new();
        assert_eq!(f.allocate(1), 0);
    }

    #[test]
    fn free_spreads_overflow_pages() {
        let mut f = Freelist::new();
        f.free(7, 10, 2);
        assert_eq!(f.pending[&7], vec![10, 11, 12]);
        assert!(f.is_free(11));
        assert_eq!(f.allocate(1), 0);
    }

    #[test]
    #[should_panic(expected = "cannot free meta page")]
    fn freeing_a_meta_page_panics() {
        let mut f = Freelist::new();
        f.free(1, 1, 0);
    }

    #[test]
    fn release_merges_pending_up_to_txid() {
        let mut f = Freelist::new();
        f.free(5, 20, 0);
        f.free(6, 10, 0);
        f.free(8, 30, 0);

        f.release(6);
        assert_eq!(f.ids, vec![10, 20]);
        assert!(f.pending.contains_key(&8));

        f.release(100);
        assert_eq!(f.ids, vec![10, 20, 30]);
        assert!(f.pending.is_empty());
    }

    #[test]
    fn rollback_discards_pending_and_restores_allocations() {
        let mut f = Freelist {
            ids: vec![4, 5],
            pending: BTreeMap::new(),
        };
        let base = f.allocate(2);
        assert_eq!(base, 4);
        f.free(9, 12, 0);

        f.rollback(9, &[4, 5]);
        assert_eq!(f.ids, vec![4, 5]);
        assert!(!f.is_free(12));
    }

    #[test]
    fn write_read_roundtrip() {
        let mut f = Freelist::new();
        f.free(3, 11, 1);
        f.free(4, 5, 0);
        f.release(4);

        let page_size = 4096;
        let mut buf = vec![0u8; page_size];
        f.write(&mut buf, 2, page_size).unwrap();

        let mut restored = Freelist::new();
        let p = page_at(&buf, page_size, 0).unwrap();
        restored.read(&p).unwrap();
        assert_eq!(restored.ids, vec![5, 11, 12]);
    }

    #[test]
    fn write_merges_pending_entries() {
        let mut f = Freelist::new();
        f.free(9, 7, 0);

        let page_size = 4096;
        let mut buf = vec![0u8; page_size];
        f.write(&mut buf, 2, page_size).unwrap();

        let mut restored = Freelist::new();
        let p = page_at(&buf, page_size, 0).unwrap();
        restored.read(&p).unwrap();
        assert_eq!(restored.ids, vec![7]);
    }

    #[test]
    fn large_count_uses_u64_extension() {
        let page_size = 4096;
        let mut f = Freelist::new();
        f.ids = (2..2 + LARGE_COUNT as PageId + 10).collect();

        let pages = f.size().div_ceil(page_size);
        let mut buf = vec![0u8; pages * page_size];
        f.write(&mut buf, 2, page_size).unwrap();

        let p = page_at(&buf, page_size, 0).unwrap();
        assert_eq!(p.raw_count(), LARGE_COUNT);

        let mut restored = Freelist::new();
        restored.read(&p).unwrap();
        assert_eq!(restored.ids.len(), LARGE_COUNT + 10);
        assert_eq!(restored.ids.first(), Some(&2));
    }

    #[test]
    fn oversized_count_is_corrupt() {
        let page_size = 4096;
        let mut buf = vec![0u8; page_size];
        {
            let hdr = page::header_mut(&mut buf).unwrap();
            hdr.set_page_flags(PageFlags::FREELIST);
            hdr.set_count(5000);
        }

        let p = page_at(&buf, page_size, 0).unwrap();
        let mut f = Freelist::new();
        assert!(matches!(f.read(&p), Err(Error::FreelistCorrupt)));
    }
}
