//! # Buckets
//!
//! A bucket is a named key/value collection: a record in the buckets
//! directory page pairing a tree root with a monotonic sequence counter.
//! [`Bucket`] is a thin façade over the cursor and node layers; all tree
//! machinery lives in the transaction.
//!
//! ## Directory Page Encoding
//!
//! The buckets page holds `count` records in ascending name order, packed
//! back to back after the page header:
//!
//! ```text
//! Offset  Size  Field      Description
//! ------  ----  ---------  --------------------------------
//! 0       8     root       Tree root page id (0 = empty tree)
//! 8       8     sequence   Last value handed out by next_sequence
//! 16      2     name_len   Bucket name length in bytes
//! 18      n     name       UTF-8 bucket name
//! ```
//!
//! The directory page is copy-on-write like every other page: each commit
//! that touches it frees the old page and writes a fresh one.

use std::collections::{BTreeMap, HashMap};

use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::node::NodeId;
use crate::page::{self, PageFlags, PageId, PageRef, PAGE_HEADER_SIZE};
use crate::tx::Tx;

pub const MAX_KEY_SIZE: usize = 32768;
pub const MAX_VALUE_SIZE: usize = (1 << 31) - 1;
pub const MAX_BUCKET_NAME_SIZE: usize = 255;

const RECORD_FIXED_SIZE: usize = 18;

/// Per-transaction state of one bucket: the persisted record plus the nodes
/// this transaction has materialized from its tree.
#[derive(Debug, Default)]
pub(crate) struct BucketEntry {
    pub root: PageId,
    pub sequence: u64,
    /// In-memory root, present once the tree has been touched.
    pub root_node: Option<NodeId>,
    /// Materialized nodes of this bucket's tree, by source page.
    pub nodes: HashMap<PageId, NodeId>,
}

/// A named key/value collection inside a transaction.
pub struct Bucket<'tx, 'db> {
    tx: &'tx Tx<'db>,
    name: String,
}

impl<'tx, 'db> Bucket<'tx, 'db> {
    pub(crate) fn new(tx: &'tx Tx<'db>, name: String) -> Self {
        Bucket { tx, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn writable(&self) -> bool {
        self.tx.writable()
    }

    /// A cursor over this bucket, valid for the life of the transaction.
    pub fn cursor(&self) -> Result<Cursor<'tx, 'db>> {
        self.tx.new_cursor(&self.name)
    }

    /// Retrieves the value stored under `key`, or `None`.
    pub fn get(&self, key: &[u8]) -> Result<Option<&'tx [u8]>> {
        let mut cursor = self.cursor()?;
        match cursor.seek(key)? {
            Some((found, value)) if found == key => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    /// Sets `key` to `value`, overwriting any previous value.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if !self.writable() {
            return Err(Error::BucketNotWritable);
        }
        if key.is_empty() {
            return Err(Error::KeyRequired);
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge);
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLarge);
        }
        self.tx.put_in_bucket(&self.name, key, value)
    }

    /// Removes `key`; removing a missing key is a no-op.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        if !self.writable() {
            return Err(Error::BucketNotWritable);
        }
        self.tx.delete_in_bucket(&self.name, key)
    }

    /// Returns the next value of the bucket's autoincrementing counter.
    pub fn next_sequence(&self) -> Result<u64> {
        if !self.writable() {
            return Err(Error::BucketNotWritable);
        }
        self.tx.bucket_next_sequence(&self.name)
    }

    /// Calls `f` for every key/value pair in key order. Iteration stops at
    /// the first error, which is returned.
    pub fn for_each(&self, mut f: impl FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        let mut cursor = self.cursor()?;
        let mut item = cursor.first()?;
        while let Some((key, value)) = item {
            f(key, value)?;
            item = cursor.next()?;
        }
        Ok(())
    }

    /// Walks the bucket's committed tree and gathers page statistics.
    pub fn stat(&self) -> Result<BucketStat> {
        let root = self.tx.bucket_root(&self.name)?;
        let mut stat = BucketStat::default();
        if root == 0 {
            return Ok(stat);
        }
        self.tx.for_each_page(root, 0, &mut |p, depth| {
            if p.is_leaf() {
                stat.leaf_page_count += 1;
                stat.key_count += p.count;
            } else if p.is_branch() {
                stat.branch_page_count += 1;
            }
            stat.overflow_page_count += p.overflow as usize;
            if depth + 1 > stat.max_depth {
                stat.max_depth = depth + 1;
            }
        })?;
        Ok(stat)
    }
}

/// Page statistics for a single bucket.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BucketStat {
    pub branch_page_count: usize,
    pub leaf_page_count: usize,
    pub overflow_page_count: usize,
    pub key_count: usize,
    pub max_depth: usize,
}

/// Decodes the buckets directory page into per-bucket entries.
pub(crate) fn read_directory(p: &PageRef<'_>) -> Result<BTreeMap<String, BucketEntry>> {
    if !p.flags.contains(PageFlags::BUCKETS) {
        return Err(Error::CorruptPage(p.id));
    }

    let payload = p.payload();
    let mut map = BTreeMap::new();
    let mut off = 0usize;
    for _ in 0..p.count {
        let fixed = payload
            .get(off..off + RECORD_FIXED_SIZE)
            .ok_or(Error::CorruptPage(p.id))?;
        let root = u64::from_le_bytes(fixed[0..8].try_into().unwrap_or_default());
        let sequence = u64::from_le_bytes(fixed[8..16].try_into().unwrap_or_default());
        let name_len = u16::from_le_bytes(fixed[16..18].try_into().unwrap_or_default()) as usize;

        let start = off + RECORD_FIXED_SIZE;
        let name_bytes = payload
            .get(start..start + name_len)
            .ok_or(Error::CorruptPage(p.id))?;
        let name =
            String::from_utf8(name_bytes.to_vec()).map_err(|_| Error::CorruptPage(p.id))?;

        map.insert(
            name,
            BucketEntry {
                root,
                sequence,
                ..BucketEntry::default()
            },
        );
        off = start + name_len;
    }
    Ok(map)
}

/// Serialized byte length of the directory, header included.
pub(crate) fn directory_size(map: &BTreeMap<String, BucketEntry>) -> usize {
    map.keys()
        .fold(PAGE_HEADER_SIZE, |acc, name| {
            acc + RECORD_FIXED_SIZE + name.len()
        })
}

/// Serializes the directory into a zeroed page buffer.
pub(crate) fn write_directory(
    map: &BTreeMap<String, BucketEntry>,
    buf: &mut [u8],
    id: PageId,
    page_size: usize,
) -> Result<()> {
    assert!(map.len() < 0xFFFF, "too many buckets for one directory page");

    let buf_len = buf.len();
    let hdr = page::header_mut(buf)?;
    hdr.set_id(id);
    hdr.set_page_flags(PageFlags::BUCKETS);
    hdr.set_count(map.len() as u16);
    hdr.set_overflow((buf_len / page_size - 1) as u32);

    let mut off = PAGE_HEADER_SIZE;
    for (name, entry) in map {
        buf[off..off + 8].copy_from_slice(&entry.root.to_le_bytes());
        buf[off + 8..off + 16].copy_from_slice(&entry.sequence.to_le_bytes());
        buf[off + 16..off + 18].copy_from_slice(&(name.len() as u16).to_le_bytes());
        off += RECORD_FIXED_SIZE;
        buf[off..off + name.len()].copy_from_slice(name.as_bytes());
        off += name.len();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::page_at;

    #[test]
    fn directory_roundtrip() {
        let mut map = BTreeMap::new();
        map.insert(
            "widgets".to_string(),
            BucketEntry {
                root: 7,
                sequence: 42,
                ..BucketEntry::default()
            },
        );
        map.insert(
            "gadgets".to_string(),
            BucketEntry {
                root: 0,
                sequence: 0,
                ..BucketEntry::default()
            },
        );

        let page_size = 4096;
        let mut buf = vec![0u8; page_size];
        write_directory(&map, &mut buf, 3, page_size).unwrap();

        let p = page_at(&buf, page_size, 0).unwrap();
        let restored = read_directory(&p).unwrap();

        assert_eq!(restored.len(), 2);
        assert_eq!(restored["widgets"].root, 7);
        assert_eq!(restored["widgets"].sequence, 42);
        assert_eq!(restored["gadgets"].root, 0);
    }

    #[test]
    fn empty_directory_roundtrip() {
        let map = BTreeMap::new();
        let page_size = 4096;
        let mut buf = vec![0u8; page_size];
        write_directory(&map, &mut buf, 3, page_size).unwrap();

        let p = page_at(&buf, page_size, 0).unwrap();
        assert!(read_directory(&p).unwrap().is_empty());
    }

    #[test]
    fn truncated_record_is_corrupt() {
        let mut buf = vec![0u8; 4096];
        {
            let hdr = page::header_mut(&mut buf).unwrap();
            hdr.set_page_flags(PageFlags::BUCKETS);
            hdr.set_count(1);
            // Record bytes are zero, so name_len reads as 0 and succeeds;
            // claim a second record that runs off the page instead.
            hdr.set_count(200);
        }
        buf[PAGE_HEADER_SIZE + 16] = 0xFF;
        buf[PAGE_HEADER_SIZE + 17] = 0x7F;

        let p = page_at(&buf, 4096, 0).unwrap();
        assert!(matches!(
            read_directory(&p),
            Err(Error::CorruptPage(0))
        ));
    }

    #[test]
    fn wrong_page_kind_is_corrupt() {
        let mut buf = vec![0u8; 4096];
        {
            let hdr = page::header_mut(&mut buf).unwrap();
            hdr.set_page_flags(PageFlags::LEAF);
        }
        let p = page_at(&buf, 4096, 0).unwrap();
        assert!(matches!(read_directory(&p), Err(Error::CorruptPage(0))));
    }
}
