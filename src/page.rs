//! # On-Disk Page Layout
//!
//! Every page begins with a 16-byte header followed by type-specific content.
//! All multi-byte fields are little-endian; the header structs use zerocopy
//! for safe transmutation straight out of the mmap region.
//!
//! ## Page Header Layout (16 bytes)
//!
//! ```text
//! Offset  Size  Field     Description
//! ------  ----  --------  ------------------------------------------
//! 0       8     id        Page id (file offset = id * page_size)
//! 8       2     flags     Page kind (branch, leaf, meta, freelist, buckets)
//! 10      2     count     Number of elements on the page
//! 12      4     overflow  Extra contiguous pages (logical size = 1 + overflow)
//! ```
//!
//! ## Leaf and Branch Pages
//!
//! After the header comes an element array, then a heap of key/value bytes:
//!
//! ```text
//! +------------------+
//! | Header (16B)     |
//! +------------------+
//! | Element Array    |  16 bytes per element, written front to back
//! +------------------+
//! | Key/Value Heap   |  starts at header + 16 * count, written in
//! |                  |  element order
//! +------------------+
//! ```
//!
//! Each element's `pos` field is the forward byte distance from the element
//! itself to its key; a leaf element's value immediately follows its key.
//! Every computed key/value range is bounds-checked against the logical page
//! and fails with [`Error::CorruptPage`] when it escapes.
//!
//! ## Reserved Flag Bits
//!
//! Bits `0x40` and `0x8000` are reserved: they are ignored on read and never
//! set on write.

use bitflags::bitflags;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Error, Result};

/// Identifies a fixed-size page in the data file.
pub type PageId = u64;

/// Monotonically increasing write-transaction generation number.
pub type TxId = u64;

pub const PAGE_HEADER_SIZE: usize = 16;
pub const LEAF_ELEMENT_SIZE: usize = 16;
pub const BRANCH_ELEMENT_SIZE: usize = 16;

/// Minimum number of inodes a page keeps on either side of a split.
pub(crate) const MIN_KEYS_PER_PAGE: usize = 2;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        const BRANCH = 0x01;
        const LEAF = 0x02;
        const META = 0x04;
        const FREELIST = 0x08;
        const BUCKETS = 0x10;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    id: U64,
    flags: U16,
    count: U16,
    overflow: U32,
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    zerocopy_accessors! {
        id: u64,
        flags: u16,
        count: u16,
        overflow: u32,
    }

    pub fn page_flags(&self) -> PageFlags {
        // Unknown bits are reserved; drop them instead of failing.
        PageFlags::from_bits_truncate(self.flags.get())
    }

    pub fn set_page_flags(&mut self, flags: PageFlags) {
        self.flags = U16::new(flags.bits());
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct LeafElement {
    flags: U32,
    pos: U32,
    ksize: U32,
    vsize: U32,
}

const _: () = assert!(std::mem::size_of::<LeafElement>() == LEAF_ELEMENT_SIZE);

impl LeafElement {
    zerocopy_accessors! {
        flags: u32,
        pos: u32,
        ksize: u32,
        vsize: u32,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BranchElement {
    pos: U32,
    ksize: U32,
    pgid: U64,
}

const _: () = assert!(std::mem::size_of::<BranchElement>() == BRANCH_ELEMENT_SIZE);

impl BranchElement {
    zerocopy_accessors! {
        pos: u32,
        ksize: u32,
        pgid: u64,
    }
}

/// Parses a page header from the front of a raw page buffer.
pub(crate) fn header(buf: &[u8]) -> Result<&PageHeader> {
    let bytes = buf.get(..PAGE_HEADER_SIZE).ok_or(Error::InvalidMeta)?;
    PageHeader::ref_from_bytes(bytes).map_err(|_| Error::InvalidMeta)
}

/// Mutable view of a page header at the front of a raw page buffer.
pub(crate) fn header_mut(buf: &mut [u8]) -> Result<&mut PageHeader> {
    let bytes = buf.get_mut(..PAGE_HEADER_SIZE).ok_or(Error::InvalidMeta)?;
    PageHeader::mut_from_bytes(bytes).map_err(|_| Error::InvalidMeta)
}

/// A borrowed, bounds-checked view of one logical page (base page plus its
/// overflow pages) inside the mapped file.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PageRef<'a> {
    pub id: PageId,
    /// Absolute byte offset of the page within the file.
    pub base: usize,
    pub flags: PageFlags,
    pub count: usize,
    pub overflow: u32,
    buf: &'a [u8],
}

/// A decoded leaf element with its key and value borrowed from the page.
pub(crate) struct LeafItem<'a> {
    pub flags: u32,
    pub key: &'a [u8],
    pub value: &'a [u8],
    /// Absolute file offset of the key bytes.
    pub key_pos: usize,
}

/// A decoded branch element pointing at a child subtree.
pub(crate) struct BranchItem<'a> {
    pub pgid: PageId,
    pub key: &'a [u8],
    /// Absolute file offset of the key bytes.
    pub key_pos: usize,
}

/// Resolves a typed view of page `id` within the mapped region.
pub(crate) fn page_at(data: &[u8], page_size: usize, id: PageId) -> Result<PageRef<'_>> {
    let base = (id as usize)
        .checked_mul(page_size)
        .ok_or(Error::CorruptPage(id))?;
    let end = base.checked_add(page_size).ok_or(Error::CorruptPage(id))?;
    let first = data.get(base..end).ok_or(Error::CorruptPage(id))?;
    let hdr = PageHeader::ref_from_bytes(&first[..PAGE_HEADER_SIZE])
        .map_err(|_| Error::CorruptPage(id))?;

    let span = (hdr.overflow() as usize + 1)
        .checked_mul(page_size)
        .ok_or(Error::CorruptPage(id))?;
    let buf = data
        .get(base..base + span)
        .ok_or(Error::CorruptPage(id))?;

    Ok(PageRef {
        id,
        base,
        flags: hdr.page_flags(),
        count: hdr.count() as usize,
        overflow: hdr.overflow(),
        buf,
    })
}

impl<'a> PageRef<'a> {
    pub fn is_leaf(&self) -> bool {
        self.flags.contains(PageFlags::LEAF)
    }

    pub fn is_branch(&self) -> bool {
        self.flags.contains(PageFlags::BRANCH)
    }

    /// Page content after the header, spanning all overflow pages.
    pub fn payload(&self) -> &'a [u8] {
        &self.buf[PAGE_HEADER_SIZE..]
    }

    /// Raw count field, needed by the freelist's large-count encoding.
    pub fn raw_count(&self) -> usize {
        self.count
    }

    pub fn leaf_element(&self, index: usize) -> Result<LeafItem<'a>> {
        let elem_off = PAGE_HEADER_SIZE + index * LEAF_ELEMENT_SIZE;
        let bytes = self
            .buf
            .get(elem_off..elem_off + LEAF_ELEMENT_SIZE)
            .ok_or(Error::CorruptPage(self.id))?;
        let elem = LeafElement::ref_from_bytes(bytes).map_err(|_| Error::CorruptPage(self.id))?;

        let key_off = elem_off + elem.pos() as usize;
        let ksize = elem.ksize() as usize;
        let vsize = elem.vsize() as usize;
        let key = self
            .buf
            .get(key_off..key_off + ksize)
            .ok_or(Error::CorruptPage(self.id))?;
        let value = self
            .buf
            .get(key_off + ksize..key_off + ksize + vsize)
            .ok_or(Error::CorruptPage(self.id))?;

        Ok(LeafItem {
            flags: elem.flags(),
            key,
            value,
            key_pos: self.base + key_off,
        })
    }

    pub fn branch_element(&self, index: usize) -> Result<BranchItem<'a>> {
        let elem_off = PAGE_HEADER_SIZE + index * BRANCH_ELEMENT_SIZE;
        let bytes = self
            .buf
            .get(elem_off..elem_off + BRANCH_ELEMENT_SIZE)
            .ok_or(Error::CorruptPage(self.id))?;
        let elem = BranchElement::ref_from_bytes(bytes).map_err(|_| Error::CorruptPage(self.id))?;

        let key_off = elem_off + elem.pos() as usize;
        let ksize = elem.ksize() as usize;
        let key = self
            .buf
            .get(key_off..key_off + ksize)
            .ok_or(Error::CorruptPage(self.id))?;

        Ok(BranchItem {
            pgid: elem.pgid(),
            key,
            key_pos: self.base + key_off,
        })
    }
}
