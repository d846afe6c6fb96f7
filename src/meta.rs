//! # Meta Pages
//!
//! Pages 0 and 1 each hold a [`Meta`] record: the durable roots of the bucket
//! and freelist trees plus the commit generation (`txid`). The two slots are
//! double-buffered; a commit writes its new meta into slot `txid % 2`, so the
//! previous generation always survives intact. On open, the slot with the
//! greater txid that also passes checksum validation is current. A torn write
//! in one slot (crash mid-commit) therefore falls back to the previous
//! generation instead of failing the open.
//!
//! ## Layout (inside the page, after the 16-byte page header)
//!
//! ```text
//! Offset  Size  Field          Description
//! ------  ----  -------------  -----------------------------------
//! 0       4     magic          0xED0CDAED
//! 4       4     version        File format version (1)
//! 8       4     page_size      Fixed at first init (OS page size)
//! 12      4     flags          Reserved, written as zero
//! 16      8     buckets_root   Page id of the buckets directory page
//! 24      8     freelist_root  Page id of the freelist page
//! 32      8     high_water     One past the highest page id ever allocated
//! 40      8     txid           Commit generation
//! 48      8     checksum       CRC-64/ECMA over the 48 bytes above
//! ```
//!
//! Checksum validation precedes interpretation of every field other than
//! magic and version.

use crc::{Crc, CRC_64_ECMA_182};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Error, Result};
use crate::page::{self, PageFlags, PageId, PAGE_HEADER_SIZE};

pub const MAGIC: u32 = 0xED0C_DAED;
pub const VERSION: u32 = 1;

pub(crate) const META_SIZE: usize = 56;
const CHECKSUM_OFFSET: usize = 48;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct Meta {
    magic: U32,
    version: U32,
    page_size: U32,
    flags: U32,
    buckets_root: U64,
    freelist_root: U64,
    high_water: U64,
    txid: U64,
    checksum: U64,
}

const _: () = assert!(std::mem::size_of::<Meta>() == META_SIZE);

impl Meta {
    zerocopy_accessors! {
        magic: u32,
        version: u32,
        page_size: u32,
        flags: u32,
        buckets_root: u64,
        freelist_root: u64,
        high_water: u64,
        txid: u64,
        checksum: u64,
    }

    pub fn compute_checksum(&self) -> u64 {
        CRC64.checksum(&self.as_bytes()[..CHECKSUM_OFFSET])
    }

    pub fn update_checksum(&mut self) {
        self.checksum = U64::new(self.compute_checksum());
    }

    /// Structural and checksum validation. Magic and version are checked
    /// first; the checksum guards every remaining field.
    pub fn validate(&self) -> Result<()> {
        if self.magic() != MAGIC {
            return Err(Error::InvalidMeta);
        }
        if self.version() != VERSION {
            return Err(Error::InvalidMeta);
        }
        if self.checksum() != self.compute_checksum() {
            return Err(Error::InvalidMeta);
        }
        if self.page_size() == 0 {
            return Err(Error::InvalidMeta);
        }
        Ok(())
    }
}

/// Reads and validates the meta record stored in slot 0 or 1.
pub(crate) fn meta_at(data: &[u8], page_size: usize, slot: PageId) -> Result<Meta> {
    let p = page::page_at(data, page_size, slot)?;
    if !p.flags.contains(PageFlags::META) {
        return Err(Error::InvalidMeta);
    }
    let meta = read_meta(p.payload())?;
    meta.validate()?;
    Ok(meta)
}

fn read_meta(payload: &[u8]) -> Result<Meta> {
    let bytes = payload.get(..META_SIZE).ok_or(Error::InvalidMeta)?;
    Meta::read_from_bytes(bytes).map_err(|_| Error::InvalidMeta)
}

/// Selects the current meta: the valid slot with the greater txid. A single
/// valid slot is accepted so a torn newer meta falls back to the previous
/// generation.
pub(crate) fn load_current(data: &[u8], page_size: usize) -> Result<Meta> {
    let meta0 = meta_at(data, page_size, 0);
    let meta1 = meta_at(data, page_size, 1);
    match (meta0, meta1) {
        (Ok(a), Ok(b)) => Ok(if a.txid() > b.txid() { a } else { b }),
        (Ok(a), Err(_)) => Ok(a),
        (Err(_), Ok(b)) => Ok(b),
        (Err(_), Err(_)) => Err(Error::InvalidMeta),
    }
}

/// Serializes `meta` into a page buffer for slot `txid % 2`, checksummed.
pub(crate) fn write_into(buf: &mut [u8], slot: u64, meta: &Meta) -> Result<()> {
    let hdr = page::header_mut(buf)?;
    hdr.set_id(slot);
    hdr.set_page_flags(PageFlags::META);
    hdr.set_count(0);
    hdr.set_overflow(0);

    let mut meta = *meta;
    meta.update_checksum();
    let dst = buf
        .get_mut(PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + META_SIZE)
        .ok_or(Error::InvalidMeta)?;
    dst.copy_from_slice(meta.as_bytes());
    Ok(())
}

/// Discovers the page size recorded in page 0 of a file whose page size is
/// not yet known. `buf` holds at least the first 4096 bytes of the file.
pub(crate) fn discover_page_size(buf: &[u8]) -> Result<u32> {
    let payload = buf.get(PAGE_HEADER_SIZE..).ok_or(Error::InvalidMeta)?;
    let meta = read_meta(payload)?;
    meta.validate()?;
    Ok(meta.page_size())
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromZeros;

    fn sample_meta(txid: u64) -> Meta {
        let mut m = Meta::new_zeroed();
        m.set_magic(MAGIC);
        m.set_version(VERSION);
        m.set_page_size(4096);
        m.set_buckets_root(3);
        m.set_freelist_root(2);
        m.set_high_water(4);
        m.set_txid(txid);
        m.update_checksum();
        m
    }

    #[test]
    fn validate_accepts_checksummed_meta() {
        assert!(sample_meta(9).validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_magic() {
        let mut m = sample_meta(1);
        m.set_magic(0xDEAD_BEEF);
        m.update_checksum();
        assert!(matches!(m.validate(), Err(Error::InvalidMeta)));
    }

    #[test]
    fn validate_rejects_stale_checksum() {
        let mut m = sample_meta(1);
        m.set_txid(2);
        assert!(matches!(m.validate(), Err(Error::InvalidMeta)));
    }

    fn two_slot_image(txid0: u64, txid1: u64) -> Vec<u8> {
        let mut data = vec![0u8; 4096 * 2];
        write_into(&mut data[..4096], 0, &sample_meta(txid0)).unwrap();
        let second = &mut data[4096..];
        write_into(second, 1, &sample_meta(txid1)).unwrap();
        data
    }

    #[test]
    fn current_meta_has_greater_txid() {
        let data = two_slot_image(4, 5);
        let m = load_current(&data, 4096).unwrap();
        assert_eq!(m.txid(), 5);

        let data = two_slot_image(8, 7);
        let m = load_current(&data, 4096).unwrap();
        assert_eq!(m.txid(), 8);
    }

    #[test]
    fn torn_newer_slot_falls_back_to_previous_generation() {
        let mut data = two_slot_image(4, 5);
        // Corrupt the newer slot's checksum bytes.
        data[4096 + PAGE_HEADER_SIZE + CHECKSUM_OFFSET] ^= 0xFF;
        let m = load_current(&data, 4096).unwrap();
        assert_eq!(m.txid(), 4);
    }

    #[test]
    fn both_slots_torn_is_invalid() {
        let mut data = two_slot_image(0, 1);
        data[PAGE_HEADER_SIZE] ^= 0xFF;
        data[4096 + PAGE_HEADER_SIZE] ^= 0xFF;
        assert!(matches!(
            load_current(&data, 4096),
            Err(Error::InvalidMeta)
        ));
    }

    #[test]
    fn page_size_discovery_reads_slot_zero() {
        let data = two_slot_image(0, 1);
        assert_eq!(discover_page_size(&data[..4096]).unwrap(), 4096);
    }
}
