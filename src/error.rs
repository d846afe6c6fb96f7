//! Crate-wide error and result types.
//!
//! Every fallible public operation returns [`Result`]. Validation errors are
//! reported directly to the caller; commit-path I/O errors abort the
//! transaction before surfacing; corruption detected while reading a page is
//! fatal for the current transaction but never for the database file itself,
//! which always retains the previous committed generation.

use std::io;

use crate::page::PageId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database not open")]
    DatabaseNotOpen,

    #[error("database in use by another process")]
    DatabaseInUse,

    #[error("transaction closed")]
    TxClosed,

    #[error("transaction not writable")]
    TxNotWritable,

    #[error("commit and rollback of a managed transaction are handled by the database")]
    ManagedTx,

    #[error("bucket not found")]
    BucketNotFound,

    #[error("bucket already exists")]
    BucketExists,

    #[error("bucket name required")]
    BucketNameRequired,

    #[error("bucket name too large")]
    BucketNameTooLarge,

    #[error("bucket not writable")]
    BucketNotWritable,

    #[error("key required")]
    KeyRequired,

    #[error("key too large")]
    KeyTooLarge,

    #[error("value too large")]
    ValueTooLarge,

    #[error("sequence overflow")]
    SequenceOverflow,

    #[error("page {0}: corrupt page")]
    CorruptPage(PageId),

    #[error("invalid meta page")]
    InvalidMeta,

    #[error("freelist corrupt")]
    FreelistCorrupt,

    #[error("page allocation failed")]
    AllocationFailed,

    #[error("consistency check failed: {}", .0.join("; "))]
    Check(Vec<String>),

    #[error(transparent)]
    Io(#[from] io::Error),
}
