//! # burrowdb - Embedded Key/Value Store
//!
//! burrowdb is an embedded, single-file key/value storage engine: a
//! copy-on-write B+tree over a memory-mapped data file with multi-version
//! concurrency control between one writer and many readers.
//!
//! - **Zero-copy reads**: keys and values borrow straight from the mmap for
//!   the life of the transaction
//! - **Snapshot isolation**: readers see the generation they began on;
//!   writers never disturb them
//! - **Recovery by design**: no write-ahead log; copy-on-write pages plus
//!   double-buffered meta pages mean a crash simply leaves the previous
//!   generation current
//!
//! ## Quick Start
//!
//! ```no_run
//! use burrowdb::Db;
//!
//! # fn main() -> burrowdb::Result<()> {
//! let db = Db::open("my.db", 0o600)?;
//!
//! db.update(|tx| {
//!     let widgets = tx.create_bucket("widgets")?;
//!     widgets.put(b"answer", b"42")
//! })?;
//!
//! db.view(|tx| {
//!     let widgets = tx.bucket("widgets")?;
//!     assert_eq!(widgets.get(b"answer")?, Some(&b"42"[..]));
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   Public API (Db / Tx / Bucket)     │
//! ├─────────────────────────────────────┤
//! │  Cursor traversal │ Node mutation   │
//! ├───────────────────┴─────────────────┤
//! │  MVCC: meta generations + freelist  │
//! ├─────────────────────────────────────┤
//! │  Page codec over read-only mmap     │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! A single file of fixed-size pages. Pages 0 and 1 are alternating meta
//! pages; the rest hold the bucket directory, the freelist and the B+tree
//! branch/leaf pages. Modifying a page always writes a copy to a fresh page;
//! the old one is reclaimed only after every reader that could see it has
//! finished.
//!
//! ## Module Overview
//!
//! - [`Db`]: open/close, transaction entry points, copy, check
//! - [`Tx`]: snapshot lifecycle, bucket directory, commit pipeline
//! - [`Bucket`]: get/put/delete/cursor over one named tree
//! - [`Cursor`]: ordered traversal of a bucket
//! - `page`/`meta`/`freelist`/`mmap`/`node`: the storage internals

#[macro_use]
mod macros;

mod bucket;
mod cursor;
mod db;
mod error;
mod freelist;
mod meta;
mod mmap;
mod node;
mod page;
mod tx;

pub use bucket::{Bucket, BucketStat, MAX_BUCKET_NAME_SIZE, MAX_KEY_SIZE, MAX_VALUE_SIZE};
pub use cursor::Cursor;
pub use db::{Db, Stats};
pub use error::{Error, Result};
pub use meta::{MAGIC, VERSION};
pub use page::{PageId, TxId};
pub use tx::{Tx, TxStats};
