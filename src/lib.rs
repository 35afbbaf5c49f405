//! Gavran: an embedded, single-writer / multi-reader transactional page store.
//!
//! A database is a fixed-page file plus two write-ahead log files:
//! - ACID transactions over 8 KiB pages with copy-on-write MVCC snapshots
//! - durability through a double WAL with per-transaction BLAKE2b hashing,
//!   diff encoding and zstd compression
//! - optional transparent XChaCha20-Poly1305 encryption of page contents
//! - crash recovery, free-space bitmap allocation and per-page validation
//! - log shipping from one instance to a byte-equivalent replica
//!
//! ```no_run
//! use gavran::{Database, DbOptions};
//!
//! let db = Database::open("app.gvrn", DbOptions::default())?;
//! let mut tx = db.write_txn()?;
//! let page = tx.allocate_page(1, 0)?;
//! tx.modify_page(page)?[..5].copy_from_slice(b"hello");
//! tx.commit()?;
//! # Ok::<(), gavran::GavranError>(())
//! ```

pub mod crypto;
pub mod db;
pub mod error;
pub mod options;
pub mod storage;
pub mod tx;
pub(crate) mod wal;

pub use crate::db::Database;
pub use crate::error::{GavranError, Result};
pub use crate::options::{DbOptions, PageValidation, WalWriteCallback, MIN_FILE_SIZE};
pub use crate::storage::metadata::{FileHeader, PageFlags, PageMetadata};
pub use crate::storage::page::{Page, PAGE_SIZE};
pub use crate::tx::{ReadTransaction, WriteTransaction};
