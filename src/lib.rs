//! # hammock — embedded single-file key/value storage
//!
//! hammock is an embedded storage engine: ordered, durable storage of
//! variable-length keys mapped to variable-length records, all inside one
//! paged file, with the working set served from an in-process page cache.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Public API (Database)        │
//! ├─────────────────────────────────────┤
//! │   Transaction scope / scratch       │
//! ├──────────────────┬──────────────────┤
//! │  B-tree backend  │    Blob store    │
//! ├──────────────────┴──────────────────┤
//! │   Pager (cache / freelist / header) │
//! ├─────────────────────────────────────┤
//! │   Device (file or memory)           │
//! └─────────────────────────────────────┘
//! ```
//!
//! Operations enter through [`Database`], run inside a per-operation
//! transaction, and are dispatched to the B-tree backend, which walks
//! pages fetched through the cache and delegates large records to the
//! blob store. Records up to 8 bytes are packed straight into the B-tree
//! slot; anything larger goes out-of-line.
//!
//! ## Quick Start
//!
//! ```no_run
//! use hammock::{Config, Database};
//!
//! # fn main() -> eyre::Result<()> {
//! let mut db = Database::create("data.hdb", &Config::default())?;
//! db.insert(b"greeting", b"hello world", 0)?;
//!
//! let record = db.find(b"greeting")?;
//! assert_eq!(record.data(), b"hello world");
//!
//! db.erase(b"greeting")?;
//! db.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency
//!
//! A [`Database`] handle is single-threaded by design: no operation
//! suspends, every call is synchronous, and the handle is not safe to
//! share across threads.
//!
//! ## Module Overview
//!
//! - [`storage`]: device, pages, cache, freelist, header, pager, blobs
//! - `btree`: the ordered index
//! - `database`: the public handle and open/create/close sequencing
//! - `record`: inline record encoding and the [`Record`] type
//! - `comparator`: key ordering hooks
//! - `error`: the error taxonomy

#[macro_use]
mod macros;

pub mod backend;
pub mod btree;
pub mod comparator;
pub mod config;
mod cursor;
mod database;
pub mod error;
pub mod record;
pub mod storage;
pub mod txn;

pub use backend::{Backend, EraseResult, FindResult, ScanVisitor};
pub use comparator::{default_compare, CompareFn, Comparators, PrefixCompareFn, PrefixOutcome};
pub use config::{db_flags, insert_flags, Config};
pub use cursor::Cursor;
pub use database::Database;
pub use error::Error;
pub use record::{Record, RecordPtr};
pub use storage::Metrics;
