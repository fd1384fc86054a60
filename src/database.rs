//! # Database Handle
//!
//! The public surface of the engine. Every operation follows the same
//! shape: validate parameters, begin a transaction, dispatch to the
//! backend, post-process (materialise the record on find, free the record
//! blob on erase), then commit or abort and surface the status. The last
//! engine error kind is recorded on the handle.
//!
//! ## Open
//!
//! Opening reads the first 512 bytes to discover the real page size, then
//! loads and validates the full header page: magic, version, backend tag.
//! The cache, freelist and comparators are set up afterwards, in that
//! order.
//!
//! ## Create
//!
//! Creation validates the page/key size combination, claims page 0 as the
//! header page (never through the freelist), sizes the freelist to the
//! header page's spare payload, and lets the backend initialise its own
//! structures.
//!
//! ## Close
//!
//! Close tears down in dependency order: the backend first (it may still
//! release pages into the freelist), then header fields and freelist into
//! the header payload, dirty pages through the device, the header page
//! itself (unless read-only or in-memory), and the file handle last. The
//! first failure short-circuits and is returned. Dropping an unclosed
//! database performs the same sequence best-effort.

use std::path::Path;

use bumpalo::Bump;
use eyre::Result;
use tracing::{debug, warn};

use crate::backend::{Backend, ScanVisitor};
use crate::btree::BtreeBackend;
use crate::comparator::{CompareFn, Comparators, PrefixCompareFn};
use crate::config::{db_flags, Config, DEFAULT_KEY_SIZE, DEFAULT_PAGE_SIZE, MIN_KEYS_PER_PAGE, MIN_PAGE_SIZE, PAGE_OVERHEAD};
use crate::cursor::{Cursor, CursorRegistry};
use crate::error::{raise, Error};
use crate::record::{key_flags, Record, RecordPtr, INLINE_MAX};
use crate::storage::blob;
use crate::storage::{DbHeader, Device, FileDevice, MemDevice, Metrics, Page, PageType, Pager};
use crate::txn::{Txn, TXN_TEMPORARY};

pub struct Database {
    pager: Pager,
    backend: Box<dyn Backend>,
    comparators: Comparators,
    cursors: CursorRegistry,
    record_arena: Bump,
    last_error: Option<Error>,
    closed: bool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Creates a new database file (or an in-memory database) and returns
    /// an open handle to it.
    pub fn create(path: impl AsRef<Path>, config: &Config) -> Result<Self> {
        let path = path.as_ref();

        let page_size = if config.page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            config.page_size
        };
        let key_size = if config.key_size == 0 {
            DEFAULT_KEY_SIZE
        } else {
            config.key_size
        };

        if (page_size as usize) < MIN_PAGE_SIZE || page_size as usize % MIN_PAGE_SIZE != 0 {
            raise!(Error::InvalidPageSize, "page size {} is not a multiple of {}", page_size, MIN_PAGE_SIZE);
        }
        if (page_size / key_size) < MIN_KEYS_PER_PAGE as u16 {
            raise!(Error::InvalidKeySize, "page size {} fits fewer than {} keys of size {}", page_size, MIN_KEYS_PER_PAGE, key_size);
        }

        let flags = config.flags | db_flags::BACKEND_BTREE;
        let device: Box<dyn Device> = if flags & db_flags::IN_MEMORY != 0 {
            Box::new(MemDevice::new())
        } else {
            Box::new(FileDevice::create(path, config.mode)?)
        };

        let mut pager = Pager::create(device, flags, page_size, key_size, config.cache_capacity)?;

        let mut backend: Box<dyn Backend> = Box::new(BtreeBackend::new());
        backend.create(&mut pager)?;

        debug!(
            path = %path.display(),
            page_size,
            key_size,
            cache = config.cache_capacity,
            "created database"
        );

        Ok(Self {
            pager,
            backend,
            comparators: Comparators::default(),
            cursors: CursorRegistry::new(),
            record_arena: Bump::new(),
            last_error: None,
            closed: false,
        })
    }

    /// Opens an existing database file.
    pub fn open(path: impl AsRef<Path>, config: &Config) -> Result<Self> {
        let path = path.as_ref();

        if config.flags & db_flags::IN_MEMORY != 0 {
            raise!(Error::InvalidParameter, "an in-memory database cannot be opened from a file");
        }

        let read_only = config.flags & db_flags::READ_ONLY != 0;
        let mut device: Box<dyn Device> =
            Box::new(FileDevice::open(path, read_only)?);

        // The header page is one page long, but the page size is inside it.
        // Probe the minimum page size, pull the real size out, then read
        // the full header page.
        let mut probe = [0u8; crate::config::HEADER_PROBE_SIZE];
        device.read_at(0, &mut probe).map_err(|e| {
            warn!(path = %path.display(), "header probe failed");
            e
        })?;

        let probed = DbHeader::from_bytes(&probe[PAGE_OVERHEAD..])?;
        if !probed.magic_ok() {
            warn!(path = %path.display(), "bad magic, not a hammock database");
            raise!(Error::InvalidFileHeader, "{} is not a hammock database", path.display());
        }
        if !probed.version_ok() {
            raise!(
                Error::InvalidFileVersion,
                "{} has file version {:?}, expected {}.{}",
                path.display(),
                probed.version(),
                crate::storage::VERSION_MAJ,
                crate::storage::VERSION_MIN
            );
        }
        let page_size = probed.page_size();
        if (page_size as usize) < MIN_PAGE_SIZE || page_size as usize % MIN_PAGE_SIZE != 0 {
            raise!(Error::InvalidFileHeader, "header claims page size {}", page_size);
        }

        let header_page = Page::load_from(device.as_mut(), 0, page_size as usize)?;
        if header_page.kind() != PageType::Header {
            raise!(Error::InvalidFileHeader, "page 0 is not a header page");
        }
        let header = *DbHeader::from_bytes(header_page.payload())?;

        if header.flags() & db_flags::BACKEND_MASK != db_flags::BACKEND_BTREE {
            raise!(
                Error::InvalidBackend,
                "unrecognised backend tag {:#x}",
                header.flags() & db_flags::BACKEND_MASK
            );
        }

        // Runtime flags merge the caller's with the persisted ones.
        let flags = config.flags | header.flags();
        let mut pager = Pager::open(device, header_page, header, flags, config.cache_capacity)?;

        let mut backend: Box<dyn Backend> = Box::new(BtreeBackend::new());
        backend.open(&mut pager)?;

        debug!(path = %path.display(), page_size, "opened database");

        Ok(Self {
            pager,
            backend,
            comparators: Comparators::default(),
            cursors: CursorRegistry::new(),
            record_arena: Bump::new(),
            last_error: None,
            closed: false,
        })
    }

    /// Installs the full-key comparator.
    pub fn set_compare_func(&mut self, compare: CompareFn) {
        self.comparators.compare = compare;
    }

    /// Installs (or removes) the prefix comparator.
    pub fn set_prefix_compare_func(&mut self, prefix: Option<PrefixCompareFn>) {
        self.comparators.prefix_compare = prefix;
    }

    /// The engine kind of the most recent failure on this handle.
    pub fn last_error(&self) -> Option<Error> {
        self.last_error
    }

    pub fn metrics(&self) -> &Metrics {
        self.pager.metrics()
    }

    pub fn page_size(&self) -> usize {
        self.pager.page_size()
    }

    pub fn key_size(&self) -> usize {
        self.pager.key_size()
    }

    pub fn is_read_only(&self) -> bool {
        self.pager.is_read_only()
    }

    fn fail(&mut self, e: eyre::Report) -> eyre::Report {
        self.last_error = Error::kind_of(&e);
        e
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            raise!(Error::InvalidParameter, "database handle is closed");
        }
        Ok(())
    }

    /// Inserts a key/record pair. `flags` accepts
    /// [`crate::config::insert_flags::OVERWRITE`].
    pub fn insert(&mut self, key: &[u8], record: &[u8], flags: u32) -> Result<()> {
        self.ensure_open()?;
        self.last_error = None;

        if self.pager.is_read_only() {
            return Err(self.fail(eyre::Report::new(Error::ReadOnly)));
        }
        let key_size = self.pager.key_size();
        if key.len() > key_size {
            let var_keys_off = self.pager.flags() & db_flags::DISABLE_VAR_KEY_LEN != 0;
            // A spilled key stores its blob reference in the last 8 inline
            // bytes, so tiny key sizes cannot spill at all.
            if var_keys_off || key_size <= INLINE_MAX || key.len() > u16::MAX as usize {
                return Err(self.fail(eyre::Report::new(Error::InvalidKeySize)));
            }
        }

        let txn = Txn::begin(TXN_TEMPORARY);
        match self
            .backend
            .insert(&mut self.pager, &txn, &self.comparators, key, record, flags)
        {
            Ok(()) => {
                txn.commit();
                Ok(())
            }
            Err(e) => {
                txn.abort();
                Err(self.fail(e))
            }
        }
    }

    /// Looks up a key and materialises its record. The returned bytes live
    /// in the handle's scratch arena and stay valid until the next call.
    pub fn find(&mut self, key: &[u8]) -> Result<Record<'_>> {
        self.ensure_open()?;
        self.last_error = None;
        self.record_arena.reset();

        let txn = Txn::begin(TXN_TEMPORARY);
        let found = match self
            .backend
            .find(&mut self.pager, &txn, &self.comparators, key)
        {
            Ok(found) => found,
            Err(e) => {
                txn.abort();
                return Err(self.fail(e));
            }
        };

        // Temporary transactions hand returned records to the handle's
        // arena, which is what keeps the slice alive past commit.
        debug_assert!(txn.is_temporary());
        let arena = &self.record_arena;
        let decoded = RecordPtr::decode(found.record_ptr, found.intflags & key_flags::INLINE_MASK);
        let data: &[u8] = match decoded {
            RecordPtr::Blob(blob_id) => match blob::read(&mut self.pager, arena, blob_id) {
                Ok(data) => data,
                Err(e) => {
                    txn.abort();
                    self.last_error = Error::kind_of(&e);
                    return Err(e);
                }
            },
            inline => arena.alloc_slice_copy(inline.inline_bytes().expect("inline record")),
        };

        txn.commit();
        Ok(Record::new(data, found.intflags))
    }

    /// Removes a key. The index entry goes first, then the record blob if
    /// the record was stored out-of-line.
    pub fn erase(&mut self, key: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.last_error = None;

        if self.pager.is_read_only() {
            return Err(self.fail(eyre::Report::new(Error::ReadOnly)));
        }

        let txn = Txn::begin(TXN_TEMPORARY);
        let result = self
            .backend
            .erase(&mut self.pager, &txn, &self.comparators, key)
            .and_then(|erased| {
                if RecordPtr::is_blob(erased.intflags) {
                    blob::free(&mut self.pager, erased.record_ptr)?;
                }
                Ok(())
            });

        match result {
            Ok(()) => {
                txn.commit();
                Ok(())
            }
            Err(e) => {
                txn.abort();
                Err(self.fail(e))
            }
        }
    }

    /// Writes every dirty page and the header to durable storage.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.pager.flush().map_err(|e| self.fail(e))
    }

    /// Verifies cache, freelist and index invariants, returning
    /// `IntegrityViolated` on the first violation found.
    pub fn check_integrity(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.last_error = None;

        if let Err(e) = self.pager.check_integrity() {
            return Err(self.fail(e));
        }

        let txn = Txn::begin(TXN_TEMPORARY);
        match self
            .backend
            .check_integrity(&mut self.pager, &txn, &self.comparators)
        {
            Ok(()) => {
                txn.commit();
                Ok(())
            }
            Err(e) => {
                txn.abort();
                Err(self.fail(e))
            }
        }
    }

    /// Visits every key/record pair in comparator order.
    pub fn scan(&mut self, visitor: &mut dyn ScanVisitor) -> Result<()> {
        self.ensure_open()?;
        self.last_error = None;

        let txn = Txn::begin(TXN_TEMPORARY);
        match self.backend.scan(&mut self.pager, &txn, visitor) {
            Ok(()) => {
                txn.commit();
                Ok(())
            }
            Err(e) => {
                txn.abort();
                Err(self.fail(e))
            }
        }
    }

    /// Feeds every key, in order, to `cb`; without a callback, keys are
    /// hex-dumped to the debug log.
    pub fn dump(&mut self, cb: Option<&mut dyn FnMut(&[u8])>) -> Result<()> {
        self.ensure_open()?;

        let mut log_key = |key: &[u8]| {
            let limit = key.len().min(16);
            let hex: String = key[..limit].iter().map(|b| format!("{:02x} ", b)).collect();
            if key.len() > limit {
                debug!("{}... ({} more bytes)", hex, key.len() - limit);
            } else {
                debug!("{}", hex);
            }
        };
        let cb: &mut dyn FnMut(&[u8]) = match cb {
            Some(cb) => cb,
            None => &mut log_key,
        };

        let txn = Txn::begin(TXN_TEMPORARY);
        match self.backend.dump(&mut self.pager, &txn, cb) {
            Ok(()) => {
                txn.commit();
                Ok(())
            }
            Err(e) => {
                txn.abort();
                Err(self.fail(e))
            }
        }
    }

    pub fn cursor_create(&mut self) -> Result<Cursor> {
        self.ensure_open()?;
        Ok(self.cursors.create())
    }

    pub fn cursor_clone(&mut self, cursor: Cursor) -> Result<Cursor> {
        self.ensure_open()?;
        match self.cursors.clone_cursor(cursor) {
            Some(clone) => Ok(clone),
            None => raise!(Error::InvalidParameter, "cursor {} is not live", cursor.id()),
        }
    }

    pub fn cursor_close(&mut self, cursor: Cursor) -> Result<()> {
        self.ensure_open()?;
        if !self.cursors.close(cursor) {
            raise!(Error::InvalidParameter, "cursor {} is not live", cursor.id());
        }
        Ok(())
    }

    pub fn open_cursors(&self) -> usize {
        self.cursors.len()
    }

    /// Flushes and closes the database. The handle is consumed; errors from
    /// any step short-circuit and are returned.
    pub fn close(mut self) -> Result<()> {
        self.do_close()
    }

    fn do_close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.cursors.clear();

        // Backend first: its close may still release pages, and those must
        // land in the freelist before the header page is persisted.
        self.backend.close(&mut self.pager)?;
        self.pager.close_flush()?;
        debug!("closed database");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.do_close() {
                warn!("close during drop failed: {:#}", e);
            }
        }
    }
}
