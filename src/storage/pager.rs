//! # Pager
//!
//! The pager composes the device, the page cache, the freelist and the
//! pinned header page into one allocation-and-access surface. Everything
//! above it (B-tree, blob store, database) deals in page ids and borrows
//! pages for the duration of a single access.
//!
//! ## Access Discipline
//!
//! `fetch` returns `&mut Page`, borrowing the pager. The borrow checker
//! therefore proves that no page reference outlives the next fetch, which
//! is exactly the window in which eviction may run; pages need no pin
//! counts. The header page is the one exception: it is held outside the
//! cache and stays resident until close.
//!
//! ## Allocation
//!
//! `alloc` prefers the freelist and only extends the file when the
//! freelist is empty. `free` drops the page from the cache and records the
//! id; releasing the trailing page when the freelist is full truncates the
//! file by one page instead of losing the id.
//!
//! ## Destruction Order
//!
//! The database tears its parts down in dependency order: backend first
//! (it may free pages into the freelist), then cached pages, then the
//! freelist (persisted into the header payload), then the header page
//! (final explicit write), and the device last. `close_flush` implements
//! the middle steps.

use eyre::{Result, WrapErr};

use crate::config::PAGE_OVERHEAD;
use crate::error::{raise, Error};
use crate::storage::cache::PageCache;
use crate::storage::device::Device;
use crate::storage::freelist::{self, Freelist};
use crate::storage::header::DbHeader;
use crate::storage::page::{Page, PageId, PageType};

/// Counter hooks for the cache, freelist, blob store and B-tree. Plain
/// counters, read through [`crate::Database::metrics`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Metrics {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub pages_fetched: u64,
    pub pages_flushed: u64,
    pub freelist_hits: u64,
    pub freelist_misses: u64,
    pub blobs_allocated: u64,
    pub blobs_read: u64,
    pub btree_splits: u64,
    pub btree_merges: u64,
}

pub struct Pager {
    device: Box<dyn Device>,
    cache: PageCache,
    freelist: Freelist,
    header_page: Page,
    header: DbHeader,
    dirty: bool,
    read_only: bool,
    runtime_flags: u32,
    metrics: Metrics,
}

impl Pager {
    /// Assembles a pager over a freshly created device: writes nothing yet,
    /// but allocates page 0 as the header page and seeds the freelist with
    /// the capacity the header page can hold.
    pub fn create(
        mut device: Box<dyn Device>,
        flags: u32,
        page_size: u16,
        key_size: u16,
        cache_capacity: usize,
    ) -> Result<Self> {
        let header = DbHeader::new(flags & crate::config::db_flags::PERSISTENT_MASK, page_size, key_size);

        // Page 0 is claimed by extending the device, never via the freelist.
        device.truncate(page_size as u64)?;
        let mut header_page = Page::empty(0, page_size as usize, PageType::Header);
        header_page.mark_dirty();

        let freelist = Freelist::new(freelist::capacity_for(page_size as usize) as u32);

        Ok(Self {
            device,
            cache: PageCache::new(cache_capacity),
            freelist,
            header_page,
            header,
            dirty: true,
            read_only: flags & crate::config::db_flags::READ_ONLY != 0,
            runtime_flags: flags,
            metrics: Metrics::default(),
        })
    }

    /// Assembles a pager over an existing device whose header page has
    /// already been read and validated by the caller.
    pub fn open(
        device: Box<dyn Device>,
        header_page: Page,
        header: DbHeader,
        runtime_flags: u32,
        cache_capacity: usize,
    ) -> Result<Self> {
        let freelist = Freelist::load(header_page.payload())
            .wrap_err("reading freelist from header page")?;
        let read_only = runtime_flags & crate::config::db_flags::READ_ONLY != 0;

        Ok(Self {
            device,
            cache: PageCache::new(cache_capacity),
            freelist,
            header_page,
            header,
            dirty: false,
            read_only,
            runtime_flags,
            metrics: Metrics::default(),
        })
    }

    pub fn page_size(&self) -> usize {
        self.header.page_size() as usize
    }

    pub fn key_size(&self) -> usize {
        self.header.key_size() as usize
    }

    /// Payload bytes available on a non-header page.
    pub fn usable_page_size(&self) -> usize {
        self.page_size() - PAGE_OVERHEAD
    }

    pub fn flags(&self) -> u32 {
        self.runtime_flags
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_in_memory(&self) -> bool {
        self.device.is_in_memory()
    }

    pub fn root_page(&self) -> PageId {
        self.header.root_page()
    }

    pub fn set_root_page(&mut self, id: PageId) {
        self.header.set_root_page(id);
        self.dirty = true;
    }

    pub fn header(&self) -> &DbHeader {
        &self.header
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut Metrics {
        &mut self.metrics
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn freelist(&self) -> &Freelist {
        &self.freelist
    }

    /// Pages currently allocated in the file.
    pub fn page_count(&self) -> u64 {
        self.device
            .size()
            .map(|bytes| bytes / self.page_size() as u64)
            .unwrap_or(0)
    }

    /// Returns the page with the given id, reading it through the device on
    /// a cache miss. Page 0 resolves to the pinned header page.
    pub fn fetch(&mut self, id: PageId) -> Result<&mut Page> {
        if id == 0 {
            return Ok(&mut self.header_page);
        }

        if self.cache.contains(id) {
            self.metrics.cache_hits += 1;
            return Ok(self.cache.lookup(id).expect("page vanished from cache"));
        }

        self.metrics.cache_misses += 1;
        self.metrics.pages_fetched += 1;
        let page_size = self.page_size();
        let page = Page::load_from(self.device.as_mut(), id, page_size)
            .wrap_err_with(|| format!("fetching page {}", id))?;
        crate::storage::page::validate_page(&page, self.page_size())?;
        self.make_room()?;
        self.cache.put(page);
        Ok(self.cache.lookup(id).expect("page vanished after insert"))
    }

    /// Allocates a page: freelist first, file extension second. The new
    /// page enters the cache zeroed, typed and dirty.
    pub fn alloc(&mut self, kind: PageType) -> Result<PageId> {
        let id = match self.freelist.pop() {
            Some(id) => {
                self.metrics.freelist_hits += 1;
                self.dirty = true;
                id
            }
            None => {
                self.metrics.freelist_misses += 1;
                let id = self.page_count();
                let new_size = (id + 1) * self.page_size() as u64;
                self.device
                    .truncate(new_size)
                    .wrap_err("extending file for page allocation")?;
                id
            }
        };

        let mut page = Page::empty(id, self.page_size(), kind);
        page.mark_dirty();
        self.make_room()?;
        self.cache.put(page);
        Ok(id)
    }

    /// Releases a page back to the freelist, truncating the file instead
    /// when the freelist is full and the page is the trailing one.
    pub fn free(&mut self, id: PageId) -> Result<()> {
        if id == 0 {
            raise!(Error::Internal, "attempt to free the header page");
        }

        self.cache.remove(id);

        let last = self.page_count().saturating_sub(1);
        if self.freelist.is_full() && id == last {
            self.device
                .truncate(id * self.page_size() as u64)
                .wrap_err("truncating file on page release")?;
            return Ok(());
        }

        self.freelist.release(id)?;
        self.dirty = true;
        Ok(())
    }

    fn make_room(&mut self) -> Result<()> {
        while self.cache.at_capacity() {
            let Some(mut victim) = self.cache.pop_victim() else {
                break;
            };
            if victim.is_dirty() {
                if let Err(e) = victim.write_to(self.device.as_mut()) {
                    self.cache.put(victim);
                    return Err(e).wrap_err("writing back evicted page");
                }
                self.metrics.pages_flushed += 1;
            }
        }
        Ok(())
    }

    /// Serialises the in-memory header fields and freelist into the header
    /// page payload, marking it dirty.
    fn sync_header_page(&mut self) -> Result<()> {
        if self.dirty {
            self.header.write_to(self.header_page.payload_mut())?;
        }
        self.freelist.store(self.header_page.payload_mut())?;
        Ok(())
    }

    /// Flushes every dirty page and the header to durable storage. The
    /// database stays open.
    pub fn flush(&mut self) -> Result<()> {
        self.sync_header_page()?;
        self.metrics.pages_flushed += self.cache.flush_all(self.device.as_mut())? as u64;
        if !self.read_only && self.header_page.is_dirty() {
            self.header_page.write_to(self.device.as_mut())?;
            self.metrics.pages_flushed += 1;
        }
        self.device.sync()
    }

    /// The flush half of close: header fields and freelist into the header
    /// payload, all dirty pages out, then the header page itself unless the
    /// database is read-only or in-memory.
    pub fn close_flush(&mut self) -> Result<()> {
        self.sync_header_page().wrap_err("serialising header at close")?;
        self.metrics.pages_flushed += self
            .cache
            .flush_all(self.device.as_mut())
            .wrap_err("flushing pages at close")? as u64;
        self.cache.clear();

        if !self.read_only && !self.is_in_memory() && self.header_page.is_dirty() {
            self.header_page
                .write_to(self.device.as_mut())
                .wrap_err("writing header page at close")?;
            self.metrics.pages_flushed += 1;
            self.device.sync()?;
        }
        self.dirty = false;
        Ok(())
    }

    /// Cross-checks the cache against the freelist and the file size.
    pub fn check_integrity(&self) -> Result<()> {
        let pages = self.page_count();
        self.cache
            .check_integrity(&self.freelist, pages)
            .map_err(|e| e.wrap_err(Error::IntegrityViolated))?;
        self.freelist
            .check_integrity(pages)
            .map_err(|e| e.wrap_err(Error::IntegrityViolated))?;
        Ok(())
    }
}
