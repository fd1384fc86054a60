//! # Page Cache
//!
//! The cache is the only buffer between the engine and the device: every
//! page fetch goes through it, and dirty pages accumulate here until they
//! are flushed or evicted.
//!
//! ## Eviction
//!
//! Recency is tracked by an LRU list (most recently used at the head). A
//! lookup promotes the page; when an insert finds the cache at capacity the
//! least recently used page becomes the victim. Dirty victims are written
//! back through the device before their buffer is dropped; clean victims
//! are simply discarded.
//!
//! The header page is pinned for the lifetime of the database and never
//! enters the cache; the pager holds it directly.
//!
//! ## Capacity Zero
//!
//! A capacity of zero disables caching. The cache then degrades to a single
//! staging slot: each miss writes back the previously staged page (if
//! dirty) and replaces it, so every fetch is a device read and every
//! mutation reaches the device before another page is touched.
//!
//! ## Ownership
//!
//! The cache owns the page buffers. Operations borrow a page through the
//! pager for the duration of one access; the borrow checker guarantees no
//! reference survives a later fetch, which is what makes eviction safe
//! without pin counting.

use std::num::NonZeroUsize;

use eyre::{ensure, Result};
use lru::LruCache;

use crate::storage::device::Device;
use crate::storage::freelist::Freelist;
use crate::storage::page::{Page, PageId};

pub struct PageCache {
    capacity: usize,
    entries: LruCache<PageId, Page>,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        let slots = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            capacity,
            entries: LruCache::new(slots),
        }
    }

    /// Configured capacity; zero means caching is disabled.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up a cached page and promotes it to most recently used.
    pub fn lookup(&mut self, id: PageId) -> Option<&mut Page> {
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: PageId) -> bool {
        self.entries.contains(&id)
    }

    /// True when inserting another page requires evicting one first.
    pub fn at_capacity(&self) -> bool {
        self.entries.len() >= self.entries.cap().get()
    }

    /// Removes and returns the least recently used page. The caller writes
    /// it back if dirty.
    pub fn pop_victim(&mut self) -> Option<Page> {
        self.entries.pop_lru().map(|(_, page)| page)
    }

    /// Inserts a freshly fetched or allocated page. The caller must have
    /// made room first; a same-id insert replaces the stale entry.
    pub fn put(&mut self, page: Page) {
        debug_assert!(!self.at_capacity() || self.entries.contains(&page.id()));
        self.entries.put(page.id(), page);
    }

    /// Drops a page without writing it, e.g. when it is being freed.
    pub fn remove(&mut self, id: PageId) -> Option<Page> {
        self.entries.pop(&id)
    }

    /// Writes every dirty page through the device. Returns the number of
    /// pages written.
    pub fn flush_all(&mut self, device: &mut dyn Device) -> Result<usize> {
        let mut flushed = 0;
        for (_, page) in self.entries.iter_mut() {
            if page.is_dirty() {
                page.write_to(device)?;
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Discards every cached page. Dirty pages must have been flushed.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Verifies that no cached page is simultaneously free and that every
    /// cached page has allocated storage behind it.
    pub fn check_integrity(&self, freelist: &Freelist, page_count: u64) -> Result<()> {
        for (&id, page) in self.entries.iter() {
            ensure!(
                !freelist.contains(id),
                "page {} is cached but also in the freelist",
                id
            );
            ensure!(
                id < page_count,
                "cached page {} has no allocated storage ({} pages)",
                id,
                page_count
            );
            ensure!(page.id() == id, "cache key {} holds page {}", id, page.id());
        }
        Ok(())
    }
}
