//! # Freelist
//!
//! The freelist tracks page ids that were released and can be handed out
//! again before the file is extended. It lives entirely inside the header
//! page: a fixed-capacity array of u64 page ids following the header
//! fields.
//!
//! ## Persistent Layout
//!
//! Within the header-page payload, starting at `FREELIST_OFFSET`:
//!
//! ```text
//! Offset  Size  Field      Description
//! ------  ----  ---------  -----------------------------------
//! 0       4     max_size   Capacity in entries, fixed at create
//! 4       4     count      Live entries
//! 8       8*N   entries    Freed page ids, unordered
//! ```
//!
//! The capacity is whatever fits in the header page after the fixed header
//! fields; it never grows. When a release would overflow, the caller either
//! truncates the file (if the page is the trailing one) or leaks the page.
//!
//! The freelist manipulates page ids only. It never touches the cache or
//! the device; persisting it is the pager's job at shutdown.

use eyre::{ensure, Result};
use tracing::warn;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::PAGE_OVERHEAD;
use crate::storage::header::{DB_HEADER_SIZE, FREELIST_OFFSET};
use crate::storage::page::PageId;

pub const FREELIST_HEADER_SIZE: usize = 8;
pub const FREELIST_ENTRY_SIZE: usize = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FreelistHeader {
    max_size: U32,
    count: U32,
}

const _: () = assert!(std::mem::size_of::<FreelistHeader>() == FREELIST_HEADER_SIZE);

impl FreelistHeader {
    crate::le_accessors! {
        max_size: u32,
        count: u32,
    }
}

/// Outcome of recording a released page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Recorded,
    Full,
}

/// Entries the header page has room for at the given page size.
pub fn capacity_for(page_size: usize) -> usize {
    let payload = page_size - PAGE_OVERHEAD;
    (payload - DB_HEADER_SIZE - FREELIST_HEADER_SIZE) / FREELIST_ENTRY_SIZE
}

#[derive(Debug)]
pub struct Freelist {
    max_size: u32,
    entries: Vec<PageId>,
}

impl Freelist {
    pub fn new(max_size: u32) -> Self {
        Self {
            max_size,
            entries: Vec::new(),
        }
    }

    /// Reconstructs the freelist from a header-page payload.
    pub fn load(payload: &[u8]) -> Result<Self> {
        let region = &payload[FREELIST_OFFSET..];
        let header = FreelistHeader::ref_from_bytes(&region[..FREELIST_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse FreelistHeader: {:?}", e))?;

        let max_size = header.max_size();
        let count = header.count() as usize;
        ensure!(
            count <= max_size as usize,
            "freelist count {} exceeds capacity {}",
            count,
            max_size
        );
        ensure!(
            region.len() >= FREELIST_HEADER_SIZE + count * FREELIST_ENTRY_SIZE,
            "freelist payload truncated"
        );

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let at = FREELIST_HEADER_SIZE + i * FREELIST_ENTRY_SIZE;
            let id = U64::ref_from_bytes(&region[at..at + FREELIST_ENTRY_SIZE])
                .map_err(|e| eyre::eyre!("failed to parse freelist entry: {:?}", e))?;
            entries.push(id.get());
        }

        Ok(Self { max_size, entries })
    }

    /// Writes the freelist into a header-page payload.
    pub fn store(&self, payload: &mut [u8]) -> Result<()> {
        let region = &mut payload[FREELIST_OFFSET..];
        ensure!(
            region.len() >= FREELIST_HEADER_SIZE + self.entries.len() * FREELIST_ENTRY_SIZE,
            "freelist does not fit header payload"
        );

        let mut header = FreelistHeader {
            max_size: U32::new(0),
            count: U32::new(0),
        };
        header.set_max_size(self.max_size);
        header.set_count(self.entries.len() as u32);
        region[..FREELIST_HEADER_SIZE].copy_from_slice(header.as_bytes());

        for (i, &id) in self.entries.iter().enumerate() {
            let at = FREELIST_HEADER_SIZE + i * FREELIST_ENTRY_SIZE;
            region[at..at + FREELIST_ENTRY_SIZE].copy_from_slice(&id.to_le_bytes());
        }
        Ok(())
    }

    /// Pops a free page id, if any.
    pub fn pop(&mut self) -> Option<PageId> {
        self.entries.pop()
    }

    /// Records a released page id. Returns [`Release::Full`] when the
    /// freelist has no room; the caller decides whether to truncate or
    /// leak the page.
    pub fn release(&mut self, id: PageId) -> Result<Release> {
        ensure!(
            !self.entries.contains(&id),
            "page {} released twice",
            id
        );
        if self.entries.len() >= self.max_size as usize {
            warn!(page = id, "freelist full, page not recorded");
            return Ok(Release::Full);
        }
        self.entries.push(id);
        Ok(Release::Recorded)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_size as usize
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    pub fn contains(&self, id: PageId) -> bool {
        self.entries.contains(&id)
    }

    pub fn entries(&self) -> &[PageId] {
        &self.entries
    }

    /// Verifies the structural invariants: no duplicates, no header page,
    /// every entry within the allocated file.
    pub fn check_integrity(&self, page_count: u64) -> Result<()> {
        let mut seen = self.entries.clone();
        seen.sort_unstable();
        let before = seen.len();
        seen.dedup();
        ensure!(seen.len() == before, "freelist contains duplicate entries");
        ensure!(!self.contains(0), "freelist contains the header page");
        for &id in &self.entries {
            ensure!(
                id < page_count,
                "freelist entry {} beyond file end ({} pages)",
                id,
                page_count
            );
        }
        Ok(())
    }
}
