//! # Engine Configuration
//!
//! This module centralizes the tunables and flag words of the engine.
//! Constants that depend on each other are co-located so a change to one is
//! visible next to the others it constrains.
//!
//! ```text
//! PAGE_OVERHEAD (8 bytes)
//!       │
//!       └─> usable payload = page_size - PAGE_OVERHEAD
//!             │
//!             ├─> DbHeader occupies the first 28 payload bytes of page 0
//!             │
//!             └─> freelist capacity = (payload - 28 - 8) / 8
//!
//! MIN_PAGE_SIZE (512)
//!       │
//!       ├─> page sizes must be a multiple of this
//!       │
//!       └─> HEADER_PROBE_SIZE == MIN_PAGE_SIZE, so the probe always
//!           covers the page-size field regardless of the real page size
//! ```
//!
//! A page must hold at least [`MIN_KEYS_PER_PAGE`] keys of the configured
//! key size; `create` rejects combinations that cannot.

/// Bytes of on-disk page header preceding every page payload.
pub const PAGE_OVERHEAD: usize = 8;

/// Smallest supported page size; page sizes must be a multiple of this.
pub const MIN_PAGE_SIZE: usize = 512;

/// Bytes read from offset 0 before the real page size is known.
pub const HEADER_PROBE_SIZE: usize = MIN_PAGE_SIZE;

/// A page must be large enough for at least this many keys.
pub const MIN_KEYS_PER_PAGE: usize = 4;

pub const DEFAULT_PAGE_SIZE: u16 = 4096;
pub const DEFAULT_KEY_SIZE: u16 = 20;
pub const DEFAULT_CACHE_CAPACITY: usize = 64;

/// Open/create flags. Unlisted bits are reserved.
pub mod db_flags {
    /// Refuse all mutating operations.
    pub const READ_ONLY: u32 = 0x0000_0001;
    /// Back the database with memory instead of a file. Create only.
    pub const IN_MEMORY: u32 = 0x0000_0002;
    /// Fail inserts whose key exceeds the configured key size instead of
    /// spilling the key into a blob.
    pub const DISABLE_VAR_KEY_LEN: u32 = 0x0000_0004;

    /// Bits of the persistent flags word identifying the backend that owns
    /// the root page.
    pub const BACKEND_MASK: u32 = 0x0F00_0000;
    pub const BACKEND_BTREE: u32 = 0x0100_0000;

    /// Flag bits persisted in the header (creation-time properties only).
    pub const PERSISTENT_MASK: u32 = DISABLE_VAR_KEY_LEN | BACKEND_MASK;
}

/// Per-insert flags.
pub mod insert_flags {
    /// Replace the record of an existing key instead of failing with
    /// `DuplicateKey`.
    pub const OVERWRITE: u32 = 0x0000_0001;
}

/// Creation parameters for a database. `page_size` or `key_size` of zero
/// selects the default.
#[derive(Debug, Clone)]
pub struct Config {
    pub flags: u32,
    /// Unix permission bits for the created file; ignored elsewhere.
    pub mode: u32,
    pub page_size: u16,
    pub key_size: u16,
    /// Page cache capacity in pages; zero disables caching.
    pub cache_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flags: 0,
            mode: 0o644,
            page_size: DEFAULT_PAGE_SIZE,
            key_size: DEFAULT_KEY_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl Config {
    pub fn with_flags(flags: u32) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }
}

const _: () = assert!(HEADER_PROBE_SIZE >= 28 + PAGE_OVERHEAD);
const _: () = assert!(DEFAULT_PAGE_SIZE as usize % MIN_PAGE_SIZE == 0);
