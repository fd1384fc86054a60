//! # Database Header
//!
//! The header page (page id 0) persists everything the engine needs to
//! reopen a file: magic bytes, format version, serial number, persistent
//! flags, page and key sizes, the backend's root page id, and the embedded
//! freelist payload.
//!
//! ## Layout
//!
//! File-absolute offsets; the first 8 bytes are the ordinary page header,
//! so the fields below live in the page payload:
//!
//! ```text
//! Offset  Size  Field       Description
//! ------  ----  ----------  -------------------------------------
//! 0       8     (page hdr)  Type tag + reserved
//! 8       4     magic       'H' 'A' 'M' '\0'
//! 12      4     version     { major, minor, rev, 0 }
//! 16      4     serial      Serial number
//! 20      4     flags       Persistent flags (backend tag, key mode)
//! 24      2     page_size   Fixed at create time
//! 26      2     key_size    Inline key capacity per slot
//! 28      8     root_page   Backend root page id (0 = empty tree)
//! 36      ...   freelist    max_size (u32), count (u32), u64 entries
//! ```
//!
//! The magic, version, page size and key size never change after create.
//! All multi-byte fields are little-endian; the struct uses zerocopy
//! `Unaligned` wrappers so it can be read in place from the page payload.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const MAGIC: &[u8; 4] = b"HAM\0";

pub const VERSION_MAJ: u8 = 1;
pub const VERSION_MIN: u8 = 0;
pub const VERSION_REV: u8 = 0;

pub const SERIAL: u32 = 0;

/// Size of the fixed header fields within the header-page payload.
pub const DB_HEADER_SIZE: usize = 28;

/// Offset of the freelist payload within the header-page payload.
pub const FREELIST_OFFSET: usize = DB_HEADER_SIZE;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DbHeader {
    magic: [u8; 4],
    version: [u8; 4],
    serial: U32,
    flags: U32,
    page_size: U16,
    key_size: U16,
    root_page: U64,
}

const _: () = assert!(std::mem::size_of::<DbHeader>() == DB_HEADER_SIZE);

impl DbHeader {
    pub fn new(flags: u32, page_size: u16, key_size: u16) -> Self {
        Self {
            magic: *MAGIC,
            version: [VERSION_MAJ, VERSION_MIN, VERSION_REV, 0],
            serial: U32::new(SERIAL),
            flags: U32::new(flags),
            page_size: U16::new(page_size),
            key_size: U16::new(key_size),
            root_page: U64::new(0),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= DB_HEADER_SIZE,
            "buffer too small for DbHeader: {} < {}",
            bytes.len(),
            DB_HEADER_SIZE
        );
        Self::ref_from_bytes(&bytes[..DB_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse DbHeader: {:?}", e))
    }

    pub fn write_to(&self, bytes: &mut [u8]) -> Result<()> {
        ensure!(
            bytes.len() >= DB_HEADER_SIZE,
            "buffer too small for DbHeader: {} < {}",
            bytes.len(),
            DB_HEADER_SIZE
        );
        bytes[..DB_HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn magic_ok(&self) -> bool {
        &self.magic == MAGIC
    }

    pub fn version_ok(&self) -> bool {
        self.version[0] == VERSION_MAJ && self.version[1] == VERSION_MIN
    }

    pub fn version(&self) -> (u8, u8, u8) {
        (self.version[0], self.version[1], self.version[2])
    }

    crate::le_accessors! {
        serial: u32,
        flags: u32,
        page_size: u16,
        key_size: u16,
        root_page: u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_28_bytes() {
        assert_eq!(std::mem::size_of::<DbHeader>(), 28);
    }

    #[test]
    fn new_header_has_magic_and_version() {
        let header = DbHeader::new(0, 4096, 20);

        assert!(header.magic_ok());
        assert!(header.version_ok());
        assert_eq!(header.version(), (VERSION_MAJ, VERSION_MIN, VERSION_REV));
        assert_eq!(header.page_size(), 4096);
        assert_eq!(header.key_size(), 20);
        assert_eq!(header.root_page(), 0);
    }

    #[test]
    fn header_roundtrip_through_bytes() {
        let mut header = DbHeader::new(0x0100_0004, 1024, 16);
        header.set_root_page(7);

        let mut buf = [0u8; 64];
        header.write_to(&mut buf).unwrap();

        let parsed = DbHeader::from_bytes(&buf).unwrap();
        assert!(parsed.magic_ok());
        assert_eq!(parsed.flags(), 0x0100_0004);
        assert_eq!(parsed.page_size(), 1024);
        assert_eq!(parsed.key_size(), 16);
        assert_eq!(parsed.root_page(), 7);
    }

    #[test]
    fn field_offsets_match_file_format() {
        let mut header = DbHeader::new(0xAABB_CCDD, 0x1234, 0x5678);
        header.set_serial(0x1122_3344);
        header.set_root_page(0x0102_0304_0506_0708);

        let bytes = header.as_bytes();

        assert_eq!(&bytes[0..4], b"HAM\0");
        assert_eq!(bytes[4], VERSION_MAJ);
        assert_eq!(bytes[5], VERSION_MIN);
        assert_eq!(&bytes[8..12], &0x1122_3344u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &0xAABB_CCDDu32.to_le_bytes());
        assert_eq!(&bytes[16..18], &0x1234u16.to_le_bytes());
        assert_eq!(&bytes[18..20], &0x5678u16.to_le_bytes());
        assert_eq!(&bytes[20..28], &0x0102_0304_0506_0708u64.to_le_bytes());
    }

    #[test]
    fn tampered_magic_is_detected() {
        let mut buf = [0u8; 28];
        DbHeader::new(0, 512, 16).write_to(&mut buf).unwrap();
        buf[0..4].copy_from_slice(b"XXX\0");

        let parsed = DbHeader::from_bytes(&buf).unwrap();
        assert!(!parsed.magic_ok());
    }
}
