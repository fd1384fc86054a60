//! # Pages
//!
//! The page is the unit of I/O: a buffer of exactly the configured page
//! size, addressed by its 64-bit page id (file offset divided by page
//! size). Page id 0 is reserved for the database header.
//!
//! ## On-Disk Layout
//!
//! Every page starts with an 8-byte page header; the rest is payload:
//!
//! ```text
//! Offset  Size  Field      Description
//! ------  ----  ---------  -----------------------------------
//! 0       1     page_type  Header, Index, Blob or Freelist
//! 1       7     reserved   Zeroed
//! 8       ...   payload    page_size - 8 bytes
//! ```
//!
//! The header page's persistent fields therefore begin at file offset 8,
//! directly after its page header.
//!
//! ## Dirty Tracking
//!
//! A page is dirty exactly when its in-memory buffer differs from the
//! on-disk contents. `payload_mut` marks the page dirty; writing the page
//! through the device clears the flag.

use eyre::{ensure, Result};

use crate::config::PAGE_OVERHEAD;
use crate::storage::device::Device;

pub type PageId = u64;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Unknown = 0x00,
    Header = 0x01,
    Index = 0x02,
    Blob = 0x03,
    Freelist = 0x04,
}

impl PageType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => PageType::Header,
            0x02 => PageType::Index,
            0x03 => PageType::Blob,
            0x04 => PageType::Freelist,
            _ => PageType::Unknown,
        }
    }
}

#[derive(Debug)]
pub struct Page {
    id: PageId,
    dirty: bool,
    buf: Box<[u8]>,
}

impl Page {
    /// Allocates a zeroed in-memory page that does not yet exist on disk.
    pub fn empty(id: PageId, page_size: usize, kind: PageType) -> Self {
        let mut buf = vec![0u8; page_size].into_boxed_slice();
        buf[0] = kind as u8;
        Self {
            id,
            dirty: false,
            buf,
        }
    }

    /// Reads the page with the given id from the device.
    pub fn load_from(device: &mut dyn Device, id: PageId, page_size: usize) -> Result<Self> {
        let mut buf = vec![0u8; page_size].into_boxed_slice();
        device.read_at(id * page_size as u64, &mut buf)?;
        Ok(Self {
            id,
            dirty: false,
            buf,
        })
    }

    /// Writes the page through the device and clears the dirty flag.
    pub fn write_to(&mut self, device: &mut dyn Device) -> Result<()> {
        device.write_at(self.id * self.buf.len() as u64, &self.buf)?;
        self.dirty = false;
        Ok(())
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn kind(&self) -> PageType {
        PageType::from_byte(self.buf[0])
    }

    pub fn set_kind(&mut self, kind: PageType) {
        self.buf[0] = kind as u8;
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[PAGE_OVERHEAD..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.buf[PAGE_OVERHEAD..]
    }

    /// Raw page bytes including the page header. Used when serialising the
    /// header page, whose fields are specified at file-absolute offsets.
    pub fn raw(&self) -> &[u8] {
        &self.buf
    }

    pub fn raw_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.buf
    }
}

/// Checks the structural invariants a page must satisfy regardless of type.
pub fn validate_page(page: &Page, page_size: usize) -> Result<()> {
    ensure!(
        page.raw().len() == page_size,
        "invalid page buffer size: {} != {}",
        page.raw().len(),
        page_size
    );
    ensure!(
        page.kind() != PageType::Unknown,
        "page {} has invalid type tag {:02x}",
        page.id(),
        page.raw()[0]
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::device::MemDevice;

    #[test]
    fn page_type_from_byte() {
        assert_eq!(PageType::from_byte(0x00), PageType::Unknown);
        assert_eq!(PageType::from_byte(0x01), PageType::Header);
        assert_eq!(PageType::from_byte(0x02), PageType::Index);
        assert_eq!(PageType::from_byte(0x03), PageType::Blob);
        assert_eq!(PageType::from_byte(0x04), PageType::Freelist);
        assert_eq!(PageType::from_byte(0xFF), PageType::Unknown);
    }

    #[test]
    fn empty_page_is_zeroed_and_typed() {
        let page = Page::empty(3, 512, PageType::Index);

        assert_eq!(page.id(), 3);
        assert_eq!(page.kind(), PageType::Index);
        assert!(!page.is_dirty());
        assert!(page.payload().iter().all(|&b| b == 0));
        assert_eq!(page.payload().len(), 512 - PAGE_OVERHEAD);
    }

    #[test]
    fn payload_mut_marks_dirty() {
        let mut page = Page::empty(0, 512, PageType::Header);
        assert!(!page.is_dirty());

        page.payload_mut()[0] = 1;
        assert!(page.is_dirty());
    }

    #[test]
    fn write_clears_dirty_and_roundtrips() {
        let mut dev = MemDevice::new();
        let mut page = Page::empty(2, 512, PageType::Blob);
        page.payload_mut()[..4].copy_from_slice(b"data");

        page.write_to(&mut dev).unwrap();
        assert!(!page.is_dirty());

        let loaded = Page::load_from(&mut dev, 2, 512).unwrap();
        assert_eq!(loaded.kind(), PageType::Blob);
        assert_eq!(&loaded.payload()[..4], b"data");
        assert!(!loaded.is_dirty());
    }

    #[test]
    fn validate_rejects_unknown_type() {
        let page = Page::empty(1, 512, PageType::Unknown);
        assert!(validate_page(&page, 512).is_err());

        let page = Page::empty(1, 512, PageType::Index);
        assert!(validate_page(&page, 512).is_ok());
    }
}
