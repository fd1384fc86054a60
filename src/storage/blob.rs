//! # Blob Store
//!
//! Records too large for the 8-byte inline encoding live out-of-line on
//! `Blob` pages. A blob occupies one or more pages chained through a
//! next-page id; the blob id handed back to the B-tree is the id of the
//! first page.
//!
//! ## Page Layout
//!
//! Every blob page payload starts with the link to the next page in the
//! chain (0 = end). The first page additionally carries the total record
//! size:
//!
//! ```text
//! First page payload:        Continuation page payload:
//! +-----------+              +-----------+
//! | next (8B) |              | next (8B) |
//! | size (8B) |              | data ...  |
//! | data ...  |              +-----------+
//! +-----------+
//! ```
//!
//! Blobs are never shared between keys: the B-tree frees a record blob
//! unconditionally on erase, and separator keys promoted into internal
//! nodes get their own key-blob copies.

use bumpalo::Bump;
use eyre::{ensure, Result, WrapErr};

use crate::error::{raise, Error};
use crate::storage::page::{PageId, PageType};
use crate::storage::pager::Pager;

/// Link field present on every blob page.
pub const BLOB_LINK_SIZE: usize = 8;
/// Link plus total size, present on the first page of a chain.
pub const BLOB_HEADER_SIZE: usize = 16;

/// Stores `data` out-of-line and returns the id of the first blob page.
/// Pages allocated for a chain that cannot be completed are released back
/// to the freelist before the error is returned.
pub fn alloc(pager: &mut Pager, data: &[u8]) -> Result<PageId> {
    let mut pages = Vec::new();
    match write_chain(pager, data, &mut pages) {
        Ok(first) => {
            pager.metrics_mut().blobs_allocated += 1;
            Ok(first)
        }
        Err(e) => {
            for &id in &pages {
                let _ = pager.free(id);
            }
            Err(e).wrap_err("allocating blob")
        }
    }
}

fn write_chain(pager: &mut Pager, data: &[u8], pages: &mut Vec<PageId>) -> Result<PageId> {
    let usable = pager.usable_page_size();
    let first_capacity = usable - BLOB_HEADER_SIZE;
    let rest_capacity = usable - BLOB_LINK_SIZE;

    let first = pager.alloc(PageType::Blob)?;
    pages.push(first);

    let head_len = data.len().min(first_capacity);
    {
        let page = pager.fetch(first)?;
        let payload = page.payload_mut();
        payload[..BLOB_LINK_SIZE].copy_from_slice(&0u64.to_le_bytes());
        payload[BLOB_LINK_SIZE..BLOB_HEADER_SIZE]
            .copy_from_slice(&(data.len() as u64).to_le_bytes());
        payload[BLOB_HEADER_SIZE..BLOB_HEADER_SIZE + head_len]
            .copy_from_slice(&data[..head_len]);
    }

    let mut written = head_len;
    let mut prev = first;
    while written < data.len() {
        let next = pager.alloc(PageType::Blob)?;
        pages.push(next);

        {
            let page = pager.fetch(prev)?;
            page.payload_mut()[..BLOB_LINK_SIZE].copy_from_slice(&next.to_le_bytes());
        }

        let chunk = (data.len() - written).min(rest_capacity);
        let page = pager.fetch(next)?;
        let payload = page.payload_mut();
        payload[..BLOB_LINK_SIZE].copy_from_slice(&0u64.to_le_bytes());
        payload[BLOB_LINK_SIZE..BLOB_LINK_SIZE + chunk]
            .copy_from_slice(&data[written..written + chunk]);

        written += chunk;
        prev = next;
    }

    Ok(first)
}

/// Reads the blob starting at `blob_id` into the given scratch arena and
/// returns the materialised bytes.
pub fn read<'a>(pager: &mut Pager, arena: &'a Bump, blob_id: PageId) -> Result<&'a [u8]> {
    let usable = pager.usable_page_size();
    let first_capacity = usable - BLOB_HEADER_SIZE;
    let rest_capacity = usable - BLOB_LINK_SIZE;

    let (mut next, size) = {
        let page = fetch_blob_page(pager, blob_id)?;
        let payload = page.payload();
        let next = u64::from_le_bytes(payload[..BLOB_LINK_SIZE].try_into().unwrap());
        let size = u64::from_le_bytes(
            payload[BLOB_LINK_SIZE..BLOB_HEADER_SIZE].try_into().unwrap(),
        ) as usize;
        (next, size)
    };

    ensure!(
        size as u64 <= pager.page_count() * usable as u64,
        "blob {} claims {} bytes, larger than the whole file",
        blob_id,
        size
    );

    let out = arena.alloc_slice_fill_copy(size, 0u8);

    let head_len = size.min(first_capacity);
    {
        let page = fetch_blob_page(pager, blob_id)?;
        out[..head_len]
            .copy_from_slice(&page.payload()[BLOB_HEADER_SIZE..BLOB_HEADER_SIZE + head_len]);
    }

    let mut read = head_len;
    while read < size {
        if next == 0 {
            raise!(
                Error::BlobNotFound,
                "blob {} chain truncated at {} of {} bytes",
                blob_id,
                read,
                size
            );
        }

        let chunk = (size - read).min(rest_capacity);
        let page = fetch_blob_page(pager, next)?;
        let payload = page.payload();
        out[read..read + chunk]
            .copy_from_slice(&payload[BLOB_LINK_SIZE..BLOB_LINK_SIZE + chunk]);
        next = u64::from_le_bytes(payload[..BLOB_LINK_SIZE].try_into().unwrap());
        read += chunk;
    }

    pager.metrics_mut().blobs_read += 1;
    Ok(out)
}

/// Releases every page of the blob chain starting at `blob_id`.
pub fn free(pager: &mut Pager, blob_id: PageId) -> Result<()> {
    let mut current = blob_id;
    while current != 0 {
        let next = {
            let page = fetch_blob_page(pager, current)?;
            u64::from_le_bytes(page.payload()[..BLOB_LINK_SIZE].try_into().unwrap())
        };
        pager.free(current)?;
        current = next;
    }
    Ok(())
}

fn fetch_blob_page(pager: &mut Pager, id: PageId) -> Result<&mut crate::storage::page::Page> {
    if id == 0 || id >= pager.page_count() {
        raise!(Error::BlobNotFound, "blob page {} out of range", id);
    }
    let page = pager.fetch(id)?;
    if page.kind() != PageType::Blob {
        raise!(Error::BlobNotFound, "page {} is not a blob page", id);
    }
    Ok(page)
}
