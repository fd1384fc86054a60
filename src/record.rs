//! # Records and the Inline Encoding
//!
//! Every B-tree slot carries an 8-byte record pointer whose meaning depends
//! on the slot's key flags. Records small enough to fit are packed straight
//! into the pointer word; anything larger lives in the blob store and the
//! word holds the blob id.
//!
//! ## Size Classes
//!
//! ```text
//! Class   Length    Pointer word (little-endian bytes)
//! -----   -------   ----------------------------------
//! EMPTY   0         unused
//! TINY    1..=7     data in bytes [0..len), len in byte 7
//! SMALL   8         data occupies all 8 bytes
//! blob    9..       blob page id
//! ```
//!
//! Decoding is centralised in [`RecordPtr`]: find uses it to materialise
//! record bytes and erase uses it to decide whether a blob must be freed.
//! Both sides must agree, so there is exactly one predicate.

use crate::storage::PageId;

/// Key flag bits stored per slot. `TINY`/`SMALL`/`EMPTY` classify inline
/// records; `EXTENDED` marks a key that spilled into a key blob.
pub mod key_flags {
    pub const BLOB_SIZE_TINY: u8 = 0x01;
    pub const BLOB_SIZE_SMALL: u8 = 0x02;
    pub const BLOB_SIZE_EMPTY: u8 = 0x04;
    pub const EXTENDED: u8 = 0x08;

    pub const INLINE_MASK: u8 = BLOB_SIZE_TINY | BLOB_SIZE_SMALL | BLOB_SIZE_EMPTY;
}

/// Largest record that fits the pointer word.
pub const INLINE_MAX: usize = 8;

/// The decoded meaning of a slot's record-pointer word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordPtr {
    Empty,
    Tiny { data: [u8; 7], len: u8 },
    Small([u8; 8]),
    Blob(PageId),
}

impl RecordPtr {
    /// Encodes a record for storage. Returns the pointer word and the key
    /// flag bits to set; records longer than [`INLINE_MAX`] must go through
    /// the blob store first and use [`RecordPtr::encode_blob`].
    pub fn encode_inline(data: &[u8]) -> Option<(u64, u8)> {
        match data.len() {
            0 => Some((0, key_flags::BLOB_SIZE_EMPTY)),
            len @ 1..=7 => {
                let mut word = [0u8; 8];
                word[..len].copy_from_slice(data);
                word[7] = len as u8;
                Some((u64::from_le_bytes(word), key_flags::BLOB_SIZE_TINY))
            }
            8 => Some((
                u64::from_le_bytes(data.try_into().unwrap()),
                key_flags::BLOB_SIZE_SMALL,
            )),
            _ => None,
        }
    }

    pub fn encode_blob(blob_id: PageId) -> (u64, u8) {
        (blob_id, 0)
    }

    /// Decodes a pointer word under the slot's key flags.
    pub fn decode(word: u64, flags: u8) -> RecordPtr {
        let bytes = word.to_le_bytes();
        if flags & key_flags::BLOB_SIZE_TINY != 0 {
            let len = bytes[7].min(7);
            let mut data = [0u8; 7];
            data[..len as usize].copy_from_slice(&bytes[..len as usize]);
            RecordPtr::Tiny { data, len }
        } else if flags & key_flags::BLOB_SIZE_SMALL != 0 {
            RecordPtr::Small(bytes)
        } else if flags & key_flags::BLOB_SIZE_EMPTY != 0 {
            RecordPtr::Empty
        } else {
            RecordPtr::Blob(word)
        }
    }

    /// True when the pointer references the blob store.
    pub fn is_blob(flags: u8) -> bool {
        flags & key_flags::INLINE_MASK == 0
    }

    pub fn inline_bytes(&self) -> Option<&[u8]> {
        match self {
            RecordPtr::Empty => Some(&[]),
            RecordPtr::Tiny { data, len } => Some(&data[..*len as usize]),
            RecordPtr::Small(bytes) => Some(&bytes[..]),
            RecordPtr::Blob(_) => None,
        }
    }
}

/// A record returned by `find`. The bytes live in a scratch arena owned by
/// the database; the borrow ends at the next database call, which is when
/// the arena may be reused.
#[derive(Debug)]
pub struct Record<'a> {
    data: &'a [u8],
    intflags: u8,
}

impl<'a> Record<'a> {
    pub(crate) fn new(data: &'a [u8], intflags: u8) -> Self {
        Self { data, intflags }
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The slot's key flag bits, exposing the inline size class.
    pub fn intflags(&self) -> u8 {
        self.intflags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_record_encodes_to_empty_class() {
        let (word, flags) = RecordPtr::encode_inline(&[]).unwrap();
        assert_eq!(flags, key_flags::BLOB_SIZE_EMPTY);
        assert_eq!(RecordPtr::decode(word, flags), RecordPtr::Empty);
    }

    #[test]
    fn tiny_record_keeps_length_in_top_byte() {
        let (word, flags) = RecordPtr::encode_inline(b"abc").unwrap();
        assert_eq!(flags, key_flags::BLOB_SIZE_TINY);
        assert_eq!(word.to_le_bytes()[7], 3);

        match RecordPtr::decode(word, flags) {
            RecordPtr::Tiny { data, len } => {
                assert_eq!(&data[..len as usize], b"abc");
            }
            other => panic!("expected Tiny, got {:?}", other),
        }
    }

    #[test]
    fn seven_byte_record_is_still_tiny() {
        let (word, flags) = RecordPtr::encode_inline(b"1234567").unwrap();
        assert_eq!(flags, key_flags::BLOB_SIZE_TINY);
        let decoded = RecordPtr::decode(word, flags);
        assert_eq!(decoded.inline_bytes().unwrap(), b"1234567");
    }

    #[test]
    fn eight_byte_record_uses_whole_word() {
        let (word, flags) = RecordPtr::encode_inline(b"exactly8").unwrap();
        assert_eq!(flags, key_flags::BLOB_SIZE_SMALL);
        assert_eq!(RecordPtr::decode(word, flags).inline_bytes().unwrap(), b"exactly8");
    }

    #[test]
    fn nine_bytes_does_not_encode_inline() {
        assert!(RecordPtr::encode_inline(b"123456789").is_none());
    }

    #[test]
    fn blob_pointer_roundtrip() {
        let (word, flags) = RecordPtr::encode_blob(42);
        assert!(RecordPtr::is_blob(flags));
        assert_eq!(RecordPtr::decode(word, flags), RecordPtr::Blob(42));
        assert!(RecordPtr::decode(word, flags).inline_bytes().is_none());
    }

    #[test]
    fn inline_flags_are_not_blob() {
        assert!(!RecordPtr::is_blob(key_flags::BLOB_SIZE_TINY));
        assert!(!RecordPtr::is_blob(key_flags::BLOB_SIZE_SMALL));
        assert!(!RecordPtr::is_blob(key_flags::BLOB_SIZE_EMPTY));
        assert!(RecordPtr::is_blob(key_flags::EXTENDED));
        assert!(RecordPtr::is_blob(0));
    }
}
