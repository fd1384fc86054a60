//! # Transactions
//!
//! A transaction is the scope of one logical operation: it exists from the
//! moment the database starts dispatching until the operation returns, and
//! it owns the scratch arena that backs keys materialised along the way
//! (extended keys pulled out of the blob store for comparison). There is
//! no write-ahead log and no multi-operation atomicity here; commit
//! releases the scratch, abort additionally signals that the operation's
//! in-memory work is being discarded.
//!
//! Public operations run under a `TEMPORARY` transaction. Records returned
//! to the caller must outlive the operation, so their bytes land in the
//! database's own per-handle arena, which stays valid until the next call
//! on the handle.

use bumpalo::Bump;

pub const TXN_TEMPORARY: u32 = 0x0000_0001;

pub struct Txn {
    flags: u32,
    key_arena: Bump,
}

impl Txn {
    pub fn begin(flags: u32) -> Self {
        Self {
            flags,
            key_arena: Bump::new(),
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.flags & TXN_TEMPORARY != 0
    }

    /// Scratch space for keys materialised during this operation.
    pub fn key_arena(&self) -> &Bump {
        &self.key_arena
    }

    /// Ends the operation successfully. The scratch arena is released;
    /// no pages are flushed here.
    pub fn commit(self) {}

    /// Ends the operation after a failure, discarding scratch state.
    pub fn abort(self) {}
}
