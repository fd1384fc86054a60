//! # Cursor Registry
//!
//! The database tracks its open cursors so that close can invalidate them
//! in one sweep. Cursors are tagged handles into an index-keyed table on
//! the database; there are no intrusive lists and a stale handle simply
//! fails to resolve.
//!
//! Only the lifecycle surface lives here (create, clone, close); movement
//! beyond what find/insert/erase need is a later extension, so a cursor's
//! position is at most "parked on a slot".

use hashbrown::HashMap;

use crate::storage::PageId;

/// A handle to a live cursor. Holds only its registry index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cursor {
    id: u64,
}

impl Cursor {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Default, Clone)]
struct CursorState {
    /// Leaf page and slot the cursor last settled on, if any.
    position: Option<(PageId, usize)>,
}

#[derive(Debug, Default)]
pub struct CursorRegistry {
    slots: HashMap<u64, CursorState>,
    next_id: u64,
}

impl CursorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self) -> Cursor {
        let id = self.next_id;
        self.next_id += 1;
        self.slots.insert(id, CursorState::default());
        Cursor { id }
    }

    pub fn clone_cursor(&mut self, cursor: Cursor) -> Option<Cursor> {
        let state = self.slots.get(&cursor.id)?.clone();
        let id = self.next_id;
        self.next_id += 1;
        self.slots.insert(id, state);
        Some(Cursor { id })
    }

    pub fn close(&mut self, cursor: Cursor) -> bool {
        self.slots.remove(&cursor.id).is_some()
    }

    pub fn is_live(&self, cursor: Cursor) -> bool {
        self.slots.contains_key(&cursor.id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drops every cursor; used by database close.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}
