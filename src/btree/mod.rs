//! # B-Tree Backend
//!
//! The ordered index over (key → record pointer). Nodes are fixed-slot
//! pages: every slot carries the key length, the key flags, an 8-byte
//! record pointer and the inline key bytes padded to the configured key
//! size, so slots move between nodes as plain byte ranges.
//!
//! - `node`: the on-page node and slot layout
//! - `tree`: search, insert with splits, erase with rebalancing, ordered
//!   scan and structural integrity checking

mod node;
mod tree;

pub use node::{
    build_slot, node_capacity, Node, NodeHeader, NodeMut, SlotHeader, EXTENDED_BLOB_REF_SIZE,
    NODE_FLAG_LEAF, NODE_HEADER_SIZE, SLOT_FIXED_SIZE,
};
pub use tree::BtreeBackend;
