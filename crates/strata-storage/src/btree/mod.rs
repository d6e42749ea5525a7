//! B+ tree index.
//!
//! Fixed-capacity leaf and internal pages resident in the buffer pool,
//! searched and mutated with hand-over-hand ("crabbing") page latches. A
//! tree-wide reader/writer lock protects the root pointer; write
//! operations release it, together with all retained ancestor latches, as
//! soon as the descent reaches a node whose mutation cannot propagate
//! upward.

mod iterator;
mod page;
mod tree;

pub use iterator::LeafIterator;
pub use page::{
    internal_page_capacity, leaf_page_capacity, peek_max_size, peek_page_type, peek_size,
    BTreeInternalPage, BTreeLeafPage, BTreePageType,
};
pub use tree::BPlusTree;
