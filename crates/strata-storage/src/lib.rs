//! Storage engine for StrataDB.
//!
//! This crate provides:
//! - Disk manager for page-level file I/O
//! - Key/value codec traits shared by the index structures
//! - An extendible hash index built from directory and bucket pages
//! - A B+ tree index with latch-crabbing concurrency
//! - The header page recording each index's root page

pub mod btree;
pub mod hash;

mod disk;
mod header;
mod keys;
mod rid;
mod transaction;

pub use btree::{BPlusTree, BTreeInternalPage, BTreeLeafPage, LeafIterator};
pub use disk::{DiskManager, DiskManagerConfig};
pub use hash::{ExtendibleHashTable, HashBucketPage, HashDirectoryPage};
pub use header::{HeaderPage, HEADER_PAGE_ID};
pub use keys::{DefaultKeyHasher, IdentityKeyHasher, IndexKey, IndexValue, KeyHasher};
pub use rid::RecordId;
pub use transaction::Transaction;
