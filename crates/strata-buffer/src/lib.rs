//! Buffer pool management for StrataDB.
//!
//! This crate provides in-memory page caching with:
//! - Fixed-size buffer pool instances with configurable frame count
//! - LRU eviction policy over unpinned frames
//! - Pin counting for concurrent access
//! - Per-page reader/writer latches with RAII guards
//! - A sharded front-end that round-robins page allocation across instances

mod frame;
mod parallel;
mod pool;
mod replacer;

pub use frame::{Frame, FrameId};
pub use parallel::{ParallelBufferPool, ReadPageGuard, WritePageGuard};
pub use pool::{BufferPoolInstance, DiskDriver};
pub use replacer::{LruReplacer, Replacer};
