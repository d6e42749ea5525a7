//! Extendible hash index.
//!
//! The index is a single directory page plus a set of bucket pages. The
//! directory maps the low `G` bits of a key's hash to a bucket page; each
//! bucket carries a local depth `L <= G` giving the number of hash bits all
//! of its keys agree on. Buckets split (possibly doubling the directory)
//! when full and merge with their image (possibly halving the directory)
//! when empty.

mod bucket;
mod directory;
mod table;

pub use bucket::{bucket_array_size, HashBucketPage};
pub use directory::{HashDirectoryPage, DIRECTORY_ARRAY_SIZE, MAX_GLOBAL_DEPTH};
pub use table::ExtendibleHashTable;
