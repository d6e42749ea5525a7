//! Extendible hash table over buffer-pool-resident pages.

use crate::hash::bucket::{bucket_array_size, HashBucketPage};
use crate::hash::directory::HashDirectoryPage;
use crate::keys::{IndexKey, IndexValue, KeyHasher};
use crate::transaction::Transaction;
use log::{debug, warn};
use parking_lot::RwLock;
use std::marker::PhantomData;
use std::sync::Arc;
use strata_buffer::ParallelBufferPool;
use strata_common::page::{PageId, PAGE_SIZE};
use strata_common::Result;

/// A concurrent extendible hash index.
///
/// The table-wide reader/writer lock arbitrates between plain operations
/// (shared) and structural changes (exclusive): lookups take the table lock
/// shared plus a bucket read latch, point inserts and removes take it
/// shared plus a bucket write latch, and splits and merges take it
/// exclusive. The directory page is only ever read or written while the
/// table lock is held.
pub struct ExtendibleHashTable<K, V, H>
where
    K: IndexKey,
    V: IndexValue,
    H: KeyHasher<K>,
{
    /// Page holding the directory.
    directory_page_id: PageId,
    /// Shared buffer pool.
    pool: Arc<ParallelBufferPool>,
    /// Table-wide lock; write side serializes structural changes.
    table_latch: RwLock<()>,
    /// Hash function.
    hasher: H,
    /// Capacity of each bucket page.
    bucket_max_size: usize,
    _marker: PhantomData<(K, V)>,
}

impl<K, V, H> ExtendibleHashTable<K, V, H>
where
    K: IndexKey,
    V: IndexValue,
    H: KeyHasher<K>,
{
    /// Creates a new hash table with full-page buckets.
    pub fn new(pool: Arc<ParallelBufferPool>, hasher: H) -> Result<Self> {
        let capacity = bucket_array_size(K::ENCODED_SIZE + V::ENCODED_SIZE);
        Self::with_bucket_capacity(pool, hasher, capacity)
    }

    /// Creates a new hash table with an explicit bucket capacity.
    ///
    /// Small capacities make directory growth observable with few keys.
    pub fn with_bucket_capacity(
        pool: Arc<ParallelBufferPool>,
        hasher: H,
        bucket_max_size: usize,
    ) -> Result<Self> {
        // Allocate the directory and the initial bucket. A fresh page is
        // all zeroes, which is exactly an empty bucket.
        let mut dir_guard = pool.new_page_write()?;
        let bucket_guard = pool.new_page_write()?;

        let mut directory = HashDirectoryPage::new(dir_guard.page_id());
        directory.set_bucket_page_id(0, bucket_guard.page_id());
        dir_guard.data_mut().copy_from_slice(directory.as_bytes());

        let directory_page_id = dir_guard.page_id();
        drop(bucket_guard);
        drop(dir_guard);

        Ok(Self {
            directory_page_id,
            pool,
            table_latch: RwLock::new(()),
            hasher,
            bucket_max_size,
            _marker: PhantomData,
        })
    }

    /// Returns the directory page id.
    pub fn directory_page_id(&self) -> PageId {
        self.directory_page_id
    }

    /// Returns the bucket capacity.
    pub fn bucket_max_size(&self) -> usize {
        self.bucket_max_size
    }

    #[inline]
    fn hash(&self, key: &K) -> u32 {
        self.hasher.hash_key(key)
    }

    /// Reads a snapshot of the directory. Caller must hold the table lock.
    fn directory_snapshot(&self) -> Result<HashDirectoryPage> {
        let guard = self.pool.fetch_page_read(self.directory_page_id)?;
        Ok(HashDirectoryPage::from_bytes(guard.data()))
    }

    fn bucket_from(&self, data: &[u8; PAGE_SIZE]) -> HashBucketPage<K, V> {
        HashBucketPage::from_bytes(data, self.bucket_max_size)
    }

    /// Collects every value stored under `key`.
    pub fn get_value(&self, _transaction: &Transaction, key: &K) -> Result<Vec<V>> {
        let table_guard = self.table_latch.read();

        let directory = self.directory_snapshot()?;
        let index = self.hash(key) & directory.global_depth_mask();
        let bucket_page_id = directory.bucket_page_id(index);
        let bucket_guard = self.pool.fetch_page_read(bucket_page_id)?;

        drop(table_guard);

        let bucket = self.bucket_from(bucket_guard.data());
        Ok(bucket.get_value(key))
    }

    /// Inserts a `(key, value)` pair.
    ///
    /// Returns false when the exact pair is already present. A full bucket
    /// falls through to the split path under the table write lock.
    pub fn insert(&self, transaction: &Transaction, key: &K, value: &V) -> Result<bool> {
        {
            let table_guard = self.table_latch.read();

            let directory = self.directory_snapshot()?;
            let index = self.hash(key) & directory.global_depth_mask();
            let bucket_page_id = directory.bucket_page_id(index);
            let mut bucket_guard = self.pool.fetch_page_write(bucket_page_id)?;

            drop(table_guard);

            let mut bucket = self.bucket_from(bucket_guard.data());
            if bucket.contains(key, value) {
                return Ok(false);
            }
            if bucket.insert(key, value) {
                bucket_guard.data_mut().copy_from_slice(bucket.as_bytes());
                return Ok(true);
            }
        }

        self.split_insert(transaction, key, value)
    }

    /// Slow-path insert: splits the target bucket (growing the directory as
    /// needed) until the pending key's bucket has room.
    fn split_insert(&self, _transaction: &Transaction, key: &K, value: &V) -> Result<bool> {
        let _table_guard = self.table_latch.write();

        let mut dir_guard = self.pool.fetch_page_write(self.directory_page_id)?;
        let mut directory = HashDirectoryPage::from_bytes(dir_guard.data());
        let hash = self.hash(key);

        loop {
            // The directory may have changed since the fast path failed;
            // the re-read snapshot is authoritative.
            let index = hash & directory.global_depth_mask();
            let bucket_page_id = directory.bucket_page_id(index);
            let mut bucket_guard = self.pool.fetch_page_write(bucket_page_id)?;
            let mut bucket = self.bucket_from(bucket_guard.data());

            if bucket.contains(key, value) {
                return Ok(false);
            }
            if bucket.insert(key, value) {
                bucket_guard.data_mut().copy_from_slice(bucket.as_bytes());
                return Ok(true);
            }

            // Split: allocate the image bucket and raise the local depth.
            let mut image_guard = self.pool.new_page_write()?;
            let image_page_id = image_guard.page_id();
            let mut image = HashBucketPage::<K, V>::new(self.bucket_max_size);

            let image_index = index ^ (1 << directory.local_depth(index));
            directory.incr_local_depth(index);
            let local_depth = directory.local_depth(index);
            let mask = (1u32 << local_depth) - 1;

            if local_depth > directory.global_depth() {
                // Double the directory, then point the image slot at the
                // new bucket. The depth bump panics at the capacity
                // ceiling before any slot is written.
                let old_size = directory.size();
                directory.incr_global_depth();
                for i in 0..old_size {
                    directory.set_bucket_page_id(i + old_size, directory.bucket_page_id(i));
                    directory.set_local_depth(i + old_size, directory.local_depth(i));
                }
                directory.set_bucket_page_id(image_index, image_page_id);
                debug!(
                    "hash directory doubled to depth {}",
                    directory.global_depth()
                );
            } else {
                // Retarget and redepth every slot congruent to the image
                // index, and redepth the original's co-pointers.
                let stride = 1u32 << local_depth;
                let size = directory.size();

                let mut i = index & mask;
                while i < size {
                    directory.set_local_depth(i, local_depth);
                    i += stride;
                }
                let mut i = image_index & mask;
                while i < size {
                    directory.set_local_depth(i, local_depth);
                    directory.set_bucket_page_id(i, image_page_id);
                    i += stride;
                }
            }

            // Redistribute the live pairs between the two buckets by their
            // new depth-relevant bits.
            let pairs = bucket.all_pairs();
            bucket.clear();
            for (k, v) in pairs {
                if self.hash(&k) & mask == index & mask {
                    bucket.insert(&k, &v);
                } else {
                    image.insert(&k, &v);
                }
            }
            debug!(
                "split bucket {} into {} at local depth {}",
                bucket_page_id, image_page_id, local_depth
            );

            // All directory updates are complete; only now write everything
            // back and re-read the target for the pending key.
            bucket_guard.data_mut().copy_from_slice(bucket.as_bytes());
            image_guard.data_mut().copy_from_slice(image.as_bytes());
            dir_guard.data_mut().copy_from_slice(directory.as_bytes());
        }
    }

    /// Removes the exact `(key, value)` pair.
    ///
    /// An emptied bucket whose image slot carries the same positive local
    /// depth is merged under the table write lock.
    pub fn remove(&self, transaction: &Transaction, key: &K, value: &V) -> Result<bool> {
        let should_merge;
        {
            let table_guard = self.table_latch.read();

            let directory = self.directory_snapshot()?;
            let index = self.hash(key) & directory.global_depth_mask();
            let bucket_page_id = directory.bucket_page_id(index);
            let mut bucket_guard = self.pool.fetch_page_write(bucket_page_id)?;

            drop(table_guard);

            let mut bucket = self.bucket_from(bucket_guard.data());
            if !bucket.remove(key, value) {
                return Ok(false);
            }
            bucket_guard.data_mut().copy_from_slice(bucket.as_bytes());

            let local_depth = directory.local_depth(index);
            should_merge = local_depth > 0 && bucket.is_empty() && {
                let image_index = index ^ (1 << (local_depth - 1));
                directory.local_depth(image_index) == local_depth
            };
        }

        if should_merge {
            self.merge(transaction, key)?;
        }
        Ok(true)
    }

    /// Merges the (re-validated) empty bucket for `key` into its image,
    /// shrinking the directory when possible. Cascades while the surviving
    /// bucket is itself empty at its new depth.
    fn merge(&self, _transaction: &Transaction, key: &K) -> Result<()> {
        let _table_guard = self.table_latch.write();

        let mut dir_guard = self.pool.fetch_page_write(self.directory_page_id)?;
        let mut directory = HashDirectoryPage::from_bytes(dir_guard.data());
        let hash = self.hash(key);
        let mut dirty = false;

        loop {
            let index = hash & directory.global_depth_mask();
            let local_depth = directory.local_depth(index);
            if local_depth == 0 {
                break;
            }
            let image_index = index ^ (1 << (local_depth - 1));
            if directory.local_depth(image_index) != local_depth {
                break;
            }

            let bucket_page_id = directory.bucket_page_id(index);
            let is_empty = {
                let guard = self.pool.fetch_page_read(bucket_page_id)?;
                self.bucket_from(guard.data()).is_empty()
            };
            if !is_empty {
                break;
            }

            // Point every slot of the empty bucket at the image and lower
            // both slot families to the merged depth.
            let image_page_id = directory.bucket_page_id(image_index);
            let stride = 1u32 << local_depth;
            let size = directory.size();
            let merged_depth = local_depth - 1;

            let mut i = index & (stride - 1);
            while i < size {
                directory.set_local_depth(i, merged_depth);
                directory.set_bucket_page_id(i, image_page_id);
                i += stride;
            }
            let mut i = image_index & (stride - 1);
            while i < size {
                directory.set_local_depth(i, merged_depth);
                i += stride;
            }

            directory.try_shrink();

            if !self.pool.delete_page(bucket_page_id)? {
                warn!("empty bucket {} still pinned during merge", bucket_page_id);
            }
            debug!(
                "merged bucket {} into {}, directory depth {}",
                bucket_page_id,
                image_page_id,
                directory.global_depth()
            );
            dirty = true;
        }

        if dirty {
            dir_guard.data_mut().copy_from_slice(directory.as_bytes());
        }
        Ok(())
    }

    /// Returns the directory's global depth.
    pub fn get_global_depth(&self) -> Result<u32> {
        let _table_guard = self.table_latch.read();
        Ok(self.directory_snapshot()?.global_depth())
    }

    /// Validates the directory invariants, panicking on violation.
    pub fn verify_integrity(&self) -> Result<()> {
        let _table_guard = self.table_latch.read();
        self.directory_snapshot()?.verify_integrity();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{DiskManager, DiskManagerConfig};
    use crate::keys::{DefaultKeyHasher, IdentityKeyHasher};
    use tempfile::TempDir;

    fn create_test_pool(num_instances: usize, pool_size: usize) -> (Arc<ParallelBufferPool>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(
            DiskManager::new(DiskManagerConfig {
                data_dir: dir.path().to_path_buf(),
                fsync_enabled: false,
            })
            .unwrap(),
        );
        (Arc::new(ParallelBufferPool::new(num_instances, pool_size, disk)), dir)
    }

    type TestTable = ExtendibleHashTable<i64, i64, IdentityKeyHasher>;

    fn small_table(bucket_capacity: usize) -> (TestTable, TempDir) {
        let (pool, dir) = create_test_pool(1, 32);
        let table =
            ExtendibleHashTable::with_bucket_capacity(pool, IdentityKeyHasher, bucket_capacity)
                .unwrap();
        (table, dir)
    }

    #[test]
    fn test_hash_table_insert_and_get() {
        let (table, _dir) = small_table(8);
        let txn = Transaction::new();

        assert!(table.insert(&txn, &1, &100).unwrap());
        assert!(table.insert(&txn, &2, &200).unwrap());

        assert_eq!(table.get_value(&txn, &1).unwrap(), vec![100]);
        assert_eq!(table.get_value(&txn, &2).unwrap(), vec![200]);
        assert!(table.get_value(&txn, &3).unwrap().is_empty());
        table.verify_integrity().unwrap();
    }

    #[test]
    fn test_hash_table_duplicate_pair_rejected() {
        let (table, _dir) = small_table(8);
        let txn = Transaction::new();

        assert!(table.insert(&txn, &1, &100).unwrap());
        assert!(!table.insert(&txn, &1, &100).unwrap());
        // Same key, different value is fine
        assert!(table.insert(&txn, &1, &101).unwrap());

        let mut values = table.get_value(&txn, &1).unwrap();
        values.sort();
        assert_eq!(values, vec![100, 101]);
    }

    #[test]
    fn test_hash_table_remove() {
        let (table, _dir) = small_table(8);
        let txn = Transaction::new();

        table.insert(&txn, &1, &100).unwrap();
        table.insert(&txn, &1, &101).unwrap();

        assert!(table.remove(&txn, &1, &100).unwrap());
        assert!(!table.remove(&txn, &1, &100).unwrap());
        assert_eq!(table.get_value(&txn, &1).unwrap(), vec![101]);
    }

    #[test]
    fn test_hash_table_split_grows_directory() {
        let (table, _dir) = small_table(4);
        let txn = Transaction::new();

        // Identity hash: keys 0..4 share the depth-0 bucket
        for k in 0..4i64 {
            assert!(table.insert(&txn, &k, &(k * 10)).unwrap());
        }
        assert_eq!(table.get_global_depth().unwrap(), 0);

        // Fifth insert splits evens from odds
        assert!(table.insert(&txn, &4, &40).unwrap());
        assert_eq!(table.get_global_depth().unwrap(), 1);
        table.verify_integrity().unwrap();

        for k in 0..5i64 {
            assert_eq!(table.get_value(&txn, &k).unwrap(), vec![k * 10]);
        }
    }

    #[test]
    fn test_hash_table_split_to_depth_two() {
        let (table, _dir) = small_table(4);
        let txn = Transaction::new();

        // 0..4 fill the initial bucket; 4 splits to depth 1 (evens full
        // again with 0,2,4,6); 8 splits the even bucket to depth 2.
        for k in [0i64, 1, 2, 3, 4, 5, 6, 8] {
            assert!(table.insert(&txn, &k, &(k * 10)).unwrap(), "insert {k}");
        }
        assert_eq!(table.get_global_depth().unwrap(), 2);
        table.verify_integrity().unwrap();

        for k in [0i64, 1, 2, 3, 4, 5, 6, 8] {
            assert_eq!(table.get_value(&txn, &k).unwrap(), vec![k * 10]);
        }
    }

    #[test]
    fn test_hash_table_repeated_collisions_split_until_distinct() {
        let (table, _dir) = small_table(4);
        let txn = Transaction::new();

        // All congruent mod 4: the split loop must run several rounds
        for k in [0i64, 4, 8, 12, 16] {
            assert!(table.insert(&txn, &k, &k).unwrap());
        }
        assert_eq!(table.get_global_depth().unwrap(), 3);
        table.verify_integrity().unwrap();

        for k in [0i64, 4, 8, 12, 16] {
            assert_eq!(table.get_value(&txn, &k).unwrap(), vec![k]);
        }
    }

    #[test]
    fn test_hash_table_merge_shrinks_directory() {
        let (table, _dir) = small_table(4);
        let txn = Transaction::new();

        let keys = [0i64, 1, 2, 3, 4, 5, 6, 8];
        for k in keys {
            table.insert(&txn, &k, &(k * 10)).unwrap();
        }
        assert_eq!(table.get_global_depth().unwrap(), 2);

        // Empty the odd bucket first (no merge possible: its image is at a
        // deeper depth), then the deep even buckets
        for k in [1i64, 3, 5, 0, 4, 8, 2, 6] {
            assert!(table.remove(&txn, &k, &(k * 10)).unwrap());
            table.verify_integrity().unwrap();
        }

        // Directory collapsed back to a single bucket
        assert_eq!(table.get_global_depth().unwrap(), 0);
        for k in keys {
            assert!(table.get_value(&txn, &k).unwrap().is_empty());
        }
    }

    #[test]
    fn test_hash_table_remove_missing() {
        let (table, _dir) = small_table(4);
        let txn = Transaction::new();

        assert!(!table.remove(&txn, &9, &9).unwrap());
        table.insert(&txn, &9, &90).unwrap();
        assert!(!table.remove(&txn, &9, &91).unwrap());
        assert!(table.remove(&txn, &9, &90).unwrap());
    }

    #[test]
    fn test_hash_table_default_hasher_workload() {
        let (pool, _dir) = create_test_pool(2, 64);
        let table: ExtendibleHashTable<i64, i64, DefaultKeyHasher> =
            ExtendibleHashTable::with_bucket_capacity(pool, DefaultKeyHasher, 8).unwrap();
        let txn = Transaction::new();

        for k in 0..200i64 {
            assert!(table.insert(&txn, &k, &(k + 1000)).unwrap());
        }
        table.verify_integrity().unwrap();

        for k in 0..200i64 {
            assert_eq!(table.get_value(&txn, &k).unwrap(), vec![k + 1000], "key {k}");
        }

        for k in (0..200i64).step_by(2) {
            assert!(table.remove(&txn, &k, &(k + 1000)).unwrap());
        }
        table.verify_integrity().unwrap();

        for k in 0..200i64 {
            let values = table.get_value(&txn, &k).unwrap();
            if k % 2 == 0 {
                assert!(values.is_empty());
            } else {
                assert_eq!(values, vec![k + 1000]);
            }
        }
    }

    #[test]
    fn test_hash_table_concurrent_inserts() {
        use std::thread;

        let (pool, _dir) = create_test_pool(2, 128);
        let table: Arc<ExtendibleHashTable<i64, i64, DefaultKeyHasher>> = Arc::new(
            ExtendibleHashTable::with_bucket_capacity(pool, DefaultKeyHasher, 8).unwrap(),
        );

        let mut handles = vec![];
        for t in 0..4i64 {
            let table = table.clone();
            handles.push(thread::spawn(move || {
                let txn = Transaction::new();
                for i in 0..50i64 {
                    let key = t * 1000 + i;
                    assert!(table.insert(&txn, &key, &key).unwrap());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        table.verify_integrity().unwrap();
        let txn = Transaction::new();
        for t in 0..4i64 {
            for i in 0..50i64 {
                let key = t * 1000 + i;
                assert_eq!(table.get_value(&txn, &key).unwrap(), vec![key]);
            }
        }
    }
}
