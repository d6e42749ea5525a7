//! Sharded buffer pool front-end.

use crate::frame::Frame;
use crate::pool::{BufferPoolInstance, DiskDriver};
use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;
use strata_common::config::StorageConfig;
use strata_common::page::{PageId, PAGE_SIZE};
use strata_common::{Result, StrataError};

/// Parallel buffer pool: `N` independent instances keyed by `page_id % N`.
///
/// All page operations route to the owning instance. `new_page` consults
/// the instances round-robin, starting from a rotating cursor, and returns
/// the first successful allocation.
pub struct ParallelBufferPool {
    instances: Vec<BufferPoolInstance>,
    /// Round-robin cursor for new-page allocation.
    next_instance: Mutex<usize>,
}

impl ParallelBufferPool {
    /// Creates a parallel buffer pool with `num_instances` instances of
    /// `pool_size` frames each.
    pub fn new(num_instances: usize, pool_size: usize, disk: Arc<dyn DiskDriver>) -> Self {
        assert!(num_instances > 0, "need at least one buffer pool instance");

        let instances = (0..num_instances)
            .map(|i| BufferPoolInstance::new(pool_size, num_instances, i, disk.clone()))
            .collect();

        Self {
            instances,
            next_instance: Mutex::new(0),
        }
    }

    /// Creates a parallel buffer pool from a storage configuration.
    pub fn from_config(config: &StorageConfig, disk: Arc<dyn DiskDriver>) -> Self {
        Self::new(config.num_instances, config.pool_size, disk)
    }

    /// Returns the total number of frames across all instances.
    pub fn pool_size(&self) -> usize {
        self.instances.iter().map(|i| i.pool_size()).sum()
    }

    /// Returns the number of instances.
    pub fn num_instances(&self) -> usize {
        self.instances.len()
    }

    /// Returns the number of resident pages across all instances.
    pub fn resident_pages(&self) -> usize {
        self.instances.iter().map(|i| i.page_count()).sum()
    }

    /// Returns the number of evictable (unpinned resident) pages across
    /// all instances.
    pub fn evictable_pages(&self) -> usize {
        self.instances.iter().map(|i| i.replacer_size()).sum()
    }

    /// Returns the instance responsible for a page id.
    #[inline]
    fn instance_for(&self, page_id: PageId) -> &BufferPoolInstance {
        &self.instances[page_id.0 as usize % self.instances.len()]
    }

    /// Fetches and pins a page from the owning instance.
    pub fn fetch_page(&self, page_id: PageId) -> Result<&Frame> {
        self.instance_for(page_id).fetch_page(page_id)
    }

    /// Allocates a new pinned page, trying instances round-robin.
    pub fn new_page(&self) -> Result<(PageId, &Frame)> {
        let start = {
            let mut cursor = self.next_instance.lock();
            let start = *cursor;
            *cursor = (*cursor + 1) % self.instances.len();
            start
        };

        for offset in 0..self.instances.len() {
            let instance = &self.instances[(start + offset) % self.instances.len()];
            match instance.new_page() {
                Ok(allocated) => return Ok(allocated),
                Err(StrataError::BufferPoolFull) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StrataError::BufferPoolFull)
    }

    /// Unpins a page in the owning instance.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        self.instance_for(page_id).unpin_page(page_id, is_dirty)
    }

    /// Flushes a page in the owning instance.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        self.instance_for(page_id).flush_page(page_id)
    }

    /// Deletes a page in the owning instance.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        self.instance_for(page_id).delete_page(page_id)
    }

    /// Flushes all pages in all instances.
    pub fn flush_all_pages(&self) -> Result<()> {
        for instance in &self.instances {
            instance.flush_all_pages()?;
        }
        Ok(())
    }

    /// Fetches a page and acquires its latch in shared mode.
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<ReadPageGuard<'_>> {
        let frame = self.fetch_page(page_id)?;
        let data = frame.read_data();
        Ok(ReadPageGuard {
            pool: self,
            page_id,
            data: Some(data),
        })
    }

    /// Fetches a page and acquires its latch in exclusive mode.
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<WritePageGuard<'_>> {
        let frame = self.fetch_page(page_id)?;
        let data = frame.write_data();
        Ok(WritePageGuard {
            pool: self,
            page_id,
            is_dirty: false,
            data: Some(data),
        })
    }

    /// Allocates a new page and acquires its latch in exclusive mode.
    pub fn new_page_write(&self) -> Result<WritePageGuard<'_>> {
        let (page_id, frame) = self.new_page()?;
        let data = frame.write_data();
        Ok(WritePageGuard {
            pool: self,
            page_id,
            is_dirty: false,
            data: Some(data),
        })
    }
}

/// RAII guard holding a page pinned and read-latched.
///
/// Dropping the guard releases the latch and unpins the page.
pub struct ReadPageGuard<'a> {
    pool: &'a ParallelBufferPool,
    page_id: PageId,
    data: Option<RwLockReadGuard<'a, Box<[u8; PAGE_SIZE]>>>,
}

impl ReadPageGuard<'_> {
    /// Returns the guarded page id.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the page contents.
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        self.data.as_ref().expect("latch held until drop")
    }
}

impl Drop for ReadPageGuard<'_> {
    fn drop(&mut self) {
        // Release the latch before unpinning.
        self.data.take();
        self.pool.unpin_page(self.page_id, false);
    }
}

/// RAII guard holding a page pinned and write-latched.
///
/// Writing through `data_mut` marks the page dirty; dropping the guard
/// releases the latch and unpins with the accumulated dirty flag.
pub struct WritePageGuard<'a> {
    pool: &'a ParallelBufferPool,
    page_id: PageId,
    is_dirty: bool,
    data: Option<RwLockWriteGuard<'a, Box<[u8; PAGE_SIZE]>>>,
}

impl WritePageGuard<'_> {
    /// Returns the guarded page id.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the page contents.
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        self.data.as_ref().expect("latch held until drop")
    }

    /// Returns the page contents for mutation, marking the page dirty.
    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        self.is_dirty = true;
        self.data.as_mut().expect("latch held until drop")
    }
}

impl Drop for WritePageGuard<'_> {
    fn drop(&mut self) {
        // Release the latch before unpinning.
        self.data.take();
        self.pool.unpin_page(self.page_id, self.is_dirty);
    }
}
