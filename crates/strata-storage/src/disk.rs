//! Disk manager for page-level file I/O.

use log::warn;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use strata_buffer::DiskDriver;
use strata_common::page::{PageId, PAGE_SIZE};
use strata_common::Result;

/// Configuration for the disk manager.
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Base directory for the data file.
    pub data_dir: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync_enabled: true,
        }
    }
}

/// Manages reading and writing fixed-size pages to a single data file.
///
/// Deallocated page ids are recorded but never reused: a page id must keep
/// routing to the same buffer pool instance for its whole lifetime.
pub struct DiskManager {
    /// Configuration.
    config: DiskManagerConfig,
    /// The data file.
    file: Mutex<File>,
    /// Next page id for standalone allocation.
    next_page_id: AtomicU32,
    /// Ids released via `deallocate_page`.
    freed_pages: Mutex<HashSet<PageId>>,
}

impl DiskManager {
    /// Creates a new disk manager, opening (or creating) the data file.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let path = config.data_dir.join("strata.dat");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as u32;

        Ok(Self {
            config,
            file: Mutex::new(file),
            next_page_id: AtomicU32::new(num_pages),
            freed_pages: Mutex::new(HashSet::new()),
        })
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Returns the number of pages the file has been extended to.
    pub fn num_pages(&self) -> u32 {
        self.next_page_id.load(Ordering::Acquire)
    }

    /// Returns the number of deallocated page ids.
    pub fn freed_count(&self) -> usize {
        self.freed_pages.lock().len()
    }

    /// Reads a page from disk.
    ///
    /// A page that was allocated but never written back reads as zeroes.
    pub fn read_page_into(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        let mut file = self.file.lock();
        let offset = (page_id.0 as u64) * (PAGE_SIZE as u64);
        file.seek(SeekFrom::Start(offset))?;

        let mut read = 0;
        while read < PAGE_SIZE {
            let n = file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        if read < PAGE_SIZE {
            // Short read: the page lies past the last flushed byte
            buf[read..].fill(0);
        }
        Ok(())
    }

    /// Writes a page to disk.
    pub fn write_page_at(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut file = self.file.lock();
        let offset = (page_id.0 as u64) * (PAGE_SIZE as u64);
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;

        if self.config.fsync_enabled {
            file.sync_all()?;
        }

        // Track file growth
        let mut next = self.next_page_id.load(Ordering::Acquire);
        while page_id.0 >= next {
            match self.next_page_id.compare_exchange(
                next,
                page_id.0 + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => next = current,
            }
        }

        Ok(())
    }

    /// Allocates a fresh page id, extending the file with a zero page.
    ///
    /// This standalone path serves single-instance use; the parallel buffer
    /// pool instances allocate from their own modular sequences instead.
    pub fn allocate_page(&self) -> Result<PageId> {
        let page_id = PageId(self.next_page_id.fetch_add(1, Ordering::SeqCst));
        let zeroes = [0u8; PAGE_SIZE];

        let mut file = self.file.lock();
        let offset = (page_id.0 as u64) * (PAGE_SIZE as u64);
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&zeroes)?;

        if self.config.fsync_enabled {
            file.sync_all()?;
        }

        Ok(page_id)
    }

    /// Releases a page id.
    ///
    /// Freed ids are recorded for accounting only and never handed out
    /// again, so page-to-instance routing stays stable.
    pub fn release_page(&self, page_id: PageId) {
        if !self.freed_pages.lock().insert(page_id) {
            warn!("{} deallocated twice", page_id);
        }
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

impl DiskDriver for DiskManager {
    fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        self.read_page_into(page_id, buf)
    }

    fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        self.write_page_at(page_id, data)
    }

    fn deallocate_page(&self, page_id: PageId) {
        self.release_page(page_id);
    }
}
