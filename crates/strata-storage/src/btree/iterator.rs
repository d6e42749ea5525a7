//! Forward cursor over the leaf chain.

use crate::btree::page::BTreeLeafPage;
use crate::keys::{IndexKey, IndexValue};
use log::warn;
use strata_buffer::{ParallelBufferPool, ReadPageGuard};
use strata_common::page::PageId;

/// Forward iterator over a B+ tree's leaf chain.
///
/// Holds the current leaf pinned and read-latched; advancing past the end
/// of a leaf releases it before latching the right sibling, so at most one
/// leaf latch is ever held.
pub struct LeafIterator<'a, K, V>
where
    K: IndexKey,
    V: IndexValue,
{
    pool: &'a ParallelBufferPool,
    guard: Option<ReadPageGuard<'a>>,
    leaf: BTreeLeafPage<K, V>,
    index: usize,
}

impl<'a, K, V> LeafIterator<'a, K, V>
where
    K: IndexKey,
    V: IndexValue,
{
    pub(crate) fn new(pool: &'a ParallelBufferPool, guard: ReadPageGuard<'a>, index: usize) -> Self {
        let leaf = BTreeLeafPage::from_bytes(guard.data());
        Self {
            pool,
            guard: Some(guard),
            leaf,
            index,
        }
    }

    /// An exhausted iterator, used for empty trees.
    pub(crate) fn end(pool: &'a ParallelBufferPool) -> Self {
        Self {
            pool,
            guard: None,
            leaf: BTreeLeafPage::new(PageId::INVALID, PageId::INVALID, 2),
            index: 0,
        }
    }

    /// True when no entries remain.
    pub fn is_end(&self) -> bool {
        match self.guard {
            None => true,
            Some(_) => self.index >= self.leaf.size() && !self.leaf.next_page_id().is_valid(),
        }
    }
}

impl<K, V> Iterator for LeafIterator<'_, K, V>
where
    K: IndexKey,
    V: IndexValue,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            self.guard.as_ref()?;

            if self.index < self.leaf.size() {
                let item = (self.leaf.key_at(self.index), self.leaf.value_at(self.index));
                self.index += 1;
                return Some(item);
            }

            let next_page_id = self.leaf.next_page_id();
            // Release the exhausted leaf before moving right.
            self.guard = None;
            if !next_page_id.is_valid() {
                return None;
            }

            match self.pool.fetch_page_read(next_page_id) {
                Ok(guard) => {
                    self.leaf = BTreeLeafPage::from_bytes(guard.data());
                    self.guard = Some(guard);
                    self.index = 0;
                }
                Err(e) => {
                    warn!("leaf scan stopped early: {}", e);
                    return None;
                }
            }
        }
    }
}
