use std::sync::Arc;

use crate::buffer::{BufferPoolManager, ReadPageGuard};
use crate::common::{RecordId, Result, INVALID_PAGE_ID};

use super::leaf_page::LeafPageRef;

/// Forward iterator over the leaf chain in ascending key order.
///
/// Holds at most one leaf read-latched at a time. Crossing to the next leaf
/// latches it before the current one is released, so a scan observes each
/// leaf in a consistent state.
pub struct TreeIterator {
    bpm: Arc<BufferPoolManager>,
    leaf: Option<ReadPageGuard>,
    index: usize,
}

impl TreeIterator {
    pub(crate) fn new(bpm: Arc<BufferPoolManager>, leaf: Option<ReadPageGuard>, index: usize) -> Self {
        Self { bpm, leaf, index }
    }

    /// True once the iterator has moved past the last entry.
    pub fn is_end(&self) -> bool {
        match &self.leaf {
            None => true,
            Some(guard) => {
                let leaf = LeafPageRef::new(guard.data());
                self.index >= leaf.size() as usize && leaf.next_page_id() == INVALID_PAGE_ID
            }
        }
    }

    /// Advances to the next entry, following the sibling chain across leaf
    /// boundaries.
    pub fn next_entry(&mut self) -> Result<Option<(u32, RecordId)>> {
        loop {
            let Some(guard) = &self.leaf else {
                return Ok(None);
            };
            let leaf = LeafPageRef::new(guard.data());

            if self.index < leaf.size() as usize {
                let item = (leaf.key_at(self.index), leaf.rid_at(self.index));
                self.index += 1;
                return Ok(Some(item));
            }

            let next = leaf.next_page_id();
            if next == INVALID_PAGE_ID {
                self.leaf = None;
                return Ok(None);
            }
            // Latch the next leaf before releasing the current one.
            let next_guard = self.bpm.fetch_page_read(next)?;
            self.leaf = Some(next_guard);
            self.index = 0;
        }
    }
}

impl Iterator for TreeIterator {
    type Item = Result<(u32, RecordId)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
