use crate::common::{PageId, PAGE_SIZE};

use super::tree_page::{read_u32, write_u32};

const RECORD_COUNT_OFFSET: usize = 0;
const RECORDS_OFFSET: usize = 4;
const NAME_SIZE: usize = 32;
const RECORD_SIZE: usize = NAME_SIZE + 4;

/// Longest index name a header record can store.
pub const MAX_INDEX_NAME_LEN: usize = NAME_SIZE - 1;

/// Records the header page can hold.
pub const MAX_HEADER_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

fn record_offset(index: usize) -> usize {
    RECORDS_OFFSET + index * RECORD_SIZE
}

/// The distinguished catalog page (page 0): a count followed by fixed-width
/// `(index name, root page id)` records. Index names are at most 31 bytes
/// and stored nul-padded. Every tree persists its root id here whenever the
/// root changes, so a reopened database can find its indexes again.
pub struct HeaderPage<'a> {
    data: &'a mut [u8],
}

impl<'a> HeaderPage<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        debug_assert!(data.len() >= PAGE_SIZE);
        Self { data }
    }

    pub fn init(&mut self) {
        self.data.fill(0);
    }

    pub fn record_count(&self) -> usize {
        read_u32(self.data, RECORD_COUNT_OFFSET) as usize
    }

    fn name_at(&self, index: usize) -> &[u8] {
        let offset = record_offset(index);
        let raw = &self.data[offset..offset + NAME_SIZE];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
        &raw[..end]
    }

    fn find_index(&self, name: &str) -> Option<usize> {
        (0..self.record_count()).find(|&i| self.name_at(i) == name.as_bytes())
    }

    /// Root page id recorded under `name`, if any.
    pub fn find_record(&self, name: &str) -> Option<PageId> {
        self.find_index(name)
            .map(|i| PageId::new(read_u32(self.data, record_offset(i) + NAME_SIZE)))
    }

    /// Registers a new record. False when the name already exists, is too
    /// long, or the page is full.
    pub fn insert_record(&mut self, name: &str, root: PageId) -> bool {
        if name.len() >= NAME_SIZE || self.find_index(name).is_some() {
            return false;
        }
        let count = self.record_count();
        if count >= MAX_HEADER_RECORDS {
            return false;
        }

        let offset = record_offset(count);
        self.data[offset..offset + NAME_SIZE].fill(0);
        self.data[offset..offset + name.len()].copy_from_slice(name.as_bytes());
        write_u32(self.data, offset + NAME_SIZE, root.as_u32());
        write_u32(self.data, RECORD_COUNT_OFFSET, count as u32 + 1);
        true
    }

    /// Rewrites the root page id of an existing record. False when the name
    /// is not registered.
    pub fn update_record(&mut self, name: &str, root: PageId) -> bool {
        let Some(index) = self.find_index(name) else {
            return false;
        };
        write_u32(self.data, record_offset(index) + NAME_SIZE, root.as_u32());
        true
    }
}
