use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::debug;

use crate::buffer::{BufferPoolManager, ReadPageGuard, WritePageGuard};
use crate::common::{
    MicaError, PageId, RecordId, Result, HEADER_PAGE_ID, INVALID_PAGE_ID,
};

use super::header_page::{HeaderPage, MAX_INDEX_NAME_LEN};
use super::internal_page::{InternalPage, InternalPageRef, INTERNAL_ENTRY_SIZE};
use super::iterator::TreeIterator;
use super::leaf_page::{LeafPage, LeafPageRef};
use super::tree_page::{self, TreePageType, INTERNAL_PAGE_HEADER_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TreeOp {
    Insert,
    Delete,
}

#[derive(Clone, Copy)]
enum SearchTarget {
    Leftmost,
    Key(u32),
}

/// Latches accumulated on a write descent: the root-id lock plus every
/// ancestor whose child might push a modification back up. Both are
/// released wholesale as soon as a safe child bounds the operation.
struct WriteContext<'a> {
    root_lock: Option<RwLockWriteGuard<'a, PageId>>,
    path: Vec<WritePageGuard>,
}

impl WriteContext<'_> {
    fn release_all(&mut self) {
        self.root_lock = None;
        self.path.clear();
    }
}

/// A disk-resident B+Tree index over u32 keys and record ids.
///
/// Nodes live in buffer pool pages and are materialized on demand through
/// page guards. Concurrent operations latch-couple down the tree: readers
/// hold at most a parent/child pair of read latches, writers hold write
/// latches from the deepest unsafe ancestor down to the target leaf. For a
/// single key, operations linearize when the leaf latch is released.
pub struct BPlusTree {
    index_name: String,
    root_page_id: RwLock<PageId>,
    bpm: Arc<BufferPoolManager>,
    leaf_max_size: u32,
    internal_max_size: u32,
}

impl BPlusTree {
    /// Creates or reopens the index named `name`, with node capacities
    /// derived from the page size.
    pub fn new(name: &str, bpm: Arc<BufferPoolManager>) -> Result<Self> {
        Self::with_max_sizes(
            name,
            bpm,
            super::leaf_page::LEAF_CAPACITY as u32,
            super::internal_page::INTERNAL_CAPACITY as u32,
        )
    }

    /// Creates or reopens the index with explicit node capacities. Small
    /// capacities force early splits, which the tests rely on.
    pub fn with_max_sizes(
        name: &str,
        bpm: Arc<BufferPoolManager>,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> Result<Self> {
        assert!(leaf_max_size >= 2, "leaf nodes must hold at least 2 entries");
        assert!(
            internal_max_size >= 3,
            "internal nodes must hold at least 3 children"
        );

        let root = {
            let mut header_guard = if bpm.num_allocated_pages() == 0 {
                let mut guard = bpm.new_page()?;
                debug_assert_eq!(guard.page_id(), HEADER_PAGE_ID);
                HeaderPage::new(guard.data_mut()).init();
                guard
            } else {
                bpm.fetch_page_write(HEADER_PAGE_ID)?
            };

            let mut header = HeaderPage::new(header_guard.data_mut());
            match header.find_record(name) {
                Some(root) => root,
                None => {
                    if !header.insert_record(name, INVALID_PAGE_ID) {
                        return Err(if name.len() > MAX_INDEX_NAME_LEN {
                            MicaError::IndexNameTooLong(name.to_string())
                        } else {
                            MicaError::HeaderPageFull
                        });
                    }
                    INVALID_PAGE_ID
                }
            }
        };

        Ok(Self {
            index_name: name.to_string(),
            root_page_id: RwLock::new(root),
            bpm,
            leaf_max_size,
            internal_max_size,
        })
    }

    pub fn is_empty(&self) -> bool {
        *self.root_page_id.read() == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.read()
    }

    /// Point lookup. Descends with read-latch coupling: the child latch is
    /// taken before the parent latch is dropped.
    pub fn get_value(&self, key: u32) -> Result<Option<RecordId>> {
        let Some(guard) = self.find_leaf_read(SearchTarget::Key(key))? else {
            return Ok(None);
        };
        Ok(LeafPageRef::new(guard.data()).lookup(key))
    }

    /// Inserts a unique key. Returns false (and changes nothing) when the
    /// key is already present.
    pub fn insert(&self, key: u32, rid: RecordId) -> Result<bool> {
        let mut root_lock = self.root_page_id.write();
        if *root_lock == INVALID_PAGE_ID {
            self.start_new_tree(&mut root_lock, key, rid)?;
            return Ok(true);
        }

        let mut ctx = WriteContext {
            root_lock: Some(root_lock),
            path: Vec::new(),
        };
        let mut leaf_guard = self.find_leaf_write(key, TreeOp::Insert, &mut ctx)?;

        if LeafPageRef::new(leaf_guard.data()).lookup(key).is_some() {
            return Ok(false);
        }

        let new_size = {
            let mut leaf = LeafPage::new(leaf_guard.data_mut());
            leaf.insert(key, rid)
        };
        if new_size < self.leaf_max_size {
            return Ok(true);
        }

        self.split_leaf(&mut ctx, leaf_guard)?;
        Ok(true)
    }

    /// Removes `key` if present, rebalancing or collapsing nodes that fall
    /// below half occupancy. Missing keys are a no-op.
    pub fn remove(&self, key: u32) -> Result<()> {
        let root_lock = self.root_page_id.write();
        if *root_lock == INVALID_PAGE_ID {
            return Ok(());
        }

        let mut ctx = WriteContext {
            root_lock: Some(root_lock),
            path: Vec::new(),
        };
        let mut leaf_guard = self.find_leaf_write(key, TreeOp::Delete, &mut ctx)?;

        if LeafPageRef::new(leaf_guard.data()).lookup(key).is_none() {
            return Ok(());
        }

        {
            let mut leaf = LeafPage::new(leaf_guard.data_mut());
            leaf.remove_and_delete_record(key);
        }
        self.rebalance_leaf(&mut ctx, leaf_guard)
    }

    /// Iterator over the whole tree in ascending key order.
    pub fn iter(&self) -> Result<TreeIterator> {
        let leaf = self.find_leaf_read(SearchTarget::Leftmost)?;
        Ok(TreeIterator::new(Arc::clone(&self.bpm), leaf, 0))
    }

    /// Iterator starting at `key` (or the next larger key).
    pub fn iter_from(&self, key: u32) -> Result<TreeIterator> {
        let leaf = self.find_leaf_read(SearchTarget::Key(key))?;
        let index = leaf
            .as_ref()
            .map(|guard| LeafPageRef::new(guard.data()).key_index(key))
            .unwrap_or(0);
        Ok(TreeIterator::new(Arc::clone(&self.bpm), leaf, index))
    }

    // ------------------------------------------------------------------
    // descent
    // ------------------------------------------------------------------

    fn find_leaf_read(&self, target: SearchTarget) -> Result<Option<ReadPageGuard>> {
        let root_lock = self.root_page_id.read();
        let root = *root_lock;
        if root == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut guard = self.bpm.fetch_page_read(root)?;
        drop(root_lock);

        loop {
            match tree_page::page_type(guard.data()) {
                TreePageType::Leaf => return Ok(Some(guard)),
                TreePageType::Internal => {
                    let node = InternalPageRef::new(guard.data());
                    let child = match target {
                        SearchTarget::Leftmost => node.value_at(0),
                        SearchTarget::Key(key) => node.lookup(key),
                    };
                    // Latch the child before releasing the parent.
                    guard = self.bpm.fetch_page_read(child)?;
                }
                TreePageType::Invalid => {
                    return Err(MicaError::IndexCorrupted(format!(
                        "untyped page {} on search path",
                        guard.page_id()
                    )))
                }
            }
        }
    }

    /// Write descent with latch crabbing. On return the leaf is latched and
    /// `ctx` holds the root-id lock and every ancestor that the pending
    /// modification might touch; safe children released everything above.
    fn find_leaf_write(
        &self,
        key: u32,
        op: TreeOp,
        ctx: &mut WriteContext,
    ) -> Result<WritePageGuard> {
        let root = **ctx.root_lock.as_ref().expect("root lock held on descent");
        let mut guard = self.bpm.fetch_page_write(root)?;
        if self.is_safe(guard.data(), op) {
            ctx.release_all();
        }

        loop {
            match tree_page::page_type(guard.data()) {
                TreePageType::Leaf => return Ok(guard),
                TreePageType::Internal => {
                    let child = InternalPageRef::new(guard.data()).lookup(key);
                    let child_guard = self.bpm.fetch_page_write(child)?;
                    ctx.path.push(guard);
                    guard = child_guard;
                    if self.is_safe(guard.data(), op) {
                        ctx.release_all();
                    }
                }
                TreePageType::Invalid => {
                    return Err(MicaError::IndexCorrupted(format!(
                        "untyped page {} on write path",
                        guard.page_id()
                    )))
                }
            }
        }
    }

    /// A node is safe when the pending operation cannot propagate past it:
    /// an insert below it cannot split it, a delete cannot underflow it.
    fn is_safe(&self, data: &[u8], op: TreeOp) -> bool {
        let is_root = tree_page::is_root(data);
        match (op, tree_page::page_type(data)) {
            (TreeOp::Insert, TreePageType::Leaf) => {
                LeafPageRef::new(data).size() < self.leaf_max_size - 1
            }
            (TreeOp::Insert, TreePageType::Internal) => {
                InternalPageRef::new(data).size() < self.internal_max_size
            }
            (TreeOp::Delete, TreePageType::Leaf) => {
                let size = LeafPageRef::new(data).size();
                if is_root {
                    size > 1
                } else {
                    size > self.leaf_max_size / 2
                }
            }
            (TreeOp::Delete, TreePageType::Internal) => {
                let size = InternalPageRef::new(data).size();
                if is_root {
                    size > 2
                } else {
                    size > (self.internal_max_size + 1) / 2
                }
            }
            (_, TreePageType::Invalid) => false,
        }
    }

    // ------------------------------------------------------------------
    // insertion
    // ------------------------------------------------------------------

    fn start_new_tree(
        &self,
        root_lock: &mut RwLockWriteGuard<'_, PageId>,
        key: u32,
        rid: RecordId,
    ) -> Result<()> {
        let mut guard = self.bpm.new_page()?;
        let page_id = guard.page_id();
        {
            let mut leaf = LeafPage::new(guard.data_mut());
            leaf.init(page_id, INVALID_PAGE_ID, self.leaf_max_size);
            leaf.insert(key, rid);
        }
        drop(guard);

        **root_lock = page_id;
        self.persist_root(page_id)?;
        debug!(root = page_id.as_u32(), index = %self.index_name, "started new tree");
        Ok(())
    }

    /// Splits a leaf that reached max size: the upper half moves to a new
    /// right sibling, the sibling chain is stitched, and the sibling's
    /// first key rises into the parent.
    fn split_leaf(&self, ctx: &mut WriteContext, mut leaf_guard: WritePageGuard) -> Result<()> {
        let mut sibling_guard = self.bpm.new_page()?;
        let old_pid = leaf_guard.page_id();
        let new_pid = sibling_guard.page_id();

        let rising_key = {
            let mut leaf = LeafPage::new(leaf_guard.data_mut());
            let mut sibling = LeafPage::new(sibling_guard.data_mut());
            sibling.init(new_pid, leaf.parent_page_id(), self.leaf_max_size);
            leaf.move_half_to(&mut sibling);
            sibling.set_next_page_id(leaf.next_page_id());
            leaf.set_next_page_id(new_pid);
            sibling.key_at(0)
        };

        // The leaf level is done; ancestors stay latched in ctx, so nothing
        // can reach these pages while the split propagates.
        drop(leaf_guard);
        drop(sibling_guard);
        self.insert_into_parent(ctx, old_pid, rising_key, new_pid)
    }

    /// Inserts `(key, new_pid)` after `old_pid` at the next level up,
    /// splitting ancestors as long as they overflow.
    fn insert_into_parent(
        &self,
        ctx: &mut WriteContext,
        old_pid: PageId,
        key: u32,
        new_pid: PageId,
    ) -> Result<()> {
        if ctx.path.is_empty() {
            // The split node was the root: grow the tree by one level.
            let mut root_guard = self.bpm.new_page()?;
            let root_pid = root_guard.page_id();
            {
                let mut root = InternalPage::new(root_guard.data_mut());
                root.init(root_pid, INVALID_PAGE_ID, self.internal_max_size);
                root.populate_new_root(old_pid, key, new_pid);
            }
            drop(root_guard);

            for child in [old_pid, new_pid] {
                let mut guard = self.bpm.fetch_page_write(child)?;
                tree_page::set_parent_page_id(guard.data_mut(), root_pid);
            }

            self.update_root(ctx, root_pid)?;
            debug!(root = root_pid.as_u32(), index = %self.index_name, "tree grew a level");
            return Ok(());
        }

        let mut parent_guard = ctx.path.pop().expect("ancestor present");
        let parent_pid = parent_guard.page_id();

        if InternalPageRef::new(parent_guard.data()).size() < self.internal_max_size {
            let mut parent = InternalPage::new(parent_guard.data_mut());
            parent.insert_node_after(old_pid, key, new_pid);
            return Ok(());
        }

        // Parent overflow: insert into a scratch copy one entry larger,
        // then divide it between the parent and a fresh sibling.
        let parent_size = InternalPageRef::new(parent_guard.data()).size() as usize;
        let used = INTERNAL_PAGE_HEADER_SIZE + parent_size * INTERNAL_ENTRY_SIZE;
        let mut scratch =
            vec![0u8; INTERNAL_PAGE_HEADER_SIZE + (self.internal_max_size as usize + 1) * INTERNAL_ENTRY_SIZE];
        scratch[..used].copy_from_slice(&parent_guard.data()[..used]);

        let mut scratch_page = InternalPage::new(&mut scratch);
        let total = scratch_page.insert_node_after(old_pid, key, new_pid) as usize;
        let split_at = (self.internal_max_size as usize + 2) / 2;

        {
            let mut parent = InternalPage::new(parent_guard.data_mut());
            for i in 0..split_at {
                let (k, v) = scratch_page.entry_at(i);
                parent.set_entry_at(i, k, v);
            }
            parent.set_size(split_at as u32);
        }

        let mut sibling_guard = self.bpm.new_page()?;
        let sibling_pid = sibling_guard.page_id();
        let parent_parent = InternalPageRef::new(parent_guard.data()).parent_page_id();

        let mut moved_children = Vec::with_capacity(total - split_at);
        let rising_key = {
            let mut sibling = InternalPage::new(sibling_guard.data_mut());
            sibling.init(sibling_pid, parent_parent, self.internal_max_size);
            for (slot, i) in (split_at..total).enumerate() {
                let (k, v) = scratch_page.entry_at(i);
                sibling.set_entry_at(slot, k, v);
                moved_children.push(v);
            }
            sibling.set_size((total - split_at) as u32);
            sibling.key_at(0)
        };

        drop(parent_guard);
        drop(sibling_guard);

        // Children that changed owner: everything we still latch is above
        // the old parent, so these fetches cannot self-deadlock.
        for child in moved_children {
            let mut guard = self.bpm.fetch_page_write(child)?;
            tree_page::set_parent_page_id(guard.data_mut(), sibling_pid);
        }

        self.insert_into_parent(ctx, parent_pid, rising_key, sibling_pid)
    }

    // ------------------------------------------------------------------
    // deletion
    // ------------------------------------------------------------------

    fn rebalance_leaf(&self, ctx: &mut WriteContext, mut leaf_guard: WritePageGuard) -> Result<()> {
        let node_pid = leaf_guard.page_id();
        let size = LeafPageRef::new(leaf_guard.data()).size();

        if ctx.path.is_empty() {
            // No latched ancestors: either the leaf is the root, or its
            // parent was safe and this delete cannot have underflowed it.
            if tree_page::is_root(leaf_guard.data()) && size == 0 {
                drop(leaf_guard);
                self.update_root(ctx, INVALID_PAGE_ID)?;
                self.bpm.delete_page(node_pid);
                debug!(index = %self.index_name, "tree emptied");
            }
            return Ok(());
        }

        if size >= self.leaf_max_size / 2 {
            return Ok(());
        }

        let mut parent_guard = ctx.path.pop().expect("ancestor present");
        let (sibling_pid, sibling_on_left, separator_index) = {
            let parent = InternalPageRef::new(parent_guard.data());
            let index = parent
                .index_of_child(node_pid)
                .expect("underflowing leaf linked from parent");
            if index > 0 {
                (parent.value_at(index - 1), true, index)
            } else {
                (parent.value_at(1), false, 1)
            }
        };
        let mut sibling_guard = self.bpm.fetch_page_write(sibling_pid)?;
        let sibling_size = LeafPageRef::new(sibling_guard.data()).size();

        if size + sibling_size > self.leaf_max_size {
            // Redistribute: borrow one entry across the boundary and fix the
            // separator to the new boundary key.
            let mut parent = InternalPage::new(parent_guard.data_mut());
            let mut node = LeafPage::new(leaf_guard.data_mut());
            let mut sibling = LeafPage::new(sibling_guard.data_mut());
            if sibling_on_left {
                sibling.move_last_to_front_of(&mut node);
                parent.set_key_at(separator_index, node.key_at(0));
            } else {
                sibling.move_first_to_end_of(&mut node);
                parent.set_key_at(separator_index, sibling.key_at(0));
            }
            return Ok(());
        }

        // Coalesce into whichever page is on the left, then drop the
        // emptied page and the parent's slot for it.
        let removed_pid = {
            let mut node = LeafPage::new(leaf_guard.data_mut());
            let mut sibling = LeafPage::new(sibling_guard.data_mut());
            if sibling_on_left {
                node.move_all_to(&mut sibling);
                node_pid
            } else {
                sibling.move_all_to(&mut node);
                sibling_pid
            }
        };
        {
            let mut parent = InternalPage::new(parent_guard.data_mut());
            parent.remove_at(separator_index);
        }
        drop(leaf_guard);
        drop(sibling_guard);
        self.bpm.delete_page(removed_pid);

        self.rebalance_internal(ctx, parent_guard)
    }

    fn rebalance_internal(
        &self,
        ctx: &mut WriteContext,
        mut node_guard: WritePageGuard,
    ) -> Result<()> {
        let node_pid = node_guard.page_id();
        let size = InternalPageRef::new(node_guard.data()).size();

        if ctx.path.is_empty() {
            // Root internal node: collapse when a single child remains.
            if tree_page::is_root(node_guard.data()) && size == 1 {
                let child_pid = InternalPageRef::new(node_guard.data()).value_at(0);
                drop(node_guard);
                {
                    let mut child_guard = self.bpm.fetch_page_write(child_pid)?;
                    tree_page::set_parent_page_id(child_guard.data_mut(), INVALID_PAGE_ID);
                }
                self.update_root(ctx, child_pid)?;
                self.bpm.delete_page(node_pid);
                debug!(root = child_pid.as_u32(), index = %self.index_name, "root collapsed");
            }
            return Ok(());
        }

        if size >= (self.internal_max_size + 1) / 2 {
            return Ok(());
        }

        let mut parent_guard = ctx.path.pop().expect("ancestor present");
        let (sibling_pid, sibling_on_left, separator_index) = {
            let parent = InternalPageRef::new(parent_guard.data());
            let index = parent
                .index_of_child(node_pid)
                .expect("underflowing node linked from parent");
            if index > 0 {
                (parent.value_at(index - 1), true, index)
            } else {
                (parent.value_at(1), false, 1)
            }
        };
        let mut sibling_guard = self.bpm.fetch_page_write(sibling_pid)?;
        let sibling_size = InternalPageRef::new(sibling_guard.data()).size();

        if size + sibling_size > self.internal_max_size {
            // Borrow one child across the boundary, rotating the separator
            // key through the parent.
            let moved_child = {
                let mut parent = InternalPage::new(parent_guard.data_mut());
                let middle_key = parent.key_at(separator_index);
                let mut node = InternalPage::new(node_guard.data_mut());
                let mut sibling = InternalPage::new(sibling_guard.data_mut());
                if sibling_on_left {
                    let moved = sibling.move_last_to_front_of(&mut node, middle_key);
                    parent.set_key_at(separator_index, node.key_at(0));
                    moved
                } else {
                    let moved = sibling.move_first_to_end_of(&mut node, middle_key);
                    parent.set_key_at(separator_index, sibling.key_at(0));
                    moved
                }
            };
            let mut child_guard = self.bpm.fetch_page_write(moved_child)?;
            tree_page::set_parent_page_id(child_guard.data_mut(), node_pid);
            return Ok(());
        }

        // Coalesce: pull the separator down between the two nodes, append
        // everything into the left page, and re-parent the moved children.
        let (removed_pid, surviving_pid, moved_children) = {
            let mut parent = InternalPage::new(parent_guard.data_mut());
            let middle_key = parent.key_at(separator_index);
            let mut node = InternalPage::new(node_guard.data_mut());
            let mut sibling = InternalPage::new(sibling_guard.data_mut());
            if sibling_on_left {
                let moved: Vec<PageId> =
                    (0..node.size() as usize).map(|i| node.value_at(i)).collect();
                node.move_all_to(&mut sibling, middle_key);
                parent.remove_at(separator_index);
                (node_pid, sibling_pid, moved)
            } else {
                let moved: Vec<PageId> = (0..sibling.size() as usize)
                    .map(|i| sibling.value_at(i))
                    .collect();
                sibling.move_all_to(&mut node, middle_key);
                parent.remove_at(separator_index);
                (sibling_pid, node_pid, moved)
            }
        };
        drop(node_guard);
        drop(sibling_guard);

        for child in moved_children {
            let mut guard = self.bpm.fetch_page_write(child)?;
            tree_page::set_parent_page_id(guard.data_mut(), surviving_pid);
        }
        self.bpm.delete_page(removed_pid);

        self.rebalance_internal(ctx, parent_guard)
    }

    // ------------------------------------------------------------------
    // root bookkeeping
    // ------------------------------------------------------------------

    /// Swaps in a new root id under the held root lock and records it in
    /// the header page.
    fn update_root(&self, ctx: &mut WriteContext, new_root: PageId) -> Result<()> {
        let lock = ctx
            .root_lock
            .as_mut()
            .expect("root change requires the root-id lock");
        **lock = new_root;
        self.persist_root(new_root)
    }

    fn persist_root(&self, root: PageId) -> Result<()> {
        let mut guard = self.bpm.fetch_page_write(HEADER_PAGE_ID)?;
        let mut header = HeaderPage::new(guard.data_mut());
        if !header.update_record(&self.index_name, root) {
            return Err(MicaError::IndexCorrupted(format!(
                "header record for index '{}' disappeared",
                self.index_name
            )));
        }
        Ok(())
    }
}
