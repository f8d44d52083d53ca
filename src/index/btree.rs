use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::debug;

use crate::buffer::{BufferPoolManager, ReadPageGuard, WritePageGuard};
use crate::common::{
    BurrowError, PageId, Result, HEADER_PAGE_ID, INVALID_PAGE_ID, PAGE_SIZE,
};
use crate::storage::page::HeaderPageMut;

use super::btree_iterator::TreeIterator;
use super::btree_page::{
    BTreePageMut, BTreePageRef, InternalNodeMut, InternalNodeRef, LeafNodeMut, LeafNodeRef,
    Storable, INTERNAL_HEADER_SIZE, LEAF_HEADER_SIZE,
};
use super::key_comparator::KeyComparator;

/// Access mode of a descent, deciding latch kinds and safety checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessMode {
    Insert,
    Delete,
}

/// Latches and bookkeeping carried through one write operation.
///
/// `root_guard` is the write-held root-id latch (released as soon as some
/// descendant is safe), `page_set` the FIFO of still-latched ancestors in
/// descent order, `side_set` the write guards of merge survivors kept alive
/// so upper levels can rewrite their headers, and `deleted_pages` the pages
/// to hand back to the buffer pool when the operation finishes.
struct Context<'a> {
    root_guard: Option<RwLockWriteGuard<'a, PageId>>,
    page_set: VecDeque<WritePageGuard>,
    side_set: Vec<WritePageGuard>,
    deleted_pages: Vec<PageId>,
    promoted_root: Option<PageId>,
}

impl<'a> Context<'a> {
    fn new(root_guard: RwLockWriteGuard<'a, PageId>) -> Self {
        Self {
            root_guard: Some(root_guard),
            page_set: VecDeque::new(),
            side_set: Vec::new(),
            deleted_pages: Vec::new(),
            promoted_root: None,
        }
    }

    /// Releases every retained ancestor latch, root latch first.
    fn release_ancestors(&mut self) {
        self.root_guard = None;
        while let Some(guard) = self.page_set.pop_front() {
            drop(guard);
        }
    }
}

fn set_parent(guard: &mut WritePageGuard, parent: PageId) {
    BTreePageMut::new(guard.data_mut()).set_parent_page_id(parent);
}

fn corrupted(msg: &str) -> BurrowError {
    BurrowError::IndexCorrupted(msg.to_string())
}

/// A concurrent B+tree index over the buffer pool.
///
/// Keys are unique and fixed-width; values are fixed-width. Concurrency is
/// latch crabbing: reads couple read latches down the tree, writes first try
/// an optimistic descent that only write-latches the leaf and fall back to a
/// pessimistic descent (root latch + write coupling) when the leaf may split
/// or underflow.
///
/// The root page id is persisted under this tree's name in the header page,
/// so an index can be reopened from an existing file.
pub struct BPlusTree<K, V, C> {
    index_name: String,
    /// Root page id, guarded by the root latch
    root_page_id: RwLock<PageId>,
    bpm: Arc<BufferPoolManager>,
    comparator: C,
    leaf_max_size: usize,
    internal_max_size: usize,
    _marker: PhantomData<(K, V)>,
}

impl<K, V, C> BPlusTree<K, V, C>
where
    K: Storable,
    V: Storable,
    C: KeyComparator<K>,
{
    /// Opens the index named `index_name`, registering it in the header
    /// page on first creation. `leaf_max_size` and `internal_max_size`
    /// must be at least 3 and small enough for a node to fit in one page.
    pub fn new(
        index_name: impl Into<String>,
        bpm: Arc<BufferPoolManager>,
        comparator: C,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        assert!(
            leaf_max_size >= 3 && internal_max_size >= 3,
            "node capacity must be at least 3"
        );
        assert!(
            LEAF_HEADER_SIZE + leaf_max_size * (K::SIZE + V::SIZE) <= PAGE_SIZE,
            "leaf nodes do not fit in a page"
        );
        assert!(
            INTERNAL_HEADER_SIZE + (internal_max_size + 1) * (K::SIZE + PageId::SIZE) <= PAGE_SIZE,
            "internal nodes do not fit in a page"
        );

        let index_name = index_name.into();
        let root_page_id = {
            let mut guard = bpm.fetch_page_write(HEADER_PAGE_ID)?;
            let mut header = HeaderPageMut::new(guard.data_mut());
            match header.get_record(&index_name) {
                Some(pid) => pid,
                None => {
                    if !header.insert_record(&index_name, INVALID_PAGE_ID) {
                        return Err(BurrowError::HeaderFull);
                    }
                    INVALID_PAGE_ID
                }
            }
        };

        Ok(Self {
            index_name,
            root_page_id: RwLock::new(root_page_id),
            bpm,
            comparator,
            leaf_max_size,
            internal_max_size,
            _marker: PhantomData,
        })
    }

    pub fn is_empty(&self) -> bool {
        *self.root_page_id.read() == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.read()
    }

    /// Point lookup. Descends with read-latch coupling.
    pub fn get_value(&self, key: &K) -> Result<Option<V>> {
        let root_latch = self.root_page_id.read();
        if *root_latch == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut guard = self.bpm.fetch_page_read(*root_latch)?;
        drop(root_latch);

        loop {
            if BTreePageRef::new(guard.data()).is_leaf() {
                let leaf = LeafNodeRef::<K, V>::new(guard.data());
                return Ok(leaf.lookup(key, &self.comparator));
            }
            let child = InternalNodeRef::<K>::new(guard.data()).lookup(key, &self.comparator);
            // Latch the child before releasing the parent
            let child_guard = self.bpm.fetch_page_read(child)?;
            guard = child_guard;
        }
    }

    /// Inserts a unique key. Returns false when the key already exists.
    pub fn insert(&self, key: K, value: V) -> Result<bool> {
        // Empty-tree fast path, double-checked under the root latch
        {
            let root_latch = self.root_page_id.read();
            if *root_latch == INVALID_PAGE_ID {
                drop(root_latch);
                let mut root_latch = self.root_page_id.write();
                if *root_latch == INVALID_PAGE_ID {
                    return self.start_new_tree(&mut root_latch, &key, &value);
                }
                // Lost the race; the tree is no longer empty
            }
        }

        match self.find_leaf_optimistic(&key, AccessMode::Insert)? {
            Some(mut leaf_guard) => {
                // Safe leaf: the insert cannot split
                let exists = LeafNodeRef::<K, V>::new(leaf_guard.data())
                    .lookup(&key, &self.comparator)
                    .is_some();
                if exists {
                    return Ok(false);
                }
                let mut leaf = LeafNodeMut::<K, V>::new(leaf_guard.data_mut());
                leaf.insert(&key, &value, &self.comparator);
                Ok(true)
            }
            None => self.insert_pessimistic(key, value),
        }
    }

    /// Removes a key. Absent keys are ignored.
    pub fn remove(&self, key: &K) -> Result<()> {
        {
            let root_latch = self.root_page_id.read();
            if *root_latch == INVALID_PAGE_ID {
                return Ok(());
            }
        }

        if let Some(mut leaf_guard) = self.find_leaf_optimistic(key, AccessMode::Delete)? {
            // Safe leaf: the removal cannot underflow
            let present = LeafNodeRef::<K, V>::new(leaf_guard.data())
                .lookup(key, &self.comparator)
                .is_some();
            if present {
                let mut leaf = LeafNodeMut::<K, V>::new(leaf_guard.data_mut());
                leaf.remove(key, &self.comparator);
            }
            return Ok(());
        }

        let root_latch = self.root_page_id.write();
        if *root_latch == INVALID_PAGE_ID {
            return Ok(());
        }

        let mut ctx = Context::new(root_latch);
        let leaf_guard = self.find_leaf_pessimistic(key, AccessMode::Delete, &mut ctx)?;
        self.delete_entry(&mut ctx, leaf_guard, key)?;

        // A root shrink promotes the surviving child, whose latch is still
        // held in the side set; clear its parent pointer before releasing.
        if let Some(promoted) = ctx.promoted_root.take() {
            match ctx.side_set.iter_mut().find(|g| g.page_id() == promoted) {
                Some(guard) => set_parent(guard, INVALID_PAGE_ID),
                None => return Err(corrupted("promoted root is not latched")),
            }
        }

        ctx.side_set.clear();
        ctx.release_ancestors();
        let deleted_pages = std::mem::take(&mut ctx.deleted_pages);
        drop(ctx);

        for page_id in deleted_pages {
            self.bpm.delete_page(page_id)?;
        }
        Ok(())
    }

    /// Iterator over the whole tree, starting at the leftmost leaf.
    pub fn begin(&self) -> Result<TreeIterator<K, V>> {
        let root_latch = self.root_page_id.read();
        if *root_latch == INVALID_PAGE_ID {
            return Ok(TreeIterator::end(Arc::clone(&self.bpm)));
        }
        let mut guard = self.bpm.fetch_page_read(*root_latch)?;
        drop(root_latch);

        loop {
            if BTreePageRef::new(guard.data()).is_leaf() {
                return Ok(TreeIterator::new(Arc::clone(&self.bpm), guard, 0));
            }
            let child = InternalNodeRef::<K>::new(guard.data()).child_at(0);
            let child_guard = self.bpm.fetch_page_read(child)?;
            guard = child_guard;
        }
    }

    /// Iterator positioned at `key`. Fails with `KeyNotFound` if absent.
    pub fn begin_at(&self, key: &K) -> Result<TreeIterator<K, V>> {
        let root_latch = self.root_page_id.read();
        if *root_latch == INVALID_PAGE_ID {
            return Err(BurrowError::KeyNotFound);
        }
        let mut guard = self.bpm.fetch_page_read(*root_latch)?;
        drop(root_latch);

        loop {
            if BTreePageRef::new(guard.data()).is_leaf() {
                let index = {
                    let leaf = LeafNodeRef::<K, V>::new(guard.data());
                    let idx = leaf.search_index(key, &self.comparator);
                    if idx >= leaf.size()
                        || !self.comparator.compare(&leaf.key_at(idx), key).is_eq()
                    {
                        return Err(BurrowError::KeyNotFound);
                    }
                    idx
                };
                return Ok(TreeIterator::new(Arc::clone(&self.bpm), guard, index));
            }
            let child = InternalNodeRef::<K>::new(guard.data()).lookup(key, &self.comparator);
            let child_guard = self.bpm.fetch_page_read(child)?;
            guard = child_guard;
        }
    }

    /// A node is safe when the planned operation cannot propagate above it.
    fn is_safe(page: &BTreePageRef<'_>, mode: AccessMode) -> bool {
        match mode {
            AccessMode::Insert => {
                if page.is_leaf() {
                    page.size() < page.max_size() - 1
                } else {
                    page.size() < page.max_size()
                }
            }
            AccessMode::Delete => {
                if page.is_root() {
                    if page.is_leaf() {
                        page.size() > 1
                    } else {
                        page.size() > 2
                    }
                } else {
                    page.size() > page.min_size()
                }
            }
        }
    }

    /// Optimistic descent: read-latch coupling down to the leaf's parent,
    /// then a write latch on the leaf taken while the parent (or root)
    /// latch is still held. Returns None when the leaf is unsafe under
    /// `mode` (or the tree is empty) and the caller must descend
    /// pessimistically.
    fn find_leaf_optimistic(
        &self,
        key: &K,
        mode: AccessMode,
    ) -> Result<Option<WritePageGuard>> {
        let root_latch = self.root_page_id.read();
        let mut page_id = *root_latch;
        if page_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut root_latch = Some(root_latch);
        let mut parent: Option<ReadPageGuard> = None;

        loop {
            let guard = self.bpm.fetch_page_read(page_id)?;
            if BTreePageRef::new(guard.data()).is_leaf() {
                // Upgrade to a write latch. The parent's read latch (or the
                // root latch) is still held, so no split or merge can move
                // this leaf out from under us in between.
                drop(guard);
                let write_guard = self.bpm.fetch_page_write(page_id)?;
                parent.take();
                root_latch.take();

                let safe = {
                    let page = BTreePageRef::new(write_guard.data());
                    page.is_leaf() && Self::is_safe(&page, mode)
                };
                if safe {
                    return Ok(Some(write_guard));
                }
                // Unsafe: release everything and retry pessimistically
                return Ok(None);
            }

            let child = InternalNodeRef::<K>::new(guard.data()).lookup(key, &self.comparator);
            // Keep the current node latched until the child is; drop the
            // grandparent and the root latch now.
            parent = Some(guard);
            root_latch = None;
            page_id = child;
        }
    }

    /// Pessimistic descent: the caller holds the root latch in write mode
    /// inside `ctx`; every node on the path is write-latched, and all
    /// retained ancestors are released as soon as the current node is safe.
    /// Ancestors stay in `ctx.page_set`; the leaf guard is returned.
    fn find_leaf_pessimistic(
        &self,
        key: &K,
        mode: AccessMode,
        ctx: &mut Context<'_>,
    ) -> Result<WritePageGuard> {
        let mut page_id = match ctx.root_guard.as_deref() {
            Some(pid) => *pid,
            None => return Err(corrupted("pessimistic descent without the root latch")),
        };

        loop {
            let guard = self.bpm.fetch_page_write(page_id)?;
            let (safe, next) = {
                let page = BTreePageRef::new(guard.data());
                let safe = Self::is_safe(&page, mode);
                let next = if page.is_leaf() {
                    None
                } else {
                    Some(InternalNodeRef::<K>::new(guard.data()).lookup(key, &self.comparator))
                };
                (safe, next)
            };

            if safe {
                ctx.release_ancestors();
            }

            match next {
                Some(child) => {
                    ctx.page_set.push_back(guard);
                    page_id = child;
                }
                None => return Ok(guard),
            }
        }
    }

    /// Creates the first leaf. The caller holds the root latch in write
    /// mode and has verified the tree is empty.
    fn start_new_tree(
        &self,
        root_latch: &mut RwLockWriteGuard<'_, PageId>,
        key: &K,
        value: &V,
    ) -> Result<bool> {
        let mut guard = self.bpm.new_page()?;
        let page_id = guard.page_id();
        {
            let mut leaf = LeafNodeMut::<K, V>::new(guard.data_mut());
            leaf.init(page_id, INVALID_PAGE_ID, self.leaf_max_size);
            leaf.insert(key, value, &self.comparator);
        }
        drop(guard);

        **root_latch = page_id;
        self.update_root_record(page_id)?;
        debug!("started new tree with root {}", page_id);
        Ok(true)
    }

    fn insert_pessimistic(&self, key: K, value: V) -> Result<bool> {
        let root_latch = self.root_page_id.write();
        if *root_latch == INVALID_PAGE_ID {
            // The tree emptied out between the two passes
            let mut root_latch = root_latch;
            return self.start_new_tree(&mut root_latch, &key, &value);
        }

        let mut ctx = Context::new(root_latch);
        let mut leaf_guard = self.find_leaf_pessimistic(&key, AccessMode::Insert, &mut ctx)?;
        let leaf_pid = leaf_guard.page_id();

        {
            let leaf = LeafNodeRef::<K, V>::new(leaf_guard.data());
            if leaf.lookup(&key, &self.comparator).is_some() {
                return Ok(false);
            }
            if leaf.size() + 1 < self.leaf_max_size {
                let mut leaf = LeafNodeMut::<K, V>::new(leaf_guard.data_mut());
                leaf.insert(&key, &value, &self.comparator);
                return Ok(true);
            }
        }

        // The insert fills the leaf to capacity: split. The right sibling
        // is allocated up front so an exhausted pool cannot leave a
        // half-split node behind.
        let mut right_guard = self.bpm.new_page()?;
        let right_pid = right_guard.page_id();
        let sep_key = {
            let mut leaf = LeafNodeMut::<K, V>::new(leaf_guard.data_mut());
            leaf.insert(&key, &value, &self.comparator);
            let mut right = LeafNodeMut::<K, V>::new(right_guard.data_mut());
            right.init(right_pid, leaf.parent_page_id(), self.leaf_max_size);
            right.set_next_page_id(leaf.next_page_id());
            leaf.set_next_page_id(right_pid);
            leaf.split_off_to(self.leaf_max_size / 2, &mut right);
            right.key_at(0)
        };
        debug!("split leaf {} -> new right {}", leaf_pid, right_pid);

        self.insert_in_parent(&mut ctx, leaf_guard, sep_key, right_guard)?;
        Ok(true)
    }

    /// Links a freshly split-off `right` node into the parent of `left`,
    /// splitting upward as long as the parent overflows. Consumes both
    /// guards; ancestor guards come out of `ctx.page_set`.
    fn insert_in_parent(
        &self,
        ctx: &mut Context<'_>,
        mut left: WritePageGuard,
        sep_key: K,
        mut right: WritePageGuard,
    ) -> Result<()> {
        let left_pid = left.page_id();
        let right_pid = right.page_id();
        let parent_pid = BTreePageRef::new(left.data()).parent_page_id();

        if parent_pid == INVALID_PAGE_ID {
            // `left` was the root: grow the tree by one level
            let mut root_guard = self.bpm.new_page()?;
            let new_root_pid = root_guard.page_id();
            {
                let mut root = InternalNodeMut::<K>::new(root_guard.data_mut());
                root.init(new_root_pid, INVALID_PAGE_ID, self.internal_max_size);
                root.set_child_at(0, left_pid);
                root.set_key_at(1, &sep_key);
                root.set_child_at(1, right_pid);
                root.set_size(2);
            }
            set_parent(&mut left, new_root_pid);
            set_parent(&mut right, new_root_pid);

            match ctx.root_guard.as_deref_mut() {
                Some(slot) => *slot = new_root_pid,
                None => return Err(corrupted("root split without the root latch")),
            }
            self.update_root_record(new_root_pid)?;
            debug!("tree grew one level: new root {}", new_root_pid);
            return Ok(());
        }

        let mut parent_guard = ctx
            .page_set
            .pop_back()
            .ok_or_else(|| corrupted("parent latch missing from the page set"))?;
        debug_assert_eq!(parent_guard.page_id(), parent_pid);

        {
            let mut parent = InternalNodeMut::<K>::new(parent_guard.data_mut());
            parent.insert(&sep_key, right_pid, &self.comparator);
        }
        set_parent(&mut right, parent_pid);
        drop(left);
        drop(right);

        if BTreePageRef::new(parent_guard.data()).size() <= self.internal_max_size {
            return Ok(());
        }

        // The parent overflowed: split it and recurse
        let mut new_guard = self.bpm.new_page()?;
        let new_pid = new_guard.page_id();
        let move_count = self.internal_max_size / 2 + 1;
        let new_sep = {
            let parent_parent = BTreePageRef::new(parent_guard.data()).parent_page_id();
            let mut parent = InternalNodeMut::<K>::new(parent_guard.data_mut());
            let mut new_node = InternalNodeMut::<K>::new(new_guard.data_mut());
            new_node.init(new_pid, parent_parent, self.internal_max_size);
            let from = parent.size() - move_count;
            parent.split_off_to(from, &mut new_node);
            new_node.key_at(0)
        };
        self.repoint_children(ctx, &mut new_guard, 0, move_count)?;
        debug!("split internal {} -> new right {}", parent_pid, new_pid);

        self.insert_in_parent(ctx, parent_guard, new_sep, new_guard)
    }

    /// Removes `key` from the node owned by `node_guard`, rebalancing with
    /// a sibling (merge or redistribute) on underflow and recursing into
    /// the parent when a merge removes a separator.
    fn delete_entry(
        &self,
        ctx: &mut Context<'_>,
        mut node_guard: WritePageGuard,
        key: &K,
    ) -> Result<()> {
        let node_pid = node_guard.page_id();
        let (is_leaf, is_root) = {
            let page = BTreePageRef::new(node_guard.data());
            (page.is_leaf(), page.is_root())
        };

        let removed = if is_leaf {
            LeafNodeMut::<K, V>::new(node_guard.data_mut()).remove(key, &self.comparator)
        } else {
            InternalNodeMut::<K>::new(node_guard.data_mut()).remove(key, &self.comparator)
        };
        if !removed {
            return Ok(());
        }

        let (size, min_size, max_size) = {
            let page = BTreePageRef::new(node_guard.data());
            (page.size(), page.min_size(), page.max_size())
        };

        if is_root {
            if is_leaf && size == 0 {
                // The last entry is gone: the tree is empty again
                ctx.deleted_pages.push(node_pid);
                match ctx.root_guard.as_deref_mut() {
                    Some(slot) => *slot = INVALID_PAGE_ID,
                    None => return Err(corrupted("root delete without the root latch")),
                }
                drop(node_guard);
                self.update_root_record(INVALID_PAGE_ID)?;
                debug!("tree emptied, root {} deleted", node_pid);
                return Ok(());
            }
            if !is_leaf && size == 1 {
                // Only one child remains: it becomes the new root
                let child = InternalNodeRef::<K>::new(node_guard.data()).child_at(0);
                ctx.deleted_pages.push(node_pid);
                match ctx.root_guard.as_deref_mut() {
                    Some(slot) => *slot = child,
                    None => return Err(corrupted("root shrink without the root latch")),
                }
                ctx.promoted_root = Some(child);
                drop(node_guard);
                self.update_root_record(child)?;
                debug!("tree shrank one level: new root {}", child);
                return Ok(());
            }
            return Ok(());
        }

        if size >= min_size {
            return Ok(());
        }

        // Underflow: rebalance with a sibling under the shared parent
        let mut parent_guard = ctx
            .page_set
            .pop_back()
            .ok_or_else(|| corrupted("parent latch missing from the page set"))?;

        let (child_idx, parent_size) = {
            let parent = InternalNodeRef::<K>::new(parent_guard.data());
            let idx = parent
                .find_child_index(node_pid)
                .ok_or_else(|| corrupted("node missing from its parent"))?;
            (idx, parent.size())
        };

        let left_pid = (child_idx > 0).then(|| {
            InternalNodeRef::<K>::new(parent_guard.data()).child_at(child_idx - 1)
        });
        let right_pid = (child_idx + 1 < parent_size).then(|| {
            InternalNodeRef::<K>::new(parent_guard.data()).child_at(child_idx + 1)
        });
        if left_pid.is_none() && right_pid.is_none() {
            return Err(corrupted("underflowing node has no siblings"));
        }

        // Siblings are latched left-to-right; the unused one is dropped as
        // soon as the decision is made.
        let left_guard = match left_pid {
            Some(pid) => Some(self.bpm.fetch_page_write(pid)?),
            None => None,
        };
        let right_guard = match right_pid {
            Some(pid) => Some(self.bpm.fetch_page_write(pid)?),
            None => None,
        };

        let left_size = left_guard
            .as_ref()
            .map(|g| BTreePageRef::new(g.data()).size());
        let right_size = right_guard
            .as_ref()
            .map(|g| BTreePageRef::new(g.data()).size());

        let fits = |sibling: usize| {
            if is_leaf {
                sibling + size < max_size
            } else {
                sibling + size <= max_size
            }
        };

        if left_size.is_some_and(fits) {
            drop(right_guard);
            let left = left_guard.ok_or_else(|| corrupted("left sibling latch lost"))?;
            self.merge(ctx, parent_guard, left, node_guard, child_idx)
        } else if right_size.is_some_and(fits) {
            drop(left_guard);
            let right = right_guard.ok_or_else(|| corrupted("right sibling latch lost"))?;
            self.merge(ctx, parent_guard, node_guard, right, child_idx + 1)
        } else if left_size.is_some_and(|s| s > min_size) {
            drop(right_guard);
            let left = left_guard.ok_or_else(|| corrupted("left sibling latch lost"))?;
            self.redistribute_from_left(ctx, &mut parent_guard, left, node_guard, child_idx)
        } else if right_size.is_some_and(|s| s > min_size) {
            drop(left_guard);
            let right = right_guard.ok_or_else(|| corrupted("right sibling latch lost"))?;
            self.redistribute_from_right(ctx, &mut parent_guard, node_guard, right, child_idx)
        } else {
            Err(corrupted("no sibling can merge or lend"))
        }
    }

    /// Merges the right node of the pair into the left and removes the
    /// separator at `sep_idx` from the parent. The survivor's latch is
    /// parked in the side set so upper levels can still rewrite its header.
    fn merge(
        &self,
        ctx: &mut Context<'_>,
        parent_guard: WritePageGuard,
        mut left_guard: WritePageGuard,
        mut right_guard: WritePageGuard,
        sep_idx: usize,
    ) -> Result<()> {
        let sep_key = InternalNodeRef::<K>::new(parent_guard.data()).key_at(sep_idx);
        let right_pid = right_guard.page_id();
        let is_leaf = BTreePageRef::new(left_guard.data()).is_leaf();

        if is_leaf {
            let next = LeafNodeRef::<K, V>::new(right_guard.data()).next_page_id();
            let mut right = LeafNodeMut::<K, V>::new(right_guard.data_mut());
            let mut left = LeafNodeMut::<K, V>::new(left_guard.data_mut());
            right.move_all_to(&mut left);
            left.set_next_page_id(next);
        } else {
            let moved_from = {
                let mut right = InternalNodeMut::<K>::new(right_guard.data_mut());
                let mut left = InternalNodeMut::<K>::new(left_guard.data_mut());
                let from = left.size();
                right.merge_into(&sep_key, &mut left);
                from
            };
            let moved_to = BTreePageRef::new(left_guard.data()).size();
            self.repoint_children(ctx, &mut left_guard, moved_from, moved_to)?;
        }

        debug!("merged {} into {}", right_pid, left_guard.page_id());

        ctx.deleted_pages.push(right_pid);
        drop(right_guard);
        ctx.side_set.push(left_guard);

        self.delete_entry(ctx, parent_guard, &sep_key)
    }

    /// Borrows the last entry of the left sibling; the separator at
    /// `sep_idx` (the chain node's slot) is updated in the parent.
    fn redistribute_from_left(
        &self,
        ctx: &mut Context<'_>,
        parent_guard: &mut WritePageGuard,
        mut left_guard: WritePageGuard,
        mut node_guard: WritePageGuard,
        sep_idx: usize,
    ) -> Result<()> {
        let is_leaf = BTreePageRef::new(node_guard.data()).is_leaf();
        let sep_key = InternalNodeRef::<K>::new(parent_guard.data()).key_at(sep_idx);

        if is_leaf {
            let (borrowed_key, borrowed_value) = {
                let mut left = LeafNodeMut::<K, V>::new(left_guard.data_mut());
                let last = left.size() - 1;
                let entry = (left.key_at(last), left.value_at(last));
                left.set_size(last);
                entry
            };
            let mut node = LeafNodeMut::<K, V>::new(node_guard.data_mut());
            node.shift_right_one();
            node.set_entry(0, &borrowed_key, &borrowed_value);

            let mut parent = InternalNodeMut::<K>::new(parent_guard.data_mut());
            parent.set_key_at(sep_idx, &borrowed_key);
        } else {
            let (borrowed_key, borrowed_child) = {
                let mut left = InternalNodeMut::<K>::new(left_guard.data_mut());
                let last = left.size() - 1;
                let slot = (left.key_at(last), left.child_at(last));
                left.set_size(last);
                slot
            };
            {
                let mut node = InternalNodeMut::<K>::new(node_guard.data_mut());
                node.shift_right_one();
                node.set_key_at(1, &sep_key);
                node.set_child_at(0, borrowed_child);
            }
            self.repoint_children(ctx, &mut node_guard, 0, 1)?;

            let mut parent = InternalNodeMut::<K>::new(parent_guard.data_mut());
            parent.set_key_at(sep_idx, &borrowed_key);
        }

        debug!(
            "redistributed from {} into {}",
            left_guard.page_id(),
            node_guard.page_id()
        );
        Ok(())
    }

    /// Borrows the first entry of the right sibling; the separator at
    /// `sep_idx + 1` (the right sibling's slot) is updated in the parent.
    fn redistribute_from_right(
        &self,
        ctx: &mut Context<'_>,
        parent_guard: &mut WritePageGuard,
        mut node_guard: WritePageGuard,
        mut right_guard: WritePageGuard,
        sep_idx: usize,
    ) -> Result<()> {
        let is_leaf = BTreePageRef::new(node_guard.data()).is_leaf();
        let sep_key = InternalNodeRef::<K>::new(parent_guard.data()).key_at(sep_idx + 1);

        if is_leaf {
            let (borrowed_key, borrowed_value, new_first) = {
                let mut right = LeafNodeMut::<K, V>::new(right_guard.data_mut());
                let entry = (right.key_at(0), right.value_at(0));
                right.shift_left_one();
                (entry.0, entry.1, right.key_at(0))
            };
            {
                let mut node = LeafNodeMut::<K, V>::new(node_guard.data_mut());
                let size = node.size();
                node.set_entry(size, &borrowed_key, &borrowed_value);
                node.set_size(size + 1);
            }
            let mut parent = InternalNodeMut::<K>::new(parent_guard.data_mut());
            parent.set_key_at(sep_idx + 1, &new_first);
        } else {
            let (borrowed_child, lifted_key) = {
                let mut right = InternalNodeMut::<K>::new(right_guard.data_mut());
                let slot = (right.child_at(0), right.key_at(1));
                right.shift_left_one();
                slot
            };
            let node_new_last = {
                let mut node = InternalNodeMut::<K>::new(node_guard.data_mut());
                let size = node.size();
                node.set_key_at(size, &sep_key);
                node.set_child_at(size, borrowed_child);
                node.set_size(size + 1);
                size
            };
            self.repoint_children(ctx, &mut node_guard, node_new_last, node_new_last + 1)?;

            let mut parent = InternalNodeMut::<K>::new(parent_guard.data_mut());
            parent.set_key_at(sep_idx + 1, &lifted_key);
        }

        debug!(
            "redistributed from {} into {}",
            right_guard.page_id(),
            node_guard.page_id()
        );
        Ok(())
    }

    /// Points the children in slots `[from, to)` of `parent_guard` at it.
    /// A child whose latch is already held by this operation (a merge
    /// survivor parked in the side set) is rewritten through that guard;
    /// anything else is latched fresh, which cannot block since every
    /// structural path to these children runs through latches we hold.
    fn repoint_children(
        &self,
        ctx: &mut Context<'_>,
        parent_guard: &mut WritePageGuard,
        from: usize,
        to: usize,
    ) -> Result<()> {
        let parent_pid = parent_guard.page_id();
        for i in from..to {
            let child_pid = InternalNodeRef::<K>::new(parent_guard.data()).child_at(i);
            match ctx.side_set.iter_mut().find(|g| g.page_id() == child_pid) {
                Some(guard) => set_parent(guard, parent_pid),
                None => {
                    let mut child_guard = self.bpm.fetch_page_write(child_pid)?;
                    set_parent(&mut child_guard, parent_pid);
                }
            }
        }
        Ok(())
    }

    /// Persists the root page id under this index's name in the header page.
    fn update_root_record(&self, root: PageId) -> Result<()> {
        let mut guard = self.bpm.fetch_page_write(HEADER_PAGE_ID)?;
        let mut header = HeaderPageMut::new(guard.data_mut());
        if !header.update_record(&self.index_name, root)
            && !header.insert_record(&self.index_name, root)
        {
            return Err(BurrowError::HeaderFull);
        }
        Ok(())
    }
}
