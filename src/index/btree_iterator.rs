use std::marker::PhantomData;
use std::sync::Arc;

use crate::buffer::{BufferPoolManager, ReadPageGuard};
use crate::common::{Result, INVALID_PAGE_ID};

use super::btree_page::{LeafNodeRef, Storable};

/// In-order iterator over a B+tree's leaf chain.
///
/// Holds at most one read-latched leaf at a time; advancing to the next
/// leaf latches it before the current one is released. Dropping the
/// iterator releases the latch.
pub struct TreeIterator<K, V> {
    bpm: Arc<BufferPoolManager>,
    leaf: Option<ReadPageGuard>,
    index: usize,
    _marker: PhantomData<(K, V)>,
}

impl<K: Storable, V: Storable> TreeIterator<K, V> {
    pub(crate) fn new(bpm: Arc<BufferPoolManager>, leaf: ReadPageGuard, index: usize) -> Self {
        Self {
            bpm,
            leaf: Some(leaf),
            index,
            _marker: PhantomData,
        }
    }

    /// The end sentinel (also what `begin` returns on an empty tree).
    pub(crate) fn end(bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            bpm,
            leaf: None,
            index: 0,
            _marker: PhantomData,
        }
    }

    pub fn is_end(&self) -> bool {
        match &self.leaf {
            None => true,
            Some(guard) => {
                let leaf = LeafNodeRef::<K, V>::new(guard.data());
                leaf.next_page_id() == INVALID_PAGE_ID && self.index == leaf.size()
            }
        }
    }

    /// The entry under the cursor, or None at the end.
    pub fn get(&self) -> Option<(K, V)> {
        let guard = self.leaf.as_ref()?;
        let leaf = LeafNodeRef::<K, V>::new(guard.data());
        if self.index < leaf.size() {
            Some((leaf.key_at(self.index), leaf.value_at(self.index)))
        } else {
            None
        }
    }

    /// Moves the cursor one entry forward, hopping to the next leaf when
    /// the current one is exhausted.
    pub fn advance(&mut self) -> Result<()> {
        let Some(guard) = self.leaf.as_ref() else {
            return Ok(());
        };
        let (size, next) = {
            let leaf = LeafNodeRef::<K, V>::new(guard.data());
            (leaf.size(), leaf.next_page_id())
        };

        if self.index + 1 < size {
            self.index += 1;
        } else if next != INVALID_PAGE_ID {
            // Latch the next leaf before releasing the current one
            let next_guard = self.bpm.fetch_page_read(next)?;
            self.leaf = Some(next_guard);
            self.index = 0;
        } else {
            self.index = size;
        }
        Ok(())
    }
}

impl<K: Storable, V: Storable> Iterator for TreeIterator<K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.get()?;
        match self.advance() {
            Ok(()) => Some(Ok(item)),
            Err(e) => Some(Err(e)),
        }
    }
}
