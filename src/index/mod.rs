pub mod btree;
pub mod btree_iterator;
pub mod btree_page;
pub mod key_comparator;

pub use btree::BPlusTree;
pub use btree_iterator::TreeIterator;
pub use btree_page::{
    BTreePageMut, BTreePageRef, InternalNodeMut, InternalNodeRef, LeafNodeMut, LeafNodeRef,
    Storable,
};
pub use key_comparator::{KeyComparator, OrdComparator, ReverseComparator};
