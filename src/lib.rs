//! Burrow - the storage and indexing core of a disk-oriented database
//!
//! The crate provides three tightly coupled services an upper layer (query
//! execution, transactions) builds on:
//!
//! - **Buffer pool** (`buffer`): brokers all disk I/O through a fixed set
//!   of in-memory frames
//!   - `BufferPoolManager`: pins pages for callers, evicts cold frames
//!   - `LruKReplacer`: LRU-K page replacement policy
//!   - `Frame`: per-frame metadata, bytes, and the page latch
//!   - `ReadPageGuard`/`WritePageGuard`: RAII latch-plus-pin guards
//!
//! - **Extendible hashing** (`container`): `ExtendibleHashTable`, the
//!   buffer pool's page-id to frame-id directory and a general
//!   associative container with incremental growth
//!
//! - **B+tree index** (`index`): `BPlusTree` with point lookup, sorted
//!   iteration, and insert/delete under crabbing latch-coupling;
//!   `TreeIterator` walks the leaf chain
//!
//! - **Storage layer** (`storage`): `DiskManager` (page file I/O),
//!   `DiskScheduler` (background I/O worker), and the header page
//!   persisting each index's root page id
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use burrow::buffer::BufferPoolManager;
//! use burrow::common::{PageId, RecordId, SlotId};
//! use burrow::index::{BPlusTree, OrdComparator};
//! use burrow::storage::disk::DiskManager;
//!
//! let disk_manager = Arc::new(DiskManager::new("test.db").unwrap());
//! let bpm = Arc::new(BufferPoolManager::new(64, 2, disk_manager));
//!
//! let tree: BPlusTree<u32, RecordId, _> =
//!     BPlusTree::new("orders_pk", bpm, OrdComparator, 64, 64).unwrap();
//!
//! tree.insert(42, RecordId::new(PageId::new(7), SlotId::new(0))).unwrap();
//! assert!(tree.get_value(&42).unwrap().is_some());
//! ```

pub mod buffer;
pub mod common;
pub mod container;
pub mod index;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{BurrowError, PageId, RecordId, Result, SlotId};
