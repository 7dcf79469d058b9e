//! Mica - the storage core of a disk-oriented database
//!
//! This crate provides the bottom layers of a relational database engine:
//! a bounded in-memory cache of fixed-size disk pages and a concurrent
//! B+Tree index built on top of it.
//!
//! # Architecture
//!
//! - **Storage Layer** (`storage`): page-granular disk I/O
//!   - `DiskManager`: reads and writes 4 KB pages in a database file
//!
//! - **Buffer Pool** (`buffer`): memory management for database pages
//!   - `BufferPoolManager`: caches pages in a fixed set of frames
//!   - `LruKReplacer`: LRU-K eviction policy over unpinned frames
//!   - `Frame`: per-frame metadata, bytes, and content latch
//!   - `ReadPageGuard`/`WritePageGuard`: RAII pin + latch handles
//!
//! - **Containers** (`container`): in-memory support structures
//!   - `ExtendibleHashTable`: the buffer pool's page table
//!
//! - **Index** (`index`): the B+Tree
//!   - `BPlusTree`: latch-coupled search, insert, delete
//!   - `TreeIterator`: ascending scan over the leaf chain
//!   - leaf/internal page views and the root catalog page
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mica::buffer::BufferPoolManager;
//! use mica::common::{PageId, RecordId, SlotId};
//! use mica::index::BPlusTree;
//! use mica::storage::disk::DiskManager;
//!
//! let disk = Arc::new(DiskManager::new("example.db").unwrap());
//! let bpm = Arc::new(BufferPoolManager::new(64, 2, disk));
//!
//! let tree = BPlusTree::new("example_index", bpm).unwrap();
//! tree.insert(42, RecordId::new(PageId::new(7), SlotId::new(0))).unwrap();
//! assert!(tree.get_value(42).unwrap().is_some());
//! ```

pub mod buffer;
pub mod common;
pub mod container;
pub mod index;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{MicaError, PageId, RecordId, Result, SlotId};
