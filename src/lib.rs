//! # kivi
//!
//! A page-oriented B+ tree mapping `u64` keys to `u64` values, designed for
//! version-tracking workloads: values are treated as monotonically growing
//! versions, and the only deletion primitive drops every entry below a
//! caller-chosen watermark in one sweep.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------+
//! |                btree::BTree                 |  lookup, insert, split,
//! |                                             |  GC, recovery
//! +----------------------+----------------------+
//! |      btree::Node     |      btree::scan     |  page-as-words view,
//! |                      |                      |  branchless search
//! +----------------------+----------------------+
//! |              storage::PageStore             |  fixed-size pages by id
//! |     MemoryStore      |      FileStore       |  Vec<u64> | mmap file
//! +----------------------+----------------------+
//! ```
//!
//! Everything above the store works on page ids, so the same tree runs over
//! anonymous memory or a memory-mapped file. File-backed trees carry no
//! metadata block: on reopen, allocation bookkeeping, the free list, and
//! entry counts are all recomputed from page contents.
//!
//! ## Example
//!
//! ```
//! use kivi::BTree;
//!
//! # fn main() -> eyre::Result<()> {
//! let mut tree = BTree::memory(4096)?;
//! tree.set(42, 7)?;
//! assert_eq!(tree.get(42)?, 7);
//!
//! // Values are versions: purge everything below version 100.
//! tree.delete_below(100)?;
//! assert_eq!(tree.get(42)?, 0);
//! # Ok(())
//! # }
//! ```

pub mod btree;
pub mod storage;

pub use btree::{BTree, Node, TreeStats, ABSOLUTE_MAX};
pub use storage::{FileStore, MemoryStore, PageStore, DEFAULT_PAGE_SIZE};
