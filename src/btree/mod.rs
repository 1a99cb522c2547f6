//! # B+ Tree
//!
//! A B+ tree mapping `u64` keys to `u64` values over a page store. Nodes
//! are whole pages viewed as word arrays; there is no per-node allocation
//! and no serialization step, so an in-memory tree and a file-backed tree
//! share every code path.
//!
//! The layers, bottom up:
//!
//! - `scan`: the branchless first-not-less scan over a node's pair area.
//! - `node`: [`Node`]/[`NodeMut`], typed views over one page's words.
//! - `tree`: [`BTree`], the engine wiring pages into a tree.
//!
//! Values double as versions: [`BTree::delete_below`] purges every entry
//! whose value is below a caller-chosen watermark, which is the only form
//! of deletion.

mod node;
mod scan;
mod tree;

pub use node::{Node, NodeMut, ABSOLUTE_MAX};
pub use tree::{BTree, TreeStats, ROOT_PAGE};
