//! # B+ Tree Engine
//!
//! This module implements the tree proper: root management, lookup,
//! insertion with split propagation, version-threshold garbage collection,
//! free-page recycling, iteration, and structural recovery when a persisted
//! store is reattached.
//!
//! ## Shape
//!
//! Page 1 is always the root. The root is always an internal node and
//! always reaches an entry keyed [`ABSOLUTE_MAX`], so every descent
//! terminates. Internal entries `(upper_bound, child)` route by upper
//! bound: all keys `<= upper_bound` live under `child`.
//!
//! ```text
//!                [root, page 1]
//!                /      |      \
//!        [leaf 4]   [leaf 2]   [leaf 7]      (page ids are stable)
//! ```
//!
//! ## Insertion and Splits
//!
//! `set` descends recursively. When a recursive call leaves a child full,
//! the parent splits it immediately: the upper half of the child's pairs
//! moves to a sibling (a recycled free page when one exists), and the
//! parent is rewired with two `insert` calls — the first adds the left
//! half under its new, smaller upper bound; the second reuses the old
//! bound, which the right sibling inherited, and therefore overwrites the
//! old entry's child pointer in place. A full root is handled last: its
//! content moves into a fresh left child so that the root's page id never
//! changes across growth.
//!
//! ## Garbage Collection
//!
//! `delete_below(watermark)` walks depth-first. Leaves drop entries whose
//! value (a version/timestamp) is below the watermark; a leaf reduced to a
//! single stale max-key entry is droppable, and its page goes to the free
//! list unless it is its parent's own maximum-key child. Internal nodes
//! then self-compact with threshold 1, so a swept child pointer (zeroed
//! value) acts as a tombstone. A node's maximum-key entry is always
//! retained, even stale, to keep the parent's coverage bound valid — so
//! purged keys read as 0 but a leaf's retained max key may still surface
//! its old value.
//!
//! ## Free List
//!
//! Freed pages keep their page-id word; their first word links to the
//! previous head. Only the head id is tracked in memory. Allocation pops
//! the head before growing the store.
//!
//! ## Recovery
//!
//! Persisted stores carry no metadata block. On reattach, `next_page` is
//! recomputed by scanning from page 2 until a page's id word stops
//! matching its index, and the free-list head is the single allocated page
//! neither reachable as a live child nor referenced by another free page's
//! link word. Linear in page count, and runs before any other operation.
//!
//! ## Concurrency
//!
//! Single logical writer, no internal locking. `&self` reads may run
//! concurrently with each other but never with a `&mut self` mutation;
//! splits and compaction rewrite pages in place and a concurrent reader
//! could observe a torn node. Page addresses are re-derived from the
//! current store view on every access, so a growth remap never invalidates
//! held references (the borrow checker forbids holding any).

use eyre::{ensure, Result};
use hashbrown::HashSet;
use log::{debug, trace};
use smallvec::SmallVec;

use super::node::{page_words_mut, Node, NodeMut, ABSOLUTE_MAX, ENTRY_SIZE};
use crate::storage::{FileStore, MemoryStore, PageStore, MAX_PAGE_COUNT};

/// The root's page id, fixed for the life of the tree.
pub const ROOT_PAGE: u64 = 1;

/// Point-in-time counters describing tree shape and occupancy.
#[derive(Debug, Clone, Copy)]
pub struct TreeStats {
    /// Pages allocated so far (live + free, excluding the unused page 0).
    pub page_count: u64,
    /// Pages currently on the free list.
    pub free_page_count: u64,
    /// Live leaf entries, excluding the [`ABSOLUTE_MAX`] sentinel.
    pub leaf_key_count: u64,
    /// Leaf keys as a fraction of the active pages' pair capacity.
    pub occupancy_ratio: f64,
}

/// A B+ tree mapping `u64` keys to `u64` values over a page store.
///
/// Keys must lie in `[1, u64::MAX - 1]`: key 0 marks an empty slot and
/// [`ABSOLUTE_MAX`] is the internal sentinel. Passing either is a contract
/// violation and panics. Value 0 is what `get` returns on a miss, so
/// callers must not store 0 as a meaningful value.
#[derive(Debug)]
pub struct BTree<S: PageStore> {
    store: S,
    next_page: u64,
    free_head: u64,
    num_leaf_keys: u64,
    num_pages_free: u64,
}

impl BTree<MemoryStore> {
    /// A fresh in-memory tree.
    pub fn memory(page_size: usize) -> Result<Self> {
        Self::new(MemoryStore::new(page_size)?)
    }
}

impl BTree<FileStore> {
    /// A fresh file-backed tree, truncating any existing file at `path`.
    pub fn create<P: AsRef<std::path::Path>>(path: P, page_size: usize) -> Result<Self> {
        Self::new(FileStore::create(path, page_size, 2)?)
    }

    /// Reattaches to a persisted tree, running structural recovery.
    ///
    /// The file carries no header, so the caller must supply the same page
    /// size the tree was created with.
    pub fn open<P: AsRef<std::path::Path>>(path: P, page_size: usize) -> Result<Self> {
        Self::attach(FileStore::open(path, page_size)?)
    }
}

impl<S: PageStore> BTree<S> {
    /// Builds a tree over a fresh (all-zero) store.
    pub fn new(store: S) -> Result<Self> {
        let mut tree = Self {
            store,
            next_page: 1,
            free_head: 0,
            num_leaf_keys: 0,
            num_pages_free: 0,
        };
        tree.init_root()?;
        Ok(tree)
    }

    /// Builds a tree over a store holding persisted pages, recomputing all
    /// bookkeeping from page contents.
    pub fn attach(store: S) -> Result<Self> {
        let mut tree = Self {
            store,
            next_page: 2,
            free_head: 0,
            num_leaf_keys: 0,
            num_pages_free: 0,
        };
        tree.recover()?;
        Ok(tree)
    }

    pub fn page_size(&self) -> usize {
        self.store.page_size()
    }

    fn max_keys(&self) -> usize {
        self.store.page_size() / ENTRY_SIZE - 1
    }

    fn node(&self, pid: u64) -> Result<Node<'_>> {
        ensure!(
            pid >= 1 && pid < self.next_page,
            "page id {} out of range (next_page={})",
            pid,
            self.next_page
        );
        Node::from_page(self.store.page(pid)?)
    }

    fn node_mut(&mut self, pid: u64) -> Result<NodeMut<'_>> {
        ensure!(
            pid >= 1 && pid < self.next_page,
            "page id {} out of range (next_page={})",
            pid,
            self.next_page
        );
        NodeMut::from_page(self.store.page_mut(pid)?)
    }

    fn init_root(&mut self) -> Result<()> {
        let root = self.new_node(false)?;
        ensure!(root == ROOT_PAGE, "root landed on page {root}");
        // Wire the sentinel: one leaf child holding ABSOLUTE_MAX, reached
        // from the root. It is plumbing, not data, so the key counter is
        // reset afterwards.
        self.set_inner(ABSOLUTE_MAX, 0)?;
        self.num_leaf_keys = 0;
        Ok(())
    }

    /// Allocates a node page, preferring the free list over store growth.
    fn new_node(&mut self, leaf: bool) -> Result<u64> {
        let pid = if self.free_head != 0 {
            let pid = self.free_head;
            let next = self.node(pid)?.link();
            self.node_mut(pid)?.set_link(0);
            self.free_head = next;
            self.num_pages_free -= 1;
            trace!("reusing freed page {pid}");
            pid
        } else {
            let pid = self.next_page;
            assert!(
                pid < MAX_PAGE_COUNT,
                "page allocation beyond the supported maximum {MAX_PAGE_COUNT}"
            );
            self.store.ensure_pages(pid + 1)?;
            self.next_page += 1;
            pid
        };
        self.node_mut(pid)?.init(pid, leaf);
        Ok(pid)
    }

    /// Pushes a page onto the free list. Its bytes become a free-list link;
    /// the page-id word survives for the recovery scan.
    fn free_page(&mut self, pid: u64) -> Result<()> {
        trace!("freeing page {pid}");
        let head = self.free_head;
        self.node_mut(pid)?.reset_for_free(head);
        self.free_head = pid;
        self.num_pages_free += 1;
        Ok(())
    }

    /// Looks up `key`, returning its value or 0 on a miss.
    ///
    /// Panics if `key` is one of the reserved keys (0 or `ABSOLUTE_MAX`).
    pub fn get(&self, key: u64) -> Result<u64> {
        assert!(
            key != 0 && key != ABSOLUTE_MAX,
            "key {key:#x} is reserved"
        );
        let mut pid = ROOT_PAGE;
        loop {
            let n = self.node(pid)?;
            if n.is_leaf() {
                return Ok(n.get(key));
            }
            let idx = n.search(key);
            ensure!(
                idx < n.num_keys(),
                "no routing entry covers key {key} in page {pid}"
            );
            let child = n.val(idx);
            ensure!(child != 0, "missing child pointer under page {pid}");
            pid = child;
        }
    }

    /// Inserts or overwrites `key`. Panics on reserved keys; store growth
    /// failures propagate, after which the tree must be discarded.
    pub fn set(&mut self, key: u64, value: u64) -> Result<()> {
        assert!(
            key != 0 && key != ABSOLUTE_MAX,
            "key {key:#x} is reserved"
        );
        self.set_inner(key, value)
    }

    fn set_inner(&mut self, key: u64, value: u64) -> Result<()> {
        self.set_rec(ROOT_PAGE, key, value)?;
        if self.node(ROOT_PAGE)?.is_full() {
            self.grow_root()?;
        }
        Ok(())
    }

    fn set_rec(&mut self, pid: u64, key: u64, value: u64) -> Result<()> {
        let mk = self.max_keys();
        let (is_leaf, idx, slot_key, mut child) = {
            let n = self.node(pid)?;
            if n.is_leaf() {
                (true, 0, 0, 0)
            } else {
                let idx = n.search(key);
                ensure!(idx < mk, "search index {idx} out of range in page {pid}");
                (false, idx, n.key(idx), n.val(idx))
            }
        };
        if is_leaf {
            if self.node_mut(pid)?.insert(key, value) {
                self.num_leaf_keys += 1;
            }
            return Ok(());
        }

        if slot_key == 0 {
            // Reserve the sorted slot before descending; the child pointer
            // stays zero only within this call.
            let mut n = self.node_mut(pid)?;
            let num = n.num_keys();
            n.set_key(idx, key);
            n.set_num_keys(num + 1);
        }
        if child == 0 {
            child = self.new_node(true)?;
            self.node_mut(pid)?.set_val(idx, child);
        }

        self.set_rec(child, key, value)?;

        if self.node(child)?.is_full() {
            let sibling = self.split(child)?;
            let left_max = self.node(child)?.max_key();
            let right_max = self.node(sibling)?.max_key();
            let mut parent = self.node_mut(pid)?;
            // The left half gets a fresh entry under its reduced bound; the
            // right sibling inherited the old bound, so the second insert
            // overwrites the old entry's child pointer in place.
            parent.insert(left_max, child);
            parent.insert(right_max, sibling);
        }
        Ok(())
    }

    /// Splits a full node: the upper half of its pairs moves to a new
    /// sibling with the same leaf flag. Returns the sibling's page id; the
    /// caller wires it into the parent.
    fn split(&mut self, pid: u64) -> Result<u64> {
        let is_leaf = {
            let n = self.node(pid)?;
            ensure!(
                n.is_full(),
                "split requested for page {pid} with {} of {} keys",
                n.num_keys(),
                n.max_keys()
            );
            n.is_leaf()
        };
        let sibling = self.new_node(is_leaf)?;
        trace!("splitting page {pid} into {sibling}");

        let mk = self.max_keys();
        let half = mk / 2;
        let (src, dst) = self.store.page_pair_mut(pid, sibling)?;
        let src_words = page_words_mut(src)?;
        let dst_words = page_words_mut(dst)?;

        dst_words[..2 * (mk - half)].copy_from_slice(&src_words[2 * half..2 * mk]);
        src_words[2 * half..2 * mk].fill(0);
        NodeMut::from_words(src_words).set_num_keys(half);
        NodeMut::from_words(dst_words).set_num_keys(mk - half);
        Ok(sibling)
    }

    /// Adds a level above a full root while keeping its page id: the root's
    /// remaining pairs move into a fresh left child, and the emptied root
    /// gets exactly two routing entries.
    fn grow_root(&mut self) -> Result<()> {
        debug!("root is full, adding a level");
        let right = self.split(ROOT_PAGE)?;
        let left = self.new_node(false)?;

        let mk = self.max_keys();
        {
            let (root, left_page) = self.store.page_pair_mut(ROOT_PAGE, left)?;
            let root_words = page_words_mut(root)?;
            let left_words = page_words_mut(left_page)?;

            let root_num = Node::from_words(root_words).num_keys();
            left_words[..2 * mk].copy_from_slice(&root_words[..2 * mk]);
            NodeMut::from_words(left_words).set_num_keys(root_num);

            root_words[..2 * mk].fill(0);
            NodeMut::from_words(root_words).set_num_keys(0);
        }

        let left_max = self.node(left)?.max_key();
        let right_max = self.node(right)?.max_key();
        let mut root = self.node_mut(ROOT_PAGE)?;
        root.insert(left_max, left);
        root.insert(right_max, right);
        Ok(())
    }

    /// Drops every leaf entry whose value is below `watermark`, recycling
    /// pages emptied by the sweep.
    ///
    /// A leaf's maximum-key entry is retained even when stale, so lookups
    /// for purged keys return 0 but the retained key may still surface its
    /// old value. The leaf-key counter is recomputed during the walk.
    pub fn delete_below(&mut self, watermark: u64) -> Result<()> {
        debug!("collecting entries below watermark {watermark}");
        self.num_leaf_keys = 0;
        self.compact_rec(ROOT_PAGE, watermark)?;
        Ok(())
    }

    fn compact_rec(&mut self, pid: u64, watermark: u64) -> Result<usize> {
        let (is_leaf, num, node_max) = {
            let n = self.node(pid)?;
            (n.is_leaf(), n.num_keys(), n.max_key())
        };
        if is_leaf {
            let rem = self.node_mut(pid)?.compact(watermark);
            let n = self.node(pid)?;
            let mut live = n.num_keys() as u64;
            if live > 0 && n.max_key() == ABSOLUTE_MAX {
                live -= 1;
            }
            self.num_leaf_keys += live;
            return Ok(rem);
        }

        for i in 0..num {
            let (upper, child) = {
                let n = self.node(pid)?;
                (n.key(i), n.val(i))
            };
            ensure!(upper != 0, "zero key in live slot {i} of page {pid}");
            ensure!(child != 0, "missing child pointer in page {pid} slot {i}");
            let rem = self.compact_rec(child, watermark)?;
            if rem == 0 && upper != node_max {
                // The droppable leaf still holds one stale entry that the
                // walk above counted; it leaves with the page.
                self.num_leaf_keys -= 1;
                self.free_page(child)?;
                self.node_mut(pid)?.set_val(i, 0);
            }
        }
        // Threshold 1: a swept child pointer is a zero value and drops here.
        Ok(self.node_mut(pid)?.compact(1))
    }

    /// Visits every node pre-order with a read-only view.
    pub fn iterate<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(Node<'_>),
    {
        self.iterate_rec(ROOT_PAGE, &mut visit)
    }

    fn iterate_rec<F>(&self, pid: u64, visit: &mut F) -> Result<()>
    where
        F: FnMut(Node<'_>),
    {
        visit(self.node(pid)?);
        let n = self.node(pid)?;
        if n.is_leaf() {
            return Ok(());
        }
        for i in 0..n.num_keys() {
            let child = n.val(i);
            if child != 0 {
                self.iterate_rec(child, visit)?;
            }
        }
        Ok(())
    }

    /// Visits every live leaf entry in ascending key order, skipping the
    /// sentinel. A non-zero return value from the visitor replaces the
    /// stored value in place.
    pub fn iterate_kv<F>(&mut self, mut visit: F) -> Result<()>
    where
        F: FnMut(u64, u64) -> u64,
    {
        self.iterate_kv_rec(ROOT_PAGE, &mut visit)
    }

    fn iterate_kv_rec<F>(&mut self, pid: u64, visit: &mut F) -> Result<()>
    where
        F: FnMut(u64, u64) -> u64,
    {
        let is_leaf = self.node(pid)?.is_leaf();
        if !is_leaf {
            let children: SmallVec<[u64; 32]> = {
                let n = self.node(pid)?;
                (0..n.num_keys()).map(|i| n.val(i)).filter(|&c| c != 0).collect()
            };
            for child in children {
                self.iterate_kv_rec(child, visit)?;
            }
            return Ok(());
        }

        let num = self.node(pid)?.num_keys();
        for i in 0..num {
            let (key, value) = {
                let n = self.node(pid)?;
                (n.key(i), n.val(i))
            };
            if key == ABSOLUTE_MAX {
                continue;
            }
            let rewrite = visit(key, value);
            if rewrite != 0 {
                self.node_mut(pid)?.set_val(i, rewrite);
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> TreeStats {
        let page_count = self.next_page - 1;
        let active = page_count - self.num_pages_free;
        let capacity = active * self.max_keys() as u64;
        TreeStats {
            page_count,
            free_page_count: self.num_pages_free,
            leaf_key_count: self.num_leaf_keys,
            occupancy_ratio: if capacity == 0 {
                0.0
            } else {
                self.num_leaf_keys as f64 / capacity as f64
            },
        }
    }

    /// Zeroes every allocated page and reinitializes the root and sentinel.
    pub fn reset(&mut self) -> Result<()> {
        for pid in 1..self.next_page {
            self.store.page_mut(pid)?.fill(0);
        }
        self.next_page = 1;
        self.free_head = 0;
        self.num_leaf_keys = 0;
        self.num_pages_free = 0;
        self.init_root()
    }

    /// Flushes a file-backed store to durable media.
    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }

    /// Releases the store; file-backed stores delete their file unless
    /// marked persistent.
    pub fn close(self) -> Result<()> {
        self.store.release()
    }

    /// Rebuilds `next_page`, the free-list head, and the leaf-key count
    /// from page contents alone.
    fn recover(&mut self) -> Result<()> {
        let total = self.store.page_count();
        ensure!(total >= 2, "store of {total} pages cannot hold a root");
        self.store.prefetch(1, total);

        // (a) High-water mark: page ids are stamped at allocation and
        // survive freeing, so the first mismatch is the first page never
        // allocated.
        let mut next = 2;
        while next < total {
            let n = Node::from_page(self.store.page(next)?)?;
            if n.page_id() != next {
                break;
            }
            next += 1;
        }
        self.next_page = next;

        {
            let root = self.node(ROOT_PAGE)?;
            ensure!(
                root.page_id() == ROOT_PAGE && !root.is_leaf(),
                "page 1 does not hold a valid root"
            );
        }

        // (b) Mark everything reachable through live child pointers.
        let mut reachable: HashSet<u64> = HashSet::new();
        let mut stack: SmallVec<[u64; 32]> = SmallVec::new();
        let mut leaf_keys = 0u64;
        stack.push(ROOT_PAGE);
        while let Some(pid) = stack.pop() {
            ensure!(reachable.insert(pid), "page {pid} is reachable twice");
            let n = self.node(pid)?;
            if n.is_leaf() {
                let mut live = n.num_keys() as u64;
                if live > 0 && n.max_key() == ABSOLUTE_MAX {
                    live -= 1;
                }
                leaf_keys += live;
                continue;
            }
            for i in 0..n.num_keys() {
                let child = n.val(i);
                ensure!(
                    child > ROOT_PAGE && child < self.next_page,
                    "child pointer {child} in page {pid} is out of range"
                );
                stack.push(child);
            }
        }

        // (c) Every allocated, unreachable page is on the free list. The
        // head is the one no other free page's link word points at.
        let mut free_pages: Vec<u64> = Vec::new();
        let mut linked: HashSet<u64> = HashSet::new();
        for pid in 2..self.next_page {
            if reachable.contains(&pid) {
                continue;
            }
            free_pages.push(pid);
            let link = self.node(pid)?.link();
            if link != 0 {
                linked.insert(link);
            }
        }

        self.free_head = 0;
        if !free_pages.is_empty() {
            let mut head = 0;
            for &pid in &free_pages {
                if !linked.contains(&pid) {
                    ensure!(head == 0, "free list has two heads: {head} and {pid}");
                    head = pid;
                }
            }
            ensure!(head != 0, "free list is cyclic");
            self.free_head = head;
        }
        self.num_pages_free = free_pages.len() as u64;
        self.num_leaf_keys = leaf_keys;

        debug!(
            "recovered tree: {} pages, {} free (head {}), {} leaf keys",
            self.next_page - 1,
            self.num_pages_free,
            self.free_head,
            self.num_leaf_keys
        );
        Ok(())
    }
}
