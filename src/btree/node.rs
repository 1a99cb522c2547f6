//! # Node View
//!
//! A node is one page interpreted as a flat array of 64-bit words. For a
//! page of `page_size` bytes, `max_keys = page_size/16 - 1` key/value pairs
//! fit, each pair occupying two consecutive words; the trailing pair is
//! reserved for metadata.
//!
//! ## Word Layout
//!
//! ```text
//! Word index        Content
//! ----------        ----------------------------------------
//! 2*i               key of entry i            (i < max_keys)
//! 2*i + 1           value of entry i
//! 2*max_keys        the node's own page id
//! 2*max_keys + 1    packed meta word
//! ```
//!
//! ## Packed Meta Word
//!
//! ```text
//! Bits 56..64   flags (bit 63 = leaf)
//! Bits 32..56   unused
//! Bits  0..32   live-entry count (num_keys)
//! ```
//!
//! The packing is isolated in `pack_meta` / `meta_flags` / `meta_num_keys`
//! so it can be tested without a tree around it. `set_num_keys` rewrites
//! only the count field and preserves the flag byte.
//!
//! ## Keys and Values
//!
//! Keys are sorted ascending within the live prefix and never zero there;
//! key 0 marks an empty slot. In a leaf, values are user payloads (value 0
//! after compaction is a tombstone). In an internal node, an entry
//! `(upper_bound, child)` means "all keys <= upper_bound live under child".
//!
//! ## Free-List Link
//!
//! A freed page keeps its page-id word but its first word becomes the link
//! to the next free page. `link`/`set_link` are the only accessors for that
//! encoding, so tree logic never touches the raw word.

use eyre::{ensure, Result};
use zerocopy::FromBytes;

use super::scan;

/// Reserved maximum key: a permanent sentinel guaranteeing that every
/// search terminates. Never valid as a user key.
pub const ABSOLUTE_MAX: u64 = u64::MAX;

/// Bytes per key/value pair.
pub const ENTRY_SIZE: usize = 16;

/// Leaf flag, bit 7 of the meta word's flag byte (bit 63 of the word).
pub const LEAF_FLAG: u8 = 0x80;

const FLAGS_SHIFT: u32 = 56;
const NUM_KEYS_MASK: u64 = 0xFFFF_FFFF;

pub fn pack_meta(flags: u8, num_keys: u32) -> u64 {
    ((flags as u64) << FLAGS_SHIFT) | num_keys as u64
}

pub fn meta_flags(meta: u64) -> u8 {
    (meta >> FLAGS_SHIFT) as u8
}

pub fn meta_num_keys(meta: u64) -> u32 {
    (meta & NUM_KEYS_MASK) as u32
}

pub(crate) fn page_words(data: &[u8]) -> Result<&[u64]> {
    let words = <[u64]>::ref_from_bytes(data)
        .map_err(|e| eyre::eyre!("failed to view page as words: {:?}", e))?;
    ensure!(
        words.len() >= 10 && words.len() % 2 == 0,
        "page of {} words cannot hold a node",
        words.len()
    );
    Ok(words)
}

pub(crate) fn page_words_mut(data: &mut [u8]) -> Result<&mut [u64]> {
    let words = <[u64]>::mut_from_bytes(data)
        .map_err(|e| eyre::eyre!("failed to view page as words: {:?}", e))?;
    ensure!(
        words.len() >= 10 && words.len() % 2 == 0,
        "page of {} words cannot hold a node",
        words.len()
    );
    Ok(words)
}

/// Read-only view of one page as a node.
#[derive(Debug, Clone, Copy)]
pub struct Node<'a> {
    words: &'a [u64],
}

/// Mutable view of one page as a node.
#[derive(Debug)]
pub struct NodeMut<'a> {
    words: &'a mut [u64],
}

impl<'a> Node<'a> {
    pub fn from_page(data: &'a [u8]) -> Result<Self> {
        Ok(Self {
            words: page_words(data)?,
        })
    }

    pub(crate) fn from_words(words: &'a [u64]) -> Self {
        Self { words }
    }

    pub fn max_keys(&self) -> usize {
        self.words.len() / 2 - 1
    }

    pub fn key(&self, i: usize) -> u64 {
        self.words[2 * i]
    }

    pub fn val(&self, i: usize) -> u64 {
        self.words[2 * i + 1]
    }

    pub fn page_id(&self) -> u64 {
        self.words[2 * self.max_keys()]
    }

    fn meta(&self) -> u64 {
        self.words[2 * self.max_keys() + 1]
    }

    pub fn num_keys(&self) -> usize {
        meta_num_keys(self.meta()) as usize
    }

    pub fn is_leaf(&self) -> bool {
        meta_flags(self.meta()) & LEAF_FLAG != 0
    }

    pub fn is_full(&self) -> bool {
        self.num_keys() == self.max_keys()
    }

    /// Key of the last live entry: the upper bound a parent records for
    /// this node. Zero for an empty node.
    pub fn max_key(&self) -> u64 {
        match self.num_keys() {
            0 => 0,
            n => self.key(n - 1),
        }
    }

    /// Index of the first live entry with key `>= target`, or `num_keys()`
    /// if there is none.
    pub fn search(&self, target: u64) -> usize {
        scan::first_ge(self.words, self.num_keys(), target)
    }

    /// Value stored under exactly `key`, or 0 on a miss.
    pub fn get(&self, key: u64) -> u64 {
        let idx = self.search(key);
        if idx < self.num_keys() && self.key(idx) == key {
            self.val(idx)
        } else {
            0
        }
    }

    /// Free-list continuation link of a freed page.
    pub(crate) fn link(&self) -> u64 {
        self.words[0]
    }
}

impl<'a> NodeMut<'a> {
    pub fn from_page(data: &'a mut [u8]) -> Result<Self> {
        Ok(Self {
            words: page_words_mut(data)?,
        })
    }

    pub(crate) fn from_words(words: &'a mut [u64]) -> Self {
        Self { words }
    }

    pub fn as_node(&self) -> Node<'_> {
        Node { words: self.words }
    }

    pub fn max_keys(&self) -> usize {
        self.as_node().max_keys()
    }

    pub fn key(&self, i: usize) -> u64 {
        self.as_node().key(i)
    }

    pub fn val(&self, i: usize) -> u64 {
        self.as_node().val(i)
    }

    pub fn page_id(&self) -> u64 {
        self.as_node().page_id()
    }

    pub fn num_keys(&self) -> usize {
        self.as_node().num_keys()
    }

    pub fn is_leaf(&self) -> bool {
        self.as_node().is_leaf()
    }

    pub fn is_full(&self) -> bool {
        self.as_node().is_full()
    }

    pub fn max_key(&self) -> u64 {
        self.as_node().max_key()
    }

    pub fn search(&self, target: u64) -> usize {
        self.as_node().search(target)
    }

    pub fn get(&self, key: u64) -> u64 {
        self.as_node().get(key)
    }

    /// Stamps a zeroed page as a node: its own page id plus an empty meta
    /// word with the leaf flag.
    pub fn init(&mut self, page_id: u64, leaf: bool) {
        let mk = self.max_keys();
        self.words[2 * mk] = page_id;
        self.words[2 * mk + 1] = pack_meta(if leaf { LEAF_FLAG } else { 0 }, 0);
    }

    pub fn set_key(&mut self, i: usize, key: u64) {
        debug_assert!(i < self.max_keys());
        self.words[2 * i] = key;
    }

    pub fn set_val(&mut self, i: usize, val: u64) {
        debug_assert!(i < self.max_keys());
        self.words[2 * i + 1] = val;
    }

    /// Rewrites the live-entry count, preserving the flag byte.
    pub fn set_num_keys(&mut self, num: usize) {
        debug_assert!(num <= self.max_keys());
        let idx = 2 * self.max_keys() + 1;
        let flags = meta_flags(self.words[idx]);
        self.words[idx] = pack_meta(flags, num as u32);
    }

    /// Shifts entries at and after `lo` one slot right. The trailing
    /// metadata pair is untouched; the node must not be full.
    pub fn move_right(&mut self, lo: usize) {
        let num = self.num_keys();
        assert!(
            num < self.max_keys(),
            "move_right on full node {}",
            self.page_id()
        );
        assert!(lo <= num, "move_right from {lo} past {num} live entries");
        self.words.copy_within(2 * lo..2 * num, 2 * lo + 2);
    }

    /// Inserts or overwrites `key` at its sorted position. Returns whether a
    /// new key was added. Needing a new slot in a full node is a structural
    /// bug and panics.
    pub fn insert(&mut self, key: u64, value: u64) -> bool {
        let num = self.num_keys();
        let idx = self.search(key);
        assert!(
            idx < self.max_keys(),
            "search index {idx} out of range in page {}",
            self.page_id()
        );
        if idx < num && self.key(idx) == key {
            self.set_val(idx, value);
            return false;
        }
        self.move_right(idx);
        self.set_key(idx, key);
        self.set_val(idx, value);
        self.set_num_keys(num + 1);
        true
    }

    /// Drops entries whose value is below `watermark`, except the entry
    /// holding the node's maximum key, which stays so the parent's coverage
    /// bound remains valid. Survivors are repacked left-aligned.
    ///
    /// Returns the new live count, or 0 when only the max-key entry remains
    /// and its own value is below the watermark — the signal that this
    /// subtree as a whole is droppable.
    pub fn compact(&mut self, watermark: u64) -> usize {
        let num = self.num_keys();
        let max_key = self.max_key();
        let mut kept = 0usize;
        for i in 0..num {
            let (k, v) = (self.key(i), self.val(i));
            if v < watermark && k < max_key {
                continue;
            }
            if kept != i {
                self.set_key(kept, k);
                self.set_val(kept, v);
            }
            kept += 1;
        }
        for i in kept..num {
            self.set_key(i, 0);
            self.set_val(i, 0);
        }
        self.set_num_keys(kept);
        if kept == 1 && self.key(0) == max_key && self.val(0) < watermark {
            0
        } else {
            kept
        }
    }

    /// Turns this node into a free-list entry: everything zeroed except the
    /// page-id word, with the first word linking to the previous head.
    pub(crate) fn reset_for_free(&mut self, next_free: u64) {
        let mk = self.max_keys();
        let pid = self.page_id();
        self.words[..2 * mk].fill(0);
        self.words[2 * mk] = pid;
        self.words[2 * mk + 1] = 0;
        self.words[0] = next_free;
    }

    pub(crate) fn set_link(&mut self, next_free: u64) {
        self.words[0] = next_free;
    }
}
