//! # Storage Module
//!
//! This module provides the page store backing the B+ tree: a growable region
//! of fixed-size pages addressed by a 1-based page id, either held in
//! anonymous memory or memory-mapped to a file for persistence.
//!
//! ## Address-Free Paging
//!
//! Pages are always addressed by id, never by raw pointer. A file-backed
//! store may remap its region when grown (`ensure_pages`), which invalidates
//! every previously returned slice. Callers therefore re-derive a page's
//! address from the *current* store view on every access:
//!
//! ```text
//! page(&self, pid) -> &[u8]          // Borrows &self immutably
//! ensure_pages(&mut self, count)     // Requires &mut self exclusively
//! ```
//!
//! Since growth requires `&mut self`, the borrow checker guarantees at
//! compile time that no page reference survives a remap. No guards, epochs,
//! or reference counting are needed.
//!
//! ## File Format
//!
//! Persisted stores are flat files whose size is always a multiple of the
//! page size. Page 0 is unused; page 1 is the tree root. There is no file
//! header: all bookkeeping is recomputed from page contents on reopen, so
//! the format is self-describing at the cost of a linear scan.
//!
//! ```text
//! Offset 0:            Page 0 (unused)
//! Offset page_size:    Page 1 (root)
//! Offset 2*page_size:  Page 2
//! ...
//! ```
//!
//! ## Growth Policy
//!
//! `ensure_pages` doubles the current capacity until the request fits,
//! capping each step at [`MAX_GROW_BYTES`]. File-backed stores flush,
//! truncate the file to the new length, and remap.
//!
//! ## Backends
//!
//! - `heap`: `MemoryStore`, a zeroed `Vec<u64>` (8-byte aligned by
//!   construction, so page bytes can always be viewed as words).
//! - `mmap`: `FileStore`, a memory-mapped file. Releasing it deletes the
//!   backing file unless the store is marked persistent.

mod heap;
mod mmap;

pub use heap::MemoryStore;
pub use mmap::FileStore;

use eyre::{ensure, Result};

/// Default page size, matching the common OS page size.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest supported page: four key/value pairs plus the reserved tail pair.
pub const MIN_PAGE_SIZE: usize = 80;

/// Hard ceiling on the number of pages a store may hold. Requesting more is
/// a contract violation and aborts.
pub const MAX_PAGE_COUNT: u64 = 1 << 32;

/// Largest single growth step, in bytes.
pub const MAX_GROW_BYTES: u64 = 1 << 30;

/// A growable region of fixed-size pages addressed by 1-based page id.
///
/// Implementations keep the whole region contiguous so that any two distinct
/// pages can be borrowed mutably at once via `page_pair_mut`.
pub trait PageStore {
    /// The fixed page size of this store, in bytes.
    fn page_size(&self) -> usize;

    /// Number of pages currently addressable (including the unused page 0).
    fn page_count(&self) -> u64;

    /// Borrows one page immutably. The slice is only valid until the next
    /// `&mut self` call; addresses must never be cached across calls.
    fn page(&self, pid: u64) -> Result<&[u8]>;

    /// Borrows one page mutably.
    fn page_mut(&mut self, pid: u64) -> Result<&mut [u8]>;

    /// Borrows two distinct pages mutably at once.
    fn page_pair_mut(&mut self, a: u64, b: u64) -> Result<(&mut [u8], &mut [u8])>;

    /// Grows the store until it holds at least `count` pages, doubling and
    /// capping each step at [`MAX_GROW_BYTES`]. New pages are zeroed. For
    /// file-backed stores this may truncate and remap the file; on failure
    /// the error propagates and the store must be considered unusable.
    fn ensure_pages(&mut self, count: u64) -> Result<()>;

    /// Flushes the region to durable media. No-op for in-memory stores.
    fn sync(&self) -> Result<()> {
        Ok(())
    }

    /// Advisory readahead hint for a page range. No-op by default.
    fn prefetch(&self, _start: u64, _count: u64) {}

    /// Frees all resources. File-backed stores delete the backing file
    /// unless marked persistent.
    fn release(self) -> Result<()>
    where
        Self: Sized;
}

pub(crate) fn validate_page_size(page_size: usize) -> Result<()> {
    ensure!(
        page_size >= MIN_PAGE_SIZE,
        "page size {} is below the minimum {}",
        page_size,
        MIN_PAGE_SIZE
    );
    ensure!(
        page_size % 16 == 0,
        "page size {} is not a multiple of 16",
        page_size
    );
    Ok(())
}

pub(crate) fn check_page_limit(count: u64) {
    assert!(
        count <= MAX_PAGE_COUNT,
        "requested {count} pages, beyond the supported maximum {MAX_PAGE_COUNT}"
    );
}

/// Computes the capacity for a growth request: double the current size,
/// capped per step, never less than `needed_pages`.
pub(crate) fn grow_target(current_pages: u64, needed_pages: u64, page_size: usize) -> u64 {
    let max_step = (MAX_GROW_BYTES / page_size as u64).max(1);
    let mut target = current_pages.max(1);
    while target < needed_pages {
        target = (target * 2).min(target + max_step);
    }
    target
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_validation_rejects_small_and_unaligned() {
        assert!(validate_page_size(MIN_PAGE_SIZE).is_ok());
        assert!(validate_page_size(4096).is_ok());
        assert!(validate_page_size(64).is_err());
        assert!(validate_page_size(100).is_err());
        assert!(validate_page_size(0).is_err());
    }

    #[test]
    fn grow_target_doubles_until_request_fits() {
        assert_eq!(grow_target(2, 3, 4096), 4);
        assert_eq!(grow_target(4, 100, 4096), 128);
        assert_eq!(grow_target(8, 8, 4096), 8);
    }

    #[test]
    fn grow_target_caps_single_step() {
        let max_step = MAX_GROW_BYTES / 4096;
        let current = max_step * 2;
        let target = grow_target(current, current + 1, 4096);
        assert_eq!(target, current + max_step);
    }

    #[test]
    #[should_panic(expected = "beyond the supported maximum")]
    fn page_limit_is_a_contract_violation() {
        check_page_limit(MAX_PAGE_COUNT + 1);
    }
}
