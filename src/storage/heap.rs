//! # In-Memory Page Store
//!
//! `MemoryStore` backs pages with a zeroed `Vec<u64>`. Backing the region
//! with words rather than bytes guarantees 8-byte alignment, so any page can
//! be reinterpreted as a word array without a runtime alignment check.
//!
//! Growth follows the shared doubling policy and simply resizes the vector;
//! there is nothing to flush and nothing to delete on release.

use eyre::{ensure, Result};
use log::debug;
use zerocopy::IntoBytes;

use super::{check_page_limit, grow_target, validate_page_size, PageStore};

#[derive(Debug)]
pub struct MemoryStore {
    words: Vec<u64>,
    page_size: usize,
}

impl MemoryStore {
    pub fn new(page_size: usize) -> Result<Self> {
        validate_page_size(page_size)?;
        Ok(Self {
            words: Vec::new(),
            page_size,
        })
    }

    fn words_per_page(&self) -> usize {
        self.page_size / 8
    }

    fn page_range(&self, pid: u64) -> Result<std::ops::Range<usize>> {
        ensure!(
            pid < self.page_count(),
            "page {} out of bounds (page_count={})",
            pid,
            self.page_count()
        );
        let start = pid as usize * self.words_per_page();
        Ok(start..start + self.words_per_page())
    }
}

impl PageStore for MemoryStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> u64 {
        (self.words.len() / self.words_per_page()) as u64
    }

    fn page(&self, pid: u64) -> Result<&[u8]> {
        let range = self.page_range(pid)?;
        Ok(self.words[range].as_bytes())
    }

    fn page_mut(&mut self, pid: u64) -> Result<&mut [u8]> {
        let range = self.page_range(pid)?;
        Ok(self.words[range].as_mut_bytes())
    }

    fn page_pair_mut(&mut self, a: u64, b: u64) -> Result<(&mut [u8], &mut [u8])> {
        ensure!(a != b, "page_pair_mut requires distinct pages, got {a} twice");
        let ra = self.page_range(a)?;
        let rb = self.page_range(b)?;
        if a < b {
            let (lo, hi) = self.words.split_at_mut(rb.start);
            Ok((
                lo[ra].as_mut_bytes(),
                hi[..rb.end - rb.start].as_mut_bytes(),
            ))
        } else {
            let (lo, hi) = self.words.split_at_mut(ra.start);
            Ok((
                hi[..ra.end - ra.start].as_mut_bytes(),
                lo[rb].as_mut_bytes(),
            ))
        }
    }

    fn ensure_pages(&mut self, count: u64) -> Result<()> {
        check_page_limit(count);
        if count <= self.page_count() {
            return Ok(());
        }
        let target = grow_target(self.page_count(), count, self.page_size);
        debug!(
            "growing memory store from {} to {} pages",
            self.page_count(),
            target
        );
        self.words.resize(target as usize * self.words_per_page(), 0);
        Ok(())
    }

    fn release(self) -> Result<()> {
        Ok(())
    }
}
