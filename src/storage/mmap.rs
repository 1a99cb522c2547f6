//! # Memory-Mapped Page Store
//!
//! `FileStore` maps a flat page file directly into the process address
//! space. The OS handles paging transparently, so reads are zero-copy and
//! writes persist through the kernel page cache.
//!
//! ## Safety Considerations
//!
//! A mapped region becomes invalid when the file is grown and remapped.
//! Rather than guarding with hazard pointers or epochs, the store leans on
//! the borrow checker: `ensure_pages` takes `&mut self`, so no page slice
//! can be live across a remap. See the module docs in [`super`].
//!
//! ## Durability
//!
//! `sync` issues an msync of the whole region. Growth flushes before
//! truncating so a failed remap never loses acknowledged writes.
//!
//! ## Lifecycle
//!
//! `create` truncates or creates a persistent file; `open` attaches to an
//! existing one and validates that its size is a page multiple.
//! `create_temp` produces a file-backed store whose file is removed on
//! `release` — useful when the data set outgrows memory but persistence is
//! not wanted.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use log::debug;
use memmap2::MmapMut;

use super::{check_page_limit, grow_target, validate_page_size, PageStore};

#[derive(Debug)]
pub struct FileStore {
    file: File,
    mmap: MmapMut,
    page_size: usize,
    page_count: u64,
    path: PathBuf,
    persistent: bool,
}

impl FileStore {
    /// Creates a new persistent store, truncating any existing file.
    pub fn create<P: AsRef<Path>>(path: P, page_size: usize, initial_pages: u64) -> Result<Self> {
        Self::create_inner(path.as_ref(), page_size, initial_pages, true)
    }

    /// Creates a file-backed store whose file is deleted on `release`.
    pub fn create_temp<P: AsRef<Path>>(
        path: P,
        page_size: usize,
        initial_pages: u64,
    ) -> Result<Self> {
        Self::create_inner(path.as_ref(), page_size, initial_pages, false)
    }

    fn create_inner(
        path: &Path,
        page_size: usize,
        initial_pages: u64,
        persistent: bool,
    ) -> Result<Self> {
        validate_page_size(page_size)?;
        ensure!(initial_pages > 0, "initial page count must be at least 1");
        check_page_limit(initial_pages);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create page file '{}'", path.display()))?;

        let file_size = initial_pages * page_size as u64;
        file.set_len(file_size)
            .wrap_err_with(|| format!("failed to set file size to {} bytes", file_size))?;

        // SAFETY: MmapMut::map_mut is unsafe because memory-mapped files can
        // be modified externally. This is safe because:
        // 1. We just created this file with exclusive access (truncate=true)
        // 2. The file size is a valid multiple of the page size
        // 3. The mmap lifetime is tied to FileStore, preventing use-after-unmap
        // 4. All access goes through page()/page_mut() which bounds-check pids
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_size,
            page_count: initial_pages,
            path: path.to_path_buf(),
            persistent,
        })
    }

    /// Attaches to an existing page file. The caller supplies the page size;
    /// the file carries no header to record it.
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        let path = path.as_ref();
        validate_page_size(page_size)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open page file '{}'", path.display()))?;

        let metadata = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?;
        let file_size = metadata.len();

        ensure!(
            file_size > 0,
            "cannot open empty page file '{}'",
            path.display()
        );
        ensure!(
            file_size % page_size as u64 == 0,
            "page file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            page_size
        );

        // SAFETY: same argument as in create_inner; the file is opened with
        // exclusive read+write access and all page access is bounds-checked.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_size,
            page_count: file_size / page_size as u64,
            path: path.to_path_buf(),
            persistent: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    fn offset(&self, pid: u64) -> Result<usize> {
        ensure!(
            pid < self.page_count,
            "page {} out of bounds (page_count={})",
            pid,
            self.page_count
        );
        Ok(pid as usize * self.page_size)
    }
}

impl PageStore for FileStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> u64 {
        self.page_count
    }

    fn page(&self, pid: u64) -> Result<&[u8]> {
        let offset = self.offset(pid)?;
        Ok(&self.mmap[offset..offset + self.page_size])
    }

    fn page_mut(&mut self, pid: u64) -> Result<&mut [u8]> {
        let offset = self.offset(pid)?;
        Ok(&mut self.mmap[offset..offset + self.page_size])
    }

    fn page_pair_mut(&mut self, a: u64, b: u64) -> Result<(&mut [u8], &mut [u8])> {
        ensure!(a != b, "page_pair_mut requires distinct pages, got {a} twice");
        let oa = self.offset(a)?;
        let ob = self.offset(b)?;
        let ps = self.page_size;
        if oa < ob {
            let (lo, hi) = self.mmap.split_at_mut(ob);
            Ok((&mut lo[oa..oa + ps], &mut hi[..ps]))
        } else {
            let (lo, hi) = self.mmap.split_at_mut(oa);
            Ok((&mut hi[..ps], &mut lo[ob..ob + ps]))
        }
    }

    fn ensure_pages(&mut self, count: u64) -> Result<()> {
        check_page_limit(count);
        if count <= self.page_count {
            return Ok(());
        }
        let target = grow_target(self.page_count, count, self.page_size);
        debug!(
            "growing '{}' from {} to {} pages",
            self.path.display(),
            self.page_count,
            target
        );

        self.mmap
            .flush()
            .wrap_err("failed to flush mmap before grow")?;

        let new_size = target * self.page_size as u64;
        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend file to {} bytes", new_size))?;

        // SAFETY: MmapMut::map_mut is unsafe because the old mmap becomes
        // invalid. This is safe because:
        // 1. ensure_pages requires &mut self, so no page references can exist
        // 2. The old mmap was flushed above, so no acknowledged write is lost
        // 3. The file was extended to new_size before remapping
        // 4. The old mmap is dropped when the new one is assigned
        self.mmap =
            unsafe { MmapMut::map_mut(&self.file).wrap_err("failed to remap file after grow")? };

        self.page_count = target;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync mmap to disk")
    }

    #[cfg(unix)]
    fn prefetch(&self, start: u64, count: u64) {
        if start >= self.page_count {
            return;
        }
        let end = (start + count).min(self.page_count);
        let offset = start as usize * self.page_size;
        let len = (end - start) as usize * self.page_size;

        // SAFETY: madvise with MADV_WILLNEED is a kernel hint. The range is
        // bounds-checked above, so offset + len never exceeds the mapping.
        unsafe {
            libc::madvise(
                self.mmap.as_ptr().add(offset) as *mut libc::c_void,
                len,
                libc::MADV_WILLNEED,
            );
        }
    }

    fn release(self) -> Result<()> {
        self.mmap
            .flush()
            .wrap_err("failed to flush mmap before release")?;
        let path = self.path.clone();
        let persistent = self.persistent;
        drop(self);
        if !persistent {
            std::fs::remove_file(&path)
                .wrap_err_with(|| format!("failed to delete page file '{}'", path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PS: usize = 4096;

    #[test]
    fn create_new_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.db");

        let store = FileStore::create(&path, PS, 4).unwrap();

        assert_eq!(store.page_count(), 4);
        assert_eq!(store.page_size(), PS);
        assert!(store.is_persistent());
    }

    #[test]
    fn create_fails_with_zero_pages() {
        let dir = tempdir().unwrap();
        let result = FileStore::create(dir.path().join("pages.db"), PS, 0);
        assert!(result.is_err());
    }

    #[test]
    fn open_existing_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.db");

        {
            let mut store = FileStore::create(&path, PS, 3).unwrap();
            store.page_mut(1).unwrap()[0] = 0xAB;
            store.sync().unwrap();
        }

        let store = FileStore::open(&path, PS).unwrap();
        assert_eq!(store.page_count(), 3);
        assert_eq!(store.page(1).unwrap()[0], 0xAB);
    }

    #[test]
    fn open_fails_for_nonexistent_file() {
        let dir = tempdir().unwrap();
        assert!(FileStore::open(dir.path().join("missing.db"), PS).is_err());
    }

    #[test]
    fn open_rejects_misaligned_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.db");
        std::fs::write(&path, vec![0u8; PS + 1]).unwrap();
        assert!(FileStore::open(&path, PS).is_err());
    }

    #[test]
    fn grow_extends_and_preserves() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.db");

        let mut store = FileStore::create(&path, PS, 2).unwrap();
        store.page_mut(1).unwrap()[7] = 0xCA;

        store.ensure_pages(10).unwrap();

        assert!(store.page_count() >= 10);
        assert_eq!(store.page(1).unwrap()[7], 0xCA);
        assert!(store.page(9).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn grow_with_same_size_is_noop() {
        let dir = tempdir().unwrap();
        let mut store = FileStore::create(dir.path().join("pages.db"), PS, 5).unwrap();
        store.ensure_pages(5).unwrap();
        store.ensure_pages(3).unwrap();
        assert_eq!(store.page_count(), 5);
    }

    #[test]
    fn page_pair_mut_borrows_distinct_pages() {
        let dir = tempdir().unwrap();
        let mut store = FileStore::create(dir.path().join("pages.db"), PS, 4).unwrap();
        {
            let (a, b) = store.page_pair_mut(3, 1).unwrap();
            a[0] = 3;
            b[0] = 1;
        }
        assert_eq!(store.page(1).unwrap()[0], 1);
        assert_eq!(store.page(3).unwrap()[0], 3);
        assert!(store.page_pair_mut(1, 1).is_err());
    }

    #[test]
    fn release_keeps_persistent_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.db");
        let store = FileStore::create(&path, PS, 2).unwrap();
        store.release().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn release_deletes_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scratch.db");
        let store = FileStore::create_temp(&path, PS, 2).unwrap();
        assert!(!store.is_persistent());
        store.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn sync_persists_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.db");

        {
            let mut store = FileStore::create(&path, PS, 2).unwrap();
            store.page_mut(0).unwrap()[50] = 0xBE;
            store.sync().unwrap();
        }

        let store = FileStore::open(&path, PS).unwrap();
        assert_eq!(store.page(0).unwrap()[50], 0xBE);
    }
}
