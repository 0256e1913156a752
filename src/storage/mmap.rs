//! # Memory-Mapped File Storage
//!
//! This module implements `MmapStorage`, the chunked memory mapping behind
//! the pager. The file is mapped as a growing list of read-write shared
//! regions rather than a single remapped region, so a page slice handed out
//! earlier stays valid while the mapping grows.
//!
//! ## Chunked Growth
//!
//! The first chunk maps 64 MiB (doubled until it covers the file). When the
//! file outgrows the mapped total, an additional region the size of the
//! current total is mapped at the offset where the mapped range ends:
//!
//! ```text
//! chunk 0: file offset 0,        len T
//! chunk 1: file offset T,        len T      (total 2T)
//! chunk 2: file offset 2T,       len 2T     (total 4T)
//! ...
//! ```
//!
//! Locating a page walks the chunk list; the list stays logarithmic in the
//! file size, so the walk is short.
//!
//! ## File Backing
//!
//! A chunk may map farther than the file currently reaches. Before a new
//! chunk is mapped, the file is preallocated to cover the whole mapped
//! range, and every page access asserts that it lands below the
//! preallocated size. The pager extends the file before it touches any
//! appended page, so a fault on an unbacked address cannot occur.
//!
//! ## Preallocation
//!
//! File growth goes through `fallocate` on Linux so the pages exist on disk
//! without being written; other platforms fall back to `set_len`. Growth is
//! exponential-ish: increments of one eighth of the current size, at least
//! one page.

use std::fs::File;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::{MmapMut, MmapOptions};

use super::{PageNo, PAGE_SIZE};

/// Initial mapped length. Mapping is virtual address space, not memory, so
/// a generous default avoids growing the chunk list for small databases.
const DEFAULT_MMAP_SIZE: usize = 64 << 20;

#[derive(Debug)]
pub struct MmapStorage {
    file_size: u64,
    total: usize,
    chunks: Vec<MmapMut>,
}

impl MmapStorage {
    pub fn open(file: &File, file_size: u64, path: &Path) -> Result<Self> {
        Self::open_with_map_size(file, file_size, path, DEFAULT_MMAP_SIZE)
    }

    fn open_with_map_size(
        file: &File,
        file_size: u64,
        path: &Path,
        initial: usize,
    ) -> Result<Self> {
        ensure!(
            file_size % PAGE_SIZE as u64 == 0,
            "database file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            PAGE_SIZE
        );

        let mut map_size = initial;
        assert!(map_size % PAGE_SIZE == 0);
        while (map_size as u64) < file_size {
            map_size *= 2;
        }

        // SAFETY: map_mut is unsafe because a memory-mapped file can be
        // modified externally, invalidating Rust's aliasing assumptions.
        // This is safe because:
        // 1. The file is opened read-write by this store and is not meant to
        //    be touched by other processes while open.
        // 2. The chunk's lifetime is tied to MmapStorage; slices handed out
        //    borrow from &self/&mut self and cannot outlive the mapping.
        // 3. The mapped length may exceed the file, but page()/page_mut()
        //    assert every access lies below the preallocated file size.
        let chunk = unsafe {
            MmapOptions::new()
                .len(map_size)
                .map_mut(file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file_size,
            total: map_size,
            chunks: vec![chunk],
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn file_pages(&self) -> u64 {
        self.file_size / PAGE_SIZE as u64
    }

    pub fn page(&self, page_no: PageNo) -> &[u8] {
        let (chunk, offset) = self.locate(page_no);
        &self.chunks[chunk][offset..offset + PAGE_SIZE]
    }

    pub fn page_mut(&mut self, page_no: PageNo) -> &mut [u8] {
        let (chunk, offset) = self.locate(page_no);
        &mut self.chunks[chunk][offset..offset + PAGE_SIZE]
    }

    fn locate(&self, page_no: PageNo) -> (usize, usize) {
        assert!(
            (page_no + 1) * PAGE_SIZE as u64 <= self.file_size,
            "page {page_no} beyond file"
        );

        let mut start: u64 = 0;
        for (i, chunk) in self.chunks.iter().enumerate() {
            let end = start + (chunk.len() / PAGE_SIZE) as u64;
            if page_no < end {
                return (i, (page_no - start) as usize * PAGE_SIZE);
            }
            start = end;
        }
        panic!("page {page_no} beyond mapped region");
    }

    /// Grows the file (never the mapping) to hold at least `npages` pages.
    pub fn extend_file(&mut self, file: &File, npages: u64) -> Result<()> {
        let mut file_pages = self.file_size / PAGE_SIZE as u64;
        if file_pages >= npages {
            return Ok(());
        }

        while file_pages < npages {
            file_pages += (file_pages / 8).max(1);
        }

        let file_size = file_pages * PAGE_SIZE as u64;
        preallocate(file, file_size)?;
        self.file_size = file_size;
        Ok(())
    }

    /// Grows the mapping (and, to keep it fully file-backed, the file) to
    /// cover at least `npages` pages. Each new chunk doubles the total.
    pub fn extend(&mut self, file: &File, npages: u64) -> Result<()> {
        while (self.total as u64) < npages * PAGE_SIZE as u64 {
            let len = self.total;

            if self.file_size < (self.total + len) as u64 {
                preallocate(file, (self.total + len) as u64)?;
                self.file_size = (self.total + len) as u64;
            }

            // SAFETY: same argument as the initial mapping in
            // open_with_map_size; additionally the file was just
            // preallocated to total + len, so the whole region is backed.
            let chunk = unsafe {
                MmapOptions::new()
                    .offset(self.total as u64)
                    .len(len)
                    .map_mut(file)
                    .wrap_err("failed to memory-map additional region")?
            };

            self.total += len;
            self.chunks.push(chunk);
        }
        Ok(())
    }

    /// Hints the kernel to page in the first `npages` pages.
    pub fn prefetch(&self, npages: u64) {
        #[cfg(unix)]
        {
            let mut remaining = (npages * PAGE_SIZE as u64).min(self.file_size) as usize;
            for chunk in &self.chunks {
                if remaining == 0 {
                    break;
                }
                let len = remaining.min(chunk.len());
                // SAFETY: madvise with MADV_WILLNEED is advisory. The range
                // starts at the chunk base and is clamped to the chunk
                // length, so it stays inside a live mapping.
                unsafe {
                    libc::madvise(chunk.as_ptr() as *mut libc::c_void, len, libc::MADV_WILLNEED);
                }
                remaining -= len;
            }
        }
        #[cfg(not(unix))]
        let _ = npages;
    }
}

#[cfg(target_os = "linux")]
fn preallocate(file: &File, len: u64) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let ret = unsafe { libc::fallocate(file.as_raw_fd(), 0, 0, len as libc::off_t) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error())
            .wrap_err_with(|| format!("failed to preallocate {len} bytes"));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn preallocate(file: &File, len: u64) -> Result<()> {
    file.set_len(len)
        .wrap_err_with(|| format!("failed to preallocate {len} bytes"))
}
