//! # Free-List Management
//!
//! This module implements free page tracking for cowkv. Reclaimed page
//! numbers are kept in a linked chain of pages inside the same file, so the
//! set of reusable pages survives restarts without any side structure.
//!
//! ## Chain Page Layout
//!
//! ```text
//! Offset  Size      Description
//! ------  --------  ----------------------------------------
//! 0       2         kind = FreeList
//! 2       2         size: number of pointers stored in this page
//! 4       8         total: reclaimable pointers across the chain
//!                   (maintained on the head page only)
//! 12      8         next: page number of the next chain page (0 = none)
//! 20      8*N       pointers
//! ```
//!
//! With 4 KiB pages each chain page stores (4096 - 20) / 8 = 509 pointers.
//!
//! ## Consumption and Rebuild
//!
//! Pointers are handed out newest-first: `get(n)` walks the chain and reads
//! from the top of the page it lands in. A flush then calls `update(popn,
//! freed)` once, which removes the `popn` pointers that were handed out and
//! pushes the batch of newly freed pages.
//!
//! `update` rebuilds the consumed prefix of the chain instead of editing it
//! in place. Every chain page it walks becomes free itself (it is about to
//! be replaced), and a few surviving pointers are harvested as `reuse`
//! hosts so the rebuilt chain can live on pages the list already owns.
//! Without that, pushing N frees could allocate new chain pages forever.
//!
//! ## Callers
//!
//! The free-list reads and writes pages through [`FreePageStore`]; it never
//! sees the mmap or the file. Chain pages are hosted on `reuse` pointers
//! via `write_at` when available and appended otherwise.

use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{FreePageStore, PageKind, PageNo, PageSource, PAGE_SIZE};

pub const FREE_LIST_HEADER_SIZE: usize = 20;
pub const FREE_LIST_CAP: usize = (PAGE_SIZE - FREE_LIST_HEADER_SIZE) / 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct ChainHeader {
    kind: U16,
    size: U16,
    total: U64,
    next: U64,
}

const _: () = assert!(std::mem::size_of::<ChainHeader>() == FREE_LIST_HEADER_SIZE);

/// A chain page held as an owned buffer while the list works on it.
struct ChainPage {
    data: Vec<u8>,
}

impl ChainPage {
    fn new(size: usize, next: PageNo) -> Self {
        let mut data = vec![0u8; PAGE_SIZE];
        let header = ChainHeader {
            kind: U16::new(PageKind::FreeList as u16),
            size: U16::new(size as u16),
            total: U64::new(0),
            next: U64::new(next),
        };
        data[..FREE_LIST_HEADER_SIZE].copy_from_slice(header.as_bytes());
        Self { data }
    }

    fn from_data(data: Vec<u8>) -> Self {
        let page = Self { data };
        assert_eq!(
            PageKind::from_u16(page.header().kind.get()),
            PageKind::FreeList,
            "page is not a free-list chain page"
        );
        page
    }

    fn header(&self) -> &ChainHeader {
        ChainHeader::ref_from_bytes(&self.data[..FREE_LIST_HEADER_SIZE]).unwrap()
    }

    fn header_mut(&mut self) -> &mut ChainHeader {
        ChainHeader::mut_from_bytes(&mut self.data[..FREE_LIST_HEADER_SIZE]).unwrap()
    }

    fn size(&self) -> usize {
        self.header().size.get() as usize
    }

    fn next(&self) -> PageNo {
        self.header().next.get()
    }

    fn total(&self) -> u64 {
        self.header().total.get()
    }

    fn set_total(&mut self, total: u64) {
        self.header_mut().total = U64::new(total);
    }

    fn ptr(&self, index: usize) -> PageNo {
        assert!(index < self.size());
        let offset = FREE_LIST_HEADER_SIZE + index * 8;
        u64::from_le_bytes(self.data[offset..offset + 8].try_into().unwrap())
    }

    fn set_ptr(&mut self, index: usize, ptr: PageNo) {
        assert!(index < self.size());
        let offset = FREE_LIST_HEADER_SIZE + index * 8;
        self.data[offset..offset + 8].copy_from_slice(&ptr.to_le_bytes());
    }
}

#[derive(Debug, Default)]
pub struct FreeList {
    head: PageNo,
}

impl FreeList {
    pub fn new() -> Self {
        Self { head: 0 }
    }

    pub fn head(&self) -> PageNo {
        self.head
    }

    pub fn set_head(&mut self, head: PageNo) {
        self.head = head;
    }

    /// Number of reclaimable pointers across the chain.
    pub fn total(&self, store: &impl PageSource) -> u64 {
        if self.head == 0 {
            return 0;
        }
        ChainPage::from_data(store.page(self.head)).total()
    }

    /// Returns the `topn`-th reclaimable pointer, newest first.
    pub fn get(&self, store: &impl PageSource, topn: u64) -> PageNo {
        assert!(topn < self.total(store));

        let mut topn = topn as usize;
        let mut node = ChainPage::from_data(store.page(self.head));
        while node.size() <= topn {
            topn -= node.size();
            let next = node.next();
            assert!(next != 0, "free-list chain shorter than its total");
            node = ChainPage::from_data(store.page(next));
        }
        node.ptr(node.size() - topn - 1)
    }

    /// Removes the first `popn` pointers (just handed out by `get`) and
    /// pushes the `freed` batch, rebuilding the consumed chain prefix.
    pub fn update(&mut self, store: &mut impl FreePageStore, popn: usize, mut freed: Vec<PageNo>) {
        let total0 = self.total(store);
        assert!(popn as u64 <= total0);
        if popn == 0 && freed.is_empty() {
            return;
        }

        // Walk the chain until the consumed pointers are gone and enough
        // reuse hosts are gathered for the rebuilt chain.
        let mut popn = popn;
        let mut total = total0 as usize;
        let mut reuse: Vec<PageNo> = Vec::new();
        while self.head != 0 && (popn > 0 || reuse.len() * FREE_LIST_CAP < freed.len()) {
            let node = ChainPage::from_data(store.page(self.head));
            freed.push(self.head);

            if popn >= node.size() {
                popn -= node.size();
            } else {
                let mut remain = node.size() - popn;
                popn = 0;

                while remain > 0 && reuse.len() * FREE_LIST_CAP < freed.len() + remain {
                    remain -= 1;
                    reuse.push(node.ptr(remain));
                }
                for i in 0..remain {
                    freed.push(node.ptr(i));
                }
            }

            total -= node.size();
            self.head = node.next();
        }
        assert!(reuse.len() * FREE_LIST_CAP >= freed.len() || self.head == 0);

        let new_total = (total + freed.len()) as u64;
        let leftover = self.push(store, freed, reuse);

        assert!(self.head != 0);
        let mut head = ChainPage::from_data(store.page(self.head));
        head.set_total(new_total + leftover as u64);
        store.write_at(self.head, head.data);
    }

    fn push(
        &mut self,
        store: &mut impl FreePageStore,
        mut freed: Vec<PageNo>,
        mut reuse: Vec<PageNo>,
    ) -> usize {
        let mut leftover = 0;
        while !freed.is_empty() || !reuse.is_empty() {
            if freed.is_empty() {
                // More hosts were harvested than the chain needs; the rest
                // rejoin the pool as ordinary free pointers.
                leftover += reuse.len();
                freed = std::mem::take(&mut reuse);
            }

            let size = freed.len().min(FREE_LIST_CAP);
            let mut node = ChainPage::new(size, self.head);
            for (i, ptr) in freed.drain(..size).enumerate() {
                node.set_ptr(i, ptr);
            }

            match reuse.pop() {
                Some(host) => {
                    self.head = host;
                    store.write_at(host, node.data);
                }
                None => {
                    self.head = store.append(node.data);
                }
            }
        }
        leftover
    }
}
