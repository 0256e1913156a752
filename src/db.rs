//! # Database
//!
//! This module ties the store together: the public open/get/set/del
//! surface, the pager that stages copy-on-write pages in memory, and the
//! two-fsync commit protocol that makes every acknowledged write durable.
//!
//! ## Pager
//!
//! Between a mutation and its flush, new and dead pages live only in the
//! `updates` map: page number to `Some(bytes)` for a pending page, `None`
//! for a tombstone. Reads prefer the map and fall through to the mapping,
//! so the tree always sees the batch it is building. Allocation prefers
//! the free-list (`nfree` counts pointers handed out this batch) and
//! appends past `flushed + nappend` otherwise; free-list chain pages are
//! always appended.
//!
//! ## Commit Protocol
//!
//! ```text
//! set/del:
//!   1. rewrite the tree path in memory          (updates grows)
//!   2. free-list update with the tombstones     (may add chain pages)
//!   3. extend file, extend mapping
//!   4. copy pending pages into the mapping
//!   5. fsync                                    -- barrier #1
//!   6. advance flushed, clear the batch
//!   7. rewrite the master page (positional write, not the mapping)
//!   8. fsync                                    -- barrier #2
//! ```
//!
//! A crash before step 8 leaves the previous master in effect: the pages
//! written in step 4 sit beyond the old `used` or on free pages the old
//! free-list still owns, so the previous tree is untouched. A crash after
//! step 8 commits the new state. The master page is the only torn-write
//! site the design accepts, which is why it is written directly rather
//! than through the mapping.
//!
//! ## Failure Recovery
//!
//! When a flush fails, the in-memory batch is rolled back: root, free-list
//! head, and high-water mark return to the last committed state and the
//! pending pages are dropped, so the store stays aligned with the on-disk
//! master and remains usable.
//!
//! ## Concurrency
//!
//! Single-writer, single-threaded. `set` and `del` take `&mut self` and
//! run to completion; the host serializes callers.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use zerocopy::IntoBytes;

use crate::btree::BTree;
use crate::storage::{
    FreeList, FreePageStore, MasterPage, MmapStorage, PageAllocator, PageNo, PageSource, PAGE_SIZE,
};

/// In-flight page state between two flushes.
#[derive(Debug)]
struct Pager {
    file: File,
    mmap: MmapStorage,
    /// Pages committed as of the last flush; the next append lands here.
    flushed: u64,
    /// Free-list pointers handed out in the current batch.
    nfree: usize,
    /// Pages appended in the current batch.
    nappend: usize,
    /// Pending pages (`Some`) and tombstones (`None`).
    updates: HashMap<PageNo, Option<Vec<u8>>>,
}

impl PageSource for Pager {
    fn page(&self, page_no: PageNo) -> Vec<u8> {
        if let Some(entry) = self.updates.get(&page_no) {
            return entry
                .as_ref()
                .expect("read of a page freed in this batch")
                .clone();
        }
        self.mmap.page(page_no).to_vec()
    }
}

impl FreePageStore for Pager {
    fn append(&mut self, page: Vec<u8>) -> PageNo {
        assert!(page.len() <= PAGE_SIZE);
        let page_no = self.flushed + self.nappend as u64;
        self.nappend += 1;
        self.updates.insert(page_no, Some(page));
        page_no
    }

    fn write_at(&mut self, page_no: PageNo, page: Vec<u8>) {
        assert!(page.len() <= PAGE_SIZE);
        self.updates.insert(page_no, Some(page));
    }
}

/// The tree's allocation surface: a pager plus read access to the
/// free-list so new pages can reuse reclaimed numbers.
struct TreePages<'a> {
    pager: &'a mut Pager,
    free: &'a FreeList,
}

impl PageSource for TreePages<'_> {
    fn page(&self, page_no: PageNo) -> Vec<u8> {
        self.pager.page(page_no)
    }
}

impl PageAllocator for TreePages<'_> {
    fn allocate(&mut self, page: Vec<u8>) -> PageNo {
        assert!(page.len() <= PAGE_SIZE);
        let page_no = if (self.pager.nfree as u64) < self.free.total(self.pager) {
            let ptr = self.free.get(self.pager, self.pager.nfree as u64);
            self.pager.nfree += 1;
            ptr
        } else {
            let ptr = self.pager.flushed + self.pager.nappend as u64;
            self.pager.nappend += 1;
            ptr
        };
        self.pager.updates.insert(page_no, Some(page));
        page_no
    }

    fn release(&mut self, page_no: PageNo) {
        assert!(page_no != 0, "releasing the master page");
        self.pager.updates.insert(page_no, None);
    }
}

#[derive(Debug)]
pub struct Database {
    path: PathBuf,
    pager: Pager,
    tree: BTree,
    free: FreeList,
}

impl Database {
    /// Opens or creates the database file at `path` and loads the last
    /// committed state from the master page.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?
            .len();

        let mmap = MmapStorage::open(&file, file_size, &path)?;

        let mut db = Self {
            path,
            pager: Pager {
                file,
                mmap,
                flushed: 0,
                nfree: 0,
                nappend: 0,
                updates: HashMap::new(),
            },
            tree: BTree::default(),
            free: FreeList::new(),
        };
        db.load_master()?;
        db.pager.mmap.prefetch(db.pager.flushed);
        Ok(db)
    }

    fn load_master(&mut self) -> Result<()> {
        if self.pager.mmap.file_size() == 0 {
            // Fresh file: reserve page 0 for the master.
            self.pager.flushed = 1;
            return Ok(());
        }

        let page0 = self.pager.mmap.page(0);
        let master = MasterPage::load(page0, self.pager.mmap.file_pages())
            .wrap_err_with(|| format!("failed to load '{}'", self.path.display()))?;

        self.tree.set_root(master.root());
        self.pager.flushed = master.used();
        self.free.set_head(master.free_head());
        Ok(())
    }

    /// Unmaps the file and closes it. Dropping the store has the same
    /// effect; this form just makes the end of its life explicit.
    pub fn close(self) {}

    /// Point lookup. The returned bytes are an owned copy and stay valid
    /// across later mutations.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.tree.get(&self.pager, key)
    }

    /// Inserts or updates a pair and flushes before returning. The value
    /// may be empty; the key must not be.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let snapshot = self.snapshot();
        {
            let mut pages = TreePages {
                pager: &mut self.pager,
                free: &self.free,
            };
            self.tree.insert(&mut pages, key, value);
        }
        self.flush_or_revert(snapshot)
    }

    /// Removes a key and flushes before returning. Returns whether the key
    /// was present.
    pub fn del(&mut self, key: &[u8]) -> Result<bool> {
        let snapshot = self.snapshot();
        let deleted = {
            let mut pages = TreePages {
                pager: &mut self.pager,
                free: &self.free,
            };
            self.tree.delete(&mut pages, key)
        };
        self.flush_or_revert(snapshot)?;
        Ok(deleted)
    }

    fn snapshot(&self) -> (PageNo, PageNo, u64) {
        (self.tree.root(), self.free.head(), self.pager.flushed)
    }

    fn flush_or_revert(&mut self, snapshot: (PageNo, PageNo, u64)) -> Result<()> {
        match self.write_pages().and_then(|_| self.sync_pages()) {
            Ok(()) => Ok(()),
            Err(err) => {
                let (root, free_head, flushed) = snapshot;
                self.tree.set_root(root);
                self.free.set_head(free_head);
                self.pager.flushed = flushed;
                self.pager.nfree = 0;
                self.pager.nappend = 0;
                self.pager.updates.clear();
                Err(err)
            }
        }
    }

    /// Stages the batch into the mapping: free-list update, file and
    /// mapping growth, then the page copies.
    fn write_pages(&mut self) -> Result<()> {
        let freed: Vec<PageNo> = self
            .pager
            .updates
            .iter()
            .filter(|(_, page)| page.is_none())
            .map(|(&page_no, _)| page_no)
            .collect();
        let popn = self.pager.nfree;
        self.free.update(&mut self.pager, popn, freed);

        let npages = self.pager.flushed + self.pager.nappend as u64;
        self.pager.mmap.extend_file(&self.pager.file, npages)?;
        self.pager.mmap.extend(&self.pager.file, npages)?;

        for (&page_no, page) in &self.pager.updates {
            if let Some(page) = page {
                self.pager.mmap.page_mut(page_no)[..page.len()].copy_from_slice(page);
            }
        }
        Ok(())
    }

    /// The two-fsync commit: data barrier, master rewrite, master barrier.
    fn sync_pages(&mut self) -> Result<()> {
        self.pager
            .file
            .sync_all()
            .wrap_err("failed to fsync data pages")?;

        self.pager.flushed += self.pager.nappend as u64;
        self.pager.nfree = 0;
        self.pager.nappend = 0;
        self.pager.updates.clear();

        self.write_master()?;
        self.pager
            .file
            .sync_all()
            .wrap_err("failed to fsync master page")?;
        Ok(())
    }

    fn write_master(&mut self) -> Result<()> {
        let master = MasterPage::new(self.tree.root(), self.pager.flushed, self.free.head());

        self.pager
            .file
            .seek(SeekFrom::Start(0))
            .wrap_err("failed to seek to master page")?;
        self.pager
            .file
            .write_all(master.as_bytes())
            .wrap_err("failed to write master page")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::Node;
    use crate::storage::PageKind;

    fn create_test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn set_then_get_round_trips() {
        let (_dir, mut db) = create_test_db();

        db.set(b"dog1", b"qwe").unwrap();
        db.set(b"dog2", b"req").unwrap();

        assert_eq!(db.get(b"dog1"), Some(b"qwe".to_vec()));
        assert_eq!(db.get(b"dog2"), Some(b"req".to_vec()));
        assert_eq!(db.get(b"cat"), None);
    }

    #[test]
    fn last_write_wins() {
        let (_dir, mut db) = create_test_db();

        db.set(b"k", b"one").unwrap();
        db.set(b"k", b"two").unwrap();
        db.set(b"k", b"three").unwrap();

        assert_eq!(db.get(b"k"), Some(b"three".to_vec()));
    }

    #[test]
    fn empty_value_is_storable() {
        let (_dir, mut db) = create_test_db();

        db.set(b"k", b"").unwrap();

        assert_eq!(db.get(b"k"), Some(Vec::new()));
    }

    #[test]
    fn get_of_empty_key_finds_the_leaf_sentinel() {
        let (_dir, mut db) = create_test_db();

        // Empty tree: nothing to land on.
        assert_eq!(db.get(b""), None);

        // Non-empty tree: lookup_le lands on the sentinel entry, whose
        // value is empty.
        db.set(b"k", b"v").unwrap();
        assert_eq!(db.get(b""), Some(Vec::new()));
    }

    #[test]
    fn del_reports_presence() {
        let (_dir, mut db) = create_test_db();
        db.set(b"k", b"v").unwrap();

        assert!(db.del(b"k").unwrap());
        assert!(!db.del(b"k").unwrap());
        assert_eq!(db.get(b"k"), None);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let mut db = Database::open(&path).unwrap();
            db.set(b"alpha", b"1").unwrap();
            db.set(b"bravo", b"2").unwrap();
            db.del(b"alpha").unwrap();
            db.close();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.get(b"alpha"), None);
        assert_eq!(db.get(b"bravo"), Some(b"2".to_vec()));
    }

    #[test]
    fn split_through_the_public_surface() {
        let (_dir, mut db) = create_test_db();

        db.set(b"a", &[0xAA; crate::btree::MAX_VAL_SIZE]).unwrap();
        assert_eq!(tree_height(&db), 1);

        db.set(b"b", &[0xBB; crate::btree::MAX_VAL_SIZE]).unwrap();

        assert_eq!(tree_height(&db), 2);
        assert_eq!(db.get(b"a"), Some(vec![0xAA; crate::btree::MAX_VAL_SIZE]));
        assert_eq!(db.get(b"b"), Some(vec![0xBB; crate::btree::MAX_VAL_SIZE]));
    }

    #[test]
    fn freed_pages_bound_file_growth() {
        let (_dir, mut db) = create_test_db();
        let keys: Vec<String> = (0..40).map(|i| format!("key{i:03}")).collect();

        for key in &keys {
            db.set(key.as_bytes(), &[b'x'; 1500]).unwrap();
        }
        for key in &keys {
            assert!(db.del(key.as_bytes()).unwrap());
        }
        let flushed_after_first_round = db.pager.flushed;

        for key in &keys {
            db.set(key.as_bytes(), &[b'x'; 1500]).unwrap();
        }

        // The second round must be served almost entirely from reclaimed
        // pages; a small margin covers free-list chain churn.
        assert!(
            db.pager.flushed <= flushed_after_first_round + 8,
            "file grew from {} to {} pages despite reuse",
            flushed_after_first_round,
            db.pager.flushed
        );
    }

    #[test]
    fn every_flush_conserves_page_accounting() {
        let (_dir, mut db) = create_test_db();

        for i in 0..120u32 {
            let key = format!("key{i:04}");
            db.set(key.as_bytes(), &[b'v'; 300]).unwrap();
            assert_page_conservation(&db);
        }
        for i in (0..120u32).step_by(2) {
            let key = format!("key{i:04}");
            db.del(key.as_bytes()).unwrap();
            assert_page_conservation(&db);
        }
    }

    #[test]
    fn no_page_is_both_free_and_reachable() {
        let (_dir, mut db) = create_test_db();

        for i in 0..80u32 {
            db.set(format!("key{i:03}").as_bytes(), &[b'v'; 500]).unwrap();
        }
        for i in (0..80u32).step_by(3) {
            db.del(format!("key{i:03}").as_bytes()).unwrap();
        }

        let mut tree_pages = Vec::new();
        collect_tree_pages(&db, db.tree.root(), &mut tree_pages);
        let free_pages: Vec<PageNo> = (0..db.free.total(&db.pager))
            .map(|n| db.free.get(&db.pager, n))
            .collect();

        for page_no in &free_pages {
            assert!(
                !tree_pages.contains(page_no),
                "page {page_no} is both free and reachable"
            );
        }
    }

    fn tree_height(db: &Database) -> usize {
        let mut height = 0;
        let mut page_no = db.tree.root();
        while page_no != 0 {
            let node = Node::from_data(db.pager.page(page_no));
            height += 1;
            match node.kind() {
                PageKind::Leaf => break,
                PageKind::Internal => page_no = node.ptr(0),
                PageKind::FreeList => panic!("free-list page in tree"),
            }
        }
        height
    }

    fn collect_tree_pages(db: &Database, page_no: PageNo, pages: &mut Vec<PageNo>) {
        if page_no == 0 {
            return;
        }
        pages.push(page_no);
        let node = Node::from_data(db.pager.page(page_no));
        if node.kind() == PageKind::Internal {
            for i in 0..node.nkeys() {
                collect_tree_pages(db, node.ptr(i), pages);
            }
        }
    }

    fn chain_page_count(db: &Database) -> u64 {
        let mut count = 0;
        let mut page_no = db.free.head();
        while page_no != 0 {
            count += 1;
            let page = db.pager.page(page_no);
            page_no = u64::from_le_bytes(page[12..20].try_into().unwrap());
        }
        count
    }

    fn assert_page_conservation(db: &Database) {
        let mut tree_pages = Vec::new();
        collect_tree_pages(db, db.tree.root(), &mut tree_pages);
        let accounted =
            db.free.total(&db.pager) + tree_pages.len() as u64 + chain_page_count(db);
        assert_eq!(
            accounted,
            db.pager.flushed - 1,
            "page accounting drifted: {} free + {} tree + {} chain != {} - 1",
            db.free.total(&db.pager),
            tree_pages.len(),
            chain_page_count(db),
            db.pager.flushed
        );
    }
}
