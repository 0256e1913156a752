//! # Master Page
//!
//! Page 0 of the database file anchors every committed state. Its first 40
//! bytes hold a fixed header; the rest of the page is unused.
//!
//! ## Layout
//!
//! ```text
//! Offset  Size  Field       Description
//! ------  ----  ---------   ----------------------------------------
//! 0       16    signature   ASCII "1616161616161616"
//! 16      8     root        B+tree root page number (0 = empty tree)
//! 24      8     used        Pages logically in use (file high-water)
//! 32      8     free_head   Head of the free-list chain (0 = empty)
//! ```
//!
//! All multi-byte fields are little-endian; the zerocopy `U64<LittleEndian>`
//! field type handles conversion regardless of host byte order.
//!
//! ## Commit Role
//!
//! The master page is rewritten through a direct positional file write,
//! never through the mapping, as the last step of the two-fsync commit. A
//! crash before that write leaves the previous master, and therefore the
//! previous consistent tree and free-list, in effect.

use eyre::{ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::PageNo;

/// Signature occupying the first 16 bytes of every valid database file.
pub const DB_SIGNATURE: &[u8; 16] = b"1616161616161616";

pub const MASTER_PAGE_SIZE: usize = 40;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MasterPage {
    signature: [u8; 16],
    root: U64,
    used: U64,
    free_head: U64,
}

const _: () = assert!(std::mem::size_of::<MasterPage>() == MASTER_PAGE_SIZE);

impl MasterPage {
    pub fn new(root: PageNo, used: u64, free_head: PageNo) -> Self {
        Self {
            signature: *DB_SIGNATURE,
            root: U64::new(root),
            used: U64::new(used),
            free_head: U64::new(free_head),
        }
    }

    /// Parses and validates a master page against the current file size.
    ///
    /// `file_pages` is the number of whole pages the file holds; `used` must
    /// stay within it and the root must lie below `used`.
    pub fn load(bytes: &[u8], file_pages: u64) -> Result<&Self> {
        ensure!(
            bytes.len() >= MASTER_PAGE_SIZE,
            "buffer too small for master page: {} < {}",
            bytes.len(),
            MASTER_PAGE_SIZE
        );

        let master = Self::ref_from_bytes(&bytes[..MASTER_PAGE_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse master page: {:?}", e))?;

        ensure!(&master.signature == DB_SIGNATURE, "bad database signature");

        let used = master.used.get();
        let root = master.root.get();
        ensure!(
            used >= 1 && used <= file_pages,
            "bad master page: used {} outside 1..={}",
            used,
            file_pages
        );
        ensure!(
            root < used,
            "bad master page: root {} not below used {}",
            root,
            used
        );

        Ok(master)
    }

    pub fn root(&self) -> PageNo {
        self.root.get()
    }

    pub fn used(&self) -> u64 {
        self.used.get()
    }

    pub fn free_head(&self) -> PageNo {
        self.free_head.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn master_page_is_40_bytes() {
        assert_eq!(std::mem::size_of::<MasterPage>(), 40);
    }

    #[test]
    fn master_page_round_trips_through_bytes() {
        let master = MasterPage::new(3, 7, 5);

        let loaded = MasterPage::load(master.as_bytes(), 8).unwrap();

        assert_eq!(loaded.root(), 3);
        assert_eq!(loaded.used(), 7);
        assert_eq!(loaded.free_head(), 5);
    }

    #[test]
    fn master_page_fields_are_little_endian() {
        let master = MasterPage::new(0x0102, 2, 0);
        let bytes = master.as_bytes();

        assert_eq!(&bytes[..16], DB_SIGNATURE);
        assert_eq!(bytes[16], 0x02);
        assert_eq!(bytes[17], 0x01);
    }

    #[test]
    fn load_rejects_wrong_signature() {
        let mut bytes = MasterPage::new(1, 2, 0).as_bytes().to_vec();
        bytes[0] = b'x';

        let err = MasterPage::load(&bytes, 4).unwrap_err();

        assert!(err.to_string().contains("bad database signature"));
    }

    #[test]
    fn load_rejects_used_beyond_file() {
        let master = MasterPage::new(1, 9, 0);

        let err = MasterPage::load(master.as_bytes(), 4).unwrap_err();

        assert!(err.to_string().contains("bad master page"));
    }

    #[test]
    fn load_rejects_zero_used() {
        let master = MasterPage::new(0, 0, 0);

        let err = MasterPage::load(master.as_bytes(), 4).unwrap_err();

        assert!(err.to_string().contains("bad master page"));
    }

    #[test]
    fn load_rejects_root_at_or_beyond_used() {
        let master = MasterPage::new(2, 2, 0);

        let err = MasterPage::load(master.as_bytes(), 4).unwrap_err();

        assert!(err.to_string().contains("root 2 not below used 2"));
    }
}
