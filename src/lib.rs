//! # cowkv: Embedded Copy-on-Write Key-Value Store
//!
//! cowkv is an embedded, single-file, persistent ordered key–value store.
//! Keys and values are opaque byte strings; every acknowledged write is
//! durable before the call returns.
//!
//! ## Quick Start
//!
//! ```ignore
//! use cowkv::Database;
//!
//! let mut db = Database::open("./data.db")?;
//! db.set(b"dog1", b"qwe")?;
//! assert_eq!(db.get(b"dog1"), Some(b"qwe".to_vec()));
//! db.del(b"dog1")?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │        Public API (Database)         │
//! ├──────────────────────────────────────┤
//! │  Pager + two-fsync commit protocol   │
//! ├──────────────────┬───────────────────┤
//! │ Copy-on-write    │  Persistent       │
//! │ B+tree           │  free-list        │
//! ├──────────────────┴───────────────────┤
//! │   Node codec (in-page layout)        │
//! ├──────────────────────────────────────┤
//! │ Memory-mapped file + master page     │
//! └──────────────────────────────────────┘
//! ```
//!
//! Mutations never touch committed pages: the affected root-to-leaf path
//! is rewritten onto fresh pages, the displaced pages are fed to the
//! free-list, and a master-page rewrite between two fsyncs atomically
//! switches the file to the new tree. A crash at any point leaves the
//! previous committed state intact.
//!
//! ## Module Overview
//!
//! - [`db`]: the `Database` type: open/get/set/del, pager, durability
//! - [`btree`]: copy-on-write B+tree and its in-page node codec
//! - [`storage`]: memory-mapped file, master page, free-list
//!
//! ## Concurrency
//!
//! Single-writer, single-threaded by design: no locks, no background
//! threads, no suspension points inside a call. Hosts that need sharing
//! wrap the store in their own synchronization.

pub mod btree;
pub mod db;
pub mod storage;

pub use btree::{MAX_KEY_SIZE, MAX_VAL_SIZE};
pub use db::Database;
pub use storage::PAGE_SIZE;
