//! # B+Tree
//!
//! Ordered map over opaque page numbers. Two halves:
//!
//! - `node`: the in-page binary codec (header, child pointers, kv offset
//!   array, kv records) as pure byte manipulation.
//! - `tree`: the copy-on-write algorithms (lookup, insert with three-way
//!   split, delete with sibling merge), written against the storage
//!   capability traits so they never see the pager.
//!
//! Keys and values are opaque byte strings; keys compare lexicographically.

mod node;
mod tree;

pub use node::{Node, HEADER_SIZE, MAX_KEY_SIZE, MAX_VAL_SIZE};
pub use tree::BTree;
