//! # Copy-on-Write B+Tree
//!
//! This module implements the ordered map over pages: lookup, insert,
//! delete, node splitting and sibling merging. The tree owns nothing but
//! the root page number; every page access goes through the
//! [`PageAllocator`] capability, so the same code runs over the mmap-backed
//! pager and over an in-memory store in tests.
//!
//! ## Copy-on-Write Rewrites
//!
//! No page is ever modified in place. A mutation rewrites the whole
//! root-to-leaf path it touches:
//!
//! ```text
//! insert(k):
//!   new_root = rewrite(root)        old path pages released
//!   pieces   = split3(new_root)     1..3 page-sized outputs
//!   root     = pieces == 1 ? allocate(piece)
//!            : allocate(internal node over the pieces)
//! ```
//!
//! Rewrites build into `2 * PAGE_SIZE` scratch nodes so a single insert can
//! overflow before the split pass restores the one-page bound. Released
//! pages reach the free-list at the next flush; until then the old tree is
//! intact on disk, which is what makes the commit protocol atomic.
//!
//! ## Splitting
//!
//! An oversized node splits right-first: the right piece takes the longest
//! suffix of entries that fits a page, and a still-oversized left prefix
//! splits once more, yielding at most three pieces. Each piece's first key
//! becomes its separator in the parent.
//!
//! ## Merging
//!
//! After a delete rewrites a child, the parent considers merging it with a
//! sibling: only children at or below a quarter page are candidates, the
//! left sibling is preferred, and the merged node must fit a page. The
//! root collapses when an internal root is left with a single child.

use smallvec::{smallvec, SmallVec};

use super::node::{Node, HEADER_SIZE, MAX_KEY_SIZE, MAX_VAL_SIZE};
use crate::storage::{PageAllocator, PageKind, PageNo, PageSource, PAGE_SIZE};

#[derive(Debug, Default)]
pub struct BTree {
    root: PageNo,
}

impl BTree {
    pub fn new(root: PageNo) -> Self {
        Self { root }
    }

    pub fn root(&self) -> PageNo {
        self.root
    }

    pub fn set_root(&mut self, root: PageNo) {
        self.root = root;
    }

    pub fn get(&self, store: &impl PageSource, key: &[u8]) -> Option<Vec<u8>> {
        assert!(key.len() <= MAX_KEY_SIZE, "key over size limit");
        if self.root == 0 {
            return None;
        }

        let mut node = Node::from_data(store.page(self.root));
        loop {
            let index = node.lookup_le(key);
            match node.kind() {
                PageKind::Leaf => {
                    if node.key(index) == key {
                        return Some(node.value(index).to_vec());
                    }
                    return None;
                }
                PageKind::Internal => {
                    node = Node::from_data(store.page(node.ptr(index)));
                }
                PageKind::FreeList => panic!("free-list page reached during lookup"),
            }
        }
    }

    pub fn insert(&mut self, store: &mut impl PageAllocator, key: &[u8], value: &[u8]) {
        assert!(!key.is_empty(), "empty key");
        assert!(key.len() <= MAX_KEY_SIZE, "key over size limit");
        assert!(value.len() <= MAX_VAL_SIZE, "value over size limit");

        if self.root == 0 {
            // First insert: a leaf root holding the sentinel and the pair.
            // The sentinel keeps the leftmost separator equal to the empty
            // key for the life of the tree.
            let mut root = Node::new(PAGE_SIZE);
            root.set_header(PageKind::Leaf, 2);
            root.append_kv(0, 0, &[], &[]);
            root.append_kv(1, 0, key, value);
            self.root = store.allocate(root.into_data());
            return;
        }

        let node = Node::from_data(store.page(self.root));
        store.release(self.root);

        let node = tree_insert(store, node, key, value);
        let mut pieces = split3(node);
        if pieces.len() > 1 {
            // The old root overflowed; grow the tree by one level.
            let mut root = Node::new(PAGE_SIZE);
            root.set_header(PageKind::Internal, pieces.len());
            for (i, piece) in pieces.drain(..).enumerate() {
                let first = piece.key(0).to_vec();
                let ptr = store.allocate(piece.into_data());
                root.append_kv(i, ptr, &first, &[]);
            }
            self.root = store.allocate(root.into_data());
        } else {
            self.root = store.allocate(pieces.pop().unwrap().into_data());
        }
    }

    /// Returns whether the key was present.
    pub fn delete(&mut self, store: &mut impl PageAllocator, key: &[u8]) -> bool {
        assert!(!key.is_empty(), "empty key");
        assert!(key.len() <= MAX_KEY_SIZE, "key over size limit");
        if self.root == 0 {
            return false;
        }

        let root = Node::from_data(store.page(self.root));
        let Some(updated) = tree_delete(store, root, key) else {
            return false;
        };

        store.release(self.root);
        if updated.kind() == PageKind::Internal && updated.nkeys() == 1 {
            // Height reduction: an internal root with one child is that
            // child.
            self.root = updated.ptr(0);
        } else if updated.kind() == PageKind::Internal && updated.nkeys() == 0 {
            self.root = 0;
        } else {
            self.root = store.allocate(updated.into_data());
        }
        true
    }
}

/// Rewrites the subtree under `node` with `key` set to `value`. The result
/// may exceed one page; the caller splits it.
fn tree_insert(store: &mut impl PageAllocator, node: Node, key: &[u8], value: &[u8]) -> Node {
    let mut new = Node::new(2 * PAGE_SIZE);
    let index = node.lookup_le(key);

    match node.kind() {
        PageKind::Leaf => {
            if node.key(index) == key {
                leaf_update(&mut new, &node, index, key, value);
            } else {
                leaf_insert(&mut new, &node, index + 1, key, value);
            }
        }
        PageKind::Internal => {
            node_insert(store, &mut new, &node, index, key, value);
        }
        PageKind::FreeList => panic!("free-list page reached during insert"),
    }
    new
}

/// Rewrites the subtree under `node` with `key` removed. `None` means the
/// key was absent and nothing changed.
fn tree_delete(store: &mut impl PageAllocator, node: Node, key: &[u8]) -> Option<Node> {
    let index = node.lookup_le(key);

    match node.kind() {
        PageKind::Leaf => {
            if node.key(index) != key {
                return None;
            }
            let mut new = Node::new(PAGE_SIZE);
            leaf_delete(&mut new, &node, index);
            Some(new)
        }
        PageKind::Internal => node_delete(store, &node, index, key),
        PageKind::FreeList => panic!("free-list page reached during delete"),
    }
}

fn leaf_insert(new: &mut Node, old: &Node, index: usize, key: &[u8], value: &[u8]) {
    new.set_header(PageKind::Leaf, old.nkeys() + 1);
    new.append_range(old, 0, 0, index);
    new.append_kv(index, 0, key, value);
    new.append_range(old, index + 1, index, old.nkeys() - index);
}

fn leaf_update(new: &mut Node, old: &Node, index: usize, key: &[u8], value: &[u8]) {
    new.set_header(PageKind::Leaf, old.nkeys());
    new.append_range(old, 0, 0, index);
    new.append_kv(index, 0, key, value);
    new.append_range(old, index + 1, index + 1, old.nkeys() - index - 1);
}

fn leaf_delete(new: &mut Node, old: &Node, index: usize) {
    new.set_header(PageKind::Leaf, old.nkeys() - 1);
    new.append_range(old, 0, 0, index);
    new.append_range(old, index, index + 1, old.nkeys() - (index + 1));
}

/// Insert descending through an internal node: rewrite the target child,
/// split it, and replace its entry with the pieces.
fn node_insert(
    store: &mut impl PageAllocator,
    new: &mut Node,
    node: &Node,
    index: usize,
    key: &[u8],
    value: &[u8],
) {
    let kptr = node.ptr(index);
    let child = Node::from_data(store.page(kptr));
    store.release(kptr);

    let child = tree_insert(store, child, key, value);
    let pieces = split3(child);
    replace_children(store, new, node, index, pieces);
}

/// Delete descending through an internal node, merging the rewritten child
/// with a sibling when it has shrunk enough.
fn node_delete(
    store: &mut impl PageAllocator,
    node: &Node,
    index: usize,
    key: &[u8],
) -> Option<Node> {
    let kptr = node.ptr(index);
    let child = Node::from_data(store.page(kptr));
    let updated = tree_delete(store, child, key)?;
    store.release(kptr);

    let mut new = Node::new(PAGE_SIZE);
    match sibling_for_merge(store, node, index, &updated) {
        MergeSibling::Left(sibling) => {
            let merged = merge_nodes(&sibling, &updated);
            let first = merged.key(0).to_vec();
            store.release(node.ptr(index - 1));
            let ptr = store.allocate(merged.into_data());
            replace_two_children(&mut new, node, index - 1, ptr, &first);
        }
        MergeSibling::Right(sibling) => {
            let merged = merge_nodes(&updated, &sibling);
            let first = merged.key(0).to_vec();
            store.release(node.ptr(index + 1));
            let ptr = store.allocate(merged.into_data());
            replace_two_children(&mut new, node, index, ptr, &first);
        }
        MergeSibling::None => {
            if updated.nkeys() == 0 {
                // The child emptied and no sibling exists to absorb it:
                // only possible for a lone child, so the parent empties too.
                assert!(node.nkeys() == 1 && index == 0);
                new.set_header(PageKind::Internal, 0);
            } else {
                replace_children(store, &mut new, node, index, smallvec![updated]);
            }
        }
    }
    Some(new)
}

enum MergeSibling {
    None,
    Left(Node),
    Right(Node),
}

/// Merge policy: a child at or below a quarter page merges with the first
/// adjacent sibling the combined node would still fit next to, left first.
fn sibling_for_merge(
    store: &impl PageSource,
    node: &Node,
    index: usize,
    updated: &Node,
) -> MergeSibling {
    if updated.nbytes() > PAGE_SIZE / 4 {
        return MergeSibling::None;
    }

    if index > 0 {
        let sibling = Node::from_data(store.page(node.ptr(index - 1)));
        if sibling.nbytes() + updated.nbytes() - HEADER_SIZE < PAGE_SIZE {
            return MergeSibling::Left(sibling);
        }
    }
    if index + 1 < node.nkeys() {
        let sibling = Node::from_data(store.page(node.ptr(index + 1)));
        if sibling.nbytes() + updated.nbytes() - HEADER_SIZE < PAGE_SIZE {
            return MergeSibling::Right(sibling);
        }
    }
    MergeSibling::None
}

fn merge_nodes(left: &Node, right: &Node) -> Node {
    let mut new = Node::new(PAGE_SIZE);
    new.set_header(left.kind(), left.nkeys() + right.nkeys());
    new.append_range(left, 0, 0, left.nkeys());
    new.append_range(right, left.nkeys(), 0, right.nkeys());
    new
}

/// Replaces entry `index` of `old` with one entry per split piece, each
/// keyed by the piece's own first key.
fn replace_children(
    store: &mut impl PageAllocator,
    new: &mut Node,
    old: &Node,
    index: usize,
    pieces: SmallVec<[Node; 3]>,
) {
    let n = pieces.len();
    new.set_header(PageKind::Internal, old.nkeys() + n - 1);
    new.append_range(old, 0, 0, index);
    for (i, piece) in pieces.into_iter().enumerate() {
        let first = piece.key(0).to_vec();
        let ptr = store.allocate(piece.into_data());
        new.append_kv(index + i, ptr, &first, &[]);
    }
    new.append_range(old, index + n, index + 1, old.nkeys() - (index + 1));
}

/// Replaces the two adjacent entries at `index` with a single entry for the
/// merged child.
fn replace_two_children(new: &mut Node, old: &Node, index: usize, ptr: PageNo, key: &[u8]) {
    new.set_header(old.kind(), old.nkeys() - 1);
    new.append_range(old, 0, 0, index);
    new.append_kv(index, ptr, key, &[]);
    new.append_range(old, index + 1, index + 2, old.nkeys() - index - 2);
}

/// Splits an oversized node in two. The right piece takes the longest
/// entry suffix that fits one page; the left keeps the rest and may still
/// be oversized.
fn split2(old: &Node) -> (Node, Node) {
    let n = old.nkeys();
    assert!(n >= 2, "cannot split a node with {n} entries");

    // Walk from the last entry leftward while the right piece still fits.
    let mut split = n - 1;
    while split > 1 {
        let candidate = split - 1;
        let right_bytes =
            HEADER_SIZE + (n - candidate) * 10 + (old.offset(n) - old.offset(candidate));
        if right_bytes > PAGE_SIZE {
            break;
        }
        split = candidate;
    }

    let mut left = Node::new(2 * PAGE_SIZE);
    left.set_header(old.kind(), split);
    left.append_range(old, 0, 0, split);

    let mut right = Node::new(PAGE_SIZE);
    right.set_header(old.kind(), n - split);
    right.append_range(old, 0, split, n - split);
    assert!(right.nbytes() <= PAGE_SIZE);

    (left, right)
}

/// Splits a rewritten node into one, two, or three page-sized pieces.
fn split3(mut node: Node) -> SmallVec<[Node; 3]> {
    if node.nbytes() <= PAGE_SIZE {
        node.truncate_to_page();
        return smallvec![node];
    }

    let (mut left, right) = split2(&node);
    if left.nbytes() <= PAGE_SIZE {
        left.truncate_to_page();
        return smallvec![left, right];
    }

    let (mut leftleft, middle) = split2(&left);
    assert!(leftleft.nbytes() <= PAGE_SIZE);
    leftleft.truncate_to_page();
    smallvec![leftleft, middle, right]
}
