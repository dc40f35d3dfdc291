//! Interior (routing) nodes.
//!
//! An [`InteriorNode`] holds up to 15 separator slices and 16 children.
//! `child[0]` covers slices below `ikey[0]`; `child[i]` covers
//! `ikey[i - 1] <= x < ikey[i]`. Children are erased node pointers.
//!
//! Readers go through [`InteriorNode::descend`] inside a version-validated
//! snapshot. Every mutating method takes the node's [`LockGuard`] as proof the
//! lock is held.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicU64};

use crate::node::{NodeBase, base};
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::version::LockGuard;

/// Separator slots per interior node.
pub const INTERIOR_WIDTH: usize = 15;

/// Keys kept by the left node of an interior split. The next key moves up.
const LEFT_KEYS_AFTER_SPLIT: usize = 8;

/// A routing node of one layer.
#[derive(Debug)]
#[repr(C)]
pub struct InteriorNode {
    base: NodeBase,
    nkeys: AtomicU8,
    ikeys: [AtomicU64; INTERIOR_WIDTH],
    children: [AtomicPtr<u8>; INTERIOR_WIDTH + 1],
}

impl Default for InteriorNode {
    fn default() -> Self {
        Self::new()
    }
}

impl InteriorNode {
    /// An empty, unlinked interior node.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: NodeBase::new(false),
            nkeys: AtomicU8::new(0),
            ikeys: std::array::from_fn(|_| AtomicU64::new(0)),
            children: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// A new layer root routing `separator` between `left` and `right`.
    ///
    /// The children's parent links are left to the caller, which holds their locks.
    #[must_use]
    pub fn new_root(left: *mut u8, separator: u64, right: *mut u8) -> Self {
        let node = Self::new();
        node.version_word().mark_root();
        node.nkeys.store(1, RELAXED);
        node.ikeys[0].store(separator, RELAXED);
        node.children[0].store(left, RELAXED);
        node.children[1].store(right, RELAXED);
        node
    }

    /// Node header.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> &NodeBase {
        &self.base
    }

    #[inline]
    fn version_word(&self) -> &crate::version::VersionWord {
        self.base.version()
    }

    /// Number of separators.
    #[inline]
    #[must_use]
    pub fn nkeys(&self) -> usize {
        usize::from(self.nkeys.load(READ_ORD))
    }

    /// No room for another separator?
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.nkeys() == INTERIOR_WIDTH
    }

    /// Separator `i`.
    #[inline]
    #[must_use]
    pub fn ikey(&self, i: usize) -> u64 {
        self.ikeys[i].load(RELAXED)
    }

    /// Child `i`.
    #[inline]
    #[must_use]
    pub fn child(&self, i: usize) -> *mut u8 {
        self.children[i].load(READ_ORD)
    }

    /// Index of the child covering `ikey`: the number of separators `<= ikey`.
    #[must_use]
    pub fn upper_bound(&self, ikey: u64) -> usize {
        let n: usize = self.nkeys().min(INTERIOR_WIDTH);
        let (mut lo, mut hi) = (0usize, n);

        while lo < hi {
            let mid: usize = lo + (hi - lo) / 2;

            if self.ikey(mid) <= ikey {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        lo
    }

    /// Child covering `ikey`. Only meaningful inside a validated snapshot.
    #[inline]
    #[must_use]
    pub fn descend(&self, ikey: u64) -> *mut u8 {
        self.child(self.upper_bound(ikey))
    }

    /// Index of `child` among the children. Requires the lock.
    #[must_use]
    pub fn position_of(&self, _lock: &LockGuard<'_>, child: *mut u8) -> Option<usize> {
        (0..=self.nkeys()).find(|&i| self.child(i) == child)
    }

    /// Insert `separator` and `right` just after child `left_index`.
    ///
    /// The node must not be full. `right` gets this node as parent.
    pub fn insert_child(
        &self,
        lock: &mut LockGuard<'_>,
        self_ptr: *mut u8,
        left_index: usize,
        separator: u64,
        right: *mut u8,
    ) {
        let n: usize = self.nkeys();
        debug_assert!(n < INTERIOR_WIDTH, "insert_child on a full node");
        debug_assert!(left_index <= n);

        lock.mark_inserting();

        for i in (left_index..n).rev() {
            self.ikeys[i + 1].store(self.ikey(i), RELAXED);
            self.children[i + 2].store(self.child(i + 1), RELAXED);
        }

        self.ikeys[left_index].store(separator, RELAXED);
        self.children[left_index + 1].store(right, WRITE_ORD);
        #[expect(clippy::cast_possible_truncation, reason = "n < INTERIOR_WIDTH")]
        self.nkeys.store((n + 1) as u8, WRITE_ORD);

        // SAFETY: `right` is a live node owned by the tree.
        unsafe { base(right) }.set_parent(self_ptr);
    }

    /// Split a full node while inserting `separator`/`right` after child `left_index`.
    ///
    /// Of the 16 separators, the lower 8 stay here, the 9th is returned for the
    /// parent, and the upper 7 move to `sibling` (fresh, locked by the caller)
    /// together with 8 children. Every child ends up pointing at its new parent.
    #[expect(clippy::too_many_arguments, reason = "both halves of the split are needed")]
    pub fn split_into(
        &self,
        lock: &mut LockGuard<'_>,
        self_ptr: *mut u8,
        sibling: &Self,
        sibling_ptr: *mut u8,
        left_index: usize,
        separator: u64,
        right: *mut u8,
    ) -> u64 {
        debug_assert!(self.is_full(), "split_into on a node with room");

        lock.mark_splitting();

        let mut keys: [u64; INTERIOR_WIDTH + 1] = [0; INTERIOR_WIDTH + 1];
        let mut kids: [*mut u8; INTERIOR_WIDTH + 2] = [ptr::null_mut(); INTERIOR_WIDTH + 2];

        for i in 0..INTERIOR_WIDTH {
            let at: usize = if i < left_index { i } else { i + 1 };
            keys[at] = self.ikey(i);
        }
        keys[left_index] = separator;

        for i in 0..=INTERIOR_WIDTH {
            let at: usize = if i <= left_index { i } else { i + 1 };
            kids[at] = self.child(i);
        }
        kids[left_index + 1] = right;

        let up: u64 = keys[LEFT_KEYS_AFTER_SPLIT];
        let moved: usize = INTERIOR_WIDTH - LEFT_KEYS_AFTER_SPLIT;

        for i in 0..moved {
            sibling.ikeys[i].store(keys[LEFT_KEYS_AFTER_SPLIT + 1 + i], RELAXED);
        }
        for i in 0..=moved {
            let child: *mut u8 = kids[LEFT_KEYS_AFTER_SPLIT + 1 + i];
            sibling.children[i].store(child, RELAXED);
            // SAFETY: every child is a live node owned by the tree.
            unsafe { base(child) }.set_parent(sibling_ptr);
        }
        #[expect(clippy::cast_possible_truncation, reason = "moved < INTERIOR_WIDTH")]
        sibling.nkeys.store(moved as u8, WRITE_ORD);

        for i in 0..LEFT_KEYS_AFTER_SPLIT {
            self.ikeys[i].store(keys[i], RELAXED);
        }
        for (i, &child) in kids.iter().enumerate().take(LEFT_KEYS_AFTER_SPLIT + 1) {
            self.children[i].store(child, WRITE_ORD);
        }
        #[expect(clippy::cast_possible_truncation, reason = "constant fits")]
        self.nkeys.store(LEFT_KEYS_AFTER_SPLIT as u8, WRITE_ORD);

        if left_index < LEFT_KEYS_AFTER_SPLIT {
            // SAFETY: `right` is a live node owned by the tree.
            unsafe { base(right) }.set_parent(self_ptr);
        }

        up
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf() -> *mut u8 {
        Box::into_raw(Box::new(NodeBase::new(true))).cast()
    }

    fn free(p: *mut u8) {
        // SAFETY: every pointer in these tests came from `leaf()`.
        unsafe { drop(Box::from_raw(p.cast::<NodeBase>())) };
    }

    /// A full node with separators 10, 20, .., 150 and fresh children.
    fn full_node() -> (InteriorNode, Vec<*mut u8>) {
        let node = InteriorNode::new();
        let kids: Vec<*mut u8> = (0..=INTERIOR_WIDTH).map(|_| leaf()).collect();

        for (i, &k) in kids.iter().enumerate() {
            node.children[i].store(k, RELAXED);
        }
        for i in 0..INTERIOR_WIDTH {
            node.ikeys[i].store((i as u64 + 1) * 10, RELAXED);
        }
        node.nkeys.store(INTERIOR_WIDTH as u8, RELAXED);

        (node, kids)
    }

    #[test]
    fn test_new_root_routes() {
        let (l, r) = (leaf(), leaf());
        let root = InteriorNode::new_root(l, 100, r);

        assert!(root.base().version().is_root());
        assert_eq!(root.descend(0), l);
        assert_eq!(root.descend(99), l);
        assert_eq!(root.descend(100), r);
        assert_eq!(root.descend(u64::MAX), r);

        free(l);
        free(r);
    }

    #[test]
    fn test_upper_bound() {
        let (node, kids) = full_node();

        assert_eq!(node.upper_bound(0), 0);
        assert_eq!(node.upper_bound(10), 1);
        assert_eq!(node.upper_bound(15), 1);
        assert_eq!(node.upper_bound(150), 15);
        assert_eq!(node.upper_bound(u64::MAX), 15);

        kids.into_iter().for_each(free);
    }

    #[test]
    fn test_insert_child_shifts() {
        let (a, b, c) = (leaf(), leaf(), leaf());
        let node = InteriorNode::new_root(a, 100, b);
        let node_ptr: *mut u8 = ptr::from_ref(&node).cast_mut().cast();

        {
            let mut lock = node.base().lock();
            let idx = node.position_of(&lock, a).unwrap();
            node.insert_child(&mut lock, node_ptr, idx, 50, c);
        }

        assert_eq!(node.nkeys(), 2);
        assert_eq!(node.descend(10), a);
        assert_eq!(node.descend(50), c);
        assert_eq!(node.descend(100), b);
        // SAFETY: c is live.
        assert_eq!(unsafe { base(c) }.parent(), node_ptr);

        [a, b, c].into_iter().for_each(free);
    }

    #[test]
    fn test_split_moves_upper_half() {
        let (node, kids) = full_node();
        let sibling = InteriorNode::new();
        let node_ptr: *mut u8 = ptr::from_ref(&node).cast_mut().cast();
        let sibling_ptr: *mut u8 = ptr::from_ref(&sibling).cast_mut().cast();
        let extra = leaf();

        // Insert separator 155 after the last child.
        let up = {
            let mut lock = node.base().lock();
            node.split_into(&mut lock, node_ptr, &sibling, sibling_ptr, 15, 155, extra)
        };

        assert_eq!(node.nkeys(), 8);
        assert_eq!(sibling.nkeys(), 7);
        assert_eq!(up, 90);
        assert!((0..8).all(|i| node.ikey(i) < up));
        assert!((0..7).all(|i| sibling.ikey(i) > up));
        assert_eq!(sibling.ikey(6), 155);
        assert_eq!(sibling.child(7), extra);

        for i in 0..=7 {
            // SAFETY: children are live.
            assert_eq!(unsafe { base(sibling.child(i)) }.parent(), sibling_ptr);
        }

        kids.into_iter().for_each(free);
        free(extra);
    }

    #[test]
    fn test_split_with_insert_on_left() {
        let (node, kids) = full_node();
        let sibling = InteriorNode::new();
        let node_ptr: *mut u8 = ptr::from_ref(&node).cast_mut().cast();
        let sibling_ptr: *mut u8 = ptr::from_ref(&sibling).cast_mut().cast();
        let extra = leaf();

        let up = {
            let mut lock = node.base().lock();
            node.split_into(&mut lock, node_ptr, &sibling, sibling_ptr, 0, 5, extra)
        };

        assert_eq!(up, 80);
        assert_eq!(node.ikey(0), 5);
        assert_eq!(node.child(1), extra);
        // SAFETY: extra is live.
        assert_eq!(unsafe { base(extra) }.parent(), node_ptr);
        assert_eq!(sibling.ikey(0), 90);

        kids.into_iter().for_each(free);
        free(extra);
    }
}
