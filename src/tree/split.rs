//! Splits and their propagation up one layer.
//!
//! A split always holds the lock of the node being split and takes the
//! parent's lock after it (child before parent, never the reverse). The new
//! right sibling is created locked and stays locked until its parent routes
//! to it.

use std::ptr;
use std::sync::atomic::Ordering;

use seize::LocalGuard;

use super::Masstree;
use crate::border::BorderNode;
use crate::interior::InteriorNode;
use crate::node::base;
use crate::tracing_helpers::{debug_log, error_log, trace_log};
use crate::version::LockGuard;

impl<V: Send + Sync + 'static> Masstree<V> {
    /// Split the full border node `left` and link the new right half into
    /// the layer. Consumes `left`'s lock.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all))]
    pub(super) fn split_border<'g>(
        &self,
        left: &'g BorderNode<V>,
        mut left_lock: LockGuard<'g>,
        _guard: &'g LocalGuard<'_>,
    ) {
        let right_ptr: *mut BorderNode<V> = self.arena.alloc_border(BorderNode::new());
        // SAFETY: just allocated; owned by the arena until the tree drops.
        let right: &'g BorderNode<V> = unsafe { &*right_ptr };
        let right_lock: LockGuard<'g> = right.base().lock();

        let left_ptr: *mut BorderNode<V> = ptr::from_ref(left).cast_mut();
        let separator: u64 = left.split_into(&mut left_lock, left_ptr, right, right_ptr);

        self.counters.border_splits.fetch_add(1, Ordering::Relaxed);
        trace_log!(separator, moved = right.size(), "border split");

        self.propagate_split(left_ptr.cast(), left_lock, right_ptr.cast(), right_lock, separator);
    }

    /// Route `separator`/`right` from the parent of `left`, splitting
    /// parents as needed. Both nodes are locked on entry; every lock is
    /// released on return.
    fn propagate_split<'g>(
        &self,
        mut left: *mut u8,
        mut left_lock: LockGuard<'g>,
        mut right: *mut u8,
        mut right_lock: LockGuard<'g>,
        mut separator: u64,
    ) {
        loop {
            let Some((parent, mut parent_lock)) = self.locked_parent(left) else {
                self.grow_root(left, right, separator);
                drop(right_lock);
                drop(left_lock);
                return;
            };

            let parent_ptr: *mut u8 = ptr::from_ref(parent).cast_mut().cast();

            let Some(left_index) = parent.position_of(&parent_lock, left) else {
                error_log!("split child missing from its parent");
                debug_assert!(false, "split child missing from its parent");
                return;
            };

            if !parent.is_full() {
                parent.insert_child(&mut parent_lock, parent_ptr, left_index, separator, right);
                drop(right_lock);
                drop(left_lock);
                return;
            }

            let sibling_ptr: *mut InteriorNode = self.arena.alloc_interior(InteriorNode::new());
            // SAFETY: just allocated; owned by the arena.
            let sibling: &'g InteriorNode = unsafe { &*sibling_ptr };
            let sibling_lock: LockGuard<'g> = sibling.base().lock();

            let up: u64 = parent.split_into(
                &mut parent_lock,
                parent_ptr,
                sibling,
                sibling_ptr.cast(),
                left_index,
                separator,
                right,
            );

            self.counters.interior_splits.fetch_add(1, Ordering::Relaxed);
            trace_log!(separator = up, "interior split");

            drop(right_lock);
            drop(left_lock);

            left = parent_ptr;
            left_lock = parent_lock;
            right = sibling_ptr.cast();
            right_lock = sibling_lock;
            separator = up;
        }
    }

    /// Lock the parent of the locked node `child`, or `None` if `child` is
    /// a layer root.
    ///
    /// The parent can change between the read and the lock when the parent
    /// itself splits; the read is repeated until it holds under the lock.
    fn locked_parent<'g>(&self, child: *mut u8) -> Option<(&'g InteriorNode, LockGuard<'g>)> {
        // SAFETY: `child` is locked by the caller and owned by the tree.
        let child_base = unsafe { base(child) };

        loop {
            let parent: *mut u8 = child_base.parent();

            if parent.is_null() {
                return None;
            }

            // SAFETY: parent links only ever point at interior nodes, which
            // live until the tree drops.
            let node: &'g InteriorNode = unsafe { &*parent.cast::<InteriorNode>() };
            let lock: LockGuard<'g> = node.base().lock();

            if child_base.parent() == parent {
                return Some((node, lock));
            }

            drop(lock);
        }
    }

    /// Put a new interior root above the split layer root `left`.
    ///
    /// `left`'s split unlock clears its root flag after this returns.
    fn grow_root(&self, left: *mut u8, right: *mut u8, separator: u64) {
        let root: *mut InteriorNode = self.arena.alloc_interior(InteriorNode::new_root(left, separator, right));
        let root: *mut u8 = root.cast();

        // SAFETY: both children are locked by the caller.
        unsafe {
            base(left).set_parent(root);
            base(right).set_parent(root);
        }

        self.install_root(left, root);
        self.counters.root_promotions.fetch_add(1, Ordering::Relaxed);
        debug_log!(separator, "layer root split");
    }
}
