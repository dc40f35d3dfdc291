//! Delete, and collapse of layers a delete leaves empty.
//!
//! A layer whose root border node becomes empty is unlinked from the layer
//! above: the node is marked deleted under its lock, the layer slot pointing
//! at it is removed, and the node is retired. Readers and writers that reach
//! a deleted node restart from the top layer. The top layer is never
//! collapsed, and neither is a layer that has grown past one border node.

use std::ptr;
use std::sync::atomic::Ordering;

use seize::LocalGuard;

use super::{Masstree, MasstreeError, RetryBudget, check_key};
use crate::alloc::retire_value;
use crate::border::{BorderNode, KeyType, SlotEntry};
use crate::key::{FULL_SLICE_RANK, Key};
use crate::permutation::Permutation;
use crate::tracing_helpers::{debug_log, error_log};
use crate::version::ROOT_BIT;

impl<V: Send + Sync + 'static> Masstree<V> {
    /// Remove `key`. Returns whether it was present.
    ///
    /// # Errors
    ///
    /// [`MasstreeError::KeyTooLong`] for keys over the length limit,
    /// [`MasstreeError::RetryLimitExceeded`] if the write kept racing others.
    pub fn delete(&self, key: &[u8]) -> Result<bool, MasstreeError> {
        let guard: LocalGuard<'_> = self.guard();
        self.delete_with_guard(key, &guard)
    }

    /// [`delete`](Self::delete) inside an epoch the caller already entered.
    ///
    /// # Errors
    ///
    /// Same as [`delete`](Self::delete).
    pub fn delete_with_guard(&self, key: &[u8], guard: &LocalGuard<'_>) -> Result<bool, MasstreeError> {
        check_key(key)?;

        let mut budget: RetryBudget = self.budget();

        'restart: loop {
            let mut at: Key<'_> = Key::new(key);
            let mut layer_root: *mut u8 = self.load_root();

            loop {
                let Some((border, mut lock)) = self.lock_border(layer_root, &at, guard, &mut budget)? else {
                    budget.spend(&self.counters)?;
                    continue 'restart;
                };

                let perm: Permutation = border.permutation();

                let Ok(pos) = border.search(perm, at.ikey(), at.rank()) else {
                    return Ok(false);
                };

                let entry: SlotEntry = border.entry(perm.get(pos));

                match entry.kind() {
                    KeyType::Layer => {
                        drop(lock);
                        at.shift();
                        layer_root = entry.payload;
                    }

                    KeyType::Value if at.has_suffix() => return Ok(false),

                    KeyType::Value => {
                        border.remove_at(&mut lock, pos);

                        let emptied_layer: bool =
                            at.depth() > 0 && border.size() == 0 && lock.locked_value() & ROOT_BIT != 0;

                        if emptied_layer {
                            lock.mark_deleted();
                        }
                        drop(lock);

                        self.len.fetch_sub(1, Ordering::Relaxed);

                        // SAFETY: the slot no longer references the value.
                        unsafe { retire_value::<V>(guard, entry.payload) };

                        if emptied_layer {
                            self.collapse_layers(key, at.depth(), border, guard);
                        }

                        return Ok(true);
                    }

                    KeyType::Unstable => {
                        error_log!("unstable slot seen under the lock");
                        debug_assert!(false, "unstable slot seen under the lock");
                        drop(lock);
                        budget.spend(&self.counters)?;
                        continue 'restart;
                    }
                }
            }
        }
    }

    /// Unlink the deleted, empty root `node` of layer `depth` from the layer
    /// above, and keep going up while that leaves another layer empty.
    ///
    /// A node marked deleted must lose its slot: the walks here run on an
    /// unbounded budget and never fail.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self, key, node, guard)))]
    fn collapse_layers<'g>(&self, key: &[u8], mut depth: usize, mut node: &'g BorderNode<V>, guard: &'g LocalGuard<'_>) {
        let mut budget: RetryBudget = RetryBudget::unbounded();

        while depth > 0 {
            let Ok(Some((owner, mut lock))) = self.lock_border_at_depth(key, depth - 1, guard, &mut budget) else {
                let _ = budget.spend(&self.counters);
                continue;
            };

            let node_ptr: *mut BorderNode<V> = ptr::from_ref(node).cast_mut();
            let at: Key<'_> = Key::at_depth(key, depth - 1);
            let perm: Permutation = owner.permutation();

            let Ok(pos) = owner.search(perm, at.ikey(), FULL_SLICE_RANK) else {
                return;
            };

            let entry: SlotEntry = owner.entry(perm.get(pos));

            if entry.kind() != KeyType::Layer || entry.payload != node_ptr.cast::<u8>() {
                return;
            }

            owner.remove_at(&mut lock, pos);

            // SAFETY: the node was the layer's only node, is marked deleted,
            // and the slot that referenced it is gone.
            unsafe { self.arena.retire_border(node_ptr, guard) };
            self.counters.layer_collapses.fetch_add(1, Ordering::Relaxed);
            debug_log!(depth, "empty layer collapsed");

            depth -= 1;

            if depth == 0 || owner.size() > 0 || lock.locked_value() & ROOT_BIT == 0 {
                return;
            }

            lock.mark_deleted();
            drop(lock);
            node = owner;
        }
    }
}
