//! Insert and update.
//!
//! A put locks the border node owning the key's slice in the current layer
//! and then does one of:
//!
//! - follows a layer slot into the next layer (lock released first)
//! - replaces the value of an exact match
//! - promotes an 8-byte value to a layer when a longer key shares its slice
//! - inserts a new slot, first splitting the node if it is full
//!
//! A new key that continues past the current slice is inserted as a chain
//! of single-entry layers built privately and published by the slot insert.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use seize::LocalGuard;

use super::{Masstree, MasstreeError, RetryBudget, check_key, clone_payload, into_payload};
use crate::alloc::retire_value;
use crate::border::{BorderNode, KeyType, LAYER_KEYLEN, SlotEntry};
use crate::key::Key;
use crate::permutation::Permutation;
use crate::tracing_helpers::{debug_log, error_log, trace_log};
use crate::version::LockGuard;

impl<V: Send + Sync + 'static> Masstree<V> {
    /// Insert or replace `key`. Returns the previous value.
    ///
    /// # Errors
    ///
    /// [`MasstreeError::KeyTooLong`] for keys over the length limit,
    /// [`MasstreeError::RetryLimitExceeded`] if the write kept racing others.
    /// The tree is unchanged on error.
    pub fn put(&self, key: &[u8], value: V) -> Result<Option<Arc<V>>, MasstreeError> {
        let guard: LocalGuard<'_> = self.guard();
        self.put_with_guard(key, value, &guard)
    }

    /// [`put`](Self::put) inside an epoch the caller already entered.
    ///
    /// # Errors
    ///
    /// Same as [`put`](Self::put).
    pub fn put_with_guard(
        &self,
        key: &[u8],
        value: V,
        guard: &LocalGuard<'_>,
    ) -> Result<Option<Arc<V>>, MasstreeError> {
        check_key(key)?;

        let value: Arc<V> = Arc::new(value);
        let mut budget: RetryBudget = self.budget();

        'restart: loop {
            let mut key: Key<'_> = Key::new(key);
            let mut layer_root: *mut u8 = self.load_root();

            loop {
                let Some((border, mut lock)) = self.lock_border(layer_root, &key, guard, &mut budget)? else {
                    budget.spend(&self.counters)?;
                    continue 'restart;
                };

                let perm: Permutation = border.permutation();

                match border.search(perm, key.ikey(), key.rank()) {
                    Ok(pos) => {
                        let slot: usize = perm.get(pos);
                        let entry: SlotEntry = border.entry(slot);

                        match entry.kind() {
                            KeyType::Layer => {
                                drop(lock);
                                key.shift();
                                layer_root = entry.payload;
                            }

                            KeyType::Value if key.has_suffix() => {
                                let layer: *mut u8 = self.promoted_layer(entry.payload, &key.shifted(), value);
                                border.promote_to_layer(&mut lock, slot, layer);
                                drop(lock);

                                self.len.fetch_add(1, Ordering::Relaxed);
                                debug_log!(depth = key.depth(), "value promoted to layer");
                                return Ok(None);
                            }

                            KeyType::Value => {
                                let old: *mut u8 = border.replace_payload(&mut lock, slot, into_payload(value));
                                drop(lock);

                                // SAFETY: `old` was the slot's value until the
                                // swap above; the guard keeps it alive here and
                                // nothing references it after retirement.
                                let previous: Arc<V> = unsafe {
                                    let previous = clone_payload::<V>(old);
                                    retire_value::<V>(guard, old);
                                    previous
                                };

                                return Ok(Some(previous));
                            }

                            KeyType::Unstable => {
                                error_log!("unstable slot seen under the lock");
                                debug_assert!(false, "unstable slot seen under the lock");
                                drop(lock);
                                budget.spend(&self.counters)?;
                            }
                        }
                    }

                    Err(pos) => {
                        // A split makes room without a restart.
                        if perm.free() == 0 {
                            self.split_border(border, lock, guard);
                            continue;
                        }

                        self.insert_new(border, &mut lock, pos, &key, value);
                        drop(lock);

                        self.len.fetch_add(1, Ordering::Relaxed);
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Insert a key that is not in `border` at sorted position `pos`.
    fn insert_new(&self, border: &BorderNode<V>, lock: &mut LockGuard<'_>, pos: usize, key: &Key<'_>, value: Arc<V>) {
        if key.has_suffix() {
            let layer: *mut u8 = self.layer_chain(&key.shifted(), into_payload(value));
            border.insert_at(lock, pos, key.ikey(), LAYER_KEYLEN, layer);
        } else {
            border.insert_at(lock, pos, key.ikey(), key.current_len(), into_payload(value));
        }
    }

    /// Build a new layer holding the displaced 8-byte value under the empty
    /// residual key, plus `rest` (the new key positioned at that layer).
    fn promoted_layer(&self, displaced: *mut u8, rest: &Key<'_>, value: Arc<V>) -> *mut u8 {
        let node: BorderNode<V> = BorderNode::new_root();

        // The empty residual (0, 0) sorts before any key with at least one byte.
        node.push_unpublished(0, 0, displaced);

        if rest.has_suffix() {
            let below: *mut u8 = self.layer_chain(&rest.shifted(), into_payload(value));
            node.push_unpublished(rest.ikey(), LAYER_KEYLEN, below);
        } else {
            node.push_unpublished(rest.ikey(), rest.current_len(), into_payload(value));
        }

        self.register_layer(node)
    }

    /// Build single-entry layers down to the slice where `key` ends.
    fn layer_chain(&self, key: &Key<'_>, payload: *mut u8) -> *mut u8 {
        let node: BorderNode<V> = BorderNode::new_root();

        if key.has_suffix() {
            let below: *mut u8 = self.layer_chain(&key.shifted(), payload);
            node.push_unpublished(key.ikey(), LAYER_KEYLEN, below);
        } else {
            node.push_unpublished(key.ikey(), key.current_len(), payload);
        }

        self.register_layer(node)
    }

    fn register_layer(&self, node: BorderNode<V>) -> *mut u8 {
        self.counters.layers_created.fetch_add(1, Ordering::Relaxed);
        trace_log!("layer created");

        self.arena.alloc_border(node).cast()
    }
}
