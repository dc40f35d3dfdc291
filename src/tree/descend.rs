//! Descent from a layer root to the border node covering a key slice.

use seize::LocalGuard;

use super::{Masstree, MasstreeError, RetryBudget};
use crate::border::BorderNode;
use crate::interior::InteriorNode;
use crate::key::Key;
use crate::node::{base, maybe_parent};
use crate::version::{BORDER_BIT, DELETED_BIT, LockGuard, ROOT_BIT, split_between};

/// A border node reached optimistically, with the version it was read at.
pub(super) struct Reached<'g, V> {
    pub(super) border: &'g BorderNode<V>,
    pub(super) version: u32,
}

impl<'g, V> Reached<'g, V> {
    /// The node was unlinked by a layer collapse.
    #[inline]
    pub(super) const fn is_deleted(&self) -> bool {
        self.version & DELETED_BIT != 0
    }

    /// Re-read the version and follow right siblings while `ikey` belongs to
    /// them. Used after a validation failure.
    pub(super) fn refresh(&mut self, ikey: u64) {
        self.version = self.border.base().stable();

        loop {
            let next: *mut BorderNode<V> = self.border.next();

            if next.is_null() {
                return;
            }

            // SAFETY: siblings stay allocated while the caller's guard is held.
            let next: &'g BorderNode<V> = unsafe { &*next };

            if ikey < next.low_key() {
                return;
            }

            self.border = next;
            self.version = next.base().stable();
        }
    }
}

impl<V: Send + Sync + 'static> Masstree<V> {
    /// Optimistic descent of one layer.
    ///
    /// `layer_root` may be stale; parent links lead to the current root. Each
    /// child's version is captured before its parent is validated, so a split
    /// of the child after that point shows up in the child's own version.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(level = "trace", skip(self, layer_root, _guard, budget))
    )]
    pub(super) fn reach_border<'g>(
        &self,
        layer_root: *mut u8,
        ikey: u64,
        _guard: &'g LocalGuard<'_>,
        budget: &mut RetryBudget,
    ) -> Result<Reached<'g, V>, MasstreeError> {
        let mut start: *mut u8 = layer_root;

        'retry: loop {
            // SAFETY: nodes reachable from a layer root stay allocated for the
            // guard's lifetime (unlinked nodes are retired, not freed).
            let mut node: *mut u8 = unsafe { maybe_parent(start) };
            let mut version: u32 = unsafe { base(node) }.stable();

            if version & (ROOT_BIT | DELETED_BIT) == 0 {
                // Split between the parent walk and the version read.
                start = node;
                budget.spend(&self.counters)?;
                continue 'retry;
            }

            loop {
                if version & BORDER_BIT != 0 {
                    return Ok(Reached {
                        // SAFETY: the border bit identifies the node type.
                        border: unsafe { &*node.cast::<BorderNode<V>>() },
                        version,
                    });
                }

                // SAFETY: not a border, so an interior node.
                let interior: &InteriorNode = unsafe { &*node.cast::<InteriorNode>() };
                let child: *mut u8 = interior.descend(ikey);
                let child_version: u32 = if child.is_null() {
                    0
                } else {
                    // SAFETY: child slots only ever hold live nodes or null.
                    unsafe { base(child) }.stable()
                };

                if !child.is_null() && !interior.base().version().has_changed(version) {
                    node = child;
                    version = child_version;
                    continue;
                }

                let fresh: u32 = interior.base().stable();

                if split_between(version, fresh) {
                    start = node;
                    budget.spend(&self.counters)?;
                    continue 'retry;
                }

                version = fresh;
            }
        }
    }

    /// Lock the border node that owns `key` in the layer rooted at `layer_root`.
    ///
    /// Returns `None` if the node was unlinked by a layer collapse; the caller
    /// restarts from the top layer.
    pub(super) fn lock_border<'g>(
        &self,
        layer_root: *mut u8,
        key: &Key<'_>,
        guard: &'g LocalGuard<'_>,
        budget: &mut RetryBudget,
    ) -> Result<Option<(&'g BorderNode<V>, LockGuard<'g>)>, MasstreeError> {
        let mut border: &'g BorderNode<V> = self.reach_border(layer_root, key.ikey(), guard, budget)?.border;

        loop {
            let lock: LockGuard<'g> = border.base().lock();

            if lock.locked_value() & DELETED_BIT != 0 {
                return Ok(None);
            }

            let next: *mut BorderNode<V> = border.next();

            if !next.is_null() {
                // SAFETY: siblings stay allocated while the guard is held.
                let next: &'g BorderNode<V> = unsafe { &*next };

                if key.ikey() >= next.low_key() {
                    drop(lock);
                    border = next;
                    continue;
                }
            }

            return Ok(Some((border, lock)));
        }
    }

    /// Walk the layers of `full_key` down to `depth` and lock the border
    /// node there that owns the key's slice.
    ///
    /// Returns `None` if a layer slot on the way is gone or a node on the way
    /// was unlinked.
    pub(super) fn lock_border_at_depth<'g>(
        &self,
        full_key: &[u8],
        depth: usize,
        guard: &'g LocalGuard<'_>,
        budget: &mut RetryBudget,
    ) -> Result<Option<(&'g BorderNode<V>, LockGuard<'g>)>, MasstreeError> {
        let mut key: Key<'_> = Key::new(full_key);
        let mut layer_root: *mut u8 = self.load_root();

        loop {
            let Some((border, lock)) = self.lock_border(layer_root, &key, guard, budget)? else {
                return Ok(None);
            };

            if key.depth() == depth {
                return Ok(Some((border, lock)));
            }

            match border.layer_for(&key) {
                Some(next_root) => {
                    drop(lock);
                    key.shift();
                    layer_root = next_root;
                }
                None => return Ok(None),
            }
        }
    }
}
