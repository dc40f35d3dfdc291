//! Lock-free lookup.

use std::sync::Arc;

use seize::LocalGuard;

use super::descend::Reached;
use super::{Masstree, MasstreeError, RetryBudget, check_key, clone_payload};
use crate::border::Lookup;
use crate::key::Key;

impl<V: Send + Sync + 'static> Masstree<V> {
    /// Look up `key`.
    ///
    /// # Errors
    ///
    /// [`MasstreeError::KeyTooLong`] for keys over the length limit,
    /// [`MasstreeError::RetryLimitExceeded`] if the read kept racing writers.
    pub fn get(&self, key: &[u8]) -> Result<Option<Arc<V>>, MasstreeError> {
        let guard: LocalGuard<'_> = self.guard();
        self.get_with_guard(key, &guard)
    }

    /// [`get`](Self::get) inside an epoch the caller already entered.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get).
    pub fn get_with_guard(&self, key: &[u8], guard: &LocalGuard<'_>) -> Result<Option<Arc<V>>, MasstreeError> {
        check_key(key)?;

        let mut budget: RetryBudget = self.budget();

        'restart: loop {
            let mut key: Key<'_> = Key::new(key);
            let mut layer_root: *mut u8 = self.load_root();

            'layer: loop {
                let mut at: Reached<'_, V> = self.reach_border(layer_root, key.ikey(), guard, &mut budget)?;

                loop {
                    if at.is_deleted() {
                        budget.spend(&self.counters)?;
                        continue 'restart;
                    }

                    let found: Lookup = at.border.lookup(&key);

                    if at.border.base().version().has_changed(at.version) {
                        budget.spend(&self.counters)?;
                        at.refresh(key.ikey());
                        continue;
                    }

                    match found {
                        Lookup::Value(payload) => {
                            // SAFETY: the payload was validated against the
                            // node version and the guard keeps it alive.
                            return Ok(Some(unsafe { clone_payload::<V>(payload) }));
                        }
                        Lookup::Layer(next_root) => {
                            key.shift();
                            layer_root = next_root;
                            continue 'layer;
                        }
                        Lookup::NotFound => return Ok(None),
                        Lookup::Unstable => {
                            budget.spend(&self.counters)?;
                            at.refresh(key.ikey());
                        }
                    }
                }
            }
        }
    }
}
