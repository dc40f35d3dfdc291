//! Ordered range iteration.
//!
//! [`RangeIter`] walks the border nodes of a layer left to right through
//! their `next` links and descends into layer slots as it meets them, keeping
//! one cursor per open layer. Each border node is read as a validated
//! snapshot; entries at or below the last one returned are skipped, so a node
//! that splits between two reads yields every surviving key once.
//!
//! The scan is not a point-in-time view: keys inserted or removed while it
//! runs may or may not show up.

use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::Arc;

use seize::LocalGuard;

use super::{Masstree, MasstreeError, RetryBudget, clone_payload};
use crate::border::{BorderNode, KeyType, SlotEntry};
use crate::key::{FULL_SLICE_RANK, IKEY_SIZE, read_ikey};
use crate::permutation::Permutation;
use crate::version::DELETED_BIT;

/// Position of an entry inside a layer: `(ikey, rank)`.
type Rank = (u64, u8);

/// Sort rank of the first slice of `key` in a layer.
#[expect(clippy::cast_possible_truncation, reason = "bounded by IKEY_SIZE")]
fn rank_of(key: &[u8]) -> Rank {
    if key.len() > IKEY_SIZE {
        (read_ikey(key), FULL_SLICE_RANK)
    } else {
        (read_ikey(key), key.len() as u8)
    }
}

/// An entry read out of a validated snapshot.
enum Pending<V> {
    Value { ikey: u64, len: u8, value: Arc<V> },
    Layer { ikey: u64, root: *mut u8 },
}

/// Scan state of one layer.
struct LayerCursor<V> {
    /// Bytes consumed by the layers above.
    prefix: Vec<u8>,
    root: *mut u8,
    /// Border node read last; null until positioned.
    border: *const BorderNode<V>,
    /// First rank of interest, from the lower bound.
    start: Option<Rank>,
    /// Last rank handed out.
    last: Option<Rank>,
    pending: VecDeque<Pending<V>>,
}

impl<V> LayerCursor<V> {
    fn new(prefix: Vec<u8>, root: *mut u8, start: Option<Rank>) -> Self {
        Self {
            prefix,
            root,
            border: std::ptr::null(),
            start,
            last: None,
            pending: VecDeque::new(),
        }
    }

    fn wanted(&self, rank: Rank) -> bool {
        self.start.is_none_or(|start| rank >= start) && self.last.is_none_or(|last| rank > last)
    }
}

impl<V: Send + Sync + 'static> LayerCursor<V> {
    /// Read the next border node with anything of interest into `pending`.
    ///
    /// Returns `false` at the end of the layer.
    fn refill(&mut self, tree: &Masstree<V>, guard: &LocalGuard<'_>, budget: &mut RetryBudget) -> Result<bool, MasstreeError> {
        loop {
            if self.border.is_null() {
                let ikey: u64 = self.start.map_or(0, |(ikey, _)| ikey);
                self.border = tree.reach_border(self.root, ikey, guard, budget)?.border;
            } else {
                // SAFETY: nodes read under the caller's guard stay allocated.
                let next: *mut BorderNode<V> = unsafe { &*self.border }.next();

                if next.is_null() {
                    return Ok(false);
                }
                self.border = next;
            }

            // SAFETY: as above.
            let border: &BorderNode<V> = unsafe { &*self.border };

            let entries: Vec<SlotEntry> = loop {
                let version: u32 = border.base().stable();

                if version & DELETED_BIT != 0 {
                    // A collapsed layer is empty.
                    return Ok(false);
                }

                let perm: Permutation = border.permutation();
                let entries: Vec<SlotEntry> = border.entries(perm).collect();

                if !border.base().version().has_changed(version) {
                    break entries;
                }

                budget.spend(&tree.counters)?;
            };

            for entry in entries {
                let rank: Rank = (entry.ikey, entry.rank());

                if !self.wanted(rank) {
                    continue;
                }

                let pending: Pending<V> = match entry.kind() {
                    KeyType::Value => Pending::Value {
                        ikey: entry.ikey,
                        len: entry.rank(),
                        // SAFETY: validated above; the guard keeps it alive.
                        value: unsafe { clone_payload::<V>(entry.payload) },
                    },
                    KeyType::Layer => Pending::Layer {
                        ikey: entry.ikey,
                        root: entry.payload,
                    },
                    KeyType::Unstable => continue,
                };

                self.last = Some(rank);
                self.pending.push_back(pending);
            }

            if !self.pending.is_empty() {
                return Ok(true);
            }
        }
    }
}

/// Iterator over `(key, value)` pairs in ascending key order.
///
/// Created by [`Masstree::range`]. Yields an error at most once, after which
/// it is exhausted.
pub struct RangeIter<'g, 'c, V> {
    tree: &'g Masstree<V>,
    guard: &'g LocalGuard<'c>,
    low: Bound<Vec<u8>>,
    high: Bound<Vec<u8>>,
    stack: Vec<LayerCursor<V>>,
    budget: RetryBudget,
}

impl<V> std::fmt::Debug for RangeIter<'_, '_, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeIter")
            .field("low", &self.low)
            .field("high", &self.high)
            .field("depth", &self.stack.len())
            .finish_non_exhaustive()
    }
}

impl<V> RangeIter<'_, '_, V> {
    fn below_low(&self, key: &[u8]) -> bool {
        match &self.low {
            Bound::Included(low) => key < low.as_slice(),
            Bound::Excluded(low) => key <= low.as_slice(),
            Bound::Unbounded => false,
        }
    }

    fn above_high(&self, key: &[u8]) -> bool {
        match &self.high {
            Bound::Included(high) => key > high.as_slice(),
            Bound::Excluded(high) => key >= high.as_slice(),
            Bound::Unbounded => false,
        }
    }

    /// Where to start in a layer whose keys all begin with `prefix`.
    ///
    /// `None` if the whole layer lies below the lower bound, `Some(None)` to
    /// scan it from the start.
    fn layer_start(&self, prefix: &[u8]) -> Option<Option<Rank>> {
        let low: &[u8] = match &self.low {
            Bound::Included(low) | Bound::Excluded(low) => low,
            Bound::Unbounded => return Some(None),
        };

        if low.len() > prefix.len() && low.starts_with(prefix) {
            return Some(Some(rank_of(&low[prefix.len()..])));
        }

        if prefix < low {
            return None;
        }

        Some(None)
    }

    fn finish(&mut self) {
        self.stack.clear();
    }
}

impl<V: Send + Sync + 'static> Iterator for RangeIter<'_, '_, V> {
    type Item = Result<(Vec<u8>, Arc<V>), MasstreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let top: &mut LayerCursor<V> = self.stack.last_mut()?;

            let Some(pending) = top.pending.pop_front() else {
                match top.refill(self.tree, self.guard, &mut self.budget) {
                    Ok(true) => {}
                    Ok(false) => {
                        self.stack.pop();
                    }
                    Err(error) => {
                        self.finish();
                        return Some(Err(error));
                    }
                }
                continue;
            };

            let mut key: Vec<u8> = top.prefix.clone();

            match pending {
                Pending::Value { ikey, len, value } => {
                    key.extend_from_slice(&ikey.to_be_bytes()[..usize::from(len)]);

                    if self.above_high(&key) {
                        self.finish();
                        return None;
                    }
                    if self.below_low(&key) {
                        continue;
                    }

                    return Some(Ok((key, value)));
                }

                Pending::Layer { ikey, root } => {
                    key.extend_from_slice(&ikey.to_be_bytes());

                    // Every key below starts with `key`, so the smallest is
                    // `key` itself.
                    if self.above_high(&key) {
                        self.finish();
                        return None;
                    }

                    if let Some(start) = self.layer_start(&key) {
                        self.stack.push(LayerCursor::new(key, root, start));
                    }
                }
            }
        }
    }
}

impl<V: Send + Sync + 'static> Masstree<V> {
    /// Iterate over the keys between `low` and `high` in ascending order.
    ///
    /// The guard pins every node and value the iterator touches.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::ops::Bound;
    /// use masstree_lite::Masstree;
    ///
    /// let tree: Masstree<u32> = Masstree::new();
    /// for (i, key) in [&b"apple"[..], b"banana", b"cherry"].into_iter().enumerate() {
    ///     tree.put(key, i as u32).unwrap();
    /// }
    ///
    /// let guard = tree.guard();
    /// let keys: Vec<Vec<u8>> = tree
    ///     .range(Bound::Included(b"b"), Bound::Unbounded, &guard)
    ///     .map(|item| item.unwrap().0)
    ///     .collect();
    /// assert_eq!(keys, vec![b"banana".to_vec(), b"cherry".to_vec()]);
    /// ```
    pub fn range<'g, 'c>(
        &'g self,
        low: Bound<&[u8]>,
        high: Bound<&[u8]>,
        guard: &'g LocalGuard<'c>,
    ) -> RangeIter<'g, 'c, V> {
        let mut iter: RangeIter<'g, 'c, V> = RangeIter {
            tree: self,
            guard,
            low: low.map(<[u8]>::to_vec),
            high: high.map(<[u8]>::to_vec),
            stack: Vec::new(),
            budget: self.budget(),
        };

        let empty_range: bool = match (&iter.low, &iter.high) {
            (Bound::Included(l), Bound::Included(h)) => l > h,
            (Bound::Included(l) | Bound::Excluded(l), Bound::Excluded(h))
            | (Bound::Excluded(l), Bound::Included(h)) => l >= h,
            _ => false,
        };

        if !empty_range {
            if let Some(start) = iter.layer_start(&[]) {
                iter.stack.push(LayerCursor::new(Vec::new(), self.load_root(), start));
            }
        }

        iter
    }

    /// Collect the keys between `low` and `high` in ascending order.
    ///
    /// # Errors
    ///
    /// [`MasstreeError::RetryLimitExceeded`] if the scan kept racing writers.
    pub fn scan_range(&self, low: Bound<&[u8]>, high: Bound<&[u8]>) -> Result<Vec<(Vec<u8>, Arc<V>)>, MasstreeError> {
        let guard: LocalGuard<'_> = self.guard();
        let items: Result<Vec<_>, MasstreeError> = self.range(low, high, &guard).collect();
        items
    }
}
