//! Border (leaf) nodes.
//!
//! A [`BorderNode`] has 15 physical slots. Each slot holds an 8-byte key
//! slice, a keylen byte and a payload pointer. The [`Permutation`] word lists
//! the occupied slots in sorted order, so an insert writes a free slot and
//! then publishes one new permutation.
//!
//! # Keylen byte
//!
//! ```text
//!   7   6   5 ........ 0
//! +-------+-------------+
//! | type  |   length    |
//! +-------+-------------+
//! ```
//!
//! - `00` value: payload is an `Arc<V>` from `Arc::into_raw`, length is 0..=8.
//! - `01` layer: payload is the root of the next layer, length is 8.
//! - `10` unstable: the slot is being turned into a layer; readers retry.
//!
//! Slots sort by `(ikey, length)`. A layer slot ranks as length 8, so one
//! ikey holds at most one of {8-byte value, layer}.
//!
//! Border nodes of one layer form a doubly linked list through `prev`/`next`.
//! `low_key` is the smallest slice a node may hold and never changes.

use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicU64};

use crate::key::{FULL_SLICE_RANK, Key};
use crate::node::NodeBase;
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::permutation::{Permutation, WIDTH};
use crate::version::LockGuard;

/// Mask of the type bits.
pub const TYPE_MASK: u8 = 0xC0;

/// Mask of the length bits.
pub const LEN_MASK: u8 = 0x3F;

/// Type bits of a value slot.
pub const KEY_VALUE: u8 = 0x00;

/// Type bits of a layer slot.
pub const KEY_LAYER: u8 = 0x40;

/// Type bits of a slot being promoted to a layer.
pub const KEY_UNSTABLE: u8 = 0x80;

/// Keylen byte of a layer slot.
pub const LAYER_KEYLEN: u8 = KEY_LAYER | FULL_SLICE_RANK;

/// Preferred number of entries left behind by a split.
const SPLIT_TARGET: usize = 8;

/// What a slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// A value.
    Value,
    /// The root of the next layer.
    Layer,
    /// Mid-promotion.
    Unstable,
}

impl KeyType {
    /// Decode the type bits of a keylen byte.
    #[inline]
    #[must_use]
    pub const fn of(keylen: u8) -> Self {
        match keylen & TYPE_MASK {
            KEY_VALUE => Self::Value,
            KEY_LAYER => Self::Layer,
            _ => Self::Unstable,
        }
    }
}

/// One slot as read from a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotEntry {
    /// Key slice.
    pub ikey: u64,
    /// Keylen byte.
    pub keylen: u8,
    /// Value or layer root.
    pub payload: *mut u8,
}

impl SlotEntry {
    /// Sort rank: the length bits.
    #[inline]
    #[must_use]
    pub const fn rank(&self) -> u8 {
        self.keylen & LEN_MASK
    }

    /// Slot type.
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> KeyType {
        KeyType::of(self.keylen)
    }
}

/// Result of looking a key up in one border node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The key's value, as an `Arc::into_raw` pointer.
    Value(*mut u8),
    /// Continue with the next slice in the layer rooted here.
    Layer(*mut u8),
    /// A promotion is in flight; read again.
    Unstable,
    /// Not in this node.
    NotFound,
}

/// A leaf node of one layer.
#[repr(C)]
pub struct BorderNode<V> {
    base: NodeBase,
    permutation: AtomicU64,
    n_removed: AtomicU8,
    keylen: [AtomicU8; WIDTH],
    ikeys: [AtomicU64; WIDTH],
    payload: [AtomicPtr<u8>; WIDTH],
    low_key: AtomicU64,
    prev: AtomicPtr<BorderNode<V>>,
    next: AtomicPtr<BorderNode<V>>,
    _marker: PhantomData<Arc<V>>,
}

impl<V> std::fmt::Debug for BorderNode<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let perm: Permutation = self.permutation();
        let ikeys: Vec<u64> = perm.slots().map(|s| self.ikeys[s].load(RELAXED)).collect();

        f.debug_struct("BorderNode")
            .field("version", &self.base.version().value())
            .field("low_key", &self.low_key())
            .field("ikeys", &ikeys)
            .field("n_removed", &self.n_removed())
            .finish_non_exhaustive()
    }
}

impl<V> Default for BorderNode<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> BorderNode<V> {
    /// An empty, unlinked border node.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: NodeBase::new(true),
            permutation: AtomicU64::new(Permutation::empty().value()),
            n_removed: AtomicU8::new(0),
            keylen: std::array::from_fn(|_| AtomicU8::new(0)),
            ikeys: std::array::from_fn(|_| AtomicU64::new(0)),
            payload: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            low_key: AtomicU64::new(0),
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// An empty border node that roots a layer.
    #[must_use]
    pub fn new_root() -> Self {
        let node = Self::new();
        node.base.version().mark_root();
        node
    }

    // ========================================================================
    //  Accessors
    // ========================================================================

    /// Node header.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> &NodeBase {
        &self.base
    }

    /// Current slot order.
    #[inline]
    #[must_use]
    pub fn permutation(&self) -> Permutation {
        Permutation::from_value(self.permutation.load(READ_ORD))
    }

    /// Occupied slots.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.permutation().size()
    }

    /// Removed slots not yet handed out again.
    #[inline]
    #[must_use]
    pub fn n_removed(&self) -> usize {
        usize::from(self.n_removed.load(RELAXED))
    }

    /// Smallest slice this node may hold.
    #[inline]
    #[must_use]
    pub fn low_key(&self) -> u64 {
        self.low_key.load(RELAXED)
    }

    /// Right sibling, or null.
    #[inline]
    #[must_use]
    pub fn next(&self) -> *mut Self {
        self.next.load(READ_ORD)
    }

    /// Left sibling, or null.
    #[inline]
    #[must_use]
    pub fn prev(&self) -> *mut Self {
        self.prev.load(READ_ORD)
    }

    /// Slot contents.
    #[inline]
    #[must_use]
    pub fn entry(&self, slot: usize) -> SlotEntry {
        SlotEntry {
            ikey: self.ikeys[slot].load(RELAXED),
            keylen: self.keylen[slot].load(RELAXED),
            payload: self.payload[slot].load(READ_ORD),
        }
    }

    /// Entries in sorted order under `perm`.
    pub fn entries(&self, perm: Permutation) -> impl Iterator<Item = SlotEntry> + '_ {
        perm.slots().map(move |slot| self.entry(slot))
    }

    // ========================================================================
    //  Search
    // ========================================================================

    /// Binary search for `(ikey, rank)`.
    ///
    /// `Ok(pos)` on a match, `Err(pos)` with the insert position otherwise.
    pub fn search(&self, perm: Permutation, ikey: u64, rank: u8) -> Result<usize, usize> {
        let (mut lo, mut hi) = (0usize, perm.size());

        while lo < hi {
            let mid: usize = lo + (hi - lo) / 2;
            let slot: usize = perm.get(mid);
            let probe = (
                self.ikeys[slot].load(RELAXED),
                self.keylen[slot].load(RELAXED) & LEN_MASK,
            );

            match probe.cmp(&(ikey, rank)) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }

        Err(lo)
    }

    /// Look `key` up at its current layer.
    ///
    /// Inside an optimistic read the caller must validate the version before
    /// trusting the answer.
    #[must_use]
    pub fn lookup(&self, key: &Key<'_>) -> Lookup {
        let perm: Permutation = self.permutation();

        let Ok(pos) = self.search(perm, key.ikey(), key.rank()) else {
            return Lookup::NotFound;
        };

        let entry: SlotEntry = self.entry(perm.get(pos));

        match entry.kind() {
            KeyType::Unstable => Lookup::Unstable,
            KeyType::Layer => Lookup::Layer(entry.payload),
            // An 8-byte value does not match a longer key sharing its slice.
            KeyType::Value if key.has_suffix() => Lookup::NotFound,
            KeyType::Value => Lookup::Value(entry.payload),
        }
    }

    /// Root of the layer hanging off `key`'s slice, if there is one.
    #[must_use]
    pub fn layer_for(&self, key: &Key<'_>) -> Option<*mut u8> {
        let perm: Permutation = self.permutation();
        let pos: usize = self.search(perm, key.ikey(), FULL_SLICE_RANK).ok()?;
        let entry: SlotEntry = self.entry(perm.get(pos));

        (entry.kind() == KeyType::Layer).then_some(entry.payload)
    }

    // ========================================================================
    //  Mutation (lock held)
    // ========================================================================

    /// Put a new entry at sorted position `pos`. The node must have a free slot.
    ///
    /// Never-used slots are handed out before removed ones. Returns the slot.
    pub fn insert_at(
        &self,
        lock: &mut LockGuard<'_>,
        pos: usize,
        ikey: u64,
        keylen: u8,
        payload: *mut u8,
    ) -> usize {
        let mut perm: Permutation = self.permutation();
        debug_assert!(perm.free() > 0, "insert_at on a full node");

        lock.mark_inserting();

        let n_removed: usize = self.n_removed();
        let reuses_removed: bool = perm.free() <= n_removed;
        let slot: usize = perm.insert_from_back(pos);

        if reuses_removed {
            self.n_removed.fetch_sub(1, RELAXED);
        }

        self.ikeys[slot].store(ikey, RELAXED);
        self.keylen[slot].store(keylen, RELAXED);
        self.payload[slot].store(payload, WRITE_ORD);
        self.permutation.store(perm.value(), WRITE_ORD);

        slot
    }

    /// Swap the payload of an existing slot. Returns the old payload.
    pub fn replace_payload(&self, lock: &mut LockGuard<'_>, slot: usize, payload: *mut u8) -> *mut u8 {
        lock.mark_inserting();
        self.payload[slot].swap(payload, WRITE_ORD)
    }

    /// Turn the 8-byte value in `slot` into a pointer to `layer`.
    ///
    /// The slot is unstable between the two keylen stores.
    pub fn promote_to_layer(&self, lock: &mut LockGuard<'_>, slot: usize, layer: *mut u8) {
        debug_assert_eq!(self.entry(slot).kind(), KeyType::Value);

        lock.mark_inserting();
        self.keylen[slot].store(KEY_UNSTABLE | FULL_SLICE_RANK, WRITE_ORD);
        self.payload[slot].store(layer, WRITE_ORD);
        self.keylen[slot].store(LAYER_KEYLEN, WRITE_ORD);
    }

    /// Drop sorted position `pos` from the permutation. Returns what it held.
    ///
    /// The slot itself is left as is and counted in `n_removed`.
    pub fn remove_at(&self, lock: &mut LockGuard<'_>, pos: usize) -> SlotEntry {
        let mut perm: Permutation = self.permutation();
        let entry: SlotEntry = self.entry(perm.get(pos));

        lock.mark_inserting();
        perm.remove(pos);
        self.permutation.store(perm.value(), WRITE_ORD);
        self.n_removed.fetch_add(1, RELAXED);

        entry
    }

    /// Move the upper entries of this full node into `right`.
    ///
    /// `right` must be fresh and locked by the caller. It is completely
    /// filled and linked after this node before this node shrinks. Returns
    /// `right`'s low key, the separator for the parent.
    pub fn split_into(
        &self,
        lock: &mut LockGuard<'_>,
        self_ptr: *mut Self,
        right: &Self,
        right_ptr: *mut Self,
    ) -> u64 {
        let perm: Permutation = self.permutation();
        debug_assert_eq!(perm.size(), WIDTH, "split_into on a node with room");

        lock.mark_splitting();

        let entries: Vec<SlotEntry> = self.entries(perm).collect();
        let at: usize = split_point(&entries);
        let moved: &[SlotEntry] = &entries[at..];

        for (slot, e) in moved.iter().enumerate() {
            right.ikeys[slot].store(e.ikey, RELAXED);
            right.keylen[slot].store(e.keylen, RELAXED);
            right.payload[slot].store(e.payload, RELAXED);
        }
        right
            .permutation
            .store(Permutation::make_sorted(moved.len()).value(), RELAXED);
        right.low_key.store(moved[0].ikey, RELAXED);

        let next: *mut Self = self.next();
        right.prev.store(self_ptr, RELAXED);
        right.next.store(next, RELAXED);
        if !next.is_null() {
            // SAFETY: siblings are live while linked.
            unsafe { &*next }.prev.store(right_ptr, WRITE_ORD);
        }
        self.next.store(right_ptr, WRITE_ORD);

        let mut left: Permutation = perm;
        left.set_size(at);
        self.permutation.store(left.value(), WRITE_ORD);

        moved[0].ikey
    }

    /// Append an entry to a node no other thread can see yet.
    ///
    /// Entries must arrive in sorted order.
    pub fn push_unpublished(&self, ikey: u64, keylen: u8, payload: *mut u8) {
        let mut perm: Permutation = self.permutation();
        let slot: usize = perm.insert_from_back(perm.size());

        self.ikeys[slot].store(ikey, RELAXED);
        self.keylen[slot].store(keylen, RELAXED);
        self.payload[slot].store(payload, RELAXED);
        self.permutation.store(perm.value(), RELAXED);
    }

    /// Drop every value still referenced by the permutation.
    ///
    /// # Safety
    ///
    /// No other thread may access the node, and it must not be used again.
    pub unsafe fn drop_values(&self) {
        for entry in self.entries(self.permutation()) {
            if entry.kind() == KeyType::Value && !entry.payload.is_null() {
                // SAFETY: value payloads come from Arc::into_raw and are
                // owned by the slot.
                unsafe { drop(Arc::from_raw(entry.payload.cast::<V>())) };
            }
        }
    }
}

/// Index of the first entry moved right.
///
/// Entries with equal slices must stay together, otherwise a lookup routed by
/// slice could miss one. At most 9 ranks share a slice, so a full node always
/// has a boundary; the one closest to [`SPLIT_TARGET`] wins.
fn split_point(entries: &[SlotEntry]) -> usize {
    let n: usize = entries.len();
    let is_boundary = |at: usize| at > 0 && at < n && entries[at - 1].ikey != entries[at].ikey;

    for distance in 0..n {
        if let Some(at) = SPLIT_TARGET.checked_sub(distance).filter(|&at| is_boundary(at)) {
            return at;
        }
        if is_boundary(SPLIT_TARGET + distance) {
            return SPLIT_TARGET + distance;
        }
    }

    debug_assert!(false, "no slice boundary in a full border node");
    n / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_ptr(v: u64) -> *mut u8 {
        Arc::into_raw(Arc::new(v)).cast_mut().cast()
    }

    fn read_value(p: *mut u8) -> u64 {
        // SAFETY: test payloads are live Arc<u64>.
        unsafe { *p.cast::<u64>() }
    }

    fn insert_key(node: &BorderNode<u64>, key: &[u8], v: u64) {
        let k = Key::new(key);
        let mut lock = node.base().lock();
        let pos = node
            .search(node.permutation(), k.ikey(), k.rank())
            .unwrap_err();
        node.insert_at(&mut lock, pos, k.ikey(), k.current_len(), value_ptr(v));
    }

    fn drop_node(node: BorderNode<u64>) {
        // SAFETY: node is owned by the test.
        unsafe { node.drop_values() };
    }

    #[test]
    fn test_lookup_distinguishes_lengths() {
        let node: BorderNode<u64> = BorderNode::new();
        insert_key(&node, b"ab", 1);
        insert_key(&node, b"ab\0", 2);
        insert_key(&node, b"a", 3);

        let order: Vec<u8> = node.entries(node.permutation()).map(|e| e.rank()).collect();
        assert_eq!(order, vec![1, 2, 3]);

        match node.lookup(&Key::new(b"ab")) {
            Lookup::Value(p) => assert_eq!(read_value(p), 1),
            other => panic!("unexpected {other:?}"),
        }
        match node.lookup(&Key::new(b"ab\0")) {
            Lookup::Value(p) => assert_eq!(read_value(p), 2),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(node.lookup(&Key::new(b"abc")), Lookup::NotFound);

        drop_node(node);
    }

    #[test]
    fn test_eight_byte_value_does_not_match_longer_key() {
        let node: BorderNode<u64> = BorderNode::new();
        insert_key(&node, b"abcdefgh", 1);

        assert!(matches!(node.lookup(&Key::new(b"abcdefgh")), Lookup::Value(_)));
        assert_eq!(node.lookup(&Key::new(b"abcdefghi")), Lookup::NotFound);

        drop_node(node);
    }

    #[test]
    fn test_promote_to_layer() {
        let node: BorderNode<u64> = BorderNode::new();
        insert_key(&node, b"abcdefgh", 1);

        let layer: BorderNode<u64> = BorderNode::new_root();
        let layer_ptr: *mut u8 = ptr::from_ref(&layer).cast_mut().cast();
        let old = node.entry(node.permutation().get(0)).payload;
        layer.push_unpublished(0, 0, old);

        {
            let mut lock = node.base().lock();
            node.promote_to_layer(&mut lock, node.permutation().get(0), layer_ptr);
        }

        assert_eq!(node.lookup(&Key::new(b"abcdefghij")), Lookup::Layer(layer_ptr));
        assert_eq!(node.lookup(&Key::new(b"abcdefgh")), Lookup::Layer(layer_ptr));

        let residual = Key::new(b"abcdefgh").shifted();
        match layer.lookup(&residual) {
            Lookup::Value(p) => assert_eq!(read_value(p), 1),
            other => panic!("unexpected {other:?}"),
        }

        // The value now belongs to the layer.
        drop_node(layer);
    }

    #[test]
    fn test_remove_and_reuse_order() {
        let node: BorderNode<u64> = BorderNode::new();
        for i in 0..14u8 {
            insert_key(&node, &[i + 1], u64::from(i));
        }

        let removed = {
            let mut lock = node.base().lock();
            node.remove_at(&mut lock, 0)
        };
        assert_eq!(node.n_removed(), 1);
        assert_eq!(node.size(), 13);
        // SAFETY: removed payload is a live Arc<u64> owned by the test now.
        unsafe { drop(Arc::from_raw(removed.payload.cast::<u64>())) };

        // The never-used slot goes first, the removed one last.
        insert_key(&node, &[100], 100);
        assert_eq!(node.n_removed(), 1);
        insert_key(&node, &[101], 101);
        assert_eq!(node.n_removed(), 0);
        assert_eq!(node.size(), WIDTH);

        drop_node(node);
    }

    #[test]
    fn test_split_keeps_equal_slices_together() {
        let node: BorderNode<u64> = BorderNode::new();
        // Ranks 1..=8 of slice "k" plus seven other slices.
        for len in 1..=8u64 {
            let mut key = b"k".to_vec();
            key.resize(len as usize, 0);
            insert_key(&node, &key, len);
        }
        for b in [b'a', b'b', b'c', b'x', b'y', b'z', b'w'] {
            insert_key(&node, &[b], u64::from(b));
        }
        assert_eq!(node.size(), WIDTH);

        let right: BorderNode<u64> = BorderNode::new();
        let node_ptr = ptr::from_ref(&node).cast_mut();
        let right_ptr = ptr::from_ref(&right).cast_mut();

        let low = {
            let mut lock = node.base().lock();
            let _right_lock = right.base().lock();
            node.split_into(&mut lock, node_ptr, &right, right_ptr)
        };

        let left_ikeys: Vec<u64> = node.entries(node.permutation()).map(|e| e.ikey).collect();
        let right_ikeys: Vec<u64> = right.entries(right.permutation()).map(|e| e.ikey).collect();

        assert_eq!(left_ikeys.len() + right_ikeys.len(), WIDTH);
        assert_eq!(right.low_key(), low);
        assert!(left_ikeys.iter().all(|&k| k < low));
        assert!(right_ikeys.iter().all(|&k| k >= low));
        assert_eq!(node.next(), right_ptr);
        assert_eq!(right.prev(), node_ptr);
        assert!(right.next().is_null());
        assert!(node.base().version().has_split(0));

        drop_node(node);
        drop_node(right);
    }

    #[test]
    fn test_split_point_prefers_middle() {
        let entries: Vec<SlotEntry> = (0..15u64)
            .map(|i| SlotEntry {
                ikey: i,
                keylen: 1,
                payload: ptr::null_mut(),
            })
            .collect();
        assert_eq!(split_point(&entries), SPLIT_TARGET);

        let clustered: Vec<SlotEntry> = (0..15u64)
            .map(|i| SlotEntry {
                ikey: if i < 10 { 7 } else { i },
                keylen: 1,
                payload: ptr::null_mut(),
            })
            .collect();
        assert_eq!(split_point(&clustered), 10);
    }
}
