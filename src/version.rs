//! Node version word for optimistic concurrency control.
//!
//! [`VersionWord`] packs the lock, dirty flags, node metadata and two
//! generation counters into one `u32`:
//!
//! ```text
//!  31 | 30 ............ 13 | 12 ...... 6 |   5    |  4   |    3    |    2      |     1     |   0
//! ----+--------------------+-------------+--------+------+---------+-----------+-----------+--------
//!  -- |  split generation  |  insert gen | border | root | deleted | splitting | inserting | locked
//! ```
//!
//! # Protocol
//! 1. Readers: `stable()`, read the node, then `has_changed()` / `has_split()`.
//! 2. Writers: `lock()` returns a [`LockGuard`]; mark the kind of change; drop the guard.
//!
//! Dropping the guard applies [`unlocked_value`], the whole unlock transition:
//! an insert bumps the insert generation, a split (or delete) bumps the split
//! generation and clears `root`.

use std::hint;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, fence};
use std::thread;

use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, RELAXED, UNLOCK_ORD, VERSION_ORD};

#[cfg(test)]
mod concurrent_tests;


// ============================================================================
//  Bit Layout
// ============================================================================

/// Held by a writer.
pub const LOCK_BIT: u32 = 1 << 0;

/// Content of the node is being changed in place.
pub const INSERTING_BIT: u32 = 1 << 1;

/// Node is being split.
pub const SPLITTING_BIT: u32 = 1 << 2;

/// Node was unlinked and must not be used.
pub const DELETED_BIT: u32 = 1 << 3;

/// Node is the root of its layer.
pub const ROOT_BIT: u32 = 1 << 4;

/// Node is a border (leaf) node.
pub const BORDER_BIT: u32 = 1 << 5;

/// Either dirty flag.
pub const DIRTY_MASK: u32 = INSERTING_BIT | SPLITTING_BIT;

/// Unit of the 7-bit insert generation.
pub const INSERT_LOWBIT: u32 = 1 << 6;

/// Insert generation field.
pub const INSERT_MASK: u32 = 0x7F << 6;

/// Unit of the 18-bit split generation.
pub const SPLIT_LOWBIT: u32 = 1 << 13;

/// Split generation field.
pub const SPLIT_MASK: u32 = 0x3_FFFF << 13;

/// Spins before a waiting locker yields its core.
const SPINS_BEFORE_YIELD: u32 = 64;

// ============================================================================
//  Transition table
// ============================================================================

/// What a version word says about in-flight work on its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionState {
    /// No writer is changing the node.
    Stable,
    /// A writer is changing slots in place.
    Inserting,
    /// A writer is moving entries to a new sibling.
    Splitting,
    /// The node has been unlinked.
    Deleted,
}

impl VersionState {
    /// Classify a raw word. `Deleted` wins over the dirty flags.
    #[must_use]
    pub const fn of(word: u32) -> Self {
        if word & DELETED_BIT != 0 {
            Self::Deleted
        } else if word & SPLITTING_BIT != 0 {
            Self::Splitting
        } else if word & INSERTING_BIT != 0 {
            Self::Inserting
        } else {
            Self::Stable
        }
    }
}

/// The word a locked node holds after its lock is released.
///
/// | flag set at unlock | effect                                          |
/// |--------------------|-------------------------------------------------|
/// | `inserting`        | insert generation + 1 (wraps within its field)  |
/// | `splitting`        | split generation + 1 (wraps), `root` cleared     |
/// | always             | `locked`, `inserting`, `splitting` cleared       |
#[must_use]
pub const fn unlocked_value(word: u32) -> u32 {
    let mut next: u32 = word;

    if word & INSERTING_BIT != 0 {
        next = (next & !INSERT_MASK) | (next.wrapping_add(INSERT_LOWBIT) & INSERT_MASK);
    }

    if word & SPLITTING_BIT != 0 {
        next = (next & !SPLIT_MASK) | (next.wrapping_add(SPLIT_LOWBIT) & SPLIT_MASK);
        next &= !ROOT_BIT;
    }

    next & !(LOCK_BIT | DIRTY_MASK)
}

/// True if `old` and `current` differ in anything but the lock bit.
#[inline]
#[must_use]
pub const fn changed_between(old: u32, current: u32) -> bool {
    (old ^ current) > LOCK_BIT
}

/// True if the split generation moved between `old` and `current`.
#[inline]
#[must_use]
pub const fn split_between(old: u32, current: u32) -> bool {
    (old ^ current) >= SPLIT_LOWBIT
}

// ============================================================================
//  VersionWord
// ============================================================================

/// The version word embedded at the start of every node.
///
/// # Example
///
/// ```rust
/// use masstree_lite::version::VersionWord;
///
/// let v = VersionWord::new(true);
/// let before = v.stable();
/// {
///     let mut guard = v.lock();
///     guard.mark_inserting();
/// }
/// assert!(v.has_changed(before));
/// assert!(!v.has_split(before));
/// ```
#[derive(Debug)]
pub struct VersionWord {
    value: AtomicU32,
}

/// Proof that a node lock is held.
///
/// Only [`VersionWord::lock`] and [`VersionWord::try_lock`] create one. The
/// lock is released with the unlock transition when the guard drops, also
/// during unwinding. `PhantomData<*mut ()>` keeps the guard on the locking thread.
#[derive(Debug)]
#[must_use = "dropping the guard releases the lock immediately"]
pub struct LockGuard<'a> {
    version: &'a VersionWord,
    locked_value: u32,
    _marker: PhantomData<*mut ()>,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.version
            .value
            .store(unlocked_value(self.locked_value), UNLOCK_ORD);
    }
}

impl LockGuard<'_> {
    /// Word as seen by the lock holder, lock bit included.
    #[inline]
    #[must_use]
    pub const fn locked_value(&self) -> u32 {
        self.locked_value
    }

    /// The version this guard protects.
    #[inline]
    #[must_use]
    pub const fn version(&self) -> &VersionWord {
        self.version
    }

    #[inline]
    fn publish(&mut self, word: u32) {
        self.locked_value = word;
        self.version.value.store(word, RELAXED);
        // Flag before payload.
        fence(std::sync::atomic::Ordering::Release);
    }

    /// Announce in-place slot changes. Readers spin until the unlock.
    #[inline]
    pub fn mark_inserting(&mut self) {
        if self.locked_value & INSERTING_BIT == 0 {
            self.publish(self.locked_value | INSERTING_BIT);
        }
    }

    /// Announce a split. The split generation moves on unlock.
    #[inline]
    pub fn mark_splitting(&mut self) {
        if self.locked_value & SPLITTING_BIT == 0 {
            self.publish(self.locked_value | SPLITTING_BIT);
        }
    }

    /// Mark the node unlinked. Also counts as a split so readers restart.
    #[inline]
    pub fn mark_deleted(&mut self) {
        self.publish(self.locked_value | DELETED_BIT | SPLITTING_BIT);
    }

    /// Set the layer-root flag.
    #[inline]
    pub fn mark_root(&mut self) {
        self.publish(self.locked_value | ROOT_BIT);
    }

    /// Clear the layer-root flag.
    #[inline]
    pub fn mark_nonroot(&mut self) {
        self.publish(self.locked_value & !ROOT_BIT);
    }
}

impl VersionWord {
    /// A fresh, unlocked version.
    #[must_use]
    pub const fn new(is_border: bool) -> Self {
        let initial: u32 = if is_border { BORDER_BIT } else { 0 };

        Self {
            value: AtomicU32::new(initial),
        }
    }

    /// A version with a raw starting value. Test use only.
    #[must_use]
    pub const fn from_value(value: u32) -> Self {
        Self {
            value: AtomicU32::new(value),
        }
    }

    /// Current word, no synchronization.
    #[inline]
    #[must_use]
    pub fn value(&self) -> u32 {
        self.value.load(RELAXED)
    }

    /// State of the node right now.
    #[inline]
    #[must_use]
    pub fn state(&self) -> VersionState {
        VersionState::of(self.value())
    }

    // ========================================================================
    //  Flag Accessors
    // ========================================================================

    /// Border (leaf) node?
    #[inline]
    #[must_use]
    pub fn is_border(&self) -> bool {
        self.value() & BORDER_BIT != 0
    }

    /// Layer root? Only authoritative under the lock.
    #[inline]
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.value() & ROOT_BIT != 0
    }

    /// Unlinked?
    #[inline]
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.value() & DELETED_BIT != 0
    }

    /// Held by a writer?
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.value() & LOCK_BIT != 0
    }

    /// Inserting or splitting?
    #[inline]
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.value() & DIRTY_MASK != 0
    }

    // ========================================================================
    //  Optimistic Reads
    // ========================================================================

    /// A version with no dirty flag set, spinning while a writer is mid-change.
    #[inline]
    #[must_use]
    pub fn stable(&self) -> u32 {
        let mut spins: u32 = 0;

        loop {
            let value: u32 = self.value.load(VERSION_ORD);

            if value & DIRTY_MASK == 0 {
                return value;
            }

            backoff(&mut spins);
        }
    }

    /// Did anything but the lock bit change since `old`?
    ///
    /// Issues an acquire fence first, so every slot read made before the call
    /// is covered by the check.
    #[inline]
    #[must_use]
    pub fn has_changed(&self, old: u32) -> bool {
        fence(std::sync::atomic::Ordering::Acquire);
        changed_between(old, self.value.load(RELAXED))
    }

    /// Did the split generation move since `old`?
    #[inline]
    #[must_use]
    pub fn has_split(&self, old: u32) -> bool {
        fence(std::sync::atomic::Ordering::Acquire);
        split_between(old, self.value.load(RELAXED))
    }

    // ========================================================================
    //  Locking
    // ========================================================================

    /// Spin until the lock is acquired.
    pub fn lock(&self) -> LockGuard<'_> {
        let mut spins: u32 = 0;

        loop {
            let value: u32 = self.value.load(RELAXED);

            if value & LOCK_BIT == 0
                && self
                    .value
                    .compare_exchange_weak(value, value | LOCK_BIT, CAS_SUCCESS, CAS_FAILURE)
                    .is_ok()
            {
                return LockGuard {
                    version: self,
                    locked_value: value | LOCK_BIT,
                    _marker: PhantomData,
                };
            }

            backoff(&mut spins);
        }
    }

    /// One lock attempt.
    #[must_use]
    pub fn try_lock(&self) -> Option<LockGuard<'_>> {
        let value: u32 = self.value.load(RELAXED);

        if value & LOCK_BIT != 0 {
            return None;
        }

        self.value
            .compare_exchange(value, value | LOCK_BIT, CAS_SUCCESS, CAS_FAILURE)
            .ok()
            .map(|_| LockGuard {
                version: self,
                locked_value: value | LOCK_BIT,
                _marker: PhantomData,
            })
    }

    /// Set the root flag on a node nobody else can see yet.
    pub fn mark_root(&self) {
        let value: u32 = self.value.load(RELAXED);
        self.value.store(value | ROOT_BIT, UNLOCK_ORD);
    }

    /// Set the border flag on a node nobody else can see yet.
    pub fn mark_border(&self) {
        let value: u32 = self.value.load(RELAXED);
        self.value.store(value | BORDER_BIT, UNLOCK_ORD);
    }
}

#[inline]
fn backoff(spins: &mut u32) {
    if *spins < SPINS_BEFORE_YIELD {
        *spins += 1;
        hint::spin_loop();
    } else {
        *spins = 0;
        thread::yield_now();
    }
}

impl Default for VersionWord {
    /// A border version.
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_gen(word: u32) -> u32 {
        (word & INSERT_MASK) >> 6
    }

    fn split_gen(word: u32) -> u32 {
        (word & SPLIT_MASK) >> 13
    }

    #[test]
    fn test_field_layout() {
        assert_eq!(INSERT_MASK, 0x1FC0);
        assert_eq!(SPLIT_MASK, 0x7FFF_E000);
        assert_eq!(INSERT_MASK & SPLIT_MASK, 0);
        assert_eq!(SPLIT_MASK & (1 << 31), 0);
    }

    #[test]
    fn test_new_border() {
        let v = VersionWord::new(true);
        assert!(v.is_border());
        assert!(!v.is_root());
        assert!(!v.is_locked());
        assert!(!v.is_deleted());
        assert_eq!(v.state(), VersionState::Stable);
    }

    #[test]
    fn test_new_interior() {
        let v = VersionWord::new(false);
        assert!(!v.is_border());
        v.mark_border();
        assert!(v.is_border());
    }

    #[test]
    fn test_lock_without_marks_keeps_version() {
        let v = VersionWord::new(true);
        let before: u32 = v.stable();

        {
            let guard: LockGuard<'_> = v.lock();
            assert!(v.is_locked());
            assert_eq!(guard.locked_value() & LOCK_BIT, LOCK_BIT);
            assert!(!v.has_changed(before));
        }

        assert!(!v.is_locked());
        assert_eq!(v.value(), before);
    }

    #[test]
    fn test_try_lock() {
        let v = VersionWord::new(true);

        let first: Option<LockGuard<'_>> = v.try_lock();
        assert!(first.is_some());
        assert!(v.try_lock().is_none());

        drop(first);
        assert!(v.try_lock().is_some());
    }

    #[test]
    fn test_insert_bumps_insert_generation_only() {
        let v = VersionWord::new(true);
        let before: u32 = v.stable();

        {
            let mut guard = v.lock();
            guard.mark_inserting();
            assert_eq!(v.state(), VersionState::Inserting);
            assert!(v.is_dirty());
        }

        let after: u32 = v.stable();
        assert_eq!(insert_gen(after), insert_gen(before) + 1);
        assert_eq!(split_gen(after), split_gen(before));
        assert!(v.has_changed(before));
        assert!(!v.has_split(before));
    }

    #[test]
    fn test_split_bumps_split_generation_and_clears_root() {
        let v = VersionWord::new(true);
        v.mark_root();
        let before: u32 = v.stable();

        {
            let mut guard = v.lock();
            guard.mark_splitting();
            assert_eq!(v.state(), VersionState::Splitting);
        }

        let after: u32 = v.stable();
        assert_eq!(split_gen(after), split_gen(before) + 1);
        assert_eq!(insert_gen(after), insert_gen(before));
        assert!(!v.is_root());
        assert!(v.has_split(before));
    }

    #[test]
    fn test_insert_and_split_both_bump() {
        let word: u32 = BORDER_BIT | LOCK_BIT | INSERTING_BIT | SPLITTING_BIT | ROOT_BIT;
        let next: u32 = unlocked_value(word);

        assert_eq!(insert_gen(next), 1);
        assert_eq!(split_gen(next), 1);
        assert_eq!(next & (LOCK_BIT | DIRTY_MASK | ROOT_BIT), 0);
        assert_ne!(next & BORDER_BIT, 0);
    }

    #[test]
    fn test_insert_generation_wraps_within_field() {
        let word: u32 = INSERT_MASK | SPLIT_LOWBIT | LOCK_BIT | INSERTING_BIT;
        let next: u32 = unlocked_value(word);

        assert_eq!(insert_gen(next), 0);
        assert_eq!(split_gen(next), 1, "insert carry must not leak into split");
    }

    #[test]
    fn test_split_generation_wraps_within_field() {
        let word: u32 = SPLIT_MASK | LOCK_BIT | SPLITTING_BIT;
        let next: u32 = unlocked_value(word);

        assert_eq!(split_gen(next), 0);
        assert_eq!(next & (1 << 31), 0);
    }

    #[test]
    fn test_mark_deleted() {
        let v = VersionWord::new(true);
        let before: u32 = v.stable();

        {
            let mut guard = v.lock();
            guard.mark_deleted();
        }

        assert!(v.is_deleted());
        assert_eq!(v.state(), VersionState::Deleted);
        assert!(v.has_split(before));
    }

    #[test]
    fn test_mark_nonroot_clears_only_root() {
        let v = VersionWord::new(true);
        v.mark_root();

        {
            let mut guard = v.lock();
            guard.mark_nonroot();
            assert!(!v.is_root());
            assert!(v.is_border());
            guard.mark_root();
            assert!(v.is_root());
        }

        assert!(v.is_root());
        assert!(v.is_border());
    }

    #[test]
    fn test_state_priority() {
        assert_eq!(VersionState::of(0), VersionState::Stable);
        assert_eq!(VersionState::of(INSERTING_BIT), VersionState::Inserting);
        assert_eq!(
            VersionState::of(INSERTING_BIT | SPLITTING_BIT),
            VersionState::Splitting
        );
        assert_eq!(
            VersionState::of(DELETED_BIT | SPLITTING_BIT),
            VersionState::Deleted
        );
    }

    #[test]
    fn test_lock_bit_alone_is_not_a_change() {
        assert!(!changed_between(0, LOCK_BIT));
        assert!(changed_between(0, INSERTING_BIT));
        assert!(!split_between(0, INSERT_MASK | ROOT_BIT));
        assert!(split_between(0, SPLIT_LOWBIT));
    }

    #[test]
    fn test_guard_unlocks_on_panic() {
        let v = VersionWord::new(true);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut guard = v.lock();
            guard.mark_inserting();
            panic!("writer failed");
        }));

        assert!(result.is_err());
        assert!(!v.is_locked());
        assert!(!v.is_dirty());
    }
}
