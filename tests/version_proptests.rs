//! Property-based tests for the `version` module.
//!
//! The unlock transition is a pure function of the locked word, so most
//! properties are checked on arbitrary words. A few drive a real
//! `VersionWord` through lock/mark/unlock sequences.

use masstree_lite::version::{
    BORDER_BIT, DELETED_BIT, DIRTY_MASK, INSERT_LOWBIT, INSERT_MASK, INSERTING_BIT, LOCK_BIT, ROOT_BIT,
    SPLIT_LOWBIT, SPLIT_MASK, SPLITTING_BIT, VersionState, VersionWord, changed_between, split_between, unlocked_value,
};
use proptest::prelude::*;

/// Words as a writer holds them: locked, bit 31 clear.
fn locked_word() -> impl Strategy<Value = u32> {
    (0u32..0x8000_0000).prop_map(|w| w | LOCK_BIT)
}

#[derive(Debug, Clone, Copy)]
enum Mark {
    None,
    Inserting,
    Splitting,
    Both,
}

fn mark() -> impl Strategy<Value = Mark> {
    prop_oneof![
        Just(Mark::None),
        Just(Mark::Inserting),
        Just(Mark::Splitting),
        Just(Mark::Both),
    ]
}

// ============================================================================
//  Unlock Transition
// ============================================================================

proptest! {
    /// Unlocking always clears the lock and dirty bits.
    #[test]
    fn unlock_clears_lock_and_dirty(word in locked_word()) {
        let next = unlocked_value(word);
        prop_assert_eq!(next & (LOCK_BIT | DIRTY_MASK), 0);
    }

    /// Node type and deletion survive the unlock.
    #[test]
    fn unlock_keeps_border_and_deleted(word in locked_word()) {
        let next = unlocked_value(word);
        prop_assert_eq!(next & (BORDER_BIT | DELETED_BIT), word & (BORDER_BIT | DELETED_BIT));
    }

    /// A dirty unlock is always visible to a reader holding the old stable word.
    #[test]
    fn dirty_unlock_is_a_change(word in locked_word()) {
        prop_assume!(word & DIRTY_MASK != 0);

        let stable_before = word & !(LOCK_BIT | DIRTY_MASK);
        prop_assert!(changed_between(stable_before, unlocked_value(word)));
    }

    /// A clean unlock restores exactly the word seen before locking.
    #[test]
    fn clean_unlock_is_not_a_change(word in locked_word()) {
        let word = word & !DIRTY_MASK;
        let stable_before = word & !LOCK_BIT;

        prop_assert_eq!(unlocked_value(word), stable_before);
        prop_assert!(!changed_between(stable_before, word));
    }

    /// Only a split moves the split generation, and it clears root.
    #[test]
    fn split_generation_tracks_splits(word in locked_word()) {
        let stable_before = word & !(LOCK_BIT | DIRTY_MASK);
        let next = unlocked_value(word);

        if word & SPLITTING_BIT != 0 {
            prop_assert!(split_between(stable_before, next));
            prop_assert_eq!(next & ROOT_BIT, 0);
            prop_assert_eq!(
                next & SPLIT_MASK,
                (word & SPLIT_MASK).wrapping_add(SPLIT_LOWBIT) & SPLIT_MASK
            );
        } else {
            prop_assert!(!split_between(stable_before, next));
            prop_assert_eq!(next & SPLIT_MASK, word & SPLIT_MASK);
        }
    }

    /// An insert moves the insert generation by one, wrapping in its field.
    #[test]
    fn insert_generation_tracks_inserts(word in locked_word()) {
        let next = unlocked_value(word);
        let expected = if word & INSERTING_BIT != 0 {
            (word & INSERT_MASK).wrapping_add(INSERT_LOWBIT) & INSERT_MASK
        } else {
            word & INSERT_MASK
        };

        prop_assert_eq!(next & INSERT_MASK, expected);
    }

    /// `Deleted` outranks the dirty flags.
    #[test]
    fn deleted_state_wins(word: u32) {
        let state = VersionState::of(word | DELETED_BIT);
        prop_assert_eq!(state, VersionState::Deleted);
    }
}

// ============================================================================
//  Lock Sequences
// ============================================================================

proptest! {
    /// Any sequence of locked sections leaves an unlocked, clean word, and
    /// readers see a change exactly when some section marked one.
    #[test]
    fn lock_sequences(marks in prop::collection::vec(mark(), 0..50), border: bool, root: bool) {
        let v = VersionWord::new(border);
        if root {
            v.mark_root();
        }
        let start = v.stable();
        let mut dirty = false;
        let mut split = false;

        for m in marks {
            let mut guard = v.lock();
            match m {
                Mark::None => {}
                Mark::Inserting => guard.mark_inserting(),
                Mark::Splitting => guard.mark_splitting(),
                Mark::Both => {
                    guard.mark_inserting();
                    guard.mark_splitting();
                }
            }
            dirty |= !matches!(m, Mark::None);
            split |= matches!(m, Mark::Splitting | Mark::Both);
            drop(guard);

            prop_assert!(!v.is_locked());
            prop_assert!(!v.is_dirty());
        }

        prop_assert_eq!(v.has_changed(start), dirty);
        prop_assert_eq!(v.has_split(start), split);
        prop_assert_eq!(v.is_border(), border);
        prop_assert_eq!(v.is_root(), root && !split);
    }
}
