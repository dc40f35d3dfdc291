//! Memory orderings used for node access.
//!
//! Every atomic access in the tree goes through one of these names so the
//! pairing between writers and optimistic readers stays visible at the call site.

use std::sync::atomic::Ordering;

/// Loads of published pointers (children, layer roots, values, siblings).
/// Pairs with [`WRITE_ORD`].
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Stores that publish a pointer or a permutation under a node lock.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Lock acquisition CAS on success.
pub const CAS_SUCCESS: Ordering = Ordering::Acquire;

/// Lock acquisition CAS on failure. Only the current value is needed.
pub const CAS_FAILURE: Ordering = Ordering::Relaxed;

/// Slot fields read inside a validated snapshot, or written under a lock.
/// The version fences order them.
pub const RELAXED: Ordering = Ordering::Relaxed;

/// Version load in `stable()`.
pub const VERSION_ORD: Ordering = Ordering::Acquire;

/// Version store that releases a lock.
pub const UNLOCK_ORD: Ordering = Ordering::Release;
