//! State shared by both node kinds.
//!
//! Interior and border nodes are `#[repr(C)]` and start with a [`NodeBase`],
//! so a type-erased node pointer (`*mut u8`) can be inspected through its base
//! before deciding which concrete type it is. Layer roots, child slots and
//! parent links are all stored erased.
//!
//! Parent links never own anything: every node is owned by the tree's arena.

use std::ptr;
use std::sync::atomic::AtomicPtr;

use crate::ordering::{READ_ORD, WRITE_ORD};
use crate::version::{LockGuard, VersionWord};

/// Header at offset 0 of every node.
#[derive(Debug)]
#[repr(C)]
pub struct NodeBase {
    version: VersionWord,
    parent: AtomicPtr<u8>,
}

impl NodeBase {
    /// Header for a new, unlinked node.
    #[must_use]
    pub const fn new(is_border: bool) -> Self {
        Self {
            version: VersionWord::new(is_border),
            parent: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// The node's version word.
    #[inline]
    #[must_use]
    pub const fn version(&self) -> &VersionWord {
        &self.version
    }

    /// Lock the node.
    #[inline]
    pub fn lock(&self) -> LockGuard<'_> {
        self.version.lock()
    }

    /// Stable version for an optimistic read.
    #[inline]
    #[must_use]
    pub fn stable(&self) -> u32 {
        self.version.stable()
    }

    /// Border (leaf) node?
    #[inline]
    #[must_use]
    pub fn is_border(&self) -> bool {
        self.version.is_border()
    }

    /// Parent interior node, or null at a layer root.
    #[inline]
    #[must_use]
    pub fn parent(&self) -> *mut u8 {
        self.parent.load(READ_ORD)
    }

    /// Point at a new parent. The caller holds the parent's lock, or owns the
    /// node exclusively.
    #[inline]
    pub fn set_parent(&self, parent: *mut u8) {
        self.parent.store(parent, WRITE_ORD);
    }
}

/// Base of an erased node pointer.
///
/// # Safety
///
/// `node` must point to a live `InteriorNode` or `BorderNode`, and the caller
/// must keep it alive for `'a` (an epoch guard or exclusive ownership).
#[inline]
#[must_use]
pub unsafe fn base<'a>(node: *const u8) -> &'a NodeBase {
    debug_assert!(!node.is_null());

    // SAFETY: both node types are repr(C) with NodeBase first.
    unsafe { &*node.cast::<NodeBase>() }
}

/// Walk parent links up to the current root of the node's layer.
///
/// A layer root pointer can be stale after the root split; the old root's
/// parent chain always leads to the new one.
///
/// # Safety
///
/// Same contract as [`base`] for `node` and every ancestor.
#[must_use]
pub unsafe fn maybe_parent(node: *mut u8) -> *mut u8 {
    let mut current: *mut u8 = node;

    loop {
        // SAFETY: forwarded from the caller.
        let parent: *mut u8 = unsafe { base(current) }.parent();

        if parent.is_null() {
            return current;
        }

        current = parent;
    }
}
