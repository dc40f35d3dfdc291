//! Node ownership and deferred reclamation.
//!
//! [`NodeArena`] owns every node of a tree. Nodes are boxed once, handed out
//! as raw pointers, and registered so that dropping the tree frees whatever is
//! still linked. A node that gets unlinked while the tree is live is first
//! removed from the registry and then retired through the `seize` collector,
//! so it is freed only after every reader that might still hold it has left
//! its epoch.
//!
//! Replaced and removed values (`Arc<V>` raw pointers) are retired the same way.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use seize::{Collector, Guard, LocalGuard};

use crate::border::BorderNode;
use crate::interior::InteriorNode;

// ============================================================================
//  Reclaimers (seize callbacks)
// ============================================================================

/// Free a retired border node.
///
/// # Safety
///
/// `ptr` came from `Box::into_raw` and is unreachable for new readers.
unsafe fn reclaim_border<V>(ptr: *mut BorderNode<V>, _collector: &Collector) {
    // SAFETY: guaranteed by the caller and by seize's epoch tracking.
    unsafe { drop(Box::from_raw(ptr)) };
}

/// Release the tree's reference to a retired value.
///
/// # Safety
///
/// `ptr` came from `Arc::into_raw` and its slot no longer references it.
unsafe fn reclaim_value<V>(ptr: *mut V, _collector: &Collector) {
    // SAFETY: guaranteed by the caller and by seize's epoch tracking.
    unsafe { drop(Arc::from_raw(ptr.cast_const())) };
}

/// Retire a value pointer that a slot no longer references.
///
/// # Safety
///
/// `ptr` came from `Arc::into_raw::<V>` and no slot points to it any more.
pub(crate) unsafe fn retire_value<V>(guard: &LocalGuard<'_>, ptr: *mut u8) {
    // SAFETY: forwarded from the caller.
    unsafe { guard.defer_retire(ptr.cast::<V>(), reclaim_value::<V>) };
}

// ============================================================================
//  NodeArena
// ============================================================================

/// Registry of all live nodes of one tree.
pub struct NodeArena<V> {
    borders: Mutex<Vec<*mut BorderNode<V>>>,
    interiors: Mutex<Vec<*mut InteriorNode>>,
}

// SAFETY: the pointers are owned by the arena and guarded by the mutexes.
// Values cross threads, so V must be Send + Sync.
unsafe impl<V: Send + Sync> Send for NodeArena<V> {}
// SAFETY: see above.
unsafe impl<V: Send + Sync> Sync for NodeArena<V> {}

impl<V> fmt::Debug for NodeArena<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeArena")
            .field("borders", &self.border_count())
            .field("interiors", &self.interior_count())
            .finish()
    }
}

impl<V> Default for NodeArena<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> NodeArena<V> {
    /// An empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            borders: Mutex::new(Vec::new()),
            interiors: Mutex::new(Vec::new()),
        }
    }

    /// Box and register a border node.
    pub fn alloc_border(&self, node: BorderNode<V>) -> *mut BorderNode<V> {
        let ptr: *mut BorderNode<V> = Box::into_raw(Box::new(node));
        self.borders.lock().push(ptr);
        ptr
    }

    /// Box and register an interior node.
    pub fn alloc_interior(&self, node: InteriorNode) -> *mut InteriorNode {
        let ptr: *mut InteriorNode = Box::into_raw(Box::new(node));
        self.interiors.lock().push(ptr);
        ptr
    }

    /// Registered border nodes.
    #[must_use]
    pub fn border_count(&self) -> usize {
        self.borders.lock().len()
    }

    /// Registered interior nodes.
    #[must_use]
    pub fn interior_count(&self) -> usize {
        self.interiors.lock().len()
    }

    /// Unregister an unlinked border node and hand it to the collector.
    ///
    /// # Safety
    ///
    /// `ptr` came from [`alloc_border`](Self::alloc_border) on this arena, is
    /// no longer reachable from any root or sibling link, holds no values,
    /// and is retired only once.
    pub unsafe fn retire_border(&self, ptr: *mut BorderNode<V>, guard: &LocalGuard<'_>) {
        {
            let mut borders = self.borders.lock();
            if let Some(index) = borders.iter().position(|&p| p == ptr) {
                borders.swap_remove(index);
            } else {
                debug_assert!(false, "retiring a border node the arena does not own");
                return;
            }
        }

        // SAFETY: forwarded from the caller; the arena no longer frees it.
        unsafe { guard.defer_retire(ptr, reclaim_border::<V>) };
    }

    /// Free every registered node and the values they still hold.
    ///
    /// Requires exclusive access, so no reader can be inside the tree.
    pub fn teardown(&mut self) {
        for ptr in std::mem::take(self.borders.get_mut()) {
            // SAFETY: the pointer came from Box::into_raw in alloc_border and
            // `&mut self` rules out concurrent access.
            unsafe {
                (*ptr).drop_values();
                drop(Box::from_raw(ptr));
            }
        }

        for ptr in std::mem::take(self.interiors.get_mut()) {
            // SAFETY: the pointer came from Box::into_raw in alloc_interior.
            unsafe { drop(Box::from_raw(ptr)) };
        }
    }
}

impl<V> Drop for NodeArena<V> {
    fn drop(&mut self) {
        self.teardown();
    }
}
