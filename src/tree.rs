//! The trie of B+trees.
//!
//! [`Masstree`] owns the top layer root, the node arena and the epoch
//! collector. Operations live in submodules:
//!
//! - `descend`: optimistic descent to a border node, and the locked variant
//! - `get`: lock-free lookup
//! - `put`: insert/update, including layer creation and promotion
//! - `split`: border and interior splits and their propagation
//! - `remove`: delete and collapse of emptied layers
//! - `scan`: ordered range iteration
//!
//! # Thread Safety
//!
//! All operations take `&self`. Readers never lock; writers lock the border
//! node they change and, on a split, walk up one parent at a time.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use seize::{Collector, LocalGuard};

use crate::alloc::NodeArena;
use crate::border::BorderNode;
use crate::config::TreeConfig;
use crate::key::MAX_KEY_LENGTH;
use crate::ordering::{READ_ORD, WRITE_ORD};
use crate::tracing_helpers::warn_log;

mod descend;
mod get;
mod put;
mod remove;
mod scan;
mod split;


pub use scan::RangeIter;

// ============================================================================
//  Errors
// ============================================================================

/// Errors surfaced by tree operations.
///
/// Lookup misses are not errors: they come back as `Ok(None)` / `Ok(false)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasstreeError {
    /// The key is longer than [`MAX_KEY_LENGTH`].
    KeyTooLong {
        /// Length of the rejected key.
        len: usize,
        /// Longest accepted key.
        max: usize,
    },

    /// The operation restarted more often than the configured budget allows.
    RetryLimitExceeded {
        /// Restarts performed before giving up.
        attempts: u32,
    },
}

impl fmt::Display for MasstreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyTooLong { len, max } => {
                write!(f, "key of {len} bytes exceeds the {max}-byte limit")
            }
            Self::RetryLimitExceeded { attempts } => {
                write!(f, "operation gave up after {attempts} restarts")
            }
        }
    }
}

impl std::error::Error for MasstreeError {}

/// Check a key against [`MAX_KEY_LENGTH`].
fn check_key(key: &[u8]) -> Result<(), MasstreeError> {
    if key.len() > MAX_KEY_LENGTH {
        return Err(MasstreeError::KeyTooLong {
            len: key.len(),
            max: MAX_KEY_LENGTH,
        });
    }

    Ok(())
}

/// Hand a value over to a slot.
#[inline]
fn into_payload<V>(value: Arc<V>) -> *mut u8 {
    Arc::into_raw(value).cast_mut().cast()
}

/// A new reference to the value behind a slot payload.
///
/// # Safety
///
/// `payload` came from [`into_payload::<V>`] and cannot be reclaimed before
/// this returns (the caller holds a guard, or the slot's lock).
#[inline]
unsafe fn clone_payload<V>(payload: *mut u8) -> Arc<V> {
    let ptr: *const V = payload.cast::<V>().cast_const();

    // SAFETY: forwarded from the caller.
    unsafe {
        Arc::increment_strong_count(ptr);
        Arc::from_raw(ptr)
    }
}

// ============================================================================
//  Retry budget
// ============================================================================

/// Restart counter for one operation.
#[derive(Debug)]
pub(crate) struct RetryBudget {
    used: u32,
    max: u32,
}

impl RetryBudget {
    const fn new(max: u32) -> Self {
        Self { used: 0, max }
    }

    /// A budget that never runs out, for work that must finish once started.
    const fn unbounded() -> Self {
        Self::new(u32::MAX)
    }

    /// Account for one restart. Fails once more than `max` restarts were spent.
    fn spend(&mut self, counters: &TreeCounters) -> Result<(), MasstreeError> {
        self.used = self.used.saturating_add(1);
        counters.restarts.fetch_add(1, Ordering::Relaxed);

        if self.used > self.max {
            warn_log!(attempts = self.used, "retry budget exhausted");
            return Err(MasstreeError::RetryLimitExceeded {
                attempts: self.used,
            });
        }

        if self.used % 64 == 0 {
            std::thread::yield_now();
        }

        Ok(())
    }
}

// ============================================================================
//  Counters
// ============================================================================

/// Structural event counters, shared by all threads.
#[derive(Debug, Default)]
pub(crate) struct TreeCounters {
    border_splits: AtomicU64,
    interior_splits: AtomicU64,
    root_promotions: AtomicU64,
    layers_created: AtomicU64,
    layer_collapses: AtomicU64,
    restarts: AtomicU64,
}

/// Snapshot of a tree's structural event counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Border node splits.
    pub border_splits: u64,
    /// Interior node splits.
    pub interior_splits: u64,
    /// New layer roots created above a split root.
    pub root_promotions: u64,
    /// Layers created, by promotion or by a long key.
    pub layers_created: u64,
    /// Emptied layers unlinked by a delete.
    pub layer_collapses: u64,
    /// Traversal restarts.
    pub restarts: u64,
    /// Border nodes currently owned by the tree.
    pub border_nodes: usize,
    /// Interior nodes currently owned by the tree.
    pub interior_nodes: usize,
}

// ============================================================================
//  Masstree
// ============================================================================

/// A concurrent ordered map from byte strings to `Arc<V>`.
///
/// # Example
///
/// ```rust
/// use masstree_lite::Masstree;
///
/// let tree: Masstree<u64> = Masstree::new();
/// tree.put(b"hello", 1).unwrap();
/// assert_eq!(tree.get(b"hello").unwrap().as_deref(), Some(&1));
/// assert!(tree.delete(b"hello").unwrap());
/// assert!(!tree.delete(b"hello").unwrap());
/// ```
pub struct Masstree<V> {
    /// Root of the top layer. May lag behind a root split; descents climb
    /// parent links from here.
    root: AtomicPtr<u8>,
    len: AtomicUsize,
    config: TreeConfig,
    counters: TreeCounters,
    // Field order matters for Drop: the arena frees live nodes first, then
    // the collector runs what is still retired.
    arena: NodeArena<V>,
    collector: Collector,
}

// SAFETY: all shared state is atomics, the arena (Send + Sync for V: Send + Sync)
// and the collector. Values are handed out as Arc<V>.
unsafe impl<V: Send + Sync> Send for Masstree<V> {}
// SAFETY: see above.
unsafe impl<V: Send + Sync> Sync for Masstree<V> {}

impl<V> fmt::Debug for Masstree<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Masstree")
            .field("len", &self.len())
            .field("config", &self.config)
            .field("arena", &self.arena)
            .finish_non_exhaustive()
    }
}

impl<V: Send + Sync + 'static> Default for Masstree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Masstree<V> {
    /// Number of keys.
    ///
    /// Exact when no writer is running; otherwise a recent value.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// No keys?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Enter an epoch. Pointers read from the tree stay valid until the
    /// guard drops.
    #[must_use]
    pub fn guard(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }

    /// Structural counters and node counts.
    #[must_use]
    pub fn stats(&self) -> TreeStats {
        let c: &TreeCounters = &self.counters;

        TreeStats {
            border_splits: c.border_splits.load(Ordering::Relaxed),
            interior_splits: c.interior_splits.load(Ordering::Relaxed),
            root_promotions: c.root_promotions.load(Ordering::Relaxed),
            layers_created: c.layers_created.load(Ordering::Relaxed),
            layer_collapses: c.layer_collapses.load(Ordering::Relaxed),
            restarts: c.restarts.load(Ordering::Relaxed),
            border_nodes: self.arena.border_count(),
            interior_nodes: self.arena.interior_count(),
        }
    }

    #[inline]
    fn load_root(&self) -> *mut u8 {
        self.root.load(READ_ORD)
    }

    #[inline]
    fn budget(&self) -> RetryBudget {
        RetryBudget::new(self.config.max_retries)
    }
}

impl<V: Send + Sync + 'static> Masstree<V> {
    /// An empty tree with the process-wide config (see [`TreeConfig::global`]).
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(TreeConfig::global())
    }

    /// An empty tree with an explicit config.
    #[must_use]
    pub fn with_config(config: TreeConfig) -> Self {
        let arena: NodeArena<V> = NodeArena::new();
        let root: *mut BorderNode<V> = arena.alloc_border(BorderNode::new_root());

        Self {
            root: AtomicPtr::new(root.cast()),
            len: AtomicUsize::new(0),
            config,
            counters: TreeCounters::default(),
            arena,
            collector: Collector::new(),
        }
    }

    /// Replace the top root after it split. Called with the old root locked.
    fn install_root(&self, old: *mut u8, new: *mut u8) {
        if self.root.load(READ_ORD) == old {
            self.root.store(new, WRITE_ORD);
        }
    }
}

impl<V> Drop for Masstree<V> {
    fn drop(&mut self) {
        self.arena.teardown();
    }
}
