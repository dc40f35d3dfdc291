//! # `masstree-lite`
//!
//! A concurrent ordered map from byte strings to values, built as a trie of
//! B+trees.
//!
//! - Keys are consumed 8 bytes at a time. Each 8-byte slice is an integer
//!   (`ikey`) and each trie level ("layer") is a B+tree over those integers.
//! - A key that continues past a slice lives behind a layer slot pointing at
//!   the next layer.
//! - Readers never lock: they read a node's version, read the node, and
//!   retry if the version moved.
//! - Writers lock only the border node they change, plus parents while a
//!   split propagates.
//!
//! ## Thread Safety
//!
//! [`Masstree<V>`] is `Send + Sync` when `V: Send + Sync`. Every operation
//! takes `&self`. Values come back as `Arc<V>`, so a value read by one thread
//! stays valid while another replaces or removes it.
//!
//! ```rust
//! use std::sync::Arc;
//! use std::thread;
//!
//! use masstree_lite::Masstree;
//!
//! let tree: Arc<Masstree<u64>> = Arc::new(Masstree::new());
//!
//! let handles: Vec<_> = (0..4u64)
//!     .map(|t| {
//!         let tree = Arc::clone(&tree);
//!         thread::spawn(move || {
//!             for i in 0..100u64 {
//!                 tree.put(&(t * 1_000 + i).to_be_bytes(), i).unwrap();
//!             }
//!         })
//!     })
//!     .collect();
//!
//! for h in handles {
//!     h.join().unwrap();
//! }
//! assert_eq!(tree.len(), 400);
//! ```
//!
//! Hot loops can enter the reclamation epoch once with [`Masstree::guard`]
//! and use the `*_with_guard` variants.
//!
//! ## Key Constraints
//!
//! - Keys are `&[u8]` of at most [`MAX_KEY_LENGTH`](key::MAX_KEY_LENGTH)
//!   bytes. Longer keys are rejected with [`MasstreeError::KeyTooLong`].
//! - Keys sort bytewise; a key sorts before any key it is a proper prefix of.
//!
//! ## Configuration
//!
//! [`TreeConfig`] bounds the number of restarts one operation may take. The
//! default comes from the `MASSTREE_MAX_RETRIES` environment variable.
//!
//! ## Logging
//!
//! With the `tracing` feature, splits, layer changes and exhausted retry
//! budgets are reported through the `tracing` crate.

#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod alloc;
pub mod border;
pub mod config;
pub mod interior;
pub mod key;
pub mod node;
pub mod ordering;
pub mod permutation;
pub mod tree;
pub mod version;

mod tracing_helpers;

pub use config::TreeConfig;
pub use tree::{Masstree, MasstreeError, RangeIter, TreeStats};
