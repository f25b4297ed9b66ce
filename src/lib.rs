//! A concurrent, in-memory, ordered byte-string index.
//!
//! The tree is a trie of B+-tree-like layers in the Mass Tree mold: keys
//! are consumed in 8-byte slices, each layer is a small fanout-15 tree over
//! one slice, and keys that keep colliding on their consumed slices descend
//! into deeper layers. Readers are lock-free — they snapshot per-node
//! version words, read optimistically, and retry or walk split siblings
//! when a writer got in the way. Writers lock individual nodes, never more
//! than three at once while carrying a split upward.
//!
//! Only point operations are offered: [`MassTree::put`] and
//! [`MassTree::get`]. Deletion and range scans are out of scope, though the
//! layout (key-ordered permutations, sibling links) is built so they could
//! be added without redesign.
//!
//! ```
//! use masstree::{MassTree, PutResult};
//!
//! let tree = MassTree::new();
//! assert!(matches!(tree.put(b"greeting", 1), PutResult::Inserted));
//! assert!(matches!(tree.put(b"greeting", 2), PutResult::AlreadyPresent(2)));
//! assert_eq!(tree.get(b"greeting"), Some(&1));
//! assert_eq!(tree.get(b"missing"), None);
//! ```

#[cfg(not(target_pointer_width = "64"))]
compile_error!("compilation is only possible for 64-bit targets");

mod key;
mod node;
mod tree;

pub use tree::{MassTree, PutResult};
