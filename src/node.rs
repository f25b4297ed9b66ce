//! The node layer: the two node kinds, their versioned-lock protocol, and
//! the per-node search/insert/split primitives.
//!
//! Both kinds open with the same `#[repr(C)]` header — version word,
//! packed permutation, parent back-reference — so a `*mut NodeHeader` can
//! stand in for either until the version word's `IS_BORDER` flag settles
//! which one it is. The layer knows nothing of tree topology; the tree
//! layer drives it purely through this contract.
//!
//! Parent pointers are back-references, not ownership: they are only ever
//! followed by first observing the child's version and then relocking as
//! [`NodeHeader::locked_parent`] prescribes.

pub(crate) mod border;
pub(crate) mod interior;
pub(crate) mod permutation;
pub(crate) mod suffix;
pub(crate) mod version;

use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use core::sync::atomic::{AtomicPtr, AtomicU64};

pub(crate) use border::{Border, EntryTag, InsertOutcome, Match};
pub(crate) use interior::Interior;
pub(crate) use permutation::{Permutation, FANOUT};
pub(crate) use version::{Version, VersionWord};

/// Header shared by both node kinds.
#[repr(C)]
pub(crate) struct NodeHeader {
    version: VersionWord,
    permutation: AtomicU64,
    parent: AtomicPtr<NodeHeader>,
}

impl NodeHeader {
    pub fn new(flags: u32) -> Self {
        NodeHeader {
            version: VersionWord::new(flags),
            permutation: AtomicU64::new(Permutation::empty().bits()),
            parent: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    pub fn version(&self) -> &VersionWord {
        &self.version
    }

    pub fn permutation(&self) -> Permutation {
        Permutation::from_bits(self.permutation.load(Acquire))
    }

    /// Publishes a new permutation. Lock must be held, and the intent bit
    /// covering the change must already be set.
    pub fn set_permutation(&self, perm: Permutation) {
        debug_assert!(self.version.get().is_locked());
        self.permutation.store(perm.bits(), Release);
    }

    pub fn parent(&self) -> *mut NodeHeader {
        self.parent.load(Acquire)
    }

    pub fn set_parent(&self, parent: *mut NodeHeader) {
        self.parent.store(parent, Release);
    }

    /// Kind flag; fixed at allocation, so any load will do.
    pub fn is_border(&self) -> bool {
        self.version.get().is_border()
    }

    pub fn as_ptr(&self) -> *mut NodeHeader {
        self as *const NodeHeader as *mut NodeHeader
    }

    /// # Safety
    /// `node` must point at a live border node.
    pub unsafe fn as_border<'a>(node: *mut NodeHeader) -> &'a Border {
        debug_assert!((*node).is_border());
        &*(node as *mut Border)
    }

    /// # Safety
    /// `node` must point at a live interior node.
    pub unsafe fn as_interior<'a>(node: *mut NodeHeader) -> &'a Interior {
        debug_assert!(!(*node).is_border());
        &*(node as *mut Interior)
    }

    /// Locks `node`'s parent such that it is still the parent at return;
    /// null when `node` has none.
    ///
    /// # Safety
    /// `node` must point at a live node whose parents stay live.
    pub unsafe fn locked_parent(node: *mut NodeHeader) -> *mut NodeHeader {
        loop {
            let parent = (*node).parent.load(Acquire);
            if parent.is_null() {
                return parent;
            }
            (*parent).version.lock();
            if (*node).parent.load(Acquire) == parent {
                return parent;
            }
            (*parent).version.unlock();
        }
    }
}

/// Atomic cell for racily-read `u64` node fields.
pub(crate) struct SliceCell(AtomicU64);

impl SliceCell {
    pub fn zero() -> Self {
        SliceCell(AtomicU64::new(0))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Acquire)
    }

    /// Store by the lock holder or during pre-publication initialization.
    pub fn set(&self, value: u64) {
        self.0.store(value, Release);
    }

    pub fn set_relaxed(&self, value: u64) {
        self.0.store(value, Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_casts_agree_with_kind_flag() {
        let border = Border::alloc(true);
        let interior_left = Border::alloc(false);
        let interior_right = Border::alloc(false);
        let interior = Interior::alloc_root(
            42,
            interior_left as *mut NodeHeader,
            interior_right as *mut NodeHeader,
        );
        unsafe {
            assert!((*(border as *mut NodeHeader)).is_border());
            assert!(!(*(interior as *mut NodeHeader)).is_border());
            drop(Box::from_raw(border));
            drop(Box::from_raw(interior_left));
            drop(Box::from_raw(interior_right));
            drop(Box::from_raw(interior));
        }
    }

    #[test]
    fn locked_parent_of_detached_node_is_null() {
        let border = Border::alloc(true);
        unsafe {
            assert!(NodeHeader::locked_parent(border as *mut NodeHeader).is_null());
            drop(Box::from_raw(border));
        }
    }

    #[test]
    fn locked_parent_returns_a_locked_current_parent() {
        let left = Border::alloc(false);
        let right = Border::alloc(false);
        let root = Interior::alloc_root(7, left as *mut NodeHeader, right as *mut NodeHeader);
        unsafe {
            (*left).hdr().set_parent(root as *mut NodeHeader);
            let p = NodeHeader::locked_parent(left as *mut NodeHeader);
            assert_eq!(p, root as *mut NodeHeader);
            assert!((*p).version().get().is_locked());
            (*p).version().unlock();
            drop(Box::from_raw(left));
            drop(Box::from_raw(right));
            drop(Box::from_raw(root));
        }
    }
}
