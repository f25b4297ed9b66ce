//! Interior nodes.
//!
//! An interior node routes by up to [`FANOUT`] separator slices over
//! `FANOUT + 1` children. Physical slots fill in arrival order under the
//! packed permutation, same as borders; the child belonging to the slice in
//! physical slot `s` sits at `child[s + 1]`, with `child[0]` the leftmost.
//! A probe descends to the child after the last separator `<=` it, so keys
//! equal to a fence land in the right-hand node the fence came from.

use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use core::sync::atomic::AtomicPtr;
use std::ptr;

use arrayvec::ArrayVec;
use log::trace;

use super::permutation::{Permutation, FANOUT};
use super::version::{IS_ROOT, LOCK, SPLIT};
use super::NodeHeader;

#[repr(C)]
pub(crate) struct Interior {
    hdr: NodeHeader,
    keyslice: [super::SliceCell; FANOUT],
    child: [AtomicPtr<NodeHeader>; FANOUT + 1],
}

impl Interior {
    fn with_flags(flags: u32) -> *mut Interior {
        Box::into_raw(Box::new(Interior {
            hdr: NodeHeader::new(flags),
            keyslice: core::array::from_fn(|_| super::SliceCell::zero()),
            child: core::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }))
    }

    /// A fresh layer root over one fence and its two children, as built by
    /// root growth. Children's parent pointers are the caller's business so
    /// the publication order stays in its hands.
    pub fn alloc_root(fence: u64, left: *mut NodeHeader, right: *mut NodeHeader) -> *mut Interior {
        let node = Interior::with_flags(IS_ROOT);
        let interior = unsafe { &*node };
        interior.keyslice[0].set_relaxed(fence);
        interior.child[0].store(left, Relaxed);
        interior.child[1].store(right, Relaxed);
        interior
            .hdr
            .permutation
            .store(Permutation::identity(1).bits(), Release);
        node
    }

    pub fn hdr(&self) -> &NodeHeader {
        &self.hdr
    }

    pub fn as_node(&self) -> *mut NodeHeader {
        self.hdr.as_ptr()
    }

    /// Separator at permuted position `pos`.
    pub fn keyslice_at(&self, pos: usize) -> u64 {
        self.keyslice[self.hdr.permutation().get(pos)].get()
    }

    /// Child index `i` in logical (key) order: `child[0]`, then the child
    /// hanging off each permuted separator.
    pub fn logical_child(&self, i: usize) -> *mut NodeHeader {
        if i == 0 {
            self.child[0].load(Acquire)
        } else {
            self.child[self.hdr.permutation().get(i - 1) + 1].load(Acquire)
        }
    }

    /// The child covering `ikey`: binary-search for the first separator
    /// strictly greater than the probe and take the child before it.
    pub fn locate_child(&self, ikey: u64) -> *mut NodeHeader {
        let perm = self.hdr.permutation();
        let mut lo = 0;
        let mut hi = perm.count();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.keyslice[perm.get(mid)].get() <= ikey {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == 0 {
            self.child[0].load(Acquire)
        } else {
            self.child[perm.get(lo - 1) + 1].load(Acquire)
        }
    }

    /// Inserts a fence and its right child; `false` when the node is full.
    /// The child's parent pointer must already point here.
    ///
    /// # Safety
    /// Lock held by the caller.
    pub unsafe fn insert_fence(&self, fence: u64, right: *mut NodeHeader) -> bool {
        debug_assert!(self.hdr.version().get().is_locked());
        let perm = self.hdr.permutation();
        if perm.count() == FANOUT {
            return false;
        }
        debug_assert_eq!((*right).parent(), self.as_node());
        self.hdr.version().mark_insert();
        let slot = perm.count();
        self.keyslice[slot].set(fence);
        self.child[slot + 1].store(right, Release);
        let pos = {
            let mut lo = 0;
            let mut hi = perm.count();
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                if self.keyslice[perm.get(mid)].get() < fence {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            lo
        };
        self.hdr.set_permutation(perm.inserted(pos, slot));
        true
    }

    /// Splits a full node. The middle separator comes out as the returned
    /// fence and is stored in neither half; the lower seven separators and
    /// eight children stay, the upper seven and eight move into a fresh
    /// right sibling, returned locked with `SPLIT` set. Moved children are
    /// re-parented to the new node.
    ///
    /// # Safety
    /// Lock held by the caller.
    pub unsafe fn split(&self) -> (*mut Interior, u64) {
        let perm = self.hdr.permutation();
        debug_assert!(self.hdr.version().get().is_locked());
        debug_assert_eq!(perm.count(), FANOUT);
        self.hdr.version().mark_split();

        let mut slices: ArrayVec<u64, FANOUT> = ArrayVec::new();
        let mut children: ArrayVec<*mut NodeHeader, { FANOUT + 1 }> = ArrayVec::new();
        children.push(self.child[0].load(Relaxed));
        for pos in 0..FANOUT {
            let slot = perm.get(pos);
            slices.push(self.keyslice[slot].get());
            children.push(self.child[slot + 1].load(Relaxed));
        }

        let mid = FANOUT / 2;
        let fence = slices[mid];

        let right = Interior::with_flags(LOCK | SPLIT);
        {
            let right_ref = &*right;
            right_ref.hdr.set_parent(self.hdr.parent());
            right_ref.child[0].store(children[mid + 1], Relaxed);
            for i in 0..FANOUT - mid - 1 {
                right_ref.keyslice[i].set_relaxed(slices[mid + 1 + i]);
                right_ref.child[i + 1].store(children[mid + 2 + i], Relaxed);
            }
            right_ref
                .hdr
                .permutation
                .store(Permutation::identity(FANOUT - mid - 1).bits(), Release);
            for &child in &children[mid + 1..] {
                (*child).set_parent(right_ref.as_node());
            }
        }

        // Repack the lower half in place; racing readers retry on vsplit.
        for (i, &slice) in slices[..mid].iter().enumerate() {
            self.keyslice[i].set(slice);
            self.child[i + 1].store(children[i + 1], Release);
        }
        self.child[0].store(children[0], Release);
        self.hdr.set_permutation(Permutation::identity(mid));

        trace!("interior split, fence {fence:#018x}");
        (right, fence)
    }
}
