//! The tree layer.
//!
//! Owns the root pointer and drives the node layer: `get` descends with
//! stable versions and retries on concurrent structural change; `put`
//! descends the same way, locks one border, and handles the node layer's
//! control signals — inserting, descending into a deeper layer, opening a
//! new layer on a full-slice collision, or splitting and promoting the
//! fence upward. Writers hold at most three node locks at a time
//! (hand-over-hand upward); readers hold none.
//!
//! Reclamation is epoch-based: every public operation pins a
//! `crossbeam_epoch` guard, and anything unlinked while a reader may still
//! observe it (replaced suffix cells) is retired through the guard. Nodes
//! themselves are only freed in `Drop`, where `&mut self` proves
//! quiescence.

use core::marker::PhantomData;
use core::sync::atomic::AtomicPtr;
use core::sync::atomic::Ordering::{Acquire, Release};

use crossbeam_epoch::{self as epoch, Guard};
use log::trace;

use crate::key::{self, KeySlice};
use crate::node::suffix::Suffix;
use crate::node::{
    Border, EntryTag, InsertOutcome, Interior, Match, NodeHeader, Version,
};

/// Outcome of [`MassTree::put`].
#[derive(Debug, PartialEq, Eq)]
pub enum PutResult<V> {
    Inserted,
    /// The key was already present; the existing entry is untouched and the
    /// rejected value is handed back.
    AlreadyPresent(V),
}

/// A concurrent, in-memory, ordered byte-string index: a trie of
/// B+-tree-like layers with optimistic versioned reads and lock-coupled
/// writers.
///
/// Point insertion and lookup may be called from any number of threads
/// concurrently. Values live until the tree is dropped; deletion and range
/// scans are not offered.
pub struct MassTree<V> {
    root: AtomicPtr<NodeHeader>,
    _values: PhantomData<Box<V>>,
}

unsafe impl<V: Send> Send for MassTree<V> {}
unsafe impl<V: Send + Sync> Sync for MassTree<V> {}

impl<V> Default for MassTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> MassTree<V> {
    /// An empty tree: a single root border node.
    pub fn new() -> Self {
        let root = Border::alloc(true);
        MassTree {
            root: AtomicPtr::new(unsafe { (*root).as_node() }),
            _values: PhantomData,
        }
    }

    /// Looks up `key`, returning the stored value if present.
    pub fn get(&self, key: &[u8]) -> Option<&V> {
        // The pin keeps retired suffix cells alive across the search.
        let _guard = epoch::pin();
        let mut root = self.root.load(Acquire);
        let mut offset = 0usize;
        'layer: loop {
            let sl = KeySlice::at(key, offset);
            let (mut node, mut v) = self.find_border(root, sl.ikey);
            loop {
                let border = unsafe { NodeHeader::as_border(node) };
                let result = unsafe { border.search(sl, key, offset) };
                let after = border.hdr().version().validate();
                if !after.changed_from(v) {
                    match result {
                        Match::Value(cell) => return Some(unsafe { &*(cell as *const V) }),
                        Match::Link(layer) => {
                            root = layer;
                            offset += key::SLICE_LEN;
                            continue 'layer;
                        }
                        Match::Conflict(_) | Match::Miss => return None,
                    }
                }
                // The border moved under us. Re-stabilize, and follow the
                // split chain right while the key may have moved there;
                // splits only ever create right siblings.
                v = border.hdr().version().stable();
                let mut cur = border;
                loop {
                    if cur.include_key(sl.ikey) {
                        break;
                    }
                    let next = cur.next();
                    if next.is_null() {
                        break;
                    }
                    let next = unsafe { &*next };
                    debug_assert!(!next.hdr().version().get().is_deleted());
                    let next_v = next.hdr().version().stable();
                    match next.first_slice() {
                        Some(first) if first <= sl.ikey => {
                            cur = next;
                            v = next_v;
                        }
                        _ => break,
                    }
                }
                node = cur.as_node();
            }
        }
    }

    /// Inserts `key` with `value`. An existing entry is left untouched and
    /// the value handed back as [`PutResult::AlreadyPresent`].
    pub fn put(&self, key: &[u8], value: V) -> PutResult<V> {
        let guard = epoch::pin();
        let cell = Box::into_raw(Box::new(value)) as *mut u8;
        let mut root = self.root.load(Acquire);
        let mut offset = 0usize;
        loop {
            let sl = KeySlice::at(key, offset);
            let (node, v) = self.find_border(root, sl.ikey);
            let mut border = unsafe { NodeHeader::as_border(node) };
            border.hdr().version().lock();
            if border.hdr().version().get().changed_from(v) {
                border = unsafe { self.advance_right(border, sl.ikey) };
            }
            match unsafe { border.insert(key, offset, cell) } {
                InsertOutcome::Inserted => {
                    border.hdr().version().unlock();
                    return PutResult::Inserted;
                }
                InsertOutcome::Present => {
                    border.hdr().version().unlock();
                    let value = unsafe { *Box::from_raw(cell as *mut V) };
                    return PutResult::AlreadyPresent(value);
                }
                InsertOutcome::Descend(layer) => {
                    border.hdr().version().unlock();
                    root = layer;
                    offset += key::SLICE_LEN;
                }
                InsertOutcome::Conflict(pos) => {
                    unsafe { self.start_new_layer(border, pos, key, offset, cell, &guard) };
                    border.hdr().version().unlock();
                    return PutResult::Inserted;
                }
                InsertOutcome::Full => {
                    unsafe { self.split_insert(border, key, offset, cell, &guard) };
                    return PutResult::Inserted;
                }
            }
        }
    }

    /// Descends from a layer root to the border covering `ikey`, returning
    /// it with a stable version. Retries from the root whenever a split is
    /// detected mid-descent.
    fn find_border(&self, layer_root: *mut NodeHeader, ikey: u64) -> (*mut NodeHeader, Version) {
        unsafe {
            'from_root: loop {
                let mut node = layer_root;
                let mut v = (*node).version().stable();
                // The root may have been demoted under us; climb back up.
                while !v.is_root() {
                    node = (*node).parent();
                    debug_assert!(!node.is_null());
                    v = (*node).version().stable();
                }
                loop {
                    if v.is_border() {
                        return (node, v);
                    }
                    let interior = NodeHeader::as_interior(node);
                    let child = interior.locate_child(ikey);
                    debug_assert!(!child.is_null());
                    let child_v = (*child).version().stable();
                    let recheck = (*node).version().validate();
                    if !recheck.changed_from(v) {
                        node = child;
                        v = child_v;
                        continue;
                    }
                    let fresh = (*node).version().stable();
                    if fresh.vsplit() != v.vsplit() {
                        continue 'from_root;
                    }
                    v = fresh;
                }
            }
        }
    }

    /// Hand-over-hand walk right from a locked border while the key belongs
    /// at or past the next sibling. Returns the locked destination.
    ///
    /// # Safety
    /// `border` locked by the caller; the lock moves to the returned node.
    unsafe fn advance_right<'a>(&self, mut border: &'a Border, ikey: u64) -> &'a Border {
        loop {
            let next = border.next();
            if next.is_null() {
                return border;
            }
            let next = &*next;
            next.hdr().version().lock();
            match next.first_slice() {
                Some(first) if first <= ikey => {
                    border.hdr().version().unlock();
                    border = next;
                }
                _ => {
                    next.hdr().version().unlock();
                    return border;
                }
            }
        }
    }

    /// Full-slice collision: the entry at `pos` and the new key agree on
    /// every consumed slice but diverge beyond it. Assemble a deeper layer
    /// holding both remainders (chaining further layers while they keep
    /// colliding), then swing the old entry over to a LINK.
    ///
    /// # Safety
    /// `border` locked by the caller; `cell` owned by the tree hereafter.
    unsafe fn start_new_layer(
        &self,
        border: &Border,
        pos: usize,
        key: &[u8],
        offset: usize,
        cell: *mut u8,
        guard: &Guard,
    ) {
        let old_suffix = Suffix::bytes(border.entry_suffix(pos));
        let old_cell = border.entry_value(pos);
        let new_rest = key::suffix_at(key, offset);
        debug_assert_ne!(old_suffix, new_rest);

        let top = Border::alloc(true);
        (*top).hdr().set_parent(border.as_node());
        let mut layer = &*top;
        let mut depth = 0usize;
        loop {
            let old_sl = KeySlice::at(old_suffix, depth);
            let new_sl = KeySlice::at(new_rest, depth);
            if old_sl.ikey == new_sl.ikey && old_sl.is_full() && new_sl.is_full() {
                let deeper = Border::alloc(true);
                (*deeper).hdr().set_parent(layer.as_node());
                layer.seed_link(old_sl.ikey, (*deeper).as_node());
                layer = &*deeper;
                depth += key::SLICE_LEN;
                continue;
            }
            debug_assert!(old_sl != new_sl);
            layer.seed_value(old_suffix, depth, old_cell);
            layer.seed_value(new_rest, depth, cell);
            break;
        }
        trace!(
            "opened a deeper layer at key offset {}",
            offset + key::SLICE_LEN
        );
        border.make_link(pos, (*top).as_node(), guard);
    }

    /// Border overflow: split, place the new key by its side of the fence,
    /// and promote the fence upward.
    ///
    /// # Safety
    /// `border` locked by the caller; `cell` owned by the tree hereafter.
    unsafe fn split_insert(
        &self,
        border: &Border,
        key: &[u8],
        offset: usize,
        cell: *mut u8,
        guard: &Guard,
    ) {
        let sl = KeySlice::at(key, offset);
        let (right, fence) = border.split();
        let target = if sl.ikey < fence { border } else { &*right };
        match target.insert(key, offset, cell) {
            InsertOutcome::Inserted => {}
            _ => debug_assert!(false, "post-split insert must find room"),
        }
        self.promote(border.as_node(), fence, (*right).as_node(), guard);
    }

    /// Carries a split's fence into the parent, recursing upward while
    /// parents keep overflowing and growing a new root when the chain
    /// reaches a layer root. Enters holding the locks on `node` and
    /// `right`; never holds more than three at once.
    ///
    /// # Safety
    /// `node` and `right` locked by the caller, freshly split.
    unsafe fn promote(
        &self,
        mut node: *mut NodeHeader,
        mut fence: u64,
        mut right: *mut NodeHeader,
        _guard: &Guard,
    ) {
        loop {
            let parent = NodeHeader::locked_parent(node);

            if parent.is_null() {
                // The top-level layer root split: grow a new root above it.
                let new_root = Interior::alloc_root(fence, node, right);
                let root_node = (*new_root).as_node();
                (*node).set_parent(root_node);
                (*right).set_parent(root_node);
                (*node).version().clear_root();
                self.root.store(root_node, Release);
                trace!("grew a new top-level root");
                (*right).version().unlock();
                (*node).version().unlock();
                return;
            }

            if (*parent).is_border() {
                // A deeper-layer root split: grow that layer a root and
                // swing the parent border's LINK entry over to it.
                let new_root = Interior::alloc_root(fence, node, right);
                let root_node = (*new_root).as_node();
                (*root_node).set_parent(parent);
                (*node).set_parent(root_node);
                (*right).set_parent(root_node);
                (*node).version().clear_root();
                NodeHeader::as_border(parent).swap_link(node, root_node);
                trace!("grew a deeper-layer root");
                (*parent).version().unlock();
                (*right).version().unlock();
                (*node).version().unlock();
                return;
            }

            let interior = NodeHeader::as_interior(parent);
            (*right).set_parent(parent);
            if interior.insert_fence(fence, right) {
                (*parent).version().unlock();
                (*right).version().unlock();
                (*node).version().unlock();
                return;
            }

            // Parent full: split it and carry its fence up another level.
            // The parent is marked splitting before the lower lock goes, so
            // a descending reader stalls on it instead of routing through
            // the stale lower range.
            interior.hdr().version().mark_split();
            (*node).version().unlock();
            let (parent_right, parent_fence) = interior.split();
            let target = if fence < parent_fence {
                interior
            } else {
                &*parent_right
            };
            (*right).set_parent(target.as_node());
            let inserted = target.insert_fence(fence, right);
            debug_assert!(inserted);
            (*right).version().unlock();
            node = parent;
            fence = parent_fence;
            right = (*parent_right).as_node();
        }
    }
}

impl<V> Drop for MassTree<V> {
    fn drop(&mut self) {
        let root = *self.root.get_mut();
        unsafe { drop_subtree::<V>(root) };
    }
}

/// Teardown walk. Quiescence is the caller's guarantee (`&mut self`).
unsafe fn drop_subtree<V>(node: *mut NodeHeader) {
    if (*node).is_border() {
        let border = Box::from_raw(node as *mut Border);
        let count = border.hdr().permutation().count();
        for pos in 0..count {
            match border.entry_tag(pos) {
                EntryTag::Link => {
                    drop_subtree::<V>(border.entry_value(pos) as *mut NodeHeader);
                }
                EntryTag::Value(_) => {
                    Suffix::free(border.entry_suffix(pos));
                    drop(Box::from_raw(border.entry_value(pos) as *mut V));
                }
            }
        }
    } else {
        let interior = Box::from_raw(node as *mut Interior);
        let count = interior.hdr().permutation().count();
        for i in 0..=count {
            drop_subtree::<V>(interior.logical_child(i));
        }
    }
}

impl<V> MassTree<V> {
    /// Walks the whole tree checking the structural invariants: permutation
    /// bijectivity and ordering, separator bounds, sibling-chain ordering,
    /// parent back-references, and one root flag per layer. Callers must be
    /// quiesced.
    pub fn check_invariants(&self) {
        unsafe { check_layer(self.root.load(Acquire), core::ptr::null_mut()) };
    }
}

unsafe fn check_layer(root: *mut NodeHeader, expected_parent: *mut NodeHeader) {
    assert!((*root).version().get().is_root());
    assert_eq!((*root).parent(), expected_parent);
    check_node(root, None, None, true);
}

unsafe fn check_node(
    node: *mut NodeHeader,
    lower: Option<u64>,
    upper: Option<u64>,
    is_layer_root: bool,
) {
    use crate::node::FANOUT;

    let version = (*node).version().get();
    assert!(!version.is_deleted());
    assert_eq!(version.is_root(), is_layer_root);

    let perm = (*node).permutation();
    assert!(perm.count() <= FANOUT);
    let mut seen = [false; FANOUT];
    for pos in 0..perm.count() {
        let slot = perm.get(pos);
        assert!(!seen[slot], "permutation slot reused");
        seen[slot] = true;
    }

    if (*node).is_border() {
        let border = NodeHeader::as_border(node);
        let mut previous = None;
        for pos in 0..perm.count() {
            let slice = border.entry_slice(pos);
            if let Some(previous) = previous {
                assert!(previous <= slice, "border slices out of order");
            }
            previous = Some(slice);
            if let Some(lower) = lower {
                assert!(lower <= slice, "border slice below its subtree bound");
            }
            if let Some(upper) = upper {
                assert!(slice < upper, "border slice above its subtree bound");
            }
            if let EntryTag::Link = border.entry_tag(pos) {
                check_layer(border.entry_value(pos) as *mut NodeHeader, node);
            }
        }
        let next = border.next();
        if !next.is_null() {
            let next = &*next;
            assert_eq!(next.prev(), node as *mut Border, "broken sibling chain");
            if let (Some(last), Some(first)) = (border.last_slice(), next.first_slice()) {
                assert!(last <= first, "sibling ranges out of order");
            }
        }
    } else {
        let interior = NodeHeader::as_interior(node);
        let count = perm.count();
        assert!(count >= 1, "interior node without separators");
        let mut separators = Vec::with_capacity(count);
        for pos in 0..count {
            separators.push(interior.keyslice_at(pos));
        }
        for window in separators.windows(2) {
            assert!(window[0] <= window[1], "interior separators out of order");
        }
        for i in 0..=count {
            let child = interior.logical_child(i);
            assert!(!child.is_null());
            assert_eq!((*child).parent(), node, "stale parent back-reference");
            let child_lower = if i == 0 { lower } else { Some(separators[i - 1]) };
            let child_upper = if i == count { upper } else { Some(separators[i]) };
            check_node(child, child_lower, child_upper, false);
        }
    }
}
