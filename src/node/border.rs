//! Border nodes.
//!
//! A border node holds up to [`FANOUT`] entries in physical slots that fill
//! in arrival order, presented in key order through the packed permutation.
//! Each entry pairs a keyslice with a tag: either the key terminates here
//! (with the remainder beyond the slice in a suffix cell) or the entry is a
//! LINK into a deeper layer. Border nodes of one layer form a doubly linked
//! list in key order so that a reader racing a split can recover by walking
//! `next`.
//!
//! All racily-read fields are atomics; writers store them under the node
//! lock with the matching intent bit set, and readers validate the version
//! word after reading.

use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use core::sync::atomic::{AtomicPtr, AtomicU8};
use std::ptr;

use arrayvec::ArrayVec;
use crossbeam_epoch::Guard;
use log::trace;

use super::permutation::{Permutation, FANOUT};
use super::suffix::Suffix;
use super::version::{IS_BORDER, IS_ROOT, LOCK, SPLIT};
use super::NodeHeader;
use crate::key::{self, KeySlice};

const TAG_LINK: u8 = 0xFF;

/// Tag of one border entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryTag {
    /// The key ends at or inside this slice, covering `0..=8` of its bytes.
    /// Full-slice entries additionally carry the key's remainder in a
    /// suffix cell (possibly empty).
    Value(u8),
    /// The entry's value is the root of a deeper layer.
    Link,
}

impl EntryTag {
    pub fn encode(self) -> u8 {
        match self {
            EntryTag::Value(len) => {
                debug_assert!(len as usize <= key::SLICE_LEN);
                len
            }
            EntryTag::Link => TAG_LINK,
        }
    }

    pub fn decode(raw: u8) -> Self {
        if raw == TAG_LINK {
            EntryTag::Link
        } else {
            debug_assert!(raw as usize <= key::SLICE_LEN);
            EntryTag::Value(raw)
        }
    }
}

/// Outcome of probing a border for one key.
pub(crate) enum Match {
    /// The key is stored here; its value cell.
    Value(*mut u8),
    /// A LINK entry covers the probed slice; descend into that layer.
    Link(*mut NodeHeader),
    /// A full-slice entry shares the slice but belongs to a different key;
    /// permuted position of that entry.
    Conflict(usize),
    Miss,
}

/// Control signal from a locked insert.
pub(crate) enum InsertOutcome {
    Inserted,
    Present,
    Descend(*mut NodeHeader),
    Conflict(usize),
    Full,
}

#[repr(C)]
pub(crate) struct Border {
    hdr: NodeHeader,
    prev: AtomicPtr<Border>,
    next: AtomicPtr<Border>,
    keyslice: [super::SliceCell; FANOUT],
    tags: [AtomicU8; FANOUT],
    suffixes: [AtomicPtr<Suffix>; FANOUT],
    lv: [AtomicPtr<u8>; FANOUT],
}

impl Border {
    fn with_flags(flags: u32) -> *mut Border {
        Box::into_raw(Box::new(Border {
            hdr: NodeHeader::new(flags | IS_BORDER),
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
            keyslice: core::array::from_fn(|_| super::SliceCell::zero()),
            tags: core::array::from_fn(|_| AtomicU8::new(0)),
            suffixes: core::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            lv: core::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }))
    }

    pub fn alloc(root: bool) -> *mut Border {
        Border::with_flags(if root { IS_ROOT } else { 0 })
    }

    pub fn hdr(&self) -> &NodeHeader {
        &self.hdr
    }

    pub fn as_node(&self) -> *mut NodeHeader {
        self.hdr.as_ptr()
    }

    pub fn next(&self) -> *mut Border {
        self.next.load(Acquire)
    }

    pub fn prev(&self) -> *mut Border {
        self.prev.load(Acquire)
    }

    /// First permuted slice, or `None` while empty.
    pub fn first_slice(&self) -> Option<u64> {
        let perm = self.hdr.permutation();
        (perm.count() > 0).then(|| self.keyslice[perm.get(0)].get())
    }

    pub fn last_slice(&self) -> Option<u64> {
        let perm = self.hdr.permutation();
        (perm.count() > 0).then(|| self.keyslice[perm.get(perm.count() - 1)].get())
    }

    /// True iff `ikey` falls within the node's current permuted slice range.
    /// Readers use this to decide whether to follow `next` after a version
    /// change.
    pub fn include_key(&self, ikey: u64) -> bool {
        match (self.first_slice(), self.last_slice()) {
            (Some(first), Some(last)) => first <= ikey && ikey <= last,
            _ => false,
        }
    }

    pub fn entry_slice(&self, pos: usize) -> u64 {
        self.keyslice[self.hdr.permutation().get(pos)].get()
    }

    pub fn entry_tag(&self, pos: usize) -> EntryTag {
        EntryTag::decode(self.tags[self.hdr.permutation().get(pos)].load(Acquire))
    }

    pub fn entry_suffix(&self, pos: usize) -> *mut Suffix {
        self.suffixes[self.hdr.permutation().get(pos)].load(Acquire)
    }

    pub fn entry_value(&self, pos: usize) -> *mut u8 {
        self.lv[self.hdr.permutation().get(pos)].load(Acquire)
    }

    /// First permuted position whose slice is `>= ikey`.
    fn lower_bound(&self, perm: Permutation, ikey: u64) -> usize {
        let mut lo = 0;
        let mut hi = perm.count();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.keyslice[perm.get(mid)].get() < ikey {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Optimistic search for the slice of `key` at `offset`. The caller
    /// owns version validation; a torn result is only acted upon after the
    /// node's version proves the read section was quiet.
    ///
    /// # Safety
    /// The caller must be pinned to the current epoch, so suffix cells
    /// observed here cannot be reclaimed mid-read.
    pub unsafe fn search(&self, sl: KeySlice, key: &[u8], offset: usize) -> Match {
        let perm = self.hdr.permutation();
        let count = perm.count();
        let mut pos = self.lower_bound(perm, sl.ikey);
        // Entries sharing a slice differ in length; scan the short run.
        while pos < count {
            let slot = perm.get(pos);
            if self.keyslice[slot].get() != sl.ikey {
                break;
            }
            match EntryTag::decode(self.tags[slot].load(Acquire)) {
                EntryTag::Link if sl.is_full() => {
                    return Match::Link(self.lv[slot].load(Acquire) as *mut NodeHeader);
                }
                EntryTag::Value(len) if len == sl.len => {
                    if !sl.is_full() {
                        return Match::Value(self.lv[slot].load(Acquire));
                    }
                    let suffix = self.suffixes[slot].load(Acquire);
                    if Suffix::bytes(suffix) == key::suffix_at(key, offset) {
                        return Match::Value(self.lv[slot].load(Acquire));
                    }
                    return Match::Conflict(pos);
                }
                _ => {}
            }
            pos += 1;
        }
        Match::Miss
    }

    /// Single-slot insert. Assumes the lock is held.
    ///
    /// # Safety
    /// Lock held by the caller; caller pinned to the current epoch.
    pub unsafe fn insert(&self, key: &[u8], offset: usize, value: *mut u8) -> InsertOutcome {
        debug_assert!(self.hdr.version().get().is_locked());
        let sl = KeySlice::at(key, offset);
        match self.search(sl, key, offset) {
            Match::Value(_) => InsertOutcome::Present,
            Match::Link(layer) => InsertOutcome::Descend(layer),
            Match::Conflict(pos) => InsertOutcome::Conflict(pos),
            Match::Miss => {
                let perm = self.hdr.permutation();
                if perm.count() == FANOUT {
                    return InsertOutcome::Full;
                }
                self.hdr.version().mark_insert();
                let slot = perm.count();
                self.write_slot(
                    slot,
                    sl.ikey,
                    EntryTag::Value(sl.len),
                    if sl.is_full() {
                        Suffix::alloc(key::suffix_at(key, offset))
                    } else {
                        ptr::null_mut()
                    },
                    value,
                );
                let pos = self.lower_bound(perm, sl.ikey);
                self.hdr.set_permutation(perm.inserted(pos, slot));
                InsertOutcome::Inserted
            }
        }
    }

    fn write_slot(&self, slot: usize, ikey: u64, tag: EntryTag, suffix: *mut Suffix, lv: *mut u8) {
        self.keyslice[slot].set(ikey);
        self.tags[slot].store(tag.encode(), Release);
        self.suffixes[slot].store(suffix, Release);
        self.lv[slot].store(lv, Release);
    }

    /// Entry write into a node no other thread can reach yet; used while a
    /// new layer is assembled before its LINK is published.
    ///
    /// # Safety
    /// The node must be unpublished.
    pub unsafe fn seed_value(&self, key_rest: &[u8], depth: usize, value: *mut u8) {
        let sl = KeySlice::at(key_rest, depth);
        let perm = self.hdr.permutation();
        debug_assert!(perm.count() < FANOUT);
        let slot = perm.count();
        self.write_slot(
            slot,
            sl.ikey,
            EntryTag::Value(sl.len),
            if sl.is_full() {
                Suffix::alloc(key::suffix_at(key_rest, depth))
            } else {
                ptr::null_mut()
            },
            value,
        );
        let pos = self.lower_bound(perm, sl.ikey);
        self.hdr.permutation.store(perm.inserted(pos, slot).bits(), Release);
    }

    /// LINK entry write into an unpublished node.
    ///
    /// # Safety
    /// The node must be unpublished.
    pub unsafe fn seed_link(&self, ikey: u64, layer_root: *mut NodeHeader) {
        let perm = self.hdr.permutation();
        debug_assert!(perm.count() < FANOUT);
        let slot = perm.count();
        self.write_slot(slot, ikey, EntryTag::Link, ptr::null_mut(), layer_root as *mut u8);
        let pos = self.lower_bound(perm, ikey);
        self.hdr.permutation.store(perm.inserted(pos, slot).bits(), Release);
    }

    /// Swings the full-slice entry at permuted `pos` over to a LINK at
    /// `layer_root`, retiring its suffix cell through the epoch guard.
    ///
    /// # Safety
    /// Lock held by the caller; `layer_root` fully initialized.
    pub unsafe fn make_link(&self, pos: usize, layer_root: *mut NodeHeader, guard: &Guard) {
        debug_assert!(self.hdr.version().get().is_locked());
        self.hdr.version().mark_insert();
        let slot = self.hdr.permutation().get(pos);
        debug_assert_eq!(
            EntryTag::decode(self.tags[slot].load(Relaxed)),
            EntryTag::Value(key::SLICE_LEN as u8)
        );
        let old_suffix = self.suffixes[slot].swap(ptr::null_mut(), Release);
        guard.defer_unchecked(move || Suffix::free(old_suffix));
        self.lv[slot].store(layer_root as *mut u8, Release);
        self.tags[slot].store(EntryTag::Link.encode(), Release);
    }

    /// Redirects the LINK entry pointing at `old` to `new`; used when a
    /// deeper layer grows a new root under this node's lock.
    ///
    /// # Safety
    /// Lock held by the caller; a LINK at `old` must exist.
    pub unsafe fn swap_link(&self, old: *mut NodeHeader, new: *mut NodeHeader) {
        debug_assert!(self.hdr.version().get().is_locked());
        let perm = self.hdr.permutation();
        for pos in 0..perm.count() {
            let slot = perm.get(pos);
            if EntryTag::decode(self.tags[slot].load(Relaxed)) == EntryTag::Link
                && self.lv[slot].load(Relaxed) == old as *mut u8
            {
                self.lv[slot].store(new as *mut u8, Release);
                return;
            }
        }
        debug_assert!(false, "no LINK entry for the demoted layer root");
    }

    /// Splits a full node: the lower entries stay, the upper move into a
    /// fresh right sibling which is returned locked with `SPLIT` set,
    /// together with the fence slice (the right node's first slice).
    /// Equal-slice runs are kept on a single side of the fence.
    ///
    /// # Safety
    /// Lock held by the caller.
    pub unsafe fn split(&self) -> (*mut Border, u64) {
        let perm = self.hdr.permutation();
        debug_assert!(self.hdr.version().get().is_locked());
        debug_assert_eq!(perm.count(), FANOUT);
        self.hdr.version().mark_split();

        let mut entries: ArrayVec<(u64, u8, *mut Suffix, *mut u8), FANOUT> = ArrayVec::new();
        for pos in 0..FANOUT {
            let slot = perm.get(pos);
            entries.push((
                self.keyslice[slot].get(),
                self.tags[slot].load(Relaxed),
                self.suffixes[slot].load(Relaxed),
                self.lv[slot].load(Relaxed),
            ));
        }

        let mut at = FANOUT / 2;
        while at > 0 && entries[at - 1].0 == entries[at].0 {
            at -= 1;
        }
        if at == 0 {
            at = FANOUT / 2;
            while at < FANOUT && entries[at].0 == entries[at - 1].0 {
                at += 1;
            }
        }
        debug_assert!(at > 0 && at < FANOUT);
        let fence = entries[at].0;

        let right = Border::with_flags(LOCK | SPLIT);
        {
            let right = &*right;
            right.hdr.set_parent(self.hdr.parent());
            for (i, &(ikey, tag, suffix, lv)) in entries[at..].iter().enumerate() {
                right.write_slot(i, ikey, EntryTag::decode(tag), suffix, lv);
                // A migrated LINK re-homes its layer root's back-reference;
                // racing promotions revalidate it under our lock.
                if EntryTag::decode(tag) == EntryTag::Link {
                    (*(lv as *mut NodeHeader)).set_parent(right.as_node());
                }
            }
            right
                .hdr
                .permutation
                .store(Permutation::identity(FANOUT - at).bits(), Release);
        }

        // Repack the survivors into key order; racing readers are fenced
        // off by the SPLIT bit until the unlock bumps vsplit.
        for (i, &(ikey, tag, suffix, lv)) in entries[..at].iter().enumerate() {
            self.write_slot(i, ikey, EntryTag::decode(tag), suffix, lv);
        }
        self.hdr.set_permutation(Permutation::identity(at));

        let old_next = self.next.load(Relaxed);
        (*right).prev.store(self as *const Border as *mut Border, Relaxed);
        (*right).next.store(old_next, Relaxed);
        if !old_next.is_null() {
            (*old_next).prev.store(right, Release);
        }
        // The right sibling becomes reachable only now.
        self.next.store(right, Release);

        trace!(
            "border split: {} low / {} high, fence {:#018x}",
            at,
            FANOUT - at,
            fence
        );
        (right, fence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::FANOUT;

    fn key_for(ikey: u64) -> [u8; 8] {
        ikey.to_le_bytes()
    }

    fn dummy_value(n: usize) -> *mut u8 {
        // Opaque to the node layer; never dereferenced or freed by it.
        (0x1000 + n * 8) as *mut u8
    }

    unsafe fn free_border(node: *mut Border) {
        let border = &*node;
        let perm = border.hdr.permutation();
        for pos in 0..perm.count() {
            Suffix::free(border.entry_suffix(pos));
        }
        drop(Box::from_raw(node));
    }

    unsafe fn locked(node: *mut Border) -> &'static Border {
        let border = &*node;
        border.hdr().version().lock();
        border
    }

    #[test]
    fn insert_then_search_round_trip() {
        unsafe {
            let node = Border::alloc(true);
            let border = locked(node);
            let key = key_for(77);
            assert!(matches!(
                border.insert(&key, 0, dummy_value(1)),
                InsertOutcome::Inserted
            ));
            border.hdr().version().unlock();

            match border.search(KeySlice::at(&key, 0), &key, 0) {
                Match::Value(v) => assert_eq!(v, dummy_value(1)),
                _ => panic!("expected a value match"),
            }
            match border.search(KeySlice::at(&key_for(78), 0), &key_for(78), 0) {
                Match::Miss => {}
                _ => panic!("expected a miss"),
            }
            free_border(node);
        }
    }

    #[test]
    fn reinsert_reports_present() {
        unsafe {
            let node = Border::alloc(true);
            let border = locked(node);
            let key = b"same-key";
            assert!(matches!(
                border.insert(key, 0, dummy_value(1)),
                InsertOutcome::Inserted
            ));
            assert!(matches!(
                border.insert(key, 0, dummy_value(2)),
                InsertOutcome::Present
            ));
            border.hdr().version().unlock();
            free_border(node);
        }
    }

    #[test]
    fn shared_slice_with_different_suffix_conflicts() {
        unsafe {
            let node = Border::alloc(true);
            let border = locked(node);
            assert!(matches!(
                border.insert(b"prefix01-left", 0, dummy_value(1)),
                InsertOutcome::Inserted
            ));
            assert!(matches!(
                border.insert(b"prefix01-right", 0, dummy_value(2)),
                InsertOutcome::Conflict(0)
            ));
            border.hdr().version().unlock();
            free_border(node);
        }
    }

    #[test]
    fn short_and_padded_keys_coexist() {
        unsafe {
            let node = Border::alloc(true);
            let border = locked(node);
            let short = b"abc".as_slice();
            let padded = b"abc\0\0\0\0\0".as_slice();
            assert!(matches!(
                border.insert(short, 0, dummy_value(1)),
                InsertOutcome::Inserted
            ));
            assert!(matches!(
                border.insert(padded, 0, dummy_value(2)),
                InsertOutcome::Inserted
            ));
            border.hdr().version().unlock();

            match border.search(KeySlice::at(short, 0), short, 0) {
                Match::Value(v) => assert_eq!(v, dummy_value(1)),
                _ => panic!("short key lost"),
            }
            match border.search(KeySlice::at(padded, 0), padded, 0) {
                Match::Value(v) => assert_eq!(v, dummy_value(2)),
                _ => panic!("padded key lost"),
            }
            free_border(node);
        }
    }

    #[test]
    fn fifteenth_insert_fills_the_node() {
        unsafe {
            let node = Border::alloc(true);
            let border = locked(node);
            for i in 0..FANOUT as u64 {
                assert!(matches!(
                    border.insert(&key_for(i), 0, dummy_value(i as usize)),
                    InsertOutcome::Inserted
                ));
            }
            assert!(matches!(
                border.insert(&key_for(99), 0, dummy_value(99)),
                InsertOutcome::Full
            ));
            border.hdr().version().unlock();
            free_border(node);
        }
    }

    #[test]
    fn split_moves_the_upper_half_right() {
        unsafe {
            let node = Border::alloc(true);
            let border = locked(node);
            for i in 0..FANOUT as u64 {
                border.insert(&key_for(i), 0, dummy_value(i as usize));
            }
            let (right, fence) = border.split();
            assert_eq!(fence, 7);
            assert_eq!(border.hdr().permutation().count(), 7);
            assert_eq!((*right).hdr().permutation().count(), 8);
            assert_eq!(border.first_slice(), Some(0));
            assert_eq!(border.last_slice(), Some(6));
            assert_eq!((*right).first_slice(), Some(fence));
            assert_eq!((*right).last_slice(), Some(14));
            assert_eq!(border.next(), right);
            assert_eq!((*right).prev(), node);
            assert!((*right).hdr().version().get().is_locked());
            assert!((*right).hdr().version().get().is_splitting());

            // Every entry is still findable on exactly one side.
            for i in 0..FANOUT as u64 {
                let side = if i < fence { border } else { &*right };
                match side.search(KeySlice::at(&key_for(i), 0), &key_for(i), 0) {
                    Match::Value(v) => assert_eq!(v, dummy_value(i as usize)),
                    _ => panic!("entry {i} lost in split"),
                }
            }

            (*right).hdr().version().unlock();
            border.hdr().version().unlock();
            assert_eq!(border.hdr().version().get().vsplit(), 1);
            free_border(right);
            free_border(node);
        }
    }

    #[test]
    fn include_key_tracks_the_permuted_range() {
        unsafe {
            let node = Border::alloc(true);
            let border = locked(node);
            assert!(!border.include_key(5));
            border.insert(&key_for(10), 0, dummy_value(1));
            border.insert(&key_for(20), 0, dummy_value(2));
            border.hdr().version().unlock();
            assert!(border.include_key(10));
            assert!(border.include_key(15));
            assert!(border.include_key(20));
            assert!(!border.include_key(9));
            assert!(!border.include_key(21));
            free_border(node);
        }
    }

    #[test]
    fn make_link_replaces_a_full_slice_entry() {
        unsafe {
            let node = Border::alloc(true);
            let border = locked(node);
            let key = b"linkable-entry";
            border.insert(key, 0, dummy_value(1));
            let layer = Border::alloc(true);

            let guard = crossbeam_epoch::pin();
            border.make_link(0, (*layer).as_node(), &guard);
            border.hdr().version().unlock();

            match border.search(KeySlice::at(key, 0), key, 0) {
                Match::Link(l) => assert_eq!(l, (*layer).as_node()),
                _ => panic!("expected a LINK entry"),
            }
            drop(guard);
            free_border(layer);
            free_border(node);
        }
    }
}
