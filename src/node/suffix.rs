//! Heap cells holding the remainder of a key beyond a border entry's slice.
//!
//! A suffix is length-prefixed and laid out manually so that an
//! `AtomicPtr<Suffix>` stays a thin pointer. Empty remainders are
//! represented by the null pointer and never allocated. A suffix is
//! immutable once its entry is published; when layer creation replaces it
//! with a LINK the old cell is released through the epoch guard, since a
//! concurrent reader may still be comparing against it.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr;
use std::slice;

const HEADER: usize = core::mem::size_of::<u32>();
const ALIGN: usize = core::mem::align_of::<u32>();

#[repr(C)]
pub(crate) struct Suffix {
    len: u32,
    // `len` bytes follow the header.
}

impl Suffix {
    fn layout(len: usize) -> Layout {
        // SAFETY: `ALIGN` is a power of two and key lengths are nowhere near
        // overflowing the layout size.
        unsafe { Layout::from_size_align_unchecked(HEADER + len, ALIGN) }
    }

    /// Allocates a cell holding `bytes`, or returns null for an empty
    /// remainder.
    pub fn alloc(bytes: &[u8]) -> *mut Suffix {
        if bytes.is_empty() {
            return ptr::null_mut();
        }
        let layout = Self::layout(bytes.len());
        unsafe {
            let raw = alloc(layout) as *mut Suffix;
            if raw.is_null() {
                handle_alloc_error(layout);
            }
            (*raw).len = bytes.len() as u32;
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (raw as *mut u8).add(HEADER),
                bytes.len(),
            );
            raw
        }
    }

    /// The stored bytes; the empty slice for null.
    ///
    /// # Safety
    /// `ptr` must be null or a live cell from [`Suffix::alloc`], and must
    /// stay live for `'a`.
    pub unsafe fn bytes<'a>(ptr: *const Suffix) -> &'a [u8] {
        if ptr.is_null() {
            return &[];
        }
        slice::from_raw_parts((ptr as *const u8).add(HEADER), (*ptr).len as usize)
    }

    /// # Safety
    /// `ptr` must be null or a cell from [`Suffix::alloc`] that no reader
    /// can still observe.
    pub unsafe fn free(ptr: *mut Suffix) {
        if ptr.is_null() {
            return;
        }
        let layout = Self::layout((*ptr).len as usize);
        dealloc(ptr as *mut u8, layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_remainder_is_null() {
        assert!(Suffix::alloc(b"").is_null());
        assert_eq!(unsafe { Suffix::bytes(ptr::null()) }, b"");
    }

    #[test]
    fn round_trips_bytes() {
        let cell = Suffix::alloc(b"remainder-bytes");
        assert_eq!(unsafe { Suffix::bytes(cell) }, b"remainder-bytes");
        unsafe { Suffix::free(cell) };
    }

    #[test]
    fn free_tolerates_null() {
        unsafe { Suffix::free(ptr::null_mut()) };
    }
}
