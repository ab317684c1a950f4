//! Off-heap storage for large I/O buffers.
//!
//! Every backend connection owns a receive and a send buffer that live for
//! the whole life of the connection. These regions come from `alloc_zeroed`
//! directly, one allocation per buffer, accounted against a process-global
//! cap, instead of mixing hundreds of long-lived 128 KiB blocks into the
//! general heap.
//!
//! Reclamation is deterministic: `Drop` releases the region exactly once.
//! [`free_slice`] is the explicit release path; letting the slice fall out
//! of scope is equivalent.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, Ordering};

/// Requests below this size always come from the regular heap.
pub const MIN_OFFHEAP_SLICE: usize = 16 * 1024;

const OFFHEAP_ALIGN: usize = 64;

static ALLOC_OFFHEAP_BYTES: AtomicI64 = AtomicI64::new(0);
static MAX_OFFHEAP_BYTES: AtomicI64 = AtomicI64::new(0);

/// Bytes currently held in off-heap slices.
pub fn offheap_bytes() -> i64 {
    ALLOC_OFFHEAP_BYTES.load(Ordering::Relaxed)
}

/// The process-global cap on off-heap bytes.
pub fn max_offheap_bytes() -> i64 {
    MAX_OFFHEAP_BYTES.load(Ordering::Relaxed)
}

/// Sets the process-global cap. Zero disables off-heap allocation entirely;
/// requests then fall back to the heap.
pub fn set_max_offheap_bytes(n: i64) {
    MAX_OFFHEAP_BYTES.store(n, Ordering::Relaxed);
}

/// A fixed-size byte region allocated outside the small-object heap.
///
/// The region is zero-initialized and cache-line aligned. It is released
/// in `Drop`, decrementing the global accounting exactly once.
#[derive(Debug)]
pub struct OffheapSlice {
    ptr: NonNull<u8>,
    len: usize,
}

// The region is uniquely owned; the raw pointer never aliases.
unsafe impl Send for OffheapSlice {}
unsafe impl Sync for OffheapSlice {}

impl OffheapSlice {
    /// Allocates `n` bytes off-heap. With `force` false, returns `None`
    /// when the allocation would push the total past the global cap.
    fn alloc(n: usize, force: bool) -> Option<OffheapSlice> {
        if n == 0 {
            return None;
        }
        let after = ALLOC_OFFHEAP_BYTES.fetch_add(n as i64, Ordering::AcqRel) + n as i64;
        if !force && after > max_offheap_bytes() {
            ALLOC_OFFHEAP_BYTES.fetch_sub(n as i64, Ordering::AcqRel);
            return None;
        }
        let layout = match Layout::from_size_align(n, OFFHEAP_ALIGN) {
            Ok(layout) => layout,
            Err(_) => {
                ALLOC_OFFHEAP_BYTES.fetch_sub(n as i64, Ordering::AcqRel);
                return None;
            }
        };
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            ALLOC_OFFHEAP_BYTES.fetch_sub(n as i64, Ordering::AcqRel);
            handle_alloc_error(layout);
        };
        Some(OffheapSlice { ptr, len: n })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for OffheapSlice {
    fn drop(&mut self) {
        // Layout construction succeeded at alloc time with the same inputs.
        let layout = Layout::from_size_align(self.len, OFFHEAP_ALIGN).unwrap();
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
        ALLOC_OFFHEAP_BYTES.fetch_sub(self.len as i64, Ordering::AcqRel);
    }
}

impl Deref for OffheapSlice {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for OffheapSlice {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// Buffer storage handed to the buffered reader/writer: either a plain
/// heap allocation or an off-heap region.
#[derive(Debug)]
pub enum IoBuf {
    Heap(Box<[u8]>),
    Offheap(OffheapSlice),
}

impl IoBuf {
    /// Heap-backed, zero-initialized storage of `n` bytes.
    pub fn heap(n: usize) -> IoBuf {
        IoBuf::Heap(vec![0u8; n].into_boxed_slice())
    }

    pub fn len(&self) -> usize {
        match self {
            IoBuf::Heap(b) => b.len(),
            IoBuf::Offheap(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_offheap(&self) -> bool {
        matches!(self, IoBuf::Offheap(_))
    }
}

impl Deref for IoBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            IoBuf::Heap(b) => b,
            IoBuf::Offheap(s) => s,
        }
    }
}

impl DerefMut for IoBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            IoBuf::Heap(b) => b,
            IoBuf::Offheap(s) => s,
        }
    }
}

/// Allocates buffer storage of `n` bytes: off-heap when `n` is at least
/// [`MIN_OFFHEAP_SLICE`] and the global cap allows it, heap otherwise.
pub fn make_slice(n: usize) -> IoBuf {
    if n >= MIN_OFFHEAP_SLICE {
        if let Some(s) = OffheapSlice::alloc(n, false) {
            return IoBuf::Offheap(s);
        }
    }
    IoBuf::heap(n)
}

/// Allocates `n` bytes off-heap regardless of the cap.
///
/// # Panics
///
/// Panics when `n` is zero.
pub fn make_offheap_slice(n: usize) -> IoBuf {
    match OffheapSlice::alloc(n, true) {
        Some(s) => IoBuf::Offheap(s),
        None => panic!("make offheap slice with zero size"),
    }
}

/// Explicitly releases a slice. Dropping it has the same effect; this
/// exists so release points read as release points.
pub fn free_slice(s: IoBuf) {
    drop(s);
}
