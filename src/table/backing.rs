//! Slot storage for tables.
//!
//! Backings above a size threshold are mapped with `MAP_HUGETLB`, falling
//! back to an ordinary anonymous mapping and finally to the heap. Neither
//! path matters for correctness; hugepages only spare the TLB on
//! million-slot caches.
use core::ops::{Deref, DerefMut};
use core::{fmt, mem, ptr, slice};
use std::alloc::Layout;

/// Byte size from which a mapping is attempted before the heap.
pub const HUGEPAGE_THRESHOLD: usize = 2 * 1024 * 1024;

#[cfg(target_os = "linux")]
const MAP_HUGETLB: libc::c_int = libc::MAP_HUGETLB;
#[cfg(not(target_os = "linux"))]
const MAP_HUGETLB: libc::c_int = 0;

/// Every allocation path failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "backing allocation failed")
    }
}

/// An owned slice of slots, hugepage-mapped or heap-allocated.
pub struct Backing<T: Copy> {
    ptr: *mut T,
    len: usize,
    kind: Kind,
}

enum Kind {
    Heap(Layout),
    Mapped { bytes: usize },
}

impl<T: Copy> Backing<T> {
    /// Allocate `len` slots, every one initialized to `fill`.
    pub fn allocate(len: usize, fill: T) -> Result<Backing<T>, AllocError> {
        assert!(len > 0);
        let bytes = len.checked_mul(mem::size_of::<T>()).ok_or(AllocError)?;

        let mut backing = if bytes >= HUGEPAGE_THRESHOLD {
            match Self::map(bytes, true).or_else(|| Self::map(bytes, false)) {
                Some(ptr) => Backing { ptr, len, kind: Kind::Mapped { bytes } },
                None => Self::heap(len)?,
            }
        } else {
            Self::heap(len)?
        };

        for slot in backing.iter_mut() {
            *slot = fill;
        }
        Ok(backing)
    }

    fn heap(len: usize) -> Result<Backing<T>, AllocError> {
        let layout = Layout::array::<T>(len).map_err(|_| AllocError)?;
        // SAFETY: layout is non-zero since len > 0 and T is inhabited here.
        let ptr = unsafe { std::alloc::alloc(layout) } as *mut T;
        if ptr.is_null() {
            return Err(AllocError);
        }
        Ok(Backing { ptr, len, kind: Kind::Heap(layout) })
    }

    fn map(bytes: usize, huge: bool) -> Option<*mut T> {
        let flags = libc::MAP_PRIVATE
            | libc::MAP_ANONYMOUS
            | if huge { MAP_HUGETLB } else { 0 };
        // SAFETY: anonymous mapping, no fd, offset zero.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            None
        } else {
            Some(ptr as *mut T)
        }
    }

    /// Whether the slots live in a mapping rather than on the heap.
    pub fn is_mapped(&self) -> bool {
        matches!(self.kind, Kind::Mapped { .. })
    }
}

impl<T: Copy> Deref for Backing<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: ptr/len describe the allocation, initialized on creation.
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl<T: Copy> DerefMut for Backing<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: as above, and we hold the unique owner.
        unsafe { slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl<T: Copy> Drop for Backing<T> {
    fn drop(&mut self) {
        match self.kind {
            Kind::Heap(layout) => {
                // SAFETY: allocated with this exact layout.
                unsafe { std::alloc::dealloc(self.ptr as *mut u8, layout) }
            }
            Kind::Mapped { bytes } => {
                // SAFETY: mapped with this exact length.
                unsafe { libc::munmap(self.ptr as *mut libc::c_void, bytes) };
            }
        }
    }
}
