//! Virtual-memory plumbing for the mapper: the reserved target region and a
//! bounds-checked write cursor over it.

use cfg_if::cfg_if;

use crate::error::{LoadError, Result};

/// Write cursor over a fixed-size memory region.
///
/// Every write is checked against the region length, so a malformed section
/// layout surfaces as [`LoadError::Truncated`] instead of an out-of-bounds
/// store.
pub(crate) struct ImageWriter {
    base: *mut u8,
    size: usize,
    pos: usize,
}

impl ImageWriter {
    /// # Safety
    ///
    /// `base` must be valid for writes of `size` bytes for the lifetime of
    /// the writer.
    pub(crate) unsafe fn new(base: *mut u8, size: usize) -> Self {
        Self { base, size, pos: 0 }
    }

    pub(crate) fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.size {
            return Err(LoadError::Truncated);
        }
        self.pos = pos;
        Ok(())
    }

    pub(crate) fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.pos.checked_add(bytes.len()).ok_or(LoadError::Truncated)?;
        if end > self.size {
            return Err(LoadError::Truncated);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(self.pos), bytes.len());
        }
        self.pos = end;
        Ok(())
    }
}

cfg_if! {
    if #[cfg(all(target_arch = "x86_64", target_os = "windows"))] {
        use std::ffi::c_void;

        use windows::Win32::System::Memory::{
            VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, MEM_TOP_DOWN,
            PAGE_READWRITE,
        };

        /// An owned, committed, read-write region of the process address
        /// space. Freed on drop unless ownership is transferred with
        /// [`into_raw`](Reservation::into_raw).
        pub(crate) struct Reservation {
            base: *mut c_void,
            size: usize,
        }

        impl Reservation {
            /// Reserves and commits `size` bytes of read-write memory,
            /// preferring the top of the address space.
            pub(crate) fn reserve(size: usize) -> Result<Self> {
                let base = unsafe {
                    VirtualAlloc(
                        None,
                        size,
                        MEM_COMMIT | MEM_RESERVE | MEM_TOP_DOWN,
                        PAGE_READWRITE,
                    )
                };
                if base.is_null() {
                    return Err(LoadError::OutOfMemory);
                }
                Ok(Self { base, size })
            }

            pub(crate) fn size(&self) -> usize {
                self.size
            }

            pub(crate) fn writer(&mut self) -> ImageWriter {
                unsafe { ImageWriter::new(self.base as *mut u8, self.size) }
            }

            /// Releases ownership of the region without freeing it.
            pub(crate) fn into_raw(self) -> (*mut c_void, usize) {
                let raw = (self.base, self.size);
                std::mem::forget(self);
                raw
            }
        }

        impl Drop for Reservation {
            fn drop(&mut self) {
                unsafe {
                    let _ = VirtualFree(self.base, 0, MEM_RELEASE);
                }
            }
        }
    }
}
