//! Thin wrappers around the OS primitives the page allocator needs.
//!
//! Grounded on `tcg-backend::code_buffer::CodeBuffer` and the
//! `dynasm-rs` `ExecutableBuffer`/`MmapMut` wrappers: anonymous, private
//! `mmap` for the initial mapping, `mprotect` to flip W/X, `munmap` to
//! release. No external OS-abstraction crate is pulled in for this —
//! `libc` is already part of the teacher's dependency set and these are
//! three syscalls wide.

use std::{
   io,
   ptr,
};

use crate::error::{
   Error,
   Result,
};

/// The OS's executable-page granularity, queried once and assumed stable
/// for the process lifetime.
#[must_use]
pub fn exec_page_size() -> usize {
   // SAFETY: sysconf with a well-known name is always safe to call.
   unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Map `size` bytes of fresh, zeroed, read+write+execute anonymous memory.
///
/// `size` must already be a multiple of [`exec_page_size`]; this function
/// does not round it.
///
/// Mapped RWX rather than RW-then-mprotect-to-RX: the cache interleaves
/// writes into a page with later writes into *other* regions of the same
/// page (code grows up, auxiliary data grows down, and both are written
/// across many `start_method`/`end_method` calls before the page is full),
/// so there is no single point at which "this page is done being written"
/// to drive a W^X flip. Non-goals (§1) exclude relocation/compaction, so
/// this is the simplest mapping that satisfies the actual write pattern.
pub fn alloc_exec(size: usize) -> Result<*mut u8> {
   debug_assert_eq!(size % exec_page_size(), 0, "caller must page-align size");

   // SAFETY: MAP_ANONYMOUS | MAP_PRIVATE with no file descriptor is always
   // a valid mmap call; the result is checked below.
   let ptr = unsafe {
      libc::mmap(
         ptr::null_mut(),
         size,
         libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
         libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
         -1,
         0,
      )
   };

   if ptr == libc::MAP_FAILED {
      return Err(Error::PageAllocation {
         size,
         source: io::Error::last_os_error(),
      });
   }

   Ok(ptr.cast::<u8>())
}

/// Release a mapping obtained from [`alloc_exec`].
///
/// # Safety
///
/// `ptr` must be the base address returned by a prior [`alloc_exec`] call
/// and `size` must be the exact size passed to it; the mapping must not be
/// in use by any other thread.
pub unsafe fn free_exec(ptr: *mut u8, size: usize) {
   // Intentionally does not touch `ptr`'s contents before freeing it: the
   // page may be about to be paged out, and reading it first would pull it
   // back in for no reason.
   unsafe {
      libc::munmap(ptr.cast::<libc::c_void>(), size);
   }
}
