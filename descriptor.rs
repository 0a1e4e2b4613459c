//! Per-emitted-region metadata and the handle types that key it.

use std::ptr::NonNull;

use crate::debug::DebugBuffer;

/// Opaque identity of the function a region belongs to.
///
/// The cache itself only ever compares this for equality and hands it back
/// out of `method_at`/`list_functions`; the caller is expected to maintain
/// its own mapping from this handle to whatever it actually needs (name,
/// signature, source node, ...). `Deref` is derived purely for callers'
/// convenience in comparisons and formatting, the same newtype shape used
/// throughout the teacher's runtime crate for its index types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Deref)]
pub struct FuncHandle(pub u64);

/// A region's caller-chosen disambiguator (e.g. "main body" vs "exception
/// cleanup"). `0` is the default region's cookie.
pub type Cookie = u32;

pub const DEFAULT_COOKIE: Cookie = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
   Red,
   Black,
}

/// The record actually stored in executable-page memory for one region.
///
/// Rust substitution for the LSB-packed-pointer trick the original uses to
/// save a word per node (design note in §9 of the expanded spec calls this
/// an optimization, not a requirement): `color` is a plain field instead.
/// `left`/`right` are raw pointers rather than indices because the whole
/// point of this type is to live at a fixed address inside page memory for
/// the cache's entire lifetime — nothing here is ever moved or reallocated,
/// so raw pointers are exactly as stable as an index into a `Vec` would be,
/// without needing a side-table.
#[repr(C)]
pub struct RawDescriptor {
   pub func: FuncHandle,
   pub cookie: Cookie,
   pub start: usize,
   pub end: usize,
   pub debug_head: Option<NonNull<DebugBuffer>>,
   pub debug_tail: Option<NonNull<DebugBuffer>>,
   pub left: DescriptorPtr,
   pub right: DescriptorPtr,
   pub color: Color,
}

/// A non-null pointer to a [`RawDescriptor`], used for both real nodes and
/// the cache's `head`/`nil` sentinels.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DescriptorPtr(pub NonNull<RawDescriptor>);

impl std::fmt::Debug for DescriptorPtr {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      write!(f, "DescriptorPtr({:p})", self.0.as_ptr())
   }
}

impl DescriptorPtr {
   /// # Safety
   ///
   /// `ptr` must point to a live, properly initialized `RawDescriptor` for
   /// as long as the returned handle is used.
   #[must_use]
   pub unsafe fn new(ptr: NonNull<RawDescriptor>) -> Self {
      Self(ptr)
   }

   #[must_use]
   pub fn as_ptr(self) -> *mut RawDescriptor {
      self.0.as_ptr()
   }

   /// # Safety
   ///
   /// The pointee must be alive and not concurrently mutated through
   /// another alias.
   #[must_use]
   pub unsafe fn get(self) -> &'static RawDescriptor {
      unsafe { self.0.as_ref() }
   }

   /// # Safety
   ///
   /// The pointee must be alive and exclusively accessed through this
   /// reference for its duration.
   #[must_use]
   pub unsafe fn get_mut(mut self) -> &'static mut RawDescriptor {
      unsafe { self.0.as_mut() }
   }
}
