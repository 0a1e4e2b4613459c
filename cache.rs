//! The top-level cache: page orchestration, the start/end emission
//! protocol, and the query surface (§4.6, §6).

use std::marker::PhantomData;

use crate::{
   config::CacheConfig,
   debug::DebugIter,
   descriptor::{
      Cookie,
      DescriptorPtr,
      FuncHandle,
   },
   error::{
      Error,
      Result,
   },
   os,
   page::{
      Page,
      PageTable,
   },
   posn::Posn,
   tree::Tree,
};

/// Outcome of [`Cache::start_method`].
pub enum StartMethod<'cache> {
   Ok(Posn<'cache>),
   Restart,
   TooBig,
}

/// What the emitter passes back into [`Posn::end_method`]: whether it
/// finished the method cleanly or hit some fault of its own mid-emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitResult {
   Ok,
   Failed,
}

/// Outcome of [`Posn::end_method`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndMethod {
   Ok,
   Restart,
}

/// Owns every page of executable memory the cache has allocated, the
/// lookup tree, and the free window available to the next emission.
///
/// Not `Sync`: the scheduling model (§5) is a single external writer at a
/// time, serialized by the caller's own lock, so there is no internal
/// synchronization here to make sharing across threads sound.
pub struct Cache {
   pub(crate) pages: PageTable,
   pub(crate) page_size: usize,
   pub(crate) max_page_factor: usize,
   pub(crate) pages_left: Option<usize>,
   pub(crate) free_start: *mut u8,
   pub(crate) free_end: *mut u8,
   pub(crate) tree: Tree,
   pub(crate) total_bytes: usize,
   pub(crate) permanently_full: bool,
   _not_sync: PhantomData<*mut ()>,
}

impl Cache {
   /// Round `size` up to a multiple of the OS executable page granularity.
   fn round_up_to_os_page(size: usize) -> usize {
      let os_page = os::exec_page_size();
      (size + os_page - 1) / os_page * os_page
   }

   /// Create a new cache, eagerly allocating its initial page (§3).
   pub fn create(config: CacheConfig) -> Result<Self> {
      let page_size = Self::round_up_to_os_page(config.default_page_size);

      // `jit-cache.c:400-403` floors a nonzero byte limit to at least one
      // page so a small configured limit still yields a usable cache
      // instead of one that can never allocate its eager initial page.
      let pages_left = config
         .byte_limit
         .map(|limit| (limit / page_size.max(1)).max(1));

      let mut cache = Self {
         pages: PageTable::new(),
         page_size,
         max_page_factor: config.max_page_factor,
         pages_left,
         free_start: std::ptr::null_mut(),
         free_end: std::ptr::null_mut(),
         tree: Tree::new(),
         total_bytes: 0,
         permanently_full: false,
         _not_sync: PhantomData,
      };

      // Eagerly allocate the initial page (§3 lifecycle) so a first
      // `start_method(page_factor=0, ...)` call has somewhere to write. A
      // cache configured with `max_page_factor == 0` can never hold a
      // page at all; it is created inert rather than rejected, since the
      // query surface (`method_at`, `list_functions`) still works on it.
      if config.max_page_factor >= 1 {
         cache.alloc_page(1)?;
      }

      Ok(cache)
   }

   /// True if the cache can never satisfy another `start_method` call: the
   /// byte budget is exhausted, or there is presently no live window at all
   /// (`jit-cache.c:449-452`'s `!cache->freeStart`) — which is also the
   /// state left behind by a clean restart's page refund, or by a cache
   /// whose `max_page_factor` is zero and so never holds a page.
   #[must_use]
   pub fn is_full(&self) -> bool {
      self.permanently_full || self.free_start.is_null()
   }

   #[must_use]
   pub fn total_bytes(&self) -> usize {
      self.total_bytes
   }

   /// Obtain `factor * page_size` bytes of fresh executable memory and
   /// reset the free window to span it. Grounded on §4.1.
   ///
   /// A `factor` over [`CacheConfig::with_max_page_factor`] is rejected by
   /// the caller ([`Cache::start_method`]) before this is ever called, so
   /// every failure here is the "allocation failure (OS or accounting)"
   /// category of §7: it permanently exhausts the cache, not just this
   /// call.
   pub(crate) fn alloc_page(&mut self, factor: usize) -> Result<()> {
      if let Some(left) = self.pages_left {
         if left < factor {
            self.permanently_full = true;
            return Err(Error::CacheFull {
               reason: "byte limit exhausted",
            });
         }
      }

      let size = factor * self.page_size;

      let base = match os::alloc_exec(size) {
         Ok(base) => base,
         Err(err) => {
            self.permanently_full = true;
            return Err(err);
         },
      };

      self.pages.push(Page {
         base,
         factor,
         page_size: self.page_size,
      });

      if let Some(left) = self.pages_left.as_mut() {
         *left -= factor;
      }

      self.free_start = base;
      // SAFETY: `size` is exactly the mapping just created.
      self.free_end = unsafe { base.add(size) };

      Ok(())
   }

   /// Undo the most recent [`Cache::alloc_page`]: used when a freshly
   /// allocated page is entirely consumed by a failed emission attempt
   /// (§4.1, §4.6).
   pub(crate) fn refund_last_page(&mut self) {
      if let Some(page) = self.pages.pop() {
         // SAFETY: `page` came from `os::alloc_exec` with `page.size()`
         // bytes and has just been removed from the table, so this is the
         // only place that will ever free it.
         unsafe {
            os::free_exec(page.base, page.size());
         }

         if let Some(left) = self.pages_left.as_mut() {
            *left += page.factor;
         }

         self.free_start = std::ptr::null_mut();
         self.free_end = std::ptr::null_mut();
      }
   }

   /// Auxiliary allocation not tied to any in-progress method (§6). Shrinks
   /// the current free window from the top, exactly like the allocator
   /// `Posn` uses internally, but does not require a live emission.
   ///
   /// `_jit_cache_alloc_no_method` (`jit-cache.c:621-629`) falls back to
   /// allocating a fresh page when the request doesn't fit the current
   /// window; this does the same, retrying once against the new window
   /// before giving up.
   pub fn alloc_outside(&mut self, size: usize, align: usize) -> Option<*mut u8> {
      if let Some(ptr) = self.try_alloc_outside(size, align) {
         return Some(ptr);
      }

      self.alloc_page(1).ok()?;
      self.try_alloc_outside(size, align)
   }

   fn try_alloc_outside(&mut self, size: usize, align: usize) -> Option<*mut u8> {
      let align = align.max(1);
      let limit = self.free_end as usize;
      let aligned = (limit.checked_sub(size)?) & !(align - 1);

      if aligned < self.free_start as usize {
         return None;
      }

      self.free_end = aligned as *mut u8;
      Some(aligned as *mut u8)
   }

   /// Open a write window for a new method. See [`StartMethod`] for the
   /// outcomes, grounded on §4.6.
   pub fn start_method(
      &mut self,
      page_factor: usize,
      align: usize,
      func: FuncHandle,
   ) -> StartMethod<'_> {
      if self.permanently_full {
         return StartMethod::TooBig;
      }

      if page_factor > self.max_page_factor {
         tracing::warn!(page_factor, max = self.max_page_factor, "requested page factor exceeds max_page_factor");
         return StartMethod::TooBig;
      }

      if page_factor > 0 && self.alloc_page(page_factor).is_err() {
         return StartMethod::TooBig;
      }

      if self.pages.is_empty() {
         // No page at all yet and the caller didn't ask for one: nothing
         // to emit into.
         return StartMethod::Restart;
      }

      match Posn::open(self, align, func) {
         Some(posn) => StartMethod::Ok(posn),
         None => StartMethod::Restart,
      }
   }

   /// Descend the lookup tree for the descriptor owning `pc` (§4.5).
   #[must_use]
   pub fn method_at(&self, pc: usize) -> Option<(FuncHandle, Cookie)> {
      let found = self.tree.lookup(pc)?;
      let descriptor = unsafe { found.get() };
      Some((descriptor.func, descriptor.cookie))
   }

   /// Distinct function handles in ascending address order, collapsing
   /// consecutive regions of the same function into one entry (§4.5).
   #[must_use]
   pub fn list_functions(&self) -> Vec<FuncHandle> {
      let mut out: Vec<FuncHandle> = Vec::new();

      for descriptor in self.tree.in_order() {
         let func = unsafe { descriptor.get() }.func;

         if out.last() != Some(&func) {
            out.push(func);
         }
      }

      out
   }

   fn descriptor_starting_at(&self, func_start: usize) -> Option<DescriptorPtr> {
      self.tree.lookup(func_start)
   }

   /// Map a bytecode offset to the native offset recorded against it, or
   /// (when `exact` is false) the native offset of the last pair strictly
   /// preceding the query (§4.4, §6).
   #[must_use]
   pub fn native_of(&self, func_start: usize, bc_offset: i32, exact: bool) -> Option<i32> {
      let descriptor = self.descriptor_starting_at(func_start)?;
      let head = unsafe { descriptor.get() }.debug_head;

      let mut last_native: Option<i32> = None;

      for (bc, native) in DebugIter::new(head) {
         if exact {
            if bc == bc_offset {
               return Some(native);
            }
         } else if bc < bc_offset {
            last_native = Some(native);
         } else {
            break;
         }
      }

      if exact { None } else { last_native }
   }

   /// Inverse of [`Cache::native_of`].
   #[must_use]
   pub fn bytecode_of(&self, func_start: usize, native_offset: i32, exact: bool) -> Option<i32> {
      let descriptor = self.descriptor_starting_at(func_start)?;
      let head = unsafe { descriptor.get() }.debug_head;

      let mut last_bc: Option<i32> = None;

      for (bc, native) in DebugIter::new(head) {
         if exact {
            if native == native_offset {
               return Some(bc);
            }
         } else if native < native_offset {
            last_bc = Some(bc);
         } else {
            break;
         }
      }

      if exact { None } else { last_bc }
   }
}

// `pages` and `tree` carry their own `Drop` impls that release the
// executable mappings and the sentinel boxes, so `Cache` needs no teardown
// of its own: descriptors and debug buffers live inside page memory (§9).
