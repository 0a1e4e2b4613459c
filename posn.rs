//! Emission position: the live write window inside one page, and the
//! two-phase `start_method`/`end_method` protocol around it (§4.2, §4.6).

use std::{
   mem::{
      align_of,
      size_of,
   },
   ptr::NonNull,
};

use crate::{
   cache::{
      Cache,
      EmitResult,
      EndMethod,
   },
   debug::{
      DebugBuffer,
      DebugRecorder,
   },
   descriptor::{
      Color,
      Cookie,
      DescriptorPtr,
      FuncHandle,
      RawDescriptor,
      DEFAULT_COOKIE,
   },
   error::{
      Error,
      Result,
   },
   varint,
};

const WORD_ALIGN: usize = size_of::<usize>();

fn align_up(addr: usize, boundary: usize) -> usize {
   debug_assert!(boundary.is_power_of_two());
   (addr + boundary - 1) & !(boundary - 1)
}

fn align_down(addr: usize, boundary: usize) -> usize {
   debug_assert!(boundary.is_power_of_two());
   addr & !(boundary - 1)
}

/// One region's in-progress state, chained via [`Posn::pending`] so that
/// `new_region` can keep several alive at once and commit all of them
/// together on a successful `end_method`.
struct Region {
   descriptor: DescriptorPtr,
   start: usize,
   debug: DebugRecorder,
}

/// Transient write cursor handed out by [`Cache::start_method`].
///
/// Borrowing `cache` mutably for `'cache` is what enforces "one emission in
/// flight at a time" (§5): the borrow checker refuses a second
/// `start_method` call until this one is dropped via `end_method`.
pub struct Posn<'cache> {
   cache: &'cache mut Cache,
   ptr: *mut u8,
   limit: *mut u8,
   fresh_page: bool,
   pending: Vec<Region>,
}

impl<'cache> Posn<'cache> {
   /// Open a window into `cache`'s current free span, sub-allocating the
   /// first region's descriptor from the top. Returns `None` on
   /// insufficient room (caller reports `RESTART`).
   pub(crate) fn open(cache: &'cache mut Cache, align: usize, func: FuncHandle) -> Option<Self> {
      let fresh_page = {
         let span = cache.free_end as usize - cache.free_start as usize;
         span == cache.pages.iter().last()?.size()
      };

      let code_start = align_up(cache.free_start as usize, align.max(1));
      let descriptor_align = align_of::<RawDescriptor>().max(WORD_ALIGN);
      let descriptor_addr = align_down(
         (cache.free_end as usize).checked_sub(size_of::<RawDescriptor>())?,
         descriptor_align,
      );

      if code_start >= descriptor_addr {
         return None;
      }

      let descriptor = unsafe {
         place_descriptor(descriptor_addr as *mut u8, RawDescriptor {
            func,
            cookie: DEFAULT_COOKIE,
            start: code_start,
            end: 0,
            debug_head: None,
            debug_tail: None,
            left: DescriptorPtr(NonNull::dangling()),
            right: DescriptorPtr(NonNull::dangling()),
            color: Color::Black,
         })
      };

      Some(Self {
         cache,
         ptr: code_start as *mut u8,
         limit: descriptor_addr as *mut u8,
         fresh_page,
         pending: vec![Region {
            descriptor,
            start: code_start,
            debug: DebugRecorder::new(),
         }],
      })
   }

   #[must_use]
   pub fn is_full(&self) -> bool {
      self.ptr as usize >= self.limit as usize
   }

   /// Next byte to write, for the emitter to write instructions through.
   #[must_use]
   pub fn ptr(&self) -> *mut u8 {
      self.ptr
   }

   /// Advance the write cursor by `n` bytes, as the emitter commits bytes
   /// it has written through [`Posn::ptr`].
   pub fn advance(&mut self, n: usize) {
      // SAFETY: callers only advance past bytes they actually wrote within
      // the window; overflow is caught by `check_space` before the write.
      self.ptr = unsafe { self.ptr.add(n) };
   }

   /// Pad the code cursor up to the next multiple of `boundary`, writing
   /// `nop_byte` into the gap, but only if the pad is smaller than
   /// `max_diff` (§6).
   pub fn align(&mut self, boundary: usize, max_diff: usize, nop_byte: u8) {
      let target = align_up(self.ptr as usize, boundary.max(1));
      let pad = target - self.ptr as usize;

      if pad == 0 || pad >= max_diff {
         return;
      }

      // SAFETY: `pad < max_diff` and the caller is expected to size
      // `max_diff` so the pad always lands inside the live window; a
      // window that is already full is caught by the overflow check on
      // the next real write regardless.
      unsafe {
         std::ptr::write_bytes(self.ptr, nop_byte, pad);
      }

      self.ptr = target as *mut u8;
   }

   /// Fail fast if the next `n` bytes of code cannot fit in the live
   /// window. The only place the cache actively raises a fault mid
   /// emission (§4.2, §7); the emitter is expected to unwind its current
   /// instruction and let `end_method` turn this into a restart.
   pub fn check_space(&mut self, n: usize) -> Result<()> {
      if self.ptr as usize + n >= self.limit as usize {
         tracing::error!(
            ptr = ?self.ptr,
            limit = ?self.limit,
            requested = n,
            "emission window overflowed"
         );
         self.ptr = self.limit;
         return Err(Error::Overflow);
      }

      Ok(())
   }

   /// Auxiliary allocation within this emission window (§4.2). On failure
   /// also forces `ptr := limit`, so the caller's very next space check or
   /// write trips the overflow path.
   pub fn alloc(&mut self, size: usize, align: usize) -> Option<*mut u8> {
      let align = align.max(1);
      let limit = self.limit as usize;

      let Some(candidate) = limit.checked_sub(size) else {
         self.ptr = self.limit;
         return None;
      };
      let aligned = align_down(candidate, align);

      if aligned < self.ptr as usize {
         self.ptr = self.limit;
         return None;
      }

      self.limit = aligned as *mut u8;
      Some(aligned as *mut u8)
   }

   fn current_region(&mut self) -> &mut Region {
      self.pending.last_mut().expect("posn always has a live region")
   }

   /// Record a `(bytecode_offset, native_offset)` debug pair at the
   /// current cursor (§4.4).
   pub fn mark_bytecode(&mut self, bc_offset: i32) {
      let native_offset = (self.ptr as usize - self.current_region().start) as i32;
      self.flush_debug_if_needed(2 * varint::MAX_ENCODED_LEN);
      self.current_region().debug.push_pair(bc_offset, native_offset);
   }

   /// Flush the current region's scratch debug buffer into a freshly
   /// allocated, chained [`DebugBuffer`] if it would be unable to hold one
   /// more maximum-sized pair plus a sentinel.
   fn flush_debug_if_needed(&mut self, headroom: usize) {
      if !self.current_region().debug.would_overflow(headroom) {
         return;
      }

      self.flush_debug(false);
   }

   /// Unconditionally drain the current region's scratch buffer into a
   /// chained `DebugBuffer`, first appending the chain sentinel (`end =
   /// false`) or the end-of-stream pair `(-1, -1)` (`end = true`).
   fn flush_debug(&mut self, end: bool) {
      if end {
         self.current_region().debug.push_end_sentinel();
      } else {
         self.current_region().debug.push_chain_sentinel();
      }

      if self.current_region().debug.is_empty() {
         return;
      }

      let Some(addr) = self.alloc(size_of::<DebugBuffer>(), align_of::<DebugBuffer>()) else {
         // No room left for the debug buffer: the overflow path (ptr was
         // just forced to limit by `alloc`) picks this up on `end_method`.
         return;
      };

      let buffer = addr.cast::<DebugBuffer>();
      // SAFETY: `addr` was just carved out of the live window by `alloc`
      // and is correctly aligned/sized for `DebugBuffer`.
      unsafe {
         buffer.write(DebugBuffer {
            len: 0,
            next: None,
            payload: [0; crate::debug::DEBUG_BUFFER_PAYLOAD],
         });
      }

      let region = self.current_region();
      // SAFETY: `buffer` was just initialized above.
      unsafe {
         region.debug.drain_into(&mut *buffer);
      }

      let buffer_ptr = NonNull::new(buffer).expect("alloc never returns null on success");
      let descriptor = unsafe { region.descriptor.get_mut() };

      match descriptor.debug_tail {
         None => {
            descriptor.debug_head = Some(buffer_ptr);
            descriptor.debug_tail = Some(buffer_ptr);
         },
         Some(mut tail) => {
            // SAFETY: `tail` was written by a previous `flush_debug` call
            // on this same region and is still live.
            unsafe {
               tail.as_mut().next = Some(buffer_ptr);
            }
            descriptor.debug_tail = Some(buffer_ptr);
         },
      }
   }

   /// Close the current region at the write cursor and open a fresh one
   /// sharing the same function but a new cookie (§4.7).
   pub fn new_region(&mut self, cookie: Cookie) {
      self.finish_region();

      let func = unsafe { self.current_region().descriptor.get() }.func;
      let code_start = self.ptr as usize;

      let Some(addr) = self.alloc(size_of::<RawDescriptor>(), align_of::<RawDescriptor>()) else {
         return;
      };

      let descriptor = unsafe {
         place_descriptor(addr, RawDescriptor {
            func,
            cookie,
            start: code_start,
            end: 0,
            debug_head: None,
            debug_tail: None,
            left: DescriptorPtr(NonNull::dangling()),
            right: DescriptorPtr(NonNull::dangling()),
            color: Color::Black,
         })
      };

      self.pending.push(Region {
         descriptor,
         start: code_start,
         debug: DebugRecorder::new(),
      });
   }

   /// Retag the current region's cookie without starting a new one.
   pub fn set_cookie(&mut self, cookie: Cookie) {
      unsafe {
         self.current_region().descriptor.get_mut().cookie = cookie;
      }
   }

   /// Finalize the current region's `end` and flush its debug stream, but
   /// do not commit it to the tree yet (used both by `new_region` and by
   /// the final `end_method` commit).
   fn finish_region(&mut self) {
      let end_pos = self.ptr as usize;
      self.flush_debug(true);
      unsafe {
         self.current_region().descriptor.get_mut().end = end_pos;
      }
   }

   /// Close the window. See [`EndMethod`] for the outcomes (§4.6).
   pub fn end_method(mut self, caller_result: EmitResult) -> EndMethod {
      if caller_result == EmitResult::Failed {
         self.ptr = self.limit;
      }

      if self.is_full() {
         if self.fresh_page {
            self.cache.refund_last_page();
         }
         return EndMethod::Restart;
      }

      self.finish_region();

      self.cache.free_start = self.ptr;
      self.cache.free_end = self.limit;

      for region in &self.pending {
         let descriptor = unsafe { region.descriptor.get() };
         self.cache.total_bytes += descriptor.end - descriptor.start;
         self.cache.tree.insert(region.descriptor);
      }

      EndMethod::Ok
   }
}

unsafe fn place_descriptor(addr: *mut u8, descriptor: RawDescriptor) -> DescriptorPtr {
   let typed = addr.cast::<RawDescriptor>();
   // SAFETY: `addr` came from an aux allocation sized and aligned for
   // `RawDescriptor` and is not aliased by anything else yet.
   unsafe {
      typed.write(descriptor);
      DescriptorPtr::new(NonNull::new_unchecked(typed))
   }
}
