//! Debug-pair recording: `(bytecode_offset, native_offset)` line-mapping
//! entries, staged in a scratch buffer and flushed into chained fixed-size
//! auxiliary buffers.

use std::ptr::NonNull;

use smallvec::SmallVec;

use crate::varint;

/// Payload capacity of one chained debug buffer.
pub const DEBUG_BUFFER_PAYLOAD: usize = 64;

/// Terminates a method's debug-pair stream.
pub const SENTINEL_END: i32 = -1;
/// Marks "the rest of this stream continues in the next buffer".
pub const SENTINEL_CHAIN: i32 = -2;

/// One link in a method's debug-pair chain, itself an auxiliary allocation
/// living in the same page as the code it describes.
#[repr(C)]
pub struct DebugBuffer {
   pub len: u16,
   pub next: Option<NonNull<DebugBuffer>>,
   pub payload: [u8; DEBUG_BUFFER_PAYLOAD],
}

/// Staging area for one region's debug pairs before they are committed into
/// a chain of [`DebugBuffer`]s.
///
/// Grounded on the scratch-then-flush pattern `cab-runtime`'s `Code`/`Thunk`
/// use for their byte streams, specialized to the spec's flush trigger:
/// flush before the scratch buffer could fail to hold one more max-sized
/// pair plus a sentinel.
#[derive(Default)]
pub struct DebugRecorder {
   scratch: SmallVec<u8, DEBUG_BUFFER_PAYLOAD>,
}

impl DebugRecorder {
   #[must_use]
   pub fn new() -> Self {
      Self::default()
   }

   /// Would appending one more pair of this size, plus the worst-case
   /// end-of-stream sentinel (`(-1, -1)`, two varints), overflow the fixed
   /// buffer payload?
   #[must_use]
   pub fn would_overflow(&self, pair_len: usize) -> bool {
      self.scratch.len() + pair_len + 2 * varint::MAX_ENCODED_LEN > DEBUG_BUFFER_PAYLOAD
   }

   pub fn push_pair(&mut self, bc_offset: i32, native_offset: i32) {
      self.scratch.extend_from_slice(&varint::encode(bc_offset));
      self.scratch.extend_from_slice(&varint::encode(native_offset));
   }

   /// Mark "the rest of this stream continues in the next buffer".
   pub fn push_chain_sentinel(&mut self) {
      self.scratch.extend_from_slice(&varint::encode(SENTINEL_CHAIN));
   }

   /// Terminate the stream. Written as the pair `(-1, -1)`, not a lone
   /// `-1`: `DebugIter` only ever reads the first element before
   /// stopping, but the pair shape is what the stream actually commits.
   pub fn push_end_sentinel(&mut self) {
      self.scratch.extend_from_slice(&varint::encode(SENTINEL_END));
      self.scratch.extend_from_slice(&varint::encode(SENTINEL_END));
   }

   #[must_use]
   pub fn is_empty(&self) -> bool {
      self.scratch.is_empty()
   }

   /// Copy the scratch bytes into a freshly allocated buffer's payload and
   /// clear the scratch area. The caller supplies the already-allocated,
   /// zeroed buffer (allocation goes through the same auxiliary allocator
   /// as any other aux request, so it is subject to the same window-
   /// overflow rules).
   pub fn drain_into(&mut self, buffer: &mut DebugBuffer) {
      debug_assert!(self.scratch.len() <= DEBUG_BUFFER_PAYLOAD);

      buffer.payload[..self.scratch.len()].copy_from_slice(&self.scratch);
      buffer.len = self.scratch.len() as u16;
      buffer.next = None;

      self.scratch.clear();
   }
}

/// Reads a method's (or region's) debug-pair stream, transparently
/// following `next` links and stopping at the end sentinel.
pub struct DebugIter {
   current: Option<NonNull<DebugBuffer>>,
   offset: usize,
}

impl DebugIter {
   #[must_use]
   pub fn new(head: Option<NonNull<DebugBuffer>>) -> Self {
      Self {
         current: head,
         offset: 0,
      }
   }
}

impl Iterator for DebugIter {
   type Item = (i32, i32);

   fn next(&mut self) -> Option<Self::Item> {
      loop {
         let buf_ptr = self.current?;

         // SAFETY: debug buffers are immutable for the cache's lifetime
         // once a region is committed, and `DebugIter` never outlives the
         // cache in practice (callers borrow the cache to construct one).
         let buf = unsafe { buf_ptr.as_ref() };

         let remaining = buf.payload.get(self.offset..buf.len as usize)?;
         let (bc, bc_len) = varint::decode(remaining)?;

         match bc {
            SENTINEL_END => return None,
            SENTINEL_CHAIN => {
               self.current = buf.next;
               self.offset = 0;
               continue;
            },
            _ => {},
         }

         let remaining = buf.payload.get(self.offset + bc_len..buf.len as usize)?;
         let (native, native_len) = varint::decode(remaining)?;

         self.offset += bc_len + native_len;
         return Some((bc, native));
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn make_buffer() -> DebugBuffer {
      DebugBuffer {
         len: 0,
         next: None,
         payload: [0; DEBUG_BUFFER_PAYLOAD],
      }
   }

   #[test]
   fn recorder_flushes_before_overflow() {
      let mut recorder = DebugRecorder::new();

      for _ in 0..40 {
         recorder.push_pair(7, 7);
      }

      assert!(recorder.would_overflow(varint::MAX_ENCODED_LEN * 2));
   }

   #[test]
   fn iterates_single_buffer() {
      let mut recorder = DebugRecorder::new();
      recorder.push_pair(0, 0);
      recorder.push_pair(7, 12);
      recorder.push_pair(7, 19);
      recorder.push_pair(13, 40);
      recorder.push_end_sentinel();

      let mut buffer = make_buffer();
      recorder.drain_into(&mut buffer);

      let pairs: Vec<_> = DebugIter::new(Some(NonNull::from(&buffer))).collect();
      assert_eq!(pairs, vec![(0, 0), (7, 12), (7, 19), (13, 40)]);
   }

   #[test]
   fn iterates_across_chain() {
      let mut recorder = DebugRecorder::new();
      recorder.push_pair(0, 0);
      recorder.push_chain_sentinel();

      let mut first = make_buffer();
      recorder.drain_into(&mut first);

      recorder.push_pair(5, 9);
      recorder.push_end_sentinel();

      let mut second = make_buffer();
      recorder.drain_into(&mut second);
      first.next = Some(NonNull::from(&second));

      let pairs: Vec<_> = DebugIter::new(Some(NonNull::from(&first))).collect();
      assert_eq!(pairs, vec![(0, 0), (5, 9)]);
   }
}
