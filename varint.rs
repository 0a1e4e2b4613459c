//! Variable-length signed-integer codec.
//!
//! Four length classes, chosen by the smallest one whose range contains the
//! value. The payload in every class is a zigzag-encoded magnitude (so the
//! sign lives in the low bit of the assembled value, per the spec) except
//! the widest class, which stores the raw two's-complement `i32` — there is
//! no room left to gain from zigzagging a value that already needs the
//! full width.
//!
//! | Prefix (first byte, top bits) | Bytes | Signed range        |
//! |---|---|---|
//! | `0xxxxxxx`  | 1 | -64 ..= 63            |
//! | `10xxxxxx`  | 2 | -8192 ..= 8191        |
//! | `110xxxxx`  | 4 | -2^28 ..= 2^28 - 1    |
//! | `111xxxxx`  | 5 | full `i32`            |

use smallvec::SmallVec;

/// Largest encoded form is 5 bytes; callers that just want to push bytes
/// somewhere rarely need to heap-allocate for that.
pub type Encoded = SmallVec<u8, 5>;

const RANGE_1: std::ops::RangeInclusive<i32> = -64..=63;
const RANGE_2: std::ops::RangeInclusive<i32> = -8192..=8191;
const RANGE_4: std::ops::RangeInclusive<i32> = -(1 << 28)..=(1 << 28) - 1;

fn zigzag(value: i32) -> u32 {
   ((value << 1) ^ (value >> 31)) as u32
}

fn unzigzag(encoded: u32) -> i32 {
   ((encoded >> 1) as i32) ^ -((encoded & 1) as i32)
}

/// Encode `value` into its shortest valid form.
#[must_use]
pub fn encode(value: i32) -> Encoded {
   let mut out = Encoded::new();

   if RANGE_1.contains(&value) {
      let z = zigzag(value);
      out.push(z as u8 & 0x7F);
   } else if RANGE_2.contains(&value) {
      let z = zigzag(value);
      out.push(0x80 | (z as u8 & 0x3F));
      out.push((z >> 6) as u8);
   } else if RANGE_4.contains(&value) {
      let z = zigzag(value);
      out.push(0xC0 | (z as u8 & 0x1F));
      out.push((z >> 5) as u8);
      out.push((z >> 13) as u8);
      out.push((z >> 21) as u8);
   } else {
      out.push(0xE0);
      out.extend_from_slice(&value.to_le_bytes());
   }

   out
}

/// Decode one integer from the front of `bytes`.
///
/// Returns the decoded value and the number of bytes consumed, or `None` if
/// `bytes` is too short for the length class its first byte selects (a
/// truncated stream — callers must treat this distinctly from a
/// successfully decoded `0`).
#[must_use]
pub fn decode(bytes: &[u8]) -> Option<(i32, usize)> {
   let &first = bytes.first()?;

   if first & 0x80 == 0 {
      return Some((unzigzag(u32::from(first)), 1));
   }

   if first & 0x40 == 0 {
      let second = *bytes.get(1)?;
      let z = u32::from(first & 0x3F) | (u32::from(second) << 6);
      return Some((unzigzag(z), 2));
   }

   if first & 0x20 == 0 {
      let rest = bytes.get(1..4)?;
      let z = u32::from(first & 0x1F)
         | (u32::from(rest[0]) << 5)
         | (u32::from(rest[1]) << 13)
         | (u32::from(rest[2]) << 21);
      return Some((unzigzag(z), 4));
   }

   let rest = bytes.get(1..5)?;
   let value = i32::from_le_bytes(rest.try_into().expect("slice of len 4"));
   Some((value, 5))
}

/// The byte length `encode(value)` would produce, without allocating.
#[must_use]
pub fn encoded_len(value: i32) -> usize {
   if RANGE_1.contains(&value) {
      1
   } else if RANGE_2.contains(&value) {
      2
   } else if RANGE_4.contains(&value) {
      4
   } else {
      5
   }
}

/// Widest a single encoded integer can ever be.
pub const MAX_ENCODED_LEN: usize = 5;

#[cfg(test)]
mod tests {
   use proptest::prelude::*;

   use super::*;

   #[test]
   fn pins_one_byte_form() {
      let encoded = encode(0);
      assert_eq!(&*encoded, &[0x00]);

      let encoded = encode(-1);
      assert_eq!(&*encoded, &[0x01]);

      let encoded = encode(63);
      assert_eq!(&*encoded, &[0x7E]);

      let encoded = encode(-64);
      assert_eq!(&*encoded, &[0x7F]);
   }

   #[test]
   fn picks_minimal_length_class() {
      for &(value, expected_len) in &[
         (0, 1),
         (63, 1),
         (-64, 1),
         (64, 2),
         (-65, 2),
         (8191, 2),
         (-8192, 2),
         (8192, 4),
         (-8193, 4),
         ((1 << 28) - 1, 4),
         (-(1 << 28), 4),
         (1 << 28, 5),
         (-(1 << 28) - 1, 5),
         (i32::MAX, 5),
         (i32::MIN, 5),
      ] {
         assert_eq!(encoded_len(value), expected_len, "value = {value}");
         assert_eq!(encode(value).len(), expected_len, "value = {value}");
      }
   }

   #[test]
   fn decode_reports_truncation() {
      let encoded = encode(8192);
      assert_eq!(encoded.len(), 4);

      assert!(decode(&encoded[..3]).is_none());
      assert!(decode(&[]).is_none());
   }

   proptest! {
      #[test]
      fn round_trips(value: i32) {
         let encoded = encode(value);
         prop_assert_eq!(encoded.len(), encoded_len(value));

         let (decoded, consumed) = decode(&encoded).expect("full buffer must decode");
         prop_assert_eq!(decoded, value);
         prop_assert_eq!(consumed, encoded.len());
      }
   }
}
