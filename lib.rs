//! A translated-code cache: executable-memory management, address-range
//! indexing, and debug line-mapping for a JIT backend's emitted methods.
//!
//! The entry points are [`cache::Cache::create`] and
//! [`cache::Cache::start_method`]; everything else hangs off those two.

mod cache;
mod config;
mod debug;
mod descriptor;
mod error;
mod os;
mod page;
mod posn;
mod tree;
mod varint;

pub use crate::{
   cache::{
      Cache,
      EmitResult,
      EndMethod,
      StartMethod,
   },
   config::CacheConfig,
   descriptor::{
      Cookie,
      FuncHandle,
      DEFAULT_COOKIE,
   },
   error::{
      Error,
      Result,
   },
   posn::Posn,
};

#[cfg(test)]
mod tests {
   use super::*;

   fn emit_bytes(posn: &mut Posn<'_>, len: usize) {
      for i in 0..len {
         if posn.check_space(1).is_err() {
            break;
         }
         let byte = posn.ptr();
         // SAFETY: `check_space` just confirmed room for one more byte.
         unsafe {
            byte.write(i as u8);
         }
         posn.advance(1);
      }
   }

   #[test]
   fn empty_cache_has_no_methods() {
      let cache = Cache::create(CacheConfig::new().with_max_page_factor(0)).unwrap();

      assert!(cache.method_at(0x1000).is_none());
      assert!(cache.list_functions().is_empty());
   }

   #[test]
   fn single_method_commit_round_trips_through_method_at() {
      let mut cache = Cache::create(CacheConfig::new()).unwrap();
      let func = FuncHandle(1);

      let mut posn = match cache.start_method(0, 16, func) {
         StartMethod::Ok(posn) => posn,
         _ => panic!("expected start_method to succeed"),
      };

      let start = posn.ptr() as usize;
      emit_bytes(&mut posn, 300);

      assert_eq!(posn.end_method(EmitResult::Ok), EndMethod::Ok);

      assert_eq!(cache.method_at(start), Some((func, DEFAULT_COOKIE)));
      assert_eq!(cache.method_at(start + 299), Some((func, DEFAULT_COOKIE)));
      assert_eq!(cache.method_at(start + 300), None);
   }

   #[test]
   fn restart_on_overflow_then_succeeds_with_larger_page_factor() {
      let config = CacheConfig::new()
         .with_default_page_size(4096)
         .with_max_page_factor(4);
      let mut cache = Cache::create(config).unwrap();
      let func = FuncHandle(2);

      let posn = match cache.start_method(0, 1, func) {
         StartMethod::Ok(posn) => posn,
         _ => panic!("expected the eagerly allocated initial page to be usable"),
      };

      let mut posn = posn;
      emit_bytes(&mut posn, 5000);
      assert_eq!(posn.end_method(EmitResult::Failed), EndMethod::Restart);

      let mut posn = match cache.start_method(2, 1, func) {
         StartMethod::Ok(posn) => posn,
         _ => panic!("expected start_method(page_factor=2) to succeed"),
      };

      let start = posn.ptr() as usize;
      emit_bytes(&mut posn, 5000);
      assert_eq!(posn.end_method(EmitResult::Ok), EndMethod::Ok);

      assert_eq!(cache.method_at(start), Some((func, DEFAULT_COOKIE)));
   }

   #[test]
   fn too_big_reports_full_and_commits_nothing() {
      let config = CacheConfig::new()
         .with_byte_limit(4096)
         .with_default_page_size(4096);
      let mut cache = Cache::create(config).unwrap();
      let func = FuncHandle(3);

      let posn = match cache.start_method(0, 1, func) {
         StartMethod::Ok(posn) => posn,
         _ => panic!("expected the eagerly allocated initial page to be usable"),
      };

      let mut posn = posn;
      emit_bytes(&mut posn, 10_000);
      assert_eq!(posn.end_method(EmitResult::Failed), EndMethod::Restart);

      // The byte limit only ever covered one page; asking for a second
      // exhausts the budget and permanently closes the cache.
      match cache.start_method(2, 1, func) {
         StartMethod::TooBig => {},
         _ => panic!("expected the exhausted byte budget to report TOO_BIG"),
      }

      assert!(cache.is_full());
      assert!(cache.list_functions().is_empty());
   }

   #[test]
   fn debug_pairs_round_trip_through_native_and_bytecode_of() {
      let mut cache = Cache::create(CacheConfig::new()).unwrap();
      let func = FuncHandle(4);

      let mut posn = match cache.start_method(0, 1, func) {
         StartMethod::Ok(posn) => posn,
         _ => panic!("expected start_method to succeed"),
      };

      let start = posn.ptr() as usize;

      for &(bc, native) in &[(0, 0), (7, 12), (7, 19), (13, 40)] {
         while (posn.ptr() as usize - start) < native {
            emit_bytes(&mut posn, 1);
         }
         posn.mark_bytecode(bc);
      }
      emit_bytes(&mut posn, 1);

      assert_eq!(posn.end_method(EmitResult::Ok), EndMethod::Ok);

      assert!(matches!(cache.native_of(start, 7, true), Some(12) | Some(19)));
      assert_eq!(cache.native_of(start, 10, false), Some(19));
      assert_eq!(cache.bytecode_of(start, 40, true), Some(13));
   }

   #[test]
   fn multi_region_methods_share_one_function_entry() {
      let mut cache = Cache::create(CacheConfig::new()).unwrap();
      let func = FuncHandle(5);
      let region_a = 77;

      let mut posn = match cache.start_method(0, 1, func) {
         StartMethod::Ok(posn) => posn,
         _ => panic!("expected start_method to succeed"),
      };

      let start = posn.ptr() as usize;
      emit_bytes(&mut posn, 100);
      posn.new_region(region_a);
      emit_bytes(&mut posn, 50);

      assert_eq!(posn.end_method(EmitResult::Ok), EndMethod::Ok);

      assert_eq!(cache.method_at(start + 50), Some((func, DEFAULT_COOKIE)));
      assert_eq!(cache.method_at(start + 120), Some((func, region_a)));
      assert_eq!(cache.list_functions(), vec![func]);
   }
}
