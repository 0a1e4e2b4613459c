/// Construction parameters for a [`crate::cache::Cache`].
///
/// Mirrors the teacher's small plain config structs (e.g. `compile::Oracle`)
/// rather than a global: a cache is fully described by what you pass to
/// [`crate::cache::Cache::create`].
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
   /// Total executable-memory budget in bytes. `None` means unlimited.
   pub byte_limit: Option<usize>,
   /// Default page size requested from the OS allocator, rounded up to a
   /// multiple of the OS executable page size at creation time.
   pub default_page_size: usize,
   /// Largest `factor` a single [`crate::cache::Cache::start_method`] call
   /// may request.
   pub max_page_factor: usize,
}

impl CacheConfig {
   /// A reasonable default: unlimited budget, one 64 KiB page by default,
   /// pages up to 16x that size for oversized methods.
   #[must_use]
   pub fn new() -> Self {
      Self {
         byte_limit: None,
         default_page_size: 64 * 1024,
         max_page_factor: 16,
      }
   }

   #[must_use]
   pub fn with_byte_limit(mut self, byte_limit: usize) -> Self {
      self.byte_limit = Some(byte_limit);
      self
   }

   #[must_use]
   pub fn with_default_page_size(mut self, size: usize) -> Self {
      self.default_page_size = size;
      self
   }

   #[must_use]
   pub fn with_max_page_factor(mut self, factor: usize) -> Self {
      self.max_page_factor = factor;
      self
   }
}

impl Default for CacheConfig {
   fn default() -> Self {
      Self::new()
   }
}
