use std::io;

/// Everything that can go wrong inside the cache.
///
/// This is a closed, small error surface (§7 of the design notes names
/// exactly three kinds: allocation failure, window overflow, and malformed
/// debug streams) so a plain `thiserror` enum is used instead of `anyhow` —
/// callers are expected to match on it, not just propagate it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// The OS refused to hand us executable memory, or page-table growth
   /// failed after the executable mapping already succeeded.
   #[error("failed to allocate {size} bytes of executable memory: {source}")]
   PageAllocation { size: usize, source: io::Error },

   /// The configured byte budget ran out.
   ///
   /// Once this is returned the cache is permanently exhausted: every
   /// subsequent `start_method` call returns [`crate::cache::StartMethod::TooBig`]
   /// without attempting another OS allocation.
   #[error("cache is exhausted: {reason}")]
   CacheFull { reason: &'static str },

   /// `check_space` found that the current emission window cannot hold the
   /// next instruction. Recoverable: the caller should finish the current
   /// method attempt and let `end_method` turn this into a restart.
   #[error("emission window overflowed")]
   Overflow,
}

pub type Result<T> = std::result::Result<T, Error>;
