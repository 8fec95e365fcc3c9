use std::time::Duration;

/// Tunables for the disk I/O subsystem.
///
/// Sizes are in 16 KiB blocks unless noted. The defaults match a small
/// desktop client; a seeding box wants a larger `cache_size`.
#[derive(Debug, Clone)]
pub struct DiskSettings {
    /// Block cache budget, in blocks.
    pub cache_size: usize,
    /// Number of contiguous hashed blocks required before a write piece is
    /// flushed. Values larger than a whole piece enable multi-piece stripe
    /// flushes (see `allow_partial_writes`).
    pub write_cache_line_size: u32,
    /// Read-ahead span, in blocks, for cache misses.
    pub read_cache_line_size: u32,
    /// Age at which dirty blocks are flushed regardless of hash progress.
    pub cache_expiry: Duration,
    /// Serve reads from and populate the read side of the cache.
    pub use_read_cache: bool,
    /// Coalesce writes in the cache before flushing.
    pub use_write_cache: bool,
    /// When false and `write_cache_line_size` spans multiple pieces, a
    /// write flush waits until every piece of the stripe is complete and
    /// issues one contiguous writev across all of them.
    pub allow_partial_writes: bool,
    /// Skip piece hashing entirely (flushes no longer wait for the hash
    /// cursor).
    pub disable_hash_checks: bool,
    /// Worker threads. Every fourth thread services only the hash queue.
    pub num_threads: usize,
}

impl Default for DiskSettings {
    fn default() -> Self {
        Self {
            cache_size: 1024,
            write_cache_line_size: 16,
            read_cache_line_size: 32,
            cache_expiry: Duration::from_secs(300),
            use_read_cache: true,
            use_write_cache: true,
            allow_partial_writes: true,
            disable_hash_checks: false,
            num_threads: 1,
        }
    }
}
