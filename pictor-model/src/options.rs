use bitflags::bitflags;

bitflags! {
    /// Per-request behavior switches.
    ///
    /// The flags participate in load-image coalescing keys: two requests
    /// that differ only in options must not share a processed-image job.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ImageRequestOptions: u16 {
        /// Skip the memory cache lookup.
        const DISABLE_MEMORY_CACHE_READS = 1 << 0;
        /// Never populate the memory cache from this request.
        const DISABLE_MEMORY_CACHE_WRITES = 1 << 1;
        /// Skip the data cache lookup.
        const DISABLE_DISK_CACHE_READS = 1 << 2;
        /// Never populate the data cache from this request.
        const DISABLE_DISK_CACHE_WRITES = 1 << 3;
        /// Serve from caches only; a miss fails with `DataMissingInCache`
        /// instead of hitting the transport.
        const RETURN_CACHE_DATA_DONT_LOAD = 1 << 4;
        /// Deliver the decoded image without the decompression pass.
        const SKIP_DECOMPRESSION = 1 << 5;
        /// Start the data load immediately, bypassing the data-loading
        /// queue's concurrency limit.
        const SKIP_DATA_LOADING_QUEUE = 1 << 6;
    }
}

impl ImageRequestOptions {
    /// Both cache read flags at once.
    pub const DISABLE_CACHE_READS: ImageRequestOptions =
        ImageRequestOptions::DISABLE_MEMORY_CACHE_READS
            .union(ImageRequestOptions::DISABLE_DISK_CACHE_READS);

    /// Both cache write flags at once.
    pub const DISABLE_CACHE_WRITES: ImageRequestOptions =
        ImageRequestOptions::DISABLE_MEMORY_CACHE_WRITES
            .union(ImageRequestOptions::DISABLE_DISK_CACHE_WRITES);
}
