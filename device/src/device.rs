//! Read-only descriptor of one accelerator.

/// Properties of a single device, captured once at initialization.
#[derive(Debug, Clone)]
pub struct Device {
    /// Device ordinal.
    pub id: i32,
    /// Compute capability, encoded as `major * 10 + minor`.
    pub compute_capability: u32,
    /// Number of streaming multiprocessors.
    pub sm_count: u32,
    /// Usable shared memory per block in bytes.
    pub shared_memory_bytes: u32,
}

impl Device {
    /// Choose a `(block_count, thread_count)` pair for a kernel processing
    /// `size` elements.
    ///
    /// `max_threads` is the per-function launch bound (the preferred block
    /// size of a compiled kernel, or 1024 for the builtin kernels);
    /// `max_blocks_per_sm` caps how many blocks are produced per SM.
    pub fn launch_config(&self, size: u32, max_threads: u32, max_blocks_per_sm: u32) -> (u32, u32) {
        debug_assert!(max_threads > 0);
        let blocks_avail = size.div_ceil(max_threads);

        let blocks = if blocks_avail < self.sm_count {
            // Not enough work to keep every SM busy with one block
            blocks_avail
        } else {
            let per_sm = (blocks_avail.div_ceil(self.sm_count)).min(max_blocks_per_sm);
            per_sm * self.sm_count
        };

        let mut threads = max_threads;
        if blocks <= 1 && size < max_threads {
            threads = size.div_ceil(32) * 32;
        }

        (blocks.max(1), threads)
    }
}

/// Placeholder descriptor used by the CPU backend, which has no device table
/// entry of its own.
pub const CPU_DEVICE_ID: i32 = -1;

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device { id: 0, compute_capability: 75, sm_count: 40, shared_memory_bytes: 48 * 1024 }
    }

    #[test]
    fn small_sizes_round_to_warps() {
        let (blocks, threads) = device().launch_config(17, 1024, 4);
        assert_eq!(blocks, 1);
        assert_eq!(threads, 32);
    }

    #[test]
    fn large_sizes_cap_blocks_per_sm() {
        let dev = device();
        let (blocks, threads) = dev.launch_config(100_000_000, 1024, 4);
        assert_eq!(threads, 1024);
        assert_eq!(blocks, dev.sm_count * 4);
    }

    #[test]
    fn mid_sizes_use_available_blocks() {
        let (blocks, threads) = device().launch_config(4096, 1024, 4);
        assert_eq!(blocks, 4);
        assert_eq!(threads, 1024);
    }
}
