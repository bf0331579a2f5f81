//! Raw memory allocation.
//!
//! The runtime traffics in raw device pointers, so allocations are tracked in
//! a process-wide registry keyed by address. `free` only *deregisters* an
//! allocation and hands it back to the caller: the owner of the execution
//! queue decides when the memory may actually be released (after chaining a
//! cleanup task, or once a stream has been synchronized), which keeps
//! asynchronous kernels from racing with host-side deallocation.
//!
//! All host allocations are 64-byte aligned and padded to a multiple of 64
//! bytes, which gives the boolean reductions their scratch bytes past the end
//! of an array and keeps vector loads in compiled kernels in bounds.

use std::alloc::Layout;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use snafu::ensure;

use crate::error::{AllocationFailedSnafu, Result, UnknownAllocationSnafu};

/// Memory kind of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocType {
    /// Plain host memory, synchronous lifetime.
    Host,
    /// Host memory written/read by pool tasks; released asynchronously.
    HostAsync,
    /// Page-locked host memory visible to the device.
    HostPinned,
    /// Device global memory.
    Device,
}

impl AllocType {
    pub const fn is_host(&self) -> bool {
        matches!(self, Self::Host | Self::HostAsync)
    }
}

/// One live or pending-release allocation.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub ptr: usize,
    pub size: usize,
    pub kind: AllocType,
    /// Device ordinal for device-side kinds, -1 otherwise.
    pub device: i32,
}

// Allocations may be released from pool workers.
unsafe impl Send for Allocation {}

const ALIGNMENT: usize = 64;

static ALLOCATIONS: Lazy<Mutex<FxHashMap<usize, Allocation>>> =
    Lazy::new(|| Mutex::new(FxHashMap::default()));

fn layout(size: usize) -> Layout {
    let padded = size.max(1).div_ceil(ALIGNMENT) * ALIGNMENT;
    Layout::from_size_align(padded, ALIGNMENT).expect("allocation layout")
}

/// Allocate `size` bytes of host memory of the given kind.
///
/// Device-side kinds are allocated through the CUDA module and only
/// registered here; requesting them from this entry point is an error.
pub fn malloc(kind: AllocType, size: usize) -> Result<*mut u8> {
    ensure!(kind.is_host(), AllocationFailedSnafu { size, kind });

    let l = layout(size);
    let ptr = unsafe { std::alloc::alloc(l) };
    ensure!(!ptr.is_null(), AllocationFailedSnafu { size, kind });

    register(Allocation { ptr: ptr as usize, size: l.size(), kind, device: -1 });
    Ok(ptr)
}

/// Track an allocation made elsewhere (pinned or device memory).
pub fn register(alloc: Allocation) {
    ALLOCATIONS.lock().insert(alloc.ptr, alloc);
}

/// Deregister an allocation and hand it to the caller for deferred release.
///
/// The memory stays valid until [`release`] is invoked, so in-flight
/// asynchronous work may keep using it.
pub fn free(ptr: *mut u8) -> Result<Allocation> {
    ALLOCATIONS
        .lock()
        .remove(&(ptr as usize))
        .ok_or_else(|| UnknownAllocationSnafu { ptr: ptr as usize }.build())
}

/// Actually release an allocation obtained from [`free`].
pub fn release(alloc: Allocation) {
    match alloc.kind {
        AllocType::Host | AllocType::HostAsync => unsafe {
            std::alloc::dealloc(
                alloc.ptr as *mut u8,
                Layout::from_size_align(alloc.size, ALIGNMENT).expect("allocation layout"),
            );
        },
        #[cfg(feature = "cuda")]
        AllocType::HostPinned => crate::cuda::release_pinned(alloc),
        #[cfg(feature = "cuda")]
        AllocType::Device => crate::cuda::release_device(alloc),
        #[cfg(not(feature = "cuda"))]
        AllocType::HostPinned | AllocType::Device => {
            tracing::error!(ptr = alloc.ptr, "leaking device allocation without cuda support");
        }
    }
}

/// Number of live (registered) allocations; used by tests.
pub fn live_count() -> usize {
    ALLOCATIONS.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_pads_and_aligns() {
        let ptr = malloc(AllocType::HostAsync, 10).unwrap();
        assert_eq!(ptr as usize % ALIGNMENT, 0);

        // The padding bytes past the logical end must be writable.
        unsafe { std::ptr::write_bytes(ptr, 0xab, 64) };

        release(free(ptr).unwrap());
    }

    #[test]
    fn double_free_is_reported() {
        let ptr = malloc(AllocType::Host, 32).unwrap();
        let alloc = free(ptr).unwrap();
        assert!(free(ptr).is_err());
        release(alloc);
    }

    #[test]
    fn device_kind_needs_cuda_module() {
        assert!(malloc(AllocType::Device, 128).is_err());
    }
}
