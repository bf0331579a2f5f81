//! Deferred release of runtime allocations.
//!
//! Buffers handed to asynchronous kernels may not be released while work is
//! still in flight. `free_async` deregisters an allocation and parks it on a
//! pending list; the thread-state layer drains the list behind a cleanup
//! task (CPU) or a stream synchronization point (CUDA).

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use lanejit_device::alloc::{self, Allocation};

use crate::Result;

static PENDING: Lazy<Mutex<Vec<Allocation>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Queue an allocation for release once in-flight work has drained.
pub fn free_async(ptr: *mut u8) -> Result<()> {
    if ptr.is_null() {
        return Ok(());
    }
    let allocation = alloc::free(ptr)?;
    PENDING.lock().push(allocation);
    Ok(())
}

/// Take everything queued for release.
pub fn take_pending() -> Vec<Allocation> {
    std::mem::take(&mut *PENDING.lock())
}

/// Immediately release a batch of allocations.
pub fn release_all(allocations: Vec<Allocation>) {
    for allocation in allocations {
        alloc::release(allocation);
    }
}

/// Number of allocations currently parked; used by tests.
pub fn pending_count() -> usize {
    PENDING.lock().len()
}
