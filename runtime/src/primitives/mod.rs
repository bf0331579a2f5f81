//! Parallel primitives, in one flavor per backend.
//!
//! Every operation is exposed through the thread-state capability set; the
//! implementations here share the launch machinery (task chains on the CPU,
//! the stream plus builtin kernels on CUDA) with the fused kernels produced
//! by the evaluator.

use std::sync::atomic::{AtomicU32, Ordering};

use lanejit_dtype::{ReduceOp, VarType};

use crate::error::Result;
use crate::memory;
use crate::thread_state::ThreadState;
use crate::JitBackend;

pub mod cpu;
pub mod cuda_kernels;

#[cfg(feature = "cuda")]
pub mod cuda;

/// One entry of an aggregate request: positive sizes store the low bytes of
/// `src` as an immediate, negative sizes copy that many bytes from `*src`.
///
/// The layout matches the device-side `AggregationEntry` struct.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct AggregationEntry {
    pub offset: usize,
    pub size: i32,
    pub src: usize,
}

static CPU_BLOCK_SIZE: AtomicU32 = AtomicU32::new(16384);

/// Elements per worker block used by the CPU primitives.
pub fn cpu_block_size() -> u32 {
    CPU_BLOCK_SIZE.load(Ordering::Relaxed)
}

/// Override the CPU block granularity (mainly for tests).
pub fn set_cpu_block_size(size: u32) {
    CPU_BLOCK_SIZE.store(size.max(1), Ordering::Relaxed);
}

/// Shared implementation of `all`/`any`: pad the boolean array to a multiple
/// of four bytes with a neutral filler, reduce it as `u32` words, then
/// combine the four result bytes on the host.
pub(crate) fn bool_reduce(
    ts: &mut ThreadState,
    values: *mut u8,
    size: u32,
    is_all: bool,
) -> Result<bool> {
    if size == 0 {
        return Ok(is_all);
    }

    let reduced_size = size.div_ceil(4);
    let trailing = reduced_size * 4 - size;
    if trailing > 0 {
        let filler = [is_all as u8];
        ts.memset_async(unsafe { values.add(size as usize) }, trailing, 1, &filler)?;
    }

    let out = match ts.backend {
        JitBackend::Cpu => lanejit_device::alloc::malloc(lanejit_device::AllocType::HostAsync, 4)?,
        #[cfg(feature = "cuda")]
        JitBackend::Cuda => lanejit_device::cuda::malloc_pinned(ts.device, 4)?,
        #[cfg(not(feature = "cuda"))]
        JitBackend::Cuda => {
            return Err(lanejit_device::Error::BackendUnavailable { backend: "cuda" }.into())
        }
    };

    let op = if is_all { ReduceOp::And } else { ReduceOp::Or };
    ts.reduce(VarType::UInt32, op, values as *const u8, reduced_size, out)?;
    ts.sync()?;

    let bytes = unsafe { std::slice::from_raw_parts(out, 4) };
    let result = if is_all {
        bytes[0] & bytes[1] & bytes[2] & bytes[3] != 0
    } else {
        bytes[0] | bytes[1] | bytes[2] | bytes[3] != 0
    };

    memory::free_async(out)?;
    Ok(result)
}
