//! Launch layer: dispatch one assembled group's kernel on the backend.

use std::sync::Arc;

use lanejit_device::Task;
use lanejit_dtype::{JitBackend, KernelType};
use parking_lot::MutexGuard;

use crate::cache::Kernel;
use crate::compile::KernelData;
use crate::error::{InternalSnafu, Result};
use crate::flags::{flag, JitFlag};
use crate::history::{self, KernelHistoryEntry};
use crate::schedule::ScheduledGroup;
use crate::state::{EvalScratch, State};
use crate::thread_state::{BackendState, ThreadState};
use crate::POOL_BLOCK_SIZE;

/// Launch `kernel` for `group`; returns the spawned task on the CPU backend
/// so the evaluator can collapse all group tasks afterwards.
pub fn launch(
    guard: &mut MutexGuard<'static, State>,
    ts: &mut ThreadState,
    scratch: &mut EvalScratch,
    kernel: &Arc<Kernel>,
    group: ScheduledGroup,
) -> Result<Option<Task>> {
    match ts.backend {
        JitBackend::Cpu => launch_cpu(ts, scratch, kernel, group).map(Some),
        JitBackend::Cuda => launch_cuda(guard, ts, scratch, kernel, group).map(|()| None),
    }
}

fn launch_cpu(
    ts: &mut ThreadState,
    scratch: &mut EvalScratch,
    kernel: &Arc<Kernel>,
    group: ScheduledGroup,
) -> Result<Task> {
    let KernelData::Cpu(_) = &kernel.data else {
        return InternalSnafu { reason: "CPU launch with a non-CPU kernel".to_string() }.fail();
    };
    let BackendState::Cpu(cpu) = &ts.inner else {
        return InternalSnafu { reason: "CPU launch on a non-CPU thread state".to_string() }.fail();
    };

    let size = group.size;
    let blocks = size.div_ceil(POOL_BLOCK_SIZE).max(1);
    let params: Arc<Vec<usize>> = Arc::new(scratch.params.clone());
    let handle = Arc::clone(kernel);

    tracing::trace!(size, blocks, "scheduling kernel on the pool");

    // Every group of this eval depends on the task chain as it was when the
    // eval started; the evaluator collapses the group tasks at the end.
    let deps: Vec<&Task> = cpu.task.iter().collect();
    let task = Task::submit(&deps, blocks, move |index| {
        let start = index * POOL_BLOCK_SIZE;
        let end = (start + POOL_BLOCK_SIZE).min(size);
        if let KernelData::Cpu(compiled) = &handle.data {
            unsafe { (compiled.entry())(start, end, params.as_ptr() as *const *mut u8) };
        }
    });

    if flag(JitFlag::LaunchBlocking) {
        task.wait();
    }
    if flag(JitFlag::KernelHistory) {
        let mut entry = KernelHistoryEntry::new(JitBackend::Cpu, KernelType::Jit, size);
        entry.input_count = scratch.params.len() as u32;
        entry.task = Some(task.clone());
        history::append(entry);
    }

    Ok(task)
}

#[cfg(feature = "cuda")]
fn launch_cuda(
    guard: &mut MutexGuard<'static, State>,
    ts: &mut ThreadState,
    scratch: &mut EvalScratch,
    kernel: &Arc<Kernel>,
    group: ScheduledGroup,
) -> Result<()> {
    use lanejit_device::cuda::{self, sys};

    use crate::CUDA_ARG_LIMIT;

    let KernelData::Cuda(compiled) = &kernel.data else {
        return InternalSnafu { reason: "CUDA launch with a non-CUDA kernel".to_string() }.fail();
    };
    let BackendState::Cuda(state) = &ts.inner else {
        return InternalSnafu { reason: "CUDA launch on a non-CUDA thread state".to_string() }
            .fail();
    };

    let device = guard
        .devices
        .get(ts.device as usize)
        .ok_or_else(|| InternalSnafu { reason: "missing device descriptor".to_string() }.build())?
        .clone();

    let ctx = state.context as sys::CUcontext;
    let stream = state.stream as sys::CUstream;
    let _guard = cuda::ScopedContext::new(ctx)?;

    // Stage the parameters through a device buffer when there are too many
    // to pass directly.
    let mut params: Vec<usize> = scratch.params.clone();
    if params.len() > CUDA_ARG_LIMIT {
        let bytes = params.len() * 8;
        let pinned = cuda::malloc_pinned(ts.device, bytes)?;
        let staged = cuda::malloc_device(ts.device, bytes)?;
        unsafe {
            std::ptr::copy_nonoverlapping(params.as_ptr() as *const u8, pinned, bytes);
            cuda::cuda_check(
                sys::cuMemcpyAsync(staged as sys::CUdeviceptr, pinned as sys::CUdeviceptr, bytes, stream),
                "cuMemcpyAsync",
            )?;
        }
        // The pinned staging copy dies right away; the device buffer lives
        // until the evaluator frees it after the launch.
        crate::memory::free_async(pinned)?;
        scratch.staged_params = staged as usize;
        params = vec![staged as usize];
    }

    let (block_count, thread_count) = device.launch_config(group.size, compiled.block_size, 4);

    let mut entry = KernelHistoryEntry::new(JitBackend::Cuda, KernelType::Jit, group.size);
    let record_history = flag(JitFlag::KernelHistory);
    if record_history {
        unsafe {
            let mut start: sys::CUevent = std::ptr::null_mut();
            let mut end: sys::CUevent = std::ptr::null_mut();
            cuda::cuda_check(
                sys::cuEventCreate(&mut start, sys::CUevent_flags::CU_EVENT_DEFAULT as u32),
                "cuEventCreate",
            )?;
            cuda::cuda_check(
                sys::cuEventCreate(&mut end, sys::CUevent_flags::CU_EVENT_DEFAULT as u32),
                "cuEventCreate",
            )?;
            cuda::cuda_check(sys::cuEventRecord(start, stream), "cuEventRecord")?;
            entry.event_start = start as usize;
            entry.event_end = end as usize;
        }
    }

    let mut buffer_size = params.len() * 8;
    let mut config = [
        1usize as *mut std::os::raw::c_void, // CU_LAUNCH_PARAM_BUFFER_POINTER
        params.as_mut_ptr() as *mut std::os::raw::c_void,
        2usize as *mut std::os::raw::c_void, // CU_LAUNCH_PARAM_BUFFER_SIZE
        (&mut buffer_size) as *mut usize as *mut std::os::raw::c_void,
        std::ptr::null_mut(), // CU_LAUNCH_PARAM_END
    ];

    unsafe {
        cuda::cuda_check(
            sys::cuLaunchKernel(
                compiled.func as sys::CUfunction,
                block_count,
                1,
                1,
                thread_count,
                1,
                1,
                0,
                stream,
                std::ptr::null_mut(),
                config.as_mut_ptr(),
            ),
            "cuLaunchKernel",
        )?;
    }

    if flag(JitFlag::LaunchBlocking) {
        unsafe { cuda::cuda_check(sys::cuStreamSynchronize(stream), "cuStreamSynchronize")? };
    }
    if record_history {
        unsafe {
            cuda::cuda_check(
                sys::cuEventRecord(entry.event_end as sys::CUevent, stream),
                "cuEventRecord",
            )?;
        }
        entry.input_count = scratch.params.len() as u32;
        history::append(entry);
    }

    Ok(())
}

#[cfg(not(feature = "cuda"))]
fn launch_cuda(
    _guard: &mut MutexGuard<'static, State>,
    _ts: &mut ThreadState,
    _scratch: &mut EvalScratch,
    _kernel: &Arc<Kernel>,
    _group: ScheduledGroup,
) -> Result<()> {
    Err(lanejit_device::Error::BackendUnavailable { backend: "cuda" }.into())
}
