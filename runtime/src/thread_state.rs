//! Per-thread execution state.
//!
//! Each logical caller thread owns one `ThreadState` per backend: the
//! scheduled-variable and side-effect queues, the mask stack, and the
//! backend execution handle (a task chain on the CPU, a stream plus reusable
//! event on CUDA). The parallel primitives are exposed here as a capability
//! set dispatching on the backend.

use std::cell::RefCell;

use lanejit_device::alloc::{self, AllocType};
use lanejit_device::Task;
use lanejit_dtype::{JitBackend, ReduceOp, VarType};
use parking_lot::Mutex;

use crate::error::Result;
use crate::memory;
use crate::primitives::{self, AggregationEntry};
use crate::{state, var};

/// CPU backend handle: the tail of this thread's task DAG.
#[derive(Default)]
pub struct CpuState {
    pub task: Option<Task>,
}

/// CUDA backend handle: driver context, stream and a reusable event.
#[cfg(feature = "cuda")]
pub struct CudaState {
    pub context: usize,
    pub stream: usize,
    pub event: usize,
}

pub enum BackendState {
    Cpu(CpuState),
    #[cfg(feature = "cuda")]
    Cuda(CudaState),
}

pub struct ThreadState {
    pub backend: JitBackend,
    /// Device ordinal (CUDA); -1 on the CPU backend.
    pub device: i32,
    /// User-scheduled roots awaiting evaluation.
    pub scheduled: Vec<u32>,
    /// Side-effect variables awaiting evaluation.
    pub side_effects: Vec<u32>,
    /// Stack of boolean mask variables applied to side effects.
    pub mask_stack: Vec<u32>,
    pub inner: BackendState,
}

thread_local! {
    static TS_CPU: RefCell<Option<ThreadState>> = const { RefCell::new(None) };
    static TS_CUDA: RefCell<Option<ThreadState>> = const { RefCell::new(None) };
}

fn create(backend: JitBackend) -> Result<ThreadState> {
    match backend {
        JitBackend::Cpu => Ok(ThreadState {
            backend,
            device: -1,
            scheduled: Vec::new(),
            side_effects: Vec::new(),
            mask_stack: Vec::new(),
            inner: BackendState::Cpu(CpuState::default()),
        }),
        JitBackend::Cuda => create_cuda(),
    }
}

#[cfg(feature = "cuda")]
fn create_cuda() -> Result<ThreadState> {
    use lanejit_device::cuda::{self, sys};

    {
        let mut state = state::lock();
        if state.devices.is_empty() {
            state.devices = cuda::enumerate_devices()?;
        }
        snafu::ensure!(
            !state.devices.is_empty(),
            crate::error::InvalidArgumentSnafu { reason: "no CUDA device present".to_string() }
        );
    }

    let device = 0;
    let ctx = cuda::context(device)?;
    let _guard = cuda::ScopedContext::new(ctx)?;

    let mut stream: sys::CUstream = std::ptr::null_mut();
    let mut event: sys::CUevent = std::ptr::null_mut();
    unsafe {
        cuda::cuda_check(
            sys::cuStreamCreate(&mut stream, sys::CUstream_flags::CU_STREAM_DEFAULT as u32),
            "cuStreamCreate",
        )?;
        cuda::cuda_check(
            sys::cuEventCreate(&mut event, sys::CUevent_flags::CU_EVENT_DEFAULT as u32),
            "cuEventCreate",
        )?;
    }

    Ok(ThreadState {
        backend: JitBackend::Cuda,
        device,
        scheduled: Vec::new(),
        side_effects: Vec::new(),
        mask_stack: Vec::new(),
        inner: BackendState::Cuda(CudaState {
            context: ctx as usize,
            stream: stream as usize,
            event: event as usize,
        }),
    })
}

#[cfg(not(feature = "cuda"))]
fn create_cuda() -> Result<ThreadState> {
    Err(lanejit_device::Error::BackendUnavailable { backend: "cuda" }.into())
}

/// Run `f` with the calling thread's state for `backend`, creating it on
/// first use.
pub fn with_thread_state<R>(
    backend: JitBackend,
    f: impl FnOnce(&mut ThreadState) -> Result<R>,
) -> Result<R> {
    let cell = match backend {
        JitBackend::Cpu => &TS_CPU,
        JitBackend::Cuda => &TS_CUDA,
    };
    cell.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_none() {
            *slot = Some(create(backend)?);
        }
        f(slot.as_mut().expect("thread state initialized"))
    })
}

/// Wait until all work submitted on the calling thread's state has finished,
/// then release deferred allocations.
pub fn sync_thread(backend: JitBackend) -> Result<()> {
    with_thread_state(backend, |ts| ts.sync())
}

impl ThreadState {
    /// Scratch allocation in the backend's preferred asynchronous memory.
    pub fn scratch_alloc(&self, size: usize) -> Result<*mut u8> {
        match self.backend {
            JitBackend::Cpu => Ok(alloc::malloc(AllocType::HostAsync, size)?),
            #[cfg(feature = "cuda")]
            JitBackend::Cuda => Ok(lanejit_device::cuda::malloc_device(self.device, size)?),
            #[cfg(not(feature = "cuda"))]
            JitBackend::Cuda => {
                Err(lanejit_device::Error::BackendUnavailable { backend: "cuda" }.into())
            }
        }
    }

    /// Block until the thread's queue has drained, then release deferred
    /// allocations.
    pub fn sync(&mut self) -> Result<()> {
        match &mut self.inner {
            BackendState::Cpu(cpu) => {
                if let Some(task) = &cpu.task {
                    task.wait();
                }
            }
            #[cfg(feature = "cuda")]
            BackendState::Cuda(cuda) => primitives::cuda::sync_stream(cuda)?,
        }
        memory::release_all(memory::take_pending());
        Ok(())
    }

    /// Hand deferred allocations to the execution queue: they are released
    /// only after everything currently submitted has completed.
    pub fn free_flush(&mut self) -> Result<()> {
        let pending = memory::take_pending();
        if pending.is_empty() {
            return Ok(());
        }
        match &mut self.inner {
            BackendState::Cpu(cpu) => {
                let Some(task) = &cpu.task else {
                    memory::release_all(pending);
                    return Ok(());
                };
                let payload = Mutex::new(Some(pending));
                let cleanup = Task::submit(&[task], 1, move |_| {
                    if let Some(batch) = payload.lock().take() {
                        memory::release_all(batch);
                    }
                });
                cpu.task = Some(cleanup);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            BackendState::Cuda(cuda) => primitives::cuda::free_flush(cuda, pending),
        }
    }

    // -- mask stack ---------------------------------------------------------

    /// Push a boolean mask variable; scatters issued while it is on the
    /// stack are restricted to its enabled lanes.
    pub fn mask_push(&mut self, index: u32) -> Result<()> {
        let mut state = state::lock();
        var::inc_ref_ext(&mut state, index)?;
        drop(state);
        self.mask_stack.push(index);
        Ok(())
    }

    pub fn mask_pop(&mut self) -> Result<()> {
        if let Some(index) = self.mask_stack.pop() {
            let mut state = state::lock();
            var::dec_ref_ext(&mut state, index)?;
        }
        Ok(())
    }

    pub fn mask_peek(&self) -> Option<u32> {
        self.mask_stack.last().copied()
    }

    // -- side-effect queue --------------------------------------------------

    /// Number of queued side effects (a resume point for rollback).
    pub fn side_effects_scheduled(&self) -> usize {
        self.side_effects.len()
    }

    /// Drop side effects queued after `checkpoint`, releasing their queue
    /// references.
    pub fn side_effects_rollback(&mut self, checkpoint: usize) -> Result<()> {
        let mut state = state::lock();
        while self.side_effects.len() > checkpoint {
            let index = self.side_effects.pop().expect("side effect present");
            var::dec_ref_ext(&mut state, index)?;
        }
        Ok(())
    }

    // -- parallel primitives ------------------------------------------------

    /// Fill `size` elements of `isize` bytes each with the pattern `src`.
    pub fn memset_async(&mut self, ptr: *mut u8, size: u32, isize: u32, src: &[u8]) -> Result<()> {
        snafu::ensure!(
            matches!(isize, 1 | 2 | 4 | 8) && src.len() >= isize as usize,
            crate::error::InvalidArgumentSnafu {
                reason: format!("memset element size must be 1, 2, 4 or 8 (got {isize})"),
            }
        );
        match &mut self.inner {
            BackendState::Cpu(cpu) => primitives::cpu::memset_async(cpu, ptr, size, isize, src),
            #[cfg(feature = "cuda")]
            BackendState::Cuda(cuda) => {
                primitives::cuda::memset_async(cuda, self.device, ptr, size, isize, src)
            }
        }
    }

    /// Synchronous copy; waits for pending work touching the source first.
    pub fn memcpy(&mut self, dst: *mut u8, src: *const u8, size: usize) -> Result<()> {
        self.sync()?;
        match &mut self.inner {
            BackendState::Cpu(_) => {
                unsafe { std::ptr::copy_nonoverlapping(src, dst, size) };
                Ok(())
            }
            #[cfg(feature = "cuda")]
            BackendState::Cuda(cuda) => primitives::cuda::memcpy(cuda, dst, src, size),
        }
    }

    pub fn memcpy_async(&mut self, dst: *mut u8, src: *const u8, size: usize) -> Result<()> {
        match &mut self.inner {
            BackendState::Cpu(cpu) => primitives::cpu::memcpy_async(cpu, dst, src, size),
            #[cfg(feature = "cuda")]
            BackendState::Cuda(cuda) => primitives::cuda::memcpy_async(cuda, dst, src, size),
        }
    }

    /// Horizontal reduction of `size` elements into `out` (one element).
    pub fn reduce(
        &mut self,
        ty: VarType,
        op: ReduceOp,
        ptr: *const u8,
        size: u32,
        out: *mut u8,
    ) -> Result<()> {
        match &mut self.inner {
            BackendState::Cpu(cpu) => primitives::cpu::reduce(cpu, ty, op, ptr, size, out),
            #[cfg(feature = "cuda")]
            BackendState::Cuda(cuda) => {
                primitives::cuda::reduce(cuda, self.device, ty, op, ptr, size, out)
            }
        }
    }

    /// True when every byte of the boolean array is non-zero. May write up
    /// to three filler bytes past the end of the array.
    pub fn all(&mut self, values: *mut u8, size: u32) -> Result<bool> {
        primitives::bool_reduce(self, values, size, true)
    }

    /// True when any byte of the boolean array is non-zero. May write up to
    /// three filler bytes past the end of the array.
    pub fn any(&mut self, values: *mut u8, size: u32) -> Result<bool> {
        primitives::bool_reduce(self, values, size, false)
    }

    /// Inclusive or exclusive prefix sum over `size` elements.
    pub fn prefix_sum(
        &mut self,
        ty: VarType,
        exclusive: bool,
        input: *const u8,
        size: u32,
        output: *mut u8,
    ) -> Result<()> {
        let ty = if ty == VarType::Int32 { VarType::UInt32 } else { ty };
        if size == 0 {
            return Ok(());
        }
        match &mut self.inner {
            BackendState::Cpu(cpu) => {
                primitives::cpu::prefix_sum(cpu, ty, exclusive, input, size, output)
            }
            #[cfg(feature = "cuda")]
            BackendState::Cuda(cuda) => {
                primitives::cuda::prefix_sum(cuda, self.device, ty, exclusive, input, size, output)
            }
        }
    }

    /// Pack the indices of non-zero bytes of `input` into `output`; returns
    /// how many were written.
    pub fn compress(&mut self, input: *const u8, size: u32, output: *mut u32) -> Result<u32> {
        if size == 0 {
            return Ok(0);
        }
        match &mut self.inner {
            BackendState::Cpu(cpu) => primitives::cpu::compress(cpu, input, size, output),
            #[cfg(feature = "cuda")]
            BackendState::Cuda(cuda) => {
                primitives::cuda::compress(cuda, self.device, input, size, output)
            }
        }
    }

    /// Build a permutation sorting `ptr` into `bucket_count` buckets;
    /// optionally fills `offsets` with `(bucket, start, size, 0)` quadruples
    /// followed by the number of distinct buckets. Returns that number (0
    /// without `offsets`).
    pub fn mkperm(
        &mut self,
        ptr: *const u32,
        size: u32,
        bucket_count: u32,
        perm: *mut u32,
        offsets: Option<*mut u32>,
    ) -> Result<u32> {
        snafu::ensure!(
            bucket_count > 0,
            crate::error::InvalidArgumentSnafu {
                reason: "mkperm bucket count cannot be zero".to_string(),
            }
        );
        if size == 0 {
            return Ok(0);
        }
        match &mut self.inner {
            BackendState::Cpu(cpu) => {
                primitives::cpu::mkperm(cpu, ptr, size, bucket_count, perm, offsets)
            }
            #[cfg(feature = "cuda")]
            BackendState::Cuda(cuda) => {
                primitives::cuda::mkperm(cuda, self.device, ptr, size, bucket_count, perm, offsets)
            }
        }
    }

    /// Replicate each input element into `block_size` consecutive outputs.
    pub fn block_copy(
        &mut self,
        ty: VarType,
        input: *const u8,
        output: *mut u8,
        size: u32,
        block_size: u32,
    ) -> Result<()> {
        snafu::ensure!(
            block_size > 0,
            crate::error::InvalidArgumentSnafu {
                reason: "block size cannot be zero".to_string(),
            }
        );
        if block_size == 1 {
            return self.memcpy_async(output, input, size as usize * ty.size());
        }
        let ty = ty.make_unsigned();
        match &mut self.inner {
            BackendState::Cpu(cpu) => {
                primitives::cpu::block_copy(cpu, ty, input, output, size, block_size)
            }
            #[cfg(feature = "cuda")]
            BackendState::Cuda(cuda) => {
                primitives::cuda::block_copy(cuda, self.device, ty, input, output, size, block_size)
            }
        }
    }

    /// Sum each `block_size`-element block of the input into one output.
    pub fn block_sum(
        &mut self,
        ty: VarType,
        input: *const u8,
        output: *mut u8,
        size: u32,
        block_size: u32,
    ) -> Result<()> {
        snafu::ensure!(
            block_size > 0,
            crate::error::InvalidArgumentSnafu {
                reason: "block size cannot be zero".to_string(),
            }
        );
        if block_size == 1 {
            return self.memcpy_async(output, input, size as usize * ty.size());
        }
        let ty = ty.make_unsigned();
        match &mut self.inner {
            BackendState::Cpu(cpu) => {
                primitives::cpu::block_sum(cpu, ty, input, output, size, block_size)
            }
            #[cfg(feature = "cuda")]
            BackendState::Cuda(cuda) => {
                primitives::cuda::block_sum(cuda, self.device, ty, input, output, size, block_size)
            }
        }
    }

    /// Asynchronously publish a small host value (1, 2, 4 or 8 bytes) to
    /// `dst`.
    pub fn poke(&mut self, dst: *mut u8, src: &[u8]) -> Result<()> {
        snafu::ensure!(
            matches!(src.len(), 1 | 2 | 4 | 8),
            crate::error::InvalidArgumentSnafu {
                reason: format!("poke size must be 1, 2, 4 or 8 (got {})", src.len()),
            }
        );
        match &mut self.inner {
            BackendState::Cpu(cpu) => primitives::cpu::poke(cpu, dst, src),
            #[cfg(feature = "cuda")]
            BackendState::Cuda(cuda) => primitives::cuda::poke(cuda, self.device, dst, src),
        }
    }

    /// Execute a list of scatter entries into `dst`, consuming the list on
    /// completion.
    pub fn aggregate(&mut self, dst: *mut u8, entries: Vec<AggregationEntry>) -> Result<()> {
        match &mut self.inner {
            BackendState::Cpu(cpu) => primitives::cpu::aggregate(cpu, dst, entries),
            #[cfg(feature = "cuda")]
            BackendState::Cuda(cuda) => {
                primitives::cuda::aggregate(cuda, self.device, dst, entries)
            }
        }
    }

    /// Append a host callback to the execution queue. Runs synchronously
    /// when the CPU queue is idle.
    pub fn enqueue_host_func(&mut self, func: Box<dyn FnOnce() + Send>) -> Result<()> {
        match &mut self.inner {
            BackendState::Cpu(cpu) => primitives::cpu::enqueue_host_func(cpu, func),
            #[cfg(feature = "cuda")]
            BackendState::Cuda(cuda) => primitives::cuda::enqueue_host_func(cuda, func),
        }
    }
}
