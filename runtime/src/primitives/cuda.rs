//! CUDA implementations of the parallel primitives.
//!
//! The builtin kernels are NVRTC-compiled once per device from the source in
//! [`cuda_kernels`](super::cuda_kernels); all launches go to the thread
//! state's stream, so operations submitted in program order execute in
//! program order.

use std::os::raw::c_void;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use lanejit_device::alloc::Allocation;
use lanejit_device::cuda::{self, sys};
use lanejit_device::Device;
use lanejit_dtype::{JitBackend, KernelType, ReduceOp, VarType};

use crate::error::{MissingKernelSnafu, Result, UnsupportedTypeSnafu};
use crate::flags::{flag, JitFlag};
use crate::history::{self, KernelHistoryEntry};
use crate::memory;
use crate::primitives::{cuda_kernels as kernels, AggregationEntry};
use crate::thread_state::CudaState;

/// Loaded builtin-kernel module of one device.
struct Builtins {
    module: usize,
}

static BUILTINS: Lazy<Mutex<FxHashMap<i32, Arc<Builtins>>>> =
    Lazy::new(|| Mutex::new(FxHashMap::default()));

fn builtins(device: i32) -> Result<Arc<Builtins>> {
    let mut table = BUILTINS.lock();
    if let Some(entry) = table.get(&device) {
        return Ok(Arc::clone(entry));
    }

    let source = kernels::builtin_source();
    let ptx = cudarc::nvrtc::compile_ptx(source).map_err(|e| {
        crate::error::InternalSnafu { reason: format!("builtin kernel compilation failed: {e}") }
            .build()
    })?;
    let mut image = ptx.to_src().into_bytes();
    image.push(0);

    let _guard = cuda::ScopedContext::new(cuda::context(device)?)?;
    let mut module: sys::CUmodule = std::ptr::null_mut();
    unsafe {
        cuda::cuda_check(
            sys::cuModuleLoadData(&mut module, image.as_ptr() as *const _),
            "cuModuleLoadData",
        )?;
    }

    let entry = Arc::new(Builtins { module: module as usize });
    table.insert(device, Arc::clone(&entry));
    tracing::debug!(device, "loaded builtin kernel module");
    Ok(entry)
}

/// Resolve a builtin kernel by name; missing variants are an error, not a
/// fallback.
fn builtin(device: i32, name: &str) -> Result<sys::CUfunction> {
    let module = builtins(device)?.module as sys::CUmodule;
    let c_name = std::ffi::CString::new(name).expect("kernel name");
    let mut func: sys::CUfunction = std::ptr::null_mut();
    let ret = unsafe { sys::cuModuleGetFunction(&mut func, module, c_name.as_ptr()) };
    if ret != sys::CUresult::CUDA_SUCCESS || func.is_null() {
        return MissingKernelSnafu { what: name.to_string() }.fail();
    }
    Ok(func)
}

fn device_descriptor(device: i32) -> Result<Device> {
    let state = crate::state::lock();
    state.devices.get(device as usize).cloned().ok_or_else(|| {
        crate::error::InternalSnafu { reason: format!("unknown device {device}") }.build()
    })
}

/// Launch a builtin kernel on the thread state's stream, honoring the
/// launch-blocking and kernel-history flags.
pub(crate) fn submit_gpu(
    cuda_state: &CudaState,
    kind: KernelType,
    func: sys::CUfunction,
    block_count: u32,
    thread_count: u32,
    shared_bytes: u32,
    args: &mut [*mut c_void],
    width: u32,
) -> Result<()> {
    let stream = cuda_state.stream as sys::CUstream;

    let mut entry = KernelHistoryEntry::new(JitBackend::Cuda, kind, width);
    let record = flag(JitFlag::KernelHistory);
    if record {
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

    unsafe {
        cuda::cuda_check(
            sys::cuLaunchKernel(
                func,
                block_count,
                1,
                1,
                thread_count,
                1,
                1,
                shared_bytes,
                stream,
                args.as_mut_ptr(),
                std::ptr::null_mut(),
            ),
            "cuLaunchKernel",
        )?;
    }

    if flag(JitFlag::LaunchBlocking) {
        unsafe { cuda::cuda_check(sys::cuStreamSynchronize(stream), "cuStreamSynchronize")? };
    }
    if record {
        unsafe {
            cuda::cuda_check(
                sys::cuEventRecord(entry.event_end as sys::CUevent, stream),
                "cuEventRecord",
            )?;
        }
        history::append(entry);
    }
    Ok(())
}

pub(crate) fn sync_stream(cuda_state: &CudaState) -> Result<()> {
    let _guard = cuda::ScopedContext::new(cuda_state.context as sys::CUcontext)?;
    unsafe {
        cuda::cuda_check(
            sys::cuStreamSynchronize(cuda_state.stream as sys::CUstream),
            "cuStreamSynchronize",
        )
    }?;
    Ok(())
}

// Host-function trampoline releasing a batch of deferred allocations once
// the stream reaches it.
unsafe extern "C" fn release_trampoline(payload: *mut c_void) {
    let batch = unsafe { Box::from_raw(payload as *mut Vec<Allocation>) };
    memory::release_all(*batch);
}

pub(crate) fn free_flush(cuda_state: &CudaState, pending: Vec<Allocation>) -> Result<()> {
    let _guard = cuda::ScopedContext::new(cuda_state.context as sys::CUcontext)?;
    let payload = Box::into_raw(Box::new(pending)) as *mut c_void;
    unsafe {
        cuda::cuda_check(
            sys::cuLaunchHostFunc(
                cuda_state.stream as sys::CUstream,
                Some(release_trampoline),
                payload,
            ),
            "cuLaunchHostFunc",
        )
    }?;
    Ok(())
}

// Host-function trampoline for arbitrary enqueued callbacks.
unsafe extern "C" fn callback_trampoline(payload: *mut c_void) {
    let callback = unsafe { Box::from_raw(payload as *mut Box<dyn FnOnce() + Send>) };
    callback();
}

pub(crate) fn enqueue_host_func(
    cuda_state: &CudaState,
    func: Box<dyn FnOnce() + Send>,
) -> Result<()> {
    let _guard = cuda::ScopedContext::new(cuda_state.context as sys::CUcontext)?;
    let payload = Box::into_raw(Box::new(func)) as *mut c_void;
    unsafe {
        cuda::cuda_check(
            sys::cuLaunchHostFunc(
                cuda_state.stream as sys::CUstream,
                Some(callback_trampoline),
                payload,
            ),
            "cuLaunchHostFunc",
        )
    }?;
    Ok(())
}

// ---------------------------------------------------------------------------
// memset / memcpy
// ---------------------------------------------------------------------------

pub fn memset_async(
    cuda_state: &CudaState,
    device: i32,
    ptr: *mut u8,
    size: u32,
    isize: u32,
    src: &[u8],
) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    let _guard = cuda::ScopedContext::new(cuda_state.context as sys::CUcontext)?;
    let stream = cuda_state.stream as sys::CUstream;

    let mut pattern = [0u8; 8];
    pattern[..isize as usize].copy_from_slice(&src[..isize as usize]);
    let (size, isize) = if pattern[..isize as usize].iter().all(|&b| b == 0) {
        (size * isize, 1)
    } else {
        (size, isize)
    };

    let dst = ptr as sys::CUdeviceptr;
    unsafe {
        match isize {
            1 => cuda::cuda_check(
                sys::cuMemsetD8Async(dst, pattern[0], size as usize, stream),
                "cuMemsetD8Async",
            )?,
            2 => cuda::cuda_check(
                sys::cuMemsetD16Async(
                    dst,
                    u16::from_ne_bytes(pattern[..2].try_into().unwrap()),
                    size as usize,
                    stream,
                ),
                "cuMemsetD16Async",
            )?,
            4 => cuda::cuda_check(
                sys::cuMemsetD32Async(
                    dst,
                    u32::from_ne_bytes(pattern[..4].try_into().unwrap()),
                    size as usize,
                    stream,
                ),
                "cuMemsetD32Async",
            )?,
            _ => {
                let descriptor = device_descriptor(device)?;
                let (blocks, threads) = descriptor.launch_config(size, 1024, 4);
                let func = builtin(device, "fill_64")?;
                let mut ptr_arg = dst;
                let mut size_arg = size;
                let mut value_arg = u64::from_ne_bytes(pattern);
                let mut args = [
                    (&mut ptr_arg) as *mut _ as *mut c_void,
                    (&mut size_arg) as *mut _ as *mut c_void,
                    (&mut value_arg) as *mut _ as *mut c_void,
                ];
                submit_gpu(
                    cuda_state,
                    KernelType::Other,
                    func,
                    blocks,
                    threads,
                    0,
                    &mut args,
                    size,
                )?;
            }
        }
    }
    Ok(())
}

pub fn memcpy(cuda_state: &CudaState, dst: *mut u8, src: *const u8, size: usize) -> Result<()> {
    let _guard = cuda::ScopedContext::new(cuda_state.context as sys::CUcontext)?;
    unsafe {
        cuda::cuda_check(
            sys::cuMemcpy(dst as sys::CUdeviceptr, src as sys::CUdeviceptr, size),
            "cuMemcpy",
        )
    }?;
    Ok(())
}

pub fn memcpy_async(
    cuda_state: &CudaState,
    dst: *mut u8,
    src: *const u8,
    size: usize,
) -> Result<()> {
    let _guard = cuda::ScopedContext::new(cuda_state.context as sys::CUcontext)?;
    unsafe {
        cuda::cuda_check(
            sys::cuMemcpyAsync(
                dst as sys::CUdeviceptr,
                src as sys::CUdeviceptr,
                size,
                cuda_state.stream as sys::CUstream,
            ),
            "cuMemcpyAsync",
        )
    }?;
    Ok(())
}

// ---------------------------------------------------------------------------
// reduce
// ---------------------------------------------------------------------------

pub fn reduce(
    cuda_state: &CudaState,
    device: i32,
    ty: VarType,
    op: ReduceOp,
    ptr: *const u8,
    size: u32,
    out: *mut u8,
) -> Result<()> {
    let _guard = cuda::ScopedContext::new(cuda_state.context as sys::CUcontext)?;
    let func = builtin(device, &kernels::reduce_kernel_name(op, ty))?;
    let descriptor = device_descriptor(device)?;

    let tsize = ty.size() as u32;
    let thread_count = 1024u32;
    let shared = thread_count * tsize;
    let (block_count, _) = descriptor.launch_config(size, thread_count, 4);

    tracing::debug!(type_name = ty.name(), op = op.name(), size, "reduce");

    if size <= 1024 {
        let mut in_arg = ptr as sys::CUdeviceptr;
        let mut n_arg = size;
        let mut out_arg = out as sys::CUdeviceptr;
        let mut args = [
            (&mut in_arg) as *mut _ as *mut c_void,
            (&mut n_arg) as *mut _ as *mut c_void,
            (&mut out_arg) as *mut _ as *mut c_void,
        ];
        submit_gpu(cuda_state, KernelType::Reduce, func, 1, thread_count, shared, &mut args, size)?;
    } else {
        let temp = cuda::malloc_device(device, (block_count * tsize) as usize)?;

        let mut in_arg = ptr as sys::CUdeviceptr;
        let mut n_arg = size;
        let mut temp_arg = temp as sys::CUdeviceptr;
        let mut args = [
            (&mut in_arg) as *mut _ as *mut c_void,
            (&mut n_arg) as *mut _ as *mut c_void,
            (&mut temp_arg) as *mut _ as *mut c_void,
        ];
        submit_gpu(
            cuda_state,
            KernelType::Reduce,
            func,
            block_count,
            thread_count,
            shared,
            &mut args,
            size,
        )?;

        let mut temp_in = temp as sys::CUdeviceptr;
        let mut count = block_count;
        let mut out_arg = out as sys::CUdeviceptr;
        let mut args = [
            (&mut temp_in) as *mut _ as *mut c_void,
            (&mut count) as *mut _ as *mut c_void,
            (&mut out_arg) as *mut _ as *mut c_void,
        ];
        submit_gpu(cuda_state, KernelType::Reduce, func, 1, thread_count, shared, &mut args, size)?;

        memory::free_async(temp)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// prefix sum
// ---------------------------------------------------------------------------

/// Scratch pairs used by the large scan: `(flag, value)` per block plus 32
/// padding pairs ahead of block zero.
const SCAN_PADDING_PAIRS: u32 = 32;

pub fn prefix_sum(
    cuda_state: &CudaState,
    device: i32,
    ty: VarType,
    exclusive: bool,
    input: *const u8,
    size: u32,
    output: *mut u8,
) -> Result<()> {
    if !kernels::SCAN_TYPES.contains(&ty) {
        return UnsupportedTypeSnafu { type_name: ty.name(), primitive: "prefix_sum" }.fail();
    }
    let _guard = cuda::ScopedContext::new(cuda_state.context as sys::CUcontext)?;
    let stream = cuda_state.stream as sys::CUstream;
    let isize = ty.size() as u32;

    if size == 1 {
        unsafe {
            if exclusive {
                cuda::cuda_check(
                    sys::cuMemsetD8Async(output as sys::CUdeviceptr, 0, isize as usize, stream),
                    "cuMemsetD8Async",
                )?;
            } else if input as usize != output as usize {
                cuda::cuda_check(
                    sys::cuMemcpyAsync(
                        output as sys::CUdeviceptr,
                        input as sys::CUdeviceptr,
                        isize as usize,
                        stream,
                    ),
                    "cuMemcpyAsync",
                )?;
            }
        }
        return Ok(());
    }

    let small = (isize == 4 && size <= 4096) || (isize == 8 && size < 2048);
    if small {
        let items_per_thread = if isize == 8 { 2 } else { 4 };
        let thread_count = size.div_ceil(items_per_thread).next_power_of_two();
        let shared = thread_count * 2 * isize;

        tracing::debug!(
            type_name = ty.name(),
            exclusive,
            size,
            threads = thread_count,
            shared,
            "prefix_sum (small)"
        );

        let func = builtin(device, &kernels::scan_kernel_name(exclusive, false, ty))?;
        let mut in_arg = input as sys::CUdeviceptr;
        let mut out_arg = output as sys::CUdeviceptr;
        let mut size_arg = size;
        let mut args = [
            (&mut in_arg) as *mut _ as *mut c_void,
            (&mut out_arg) as *mut _ as *mut c_void,
            (&mut size_arg) as *mut _ as *mut c_void,
        ];
        submit_gpu(cuda_state, KernelType::Other, func, 1, thread_count, shared, &mut args, size)?;
    } else {
        let items_per_thread = if isize == 8 { 8 } else { 16 };
        let thread_count = 128u32;
        let items_per_block = items_per_thread * thread_count;
        let block_count = size.div_ceil(items_per_block);
        let shared = thread_count * 2 * isize;
        let scratch_pairs = block_count + SCAN_PADDING_PAIRS;

        tracing::debug!(
            type_name = ty.name(),
            exclusive,
            size,
            blocks = block_count,
            "prefix_sum (large)"
        );

        let descriptor = device_descriptor(device)?;
        let scratch = cuda::malloc_device(device, scratch_pairs as usize * 16)?;

        // Zero the scratch and mark the padding pairs as resolved prefixes.
        let (init_blocks, init_threads) = descriptor.launch_config(scratch_pairs, 1024, 4);
        let init = builtin(device, "scan_large_init")?;
        let mut scratch_arg = scratch as sys::CUdeviceptr;
        let mut pairs_arg = scratch_pairs;
        let mut args = [
            (&mut scratch_arg) as *mut _ as *mut c_void,
            (&mut pairs_arg) as *mut _ as *mut c_void,
        ];
        submit_gpu(
            cuda_state,
            KernelType::Other,
            init,
            init_blocks,
            init_threads,
            0,
            &mut args,
            scratch_pairs,
        )?;

        let func = builtin(device, &kernels::scan_kernel_name(exclusive, true, ty))?;
        let mut in_arg = input as sys::CUdeviceptr;
        let mut out_arg = output as sys::CUdeviceptr;
        let mut size_arg = size;
        // Skip the padding pairs.
        let mut shifted = (scratch as usize + SCAN_PADDING_PAIRS as usize * 16) as sys::CUdeviceptr;
        let mut args = [
            (&mut in_arg) as *mut _ as *mut c_void,
            (&mut out_arg) as *mut _ as *mut c_void,
            (&mut size_arg) as *mut _ as *mut c_void,
            (&mut shifted) as *mut _ as *mut c_void,
        ];
        submit_gpu(
            cuda_state,
            KernelType::Other,
            func,
            block_count,
            thread_count,
            shared,
            &mut args,
            size,
        )?;

        memory::free_async(scratch)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// compress
// ---------------------------------------------------------------------------

pub fn compress(
    cuda_state: &CudaState,
    device: i32,
    input: *const u8,
    size: u32,
    output: *mut u32,
) -> Result<u32> {
    let _guard = cuda::ScopedContext::new(cuda_state.context as sys::CUcontext)?;
    let stream = cuda_state.stream as sys::CUstream;
    let count_out = cuda::malloc_pinned(device, 4)?;

    if size <= 4096 {
        let items_per_thread = 4u32;
        let thread_count = size.div_ceil(items_per_thread).next_power_of_two();
        let shared = thread_count * 2 * 4;
        let trailer = thread_count * items_per_thread - size;

        tracing::debug!(size, threads = thread_count, "compress (small)");

        if trailer > 0 {
            unsafe {
                cuda::cuda_check(
                    sys::cuMemsetD8Async(
                        (input as usize + size as usize) as sys::CUdeviceptr,
                        0,
                        trailer as usize,
                        stream,
                    ),
                    "cuMemsetD8Async",
                )?;
            }
        }

        let func = builtin(device, "compress_small")?;
        let mut in_arg = input as sys::CUdeviceptr;
        let mut out_arg = output as sys::CUdeviceptr;
        let mut size_arg = size;
        let mut count_arg = count_out as sys::CUdeviceptr;
        let mut args = [
            (&mut in_arg) as *mut _ as *mut c_void,
            (&mut out_arg) as *mut _ as *mut c_void,
            (&mut size_arg) as *mut _ as *mut c_void,
            (&mut count_arg) as *mut _ as *mut c_void,
        ];
        submit_gpu(cuda_state, KernelType::Other, func, 1, thread_count, shared, &mut args, size)?;
    } else {
        let items_per_thread = 16u32;
        let thread_count = 128u32;
        let items_per_block = items_per_thread * thread_count;
        let block_count = size.div_ceil(items_per_block);
        let shared = thread_count * 2 * 4;
        let scratch_pairs = block_count + SCAN_PADDING_PAIRS;
        let trailer = items_per_block * block_count - size;

        tracing::debug!(size, blocks = block_count, "compress (large)");

        let descriptor = device_descriptor(device)?;
        let scratch = cuda::malloc_device(device, scratch_pairs as usize * 16)?;

        let (init_blocks, init_threads) = descriptor.launch_config(scratch_pairs, 1024, 4);
        let init = builtin(device, "scan_large_init")?;
        let mut scratch_arg = scratch as sys::CUdeviceptr;
        let mut pairs_arg = scratch_pairs;
        let mut args = [
            (&mut scratch_arg) as *mut _ as *mut c_void,
            (&mut pairs_arg) as *mut _ as *mut c_void,
        ];
        submit_gpu(
            cuda_state,
            KernelType::Other,
            init,
            init_blocks,
            init_threads,
            0,
            &mut args,
            scratch_pairs,
        )?;

        if trailer > 0 {
            unsafe {
                cuda::cuda_check(
                    sys::cuMemsetD8Async(
                        (input as usize + size as usize) as sys::CUdeviceptr,
                        0,
                        trailer as usize,
                        stream,
                    ),
                    "cuMemsetD8Async",
                )?;
            }
        }

        let func = builtin(device, "compress_large")?;
        let mut in_arg = input as sys::CUdeviceptr;
        let mut out_arg = output as sys::CUdeviceptr;
        let mut shifted = (scratch as usize + SCAN_PADDING_PAIRS as usize * 16) as sys::CUdeviceptr;
        let mut count_arg = count_out as sys::CUdeviceptr;
        let mut args = [
            (&mut in_arg) as *mut _ as *mut c_void,
            (&mut out_arg) as *mut _ as *mut c_void,
            (&mut shifted) as *mut _ as *mut c_void,
            (&mut count_arg) as *mut _ as *mut c_void,
        ];
        submit_gpu(
            cuda_state,
            KernelType::Other,
            func,
            block_count,
            thread_count,
            shared,
            &mut args,
            size,
        )?;

        memory::free_async(scratch)?;
    }

    unsafe { cuda::cuda_check(sys::cuStreamSynchronize(stream), "cuStreamSynchronize")? };
    let count = unsafe { *(count_out as *const u32) };
    memory::free_async(count_out)?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// mkperm
// ---------------------------------------------------------------------------

fn transpose(
    cuda_state: &CudaState,
    device: i32,
    input: *const u32,
    output: *mut u32,
    rows: u32,
    cols: u32,
) -> Result<()> {
    let func = builtin(device, "transpose_u32")?;
    let blocks_x = cols.div_ceil(16);
    let blocks_y = rows.div_ceil(16);

    let mut in_arg = input as sys::CUdeviceptr;
    let mut out_arg = output as sys::CUdeviceptr;
    let mut rows_arg = rows;
    let mut cols_arg = cols;
    let mut args = [
        (&mut in_arg) as *mut _ as *mut c_void,
        (&mut out_arg) as *mut _ as *mut c_void,
        (&mut rows_arg) as *mut _ as *mut c_void,
        (&mut cols_arg) as *mut _ as *mut c_void,
    ];

    // Two-dimensional launch; the history/blocking handling of submit_gpu is
    // inlined here because of the y dimension.
    unsafe {
        cuda::cuda_check(
            sys::cuLaunchKernel(
                func,
                blocks_x,
                blocks_y,
                1,
                16,
                16,
                1,
                16 * 17 * 4,
                cuda_state.stream as sys::CUstream,
                args.as_mut_ptr(),
                std::ptr::null_mut(),
            ),
            "cuLaunchKernel",
        )?;
    }
    Ok(())
}

pub fn mkperm(
    cuda_state: &CudaState,
    device: i32,
    ptr: *const u32,
    size: u32,
    bucket_count: u32,
    perm: *mut u32,
    offsets: Option<*mut u32>,
) -> Result<u32> {
    let _guard = cuda::ScopedContext::new(cuda_state.context as sys::CUcontext)?;
    let stream = cuda_state.stream as sys::CUstream;
    let descriptor = device_descriptor(device)?;

    // One block per SM at most: the shared-memory variants want it all.
    let warp_size = 32u32;
    let (block_count, mut thread_count) = descriptor.launch_config(size, 1024, 1);
    let warp_count = thread_count.div_ceil(warp_size);
    thread_count = warp_count * warp_size;

    let bucket_size_1 = bucket_count * 4;
    let mut bucket_size_all = bucket_size_1 * block_count;

    let (phase_1, phase_4, shared_size, variant, initialize_buckets) =
        if bucket_size_1 * warp_count <= descriptor.shared_memory_bytes {
            // Per-warp shared counters: stable within warps.
            bucket_size_all *= warp_count;
            (
                builtin(device, "mkperm_phase_1_tiny")?,
                builtin(device, "mkperm_phase_4_tiny")?,
                bucket_size_1 * warp_count,
                "tiny",
                false,
            )
        } else if bucket_size_1 <= descriptor.shared_memory_bytes {
            // One shared counter table per block: semi-stable.
            (
                builtin(device, "mkperm_phase_1_small")?,
                builtin(device, "mkperm_phase_4_small")?,
                bucket_size_1,
                "small",
                false,
            )
        } else {
            // Global-memory atomics; the table needs explicit zeroing.
            (
                builtin(device, "mkperm_phase_1_large")?,
                builtin(device, "mkperm_phase_4_large")?,
                0,
                "large",
                true,
            )
        };

    let needs_transpose = bucket_size_1 != bucket_size_all;
    let buckets_1 = cuda::malloc_device(device, bucket_size_all as usize)? as *mut u32;
    let buckets_2 = if needs_transpose {
        cuda::malloc_device(device, bucket_size_all as usize)? as *mut u32
    } else {
        buckets_1
    };

    let mut counter: *mut u8 = std::ptr::null_mut();
    if offsets.is_some() {
        counter = cuda::malloc_device(device, 4)?;
        unsafe {
            cuda::cuda_check(
                sys::cuMemsetD8Async(counter as sys::CUdeviceptr, 0, 4, stream),
                "cuMemsetD8Async",
            )?;
        }
    }

    if initialize_buckets || matches!(variant, "small") {
        unsafe {
            cuda::cuda_check(
                sys::cuMemsetD8Async(
                    buckets_1 as sys::CUdeviceptr,
                    0,
                    bucket_size_all as usize,
                    stream,
                ),
                "cuMemsetD8Async",
            )?;
        }
    }

    // Work per block, padded to full warps.
    let size_per_block = size.div_ceil(block_count).div_ceil(warp_size) * warp_size;

    tracing::debug!(
        size,
        bucket_count,
        block_count,
        thread_count,
        size_per_block,
        variant,
        shared_size,
        "mkperm"
    );

    // Phase 1: per-chunk occurrence counts.
    {
        let mut ptr_arg = ptr as sys::CUdeviceptr;
        let mut buckets_arg = buckets_1 as sys::CUdeviceptr;
        let mut size_arg = size;
        let mut spb_arg = size_per_block;
        let mut bc_arg = bucket_count;
        let mut args = [
            (&mut ptr_arg) as *mut _ as *mut c_void,
            (&mut buckets_arg) as *mut _ as *mut c_void,
            (&mut size_arg) as *mut _ as *mut c_void,
            (&mut spb_arg) as *mut _ as *mut c_void,
            (&mut bc_arg) as *mut _ as *mut c_void,
        ];
        submit_gpu(
            cuda_state,
            KernelType::CallReduce,
            phase_1,
            block_count,
            thread_count,
            shared_size,
            &mut args,
            size,
        )?;
    }

    // Phase 2: exclusive scan over the (transposed) counter table.
    if needs_transpose {
        transpose(cuda_state, device, buckets_1, buckets_2, bucket_size_all / bucket_size_1, bucket_count)?;
    }
    prefix_sum(
        cuda_state,
        device,
        VarType::UInt32,
        true,
        buckets_2 as *const u8,
        bucket_size_all / 4,
        buckets_2 as *mut u8,
    )?;
    if needs_transpose {
        transpose(cuda_state, device, buckets_2, buckets_1, bucket_count, bucket_size_all / bucket_size_1)?;
    }

    // Phase 3: compact the non-empty buckets.
    if let Some(offsets) = offsets {
        let (blocks_3, threads_3) = descriptor.launch_config(bucket_count, 1024, 4);
        let rounded = bucket_count.div_ceil(threads_3) * threads_3;
        let func = builtin(device, "mkperm_phase_3")?;

        let mut buckets_arg = buckets_1 as sys::CUdeviceptr;
        let mut bc_arg = bucket_count;
        let mut rounded_arg = rounded;
        let mut size_arg = size;
        let mut counter_arg = counter as sys::CUdeviceptr;
        let mut offsets_arg = offsets as sys::CUdeviceptr;
        let mut args = [
            (&mut buckets_arg) as *mut _ as *mut c_void,
            (&mut bc_arg) as *mut _ as *mut c_void,
            (&mut rounded_arg) as *mut _ as *mut c_void,
            (&mut size_arg) as *mut _ as *mut c_void,
            (&mut counter_arg) as *mut _ as *mut c_void,
            (&mut offsets_arg) as *mut _ as *mut c_void,
        ];
        submit_gpu(
            cuda_state,
            KernelType::CallReduce,
            func,
            blocks_3,
            threads_3,
            0,
            &mut args,
            size,
        )?;

        unsafe {
            cuda::cuda_check(
                sys::cuMemcpyAsync(
                    (offsets as usize + bucket_count as usize * 16) as sys::CUdeviceptr,
                    counter as sys::CUdeviceptr,
                    4,
                    stream,
                ),
                "cuMemcpyAsync",
            )?;
            cuda::cuda_check(
                sys::cuEventRecord(cuda_state.event as sys::CUevent, stream),
                "cuEventRecord",
            )?;
        }
    }

    // Phase 4: scatter the permutation through the scanned counters.
    {
        let mut ptr_arg = ptr as sys::CUdeviceptr;
        let mut buckets_arg = buckets_1 as sys::CUdeviceptr;
        let mut perm_arg = perm as sys::CUdeviceptr;
        let mut size_arg = size;
        let mut spb_arg = size_per_block;
        let mut bc_arg = bucket_count;
        let mut args = [
            (&mut ptr_arg) as *mut _ as *mut c_void,
            (&mut buckets_arg) as *mut _ as *mut c_void,
            (&mut perm_arg) as *mut _ as *mut c_void,
            (&mut size_arg) as *mut _ as *mut c_void,
            (&mut spb_arg) as *mut _ as *mut c_void,
            (&mut bc_arg) as *mut _ as *mut c_void,
        ];
        submit_gpu(
            cuda_state,
            KernelType::CallReduce,
            phase_4,
            block_count,
            thread_count,
            shared_size,
            &mut args,
            size,
        )?;
    }

    let unique = if let Some(offsets) = offsets {
        unsafe {
            cuda::cuda_check(
                sys::cuEventSynchronize(cuda_state.event as sys::CUevent),
                "cuEventSynchronize",
            )?;
            *offsets.add(bucket_count as usize * 4)
        }
    } else {
        0
    };

    memory::free_async(buckets_1 as *mut u8)?;
    if needs_transpose {
        memory::free_async(buckets_2 as *mut u8)?;
    }
    if !counter.is_null() {
        memory::free_async(counter)?;
    }
    Ok(unique)
}

// ---------------------------------------------------------------------------
// block copy / block sum
// ---------------------------------------------------------------------------

pub fn block_copy(
    cuda_state: &CudaState,
    device: i32,
    ty: VarType,
    input: *const u8,
    output: *mut u8,
    size: u32,
    block: u32,
) -> Result<()> {
    let _guard = cuda::ScopedContext::new(cuda_state.context as sys::CUcontext)?;
    let func = builtin(device, &kernels::block_kernel_name(false, ty))?;
    let total = size * block;
    let thread_count = total.min(1024);
    let block_count = total.div_ceil(thread_count);

    let mut in_arg = input as sys::CUdeviceptr;
    let mut out_arg = output as sys::CUdeviceptr;
    let mut total_arg = total;
    let mut block_arg = block;
    let mut args = [
        (&mut in_arg) as *mut _ as *mut c_void,
        (&mut out_arg) as *mut _ as *mut c_void,
        (&mut total_arg) as *mut _ as *mut c_void,
        (&mut block_arg) as *mut _ as *mut c_void,
    ];
    submit_gpu(cuda_state, KernelType::Other, func, block_count, thread_count, 0, &mut args, total)
}

pub fn block_sum(
    cuda_state: &CudaState,
    device: i32,
    ty: VarType,
    input: *const u8,
    output: *mut u8,
    size: u32,
    block: u32,
) -> Result<()> {
    let _guard = cuda::ScopedContext::new(cuda_state.context as sys::CUcontext)?;
    let func = builtin(device, &kernels::block_kernel_name(true, ty))?;

    let out_bytes = size as usize * ty.size();
    let total = size * block;
    let thread_count = total.min(1024);
    let block_count = total.div_ceil(thread_count);

    unsafe {
        cuda::cuda_check(
            sys::cuMemsetD8Async(
                output as sys::CUdeviceptr,
                0,
                out_bytes,
                cuda_state.stream as sys::CUstream,
            ),
            "cuMemsetD8Async",
        )?;
    }

    let mut in_arg = input as sys::CUdeviceptr;
    let mut out_arg = output as sys::CUdeviceptr;
    let mut total_arg = total;
    let mut block_arg = block;
    let mut args = [
        (&mut in_arg) as *mut _ as *mut c_void,
        (&mut out_arg) as *mut _ as *mut c_void,
        (&mut total_arg) as *mut _ as *mut c_void,
        (&mut block_arg) as *mut _ as *mut c_void,
    ];
    submit_gpu(cuda_state, KernelType::Other, func, block_count, thread_count, 0, &mut args, total)
}

// ---------------------------------------------------------------------------
// poke / aggregate
// ---------------------------------------------------------------------------

pub fn poke(cuda_state: &CudaState, device: i32, dst: *mut u8, src: &[u8]) -> Result<()> {
    let _guard = cuda::ScopedContext::new(cuda_state.context as sys::CUcontext)?;
    let name = match src.len() {
        1 => "poke_u8",
        2 => "poke_u16",
        4 => "poke_u32",
        _ => "poke_u64",
    };
    let func = builtin(device, name)?;

    let mut value = [0u8; 8];
    value[..src.len()].copy_from_slice(src);

    let mut dst_arg = dst as sys::CUdeviceptr;
    let mut value_arg = u64::from_ne_bytes(value);
    let mut args =
        [(&mut dst_arg) as *mut _ as *mut c_void, (&mut value_arg) as *mut _ as *mut c_void];
    submit_gpu(cuda_state, KernelType::Other, func, 1, 1, 0, &mut args, 1)
}

pub fn aggregate(
    cuda_state: &CudaState,
    device: i32,
    dst: *mut u8,
    entries: Vec<AggregationEntry>,
) -> Result<()> {
    let _guard = cuda::ScopedContext::new(cuda_state.context as sys::CUcontext)?;
    let descriptor = device_descriptor(device)?;
    let size = entries.len() as u32;
    let bytes = std::mem::size_of_val(entries.as_slice());

    // Stage the entry list on the device; both copies die after the launch.
    let pinned = cuda::malloc_pinned(device, bytes)?;
    let staged = cuda::malloc_device(device, bytes)?;
    unsafe {
        std::ptr::copy_nonoverlapping(entries.as_ptr() as *const u8, pinned, bytes);
        cuda::cuda_check(
            sys::cuMemcpyAsync(
                staged as sys::CUdeviceptr,
                pinned as sys::CUdeviceptr,
                bytes,
                cuda_state.stream as sys::CUstream,
            ),
            "cuMemcpyAsync",
        )?;
    }

    let func = builtin(device, "aggregate")?;
    let (block_count, thread_count) = descriptor.launch_config(size, 1024, 4);

    let mut dst_arg = dst as sys::CUdeviceptr;
    let mut entries_arg = staged as sys::CUdeviceptr;
    let mut size_arg = size;
    let mut args = [
        (&mut dst_arg) as *mut _ as *mut c_void,
        (&mut entries_arg) as *mut _ as *mut c_void,
        (&mut size_arg) as *mut _ as *mut c_void,
    ];
    submit_gpu(cuda_state, KernelType::Other, func, block_count, thread_count, 0, &mut args, size)?;

    memory::free_async(pinned)?;
    memory::free_async(staged)?;
    Ok(())
}
