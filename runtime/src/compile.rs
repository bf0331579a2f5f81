//! Compile pipeline: cache lookup, backend compilation, module loading.
//!
//! Lookup order per kernel: (1) in-memory map, (2) on-disk artifact keyed by
//! the IR's content hash, (3) fresh compile. Compilation and module loading
//! drop the primary lock while they run so that unrelated threads can make
//! progress; the eval lock still prevents a second scheduler/assembler phase
//! from starting.

use std::sync::Arc;

use parking_lot::MutexGuard;

use lanejit_codegen::kir;
use lanejit_dtype::JitBackend;

use crate::cache::{self, Kernel, KernelKey};
use crate::error::{InternalSnafu, Result};
use crate::state::State;

/// Backend-specific handles of a compiled kernel.
#[derive(Debug)]
pub enum KernelData {
    Cpu(lanejit_codegen::CpuKernel),
    #[cfg(feature = "cuda")]
    Cuda(CudaKernel),
}

/// A loaded CUDA module with its entry point and preferred block size.
#[cfg(feature = "cuda")]
#[derive(Debug)]
pub struct CudaKernel {
    pub module: usize,
    pub func: usize,
    pub block_size: u32,
}

#[cfg(feature = "cuda")]
unsafe impl Send for CudaKernel {}
#[cfg(feature = "cuda")]
unsafe impl Sync for CudaKernel {}

/// Resolve the kernel for the IR buffer currently held in the eval scratch.
///
/// `guard` is the held primary lock; it is released around compilation.
/// Updates the hit/miss counters; the caller bumps `kernel_launches`.
pub fn lookup_or_compile(
    guard: &mut MutexGuard<'static, State>,
    text: &str,
    content_hash: u128,
    name: &str,
    backend: JitBackend,
    device: i32,
    extra_flags: u64,
) -> Result<Arc<Kernel>> {
    let probe = KernelKey::new(text.to_string(), device, extra_flags, content_hash);
    if let Some(kernel) = guard.kernel_cache.get(&probe) {
        let kernel = Arc::clone(kernel);
        guard.kernel_hits += 1;
        return Ok(kernel);
    }

    // Disk tier, then fresh build; both run without the primary lock.
    let name = name.to_string();
    let text_owned = probe.text.clone();
    let (kernel, disk_hit) = MutexGuard::unlocked(guard, move || -> Result<(Kernel, bool)> {
        if let Some(artifact) = cache::disk_load(backend, content_hash) {
            match load_artifact(backend, device, &artifact, &name) {
                Ok(kernel) => return Ok((kernel, true)),
                Err(err) => {
                    tracing::debug!(%err, "cached kernel artifact failed to load; rebuilding");
                }
            }
        }

        let (kernel, artifact) = build(backend, device, &text_owned, &name)?;
        cache::disk_write(backend, content_hash, &artifact);
        Ok((kernel, false))
    })?;

    if disk_hit {
        guard.kernel_soft_misses += 1;
    } else {
        guard.kernel_hard_misses += 1;
    }

    let kernel = Arc::new(kernel);
    guard.kernel_cache.insert(probe, Arc::clone(&kernel));
    Ok(kernel)
}

/// Compile IR text from scratch. Returns the kernel and the artifact to
/// persist (canonical IR for the CPU backend, PTX for CUDA).
fn build(backend: JitBackend, device: i32, text: &str, name: &str) -> Result<(Kernel, Vec<u8>)> {
    match backend {
        JitBackend::Cpu => {
            let program = kir::parse(text)?;
            let compiled = lanejit_codegen::cpu::compile(&program)?;
            let artifact = text.as_bytes().to_vec();
            let artifact_size = artifact.len() as u32;
            Ok((Kernel { data: KernelData::Cpu(compiled), artifact_size }, artifact))
        }
        JitBackend::Cuda => build_cuda(device, text, name),
    }
}

/// Reconstruct a kernel from an on-disk artifact.
///
/// The CPU artifact is canonical IR (native code is position-dependent, so
/// a disk hit re-runs local codegen); the CUDA artifact is PTX that skips
/// the source-level compile.
fn load_artifact(
    backend: JitBackend,
    device: i32,
    artifact: &[u8],
    name: &str,
) -> Result<Kernel> {
    match backend {
        JitBackend::Cpu => {
            let text = std::str::from_utf8(artifact).map_err(|_| {
                InternalSnafu { reason: "kernel artifact is not valid IR".to_string() }.build()
            })?;
            let program = kir::parse(text)?;
            let compiled = lanejit_codegen::cpu::compile(&program)?;
            Ok(Kernel { data: KernelData::Cpu(compiled), artifact_size: artifact.len() as u32 })
        }
        JitBackend::Cuda => load_cuda_module(device, artifact, name),
    }
}

#[cfg(feature = "cuda")]
fn build_cuda(device: i32, text: &str, name: &str) -> Result<(Kernel, Vec<u8>)> {
    let program = kir::parse(text)?;
    let source = lanejit_codegen::cuda::render(&program)?;
    let ptx = cudarc::nvrtc::compile_ptx(source).map_err(|e| {
        InternalSnafu { reason: format!("nvrtc compilation failed: {e}") }.build()
    })?;
    let ptx_bytes = ptx.to_src().into_bytes();
    let kernel = load_cuda_module(device, &ptx_bytes, name)?;
    Ok((kernel, ptx_bytes))
}

#[cfg(not(feature = "cuda"))]
fn build_cuda(_device: i32, _text: &str, _name: &str) -> Result<(Kernel, Vec<u8>)> {
    Err(lanejit_device::Error::BackendUnavailable { backend: "cuda" }.into())
}

/// Load a PTX artifact as a module, resolve the entry point and configure
/// the function: occupancy-preferred block size, zero dynamic shared memory
/// and an L1-preferring carveout.
///
/// An out-of-memory result from the module load is recovered exactly once by
/// draining the deferred allocation list and retrying.
#[cfg(feature = "cuda")]
fn load_cuda_module(device: i32, ptx: &[u8], name: &str) -> Result<Kernel> {
    use lanejit_device::cuda::{self, sys};

    let ctx = cuda::context(device)?;
    let _guard = cuda::ScopedContext::new(ctx)?;

    // cuModuleLoadData wants a NUL-terminated image.
    let mut image = ptx.to_vec();
    image.push(0);

    let mut module: sys::CUmodule = std::ptr::null_mut();
    unsafe {
        let ret = sys::cuModuleLoadData(&mut module, image.as_ptr() as *const _);
        if ret == sys::CUresult::CUDA_ERROR_OUT_OF_MEMORY {
            // Trim: wait for in-flight work, then release deferred buffers.
            cuda::cuda_check(sys::cuCtxSynchronize(), "cuCtxSynchronize")?;
            crate::memory::release_all(crate::memory::take_pending());
            cuda::cuda_check(
                sys::cuModuleLoadData(&mut module, image.as_ptr() as *const _),
                "cuModuleLoadData",
            )?;
        } else {
            cuda::cuda_check(ret, "cuModuleLoadData")?;
        }
    }

    let c_name = std::ffi::CString::new(name).map_err(|_| {
        InternalSnafu { reason: "kernel name contains a NUL byte".to_string() }.build()
    })?;
    let mut func: sys::CUfunction = std::ptr::null_mut();
    unsafe {
        cuda::cuda_check(
            sys::cuModuleGetFunction(&mut func, module, c_name.as_ptr()),
            "cuModuleGetFunction",
        )?;
    }

    let mut min_grid_size = 0i32;
    let mut block_size = 0i32;
    unsafe {
        cuda::cuda_check(
            sys::cuOccupancyMaxPotentialBlockSize(
                &mut min_grid_size,
                &mut block_size,
                func,
                None,
                0,
                0,
            ),
            "cuOccupancyMaxPotentialBlockSize",
        )?;
        cuda::cuda_check(
            sys::cuFuncSetAttribute(
                func,
                sys::CUfunction_attribute::CU_FUNC_ATTRIBUTE_MAX_DYNAMIC_SHARED_SIZE_BYTES,
                0,
            ),
            "cuFuncSetAttribute",
        )?;
        cuda::cuda_check(
            sys::cuFuncSetAttribute(
                func,
                sys::CUfunction_attribute::CU_FUNC_ATTRIBUTE_PREFERRED_SHARED_MEMORY_CARVEOUT,
                sys::CUshared_carveout::CU_SHAREDMEM_CARVEOUT_MAX_L1 as i32,
            ),
            "cuFuncSetAttribute",
        )?;
    }

    Ok(Kernel {
        data: KernelData::Cuda(CudaKernel {
            module: module as usize,
            func: func as usize,
            block_size: block_size as u32,
        }),
        artifact_size: ptx.len() as u32,
    })
}

#[cfg(not(feature = "cuda"))]
fn load_cuda_module(_device: i32, _ptx: &[u8], _name: &str) -> Result<Kernel> {
    Err(lanejit_device::Error::BackendUnavailable { backend: "cuda" }.into())
}
