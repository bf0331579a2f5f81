//! Raw CUDA driver glue: error checking, device enumeration, primary
//! contexts, and device/pinned memory.
//!
//! The launch layer needs driver features that the safe `cudarc` wrappers do
//! not expose (parameter-buffer launches, occupancy queries, attribute
//! setup), so this module talks to `cudarc::driver::sys` directly and keeps
//! the checking idiom in one place.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

pub use cudarc::driver::sys;

use crate::alloc::{self, AllocType, Allocation};
use crate::device::Device;
use crate::error::{DriverSnafu, Result};

/// Convert a driver status into a `Result`, attaching the symbolic error name.
pub fn cuda_check(ret: sys::CUresult, context: &'static str) -> Result<()> {
    if ret == sys::CUresult::CUDA_SUCCESS {
        return Ok(());
    }
    let mut name: *const std::os::raw::c_char = std::ptr::null();
    let resolved = unsafe {
        if sys::cuGetErrorName(ret, &mut name) == sys::CUresult::CUDA_SUCCESS && !name.is_null() {
            std::ffi::CStr::from_ptr(name).to_string_lossy().into_owned()
        } else {
            String::from("CUDA_ERROR_UNKNOWN")
        }
    };
    DriverSnafu { code: ret as i32, name: resolved, context }.fail()
}

static CONTEXTS: Lazy<Mutex<FxHashMap<i32, usize>>> = Lazy::new(|| Mutex::new(FxHashMap::default()));

fn device_attribute(id: i32, what: sys::CUdevice_attribute) -> Result<i32> {
    let mut value = 0i32;
    unsafe {
        cuda_check(sys::cuDeviceGetAttribute(&mut value, what, id), "cuDeviceGetAttribute")?;
    }
    Ok(value)
}

/// Initialize the driver and enumerate devices.
pub fn enumerate_devices() -> Result<Vec<Device>> {
    let mut count = 0i32;
    unsafe {
        cuda_check(sys::cuInit(0), "cuInit")?;
        cuda_check(sys::cuDeviceGetCount(&mut count), "cuDeviceGetCount")?;
    }

    let mut devices = Vec::with_capacity(count as usize);
    for id in 0..count {
        let major =
            device_attribute(id, sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)?;
        let minor =
            device_attribute(id, sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)?;
        let sm_count =
            device_attribute(id, sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)?;
        let shared = device_attribute(
            id,
            sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK_OPTIN,
        )?;

        devices.push(Device {
            id,
            compute_capability: (major * 10 + minor) as u32,
            sm_count: sm_count as u32,
            shared_memory_bytes: shared as u32,
        });
    }
    Ok(devices)
}

/// Retain (and cache) the primary context of a device.
pub fn context(device: i32) -> Result<sys::CUcontext> {
    let mut contexts = CONTEXTS.lock();
    if let Some(&ctx) = contexts.get(&device) {
        return Ok(ctx as sys::CUcontext);
    }
    let mut ctx: sys::CUcontext = std::ptr::null_mut();
    unsafe {
        cuda_check(sys::cuDevicePrimaryCtxRetain(&mut ctx, device), "cuDevicePrimaryCtxRetain")?;
    }
    contexts.insert(device, ctx as usize);
    Ok(ctx)
}

/// Make a context current for the lifetime of the guard, restoring the
/// previous context on drop.
pub struct ScopedContext {
    previous: sys::CUcontext,
}

impl ScopedContext {
    pub fn new(ctx: sys::CUcontext) -> Result<Self> {
        let mut previous: sys::CUcontext = std::ptr::null_mut();
        unsafe {
            cuda_check(sys::cuCtxGetCurrent(&mut previous), "cuCtxGetCurrent")?;
            cuda_check(sys::cuCtxSetCurrent(ctx), "cuCtxSetCurrent")?;
        }
        Ok(Self { previous })
    }
}

impl Drop for ScopedContext {
    fn drop(&mut self) {
        unsafe {
            let _ = sys::cuCtxSetCurrent(self.previous);
        }
    }
}

/// Allocate device global memory on `device`, tracked by the allocator.
///
/// Sizes are rounded up to 4 KiB so that primitives padding the tail of a
/// boolean stream (compaction, boolean reductions) stay in bounds.
pub fn malloc_device(device: i32, size: usize) -> Result<*mut u8> {
    let _guard = ScopedContext::new(context(device)?)?;
    let mut ptr: sys::CUdeviceptr = 0;
    let padded = size.max(1).div_ceil(4096) * 4096;
    unsafe {
        cuda_check(sys::cuMemAlloc_v2(&mut ptr, padded), "cuMemAlloc")?;
    }
    alloc::register(Allocation { ptr: ptr as usize, size: padded, kind: AllocType::Device, device });
    Ok(ptr as *mut u8)
}

/// Allocate page-locked host memory, tracked by the allocator.
pub fn malloc_pinned(device: i32, size: usize) -> Result<*mut u8> {
    let _guard = ScopedContext::new(context(device)?)?;
    let mut ptr: *mut std::os::raw::c_void = std::ptr::null_mut();
    unsafe {
        cuda_check(sys::cuMemAllocHost_v2(&mut ptr, size.max(1)), "cuMemAllocHost")?;
    }
    alloc::register(Allocation {
        ptr: ptr as usize,
        size: size.max(1),
        kind: AllocType::HostPinned,
        device,
    });
    Ok(ptr as *mut u8)
}

pub(crate) fn release_device(a: Allocation) {
    if let Ok(ctx) = context(a.device) {
        if let Ok(_guard) = ScopedContext::new(ctx) {
            unsafe {
                let _ = sys::cuMemFree_v2(a.ptr as sys::CUdeviceptr);
            }
        }
    }
}

pub(crate) fn release_pinned(a: Allocation) {
    unsafe {
        let _ = sys::cuMemFreeHost(a.ptr as *mut std::os::raw::c_void);
    }
}
