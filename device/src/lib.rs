//! Device layer: accelerator descriptors, raw memory allocation with deferred
//! release, and the CPU task pool that backs asynchronous host execution.

pub mod alloc;
pub mod device;
pub mod error;
pub mod task;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use alloc::{AllocType, Allocation};
pub use device::Device;
pub use error::{Error, Result};
pub use task::{pool_size, SendPtr, Task};
