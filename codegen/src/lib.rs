//! Kernel IR and backend lowering.
//!
//! The evaluator assembles one *kernel IR* text buffer per scheduled group.
//! The text format is backend-neutral and line oriented; it is the unit that
//! gets hashed, cached (in memory and on disk) and handed to a backend
//! compiler. This crate owns the format (`kir`), the CPU lowering through
//! cranelift (`cpu`) and the CUDA C lowering (`cuda`).

pub mod cpu;
pub mod cuda;
pub mod error;
pub mod kir;

pub use cpu::{CpuKernel, KernelFn};
pub use error::{Error, Result};
pub use kir::{Inst, Op, Program};

/// Direct kernel-parameter limit of the CUDA launch path; kernels with more
/// parameters receive them through a staged device buffer.
pub const CUDA_ARG_LIMIT: usize = 512;
