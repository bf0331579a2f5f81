//! Tracing JIT evaluator for data-parallel arrays.
//!
//! Callers build computations as a DAG of [`var::Variable`] nodes; the
//! evaluator traverses everything queued on the calling thread's
//! [`thread_state::ThreadState`], partitions it into equal-width groups,
//! assembles one kernel IR buffer per group, compiles (or re-uses) the
//! kernel and launches it asynchronously. A library of parallel primitives
//! (reductions, prefix sums, compaction, permutation construction, block
//! operations) shares the same launch machinery on both backends.

pub mod assemble;
pub mod cache;
pub mod compile;
pub mod eval;
pub mod flags;
pub mod history;
pub mod launch;
pub mod memory;
pub mod primitives;
pub mod schedule;
pub mod state;
pub mod thread_state;
pub mod trace;
pub mod var;

mod error;

#[cfg(test)]
pub mod test;

pub use error::{Error, Result};
pub use flags::{flag, flags, set_flag, set_flags, JitFlag};
pub use lanejit_dtype::{JitBackend, KernelType, ReduceOp, VarType};
pub use thread_state::{sync_thread, with_thread_state};
pub use trace::VarRef;

/// Lanes handled by one CPU worker slice of a fused kernel.
pub const POOL_BLOCK_SIZE: u32 = 16384;

/// Re-exported parameter limit of the direct CUDA launch path.
pub use lanejit_codegen::CUDA_ARG_LIMIT;

/// Evaluate everything scheduled on the calling thread for `backend`.
pub fn eval(backend: JitBackend) -> Result<()> {
    with_thread_state(backend, eval::eval_thread_state)
}
