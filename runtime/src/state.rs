//! Process-wide state.
//!
//! Two locks guard the runtime, mirroring the concurrency contract of the
//! evaluator: `STATE` protects the variable table, kernel cache and counters;
//! `EVAL` serializes the scheduler/assembler phase and doubles as the home of
//! the reusable per-eval scratch buffers. `EVAL` is always acquired *before*
//! `STATE`, and slow operations (kernel compilation, module loads, blocking
//! waits) drop `STATE` via `MutexGuard::unlocked` while they run.

use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

use lanejit_device::Device;

use crate::cache::{Kernel, KernelKey};
use crate::schedule::{ScheduledGroup, ScheduledVariable};
use crate::var::{Extra, Variable};

/// Mutable global state guarded by the primary lock.
pub struct State {
    pub variables: FxHashMap<u32, Variable>,
    pub extra: FxHashMap<u32, Extra>,
    pub kernel_cache: FxHashMap<KernelKey, Arc<Kernel>>,
    /// CUDA device table; empty until the CUDA backend is initialized.
    pub devices: Vec<Device>,
    variable_counter: u32,

    pub kernel_hits: u64,
    pub kernel_soft_misses: u64,
    pub kernel_hard_misses: u64,
    pub kernel_launches: u64,
}

impl State {
    fn new() -> Self {
        Self {
            variables: FxHashMap::default(),
            extra: FxHashMap::default(),
            kernel_cache: FxHashMap::default(),
            devices: Vec::new(),
            variable_counter: 0,
            kernel_hits: 0,
            kernel_soft_misses: 0,
            kernel_hard_misses: 0,
            kernel_launches: 0,
        }
    }

    /// Next unused variable index. Indices are never reused.
    pub fn next_index(&mut self) -> u32 {
        self.variable_counter += 1;
        self.variable_counter
    }
}

// Variables store raw device pointers as integers; everything else is Send.
static STATE: Lazy<Mutex<State>> = Lazy::new(|| Mutex::new(State::new()));

/// Acquire the primary lock.
pub fn lock() -> MutexGuard<'static, State> {
    STATE.lock()
}

/// Reusable buffers of the evaluator. The mutex wrapping this structure *is*
/// the eval lock: holding it serializes scheduler and assembler phases.
#[derive(Default)]
pub struct EvalScratch {
    pub visited: FxHashSet<(u32, u32)>,
    pub schedule: Vec<ScheduledVariable>,
    pub groups: Vec<ScheduledGroup>,
    /// Shared kernel IR text buffer, reused across groups and evals.
    pub buffer: String,
    /// Kernel parameters (pointers stored as integers, so the scratch stays
    /// `Send`).
    pub params: Vec<usize>,
    pub globals: Vec<String>,
    pub callables: Vec<String>,
    /// Structural hash -> slot index for globals and callables.
    pub globals_map: FxHashMap<u128, u32>,
    pub kernel_hash: u128,
    pub kernel_name: String,
    /// Device copy of the staged parameter buffer (CUDA large-parameter
    /// path); freed after the launch is submitted.
    pub staged_params: usize,
}

static EVAL: Lazy<Mutex<EvalScratch>> = Lazy::new(|| Mutex::new(EvalScratch::default()));

/// Acquire the eval lock.
pub fn lock_eval() -> MutexGuard<'static, EvalScratch> {
    EVAL.lock()
}

/// Snapshot of the kernel cache counters, for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheCounters {
    pub hits: u64,
    pub soft_misses: u64,
    pub hard_misses: u64,
    pub launches: u64,
}

pub fn cache_counters() -> CacheCounters {
    let state = lock();
    CacheCounters {
        hits: state.kernel_hits,
        soft_misses: state.kernel_soft_misses,
        hard_misses: state.kernel_hard_misses,
        launches: state.kernel_launches,
    }
}
