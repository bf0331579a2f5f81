//! Process-wide behavior flags.

use std::sync::atomic::{AtomicU32, Ordering};

/// Optional runtime behaviors, combined into a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum JitFlag {
    /// Record per-launch timing/bookkeeping entries.
    KernelHistory = 1 << 0,
    /// Synchronize immediately after every launch.
    LaunchBlocking = 1 << 1,
    /// Dump assembled kernel IR to stderr.
    PrintIR = 1 << 2,
    /// Side effects are not flushed by `eval` while recording.
    Recording = 1 << 3,
    /// Loop helper: capture loops symbolically instead of unrolling.
    LoopRecord = 1 << 4,
    /// Loop helper: optimize away loop-invariant state.
    LoopOptimize = 1 << 5,
    /// Queue side effects instead of scheduling them right away.
    PostponeSideEffects = 1 << 6,
}

static FLAGS: AtomicU32 = AtomicU32::new(0);

/// Read the full flag bitmask.
pub fn flags() -> u32 {
    FLAGS.load(Ordering::Relaxed)
}

/// Replace the full flag bitmask.
pub fn set_flags(value: u32) {
    FLAGS.store(value, Ordering::Relaxed);
}

/// Test a single flag.
pub fn flag(which: JitFlag) -> bool {
    flags() & which as u32 != 0
}

/// Set or clear a single flag.
pub fn set_flag(which: JitFlag, enable: bool) {
    if enable {
        FLAGS.fetch_or(which as u32, Ordering::Relaxed);
    } else {
        FLAGS.fetch_and(!(which as u32), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear() {
        set_flags(0);
        set_flag(JitFlag::LaunchBlocking, true);
        assert!(flag(JitFlag::LaunchBlocking));
        assert!(!flag(JitFlag::Recording));
        set_flag(JitFlag::LaunchBlocking, false);
        assert_eq!(flags(), 0);
    }
}
