//! Optional per-launch bookkeeping, enabled by [`JitFlag::KernelHistory`].

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use lanejit_device::Task;
use lanejit_dtype::{JitBackend, KernelType};

/// One recorded launch.
#[derive(Debug, Clone)]
pub struct KernelHistoryEntry {
    pub backend: JitBackend,
    pub kind: KernelType,
    /// Output width of the launch.
    pub size: u32,
    pub input_count: u32,
    pub output_count: u32,
    /// Retained task handle (CPU backend).
    pub task: Option<Task>,
    /// Start/end event handles (CUDA backend), as raw driver pointers.
    pub event_start: usize,
    pub event_end: usize,
}

impl KernelHistoryEntry {
    pub fn new(backend: JitBackend, kind: KernelType, size: u32) -> Self {
        Self {
            backend,
            kind,
            size,
            input_count: 1,
            output_count: 1,
            task: None,
            event_start: 0,
            event_end: 0,
        }
    }
}

static HISTORY: Lazy<Mutex<Vec<KernelHistoryEntry>>> = Lazy::new(|| Mutex::new(Vec::new()));

pub fn append(entry: KernelHistoryEntry) {
    HISTORY.lock().push(entry);
}

/// Take all recorded entries, leaving the history empty.
pub fn take() -> Vec<KernelHistoryEntry> {
    std::mem::take(&mut *HISTORY.lock())
}

pub fn len() -> usize {
    HISTORY.lock().len()
}
