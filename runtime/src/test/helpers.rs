//! Shared test scaffolding: process setup and the wavefront loop driver.

use std::sync::Once;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};

use crate::error::Result;
use crate::trace::{self, VarRef};
use crate::JitBackend;

static INIT: Once = Once::new();

/// Point the persistent kernel cache at a throwaway directory so test runs
/// do not interfere with each other (or the user's real cache).
pub fn init() {
    INIT.call_once(|| {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let dir = std::env::temp_dir()
            .join(format!("lanejit-test-{}-{nanos}", std::process::id()));
        std::env::set_var("LANEJIT_CACHE_DIR", &dir);
    });
}

static SERIAL: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Serialize tests that observe process-wide counters or flags.
pub fn serial() -> MutexGuard<'static, ()> {
    init();
    SERIAL.lock()
}

/// Wavefront-mode loop driver.
///
/// Each trip evaluates the condition and all loop state, masks the state of
/// disabled lanes back to their values from the previous trip, and keeps
/// iterating while any lane remains active. While a trip's body runs, the
/// condition sits on the mask stack so side effects only touch active lanes.
pub struct WavefrontLoop {
    backend: JitBackend,
    saved: Vec<VarRef>,
    cond: Option<VarRef>,
}

impl WavefrontLoop {
    pub fn new(backend: JitBackend) -> Self {
        Self { backend, saved: Vec::new(), cond: None }
    }

    /// Returns true when another trip should run. `vars` is the loop state,
    /// in the same order on every call.
    pub fn cond(&mut self, cond: VarRef, vars: &mut [&mut VarRef]) -> Result<bool> {
        if let Some(previous) = self.cond.take() {
            let saved: Vec<VarRef> = self.saved.drain(..).collect();
            for (var, old) in vars.iter_mut().zip(saved.iter()) {
                **var = trace::select(&previous, var, old)?;
            }
            trace::mask_pop(self.backend)?;
        }

        trace::schedule(&cond)?;
        for var in vars.iter() {
            trace::schedule(var)?;
        }
        crate::eval(self.backend)?;

        if trace::any(&cond)? {
            trace::mask_push(&cond)?;
            self.saved = vars.iter().map(|v| (**v).clone()).collect();
            self.cond = Some(cond);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

impl Drop for WavefrontLoop {
    fn drop(&mut self) {
        if self.cond.take().is_some() {
            let _ = trace::mask_pop(self.backend);
        }
    }
}
