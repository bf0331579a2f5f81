//! The evaluation orchestrator.
//!
//! One invocation: collect the roots queued on the thread state, traverse
//! their dependencies, sort and group the schedule by width, then assemble,
//! compile and launch one kernel per group. After all launches are
//! submitted, the internal edges between the evaluated variables are
//! dropped, which garbage-collects everything that is no longer externally
//! referenced.

use lanejit_device::Task;
use lanejit_dtype::{JitBackend, VarType};

use crate::error::{InternalSnafu, Result};
use crate::flags::{flag, JitFlag};
use crate::thread_state::{BackendState, ThreadState};
use crate::var::ExtraCallback;
use crate::{assemble, compile, launch, schedule, state, var};

/// Evaluate everything queued on `ts`.
pub fn eval_thread_state(ts: &mut ThreadState) -> Result<()> {
    if ts.scheduled.is_empty() && ts.side_effects.is_empty() {
        return Ok(());
    }

    // The eval lock serializes the scheduler/assembler phase across threads;
    // the primary lock is taken afterwards and dropped around slow
    // operations, so the two never deadlock.
    let mut scratch = state::lock_eval();
    let mut guard = state::lock();

    scratch.visited.clear();
    scratch.schedule.clear();

    // Collect user-scheduled roots, then side effects (unless recording).
    for phase in 0..2 {
        if phase == 1 && flag(JitFlag::Recording) {
            break;
        }
        let queue =
            std::mem::take(if phase == 0 { &mut ts.scheduled } else { &mut ts.side_effects });

        for index in queue {
            let Ok(v) = var::get(&guard, index) else { continue };
            if v.ref_count_ext == 0 || v.data != 0 {
                continue;
            }
            let (size, ty) = (v.size, v.ty);
            schedule::traverse(&mut guard, &mut scratch, size, index)?;
            var::get_mut(&mut guard, index)?.output_flag = ty != VarType::Void;
        }
    }

    if scratch.schedule.is_empty() {
        return Ok(());
    }

    schedule::sort_and_group(&mut scratch);
    tracing::debug!(kernels = scratch.groups.len(), "evaluating schedule");

    let groups = scratch.groups.clone();
    let mut tasks: Vec<Task> = Vec::new();

    for group in groups {
        assemble::assemble(&mut guard, &mut scratch, ts.backend, ts.device, group)?;

        let kernel = compile::lookup_or_compile(
            &mut guard,
            &scratch.buffer,
            scratch.kernel_hash,
            &scratch.kernel_name,
            ts.backend,
            ts.device,
            0,
        )?;
        guard.kernel_launches += 1;

        if let Some(task) = launch::launch(&mut guard, ts, &mut scratch, &kernel, group)? {
            tasks.push(task);
        }

        if scratch.staged_params != 0 {
            crate::memory::free_async(scratch.staged_params as *mut u8)?;
            scratch.staged_params = 0;
        }
    }

    // Collapse this eval's tasks into the thread state's task.
    if ts.backend == JitBackend::Cpu {
        let BackendState::Cpu(cpu) = &mut ts.inner else {
            return InternalSnafu { reason: "backend state mismatch".to_string() }.fail();
        };
        match tasks.len() {
            0 => {
                return InternalSnafu { reason: "eval generated no tasks".to_string() }.fail();
            }
            1 => cpu.task = tasks.pop(),
            _ => {
                let refs: Vec<&Task> = tasks.iter().collect();
                cpu.task = Some(Task::barrier(&refs));
            }
        }
    }

    // All scheduled variables are now backed by launched kernels: drop the
    // internal edges between them so intermediates can be collected.
    tracing::trace!("cleaning up evaluated variables");
    let evaluated = scratch.schedule.clone();
    for sv in evaluated {
        let index = sv.index;
        let Some(v) = guard.variables.get_mut(&index) else { continue };
        v.reg_index = 0;
        if !(v.output_flag || v.side_effect) {
            continue;
        }

        if v.extra {
            let callback = guard.extra.get_mut(&index).and_then(|e| e.callback.take());
            match callback {
                Some(ExtraCallback::Internal(callback)) => callback(&mut *guard, index),
                Some(ExtraCallback::External(callback)) => {
                    parking_lot::MutexGuard::unlocked(&mut guard, || callback(index));
                }
                None => {}
            }
        }

        let Some(v) = guard.variables.get_mut(&index) else { continue };
        if v.literal {
            return InternalSnafu {
                reason: format!("unexpected literal r{index} during cleanup"),
            }
            .fail();
        }

        let dep = v.dep;
        let side_effect = v.side_effect;
        v.stmt = None;
        v.dep = [0; 4];
        v.output_flag = false;
        v.side_effect = false;

        if side_effect {
            var::dec_ref_ext(&mut guard, index)?;
        }
        for d in dep {
            var::dec_ref_int(&mut guard, d)?;
        }
    }

    drop(guard);
    ts.free_flush()?;
    tracing::trace!("eval done");
    Ok(())
}
