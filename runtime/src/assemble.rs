//! Assembler: turn one scheduled group into a kernel IR text buffer.
//!
//! Assigns register indices and parameter slots, allocates output storage,
//! deduplicates globals and callables, and stamps the kernel name with the
//! 128-bit content hash of the finished buffer.

use std::fmt::Write as _;

use snafu::ensure;
use xxhash_rust::xxh3::xxh3_128;

use lanejit_codegen::kir::{self, CALLABLE_PREFIX, KERNEL_PREFIX, NAME_PLACEHOLDER};
use lanejit_device::alloc::{self, AllocType};
use lanejit_dtype::{JitBackend, VarType};

use crate::error::{InternalSnafu, InvalidVariableSnafu, Result};
use crate::flags::{flag, JitFlag};
use crate::schedule::ScheduledGroup;
use crate::state::{EvalScratch, State};
use crate::var::{self, ParamType, PARAM_OFFSET_NONE};

/// Register indices reserved by each backend (the CUDA emitter keeps four
/// registers for the lane bookkeeping, the CPU emitter one).
pub const RESERVED_REGS_CUDA: u32 = 4;
pub const RESERVED_REGS_CPU: u32 = 1;

/// Parameter slots reserved ahead of the variable parameters.
pub const RESERVED_PARAMS_CUDA: usize = 1; // slot 0: width
pub const RESERVED_PARAMS_CPU: usize = 3; // kernel pointer, width, profile id

/// Assemble `group` into `scratch.buffer`, filling `scratch.params`,
/// `scratch.kernel_hash` and `scratch.kernel_name`.
pub fn assemble(
    state: &mut State,
    scratch: &mut EvalScratch,
    backend: JitBackend,
    device: i32,
    group: ScheduledGroup,
) -> Result<()> {
    scratch.params.clear();
    scratch.globals.clear();
    scratch.callables.clear();
    scratch.globals_map.clear();
    scratch.staged_params = 0;

    let mut n_regs: u32;
    match backend {
        JitBackend::Cuda => {
            scratch.params.push(group.size as usize);
            n_regs = RESERVED_REGS_CUDA;
        }
        JitBackend::Cpu => {
            scratch.params.extend([0usize; RESERVED_PARAMS_CPU]);
            n_regs = RESERVED_REGS_CPU;
        }
    }

    let mut n_params_in = 0u32;
    let mut n_params_out = 0u32;
    let mut n_side_effects = 0u32;

    for schedule_index in group.start..group.end {
        let index = scratch.schedule[schedule_index as usize].index;

        // Sanity checks before the variable is wired into the kernel.
        {
            let v = var::get(state, index)?;
            ensure!(
                v.backend == backend,
                InvalidVariableSnafu { index, reason: "scheduled in the wrong thread state" }
            );
            ensure!(
                v.ref_count_ext > 0 || v.ref_count_int > 0,
                InternalSnafu { reason: format!("schedule contains unreferenced variable r{index}") }
            );
            ensure!(
                v.size == 1 || v.size == group.size,
                InvalidVariableSnafu {
                    index,
                    reason: format!("incompatible width ({} in a group of {})", v.size, group.size),
                }
            );
            ensure!(
                v.data != 0 || v.literal || v.stmt.is_some(),
                InvalidVariableSnafu { index, reason: "variable has no statement" }
            );
            ensure!(
                !(v.literal && v.data != 0),
                InvalidVariableSnafu { index, reason: "simultaneously literal and evaluated" }
            );
            ensure!(
                v.ref_count_se == 0,
                InvalidVariableSnafu { index, reason: "dirty variable encountered" }
            );
        }

        let param_offset = (scratch.params.len() * 8) as u32;
        let v = var::get(state, index)?;
        if v.data != 0 {
            let data = v.data;
            let v = var::get_mut(state, index)?;
            v.param_type = ParamType::Input;
            v.param_offset = param_offset;
            scratch.params.push(data);
            n_params_in += 1;
        } else if v.output_flag && v.size == group.size {
            let ty = v.ty;
            let isize = ty.size();
            let mut dsize = group.size as usize * isize;
            // Trailing padding keeps vectorized sub-word loads in bounds.
            if backend == JitBackend::Cpu && isize < 4 {
                dsize += 4 - isize;
            }

            let data = match backend {
                JitBackend::Cpu => alloc::malloc(AllocType::HostAsync, dsize)? as usize,
                JitBackend::Cuda => cuda_malloc_device(device, dsize)?,
            };

            // The allocation may have dropped the lock; re-fetch.
            let v = var::get_mut(state, index)?;
            v.data = data;
            v.param_type = ParamType::Output;
            v.param_offset = param_offset;
            scratch.params.push(data);
            n_params_out += 1;
        } else if v.literal && v.ty == VarType::Pointer {
            let value = v.value;
            let v = var::get_mut(state, index)?;
            v.param_type = ParamType::Input;
            v.param_offset = param_offset;
            scratch.params.push(value as usize);
            n_params_in += 1;
        } else {
            n_side_effects += v.side_effect as u32;
            let v = var::get_mut(state, index)?;
            v.param_type = ParamType::Register;
            v.param_offset = PARAM_OFFSET_NONE;
        }

        var::get_mut(state, index)?.reg_index = n_regs;
        n_regs += 1;
    }

    if n_regs > 1_000_000 {
        tracing::warn!(
            registers = n_regs,
            "kernel uses a very large number of registers; consider evaluating more often"
        );
    }
    if scratch.params.len() > 8192 {
        tracing::warn!(
            params = scratch.params.len(),
            "kernel accesses a very large number of arrays; consider evaluating more often"
        );
    }

    emit(state, scratch, backend, group)?;

    // Hash the buffer (placeholder still in place), then stamp the name.
    scratch.kernel_hash = xxh3_128(scratch.buffer.as_bytes());
    let digest = format!("{:032x}", scratch.kernel_hash);
    scratch.kernel_name = format!("{KERNEL_PREFIX}{digest}");

    let position = scratch.buffer.find(NAME_PLACEHOLDER).ok_or_else(|| {
        InternalSnafu { reason: "assembled kernel lacks a name placeholder".to_string() }.build()
    })?;
    scratch.buffer.replace_range(position..position + NAME_PLACEHOLDER.len(), &digest);

    if flag(JitFlag::PrintIR) {
        eprintln!("{}", scratch.buffer);
    }

    tracing::debug!(
        kernel.name = %scratch.kernel_name,
        size = group.size,
        inputs = n_params_in,
        outputs = n_params_out + n_side_effects,
        registers = n_regs,
        "assembled kernel"
    );
    Ok(())
}

/// Write the kernel IR text for a group whose registers and parameters have
/// been assigned.
fn emit(
    state: &State,
    scratch: &mut EvalScratch,
    backend: JitBackend,
    group: ScheduledGroup,
) -> Result<()> {
    // Split borrows: the buffer is written while the schedule is read.
    let EvalScratch { ref mut buffer, ref schedule, ref globals, ref callables, ref params, .. } =
        *scratch;
    buffer.clear();

    for global in globals {
        buffer.push_str(global);
    }

    let name = format!("{KERNEL_PREFIX}{NAME_PLACEHOLDER}");
    kir::write_header(buffer, &name, backend, params.len() as u32);

    for schedule_index in group.start..group.end {
        let index = schedule[schedule_index as usize].index;
        let v = var::get(state, index)?;
        let reg = v.reg_index;
        let slot = v.param_offset / 8;

        match v.param_type {
            ParamType::Input if v.literal => {
                let _ = writeln!(buffer, "    r{reg} = in.ptr p{slot}");
            }
            ParamType::Input => {
                if v.size == 1 {
                    let _ = writeln!(buffer, "    r{reg} = in.scalar.{} p{slot}", v.ty.name());
                } else {
                    let _ = writeln!(buffer, "    r{reg} = in.{} p{slot}", v.ty.name());
                }
            }
            ParamType::Output | ParamType::Register => {
                if v.literal {
                    let _ = writeln!(buffer, "    r{reg} = const.{} {:#x}", v.ty.name(), v.value);
                } else {
                    let stmt = v.stmt.as_deref().ok_or_else(|| {
                        InternalSnafu { reason: format!("variable r{index} has no statement") }
                            .build()
                    })?;
                    let line = substitute(state, stmt, &v.dep)?;
                    if v.ty == VarType::Void {
                        let _ = writeln!(buffer, "    {line}");
                    } else {
                        let _ = writeln!(buffer, "    r{reg} = {line}");
                    }
                }
                if v.param_type == ParamType::Output {
                    let _ = writeln!(buffer, "    out.{} p{slot}, r{reg}", v.ty.name());
                }
            }
        }
    }

    for callable in callables {
        buffer.push_str(callable);
    }
    Ok(())
}

/// Replace `$r1`..`$r4` placeholders with the register names of the
/// variable's dependencies.
fn substitute(state: &State, stmt: &str, dep: &[u32; 4]) -> Result<String> {
    let mut line = String::with_capacity(stmt.len() + 8);
    let mut rest = stmt;
    while let Some(position) = rest.find("$r") {
        line.push_str(&rest[..position]);
        let digit = rest.as_bytes().get(position + 2).copied().unwrap_or(0);
        let slot = (digit as char).to_digit(10).ok_or_else(|| {
            InternalSnafu { reason: format!("malformed placeholder in `{stmt}`") }.build()
        })?;
        ensure!(
            (1..=4).contains(&slot) && dep[(slot - 1) as usize] != 0,
            InternalSnafu { reason: format!("statement `{stmt}` references missing dependency") }
        );
        let reg = var::get(state, dep[(slot - 1) as usize])?.reg_index;
        let _ = write!(line, "r{reg}");
        rest = &rest[position + 3..];
    }
    line.push_str(rest);
    Ok(line)
}

/// Deduplicate and register a global text block (helper functions, constant
/// tables). Returns the slot index.
pub fn register_global(scratch: &mut EvalScratch, text: &str) -> u32 {
    let hash = xxh3_128(text.as_bytes());
    if let Some(&slot) = scratch.globals_map.get(&hash) {
        return slot;
    }
    let slot = scratch.globals.len() as u32;
    scratch.globals_map.insert(hash, slot);
    scratch.globals.push(text.to_string());
    slot
}

/// Deduplicate and register a callable sub-kernel. The body must contain the
/// name placeholder, which is replaced by the callable's own content hash.
/// Returns the hash and slot index.
pub fn register_callable(scratch: &mut EvalScratch, body: &str) -> Result<(u128, u32)> {
    let hash = xxh3_128(body.as_bytes());
    if let Some(&slot) = scratch.globals_map.get(&hash) {
        return Ok((hash, slot));
    }

    let position = body.find(NAME_PLACEHOLDER).ok_or_else(|| {
        InternalSnafu { reason: "callable lacks a name placeholder".to_string() }.build()
    })?;
    let mut stamped = String::with_capacity(body.len());
    stamped.push_str(&body[..position]);
    let _ = write!(stamped, "{:032x}", hash);
    stamped.push_str(&body[position + NAME_PLACEHOLDER.len()..]);

    let slot = scratch.callables.len() as u32;
    scratch.globals_map.insert(hash, slot);
    scratch.callables.push(stamped);
    Ok((hash, slot))
}

/// Name of a callable with the placeholder still in place, for use by
/// emitters building callable bodies.
pub fn callable_name_placeholder() -> String {
    format!("{CALLABLE_PREFIX}{NAME_PLACEHOLDER}")
}

#[cfg(feature = "cuda")]
fn cuda_malloc_device(device: i32, size: usize) -> Result<usize> {
    Ok(lanejit_device::cuda::malloc_device(device, size)? as usize)
}

#[cfg(not(feature = "cuda"))]
fn cuda_malloc_device(_device: i32, _size: usize) -> Result<usize> {
    Err(lanejit_device::Error::BackendUnavailable { backend: "cuda" }.into())
}
