//! Minimal tracing front end.
//!
//! Constructors record operations as variables in the DAG; handles are
//! reference counted through [`VarRef`]. The statement fragment of a traced
//! operation is kernel IR with `$r1`..`$r4` dependency placeholders that the
//! assembler resolves to register names.

use lanejit_codegen::kir::{BinOp, CmpOp};
use lanejit_dtype::{JitBackend, ReduceOp, VarType};
use snafu::ensure;

use crate::error::{InvalidArgumentSnafu, Result, UnsupportedTypeSnafu};
use crate::thread_state::with_thread_state;
use crate::var::{self, Extra, ExtraCallback, Variable};
use crate::{state, sync_thread};

/// Reference-counted handle to a traced variable.
pub struct VarRef {
    index: u32,
}

impl VarRef {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Take an additional handle on an existing variable index.
    pub fn from_index(index: u32) -> Result<VarRef> {
        let mut state = state::lock();
        var::inc_ref_ext(&mut state, index)?;
        Ok(VarRef { index })
    }

    pub fn ty(&self) -> VarType {
        let state = state::lock();
        var::get(&state, self.index).expect("live handle").ty
    }

    pub fn size(&self) -> u32 {
        let state = state::lock();
        var::get(&state, self.index).expect("live handle").size
    }

    pub fn backend(&self) -> JitBackend {
        let state = state::lock();
        var::get(&state, self.index).expect("live handle").backend
    }

    /// Whether the variable is backed by a materialized buffer.
    pub fn is_evaluated(&self) -> bool {
        let state = state::lock();
        var::get(&state, self.index).expect("live handle").data != 0
    }

    /// Transfer ownership of the external reference to the caller.
    fn into_raw(self) -> u32 {
        let index = self.index;
        std::mem::forget(self);
        index
    }
}

impl Clone for VarRef {
    fn clone(&self) -> Self {
        let mut state = state::lock();
        var::inc_ref_ext(&mut state, self.index).expect("live handle");
        VarRef { index: self.index }
    }
}

impl Drop for VarRef {
    fn drop(&mut self) {
        let mut state = state::lock();
        if let Err(err) = var::dec_ref_ext(&mut state, self.index) {
            tracing::error!(index = self.index, %err, "leaking variable handle");
        }
    }
}

impl std::fmt::Debug for VarRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VarRef(r{})", self.index)
    }
}

fn meta(v: &VarRef) -> (JitBackend, VarType, u32) {
    let state = state::lock();
    let variable = var::get(&state, v.index).expect("live handle");
    (variable.backend, variable.ty, variable.size)
}

/// Combined width of operands, broadcasting width-1 values.
fn joint_size(sizes: &[u32]) -> Result<u32> {
    let size = sizes.iter().copied().max().unwrap_or(1);
    for &s in sizes {
        ensure!(
            s == 1 || s == size,
            InvalidArgumentSnafu {
                reason: format!("operands have incompatible widths ({s} and {size})"),
            }
        );
    }
    Ok(size)
}

fn new_stmt_var(
    backend: JitBackend,
    ty: VarType,
    size: u32,
    stmt: String,
    deps: &[&VarRef],
) -> Result<VarRef> {
    debug_assert!(deps.len() <= 4);
    let mut state = state::lock();
    let mut variable = Variable::new(backend, ty, size);
    variable.stmt = Some(stmt.into_boxed_str());
    for (slot, dep) in deps.iter().enumerate() {
        var::check_dep(&state, dep.index, backend)?;
        variable.dep[slot] = dep.index;
        var::inc_ref_int(&mut state, dep.index)?;
    }
    let index = var::insert(&mut state, variable);
    Ok(VarRef { index })
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

/// Literal with an exact bit pattern, broadcast over `size` lanes.
pub fn literal(backend: JitBackend, ty: VarType, bits: u64, size: u32) -> Result<VarRef> {
    ensure!(
        size > 0,
        InvalidArgumentSnafu { reason: "variables cannot be empty".to_string() }
    );
    let mut state = state::lock();
    let mut variable = Variable::new(backend, ty, size);
    variable.literal = true;
    variable.value = bits;
    let index = var::insert(&mut state, variable);
    Ok(VarRef { index })
}

pub fn literal_u32(backend: JitBackend, value: u32, size: u32) -> Result<VarRef> {
    literal(backend, VarType::UInt32, value as u64, size)
}

pub fn literal_f32(backend: JitBackend, value: f32, size: u32) -> Result<VarRef> {
    literal(backend, VarType::Float32, value.to_bits() as u64, size)
}

pub fn literal_bool(backend: JitBackend, value: bool, size: u32) -> Result<VarRef> {
    literal(backend, VarType::Bool, value as u64, size)
}

/// `0, 1, 2, ..` over `size` lanes.
pub fn counter(backend: JitBackend, size: u32) -> Result<VarRef> {
    ensure!(
        size > 0,
        InvalidArgumentSnafu { reason: "variables cannot be empty".to_string() }
    );
    new_stmt_var(backend, VarType::UInt32, size, "counter.u32".to_string(), &[])
}

/// Upload a host slice as an evaluated array.
pub fn array_from_slice<T: Copy>(
    backend: JitBackend,
    ty: VarType,
    values: &[T],
) -> Result<VarRef> {
    ensure!(
        std::mem::size_of::<T>() == ty.size() && !values.is_empty(),
        InvalidArgumentSnafu { reason: "element size mismatch or empty array".to_string() }
    );
    let bytes = std::mem::size_of_val(values);

    let data = with_thread_state(backend, |ts| {
        let ptr = ts.scratch_alloc(bytes + 4)?;
        ts.memcpy(ptr, values.as_ptr() as *const u8, bytes)?;
        Ok(ptr)
    })?;

    let mut state = state::lock();
    let mut variable = Variable::new(backend, ty, values.len() as u32);
    variable.data = data as usize;
    let index = var::insert(&mut state, variable);
    Ok(VarRef { index })
}

// ---------------------------------------------------------------------------
// Traced operations
// ---------------------------------------------------------------------------

pub fn binop(op: BinOp, a: &VarRef, b: &VarRef) -> Result<VarRef> {
    let (backend, ty, a_size) = meta(a);
    let (_, b_ty, b_size) = meta(b);
    ensure!(
        ty == b_ty,
        InvalidArgumentSnafu { reason: "operand types differ".to_string() }
    );
    let size = joint_size(&[a_size, b_size])?;
    let stmt = format!("{}.{} $r1, $r2", op.name(), ty.name());
    new_stmt_var(backend, ty, size, stmt, &[a, b])
}

pub fn add(a: &VarRef, b: &VarRef) -> Result<VarRef> {
    binop(BinOp::Add, a, b)
}

pub fn sub(a: &VarRef, b: &VarRef) -> Result<VarRef> {
    binop(BinOp::Sub, a, b)
}

pub fn mul(a: &VarRef, b: &VarRef) -> Result<VarRef> {
    binop(BinOp::Mul, a, b)
}

pub fn cmp(op: CmpOp, a: &VarRef, b: &VarRef) -> Result<VarRef> {
    let (backend, ty, a_size) = meta(a);
    let (_, b_ty, b_size) = meta(b);
    ensure!(
        ty == b_ty,
        InvalidArgumentSnafu { reason: "operand types differ".to_string() }
    );
    let size = joint_size(&[a_size, b_size])?;
    let stmt = format!("{}.{} $r1, $r2", op.name(), ty.name());
    new_stmt_var(backend, VarType::Bool, size, stmt, &[a, b])
}

pub fn and(a: &VarRef, b: &VarRef) -> Result<VarRef> {
    binop(BinOp::And, a, b)
}

pub fn or(a: &VarRef, b: &VarRef) -> Result<VarRef> {
    binop(BinOp::Or, a, b)
}

pub fn not(a: &VarRef) -> Result<VarRef> {
    let (backend, ty, size) = meta(a);
    ensure!(
        ty == VarType::Bool || ty.is_integral(),
        UnsupportedTypeSnafu { type_name: ty.name(), primitive: "not" }
    );
    new_stmt_var(backend, ty, size, format!("not.{} $r1", ty.name()), &[a])
}

pub fn select(mask: &VarRef, a: &VarRef, b: &VarRef) -> Result<VarRef> {
    let (backend, mask_ty, mask_size) = meta(mask);
    let (_, ty, a_size) = meta(a);
    let (_, b_ty, b_size) = meta(b);
    ensure!(
        mask_ty == VarType::Bool && ty == b_ty,
        InvalidArgumentSnafu { reason: "select needs a boolean mask and equal types".to_string() }
    );
    let size = joint_size(&[mask_size, a_size, b_size])?;
    let stmt = format!("select.{} $r1, $r2, $r3", ty.name());
    new_stmt_var(backend, ty, size, stmt, &[mask, a, b])
}

pub fn cast(a: &VarRef, ty: VarType) -> Result<VarRef> {
    let (backend, src_ty, size) = meta(a);
    if src_ty == ty {
        return Ok(a.clone());
    }
    let stmt = format!("cast.{}.{} $r1", ty.name(), src_ty.name());
    new_stmt_var(backend, ty, size, stmt, &[a])
}

// ---------------------------------------------------------------------------
// Scheduling and evaluation
// ---------------------------------------------------------------------------

/// Queue a variable for the next evaluation. Literals and already
/// materialized arrays need no kernel and are skipped.
pub fn schedule(v: &VarRef) -> Result<()> {
    let (backend, skip) = {
        let state = state::lock();
        let variable = var::get(&state, v.index)?;
        (variable.backend, variable.data != 0 || variable.literal)
    };
    if skip {
        return Ok(());
    }
    with_thread_state(backend, |ts| {
        ts.scheduled.push(v.index);
        Ok(())
    })
}

/// Make sure the variable is backed by a buffer: literals are materialized
/// with an asynchronous fill, everything else is scheduled and evaluated.
/// A dirty variable (pending side effects) is flushed first.
pub fn ensure_evaluated(v: &VarRef) -> Result<()> {
    let (backend, ty, size, bits, kind) = {
        let state = state::lock();
        let variable = var::get(&state, v.index)?;
        let kind = if variable.data != 0 {
            if variable.ref_count_se > 0 {
                3
            } else {
                0
            }
        } else if variable.literal {
            1
        } else {
            2
        };
        (variable.backend, variable.ty, variable.size, variable.value, kind)
    };

    match kind {
        0 => Ok(()),
        // Evaluated but dirty: run the queued side effects.
        3 => crate::eval(backend),
        1 => {
            // Literals never go through a kernel: allocate and fill.
            let tsize = ty.size();
            let mut bytes = size as usize * tsize;
            if backend == JitBackend::Cpu && tsize < 4 {
                bytes += 4 - tsize;
            }
            let data = with_thread_state(backend, |ts| {
                let ptr = ts.scratch_alloc(bytes)?;
                ts.memset_async(ptr, size, tsize as u32, &bits.to_le_bytes())?;
                Ok(ptr)
            })?;

            let mut state = state::lock();
            let variable = var::get_mut(&mut state, v.index)?;
            variable.data = data as usize;
            variable.literal = false;
            variable.value = 0;
            Ok(())
        }
        _ => {
            schedule(v)?;
            crate::eval(backend)
        }
    }
}

/// Synchronize and copy an evaluated variable back to the host.
pub fn read<T: Copy + Default>(v: &VarRef) -> Result<Vec<T>> {
    ensure_evaluated(v)?;
    let (backend, ty, size, data) = {
        let state = state::lock();
        let variable = var::get(&state, v.index)?;
        (variable.backend, variable.ty, variable.size, variable.data)
    };
    ensure!(
        std::mem::size_of::<T>() == ty.size(),
        InvalidArgumentSnafu { reason: "element size mismatch".to_string() }
    );

    let mut out = vec![T::default(); size as usize];
    with_thread_state(backend, |ts| {
        ts.memcpy(
            out.as_mut_ptr() as *mut u8,
            data as *const u8,
            size as usize * ty.size(),
        )
    })?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Gather / scatter
// ---------------------------------------------------------------------------

/// Pointer literal referencing another variable's buffer. The source is
/// parked in the reference-only dependency slot: it stays alive, but the
/// scheduler does not traverse into it.
fn pointer_to(source: &VarRef) -> Result<VarRef> {
    ensure_evaluated(source)?;
    let mut state = state::lock();
    let source_var = var::get(&state, source.index)?;
    let (backend, data) = (source_var.backend, source_var.data);

    let mut variable = Variable::new(backend, VarType::Pointer, 1);
    variable.literal = true;
    variable.value = data as u64;
    variable.dep[3] = source.index;
    var::inc_ref_int(&mut state, source.index)?;
    let index = var::insert(&mut state, variable);
    Ok(VarRef { index })
}

/// Effective mask: the user mask (or constant true) restricted by the top of
/// the thread state's mask stack.
fn effective_mask(backend: JitBackend, mask: Option<&VarRef>) -> Result<VarRef> {
    let user = match mask {
        Some(m) => {
            let (_, ty, _) = meta(m);
            ensure!(
                ty == VarType::Bool,
                InvalidArgumentSnafu { reason: "mask must be boolean".to_string() }
            );
            m.clone()
        }
        None => literal_bool(backend, true, 1)?,
    };

    let top = with_thread_state(backend, |ts| Ok(ts.mask_peek()))?;
    match top {
        Some(index) => {
            let stack_mask = VarRef::from_index(index)?;
            and(&user, &stack_mask)
        }
        None => Ok(user),
    }
}

/// Masked indexed load from an evaluated array.
pub fn gather(source: &VarRef, index: &VarRef, mask: Option<&VarRef>) -> Result<VarRef> {
    let (backend, ty, _) = meta(source);
    let pointer = pointer_to(source)?;
    let mask = effective_mask(backend, mask)?;
    let (_, index_ty, index_size) = meta(index);
    ensure!(
        index_ty == VarType::UInt32,
        UnsupportedTypeSnafu { type_name: index_ty.name(), primitive: "gather" }
    );
    let size = joint_size(&[index_size, mask.size()])?;
    let stmt = format!("gather.{} $r1, $r2, $r3", ty.name());
    new_stmt_var(backend, ty, size, stmt, &[&pointer, index, &mask])
}

/// Masked scatter (plain store) into an evaluated array.
pub fn scatter(target: &VarRef, value: &VarRef, index: &VarRef, mask: Option<&VarRef>) -> Result<()> {
    scatter_impl(target, value, index, mask, false)
}

/// Masked atomic scatter-reduction into an evaluated array.
pub fn scatter_reduce(
    op: ReduceOp,
    target: &VarRef,
    value: &VarRef,
    index: &VarRef,
    mask: Option<&VarRef>,
) -> Result<()> {
    ensure!(
        op == ReduceOp::Add,
        InvalidArgumentSnafu { reason: "only add scatter-reductions are supported".to_string() }
    );
    scatter_impl(target, value, index, mask, true)
}

fn scatter_impl(
    target: &VarRef,
    value: &VarRef,
    index: &VarRef,
    mask: Option<&VarRef>,
    reduce: bool,
) -> Result<()> {
    let (backend, ty, _) = meta(target);
    if reduce {
        ensure!(
            ty.is_integral() && ty.size() >= 4,
            UnsupportedTypeSnafu { type_name: ty.name(), primitive: "scatter_reduce" }
        );
    }
    let (_, value_ty, value_size) = meta(value);
    let (_, index_ty, index_size) = meta(index);
    ensure!(
        value_ty == ty,
        InvalidArgumentSnafu { reason: "scatter value type differs from target".to_string() }
    );
    ensure!(
        index_ty == VarType::UInt32,
        UnsupportedTypeSnafu { type_name: index_ty.name(), primitive: "scatter" }
    );

    let pointer = pointer_to(target)?;
    let mask = effective_mask(backend, mask)?;
    let size = joint_size(&[value_size, index_size, mask.size()])?;

    let mnemonic = if reduce { "scatter_add" } else { "scatter" };
    let stmt = format!("{mnemonic}.{} $r1, $r2, $r3, $r4", ty.name());
    let effect = new_stmt_var(backend, VarType::Void, size, stmt, &[&pointer, index, value, &mask])?;

    // Mark the target dirty until the side effect has executed.
    {
        let mut state = state::lock();
        var::get_mut(&mut state, target.index)?.ref_count_se += 1;

        let target_index = target.index;
        let entry = Extra {
            callback: Some(ExtraCallback::Internal(Box::new(move |state, _| {
                if let Some(t) = state.variables.get_mut(&target_index) {
                    t.ref_count_se = t.ref_count_se.saturating_sub(1);
                }
            }))),
            dep: Vec::new(),
        };
        state.extra.insert(effect.index, entry);
        let effect_var = var::get_mut(&mut state, effect.index)?;
        effect_var.extra = true;
        effect_var.side_effect = true;
    }

    // The queue owns the handle until the effect is evaluated.
    let index = effect.into_raw();
    with_thread_state(backend, |ts| {
        ts.side_effects.push(index);
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Mask stack and horizontal tests
// ---------------------------------------------------------------------------

pub fn mask_push(mask: &VarRef) -> Result<()> {
    let (backend, ty, _) = meta(mask);
    ensure!(
        ty == VarType::Bool,
        InvalidArgumentSnafu { reason: "mask must be boolean".to_string() }
    );
    with_thread_state(backend, |ts| ts.mask_push(mask.index()))
}

pub fn mask_pop(backend: JitBackend) -> Result<()> {
    with_thread_state(backend, |ts| ts.mask_pop())
}

/// True when any lane of the boolean array is set.
pub fn any(v: &VarRef) -> Result<bool> {
    bool_test(v, false)
}

/// True when every lane of the boolean array is set.
pub fn all(v: &VarRef) -> Result<bool> {
    bool_test(v, true)
}

fn bool_test(v: &VarRef, is_all: bool) -> Result<bool> {
    let (backend, ty, _) = meta(v);
    ensure!(
        ty == VarType::Bool,
        UnsupportedTypeSnafu { type_name: ty.name(), primitive: "any/all" }
    );
    ensure_evaluated(v)?;
    sync_thread(backend)?;

    let (size, data) = {
        let state = state::lock();
        let variable = var::get(&state, v.index)?;
        (variable.size, variable.data)
    };
    with_thread_state(backend, |ts| {
        if is_all {
            ts.all(data as *mut u8, size)
        } else {
            ts.any(data as *mut u8, size)
        }
    })
}
