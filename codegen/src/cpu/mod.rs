//! CPU lowering: kernel IR → native code through a cranelift `JITModule`.
//!
//! The compiled entry point has the worker-slice signature
//! `fn(start: u32, end: u32, params: *const *mut u8)`: the launch layer
//! splits the total width into blocks and every pool worker runs the lane
//! range it was handed. Loop-invariant work (parameter pointer loads, scalar
//! broadcasts, literals) is hoisted into the entry block; the lane loop
//! covers `start..end`.

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::immediates::{Ieee32, Ieee64};
use cranelift_codegen::ir::instructions::BlockArg;
use cranelift_codegen::ir::{types, AtomicRmwOp, InstBuilder, MemFlags, Type, Value};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, Linkage, Module};
use rustc_hash::FxHashMap;
use snafu::{ensure, OptionExt};

use lanejit_dtype::VarType;

use crate::error::{CompilationSnafu, Result, UndefinedRegisterSnafu, UnsupportedSnafu};
use crate::kir::{BinOp, CmpOp, Inst, Op, Program};

/// Signature of a compiled CPU kernel.
pub type KernelFn = unsafe extern "C" fn(u32, u32, *const *mut u8);

/// A relocated CPU kernel. The `JITModule` owns the executable pages and must
/// stay alive as long as the entry pointer is in use; cached kernels are kept
/// until process teardown.
pub struct CpuKernel {
    #[allow(dead_code)]
    module: JITModule,
    entry: *const u8,
    name: String,
}

// SAFETY: the entry pointer targets read-only relocated code owned by
// `module`; concurrent calls from pool workers are safe.
unsafe impl Send for CpuKernel {}
unsafe impl Sync for CpuKernel {}

impl CpuKernel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> KernelFn {
        unsafe { std::mem::transmute::<*const u8, KernelFn>(self.entry) }
    }
}

impl std::fmt::Debug for CpuKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuKernel").field("name", &self.name).finish()
    }
}

fn clif_type(ty: VarType) -> Result<Type> {
    Ok(match ty {
        VarType::Bool | VarType::Int8 | VarType::UInt8 => types::I8,
        VarType::Int16 | VarType::UInt16 => types::I16,
        VarType::Int32 | VarType::UInt32 => types::I32,
        VarType::Int64 | VarType::UInt64 | VarType::Pointer => types::I64,
        VarType::Float32 => types::F32,
        VarType::Float64 => types::F64,
        VarType::Float16 | VarType::Void => {
            return UnsupportedSnafu { what: format!("{} lanes in a CPU kernel", ty.name()) }
                .fail()
        }
    })
}

/// Compile a parsed kernel into native code.
pub fn compile(program: &Program) -> Result<CpuKernel> {
    ensure!(
        program.callables.trim().is_empty(),
        UnsupportedSnafu { what: "callable sub-kernels on the CPU backend".to_string() }
    );

    let mut flag_builder = settings::builder();
    for (flag, value) in
        [("opt_level", "speed"), ("use_colocated_libcalls", "false"), ("is_pic", "false")]
    {
        flag_builder
            .set(flag, value)
            .map_err(|e| CompilationSnafu { reason: format!("isa flag {flag}: {e}") }.build())?;
    }
    let isa = cranelift_native::builder()
        .map_err(|e| CompilationSnafu { reason: format!("native isa: {e}") }.build())?
        .finish(settings::Flags::new(flag_builder))
        .map_err(|e| CompilationSnafu { reason: format!("isa: {e}") }.build())?;

    let mut module = JITModule::new(JITBuilder::with_isa(isa, default_libcall_names()));

    let mut sig = module.make_signature();
    sig.params.push(cranelift_codegen::ir::AbiParam::new(types::I32));
    sig.params.push(cranelift_codegen::ir::AbiParam::new(types::I32));
    sig.params.push(cranelift_codegen::ir::AbiParam::new(types::I64));

    let func_id = module
        .declare_function(&program.name, Linkage::Export, &sig)
        .map_err(|e| CompilationSnafu { reason: format!("declare: {e}") }.build())?;

    let mut ctx = module.make_context();
    ctx.func.signature = sig;

    let mut fb_ctx = FunctionBuilderContext::new();
    {
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fb_ctx);
        lower(program, &mut builder)?;
        builder.seal_all_blocks();
        builder.finalize();
    }

    module
        .define_function(func_id, &mut ctx)
        .map_err(|e| CompilationSnafu { reason: format!("define: {e}") }.build())?;
    module.clear_context(&mut ctx);
    module
        .finalize_definitions()
        .map_err(|e| CompilationSnafu { reason: format!("finalize: {e}") }.build())?;

    let entry = module.get_finalized_function(func_id);
    tracing::trace!(kernel.name = %program.name, "compiled CPU kernel");

    Ok(CpuKernel { module, entry, name: program.name.clone() })
}

struct Lowering<'a, 'b> {
    builder: &'a mut FunctionBuilder<'b>,
    regs: FxHashMap<u32, Value>,
    /// Pointer value loaded from each referenced parameter slot.
    slots: FxHashMap<u32, Value>,
}

impl Lowering<'_, '_> {
    fn reg(&self, r: u32) -> Result<Value> {
        self.regs.get(&r).copied().context(UndefinedRegisterSnafu { register: r })
    }

    fn lane_addr(&mut self, base: Value, idx64: Value, ty: VarType) -> Value {
        let off = self.builder.ins().imul_imm(idx64, ty.size() as i64);
        self.builder.ins().iadd(base, off)
    }

    fn const_value(&mut self, ty: VarType, bits: u64) -> Result<Value> {
        Ok(match ty {
            VarType::Float32 => self.builder.ins().f32const(Ieee32::with_bits(bits as u32)),
            VarType::Float64 => self.builder.ins().f64const(Ieee64::with_bits(bits)),
            VarType::Bool | VarType::Int8 | VarType::UInt8 => {
                self.builder.ins().iconst(types::I8, (bits as u8 as i8) as i64)
            }
            VarType::Int16 | VarType::UInt16 => {
                self.builder.ins().iconst(types::I16, (bits as u16 as i16) as i64)
            }
            VarType::Int32 | VarType::UInt32 => {
                self.builder.ins().iconst(types::I32, (bits as u32 as i32) as i64)
            }
            VarType::Int64 | VarType::UInt64 | VarType::Pointer => {
                self.builder.ins().iconst(types::I64, bits as i64)
            }
            _ => {
                return UnsupportedSnafu { what: format!("{} literal", ty.name()) }.fail();
            }
        })
    }

    fn emit_bin(&mut self, op: BinOp, ty: VarType, a: Value, b: Value) -> Result<Value> {
        if ty.is_float() {
            return Ok(match op {
                BinOp::Add => self.builder.ins().fadd(a, b),
                BinOp::Sub => self.builder.ins().fsub(a, b),
                BinOp::Mul => self.builder.ins().fmul(a, b),
                BinOp::Div => self.builder.ins().fdiv(a, b),
                BinOp::Min => self.builder.ins().fmin(a, b),
                BinOp::Max => self.builder.ins().fmax(a, b),
                _ => {
                    return UnsupportedSnafu {
                        what: format!("{}.{}", op.name(), ty.name()),
                    }
                    .fail()
                }
            });
        }
        let signed = ty.is_signed();
        Ok(match op {
            BinOp::Add => self.builder.ins().iadd(a, b),
            BinOp::Sub => self.builder.ins().isub(a, b),
            BinOp::Mul => self.builder.ins().imul(a, b),
            BinOp::Div if signed => self.builder.ins().sdiv(a, b),
            BinOp::Div => self.builder.ins().udiv(a, b),
            BinOp::Min if signed => self.builder.ins().smin(a, b),
            BinOp::Min => self.builder.ins().umin(a, b),
            BinOp::Max if signed => self.builder.ins().smax(a, b),
            BinOp::Max => self.builder.ins().umax(a, b),
            BinOp::And => self.builder.ins().band(a, b),
            BinOp::Or => self.builder.ins().bor(a, b),
            BinOp::Xor => self.builder.ins().bxor(a, b),
        })
    }

    fn emit_cmp(&mut self, op: CmpOp, ty: VarType, a: Value, b: Value) -> Result<Value> {
        if ty.is_float() {
            let cc = match op {
                CmpOp::Lt => FloatCC::LessThan,
                CmpOp::Le => FloatCC::LessThanOrEqual,
                CmpOp::Gt => FloatCC::GreaterThan,
                CmpOp::Ge => FloatCC::GreaterThanOrEqual,
                CmpOp::Eq => FloatCC::Equal,
                CmpOp::Ne => FloatCC::NotEqual,
            };
            return Ok(self.builder.ins().fcmp(cc, a, b));
        }
        let signed = ty.is_signed();
        let cc = match (op, signed) {
            (CmpOp::Lt, true) => IntCC::SignedLessThan,
            (CmpOp::Lt, false) => IntCC::UnsignedLessThan,
            (CmpOp::Le, true) => IntCC::SignedLessThanOrEqual,
            (CmpOp::Le, false) => IntCC::UnsignedLessThanOrEqual,
            (CmpOp::Gt, true) => IntCC::SignedGreaterThan,
            (CmpOp::Gt, false) => IntCC::UnsignedGreaterThan,
            (CmpOp::Ge, true) => IntCC::SignedGreaterThanOrEqual,
            (CmpOp::Ge, false) => IntCC::UnsignedGreaterThanOrEqual,
            (CmpOp::Eq, _) => IntCC::Equal,
            (CmpOp::Ne, _) => IntCC::NotEqual,
        };
        Ok(self.builder.ins().icmp(cc, a, b))
    }

    fn emit_cast(&mut self, dst: VarType, src: VarType, v: Value) -> Result<Value> {
        if dst == src {
            return Ok(v);
        }
        let dst_cl = clif_type(dst)?;
        let src_cl = clif_type(src)?;

        Ok(match (src.is_float(), dst.is_float()) {
            (true, true) => {
                if dst.size() > src.size() {
                    self.builder.ins().fpromote(dst_cl, v)
                } else {
                    self.builder.ins().fdemote(dst_cl, v)
                }
            }
            (false, true) => {
                // Sub-32-bit sources widen first; conversions take i32/i64.
                let wide = if src.size() < 4 {
                    if src.is_signed() {
                        self.builder.ins().sextend(types::I32, v)
                    } else {
                        self.builder.ins().uextend(types::I32, v)
                    }
                } else {
                    v
                };
                if src.is_signed() {
                    self.builder.ins().fcvt_from_sint(dst_cl, wide)
                } else {
                    self.builder.ins().fcvt_from_uint(dst_cl, wide)
                }
            }
            (true, false) => {
                let wide_ty = if dst.size() < 4 { types::I32 } else { dst_cl };
                let wide = if dst.is_signed() || dst == VarType::Bool {
                    self.builder.ins().fcvt_to_sint_sat(wide_ty, v)
                } else {
                    self.builder.ins().fcvt_to_uint_sat(wide_ty, v)
                };
                let narrowed =
                    if dst.size() < 4 { self.builder.ins().ireduce(dst_cl, wide) } else { wide };
                if dst == VarType::Bool {
                    self.builder.ins().icmp_imm(IntCC::NotEqual, narrowed, 0)
                } else {
                    narrowed
                }
            }
            (false, false) => {
                if dst == VarType::Bool {
                    self.builder.ins().icmp_imm(IntCC::NotEqual, v, 0)
                } else if dst.size() > src.size() {
                    if src.is_signed() {
                        self.builder.ins().sextend(dst_cl, v)
                    } else {
                        self.builder.ins().uextend(dst_cl, v)
                    }
                } else if dst.size() < src.size() {
                    self.builder.ins().ireduce(dst_cl, v)
                } else if dst_cl == src_cl {
                    v
                } else {
                    return UnsupportedSnafu {
                        what: format!("cast {} -> {}", src.name(), dst.name()),
                    }
                    .fail();
                }
            }
        })
    }
}

fn lower(program: &Program, builder: &mut FunctionBuilder<'_>) -> Result<()> {
    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);

    let start = builder.block_params(entry)[0];
    let end = builder.block_params(entry)[1];
    let params_ptr = builder.block_params(entry)[2];

    let mut lowering = Lowering { builder, regs: FxHashMap::default(), slots: FxHashMap::default() };

    // Hoist parameter pointer loads and loop-invariant values.
    let mut slot_order: Vec<u32> = Vec::new();
    for inst in &program.body {
        let slot = match inst.op {
            Op::In { slot, .. }
            | Op::InScalar { slot, .. }
            | Op::InPtr { slot }
            | Op::Out { slot, .. } => Some(slot),
            _ => None,
        };
        if let Some(slot) = slot {
            if !slot_order.contains(&slot) {
                slot_order.push(slot);
            }
        }
    }
    for slot in slot_order {
        let value = lowering.builder.ins().load(
            types::I64,
            MemFlags::trusted(),
            params_ptr,
            (slot as i32) * 8,
        );
        lowering.slots.insert(slot, value);
    }

    for inst in &program.body {
        match inst.op {
            Op::InScalar { ty, slot } => {
                let base = lowering.slots[&slot];
                let value =
                    lowering.builder.ins().load(clif_type(ty)?, MemFlags::trusted(), base, 0);
                lowering.regs.insert(inst.dst.unwrap_or_default(), value);
            }
            Op::InPtr { slot } => {
                let value = lowering.slots[&slot];
                lowering.regs.insert(inst.dst.unwrap_or_default(), value);
            }
            Op::Const { ty, bits } => {
                let value = lowering.const_value(ty, bits)?;
                lowering.regs.insert(inst.dst.unwrap_or_default(), value);
            }
            _ => {}
        }
    }

    let header = lowering.builder.create_block();
    let body = lowering.builder.create_block();
    let exit = lowering.builder.create_block();
    let lane = lowering.builder.append_block_param(header, types::I32);

    lowering.builder.ins().jump(header, &[BlockArg::Value(start)]);

    lowering.builder.switch_to_block(header);
    let keep = lowering.builder.ins().icmp(IntCC::UnsignedLessThan, lane, end);
    lowering.builder.ins().brif(keep, body, &[], exit, &[]);

    lowering.builder.switch_to_block(body);
    let idx64 = lowering.builder.ins().uextend(types::I64, lane);

    for inst in &program.body {
        match &inst.op {
            // Hoisted above.
            Op::InScalar { .. } | Op::InPtr { .. } | Op::Const { .. } => {}

            Op::In { ty, slot } => {
                let base = lowering.slots[slot];
                let addr = lowering.lane_addr(base, idx64, *ty);
                let value =
                    lowering.builder.ins().load(clif_type(*ty)?, MemFlags::trusted(), addr, 0);
                lowering.regs.insert(inst.dst.unwrap_or_default(), value);
            }
            Op::Counter => {
                lowering.regs.insert(inst.dst.unwrap_or_default(), lane);
            }
            Op::Bin { op, ty, a, b } => {
                let (a, b) = (lowering.reg(*a)?, lowering.reg(*b)?);
                let value = lowering.emit_bin(*op, *ty, a, b)?;
                lowering.regs.insert(inst.dst.unwrap_or_default(), value);
            }
            Op::Not { ty, a } => {
                let a = lowering.reg(*a)?;
                let value = if *ty == VarType::Bool {
                    lowering.builder.ins().bxor_imm(a, 1)
                } else {
                    lowering.builder.ins().bnot(a)
                };
                lowering.regs.insert(inst.dst.unwrap_or_default(), value);
            }
            Op::Cmp { op, ty, a, b } => {
                let (a, b) = (lowering.reg(*a)?, lowering.reg(*b)?);
                let value = lowering.emit_cmp(*op, *ty, a, b)?;
                lowering.regs.insert(inst.dst.unwrap_or_default(), value);
            }
            Op::Select { ty: _, mask, a, b } => {
                let mask = lowering.reg(*mask)?;
                let (a, b) = (lowering.reg(*a)?, lowering.reg(*b)?);
                let value = lowering.builder.ins().select(mask, a, b);
                lowering.regs.insert(inst.dst.unwrap_or_default(), value);
            }
            Op::Cast { ty, src_ty, a } => {
                let a = lowering.reg(*a)?;
                let value = lowering.emit_cast(*ty, *src_ty, a)?;
                lowering.regs.insert(inst.dst.unwrap_or_default(), value);
            }
            Op::Gather { ty, ptr, index, mask } => {
                let base = lowering.reg(*ptr)?;
                let index = lowering.reg(*index)?;
                let mask = lowering.reg(*mask)?;
                let zero = lowering.const_value(*ty, 0)?;

                let load_blk = lowering.builder.create_block();
                let cont_blk = lowering.builder.create_block();
                let merged = lowering.builder.append_block_param(cont_blk, clif_type(*ty)?);

                lowering.builder.ins().brif(
                    mask,
                    load_blk,
                    &[],
                    cont_blk,
                    &[BlockArg::Value(zero)],
                );

                lowering.builder.switch_to_block(load_blk);
                let idx = lowering.builder.ins().uextend(types::I64, index);
                let addr = lowering.lane_addr(base, idx, *ty);
                let value =
                    lowering.builder.ins().load(clif_type(*ty)?, MemFlags::trusted(), addr, 0);
                lowering.builder.ins().jump(cont_blk, &[BlockArg::Value(value)]);

                lowering.builder.switch_to_block(cont_blk);
                lowering.regs.insert(inst.dst.unwrap_or_default(), merged);
            }
            Op::Scatter { ty, reduce, ptr, index, value, mask } => {
                if *reduce {
                    ensure!(
                        ty.is_integral(),
                        UnsupportedSnafu {
                            what: format!("scatter_add.{} on the CPU backend", ty.name()),
                        }
                    );
                }
                let base = lowering.reg(*ptr)?;
                let index = lowering.reg(*index)?;
                let value = lowering.reg(*value)?;
                let mask = lowering.reg(*mask)?;

                let store_blk = lowering.builder.create_block();
                let cont_blk = lowering.builder.create_block();
                lowering.builder.ins().brif(mask, store_blk, &[], cont_blk, &[]);

                lowering.builder.switch_to_block(store_blk);
                let idx = lowering.builder.ins().uextend(types::I64, index);
                let addr = lowering.lane_addr(base, idx, *ty);
                if *reduce {
                    lowering.builder.ins().atomic_rmw(
                        clif_type(*ty)?,
                        MemFlags::trusted(),
                        AtomicRmwOp::Add,
                        addr,
                        value,
                    );
                } else {
                    lowering.builder.ins().store(MemFlags::trusted(), value, addr, 0);
                }
                lowering.builder.ins().jump(cont_blk, &[]);

                lowering.builder.switch_to_block(cont_blk);
            }
            Op::Out { ty, slot, value } => {
                let base = lowering.slots[slot];
                let value = lowering.reg(*value)?;
                let addr = lowering.lane_addr(base, idx64, *ty);
                lowering.builder.ins().store(MemFlags::trusted(), value, addr, 0);
            }
        }
    }

    let next = lowering.builder.ins().iadd_imm(lane, 1);
    lowering.builder.ins().jump(header, &[BlockArg::Value(next)]);

    lowering.builder.switch_to_block(exit);
    lowering.builder.ins().return_(&[]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kir;

    fn run(kernel: &CpuKernel, size: u32, params: &[*mut u8]) {
        unsafe { kernel.entry()(0, size, params.as_ptr()) }
    }

    #[test]
    fn arithmetic_kernel() {
        // out[i] = in[i] * 2 + i
        let text = "\
kernel k_arith cpu params=5
    r1 = in.u32 p3
    r2 = const.u32 0x2
    r3 = counter.u32
    r4 = mul.u32 r1, r2
    r5 = add.u32 r4, r3
    out.u32 p4, r5
";
        let program = kir::parse(text).unwrap();
        let kernel = compile(&program).unwrap();

        let input: Vec<u32> = (0..16).map(|i| i + 10).collect();
        let mut output = vec![0u32; 16];
        let params: Vec<*mut u8> = vec![
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            input.as_ptr() as *mut u8,
            output.as_mut_ptr() as *mut u8,
        ];
        run(&kernel, 16, &params);

        for i in 0..16u32 {
            assert_eq!(output[i as usize], (i + 10) * 2 + i);
        }
    }

    #[test]
    fn float_select_and_cast() {
        // out[i] = (i < 4) ? f32(i) : 100.0
        let text = "\
kernel k_select cpu params=4
    r1 = counter.u32
    r2 = const.u32 0x4
    r3 = lt.u32 r1, r2
    r4 = cast.f32.u32 r1
    r5 = const.f32 0x42c80000
    r6 = select.f32 r3, r4, r5
    out.f32 p3, r6
";
        let program = kir::parse(text).unwrap();
        let kernel = compile(&program).unwrap();

        let mut output = vec![0f32; 8];
        let params: Vec<*mut u8> = vec![
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            output.as_mut_ptr() as *mut u8,
        ];
        run(&kernel, 8, &params);

        assert_eq!(output, vec![0.0, 1.0, 2.0, 3.0, 100.0, 100.0, 100.0, 100.0]);
    }

    #[test]
    fn masked_scatter_add() {
        // for i in 0..size: if i < 6 { target[i % 3] += 1 }
        let text = "\
kernel k_scatter cpu params=5
    r1 = in.ptr p3
    r2 = counter.u32
    r3 = const.u32 0x6
    r4 = lt.u32 r2, r3
    r5 = const.u32 0x3
    r6 = div.u32 r2, r5
    r7 = mul.u32 r6, r5
    r8 = sub.u32 r2, r7
    r9 = const.u32 0x1
    scatter_add.u32 r1, r8, r9, r4
    out.u32 p4, r2
";
        let program = kir::parse(text).unwrap();
        let kernel = compile(&program).unwrap();

        let mut target = vec![0u32; 3];
        let mut output = vec![0u32; 12];
        let params: Vec<*mut u8> = vec![
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            // The slot stores the pointer value itself for in.ptr.
            target.as_mut_ptr() as *mut u8,
            output.as_mut_ptr() as *mut u8,
        ];
        run(&kernel, 12, &params);

        assert_eq!(target, vec![2, 2, 2]);
        assert_eq!(output[11], 11);
    }

    #[test]
    fn gather_with_mask() {
        // out[i] = (i < 4) ? table[i] : 0
        let text = "\
kernel k_gather cpu params=5
    r1 = in.ptr p3
    r2 = counter.u32
    r3 = const.u32 0x4
    r4 = lt.u32 r2, r3
    r5 = gather.u32 r1, r2, r4
    out.u32 p4, r5
";
        let program = kir::parse(text).unwrap();
        let kernel = compile(&program).unwrap();

        let table: Vec<u32> = vec![7, 8, 9, 10];
        let mut output = vec![u32::MAX; 8];
        let params: Vec<*mut u8> = vec![
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            table.as_ptr() as *mut u8,
            output.as_mut_ptr() as *mut u8,
        ];
        run(&kernel, 8, &params);

        assert_eq!(output, vec![7, 8, 9, 10, 0, 0, 0, 0]);
    }

    #[test]
    fn scalar_broadcast() {
        // out[i] = scalar + i
        let text = "\
kernel k_scalar cpu params=5
    r1 = in.scalar.u32 p3
    r2 = counter.u32
    r3 = add.u32 r1, r2
    out.u32 p4, r3
";
        let program = kir::parse(text).unwrap();
        let kernel = compile(&program).unwrap();

        let scalar = [1000u32];
        let mut output = vec![0u32; 4];
        let params: Vec<*mut u8> = vec![
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            scalar.as_ptr() as *mut u8,
            output.as_mut_ptr() as *mut u8,
        ];
        run(&kernel, 4, &params);

        assert_eq!(output, vec![1000, 1001, 1002, 1003]);
    }
}
