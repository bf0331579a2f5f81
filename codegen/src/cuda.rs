//! CUDA lowering: kernel IR → CUDA C source for runtime compilation.
//!
//! The rendered kernel uses a grid-stride loop over the lane index. Up to
//! [`CUDA_ARG_LIMIT`](crate::CUDA_ARG_LIMIT) parameters are passed directly
//! (slot 0 carries the width); beyond that the signature collapses to a
//! single pointer into a staged device parameter buffer, mirroring the
//! launch layer's large-parameter path.

use std::fmt::Write;

use lanejit_dtype::VarType;
use snafu::ensure;

use crate::error::{Result, UnsupportedSnafu};
use crate::kir::{BinOp, CmpOp, Op, Program};
use crate::CUDA_ARG_LIMIT;

fn cty(ty: VarType) -> &'static str {
    ty.cuda_name()
}

fn literal(ty: VarType, bits: u64) -> Result<String> {
    Ok(match ty {
        VarType::Float32 => format!("__uint_as_float(0x{:x}u)", bits as u32),
        VarType::Float64 => format!("__longlong_as_double(0x{bits:x}ll)"),
        VarType::Float16 => format!("__ushort_as_half((unsigned short)0x{:x})", bits as u16),
        VarType::Bool => format!("(bool){}", (bits != 0) as u32),
        VarType::Void => {
            return UnsupportedSnafu { what: "void literal".to_string() }.fail();
        }
        _ => format!("({})0x{bits:x}ull", cty(ty)),
    })
}

fn bin_expr(op: BinOp, ty: VarType, a: &str, b: &str) -> Result<String> {
    if ty.is_float() {
        return Ok(match op {
            BinOp::Add => format!("{a} + {b}"),
            BinOp::Sub => format!("{a} - {b}"),
            BinOp::Mul => format!("{a} * {b}"),
            BinOp::Div => format!("{a} / {b}"),
            BinOp::Min if ty == VarType::Float32 => format!("fminf({a}, {b})"),
            BinOp::Max if ty == VarType::Float32 => format!("fmaxf({a}, {b})"),
            BinOp::Min => format!("fmin({a}, {b})"),
            BinOp::Max => format!("fmax({a}, {b})"),
            _ => {
                return UnsupportedSnafu { what: format!("{}.{}", op.name(), ty.name()) }.fail();
            }
        });
    }
    Ok(match op {
        BinOp::Add => format!("{a} + {b}"),
        BinOp::Sub => format!("{a} - {b}"),
        BinOp::Mul => format!("{a} * {b}"),
        BinOp::Div => format!("{a} / {b}"),
        BinOp::Min => format!("min({a}, {b})"),
        BinOp::Max => format!("max({a}, {b})"),
        BinOp::And => format!("{a} & {b}"),
        BinOp::Or => format!("{a} | {b}"),
        BinOp::Xor => format!("{a} ^ {b}"),
    })
}

fn cmp_expr(op: CmpOp, a: &str, b: &str) -> String {
    let sym = match op {
        CmpOp::Lt => "<",
        CmpOp::Le => "<=",
        CmpOp::Gt => ">",
        CmpOp::Ge => ">=",
        CmpOp::Eq => "==",
        CmpOp::Ne => "!=",
    };
    format!("{a} {sym} {b}")
}

/// Render a kernel into CUDA C.
pub fn render(program: &Program) -> Result<String> {
    let staged = program.param_count as usize > CUDA_ARG_LIMIT;
    let uses_f16 = program.body.iter().any(|inst| {
        matches!(
            inst.op.result_type(),
            Some(VarType::Float16)
        ) || matches!(inst.op, Op::Out { ty: VarType::Float16, .. })
    });

    let mut out = String::new();

    if uses_f16 {
        out.push_str("#include <cuda_fp16.h>\n\n");
    }
    if !program.prelude.is_empty() {
        out.push_str(&program.prelude);
        out.push('\n');
    }
    if !program.callables.is_empty() {
        out.push_str(&program.callables);
        out.push('\n');
    }

    if staged {
        let _ = writeln!(
            out,
            "extern \"C\" __global__ void {}(const unsigned long long *params) {{",
            program.name
        );
        out.push_str("    const unsigned int n = (unsigned int) params[0];\n");
        for slot in 1..program.param_count {
            let _ = writeln!(out, "    const unsigned long long a{slot} = params[{slot}];");
        }
    } else {
        // Every slot is one 8-byte word so the launch-parameter buffer maps
        // onto the signature directly; slot 0 carries the width.
        let _ = write!(out, "extern \"C\" __global__ void {}(unsigned long long n0", program.name);
        for slot in 1..program.param_count {
            let _ = write!(out, ", unsigned long long a{slot}");
        }
        out.push_str(") {\n");
        out.push_str("    const unsigned int n = (unsigned int) n0;\n");
    }

    // Loop-invariant values.
    for inst in &program.body {
        let dst = inst.dst.unwrap_or_default();
        match &inst.op {
            Op::InScalar { ty, slot } => {
                let _ = writeln!(
                    out,
                    "    const {t} r{dst} = ((const {t} *) (size_t) a{slot})[0];",
                    t = cty(*ty)
                );
            }
            Op::InPtr { slot } => {
                let _ = writeln!(out, "    const unsigned long long r{dst} = a{slot};");
            }
            Op::Const { ty, bits } => {
                let _ =
                    writeln!(out, "    const {} r{dst} = {};", cty(*ty), literal(*ty, *bits)?);
            }
            _ => {}
        }
    }

    out.push_str(
        "    const unsigned int stride = blockDim.x * gridDim.x;\n\
         \x20   for (unsigned int i = blockIdx.x * blockDim.x + threadIdx.x; i < n; i += stride) {\n",
    );

    for inst in &program.body {
        let dst = inst.dst.unwrap_or_default();
        match &inst.op {
            Op::InScalar { .. } | Op::InPtr { .. } | Op::Const { .. } => {}
            Op::In { ty, slot } => {
                let _ = writeln!(
                    out,
                    "        const {t} r{dst} = ((const {t} *) (size_t) a{slot})[i];",
                    t = cty(*ty)
                );
            }
            Op::Counter => {
                let _ = writeln!(out, "        const unsigned int r{dst} = i;");
            }
            Op::Bin { op, ty, a, b } => {
                let expr = bin_expr(*op, *ty, &format!("r{a}"), &format!("r{b}"))?;
                let _ = writeln!(out, "        const {} r{dst} = {expr};", cty(*ty));
            }
            Op::Not { ty, a } => {
                let expr =
                    if *ty == VarType::Bool { format!("!r{a}") } else { format!("~r{a}") };
                let _ = writeln!(out, "        const {} r{dst} = {expr};", cty(*ty));
            }
            Op::Cmp { op, a, b, .. } => {
                let expr = cmp_expr(*op, &format!("r{a}"), &format!("r{b}"));
                let _ = writeln!(out, "        const bool r{dst} = {expr};");
            }
            Op::Select { ty, mask, a, b } => {
                let _ = writeln!(
                    out,
                    "        const {} r{dst} = r{mask} ? r{a} : r{b};",
                    cty(*ty)
                );
            }
            Op::Cast { ty, a, .. } => {
                let _ = writeln!(out, "        const {t} r{dst} = ({t}) r{a};", t = cty(*ty));
            }
            Op::Gather { ty, ptr, index, mask } => {
                let t = cty(*ty);
                let _ = writeln!(out, "        {t} r{dst} = ({t}) 0;");
                let _ = writeln!(
                    out,
                    "        if (r{mask}) r{dst} = ((const {t} *) (size_t) r{ptr})[r{index}];"
                );
            }
            Op::Scatter { ty, reduce, ptr, index, value, mask } => {
                let t = cty(*ty);
                if *reduce {
                    ensure!(
                        ty.size() >= 4 && *ty != VarType::Pointer,
                        UnsupportedSnafu {
                            what: format!("scatter_add.{} on the CUDA backend", ty.name()),
                        }
                    );
                    let _ = writeln!(
                        out,
                        "        if (r{mask}) atomicAdd(({t} *) (size_t) r{ptr} + r{index}, r{value});"
                    );
                } else {
                    let _ = writeln!(
                        out,
                        "        if (r{mask}) (({t} *) (size_t) r{ptr})[r{index}] = r{value};"
                    );
                }
            }
            Op::Out { ty, slot, value } => {
                let _ = writeln!(
                    out,
                    "        (({t} *) (size_t) a{slot})[i] = r{value};",
                    t = cty(*ty)
                );
            }
        }
    }

    out.push_str("    }\n}\n");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kir;

    #[test]
    fn renders_direct_signature() {
        let text = "\
kernel lanejit_deadbeef cuda params=3
    r4 = in.u32 p1
    r5 = counter.u32
    r6 = add.u32 r4, r5
    out.u32 p2, r6
";
        let src = render(&kir::parse(text).unwrap()).unwrap();
        assert!(src.contains(
            "extern \"C\" __global__ void lanejit_deadbeef(unsigned long long n0, unsigned long long a1, unsigned long long a2)"
        ));
        assert!(src.contains("for (unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;"));
        assert!(src.contains("((unsigned int *) (size_t) a2)[i] = r6;"));
    }

    #[test]
    fn scatter_add_uses_atomics() {
        let text = "\
kernel lanejit_feed cuda params=3
    r1 = in.ptr p1
    r2 = counter.u32
    r3 = const.u32 0x1
    r4 = const.bool 0x1
    scatter_add.u32 r1, r2, r3, r4
    out.u32 p2, r2
";
        let src = render(&kir::parse(text).unwrap()).unwrap();
        assert!(src.contains("atomicAdd((unsigned int *) (size_t) r1 + r2, r3);"));
    }

    #[test]
    fn sub_word_atomics_are_rejected() {
        let text = "\
kernel lanejit_bad cuda params=3
    r1 = in.ptr p1
    r2 = counter.u32
    r3 = const.u8 0x1
    r4 = const.bool 0x1
    scatter_add.u8 r1, r2, r3, r4
    out.u32 p2, r2
";
        assert!(render(&kir::parse(text).unwrap()).is_err());
    }
}
