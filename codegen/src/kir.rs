//! The kernel IR text format.
//!
//! A kernel is a header line followed by one instruction per line:
//!
//! ```text
//! kernel lanejit_^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^ cpu params=5
//!     r4 = in.u32 p3
//!     r5 = const.f32 0x3f800000
//!     r6 = counter.u32
//!     r7 = add.u32 r4, r6
//!     r8 = lt.u32 r7, r5
//!     r9 = select.f32 r8, r5, r7
//!     scatter_add.u32 r2, r6, r7, r8
//!     out.f32 p4, r9
//! ```
//!
//! The 32-character `^` run in the kernel name is a placeholder that the
//! assembler overwrites with the hex rendering of the buffer's 128-bit hash.
//! Deduplicated globals precede the header and callables follow the body;
//! both are opaque text blocks to this module.
//!
//! Registers are assigned by the assembler and satisfy SSA ordering:
//! every operand register is defined on an earlier line. Parameter slots
//! (`p<K>`) index the kernel's pointer-array argument.

use lanejit_dtype::{JitBackend, VarType};
use snafu::OptionExt;

use crate::error::{ParseSnafu, Result};

/// Placeholder run inside a freshly assembled kernel name.
pub const NAME_PLACEHOLDER: &str = "^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^";

/// Kernel name prefix of fused kernels.
pub const KERNEL_PREFIX: &str = "lanejit_";

/// Kernel name prefix of callable sub-kernels.
pub const CALLABLE_PREFIX: &str = "func_";

/// Binary arithmetic / bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    And,
    Or,
    Xor,
}

impl BinOp {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Min => "min",
            Self::Max => "max",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
        }
    }
}

/// Comparison operators. The type suffix on the IR line is the operand type;
/// the result is always `bool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpOp {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::Eq => "eq",
            Self::Ne => "ne",
        }
    }
}

/// One kernel IR operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Lane-indexed load from the pointer in parameter slot `slot`.
    In { ty: VarType, slot: u32 },
    /// Loop-invariant scalar load (width-1 input).
    InScalar { ty: VarType, slot: u32 },
    /// Raw pointer value taken from parameter slot `slot`.
    InPtr { slot: u32 },
    /// Literal with an exact bit pattern.
    Const { ty: VarType, bits: u64 },
    /// Global lane index.
    Counter,
    Bin { op: BinOp, ty: VarType, a: u32, b: u32 },
    Not { ty: VarType, a: u32 },
    Cmp { op: CmpOp, ty: VarType, a: u32, b: u32 },
    Select { ty: VarType, mask: u32, a: u32, b: u32 },
    Cast { ty: VarType, src_ty: VarType, a: u32 },
    /// Masked indexed load through a pointer register; disabled lanes
    /// produce zero.
    Gather { ty: VarType, ptr: u32, index: u32, mask: u32 },
    /// Masked indexed store (or atomic reduction) through a pointer register.
    Scatter { ty: VarType, reduce: bool, ptr: u32, index: u32, value: u32, mask: u32 },
    /// Store an output lane to parameter slot `slot`.
    Out { ty: VarType, slot: u32, value: u32 },
}

impl Op {
    /// Result type of the operation, if it defines a register.
    pub fn result_type(&self) -> Option<VarType> {
        match self {
            Op::In { ty, .. } | Op::InScalar { ty, .. } | Op::Const { ty, .. } => Some(*ty),
            Op::InPtr { .. } => Some(VarType::Pointer),
            Op::Counter => Some(VarType::UInt32),
            Op::Bin { ty, .. } | Op::Not { ty, .. } => Some(*ty),
            Op::Cmp { .. } => Some(VarType::Bool),
            Op::Select { ty, .. } | Op::Cast { ty, .. } | Op::Gather { ty, .. } => Some(*ty),
            Op::Scatter { .. } | Op::Out { .. } => None,
        }
    }
}

/// One instruction: an optional destination register plus an operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub dst: Option<u32>,
    pub op: Op,
}

/// A parsed kernel.
#[derive(Debug, Clone)]
pub struct Program {
    pub name: String,
    pub backend: JitBackend,
    pub param_count: u32,
    pub body: Vec<Inst>,
    /// Verbatim text preceding the header (deduplicated globals).
    pub prelude: String,
    /// Verbatim text following the body (callable sub-kernels).
    pub callables: String,
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

impl Inst {
    /// Append the canonical text form of this instruction to `out`.
    pub fn write(&self, out: &mut String) {
        use std::fmt::Write;
        out.push_str("    ");
        if let Some(dst) = self.dst {
            let _ = write!(out, "r{dst} = ");
        }
        match &self.op {
            Op::In { ty, slot } => {
                let _ = write!(out, "in.{} p{slot}", ty.name());
            }
            Op::InScalar { ty, slot } => {
                let _ = write!(out, "in.scalar.{} p{slot}", ty.name());
            }
            Op::InPtr { slot } => {
                let _ = write!(out, "in.ptr p{slot}");
            }
            Op::Const { ty, bits } => {
                let _ = write!(out, "const.{} {bits:#x}", ty.name());
            }
            Op::Counter => {
                let _ = write!(out, "counter.u32");
            }
            Op::Bin { op, ty, a, b } => {
                let _ = write!(out, "{}.{} r{a}, r{b}", op.name(), ty.name());
            }
            Op::Not { ty, a } => {
                let _ = write!(out, "not.{} r{a}", ty.name());
            }
            Op::Cmp { op, ty, a, b } => {
                let _ = write!(out, "{}.{} r{a}, r{b}", op.name(), ty.name());
            }
            Op::Select { ty, mask, a, b } => {
                let _ = write!(out, "select.{} r{mask}, r{a}, r{b}", ty.name());
            }
            Op::Cast { ty, src_ty, a } => {
                let _ = write!(out, "cast.{}.{} r{a}", ty.name(), src_ty.name());
            }
            Op::Gather { ty, ptr, index, mask } => {
                let _ = write!(out, "gather.{} r{ptr}, r{index}, r{mask}", ty.name());
            }
            Op::Scatter { ty, reduce, ptr, index, value, mask } => {
                let mnemonic = if *reduce { "scatter_add" } else { "scatter" };
                let _ = write!(out, "{mnemonic}.{} r{ptr}, r{index}, r{value}, r{mask}", ty.name());
            }
            Op::Out { ty, slot, value } => {
                let _ = write!(out, "out.{} p{slot}, r{value}", ty.name());
            }
        }
        out.push('\n');
    }
}

/// Write the kernel header line.
pub fn write_header(out: &mut String, name: &str, backend: JitBackend, param_count: u32) {
    use std::fmt::Write;
    let _ = writeln!(out, "kernel {name} {} params={param_count}", backend.name());
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn parse_reg(tok: &str, line: usize) -> Result<u32> {
    tok.strip_prefix('r')
        .and_then(|s| s.parse().ok())
        .context(ParseSnafu { line, reason: format!("expected register, got `{tok}`") })
}

fn parse_slot(tok: &str, line: usize) -> Result<u32> {
    tok.strip_prefix('p')
        .and_then(|s| s.parse().ok())
        .context(ParseSnafu { line, reason: format!("expected parameter slot, got `{tok}`") })
}

fn parse_type(tok: &str, line: usize) -> Result<VarType> {
    VarType::from_name(tok).context(ParseSnafu { line, reason: format!("unknown type `{tok}`") })
}

/// Parse a full kernel IR buffer back into a [`Program`].
///
/// Text before the `kernel` header is collected verbatim as the prelude;
/// non-indented text after the body is collected as callables.
pub fn parse(text: &str) -> Result<Program> {
    let mut prelude = String::new();
    let mut callables = String::new();
    let mut header: Option<(String, JitBackend, u32)> = None;
    let mut body = Vec::new();
    let mut in_body = false;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim_end();
        if line.is_empty() {
            continue;
        }

        if header.is_none() {
            if let Some(rest) = line.strip_prefix("kernel ") {
                let mut parts = rest.split_whitespace();
                let name = parts
                    .next()
                    .context(ParseSnafu { line: line_no, reason: "missing kernel name" })?;
                let backend_tok = parts
                    .next()
                    .context(ParseSnafu { line: line_no, reason: "missing backend tag" })?;
                let backend = match backend_tok {
                    "cuda" => JitBackend::Cuda,
                    "cpu" => JitBackend::Cpu,
                    other => {
                        return ParseSnafu {
                            line: line_no,
                            reason: format!("unknown backend `{other}`"),
                        }
                        .fail()
                    }
                };
                let params = parts
                    .next()
                    .and_then(|p| p.strip_prefix("params="))
                    .and_then(|p| p.parse().ok())
                    .context(ParseSnafu { line: line_no, reason: "missing params count" })?;
                header = Some((name.to_string(), backend, params));
                in_body = true;
            } else {
                prelude.push_str(raw);
                prelude.push('\n');
            }
            continue;
        }

        if in_body && !raw.starts_with(' ') {
            // First non-indented line after the body starts the callables.
            in_body = false;
        }
        if !in_body {
            callables.push_str(raw);
            callables.push('\n');
            continue;
        }

        body.push(parse_inst(line.trim_start(), line_no)?);
    }

    let (name, backend, param_count) =
        header.context(ParseSnafu { line: 0usize, reason: "missing kernel header" })?;

    let program = Program { name, backend, param_count, body, prelude, callables };
    program.validate()?;
    Ok(program)
}

fn parse_inst(line: &str, line_no: usize) -> Result<Inst> {
    let (dst, rest) = match line.split_once(" = ") {
        Some((dst_tok, rest)) => (Some(parse_reg(dst_tok.trim(), line_no)?), rest.trim()),
        None => (None, line),
    };

    let (mnemonic, operands) = match rest.split_once(' ') {
        Some((m, o)) => (m, o.trim()),
        None => (rest, ""),
    };
    let ops: Vec<&str> = if operands.is_empty() {
        Vec::new()
    } else {
        operands.split(',').map(|s| s.trim()).collect()
    };
    let operand = |i: usize| -> Result<&str> {
        ops.get(i)
            .copied()
            .context(ParseSnafu { line: line_no, reason: format!("missing operand {i}") })
    };

    let mut parts = mnemonic.split('.');
    let base = parts
        .next()
        .context(ParseSnafu { line: line_no, reason: "empty mnemonic" })?;
    let suffixes: Vec<&str> = parts.collect();

    let one_suffix = |line: usize| -> Result<VarType> {
        let tok = suffixes
            .first()
            .context(ParseSnafu { line, reason: "missing type suffix" })?;
        parse_type(tok, line)
    };

    let op = match base {
        "in" => match suffixes.as_slice() {
            ["scalar", ty] => {
                Op::InScalar { ty: parse_type(ty, line_no)?, slot: parse_slot(operand(0)?, line_no)? }
            }
            ["ptr"] => Op::InPtr { slot: parse_slot(operand(0)?, line_no)? },
            [ty] => Op::In { ty: parse_type(ty, line_no)?, slot: parse_slot(operand(0)?, line_no)? },
            _ => {
                return ParseSnafu { line: line_no, reason: format!("bad input `{mnemonic}`") }
                    .fail()
            }
        },
        "const" => {
            let ty = one_suffix(line_no)?;
            let tok = ops
                .first()
                .context(ParseSnafu { line: line_no, reason: "missing literal value" })?;
            let bits = tok
                .strip_prefix("0x")
                .and_then(|s| u64::from_str_radix(s, 16).ok())
                .context(ParseSnafu { line: line_no, reason: format!("bad literal `{tok}`") })?;
            Op::Const { ty, bits }
        }
        "counter" => Op::Counter,
        "add" | "sub" | "mul" | "div" | "min" | "max" | "and" | "or" | "xor" => {
            let op = match base {
                "add" => BinOp::Add,
                "sub" => BinOp::Sub,
                "mul" => BinOp::Mul,
                "div" => BinOp::Div,
                "min" => BinOp::Min,
                "max" => BinOp::Max,
                "and" => BinOp::And,
                "or" => BinOp::Or,
                _ => BinOp::Xor,
            };
            Op::Bin {
                op,
                ty: one_suffix(line_no)?,
                a: parse_reg(operand(0)?, line_no)?,
                b: parse_reg(operand(1)?, line_no)?,
            }
        }
        "not" => Op::Not { ty: one_suffix(line_no)?, a: parse_reg(operand(0)?, line_no)? },
        "lt" | "le" | "gt" | "ge" | "eq" | "ne" => {
            let op = match base {
                "lt" => CmpOp::Lt,
                "le" => CmpOp::Le,
                "gt" => CmpOp::Gt,
                "ge" => CmpOp::Ge,
                "eq" => CmpOp::Eq,
                _ => CmpOp::Ne,
            };
            Op::Cmp {
                op,
                ty: one_suffix(line_no)?,
                a: parse_reg(operand(0)?, line_no)?,
                b: parse_reg(operand(1)?, line_no)?,
            }
        }
        "select" => Op::Select {
            ty: one_suffix(line_no)?,
            mask: parse_reg(operand(0)?, line_no)?,
            a: parse_reg(operand(1)?, line_no)?,
            b: parse_reg(operand(2)?, line_no)?,
        },
        "cast" => {
            let dst_tok = suffixes
                .first()
                .context(ParseSnafu { line: line_no, reason: "missing cast target type" })?;
            let src_tok = suffixes
                .get(1)
                .context(ParseSnafu { line: line_no, reason: "missing cast source type" })?;
            Op::Cast {
                ty: parse_type(dst_tok, line_no)?,
                src_ty: parse_type(src_tok, line_no)?,
                a: parse_reg(operand(0)?, line_no)?,
            }
        }
        "gather" => Op::Gather {
            ty: one_suffix(line_no)?,
            ptr: parse_reg(operand(0)?, line_no)?,
            index: parse_reg(operand(1)?, line_no)?,
            mask: parse_reg(operand(2)?, line_no)?,
        },
        "scatter" | "scatter_add" => Op::Scatter {
            ty: one_suffix(line_no)?,
            reduce: base == "scatter_add",
            ptr: parse_reg(operand(0)?, line_no)?,
            index: parse_reg(operand(1)?, line_no)?,
            value: parse_reg(operand(2)?, line_no)?,
            mask: parse_reg(operand(3)?, line_no)?,
        },
        "out" => Op::Out {
            ty: one_suffix(line_no)?,
            slot: parse_slot(operand(0)?, line_no)?,
            value: parse_reg(operand(1)?, line_no)?,
        },
        other => {
            return ParseSnafu { line: line_no, reason: format!("unknown mnemonic `{other}`") }
                .fail()
        }
    };

    Ok(Inst { dst, op })
}

impl Program {
    /// Check SSA ordering: every operand register must have been defined by
    /// an earlier instruction.
    pub fn validate(&self) -> Result<()> {
        use crate::error::UndefinedRegisterSnafu;
        let mut defined = rustc_hash::FxHashSet::default();
        for inst in &self.body {
            let mut check = |r: u32| {
                snafu::ensure!(defined.contains(&r), UndefinedRegisterSnafu { register: r });
                Ok(())
            };
            match &inst.op {
                Op::Bin { a, b, .. } | Op::Cmp { a, b, .. } => {
                    check(*a)?;
                    check(*b)?;
                }
                Op::Not { a, .. } | Op::Cast { a, .. } => check(*a)?,
                Op::Select { mask, a, b, .. } => {
                    check(*mask)?;
                    check(*a)?;
                    check(*b)?;
                }
                Op::Gather { ptr, index, mask, .. } => {
                    check(*ptr)?;
                    check(*index)?;
                    check(*mask)?;
                }
                Op::Scatter { ptr, index, value, mask, .. } => {
                    check(*ptr)?;
                    check(*index)?;
                    check(*value)?;
                    check(*mask)?;
                }
                Op::Out { value, .. } => check(*value)?,
                _ => {}
            }
            if let Some(dst) = inst.dst {
                defined.insert(dst);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
kernel lanejit_0123456789abcdef0123456789abcdef cpu params=5
    r1 = in.ptr p3
    r2 = in.u32 p4
    r3 = counter.u32
    r4 = const.u32 0x5
    r5 = add.u32 r2, r3
    r6 = lt.u32 r5, r4
    r7 = select.u32 r6, r4, r5
    scatter_add.u32 r1, r3, r7, r6
    out.u32 p4, r7
";

    #[test]
    fn round_trip() {
        let program = parse(SAMPLE).unwrap();
        assert_eq!(program.param_count, 5);
        assert_eq!(program.backend, JitBackend::Cpu);
        assert_eq!(program.body.len(), 9);

        let mut text = String::new();
        write_header(&mut text, &program.name, program.backend, program.param_count);
        for inst in &program.body {
            inst.write(&mut text);
        }
        assert_eq!(text, SAMPLE);
    }

    #[test]
    fn rejects_undefined_register() {
        let bad = "kernel lanejit_x cpu params=4\n    r2 = add.u32 r1, r1\n";
        assert!(parse(bad).is_err());
    }

    #[test]
    fn prelude_and_callables_are_preserved() {
        let text = format!("// helper\n{SAMPLE}func_abc:\n    ret\n");
        let program = parse(&text).unwrap();
        assert_eq!(program.prelude, "// helper\n");
        assert!(program.callables.starts_with("func_abc:"));
        assert_eq!(program.body.len(), 9);
    }
}
