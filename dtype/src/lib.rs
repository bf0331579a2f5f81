//! Scalar type tags and reduction operators shared by every lanejit crate.

/// Compute backend selector.
///
/// `Cuda` issues compiled device kernels through the driver API; `Cpu` issues
/// JIT-compiled kernels through the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::EnumCount, strum::FromRepr)]
#[repr(u8)]
pub enum JitBackend {
    Cuda = 0,
    Cpu = 1,
}

impl JitBackend {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::Cpu => "cpu",
        }
    }
}

/// Type tag of a traced variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::EnumCount, strum::EnumIter, strum::FromRepr)]
#[repr(u8)]
pub enum VarType {
    Void = 0,
    Bool = 1,

    Int8 = 2,
    UInt8 = 3,
    Int16 = 4,
    UInt16 = 5,
    Int32 = 6,
    UInt32 = 7,
    Int64 = 8,
    UInt64 = 9,

    Float16 = 10,
    Float32 = 11,
    Float64 = 12,

    /// Raw device pointer (always materialized as a 64-bit value).
    Pointer = 13,
}

impl VarType {
    /// Size of one element in bytes.
    pub const fn size(&self) -> usize {
        match self {
            Self::Void => 0,
            Self::Bool | Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 | Self::Float16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 | Self::Pointer => 8,
        }
    }

    /// Short name as it appears in kernel IR text (`add.u32`, `out.f64`, ..).
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Bool => "bool",
            Self::Int8 => "i8",
            Self::UInt8 => "u8",
            Self::Int16 => "i16",
            Self::UInt16 => "u16",
            Self::Int32 => "i32",
            Self::UInt32 => "u32",
            Self::Int64 => "i64",
            Self::UInt64 => "u64",
            Self::Float16 => "f16",
            Self::Float32 => "f32",
            Self::Float64 => "f64",
            Self::Pointer => "ptr",
        }
    }

    /// CUDA C spelling of the element type.
    pub const fn cuda_name(&self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Bool => "bool",
            Self::Int8 => "signed char",
            Self::UInt8 => "unsigned char",
            Self::Int16 => "short",
            Self::UInt16 => "unsigned short",
            Self::Int32 => "int",
            Self::UInt32 => "unsigned int",
            Self::Int64 => "long long",
            Self::UInt64 => "unsigned long long",
            Self::Float16 => "__half",
            Self::Float32 => "float",
            Self::Float64 => "double",
            Self::Pointer => "unsigned long long",
        }
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Float16 | Self::Float32 | Self::Float64)
    }

    pub const fn is_signed(&self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    pub const fn is_unsigned(&self) -> bool {
        matches!(
            self,
            Self::Bool | Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64 | Self::Pointer
        )
    }

    pub const fn is_integral(&self) -> bool {
        self.is_signed() || self.is_unsigned()
    }

    /// Map signed integer tags to their unsigned counterpart.
    ///
    /// Block copy/sum and the prefix sum treat signed and unsigned lanes
    /// identically, which lets them share kernel variants.
    pub const fn make_unsigned(&self) -> Self {
        match self {
            Self::Int8 => Self::UInt8,
            Self::Int16 => Self::UInt16,
            Self::Int32 => Self::UInt32,
            Self::Int64 => Self::UInt64,
            other => *other,
        }
    }

    /// Parse the short IR spelling back into a tag.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "void" => Self::Void,
            "bool" => Self::Bool,
            "i8" => Self::Int8,
            "u8" => Self::UInt8,
            "i16" => Self::Int16,
            "u16" => Self::UInt16,
            "i32" => Self::Int32,
            "u32" => Self::UInt32,
            "i64" => Self::Int64,
            "u64" => Self::UInt64,
            "f16" => Self::Float16,
            "f32" => Self::Float32,
            "f64" => Self::Float64,
            "ptr" => Self::Pointer,
            _ => return None,
        })
    }
}

/// Horizontal reduction operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::EnumCount, strum::EnumIter, strum::FromRepr)]
#[repr(u8)]
pub enum ReduceOp {
    Add = 0,
    Mul = 1,
    Min = 2,
    Max = 3,
    And = 4,
    Or = 5,
}

impl ReduceOp {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Add => "sum",
            Self::Mul => "mul",
            Self::Min => "min",
            Self::Max => "max",
            Self::And => "and",
            Self::Or => "or",
        }
    }
}

/// Coarse classification of a launched kernel, used by the kernel history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelType {
    /// Fused kernel produced by the evaluator.
    Jit,
    /// Horizontal reduction.
    Reduce,
    /// Permutation/compaction machinery.
    CallReduce,
    /// Everything else (fills, copies, scans, ..).
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(VarType::Bool, 1)]
    #[test_case(VarType::UInt16, 2)]
    #[test_case(VarType::Float32, 4)]
    #[test_case(VarType::Pointer, 8)]
    fn type_sizes(ty: VarType, size: usize) {
        assert_eq!(ty.size(), size);
    }

    #[test]
    fn name_round_trip() {
        use strum::IntoEnumIterator;
        for ty in VarType::iter() {
            assert_eq!(VarType::from_name(ty.name()), Some(ty));
        }
    }

    #[test]
    fn unsigned_mapping() {
        assert_eq!(VarType::Int32.make_unsigned(), VarType::UInt32);
        assert_eq!(VarType::Float64.make_unsigned(), VarType::Float64);
        assert!(VarType::Pointer.is_unsigned());
        assert!(!VarType::Float16.is_integral());
    }
}
