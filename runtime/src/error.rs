//! Error types of the runtime crate.

use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Caller passed an argument outside the supported domain.
    #[snafu(display("invalid argument: {reason}"))]
    InvalidArgument { reason: String },

    /// A scheduled variable violates the evaluator's invariants.
    #[snafu(display("variable r{index} cannot be scheduled: {reason}"))]
    InvalidVariable { index: u32, reason: String },

    /// Lookup of a variable index that is not (or no longer) in the table.
    #[snafu(display("unknown variable r{index}"))]
    UnknownVariable { index: u32 },

    /// A primitive was asked for a kernel variant that does not exist.
    #[snafu(display("no kernel variant for {what}"))]
    MissingKernel { what: String },

    /// Type not supported by the requested primitive.
    #[snafu(display("type {type_name} is not supported by {primitive}"))]
    UnsupportedType { type_name: &'static str, primitive: &'static str },

    /// Kernel IR failed to parse or lower.
    #[snafu(display("codegen error: {source}"))]
    Codegen { source: lanejit_codegen::Error },

    /// Device-layer failure (driver call, allocation, pool).
    #[snafu(display("device error: {source}"))]
    Device { source: lanejit_device::Error },

    /// Inconsistent internal bookkeeping. Indicates a bug in the runtime.
    #[snafu(display("internal error: {reason}"))]
    Internal { reason: String },
}

impl From<lanejit_codegen::Error> for Error {
    fn from(source: lanejit_codegen::Error) -> Self {
        Error::Codegen { source }
    }
}

impl From<lanejit_device::Error> for Error {
    fn from(source: lanejit_device::Error) -> Self {
        Error::Device { source }
    }
}
