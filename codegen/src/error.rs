//! Error types for IR parsing and lowering.

use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// A line of kernel IR did not parse.
    #[snafu(display("malformed kernel IR at line {line}: {reason}"))]
    Parse { line: usize, reason: String },

    /// The operation exists but the target backend cannot lower it.
    #[snafu(display("unsupported operation for this backend: {what}"))]
    Unsupported { what: String },

    /// An instruction referenced a register that has not been defined.
    #[snafu(display("kernel IR references undefined register r{register}"))]
    UndefinedRegister { register: u32 },

    /// JIT compilation of the lowered function failed.
    #[snafu(display("kernel compilation failed: {reason}"))]
    Compilation { reason: String },
}
