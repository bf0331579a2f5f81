//! Error types for the device layer.

use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Caller passed an argument outside the supported domain.
    #[snafu(display("invalid argument: {reason}"))]
    InvalidArgument { reason: String },

    /// Host or device memory allocation failed.
    #[snafu(display("allocation of {size} byte(s) ({kind:?}) failed"))]
    AllocationFailed { size: usize, kind: crate::alloc::AllocType },

    /// Attempt to release a pointer the allocator does not own.
    #[snafu(display("unknown allocation {ptr:#x}"))]
    UnknownAllocation { ptr: usize },

    /// A driver call returned a non-success status.
    #[snafu(display("driver error {code} ({name}) in {context}"))]
    Driver { code: i32, name: String, context: &'static str },

    /// The requested backend is not compiled into this build.
    #[snafu(display("backend {backend} is not available in this build"))]
    BackendUnavailable { backend: &'static str },
}
