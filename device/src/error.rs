use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Requested alignment is zero or not a power of two.
    #[snafu(display("invalid alignment {alignment}: must be a non-zero power of two"))]
    InvalidAlignment { alignment: usize },

    /// The allocator could not satisfy a request.
    #[snafu(display("allocation of {size} bytes (align {alignment}) failed on {allocator}: {reason}"))]
    AllocationFailed { allocator: String, size: usize, alignment: usize, reason: String },

    #[snafu(display("size mismatch: expected {expected}, got {actual}"))]
    SizeMismatch { expected: usize, actual: usize },
}
