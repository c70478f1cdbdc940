//! Error types for dispatcher construction and patching.
//!
//! Every variant describes a violated precondition rather than a transient
//! fault, so none of them is retried internally.

use thiserror::Error;

/// Coarse error code, one per failure family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BranchTargetOutOfBounds,
    MultipleInstance,
    PagePermissions,
    InvalidDirection,
    InvalidTargets,
    UnsupportedPlatform,
}

impl ErrorKind {
    /// Long-form explanation shown by the CLI.
    pub fn describe(self) -> &'static str {
        match self {
            ErrorKind::BranchTargetOutOfBounds => {
                "a branch target is further from the trampoline than a relative jump can reach; \
                 move the target closer to the trampoline in the text segment"
            }
            ErrorKind::MultipleInstance => {
                "a dispatcher for this function signature already exists; two dispatchers \
                 would write to the same trampoline"
            }
            ErrorKind::PagePermissions => {
                "the host refused to change page protection for the trampoline"
            }
            ErrorKind::InvalidDirection => "the requested direction has no jump table entry",
            ErrorKind::InvalidTargets => "a dispatcher needs at least two branch targets",
            ErrorKind::UnsupportedPlatform => {
                "trampoline patching is not supported on this architecture or operating system"
            }
        }
    }
}

/// Errors surfaced by dispatcher construction and `set_direction`.
#[derive(Debug, Error)]
pub enum BranchError {
    #[error(
        "branch target {index} is out of bounds: displacement {offset:#x} exceeds +/-{limit:#x}"
    )]
    OutOfBounds { index: usize, offset: i64, limit: i64 },

    #[error("multiple instances of dispatcher for signature `{signature}`")]
    MultipleInstance { signature: &'static str },

    #[error("unable to change page permissions at {address:#x} (+{len})")]
    Permission {
        address: usize,
        len: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("direction {index} out of range for {len} branch targets")]
    DirectionOutOfRange { index: usize, len: usize },

    #[error("at least two branch targets are required, got {len}")]
    TooFewTargets { len: usize },

    #[error("trampoline patching is not supported on this platform")]
    UnsupportedPlatform,
}

impl BranchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BranchError::OutOfBounds { .. } => ErrorKind::BranchTargetOutOfBounds,
            BranchError::MultipleInstance { .. } => ErrorKind::MultipleInstance,
            BranchError::Permission { .. } => ErrorKind::PagePermissions,
            BranchError::DirectionOutOfRange { .. } => ErrorKind::InvalidDirection,
            BranchError::TooFewTargets { .. } => ErrorKind::InvalidTargets,
            BranchError::UnsupportedPlatform => ErrorKind::UnsupportedPlatform,
        }
    }
}

pub type BranchResult<T> = Result<T, BranchError>;
