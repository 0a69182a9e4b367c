// Error codes shared by every vecindex crate. They follow the gRPC status codes
// so that an embedding engine can map index failures onto its own protocol
// without inspecting concrete error types.
use std::error::Error;

#[cfg(feature = "validator")]
mod validator;
#[cfg(feature = "validator")]
pub use validator::*;

#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum ErrorCodes {
    // OK is returned on success, we use "Success" since Ok is a keyword in Rust.
    Success = 0,
    // CANCELLED indicates the operation was cancelled by the caller.
    Cancelled = 1,
    // UNKNOWN indicates an unknown error.
    Unknown = 2,
    // INVALID_ARGUMENT indicates the caller passed a malformed vector or option.
    InvalidArgument = 3,
    // NOT_FOUND means a partition or vector that was required does not exist.
    NotFound = 5,
    // FAILED_PRECONDITION indicates the index is not in the state required by the operation.
    FailedPrecondition = 9,
    // ABORTED indicates a transaction lost a race with a concurrent transaction and may be retried.
    Aborted = 10,
    // INTERNAL errors are broken invariants inside the index or the store.
    Internal = 13,
    // UNAVAILABLE indicates the store cannot currently serve requests.
    Unavailable = 14,
}

impl ErrorCodes {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCodes::Cancelled => "CancelledError",
            ErrorCodes::InvalidArgument => "InvalidArgumentError",
            ErrorCodes::NotFound => "NotFoundError",
            ErrorCodes::Aborted => "AbortedError",
            ErrorCodes::Internal => "InternalError",
            _ => "VecIndexError",
        }
    }

    /// Whether an operation that failed with this code can be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCodes::Aborted | ErrorCodes::Unavailable)
    }
}

pub trait VecIndexError: Error + Send + Sync {
    fn code(&self) -> ErrorCodes;
    fn boxed(self) -> Box<dyn VecIndexError>
    where
        Self: Sized + 'static,
    {
        Box::new(self)
    }
    fn should_trace_error(&self) -> bool {
        true
    }
}

impl Error for Box<dyn VecIndexError> {}

impl VecIndexError for Box<dyn VecIndexError> {
    fn code(&self) -> ErrorCodes {
        self.as_ref().code()
    }
}

impl VecIndexError for std::io::Error {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::Unknown
    }
}
