use crate::{ErrorCodes, VecIndexError};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Validation error: {0}")]
pub struct OptionsValidationError(#[from] validator::ValidationErrors);

impl VecIndexError for OptionsValidationError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::InvalidArgument
    }
}
