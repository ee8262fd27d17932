use thiserror::Error;

use crate::config::ConfigError;
use crate::flash::FlashError;
use crate::recording::RecordingError;
use crate::storage::StorageError;

/// Aggregate error type for callers that cross module boundaries (the
/// CLI binary, primarily); library code returns the narrower per-module
/// error enums directly.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Flash(#[from] FlashError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Recording(#[from] RecordingError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
