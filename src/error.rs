use thiserror::Error;
use windows::Win32::Foundation::WIN32_ERROR;

/// Reasons a PE file can be rejected during parsing.
#[derive(Debug, Error)]
pub enum PeError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid PE format")]
    InvalidPeFormat,

    #[error("unsupported machine type (only AMD64 images are accepted)")]
    NotSupportedMachine,
}

/// Reasons a mapping attempt can fail. Any of these means no module was
/// produced and every resource acquired along the way has been released.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("mapped image failed validation: {0}")]
    BadImage(#[from] PeError),

    #[error("unable to reserve virtual memory for the image")]
    OutOfMemory,

    #[error("section data lies outside the file or the reserved region")]
    Truncated,

    #[error("imported symbol could not be resolved")]
    ProcNotFound,

    #[error("system error: {0:?}")]
    SystemError(WIN32_ERROR),
}

pub type Result<T> = std::result::Result<T, LoadError>;
