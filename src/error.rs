use std::path::PathBuf;

use thiserror::Error;

/// Hard ceiling on the number of sequences the scaffolder will accept.
/// Pair indexing in the inter-link matrix is quadratic in this count.
pub const MAX_N_SEQ: usize = 45_000;

/// Errors raised by the scaffolding pipeline.
///
/// `NoMemory` and `InsufficientBands` abort the current scaffolding round
/// only; the driver moves on to the next (coarser) resolution. Everything
/// else is fatal.
#[derive(Debug, Error)]
pub enum ScafError {
    #[error("malformed input in {path}: {reason}")]
    InputFormat { path: PathBuf, reason: String },

    #[error("sequence number exceeds limit ({n} > {limit})")]
    InputSize { n: usize, limit: usize },

    #[error("estimated memory {required} bytes over budget {limit} bytes")]
    NoMemory { required: u64, limit: u64 },

    #[error("no enough bands for norm calculation ({got} < {need})")]
    InsufficientBands { got: usize, need: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ScafError {
    /// Process exit code for this error when it escapes the driver.
    pub fn exit_code(&self) -> i32 {
        match self {
            ScafError::InputFormat { .. } | ScafError::InputSize { .. } => 1,
            ScafError::InsufficientBands { .. } => 14,
            ScafError::NoMemory { .. } => 15,
            ScafError::Io(_) => 1,
        }
    }

    /// True for errors that end the current round but not the run.
    pub fn is_round_local(&self) -> bool {
        matches!(
            self,
            ScafError::NoMemory { .. } | ScafError::InsufficientBands { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ScafError>;

pub(crate) fn format_err(path: &std::path::Path, reason: impl Into<String>) -> ScafError {
    ScafError::InputFormat {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}
