//! Engine setup errors.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while assembling the filesystem engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The underlying directory does not exist or is not a directory.
    #[error("underlying directory '{0}' is not a directory")]
    BadUnderlyingDir(PathBuf),

    /// A filter configuration directory is unusable.
    #[error("config directory '{0}' is not a directory")]
    BadConfigDir(PathBuf),

    /// Filter configuration directories must be siblings under one base.
    #[error("config directory '{dir}' is not under the common base '{base}'")]
    ConfigDirMismatch {
        /// The offending directory.
        dir: PathBuf,
        /// The base established by the first configured directory.
        base: PathBuf,
    },

    /// Plain I/O failure during setup.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
