//! Error types for filter configuration and processor management.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from parsing filter configurations or creating processors.
#[derive(Debug, Error)]
pub enum DspError {
    /// The configuration file could not be read.
    #[error("failed to read filter config '{path}': {source}")]
    ReadConfig {
        /// Path of the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A line is neither blank, a comment, nor a command.
    #[error("{path}:{line}: syntax error")]
    Syntax {
        /// Path of the configuration file.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
    },

    /// The command word is not recognised.
    #[error("{path}:{line}: unknown command '{command}'")]
    UnknownCommand {
        /// Path of the configuration file.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// The offending command word.
        command: String,
    },

    /// A command has missing or malformed parameters.
    #[error("{path}:{line}: bad or missing parameters")]
    Parameters {
        /// Path of the configuration file.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
    },

    /// An impulse command appeared before `/convolver/new`.
    #[error("{path}:{line}: no convolver defined yet")]
    NoConvolver {
        /// Path of the configuration file.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
    },

    /// An input or output channel number is out of range.
    #[error("{path}:{line}: input or output number out of range")]
    ChannelRange {
        /// Path of the configuration file.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
    },

    /// `/convolver/new` parameters are outside the supported limits.
    #[error("{path}:{line}: convolver parameter out of range: {reason}")]
    ConvolverParams {
        /// Path of the configuration file.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// Which parameter and why.
        reason: String,
    },

    /// An impulse response file could not be opened or decoded.
    #[error("{path}:{line}: impulse file '{file}': {reason}")]
    ImpulseFile {
        /// Path of the configuration file.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// Path of the impulse file.
        file: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// No readable `filter-<rate>[-<channels>[-<bits>]].conf` exists.
    #[error("no filter config for {sample_rate}Hz/{channels}ch/{bits}bit under '{dir}'")]
    NoFilterForFormat {
        /// Sample rate of the audio file.
        sample_rate: u32,
        /// Channel count of the audio file.
        channels: usize,
        /// Bit depth of the audio file.
        bits: u32,
        /// Configuration directory that was searched.
        dir: PathBuf,
    },

    /// The configured convolver has fewer channels than the audio file.
    #[error("filter config '{path}' provides {found} channels, need {needed}")]
    ChannelMismatch {
        /// Path of the configuration file.
        path: PathBuf,
        /// Channels the convolver provides.
        found: usize,
        /// Channels the audio file needs.
        needed: usize,
    },

    /// Filesystem metadata for the configuration file was unavailable.
    #[error("failed to stat '{path}': {source}")]
    Stat {
        /// Path of the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}
