//! Error type for the codec layer.

use thiserror::Error;

/// Errors from detecting, decoding or encoding audio streams.
#[derive(Debug, Error)]
pub enum AudioError {
    /// The file is not one of the recognised audio containers.
    #[error("not a recognised sound file")]
    NotASoundFile,

    /// The container was recognised but the stream cannot be handled.
    #[error("unsupported audio stream: {0}")]
    Unsupported(String),

    /// The decoder failed on an open stream.
    #[error("decode error: {0}")]
    Decode(String),

    /// Encoding output could not be written.
    #[error("encode error: {0}")]
    Encode(#[source] std::io::Error),

    /// Plain I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
