//! Byte-level output seam for encoders.

use std::io;

/// Destination for encoded bytes.
///
/// The conversion pipeline hands the encoder a sink that appends into the
/// file-backed conversion buffer; the sink side decides whether writes
/// actually land (header generation temporarily swallows encoder output).
/// Sinks take `&self`: they are shared with the reader side of the buffer.
pub trait ByteSink: Send + Sync {
    /// Write all of `data`.
    fn write_bytes(&self, data: &[u8]) -> io::Result<()>;
}
