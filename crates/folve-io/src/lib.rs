//! Codec layer for folve: detecting audio containers, decoding them into
//! interleaved `f32` frames, and re-encoding processed audio as a FLAC
//! stream written through a caller-provided byte sink.
//!
//! Decoding is symphonia-backed and uniform across FLAC, WAV and Ogg
//! Vorbis. Encoding is always FLAC: it is the only mainstream lossless
//! codec that can be produced strictly front-to-back, which the on-demand
//! conversion pipeline requires.

mod error;
mod flac;
mod format;
mod reader;
mod sink;

pub use error::AudioError;
pub use flac::{FlacSpec, FlacStreamWriter, FLAC_BLOCK_SIZE};
pub use format::{detect_format, SoundFormat};
pub use reader::{AudioFileReader, AudioInfo};
pub use sink::ByteSink;
