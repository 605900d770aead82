//! DSP layer for folve: the partitioned FIR convolution engine, the filter
//! configuration format that describes impulse responses, and the
//! [`SoundProcessor`] that moves interleaved audio between a decoder and an
//! encoder in fixed-size fragments.
//!
//! The pieces are deliberately independent of any codec: audio enters and
//! leaves through the [`FrameReader`] / [`FrameWriter`] seams as interleaved
//! `f32` frames.

mod config;
mod convolver;
mod error;
mod frames;
mod pool;
mod processor;

pub use config::parse_config;
pub use convolver::Convolver;
pub use error::DspError;
pub use frames::{FrameReader, FrameWriter};
pub use pool::ProcessorPool;
pub use processor::SoundProcessor;
