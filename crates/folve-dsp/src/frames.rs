//! Frame-level seams between the codec layer and the sound processor.
//!
//! Audio crosses these traits as interleaved `f32` frames (one frame =
//! one sample per channel). Codec-backed implementations live in the I/O
//! layer; the DSP layer only ever sees plain sample buffers.

use std::io;

/// Reads interleaved `f32` frames from a decoded audio stream.
pub trait FrameReader {
    /// Fill `dst` with up to `max_frames` frames of interleaved samples.
    ///
    /// Returns the number of frames actually read; `0` means clean end of
    /// stream. `dst` must hold at least `max_frames * channels` samples.
    fn read_frames(&mut self, dst: &mut [f32], max_frames: usize) -> io::Result<usize>;
}

/// Writes interleaved `f32` frames into an encoder or other sink.
pub trait FrameWriter {
    /// Write all frames in `interleaved` (length must be a multiple of the
    /// channel count the writer was created with).
    fn write_frames(&mut self, interleaved: &[f32]) -> io::Result<()>;
}

/// Collecting writer, mostly useful in tests and for the gapless hand-off
/// where a donor's final samples are extracted into a plain buffer.
impl FrameWriter for Vec<f32> {
    fn write_frames(&mut self, interleaved: &[f32]) -> io::Result<()> {
        self.extend_from_slice(interleaved);
        Ok(())
    }
}
