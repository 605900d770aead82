//! The workhorse moving sample data between decoder and encoder.
//!
//! A [`SoundProcessor`] owns one configured [`Convolver`] and a fragment-sized
//! interleaved workspace. Callers alternate between filling the workspace
//! from a [`FrameReader`] and draining processed frames into a
//! [`FrameWriter`]; the convolution happens lazily on the first drain of
//! each fragment.

use crate::convolver::Convolver;
use crate::error::DspError;
use crate::frames::{FrameReader, FrameWriter};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

/// The convolver shares FFT planner caches; plan construction is not safe to
/// run from several threads at once, so creation is serialised process-wide.
static CREATE_LOCK: Mutex<()> = Mutex::new(());

/// Stateful FIR processor over interleaved float samples.
pub struct SoundProcessor {
    convolver: Convolver,
    config_file: PathBuf,
    config_file_timestamp: SystemTime,
    /// Interleaved workspace of `fragment * channels` samples.
    buffer: Vec<f32>,
    channels: usize,
    fragment: usize,
    /// Next frame to fill from the decoder.
    input_pos: usize,
    /// Next processed frame to drain; `None` while the fragment is
    /// unprocessed.
    output_pos: Option<usize>,
    max_output_value: f32,
}

impl std::fmt::Debug for SoundProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoundProcessor")
            .field("config_file", &self.config_file)
            .field("channels", &self.channels)
            .field("fragment", &self.fragment)
            .finish_non_exhaustive()
    }
}

impl SoundProcessor {
    /// Build a processor from the filter configuration at `config_file`.
    ///
    /// The configured convolver must provide at least `channels` inputs and
    /// outputs.
    pub fn create(
        config_file: &Path,
        sample_rate: u32,
        channels: usize,
    ) -> Result<Self, DspError> {
        let config_file_timestamp = config_mtime(config_file)?;
        let convolver = {
            let _guard = create_lock();
            crate::config::parse_config(config_file, sample_rate)?
        };
        if convolver.num_inputs() < channels || convolver.num_outputs() < channels {
            return Err(DspError::ChannelMismatch {
                path: config_file.to_path_buf(),
                found: convolver.num_inputs().min(convolver.num_outputs()),
                needed: channels,
            });
        }
        let fragment = convolver.fragment();
        Ok(Self {
            convolver,
            config_file: config_file.to_path_buf(),
            config_file_timestamp,
            buffer: vec![0.0; fragment * channels],
            channels,
            fragment,
            input_pos: 0,
            output_pos: None,
            max_output_value: 0.0,
        })
    }

    /// Fill the workspace from `input`. Returns the number of frames read;
    /// `0` signals end of stream. Must not be called while processed frames
    /// are still pending ([`pending_writes`](Self::pending_writes)).
    pub fn fill_buffer(&mut self, input: &mut dyn FrameReader) -> io::Result<usize> {
        let frames_needed = self.fragment - self.input_pos;
        debug_assert!(frames_needed > 0, "drain pending writes first");
        self.output_pos = None;
        let dst = &mut self.buffer[self.input_pos * self.channels..];
        let r = input.read_frames(dst, frames_needed)?;
        self.input_pos += r;
        Ok(r)
    }

    /// Whether the input side of the fragment is full. If not, another
    /// [`fill_buffer`](Self::fill_buffer) is needed (or, at a track
    /// boundary, a gapless successor tops it up).
    pub fn is_input_buffer_complete(&self) -> bool {
        self.input_pos == self.fragment
    }

    /// Number of processed frames not yet drained. Non-zero typically after
    /// the processor was passed over to a new file.
    pub fn pending_writes(&self) -> usize {
        match self.output_pos {
            Some(pos) => self.fragment - pos,
            None => 0,
        }
    }

    /// Drain `frames` processed frames into `output`, convolving first if
    /// the current fragment has not been processed yet.
    pub fn write_processed(
        &mut self,
        output: &mut dyn FrameWriter,
        frames: usize,
    ) -> io::Result<()> {
        if self.output_pos.is_none() {
            self.process();
        }
        let pos = self.output_pos.unwrap_or(0);
        debug_assert!(frames <= self.fragment - pos);
        output.write_frames(&self.buffer[pos * self.channels..(pos + frames) * self.channels])?;
        let new_pos = pos + frames;
        self.output_pos = Some(new_pos);
        if new_pos == self.fragment {
            self.input_pos = 0;
        }
        Ok(())
    }

    fn process(&mut self) {
        // Zero the unfilled tail of a partial fragment.
        let filled = self.input_pos * self.channels;
        self.buffer[filled..].fill(0.0);

        // Deinterleave into the convolver staging buffers.
        for ch in 0..self.channels {
            let input = self.convolver.input_mut(ch);
            for j in 0..self.fragment {
                input[j] = self.buffer[j * self.channels + ch];
            }
        }

        self.convolver.process();

        // Interleave back, tracking the output peak.
        for ch in 0..self.channels {
            let output = self.convolver.output(ch);
            for j in 0..self.fragment {
                let v = output[j];
                self.buffer[j * self.channels + ch] = v;
                if v.abs() > self.max_output_value {
                    self.max_output_value = v.abs();
                }
            }
        }
        self.output_pos = Some(0);
    }

    /// Reset processor for re-use.
    pub fn reset(&mut self) {
        self.convolver.reset();
        self.input_pos = 0;
        self.output_pos = None;
        self.reset_max_values();
    }

    /// Maximum absolute output value observed (>= 0.0).
    pub fn max_output_value(&self) -> f32 {
        self.max_output_value
    }

    /// Restart peak tracking.
    pub fn reset_max_values(&mut self) {
        self.max_output_value = 0.0;
    }

    /// Configuration file this processor was created from.
    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    /// Modification time of the configuration file at creation.
    pub fn config_file_timestamp(&self) -> SystemTime {
        self.config_file_timestamp
    }

    /// Whether the configuration file on disk is unchanged.
    pub fn config_still_up_to_date(&self) -> bool {
        config_mtime(&self.config_file)
            .map(|t| t == self.config_file_timestamp)
            .unwrap_or(false)
    }
}

fn config_mtime(path: &Path) -> Result<SystemTime, DspError> {
    let meta = std::fs::metadata(path).map_err(|source| DspError::Stat {
        path: path.to_path_buf(),
        source,
    })?;
    meta.modified().map_err(|source| DspError::Stat {
        path: path.to_path_buf(),
        source,
    })
}

fn create_lock() -> MutexGuard<'static, ()> {
    CREATE_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    /// Reader yielding a fixed ramp, then EOF.
    struct RampReader {
        remaining: usize,
        value: f32,
        channels: usize,
    }

    impl FrameReader for RampReader {
        fn read_frames(&mut self, dst: &mut [f32], max_frames: usize) -> io::Result<usize> {
            let n = max_frames.min(self.remaining);
            for frame in 0..n {
                for ch in 0..self.channels {
                    dst[frame * self.channels + ch] = self.value;
                    self.value += 0.001;
                }
            }
            self.remaining -= n;
            Ok(n)
        }
    }

    fn dirac_processor(channels: usize) -> (SoundProcessor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("filter-44100.conf");
        let mut f = std::fs::File::create(&conf).unwrap();
        writeln!(f, "/convolver/new {channels} {channels} 64 128").unwrap();
        for ch in 1..=channels {
            writeln!(f, "/impulse/dirac {ch} {ch} 1.0 0").unwrap();
        }
        drop(f);
        let p = SoundProcessor::create(&conf, 44100, channels).unwrap();
        (p, dir)
    }

    #[test]
    fn fill_process_drain_cycle() {
        let (mut p, _dir) = dirac_processor(1);
        let fragment = p.fragment;
        let mut reader = RampReader { remaining: fragment * 2, value: 0.0, channels: 1 };

        let r = p.fill_buffer(&mut reader).unwrap();
        assert_eq!(r, fragment);
        assert!(p.is_input_buffer_complete());
        assert_eq!(p.pending_writes(), 0);

        let mut out: Vec<f32> = Vec::new();
        p.write_processed(&mut out, fragment).unwrap();
        assert_eq!(out.len(), fragment);
        assert_eq!(p.pending_writes(), 0);
        assert!(!p.is_input_buffer_complete());

        // Dirac filter: output equals input ramp.
        assert!((out[0] - 0.0).abs() < 1e-3);
        assert!((out[10] - 0.010).abs() < 1e-3);
    }

    #[test]
    fn partial_drain_leaves_pending() {
        let (mut p, _dir) = dirac_processor(1);
        let fragment = p.fragment;
        let mut reader = RampReader { remaining: fragment, value: 0.5, channels: 1 };
        p.fill_buffer(&mut reader).unwrap();

        let mut out: Vec<f32> = Vec::new();
        p.write_processed(&mut out, 10).unwrap();
        assert_eq!(p.pending_writes(), fragment - 10);
        p.write_processed(&mut out, fragment - 10).unwrap();
        assert_eq!(p.pending_writes(), 0);
        assert_eq!(out.len(), fragment);
    }

    #[test]
    fn partial_fragment_zero_padded() {
        let (mut p, _dir) = dirac_processor(1);
        let mut reader = RampReader { remaining: 16, value: 1.0, channels: 1 };
        let r = p.fill_buffer(&mut reader).unwrap();
        assert_eq!(r, 16);
        assert!(!p.is_input_buffer_complete());

        let mut out: Vec<f32> = Vec::new();
        p.write_processed(&mut out, 16).unwrap();
        // Dirac of the padded fragment: the 16 real samples come through.
        assert!((out[0] - 1.0).abs() < 1e-3);
        // The rest of the fragment stays pending for a gapless successor.
        assert_eq!(p.pending_writes(), p.fragment - 16);
    }

    #[test]
    fn peak_tracking_and_reset() {
        let (mut p, _dir) = dirac_processor(2);
        let fragment = p.fragment;
        let mut reader = RampReader { remaining: fragment, value: 0.0, channels: 2 };
        p.fill_buffer(&mut reader).unwrap();
        let mut out: Vec<f32> = Vec::new();
        p.write_processed(&mut out, fragment).unwrap();
        assert!(p.max_output_value() > 0.0);

        p.reset();
        assert_eq!(p.max_output_value(), 0.0);
        assert_eq!(p.pending_writes(), 0);
        assert!(!p.is_input_buffer_complete());
    }

    #[test]
    fn config_timestamp_tracked() {
        let (p, _dir) = dirac_processor(1);
        assert!(p.config_still_up_to_date());
    }

    #[test]
    fn channel_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("filter-44100.conf");
        std::fs::write(&conf, "/convolver/new 1 1 64 128\n/impulse/dirac 1 1 1.0 0\n")
            .unwrap();
        assert!(matches!(
            SoundProcessor::create(&conf, 44100, 2),
            Err(DspError::ChannelMismatch { .. })
        ));
    }
}
