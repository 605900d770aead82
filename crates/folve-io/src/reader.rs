//! Frame-level audio decoding on top of symphonia.

use crate::error::AudioError;
use crate::format::{detect_format, SoundFormat};
use folve_dsp::FrameReader;
use std::fs::File;
use std::io;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Stream parameters discovered when opening an audio file.
#[derive(Debug, Clone)]
pub struct AudioInfo {
    /// Total frames if the container declares them (Ogg may not).
    pub frames: Option<u64>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of channels.
    pub channels: usize,
    /// Bit depth of the source stream.
    pub bits_per_sample: u32,
    /// Detected container.
    pub format: SoundFormat,
}

impl AudioInfo {
    /// Duration in whole seconds, `-1` when the frame count is unknown.
    pub fn duration_seconds(&self) -> i64 {
        match self.frames {
            Some(frames) if self.sample_rate > 0 => (frames / u64::from(self.sample_rate)) as i64,
            _ => -1,
        }
    }

    /// Short format description for status display, e.g. `44.1kHz, 16 Bit`.
    pub fn describe(&self) -> String {
        format!(
            "{:.1}kHz, {} Bit",
            f64::from(self.sample_rate) / 1000.0,
            self.bits_per_sample
        )
    }
}

/// Decodes one audio file into interleaved `f32` frames.
pub struct AudioFileReader {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    info: AudioInfo,
    /// Interleaved samples decoded but not yet handed out.
    leftover: Vec<f32>,
    leftover_pos: usize,
}

impl AudioFileReader {
    /// Probe and open `file`. Fails with [`AudioError::NotASoundFile`] for
    /// unrecognised containers so callers can fall back to pass-through.
    pub fn open(file: File) -> Result<Self, AudioError> {
        let sound_format = detect_format(&file)?;

        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let mut hint = Hint::new();
        hint.with_extension(sound_format.extension());

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| AudioError::Unsupported(e.to_string()))?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| AudioError::Unsupported("no audio track".to_string()))?;
        let track_id = track.id;
        let params = track.codec_params.clone();

        let sample_rate = params
            .sample_rate
            .ok_or_else(|| AudioError::Unsupported("unknown sample rate".to_string()))?;
        let channels = params
            .channels
            .ok_or_else(|| AudioError::Unsupported("unknown channel count".to_string()))?
            .count();
        // WAV float and Vorbis streams carry no integer bit depth; treat
        // them as CD-width for filter resolution and output choice.
        let bits_per_sample = params.bits_per_sample.unwrap_or(16);

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| AudioError::Unsupported(e.to_string()))?;

        Ok(Self {
            format,
            decoder,
            track_id,
            info: AudioInfo {
                frames: params.n_frames,
                sample_rate,
                channels,
                bits_per_sample,
                format: sound_format,
            },
            leftover: Vec::new(),
            leftover_pos: 0,
        })
    }

    /// Stream parameters of the opened file.
    pub fn info(&self) -> &AudioInfo {
        &self.info
    }

    /// Decode packets until some samples are available. `Ok(false)` means
    /// clean end of stream.
    fn refill(&mut self) -> io::Result<bool> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(false),
                Err(e) => return Err(io::Error::other(e.to_string())),
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    if decoded.frames() == 0 {
                        continue;
                    }
                    let spec = *decoded.spec();
                    let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    buf.copy_interleaved_ref(decoded);
                    self.leftover.clear();
                    self.leftover.extend_from_slice(buf.samples());
                    self.leftover_pos = 0;
                    return Ok(true);
                }
                // A malformed packet is skipped, not fatal; symphonia
                // recovers at the next sync point.
                Err(SymphoniaError::DecodeError(e)) => {
                    tracing::warn!(error = %e, "skipping undecodable packet");
                    continue;
                }
                Err(e) => return Err(io::Error::other(e.to_string())),
            }
        }
    }
}

impl FrameReader for AudioFileReader {
    fn read_frames(&mut self, dst: &mut [f32], max_frames: usize) -> io::Result<usize> {
        let channels = self.info.channels;
        let mut frames_out = 0;
        while frames_out < max_frames {
            if self.leftover_pos >= self.leftover.len() {
                if !self.refill()? {
                    break;
                }
            }
            let avail_frames = (self.leftover.len() - self.leftover_pos) / channels;
            let take = avail_frames.min(max_frames - frames_out);
            let src = &self.leftover[self.leftover_pos..self.leftover_pos + take * channels];
            dst[frames_out * channels..(frames_out + take) * channels].copy_from_slice(src);
            self.leftover_pos += take * channels;
            frames_out += take;
        }
        Ok(frames_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(dir: &std::path::Path, name: &str, frames: usize, channels: u16) -> std::path::PathBuf {
        let path = dir.join(name);
        let spec = hound::WavSpec {
            channels,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..frames {
            for ch in 0..channels {
                let v = ((i + ch as usize) % 100) as i16 * 100;
                writer.write_sample(v).unwrap();
            }
        }
        writer.finalize().unwrap();
        path
    }

    #[test]
    fn wav_info_and_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "tone.wav", 4410, 2);
        let mut reader = AudioFileReader::open(File::open(&path).unwrap()).unwrap();

        let info = reader.info().clone();
        assert_eq!(info.sample_rate, 44100);
        assert_eq!(info.channels, 2);
        assert_eq!(info.format, SoundFormat::Wav);
        assert_eq!(info.frames, Some(4410));
        assert_eq!(info.duration_seconds(), 0);

        let mut total = 0usize;
        let mut buf = vec![0.0f32; 1000 * 2];
        loop {
            let n = reader.read_frames(&mut buf, 1000).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, 4410);
    }

    #[test]
    fn short_reads_are_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "short.wav", 100, 1);
        let mut reader = AudioFileReader::open(File::open(&path).unwrap()).unwrap();

        let mut buf = vec![0.0f32; 64];
        assert_eq!(reader.read_frames(&mut buf, 64).unwrap(), 64);
        assert_eq!(reader.read_frames(&mut buf, 64).unwrap(), 36);
        assert_eq!(reader.read_frames(&mut buf, 64).unwrap(), 0);
    }

    #[test]
    fn sample_values_scaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("val.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        writer.write_sample(i16::MAX).unwrap();
        writer.write_sample(0i16).unwrap();
        writer.write_sample(i16::MIN).unwrap();
        writer.finalize().unwrap();

        let mut reader = AudioFileReader::open(File::open(&path).unwrap()).unwrap();
        let mut buf = vec![0.0f32; 3];
        assert_eq!(reader.read_frames(&mut buf, 3).unwrap(), 3);
        assert!((buf[0] - 1.0).abs() < 1e-3);
        assert!(buf[1].abs() < 1e-6);
        assert!((buf[2] + 1.0).abs() < 1e-3);
    }

    #[test]
    fn rejects_non_audio() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "just some text").unwrap();
        assert!(matches!(
            AudioFileReader::open(File::open(&path).unwrap()),
            Err(AudioError::NotASoundFile)
        ));
    }
}
