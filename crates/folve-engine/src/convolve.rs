//! The convolving file handler: per-open decode → process → encode
//! pipeline, producing into a [`ConversionBuffer`] on demand.

use crate::buffer::{ConversionBuffer, SoundSource};
use crate::filesystem::FolveFilesystem;
use crate::handler::{FileHandler, GaplessHandoff, HandlerStats, ReportedStat};
use crate::lock;
use folve_dsp::{FrameWriter, SoundProcessor};
use folve_io::{AudioFileReader, ByteSink, FlacSpec, FlacStreamWriter, SoundFormat, FLAC_BLOCK_SIZE};
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

/// Seeks this close to the reported end of file are served as zeros
/// instead of convolving everything up to that point.
const EOF_FUDGE_OVERHANG: u64 = 512;
/// Reads this far past the header trigger background pre-buffering.
const PREBUFFER_TRIGGER_BEYOND_HEADER: u64 = 64 << 10;
/// Slack added to the linear size estimate; reading short hurts more than
/// reading long.
const SIZE_ESTIMATE_SLACK: u64 = 65535;

const METADATA_STREAMINFO: u8 = 0;
const METADATA_PADDING: u8 = 1;
const METADATA_SEEKTABLE: u8 = 3;

/// Sentinel for "total frame count unknown" (e.g. some Ogg streams).
const FRAMES_UNKNOWN: u64 = u64::MAX;

/// Mutable streaming state, guarded by one mutex: only the producer (or
/// the gapless hand-off of a not-yet-started handler) touches it.
struct StreamState {
    /// The underlying file, kept for verbatim header copying.
    source_file: Option<File>,
    reader: Option<AudioFileReader>,
    encoder: Option<FlacStreamWriter>,
    processor: Option<Box<SoundProcessor>>,
}

/// Encoder output goes through the buffer's write gate.
struct EncoderSink {
    buffer: Arc<ConversionBuffer>,
}

impl ByteSink for EncoderSink {
    fn write_bytes(&self, data: &[u8]) -> io::Result<()> {
        self.buffer.encoder_append(data).map(|_| ())
    }
}

/// File handler that serves a convolved, re-encoded rendition of its file.
pub struct ConvolveFileHandler {
    fs: Weak<FolveFilesystem>,
    filter_dir: String,
    out: Arc<ConversionBuffer>,
    state: Mutex<StreamState>,
    stats: Mutex<HandlerStats>,
    config_file: PathBuf,

    frames_total: Option<u64>,
    frames_left: AtomicU64,

    /// Size currently reported to the host; only ever grows.
    report_size: AtomicU64,
    original_file_size: u64,
    /// Once this much output exists, start the linear size estimate.
    start_estimating_size: u64,
    modified: SystemTime,

    copy_flac_header_verbatim: bool,
    error: AtomicBool,
}

impl ConvolveFileHandler {
    /// Try to build a convolving handler for `file`. On failure (not a
    /// sound file, no matching filter) the file and the partially filled
    /// stats come back so the caller can fall back to pass-through.
    pub fn create(
        fs: &Arc<FolveFilesystem>,
        file: File,
        fs_path: &str,
        filter_subdir: &str,
        mut partial_stats: HandlerStats,
    ) -> Result<Arc<Self>, (File, HandlerStats)> {
        let reader = match file.try_clone().map_err(|e| e.to_string()).and_then(|dup| {
            AudioFileReader::open(dup).map_err(|e| e.to_string())
        }) {
            Ok(reader) => reader,
            Err(message) => {
                tracing::debug!(file = fs_path, %message, "no convolving handler");
                partial_stats.message = message;
                return Err((file, partial_stats));
            }
        };

        let info = reader.info().clone();
        partial_stats.format = info.describe();
        partial_stats.duration_seconds = info.duration_seconds();

        let config_dir = fs.config_dir_path(filter_subdir);
        let processor = match fs.processor_pool().get_or_create(
            &config_dir,
            info.sample_rate,
            info.channels,
            info.bits_per_sample,
        ) {
            Ok(processor) => processor,
            Err(e) => {
                partial_stats.message = e.to_string();
                return Err((file, partial_stats));
            }
        };
        tracing::debug!(
            file = fs_path,
            format = %partial_stats.format,
            config = %processor.config_file().display(),
            "opening convolving handler"
        );

        let (original_file_size, modified) = match file.metadata() {
            Ok(meta) => (meta.len(), meta.modified().unwrap_or(SystemTime::UNIX_EPOCH)),
            Err(e) => {
                partial_stats.message = e.to_string();
                return Err((file, partial_stats));
            }
        };

        // Output codec: FLAC all the way down. Ogg input becomes 16-bit,
        // WAV 24-bit, FLAC keeps its depth.
        let out_bits = match info.format {
            SoundFormat::OggVorbis => 16,
            SoundFormat::Wav => 24,
            SoundFormat::Flac => {
                if info.bits_per_sample >= 24 {
                    24
                } else {
                    16
                }
            }
        };
        let copy_flac_header_verbatim =
            info.format == SoundFormat::Flac && looks_like_flac(&file);

        let backing = match tempfile::tempfile() {
            Ok(backing) => backing,
            Err(e) => {
                partial_stats.message = e.to_string();
                return Err((file, partial_stats));
            }
        };

        let config_file = processor.config_file().to_path_buf();
        let frames_total = info.frames;
        let handler = Arc::new_cyclic(|weak: &Weak<Self>| {
            let source: Weak<dyn SoundSource> = weak.clone();
            Self {
                fs: Arc::downgrade(fs),
                filter_dir: filter_subdir.to_string(),
                out: Arc::new(ConversionBuffer::with_backing(backing, source)),
                state: Mutex::new(StreamState {
                    source_file: Some(file),
                    reader: Some(reader),
                    encoder: None,
                    processor: Some(Box::new(processor)),
                }),
                stats: Mutex::new(partial_stats),
                config_file,
                frames_total,
                frames_left: AtomicU64::new(frames_total.unwrap_or(FRAMES_UNKNOWN)),
                report_size: AtomicU64::new(
                    (original_file_size as f64 * fs.file_oversize_factor()) as u64,
                ),
                original_file_size,
                start_estimating_size: (0.4 * original_file_size as f64) as u64,
                modified,
                copy_flac_header_verbatim,
                error: AtomicBool::new(false),
            }
        });

        if let Err(e) = handler.initialize_output(&info, out_bits) {
            tracing::error!(file = fs_path, error = %e, "preparing output failed");
            lock(&handler.stats).message = e.to_string();
            handler.error.store(true, Ordering::Release);
        }
        Ok(handler)
    }

    /// Emit the output header and set up the encoder. Runs once, before
    /// any read can reach the buffer.
    fn initialize_output(&self, info: &folve_io::AudioInfo, out_bits: u32) -> io::Result<()> {
        let mut state = lock(&self.state);

        if self.copy_flac_header_verbatim {
            // The source header is richer than anything we could generate;
            // take it verbatim and keep the encoder's own header out.
            self.out.set_encoder_writes_enabled(false);
            let source_file = state
                .source_file
                .as_ref()
                .ok_or_else(|| io::Error::other("source file closed"))?;
            copy_flac_header(source_file, &self.out)?;
        } else {
            self.out.set_encoder_writes_enabled(true);
        }

        let sink = EncoderSink {
            buffer: Arc::clone(&self.out),
        };
        let spec = FlacSpec::new(info.sample_rate, info.channels, out_bits);
        let encoder = FlacStreamWriter::new(Box::new(sink), spec)
            .map_err(|e| io::Error::other(e.to_string()))?;

        if self.copy_flac_header_verbatim {
            // The copied STREAMINFO still describes the original encoding;
            // redact what our encoder will actually produce.
            // Bytes 8..12: min/max block size.
            let bs = FLAC_BLOCK_SIZE as u16;
            self.out.write_char_at((bs >> 8) as u8, 8)?;
            self.out.write_char_at((bs & 0xff) as u8, 9)?;
            self.out.write_char_at((bs >> 8) as u8, 10)?;
            self.out.write_char_at((bs & 0xff) as u8, 11)?;
            // Bytes 12..18: min/max frame size, unknown after re-encoding.
            for i in 12..18 {
                self.out.write_char_at(0, i)?;
            }
            // Byte 20: low 4 bits of the sample rate, channels - 1, and the
            // top bit of bits-per-sample - 1.
            let byte20 = (((info.sample_rate & 0x0f) as u8) << 4)
                | (((info.channels - 1) as u8) << 1)
                | (((out_bits - 1) as u8 & 0x10) >> 4);
            self.out.write_char_at(byte20, 20)?;
        } else if let Some(frames) = self.frames_total {
            // Our encoder streams and writes a zero sample count; patch in
            // the count we know from the input. 32 bits starting at byte 22.
            self.out.write_char_at((frames >> 24) as u8, 22)?;
            self.out.write_char_at((frames >> 16) as u8, 23)?;
            self.out.write_char_at((frames >> 8) as u8, 24)?;
            self.out.write_char_at(frames as u8, 25)?;
        }

        self.out.set_encoder_writes_enabled(true);
        state.encoder = Some(encoder);
        self.out.header_finished();
        tracing::debug!(header_bytes = self.out.header_size(), "output header ready");
        Ok(())
    }

    fn frames_left_value(&self) -> u64 {
        self.frames_left.load(Ordering::Acquire)
    }

    fn has_started(&self) -> bool {
        match self.frames_total {
            Some(total) => self.frames_left_value() != total,
            None => self.out.file_size() > self.out.header_size(),
        }
    }

    /// Produce the donor's final samples and shut the pipeline down,
    /// called with the state lock held.
    fn close_stream(&self, state: &mut StreamState) {
        if state.encoder.is_none() {
            return;
        }
        self.frames_left.store(0, Ordering::Release);

        if let Some(processor) = state.processor.take() {
            self.save_output_values(processor.max_output_value());
            if let Some(fs) = self.fs.upgrade() {
                fs.processor_pool().put_back(*processor);
            }
        }

        if let Some(mut encoder) = state.encoder.take() {
            if let Err(e) = encoder.finalize() {
                tracing::warn!(error = %e, "finalizing encoder failed");
            }
        }
        state.reader = None;
        state.source_file = None;

        if let Some(fs) = self.fs.upgrade() {
            let produced = self.out.file_size();
            if self.original_file_size > 0 {
                let factor = produced as f64 / self.original_file_size as f64;
                if factor > fs.file_oversize_factor() {
                    tracing::warn!(
                        file = %lock(&self.stats).filename,
                        produced,
                        original = self.original_file_size,
                        factor = format!("{factor:.2}"),
                        "output larger than predicted; naive streamers may trip"
                    );
                }
            }
        }
    }

    fn save_output_values(&self, max_output_value: f32) {
        let mut stats = lock(&self.stats);
        if max_output_value > stats.max_output_value {
            stats.max_output_value = max_output_value;
        }
        if stats.max_output_value > 1.0 {
            let hint = 1.0 / stats.max_output_value;
            tracing::error!(
                file = %stats.filename,
                max = stats.max_output_value,
                gain_hint = hint,
                config = %self.config_file.display(),
                "observed output clipping"
            );
            stats.message = format!(
                "Output clipping! (max={:.3}; multiply gain with <= {:.5} in {})",
                stats.max_output_value,
                hint,
                self.config_file.display()
            );
        }
    }

    /// Try to pass the processor on to the alphabetically next sibling
    /// with the same suffix. Returns `true` if ownership moved on.
    fn attempt_gapless_handoff(
        &self,
        fs: &Arc<FolveFilesystem>,
        state: &mut StreamState,
        donor_frames: usize,
    ) -> bool {
        let filename = lock(&self.stats).filename.clone();
        let Some((dir, suffix)) = extract_dir_and_suffix(&filename) else {
            return false;
        };
        let Ok(entries) = fs.list_directory(&dir, &suffix) else {
            return false;
        };
        let Some(next_name) = entries
            .range::<String, _>((Bound::Excluded(filename.clone()), Bound::Unbounded))
            .next()
            .cloned()
        else {
            return false;
        };
        let Ok(next) = fs.get_or_create_handler(&next_name) else {
            return false;
        };

        let Some(processor) = state.processor.take() else {
            fs.close(&next_name, &*next);
            return false;
        };
        let handed = match next.accept_processor(processor, donor_frames) {
            GaplessHandoff::Accepted {
                donor_tail,
                donor_max_output,
            } => {
                let write_result = state
                    .encoder
                    .as_mut()
                    .map(|encoder| encoder.write_frames(&donor_tail));
                if let Some(Err(e)) = write_result {
                    tracing::warn!(error = %e, "writing gapless tail failed");
                }
                tracing::debug!(from = %filename, to = %next_name, "gapless pass-on");
                {
                    let mut stats = lock(&self.stats);
                    stats.out_gapless = true;
                }
                self.save_output_values(donor_max_output);
                self.close_stream(state);
                next.notify_passed_processor_unreferenced();
                true
            }
            GaplessHandoff::Refused(processor) => {
                state.processor = Some(processor);
                false
            }
        };
        fs.close(&next_name, &*next);
        handed
    }
}

impl SoundSource for ConvolveFileHandler {
    fn add_more_sound_data(&self) -> bool {
        let mut state = lock(&self.state);
        if self.frames_left_value() == 0 {
            return false;
        }
        let Some(fs) = self.fs.upgrade() else {
            return false;
        };

        // Leftover processed samples from a passed-over processor go out
        // before anything new is decoded.
        let pending = state
            .processor
            .as_ref()
            .map_or(0, |p| p.pending_writes());
        if pending > 0 {
            let StreamState {
                processor: Some(processor),
                encoder: Some(encoder),
                ..
            } = &mut *state
            else {
                return false;
            };
            if let Err(e) = processor.write_processed(encoder, pending) {
                tracing::error!(error = %e, "writing pending samples failed");
                lock(&self.stats).message = format!("Write failed: {e}");
                self.close_stream(&mut state);
                return false;
            }
            return self.frames_left_value() != 0;
        }

        let read_result = {
            let StreamState {
                processor: Some(processor),
                reader: Some(reader),
                ..
            } = &mut *state
            else {
                return false;
            };
            processor.fill_buffer(reader)
        };
        let r = match read_result {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, "decoding failed");
                lock(&self.stats).message = format!("Decode failed: {e}");
                self.close_stream(&mut state);
                return false;
            }
        };

        if r == 0 {
            if self.frames_total.is_some() {
                // The container promised more frames than it delivered.
                tracing::error!(
                    frames_left = self.frames_left_value(),
                    file = %lock(&self.stats).filename,
                    "premature EOF; corrupt file?"
                );
                lock(&self.stats).message = "Premature EOF in input file.".to_string();
            }
            self.close_stream(&mut state);
            return false;
        }

        if self.frames_total.is_some() {
            let left = self.frames_left_value().saturating_sub(r as u64);
            self.frames_left.store(left, Ordering::Release);
        }

        let input_done = self.frames_total.is_some() && self.frames_left_value() == 0;
        let buffer_incomplete = state
            .processor
            .as_ref()
            .is_some_and(|p| !p.is_input_buffer_complete());

        let mut handed = false;
        if input_done && buffer_incomplete && fs.gapless_processing() {
            handed = self.attempt_gapless_handoff(&fs, &mut state, r);
        }
        if !handed {
            let StreamState {
                processor: Some(processor),
                encoder: Some(encoder),
                ..
            } = &mut *state
            else {
                return false;
            };
            if let Err(e) = processor.write_processed(encoder, r) {
                tracing::error!(error = %e, "encoding failed");
                lock(&self.stats).message = format!("Encode failed: {e}");
                self.close_stream(&mut state);
                return false;
            }
            if input_done {
                self.close_stream(&mut state);
            }
        }

        self.frames_left_value() != 0
    }
}

impl FileHandler for ConvolveFileHandler {
    fn filter_dir(&self) -> &str {
        &self.filter_dir
    }

    fn read(&self, dst: &mut [u8], offset: u64) -> io::Result<usize> {
        if self.error.load(Ordering::Acquire) {
            return Err(io::Error::other("handler in error state"));
        }

        let current_filesize = self.out.file_size();
        let read_horizon = offset + dst.len() as u64;
        let reported_size = self.report_size.load(Ordering::Acquire);

        // A seek suspiciously close to the reported end of file happens
        // while media players index; serve zeros instead of convolving
        // everything up to that point. Only for real skips, not a regular
        // approach of the end.
        if current_filesize < offset && read_horizon + EOF_FUDGE_OVERHANG >= reported_size {
            let pretended = (reported_size.saturating_sub(offset)).min(dst.len() as u64) as usize;
            dst[..pretended].fill(0);
            return Ok(pretended);
        }

        let result = self.out.read(dst, offset)?;

        // Kick off pre-buffering only once the client clearly reads the
        // sound stream; header probes overshooting a little must not.
        let well_beyond_header = self.out.header_size() + PREBUFFER_TRIGGER_BEYOND_HEADER;
        if read_horizon > well_beyond_header
            && !self.out.is_file_complete()
            && read_horizon + self.fs.upgrade().map_or(0, |fs| fs.pre_buffer_size())
                > current_filesize
        {
            if let Some(fs) = self.fs.upgrade() {
                fs.request_prebuffer(&self.out);
            }
        }
        Ok(result)
    }

    fn stat(&self) -> io::Result<ReportedStat> {
        let current_filesize = self.out.file_size();
        if current_filesize > self.start_estimating_size {
            if let Some(total) = self.frames_total {
                let done = total.saturating_sub(self.frames_left_value());
                if done > 0 {
                    let estimated = (total as f64 / done as f64 * current_filesize as f64)
                        as u64
                        + SIZE_ESTIMATE_SLACK;
                    // Only ever grow: clients tolerate a shrinking tail
                    // badly.
                    self.report_size.fetch_max(estimated, Ordering::AcqRel);
                }
            }
        }
        Ok(ReportedStat {
            size: self.report_size.load(Ordering::Acquire),
            modified: self.modified,
        })
    }

    fn handler_stats(&self) -> HandlerStats {
        // Peek at the live processor if nobody is converting right now;
        // never stall the status page on a running convolution.
        if let Ok(state) = self.state.try_lock() {
            if let Some(processor) = &state.processor {
                let max = processor.max_output_value();
                let mut stats = lock(&self.stats);
                if max > stats.max_output_value {
                    stats.max_output_value = max;
                }
            }
        }

        let mut stats = lock(&self.stats).clone();
        if let Some(total) = self.frames_total {
            let done = total.saturating_sub(self.frames_left_value());
            if done == 0 || total == 0 {
                stats.buffer_progress = 0.0;
                stats.access_progress = 0.0;
            } else {
                let progress = done as f32 / total as f32;
                stats.buffer_progress = progress;
                let filesize = self.out.file_size();
                stats.access_progress = if filesize > 0 {
                    progress * self.out.max_accessed() as f32 / filesize as f32
                } else {
                    0.0
                };
            }
        }
        if stats.max_output_value > 1.0 && stats.message.is_empty() {
            stats.message = format!(
                "Output clipping! (max={:.3}; multiply gain with <= {:.5} in {})",
                stats.max_output_value,
                1.0 / stats.max_output_value,
                self.config_file.display()
            );
        }
        stats
    }

    fn accept_processor(
        &self,
        mut processor: Box<SoundProcessor>,
        donor_frames: usize,
    ) -> GaplessHandoff {
        // try_lock, not lock: a held state mutex means our own pipeline is
        // running, which refuses the hand-off anyway. Blocking here could
        // close a lock cycle with a donor that is itself mid-production.
        let Ok(mut state) = self.state.try_lock() else {
            return GaplessHandoff::Refused(processor);
        };
        if self.has_started() {
            tracing::debug!(
                file = %lock(&self.stats).filename,
                "gapless: cannot bridge into already started file"
            );
            return GaplessHandoff::Refused(processor);
        }
        let Some(own) = state.processor.as_ref() else {
            return GaplessHandoff::Refused(processor);
        };
        if processor.config_file() != own.config_file()
            || processor.config_file_timestamp() != own.config_file_timestamp()
        {
            tracing::debug!("gapless: configuration changed; refusing processor");
            return GaplessHandoff::Refused(processor);
        }

        // Use the donor's processor instead of our own.
        if let Some(own) = state.processor.take() {
            if let Some(fs) = self.fs.upgrade() {
                fs.processor_pool().put_back(*own);
            }
        }

        // Top up the donor's unfinished fragment with our beginning, so
        // its tail is convolved against our head.
        if !processor.is_input_buffer_complete() {
            if let Some(reader) = state.reader.as_mut() {
                match processor.fill_buffer(reader) {
                    Ok(r) => {
                        if self.frames_total.is_some() {
                            let left = self.frames_left_value().saturating_sub(r as u64);
                            self.frames_left.store(left, Ordering::Release);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "gapless top-up read failed");
                    }
                }
            }
        }

        let mut donor_tail: Vec<f32> = Vec::new();
        if donor_frames > 0 {
            // Writing into a Vec cannot fail.
            let _ = processor.write_processed(&mut donor_tail, donor_frames);
        }
        let donor_max_output = processor.max_output_value();
        processor.reset_max_values();

        state.processor = Some(processor);
        lock(&self.stats).in_gapless = true;
        GaplessHandoff::Accepted {
            donor_tail,
            donor_max_output,
        }
    }

    fn notify_passed_processor_unreferenced(&self) {
        // We inherited live filter state; pre-buffer our beginning so the
        // first read of this track does not stall.
        if let Some(fs) = self.fs.upgrade() {
            fs.request_prebuffer(&self.out);
        }
    }
}

impl Drop for ConvolveFileHandler {
    fn drop(&mut self) {
        // Order matters: mark complete, drop queued pre-buffer work, then
        // tear the stream down. A chunk the worker already started ends
        // harmlessly: its weak producer link no longer upgrades.
        self.out.notify_file_complete();
        if let Some(fs) = self.fs.upgrade() {
            fs.quit_buffering(&self.out);
        }
        let mut state = lock(&self.state);
        self.close_stream(&mut state);
    }
}

/// `dir/` (with trailing slash) and `.suffix` of a mount path.
fn extract_dir_and_suffix(filename: &str) -> Option<(String, String)> {
    let slash = filename.rfind('/')?;
    let dir = filename[..=slash].to_string();
    let suffix = match filename.rfind('.') {
        Some(dot) if dot > slash => filename[dot..].to_string(),
        _ => String::new(),
    };
    Some((dir, suffix))
}

/// A FLAC decoder format claim is not enough: some files carry FLAC audio
/// in other containers. Verify the stream magic before copying headers.
fn looks_like_flac(file: &File) -> bool {
    let mut magic = [0u8; 4];
    matches!(file.read_at(&mut magic, 0), Ok(4)) && &magic == b"fLaC"
}

fn copy_bytes(src: &File, mut pos: u64, out: &ConversionBuffer, mut len: u64) -> io::Result<()> {
    let mut buf = [0u8; 256];
    while len > 0 {
        let want = (buf.len() as u64).min(len) as usize;
        let r = src.read_at(&mut buf[..want], pos)?;
        if r == 0 {
            return Ok(());
        }
        out.append(&buf[..r])?;
        len -= r as u64;
        pos += r as u64;
    }
    Ok(())
}

/// Copy the source FLAC metadata verbatim, with two edits: the STREAMINFO
/// MD5 is zeroed (the re-encoded audio has a different signature) and any
/// SEEKTABLE is dropped (its offsets are bogus after re-encoding).
fn copy_flac_header(src: &File, out: &ConversionBuffer) -> io::Result<()> {
    out.append(b"fLaC")?;
    let mut pos: u64 = 4;
    let mut header = [0u8; 4];
    let mut need_finish_padding = false;
    loop {
        if src.read_at(&mut header, pos)? != header.len() {
            break;
        }
        pos += header.len() as u64;
        let is_last = header[0] & 0x80 != 0;
        let block_type = header[0] & 0x7f;
        let byte_len = (u64::from(header[1]) << 16) | (u64::from(header[2]) << 8)
            | u64::from(header[3]);
        need_finish_padding = false;
        if block_type == METADATA_STREAMINFO && byte_len == 34 {
            out.append(&header)?;
            copy_bytes(src, pos, out, byte_len - 16)?;
            out.append(&[0u8; 16])?;
        } else if block_type == METADATA_SEEKTABLE {
            // If the seektable was the last block we owe the stream a
            // terminating block.
            need_finish_padding = is_last;
        } else {
            out.append(&header)?;
            copy_bytes(src, pos, out, byte_len)?;
        }
        tracing::debug!(
            block_type,
            byte_len,
            is_last,
            "copied flac metadata block"
        );
        pos += byte_len;
        if is_last {
            break;
        }
    }
    if need_finish_padding {
        out.append(&[0x80 | METADATA_PADDING, 0, 0, 0])?;
    }
    Ok(())
}
