//! File-backed, demand-driven byte store shared between readers and a
//! producer.
//!
//! A [`ConversionBuffer`] holds the encoded output of one conversion as it
//! is produced. Readers call [`read`](ConversionBuffer::read) at arbitrary
//! offsets; if the requested range has not been produced yet, the buffer
//! drives its producer until it has. The producer writes back into the very
//! buffer that scheduled it, so the fill mutex only serialises *scheduling*
//! of producer calls - the append path itself is lock-free.

use crate::lock;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, Weak};

/// Producer callback of a [`ConversionBuffer`].
///
/// Invoked with the buffer's fill mutex held, one call at a time per
/// buffer. The implementation is expected to append encoded bytes into the
/// buffer and returns `false` once the stream is exhausted.
pub trait SoundSource: Send + Sync {
    /// Produce some more encoded bytes. `false` means end of stream.
    fn add_more_sound_data(&self) -> bool;
}

/// File-backed byte store filled on demand by a [`SoundSource`].
pub struct ConversionBuffer {
    backing: File,
    source: Weak<dyn SoundSource>,
    /// Bytes produced so far; advanced only by [`append`](Self::append),
    /// which runs on the producing thread.
    total_written: AtomicU64,
    /// End of the codec header region; set once via
    /// [`header_finished`](Self::header_finished).
    header_end: AtomicU64,
    /// Highest `offset + n` any read has observed.
    max_accessed: AtomicU64,
    file_complete: AtomicBool,
    /// Gate for encoder writes; raw appends bypass it.
    encoder_writes_enabled: AtomicBool,
    /// A backing-file write failed; the buffer is dead.
    write_error: AtomicBool,
    /// Serialises producer invocation.
    fill_lock: Mutex<()>,
}

impl ConversionBuffer {
    /// Create a buffer with an anonymous temp file as backing store. The
    /// file is created under `$TMPDIR` (falling back to `/tmp`) and never
    /// has a name; closing the descriptor frees the blocks.
    pub fn new(source: Weak<dyn SoundSource>) -> io::Result<Self> {
        Ok(Self::with_backing(tempfile::tempfile()?, source))
    }

    /// Create a buffer over a caller-provided backing file.
    pub fn with_backing(backing: File, source: Weak<dyn SoundSource>) -> Self {
        Self {
            backing,
            source,
            total_written: AtomicU64::new(0),
            header_end: AtomicU64::new(0),
            max_accessed: AtomicU64::new(0),
            file_complete: AtomicBool::new(false),
            encoder_writes_enabled: AtomicBool::new(true),
            write_error: AtomicBool::new(false),
            fill_lock: Mutex::new(()),
        }
    }

    /// Append raw data at the end of the backing file. Loops on short
    /// writes; a failing write latches a terminal error that subsequent
    /// reads report.
    pub fn append(&self, data: &[u8]) -> io::Result<usize> {
        let mut pos = self.total_written.load(Ordering::Acquire);
        let mut remaining = data;
        while !remaining.is_empty() {
            match self.backing.write_at(remaining, pos) {
                Ok(0) => {
                    self.write_error.store(true, Ordering::Release);
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "conversion buffer backing file full",
                    ));
                }
                Ok(n) => {
                    pos += n as u64;
                    remaining = &remaining[n..];
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.write_error.store(true, Ordering::Release);
                    return Err(e);
                }
            }
        }
        self.total_written.store(pos, Ordering::Release);
        Ok(data.len())
    }

    /// Append for the encoder: swallowed while encoder writes are disabled
    /// (used to suppress the codec's own header while a hand-crafted one is
    /// emitted).
    pub fn encoder_append(&self, data: &[u8]) -> io::Result<usize> {
        if !self.encoder_writes_enabled.load(Ordering::Acquire) {
            return Ok(data.len());
        }
        self.append(data)
    }

    /// Overwrite a single byte at `offset`. Only valid for bytes already
    /// appended; used for surgical header edits.
    pub fn write_char_at(&self, c: u8, offset: u64) -> io::Result<()> {
        debug_assert!(offset < self.total_written.load(Ordering::Acquire));
        self.backing.write_all_at(&[c], offset)
    }

    /// Enable or disable encoder writes.
    pub fn set_encoder_writes_enabled(&self, enabled: bool) {
        self.encoder_writes_enabled.store(enabled, Ordering::Release);
    }

    /// Whether encoder writes currently land in the buffer.
    pub fn encoder_writes_enabled(&self) -> bool {
        self.encoder_writes_enabled.load(Ordering::Acquire)
    }

    /// Mark the current end of file as the end of the codec header. Reads
    /// below this offset are served short rather than starting conversion.
    pub fn header_finished(&self) {
        self.header_end
            .store(self.total_written.load(Ordering::Acquire), Ordering::Release);
    }

    /// Bytes produced so far.
    pub fn file_size(&self) -> u64 {
        self.total_written.load(Ordering::Acquire)
    }

    /// End of the codec header region.
    pub fn header_size(&self) -> u64 {
        self.header_end.load(Ordering::Acquire)
    }

    /// Highest byte position any reader has reached.
    pub fn max_accessed(&self) -> u64 {
        self.max_accessed.load(Ordering::Acquire)
    }

    /// Whether the producer has reported end of stream.
    pub fn is_file_complete(&self) -> bool {
        self.file_complete.load(Ordering::Acquire)
    }

    /// Mark the stream complete. Idempotent.
    pub fn notify_file_complete(&self) {
        self.file_complete.store(true, Ordering::Release);
    }

    /// Drive the producer until at least `requested_min_written` bytes
    /// exist or the stream ends. Returns whether the stream is complete.
    pub fn fill_until(&self, requested_min_written: u64) -> bool {
        let _fill = lock(&self.fill_lock);
        while !self.file_complete.load(Ordering::Acquire)
            && self.total_written.load(Ordering::Acquire) < requested_min_written
        {
            let Some(source) = self.source.upgrade() else {
                // Producer is gone; whatever we have is all there is.
                self.file_complete.store(true, Ordering::Release);
                break;
            };
            if !source.add_more_sound_data() {
                self.file_complete.store(true, Ordering::Release);
            }
        }
        self.file_complete.load(Ordering::Acquire)
    }

    /// Read up to `dst.len()` bytes at `offset`, producing data first if
    /// needed.
    ///
    /// Within the header region short reads are acceptable - metadata
    /// probes must not start the convolver. Past the header the full
    /// requested length is materialised, since some clients treat a short
    /// read as end of file.
    pub fn read(&self, dst: &mut [u8], offset: u64) -> io::Result<usize> {
        if self.write_error.load(Ordering::Acquire) {
            return Err(io::Error::other("conversion buffer write previously failed"));
        }

        let header_end = self.header_end.load(Ordering::Acquire);
        let required_min_written = offset
            + if offset >= header_end {
                dst.len() as u64
            } else {
                1
            };
        self.fill_until(required_min_written);

        let available = self.total_written.load(Ordering::Acquire).saturating_sub(offset);
        let want = (dst.len() as u64).min(available) as usize;
        if want == 0 {
            return Ok(0);
        }
        self.backing.read_exact_at(&mut dst[..want], offset)?;
        self.max_accessed
            .fetch_max(offset + want as u64, Ordering::AcqRel);
        Ok(want)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    /// Produces `chunks` chunks of `chunk_size` 'x' bytes, header first.
    struct ChunkSource {
        buffer: Mutex<Option<Arc<ConversionBuffer>>>,
        chunks_left: AtomicUsize,
        chunk_size: usize,
        calls: AtomicUsize,
    }

    impl ChunkSource {
        fn new(chunks: usize, chunk_size: usize) -> Arc<Self> {
            Arc::new(Self {
                buffer: Mutex::new(None),
                chunks_left: AtomicUsize::new(chunks),
                chunk_size,
                calls: AtomicUsize::new(0),
            })
        }

        fn with_buffer(self: &Arc<Self>, header: &[u8]) -> Arc<ConversionBuffer> {
            let self_dyn: Arc<dyn SoundSource> = self.clone();
            let weak: Weak<dyn SoundSource> = Arc::downgrade(&self_dyn);
            let buffer = Arc::new(ConversionBuffer::new(weak).unwrap());
            buffer.append(header).unwrap();
            buffer.header_finished();
            *self.buffer.lock().unwrap() = Some(Arc::clone(&buffer));
            buffer
        }
    }

    impl SoundSource for ChunkSource {
        fn add_more_sound_data(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.chunks_left.load(Ordering::SeqCst);
            if left == 0 {
                return false;
            }
            let buffer = self.buffer.lock().unwrap().clone().unwrap();
            buffer.append(&vec![b'x'; self.chunk_size]).unwrap();
            self.chunks_left.store(left - 1, Ordering::SeqCst);
            left > 1
        }
    }

    #[test]
    fn header_reads_do_not_start_producer() {
        let source = ChunkSource::new(4, 100);
        let buffer = source.with_buffer(b"HEADER");

        let mut dst = [0u8; 64];
        let n = buffer.read(&mut dst, 0).unwrap();
        assert_eq!(n, 6, "short read within header region");
        assert_eq!(&dst[..6], b"HEADER");
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert_eq!(buffer.file_size(), buffer.header_size());
    }

    #[test]
    fn reads_past_header_materialise_fully() {
        let source = ChunkSource::new(4, 100);
        let buffer = source.with_buffer(b"HEADER");

        let mut dst = [0u8; 150];
        let n = buffer.read(&mut dst, 6).unwrap();
        assert_eq!(n, 150, "full read past the header");
        assert!(dst.iter().all(|&b| b == b'x'));
        assert!(buffer.file_size() >= 156);
        assert_eq!(buffer.max_accessed(), 156);
    }

    #[test]
    fn exhausted_producer_marks_complete() {
        let source = ChunkSource::new(2, 10);
        let buffer = source.with_buffer(b"H");

        let mut dst = [0u8; 200];
        let n = buffer.read(&mut dst, 1).unwrap();
        assert_eq!(n, 20, "whatever was produced before EOF");
        assert!(buffer.is_file_complete());

        // Reads beyond the end now return 0 without calling the producer.
        let calls = source.calls.load(Ordering::SeqCst);
        assert_eq!(buffer.read(&mut dst, 100).unwrap(), 0);
        assert_eq!(source.calls.load(Ordering::SeqCst), calls);
    }

    #[test]
    fn counters_are_monotonic() {
        let source = ChunkSource::new(8, 50);
        let buffer = source.with_buffer(b"HH");

        let mut last_written = 0;
        let mut dst = [0u8; 60];
        for i in 0..5 {
            buffer.read(&mut dst, i * 60).unwrap();
            let written = buffer.file_size();
            assert!(written >= last_written);
            assert!(buffer.header_size() <= written);
            assert!(buffer.max_accessed() <= written);
            last_written = written;
        }
    }

    #[test]
    fn write_char_at_patches_appended_bytes() {
        let source = ChunkSource::new(0, 0);
        let buffer = source.with_buffer(b"fLaC\x00\x00\x00\x22");
        buffer.write_char_at(0xAB, 4).unwrap();

        let mut dst = [0u8; 8];
        buffer.read(&mut dst, 0).unwrap();
        assert_eq!(dst[4], 0xAB);
        assert_eq!(&dst[..4], b"fLaC");
    }

    #[test]
    fn encoder_gate_swallows_writes() {
        let source = ChunkSource::new(0, 0);
        let buffer = source.with_buffer(b"");
        buffer.set_encoder_writes_enabled(false);
        assert_eq!(buffer.encoder_append(b"hidden").unwrap(), 6);
        assert_eq!(buffer.file_size(), 0);

        buffer.set_encoder_writes_enabled(true);
        buffer.encoder_append(b"visible").unwrap();
        assert_eq!(buffer.file_size(), 7);
    }

    #[test]
    fn dead_source_completes_buffer() {
        let source = ChunkSource::new(4, 10);
        let buffer = source.with_buffer(b"H");
        // Break the cycle for this test, then drop the producer.
        *source.buffer.lock().unwrap() = None;
        drop(source);

        let mut dst = [0u8; 64];
        let n = buffer.read(&mut dst, 0).unwrap();
        assert_eq!(n, 1);
        assert_eq!(buffer.read(&mut dst, 10).unwrap(), 0);
        assert!(buffer.is_file_complete());
    }
}
