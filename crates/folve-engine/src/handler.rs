//! The file handler abstraction and its observable state.

use folve_dsp::SoundProcessor;
use std::io;
use std::time::SystemTime;

/// Lifecycle state of a cached handler, as shown on the status page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandlerStatus {
    /// Currently pinned by at least one open file.
    Open,
    /// Cached with no references.
    Idle,
    /// Evicted from the cache; stats survive on the status page.
    Retired,
}

/// Observable state of one handler. Filled in by the handler itself plus
/// the cache (status, last access); a copy outlives the handler on the
/// status page's retired list.
#[derive(Debug, Clone)]
pub struct HandlerStats {
    /// Path as seen through the mount.
    pub filename: String,
    /// Format description if recognised, e.g. `44.1kHz, 16 Bit`.
    pub format: String,
    /// Latest error or note for display.
    pub message: String,
    /// Audio length in seconds; `-1` if unknown.
    pub duration_seconds: i64,
    /// Fraction of the input decoded and convolved so far, `0..=1`.
    pub buffer_progress: f32,
    /// Fraction of the produced output actually read by clients, `0..=1`.
    pub access_progress: f32,
    /// Cache lifecycle state.
    pub status: HandlerStatus,
    /// Last cache access, seconds since the epoch.
    pub last_access: f64,
    /// Peak absolute output sample observed, `>= 0`.
    pub max_output_value: f32,
    /// This handler continued a processor handed over by the previous track.
    pub in_gapless: bool,
    /// This handler passed its processor on to the next track.
    pub out_gapless: bool,
    /// Active filter subdirectory; empty for pass-through.
    pub filter_dir: String,
}

impl HandlerStats {
    /// Fresh stats for a file about to be opened.
    pub fn new(filename: &str, filter_dir: &str) -> Self {
        Self {
            filename: filename.to_string(),
            format: String::new(),
            message: String::new(),
            duration_seconds: -1,
            buffer_progress: 0.0,
            access_progress: 0.0,
            status: HandlerStatus::Open,
            last_access: 0.0,
            max_output_value: 0.0,
            in_gapless: false,
            out_gapless: false,
            filter_dir: filter_dir.to_string(),
        }
    }
}

/// Size and timestamp a handler wants the host to report for its file.
#[derive(Debug, Clone, Copy)]
pub struct ReportedStat {
    /// Reported file size. For convolved files an estimate that only ever
    /// grows.
    pub size: u64,
    /// Modification time of the underlying file.
    pub modified: SystemTime,
}

/// Outcome of offering a donor processor to the next track's handler.
pub enum GaplessHandoff {
    /// The receiver took ownership. The donor writes `donor_tail` (its own
    /// final processed frames) to its output and must not return the
    /// processor to the pool.
    Accepted {
        /// The donor's final frames, convolved across the track boundary.
        donor_tail: Vec<f32>,
        /// Peak output up to and including those frames.
        donor_max_output: f32,
    },
    /// The receiver declined; the processor returns to the donor.
    Refused(Box<SoundProcessor>),
}

/// Operations on an opened file. Read-only, so this is a small surface.
///
/// Handlers are owned by the handler cache and may outlive any single
/// open/close cycle of the host filesystem.
pub trait FileHandler: Send + Sync {
    /// Filter subdirectory this handler was created under; empty for
    /// pass-through.
    fn filter_dir(&self) -> &str;

    /// Read up to `dst.len()` bytes at `offset`. May block while the
    /// conversion catches up.
    fn read(&self, dst: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Current size/time to report to the host.
    fn stat(&self) -> io::Result<ReportedStat>;

    /// Snapshot of the observable state.
    fn handler_stats(&self) -> HandlerStats;

    /// Offer a processor from the alphabetically previous track. The
    /// default declines.
    fn accept_processor(
        &self,
        processor: Box<SoundProcessor>,
        donor_frames: usize,
    ) -> GaplessHandoff {
        let _ = donor_frames;
        GaplessHandoff::Refused(processor)
    }

    /// Called once the donor no longer references a passed-over processor;
    /// a good moment to start pre-buffering.
    fn notify_passed_processor_unreferenced(&self) {}
}
