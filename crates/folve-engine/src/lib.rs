//! The folve engine: the machinery that turns an underlying directory of
//! audio files into an on-demand convolved view of itself.
//!
//! The moving parts, bottom up:
//!
//! - [`ConversionBuffer`] - a file-backed byte store filled on demand by a
//!   producer callback, shared between reader threads and the pre-buffer
//!   worker.
//! - [`ConvolveFileHandler`] / [`PassThroughHandler`] - per-file handlers;
//!   the former owns the decode → convolve → encode pipeline and acts as
//!   its buffer's producer.
//! - [`FileHandlerCache`] - reference-counted, LRU-evicting handler map
//!   that keeps handler state alive across close/reopen storms.
//! - [`BufferThread`] - a single background worker round-robining chunked
//!   production across active conversions ahead of the readers.
//! - [`FolveFilesystem`] - the facade the filesystem host talks to.

mod buffer;
mod cache;
mod convolve;
mod error;
mod filesystem;
mod handler;
mod passthrough;
mod prebuffer;

pub use buffer::{ConversionBuffer, SoundSource};
pub use cache::{CacheObserver, FileHandlerCache};
pub use convolve::ConvolveFileHandler;
pub use error::EngineError;
pub use filesystem::{FolveFilesystem, FolveOptions};
pub use handler::{FileHandler, GaplessHandoff, HandlerStats, HandlerStatus, ReportedStat};
pub use passthrough::PassThroughHandler;
pub use prebuffer::BufferThread;

/// Seconds since the Unix epoch, with sub-second resolution.
pub fn current_time() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Lock a mutex, riding over poisoning: the engine's shared state stays
/// usable even if a producer thread panicked mid-conversion.
pub(crate) fn lock<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
