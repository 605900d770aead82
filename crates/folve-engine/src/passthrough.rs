//! Handler serving a file bit-exactly from the underlying filesystem.
//!
//! Used for everything that is not a sound file, and as the fallback when
//! no filter configuration matches a sound file's format.

use crate::handler::{FileHandler, HandlerStats, ReportedStat};
use crate::lock;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

/// Positional reads straight from the underlying descriptor.
pub struct PassThroughHandler {
    file: File,
    file_size: u64,
    max_accessed: AtomicU64,
    stats: Mutex<HandlerStats>,
}

impl PassThroughHandler {
    /// Wrap `file`; `known_stats` carries whatever was learned while
    /// trying (and failing) to build a convolving handler.
    pub fn new(file: File, mut known_stats: HandlerStats) -> Self {
        tracing::debug!(file = %known_stats.filename, "creating pass-through handler");
        let file_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        known_stats.filter_dir = String::new(); // pass through.
        Self {
            file,
            file_size,
            max_accessed: AtomicU64::new(0),
            stats: Mutex::new(known_stats),
        }
    }
}

impl FileHandler for PassThroughHandler {
    fn filter_dir(&self) -> &str {
        ""
    }

    fn read(&self, dst: &mut [u8], offset: u64) -> io::Result<usize> {
        let n = self.file.read_at(dst, offset)?;
        self.max_accessed.fetch_max(offset + n as u64, Ordering::AcqRel);
        Ok(n)
    }

    fn stat(&self) -> io::Result<ReportedStat> {
        let meta = self.file.metadata()?;
        Ok(ReportedStat {
            size: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        })
    }

    fn handler_stats(&self) -> HandlerStats {
        let mut stats = lock(&self.stats).clone();
        if self.file_size > 0 {
            let progress =
                self.max_accessed.load(Ordering::Acquire) as f32 / self.file_size as f32;
            stats.buffer_progress = progress;
            stats.access_progress = progress;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn handler_for(content: &[u8]) -> PassThroughHandler {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(content).unwrap();
        PassThroughHandler::new(f, HandlerStats::new("/notes.txt", "subdir"))
    }

    #[test]
    fn reads_are_bit_exact() {
        let handler = handler_for(b"hello, pass-through world");
        let mut dst = [0u8; 5];
        assert_eq!(handler.read(&mut dst, 7).unwrap(), 5);
        assert_eq!(&dst, b"pass-");
    }

    #[test]
    fn filter_dir_is_cleared() {
        let handler = handler_for(b"x");
        assert_eq!(handler.filter_dir(), "");
        assert_eq!(handler.handler_stats().filter_dir, "");
    }

    #[test]
    fn progress_tracks_max_access() {
        let handler = handler_for(&[0u8; 100]);
        let mut dst = [0u8; 50];
        handler.read(&mut dst, 0).unwrap();
        assert!((handler.handler_stats().access_progress - 0.5).abs() < 1e-6);
        handler.read(&mut dst, 50).unwrap();
        assert!((handler.handler_stats().access_progress - 1.0).abs() < 1e-6);
    }

    #[test]
    fn stat_reports_underlying_size() {
        let handler = handler_for(&[0u8; 1234]);
        assert_eq!(handler.stat().unwrap().size, 1234);
    }
}
