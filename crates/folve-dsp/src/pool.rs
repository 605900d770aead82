//! Recycling of configured sound processors.
//!
//! Building a processor means parsing a filter configuration and planning
//! FFTs, which is far too expensive to redo on every file open. The pool
//! keeps a bounded free list of idle processors per resolved configuration
//! file and resolves the most specific configuration for a given audio
//! format.

use crate::error::DspError;
use crate::processor::SoundProcessor;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Bounded free-list of [`SoundProcessor`]s keyed by resolved config path.
pub struct ProcessorPool {
    max_per_config: usize,
    pool: Mutex<HashMap<PathBuf, VecDeque<SoundProcessor>>>,
}

impl ProcessorPool {
    /// Create a pool keeping at most `max_per_config` idle processors per
    /// configuration file.
    pub fn new(max_per_config: usize) -> Self {
        Self {
            max_per_config,
            pool: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the most specific readable configuration under `base_dir` for
    /// the given format: `filter-<rate>-<channels>-<bits>.conf`, then
    /// `filter-<rate>-<channels>.conf`, then `filter-<rate>.conf`.
    fn resolve_config(
        base_dir: &Path,
        sample_rate: u32,
        channels: usize,
        bits: u32,
    ) -> Option<PathBuf> {
        let candidates = [
            format!("filter-{sample_rate}-{channels}-{bits}.conf"),
            format!("filter-{sample_rate}-{channels}.conf"),
            format!("filter-{sample_rate}.conf"),
        ];
        candidates.iter().map(|name| base_dir.join(name)).find(|path| {
            // Readability, not just existence: the config may be there but
            // unreadable for the mounting user.
            File::open(path).is_ok()
        })
    }

    /// Get an idle processor for the resolved configuration, or create one.
    pub fn get_or_create(
        &self,
        base_dir: &Path,
        sample_rate: u32,
        channels: usize,
        bits: u32,
    ) -> Result<SoundProcessor, DspError> {
        let config_path = Self::resolve_config(base_dir, sample_rate, channels, bits)
            .ok_or_else(|| DspError::NoFilterForFormat {
                sample_rate,
                channels,
                bits,
                dir: base_dir.to_path_buf(),
            })?;

        if let Some(processor) = self.check_out(&config_path) {
            tracing::debug!(config = %config_path.display(), "processor from pool");
            return Ok(processor);
        }

        tracing::debug!(config = %config_path.display(), "creating new processor");
        SoundProcessor::create(&config_path, sample_rate, channels).inspect_err(|e| {
            tracing::error!(config = %config_path.display(), error = %e, "filter config is broken");
        })
    }

    /// Return a processor to the pool. It is reset before storage; if the
    /// per-config free list is full the processor is dropped.
    pub fn put_back(&self, mut processor: SoundProcessor) {
        processor.reset();
        let key = processor.config_file().to_path_buf();
        let mut pool = lock(&self.pool);
        let list = pool.entry(key).or_default();
        if list.len() < self.max_per_config {
            list.push_back(processor);
        }
    }

    fn check_out(&self, config_path: &Path) -> Option<SoundProcessor> {
        let mut pool = lock(&self.pool);
        pool.get_mut(config_path)?.pop_front()
    }

    /// Number of idle processors for a resolved config path.
    #[cfg(test)]
    fn idle_count(&self, config_path: &Path) -> usize {
        lock(&self.pool).get(config_path).map_or(0, VecDeque::len)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const DIRAC: &str = "/convolver/new 2 2 64 128\n\
                         /impulse/dirac 1 1 1.0 0\n\
                         /impulse/dirac 2 2 1.0 0\n";

    fn config_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("filter-44100.conf"), DIRAC).unwrap();
        fs::write(dir.path().join("filter-44100-2.conf"), DIRAC).unwrap();
        fs::write(dir.path().join("filter-44100-2-24.conf"), DIRAC).unwrap();
        dir
    }

    #[test]
    fn resolves_most_specific_first() {
        let dir = config_dir();
        let found = ProcessorPool::resolve_config(dir.path(), 44100, 2, 24).unwrap();
        assert!(found.ends_with("filter-44100-2-24.conf"));

        let found = ProcessorPool::resolve_config(dir.path(), 44100, 2, 16).unwrap();
        assert!(found.ends_with("filter-44100-2.conf"));

        let found = ProcessorPool::resolve_config(dir.path(), 44100, 1, 16).unwrap();
        assert!(found.ends_with("filter-44100.conf"));

        assert!(ProcessorPool::resolve_config(dir.path(), 96000, 2, 24).is_none());
    }

    #[test]
    fn missing_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ProcessorPool::new(3);
        let err = pool.get_or_create(dir.path(), 44100, 2, 16).unwrap_err();
        assert!(matches!(err, DspError::NoFilterForFormat { .. }));
    }

    #[test]
    fn returned_processor_is_reused() {
        let dir = config_dir();
        let pool = ProcessorPool::new(3);
        let p = pool.get_or_create(dir.path(), 44100, 1, 16).unwrap();
        let config = p.config_file().to_path_buf();
        pool.put_back(p);
        assert_eq!(pool.idle_count(&config), 1);

        let p2 = pool.get_or_create(dir.path(), 44100, 1, 16).unwrap();
        assert_eq!(p2.config_file(), config);
        assert_eq!(pool.idle_count(&config), 0);
    }

    #[test]
    fn returned_processor_is_reset() {
        let dir = config_dir();
        let pool = ProcessorPool::new(3);
        let mut p = pool.get_or_create(dir.path(), 44100, 1, 16).unwrap();

        struct One;
        impl crate::FrameReader for One {
            fn read_frames(&mut self, dst: &mut [f32], max: usize) -> std::io::Result<usize> {
                dst[..max].fill(1.0);
                Ok(max)
            }
        }
        p.fill_buffer(&mut One).unwrap();
        let mut sink: Vec<f32> = Vec::new();
        let n = p.pending_writes();
        assert_eq!(n, 0);
        p.write_processed(&mut sink, 8).unwrap();
        assert!(p.max_output_value() > 0.0);
        let config = p.config_file().to_path_buf();
        pool.put_back(p);

        let p2 = pool.check_out(&config).unwrap();
        assert_eq!(p2.max_output_value(), 0.0);
        assert_eq!(p2.pending_writes(), 0);
        assert!(!p2.is_input_buffer_complete());
    }

    #[test]
    fn free_list_is_bounded() {
        let dir = config_dir();
        let pool = ProcessorPool::new(2);
        let a = pool.get_or_create(dir.path(), 44100, 1, 16).unwrap();
        let b = pool.get_or_create(dir.path(), 44100, 1, 16).unwrap();
        let c = pool.get_or_create(dir.path(), 44100, 1, 16).unwrap();
        let config = a.config_file().to_path_buf();
        pool.put_back(a);
        pool.put_back(b);
        pool.put_back(c);
        assert_eq!(pool.idle_count(&config), 2);
    }
}
