//! The facade the filesystem host talks to: path resolution, handler
//! minting, filter-directory switching and gapless sibling discovery.

use crate::buffer::ConversionBuffer;
use crate::cache::FileHandlerCache;
use crate::convolve::ConvolveFileHandler;
use crate::error::EngineError;
use crate::handler::{FileHandler, HandlerStats, ReportedStat};
use crate::lock;
use crate::passthrough::PassThroughHandler;
use crate::prebuffer::BufferThread;
use folve_dsp::ProcessorPool;
use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Tunables for [`FolveFilesystem`].
#[derive(Debug, Clone)]
pub struct FolveOptions {
    /// Directory whose (audio) files are served convolved.
    pub underlying_dir: PathBuf,
    /// Filter configuration directories; all must share one parent, which
    /// becomes the base every switch is validated against.
    pub config_dirs: Vec<PathBuf>,
    /// Hand FIR state across alphabetically adjacent tracks.
    pub gapless_processing: bool,
    /// Allow the status page to toggle debug logging.
    pub debug_ui_enabled: bool,
    /// Initial reported size = original size × this factor.
    pub file_oversize_factor: f64,
    /// How far ahead of the reader the pre-buffer worker aims.
    pub pre_buffer_size: u64,
    /// Handlers kept across close/reopen cycles.
    pub max_cached_handlers: usize,
    /// Idle processors kept per filter configuration.
    pub max_processors_per_config: usize,
}

impl Default for FolveOptions {
    fn default() -> Self {
        Self {
            underlying_dir: PathBuf::new(),
            config_dirs: Vec::new(),
            gapless_processing: false,
            debug_ui_enabled: false,
            file_oversize_factor: 1.25,
            pre_buffer_size: 128 << 10,
            max_cached_handlers: 4,
            max_processors_per_config: 3,
        }
    }
}

/// The engine singleton: owns the handler cache, the processor pool and
/// the pre-buffer worker.
pub struct FolveFilesystem {
    underlying_dir: PathBuf,
    base_config_dir: PathBuf,
    /// Selectable filter subdirectories; index 0 is "" (pass-through).
    config_dirs: Vec<String>,
    current_config_subdir: Mutex<String>,
    gapless_processing: bool,
    debug_ui_enabled: bool,
    file_oversize_factor: f64,
    pre_buffer_size: u64,

    cache: FileHandlerCache,
    pool: ProcessorPool,
    prebuffer: BufferThread,

    total_file_openings: AtomicU64,
    total_file_reopen: AtomicU64,
}

impl FolveFilesystem {
    /// Validate the directories and assemble the engine.
    pub fn new(options: FolveOptions) -> Result<Arc<Self>, EngineError> {
        let underlying_dir = options
            .underlying_dir
            .canonicalize()
            .map_err(|_| EngineError::BadUnderlyingDir(options.underlying_dir.clone()))?;
        if !underlying_dir.is_dir() {
            return Err(EngineError::BadUnderlyingDir(underlying_dir));
        }

        let mut config_dirs = vec![String::new()];
        let mut base_config_dir = PathBuf::new();
        for dir in &options.config_dirs {
            let canonical = dir
                .canonicalize()
                .map_err(|_| EngineError::BadConfigDir(dir.clone()))?;
            if !canonical.is_dir() {
                return Err(EngineError::BadConfigDir(canonical));
            }
            let parent = canonical
                .parent()
                .ok_or_else(|| EngineError::BadConfigDir(canonical.clone()))?
                .to_path_buf();
            if base_config_dir.as_os_str().is_empty() {
                base_config_dir = parent;
            } else if parent != base_config_dir {
                return Err(EngineError::ConfigDirMismatch {
                    dir: canonical,
                    base: base_config_dir,
                });
            }
            let name = canonical
                .file_name()
                .ok_or_else(|| EngineError::BadConfigDir(canonical.clone()))?
                .to_string_lossy()
                .into_owned();
            if !config_dirs.contains(&name) {
                config_dirs.push(name);
            }
        }

        Ok(Arc::new(Self {
            underlying_dir,
            base_config_dir,
            config_dirs,
            current_config_subdir: Mutex::new(String::new()),
            gapless_processing: options.gapless_processing,
            debug_ui_enabled: options.debug_ui_enabled,
            file_oversize_factor: options.file_oversize_factor,
            pre_buffer_size: options.pre_buffer_size,
            cache: FileHandlerCache::new(options.max_cached_handlers),
            pool: ProcessorPool::new(options.max_processors_per_config),
            prebuffer: BufferThread::start(options.pre_buffer_size),
            total_file_openings: AtomicU64::new(0),
            total_file_reopen: AtomicU64::new(0),
        }))
    }

    /// Pick the initial filter: the first configured directory, if any.
    pub fn setup_initial_config(&self) {
        if self.config_dirs.len() <= 1 {
            tracing::warn!(
                "no filter configuration directories given; \
                 all files will be passed through verbatim"
            );
            return;
        }
        self.switch_current_config_index(1);
    }

    /// Directory this filesystem mirrors.
    pub fn underlying_dir(&self) -> &Path {
        &self.underlying_dir
    }

    /// Selectable filter names; index 0 is pass-through.
    pub fn config_dirs(&self) -> &[String] {
        &self.config_dirs
    }

    /// The active filter subdirectory ("" = pass-through).
    pub fn current_config_subdir(&self) -> String {
        lock(&self.current_config_subdir).clone()
    }

    /// Index of the active filter within [`config_dirs`](Self::config_dirs),
    /// if it is one of the configured ones.
    pub fn current_config_index(&self) -> Option<usize> {
        let current = self.current_config_subdir();
        self.config_dirs.iter().position(|d| *d == current)
    }

    /// Whether gapless hand-over between adjacent tracks is enabled.
    pub fn gapless_processing(&self) -> bool {
        self.gapless_processing
    }

    /// Whether the status page may toggle debug logging.
    pub fn debug_ui_enabled(&self) -> bool {
        self.debug_ui_enabled
    }

    /// Initial size over-reporting factor.
    pub fn file_oversize_factor(&self) -> f64 {
        self.file_oversize_factor
    }

    /// Pre-buffer distance in bytes.
    pub fn pre_buffer_size(&self) -> u64 {
        self.pre_buffer_size
    }

    /// The shared processor pool.
    pub fn processor_pool(&self) -> &ProcessorPool {
        &self.pool
    }

    /// The handler cache (status page reads stats through this).
    pub fn handler_cache(&self) -> &FileHandlerCache {
        &self.cache
    }

    /// Files opened fresh so far.
    pub fn total_file_openings(&self) -> u64 {
        self.total_file_openings.load(Ordering::Relaxed)
    }

    /// Opens served from the cache so far.
    pub fn total_file_reopen(&self) -> u64 {
        self.total_file_reopen.load(Ordering::Relaxed)
    }

    /// Absolute config path for a filter subdirectory.
    pub(crate) fn config_dir_path(&self, subdir: &str) -> PathBuf {
        self.base_config_dir.join(subdir)
    }

    fn underlying_path(&self, fs_path: &str) -> PathBuf {
        self.underlying_dir.join(fs_path.trim_start_matches('/'))
    }

    fn cache_key(config_subdir: &str, fs_path: &str) -> String {
        format!("{config_subdir}{fs_path}")
    }

    /// Find the cached handler for `fs_path` (under the active filter) or
    /// create one, pinned either way.
    pub fn get_or_create_handler(
        self: &Arc<Self>,
        fs_path: &str,
    ) -> io::Result<Arc<dyn FileHandler>> {
        let config_subdir = self.current_config_subdir();
        let cache_key = Self::cache_key(&config_subdir, fs_path);
        if let Some(handler) = self.cache.find_and_pin(&cache_key) {
            self.total_file_reopen.fetch_add(1, Ordering::Relaxed);
            return Ok(handler);
        }

        let file = File::open(self.underlying_path(fs_path))?;
        self.total_file_openings.fetch_add(1, Ordering::Relaxed);
        let handler = self.create_handler(file, &config_subdir, fs_path);
        Ok(self.cache.insert_pinned(&cache_key, handler))
    }

    fn create_handler(
        self: &Arc<Self>,
        file: File,
        config_subdir: &str,
        fs_path: &str,
    ) -> Arc<dyn FileHandler> {
        let stats = HandlerStats::new(fs_path, config_subdir);
        if !config_subdir.is_empty() {
            match ConvolveFileHandler::create(self, file, fs_path, config_subdir, stats) {
                Ok(handler) => return handler,
                Err((file, stats)) => {
                    // Not convolvable; fall through with what we learned.
                    return Arc::new(PassThroughHandler::new(file, stats));
                }
            }
        }
        Arc::new(PassThroughHandler::new(file, stats))
    }

    /// Release one pin on the handler for `fs_path`. The cache key uses
    /// the filter the handler was *created* under, which may no longer be
    /// the active one.
    pub fn close(&self, fs_path: &str, handler: &dyn FileHandler) {
        let cache_key = Self::cache_key(handler.filter_dir(), fs_path);
        self.cache.unpin(&cache_key);
    }

    /// Size estimate for a currently open file, without creating a
    /// handler.
    pub fn stat_by_filename(&self, fs_path: &str) -> Option<ReportedStat> {
        let cache_key = Self::cache_key(&self.current_config_subdir(), fs_path);
        let handler = self.cache.find_and_pin(&cache_key)?;
        let stat = handler.stat().ok();
        self.cache.unpin(&cache_key);
        stat
    }

    /// Sorted entries of `fs_dir` (mount path, trailing slash) with the
    /// given suffix, as mount paths. Used for gapless sibling discovery.
    pub fn list_directory(&self, fs_dir: &str, suffix: &str) -> io::Result<BTreeSet<String>> {
        let real_dir = self.underlying_path(fs_dir);
        let mut entries = BTreeSet::new();
        for entry in std::fs::read_dir(real_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(suffix) {
                entries.insert(format!("{fs_dir}{name}"));
            }
        }
        Ok(entries)
    }

    /// Validate `subdir` against the base config directory and make it the
    /// active filter. Returns whether the active filter changed.
    pub fn switch_current_config_dir(&self, subdir: &str) -> bool {
        let sanitized = if subdir.is_empty() {
            String::new()
        } else {
            match self.sanitize_config_subdir(subdir) {
                Some(s) => s,
                None => {
                    tracing::info!(subdir, "invalid config switch attempt");
                    return false;
                }
            }
        };
        let mut current = lock(&self.current_config_subdir);
        if *current == sanitized {
            return false;
        }
        if sanitized.is_empty() {
            tracing::info!("switching to pass-through mode");
        } else {
            tracing::info!(subdir = %sanitized, "switching config directory");
        }
        *current = sanitized;
        true
    }

    /// Switch by index into [`config_dirs`](Self::config_dirs).
    pub fn switch_current_config_index(&self, index: usize) -> bool {
        match self.config_dirs.get(index) {
            Some(subdir) => {
                let subdir = subdir.clone();
                self.switch_current_config_dir(&subdir)
            }
            None => false,
        }
    }

    /// Resolve `subdir` under the base config dir; reject anything that
    /// escapes it (`../` tricks, symlinks pointing outside) or is not a
    /// directory. Returns the canonical subdir relative to the base.
    fn sanitize_config_subdir(&self, subdir: &str) -> Option<String> {
        let candidate = self.base_config_dir.join(subdir);
        let canonical = candidate.canonicalize().ok()?;
        if !canonical.is_dir() {
            return None;
        }
        if canonical == self.base_config_dir {
            return Some(String::new()); // chose subdir '.'
        }
        let relative = canonical.strip_prefix(&self.base_config_dir).ok()?;
        Some(relative.to_string_lossy().into_owned())
    }

    /// Schedule background production for `buffer`.
    pub fn request_prebuffer(&self, buffer: &Arc<ConversionBuffer>) {
        self.prebuffer.enqueue(buffer);
    }

    /// Stop background production for `buffer`; blocks while the worker is
    /// inside it.
    pub fn quit_buffering(&self, buffer: &Arc<ConversionBuffer>) {
        self.prebuffer.forget(buffer);
    }

    /// Stop the pre-buffer worker. Called once at unmount.
    pub fn shutdown(&self) {
        self.prebuffer.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_dirs() -> (tempfile::TempDir, FolveOptions) {
        let root = tempfile::tempdir().unwrap();
        let underlying = root.path().join("music");
        std::fs::create_dir(&underlying).unwrap();
        let base = root.path().join("filters");
        std::fs::create_dir(&base).unwrap();
        for name in ["lowpass", "highpass"] {
            let dir = base.join(name);
            std::fs::create_dir(&dir).unwrap();
            std::fs::write(
                dir.join("filter-44100.conf"),
                "/convolver/new 2 2 64 128\n/impulse/dirac 1 1 1.0 0\n/impulse/dirac 2 2 1.0 0\n",
            )
            .unwrap();
        }
        let options = FolveOptions {
            underlying_dir: underlying,
            config_dirs: vec![base.join("lowpass"), base.join("highpass")],
            ..FolveOptions::default()
        };
        (root, options)
    }

    #[test]
    fn config_dirs_listed_with_passthrough_first() {
        let (_root, options) = setup_dirs();
        let fs = FolveFilesystem::new(options).unwrap();
        assert_eq!(fs.config_dirs(), &["", "lowpass", "highpass"]);
        assert_eq!(fs.current_config_subdir(), "");

        fs.setup_initial_config();
        assert_eq!(fs.current_config_subdir(), "lowpass");
        assert_eq!(fs.current_config_index(), Some(1));
        fs.shutdown();
    }

    #[test]
    fn switch_rejects_escape_attempts() {
        let (_root, options) = setup_dirs();
        let fs = FolveFilesystem::new(options).unwrap();
        assert!(!fs.switch_current_config_dir("../music"));
        assert!(!fs.switch_current_config_dir("nonexistent"));
        assert!(fs.switch_current_config_dir("highpass"));
        // Dot-tricks that stay inside the base are fine.
        assert!(fs.switch_current_config_dir("highpass/../lowpass"));
        assert_eq!(fs.current_config_subdir(), "lowpass");
        fs.shutdown();
    }

    #[test]
    fn rejects_config_dirs_with_different_parents() {
        let (_root, mut options) = setup_dirs();
        let stray = tempfile::tempdir().unwrap();
        options.config_dirs.push(stray.path().to_path_buf());
        assert!(matches!(
            FolveFilesystem::new(options),
            Err(EngineError::ConfigDirMismatch { .. })
        ));
    }

    #[test]
    fn rejects_missing_underlying_dir() {
        let (_root, mut options) = setup_dirs();
        options.underlying_dir = PathBuf::from("/definitely/not/here");
        assert!(matches!(
            FolveFilesystem::new(options),
            Err(EngineError::BadUnderlyingDir(_))
        ));
    }

    #[test]
    fn list_directory_filters_by_suffix() {
        let (root, options) = setup_dirs();
        let underlying = root.path().join("music");
        std::fs::write(underlying.join("a.flac"), b"x").unwrap();
        std::fs::write(underlying.join("b.flac"), b"x").unwrap();
        std::fs::write(underlying.join("cover.jpg"), b"x").unwrap();
        let fs = FolveFilesystem::new(options).unwrap();

        let entries = fs.list_directory("/", ".flac").unwrap();
        assert_eq!(
            entries.into_iter().collect::<Vec<_>>(),
            vec!["/a.flac".to_string(), "/b.flac".to_string()]
        );
        fs.shutdown();
    }
}
