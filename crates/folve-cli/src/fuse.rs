//! FUSE dispatch glue: translates the kernel's inode-based protocol onto
//! the path-based [`FolveFilesystem`] facade.
//!
//! The filesystem is read-only; write bits are stripped from every
//! reported mode. Opens reply with `FOPEN_DIRECT_IO` so the convolving
//! handlers may legally return short reads within the header region.

use folve_engine::{FileHandler, FolveFilesystem};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, Request,
};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const ROOT_INO: u64 = 1;
/// Attributes of convolved files change as the size estimate grows; keep
/// the kernel's cache short.
const ATTR_TTL: Duration = Duration::from_secs(1);

/// Bidirectional inode ↔ mount-path table. Inodes are assigned on first
/// sight and never reused.
struct InodeTable {
    by_ino: HashMap<u64, String>,
    by_path: HashMap<String, u64>,
    next_ino: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut table = Self {
            by_ino: HashMap::new(),
            by_path: HashMap::new(),
            next_ino: ROOT_INO + 1,
        };
        table.by_ino.insert(ROOT_INO, "/".to_string());
        table.by_path.insert("/".to_string(), ROOT_INO);
        table
    }

    fn path_of(&self, ino: u64) -> Option<&str> {
        self.by_ino.get(&ino).map(String::as_str)
    }

    fn ino_of(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.by_path.get(path) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.by_ino.insert(ino, path.to_string());
        self.by_path.insert(path.to_string(), ino);
        ino
    }

    /// Child path under `parent`, or `None` for an unknown parent inode.
    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        let parent_path = self.path_of(parent)?;
        let name = name.to_string_lossy();
        Some(if parent_path == "/" {
            format!("/{name}")
        } else {
            format!("{parent_path}/{name}")
        })
    }
}

struct OpenFile {
    path: String,
    handler: Arc<dyn FileHandler>,
}

/// The fuser-facing adapter.
pub struct FolveFuse {
    fs: Arc<FolveFilesystem>,
    inodes: InodeTable,
    open_files: HashMap<u64, OpenFile>,
    next_fh: u64,
}

impl FolveFuse {
    /// Wrap the engine for mounting.
    pub fn new(fs: Arc<FolveFilesystem>) -> Self {
        Self {
            fs,
            inodes: InodeTable::new(),
            open_files: HashMap::new(),
            next_fh: 1,
        }
    }

    fn underlying_path(&self, fs_path: &str) -> PathBuf {
        self.fs
            .underlying_dir()
            .join(fs_path.trim_start_matches('/'))
    }

    /// Attributes from the underlying file, with write access removed and
    /// optionally the size replaced by a handler's estimate.
    fn attr_for(&mut self, fs_path: &str, size_override: Option<u64>) -> Option<FileAttr> {
        let meta = std::fs::symlink_metadata(self.underlying_path(fs_path)).ok()?;
        let ino = self.inodes.ino_of(fs_path);

        let kind = if meta.file_type().is_dir() {
            FileType::Directory
        } else if meta.file_type().is_symlink() {
            FileType::Symlink
        } else {
            FileType::RegularFile
        };
        let size = if kind == FileType::RegularFile {
            size_override.unwrap_or(meta.len())
        } else {
            meta.len()
        };

        Some(FileAttr {
            ino,
            size,
            blocks: size.div_ceil(512),
            atime: meta.accessed().unwrap_or(UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(UNIX_EPOCH),
            ctime: UNIX_EPOCH + Duration::from_secs(meta.ctime().max(0) as u64),
            crtime: UNIX_EPOCH,
            kind,
            // Whatever write mode was there before: now things are
            // read-only.
            perm: (meta.mode() & 0o7777 & !0o222) as u16,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: meta.blksize() as u32,
            flags: 0,
        })
    }

    fn estimated_size(&self, fs_path: &str) -> Option<u64> {
        self.fs.stat_by_filename(fs_path).map(|stat| stat.size)
    }
}

impl Filesystem for FolveFuse {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut KernelConfig,
    ) -> Result<(), libc::c_int> {
        tracing::info!(
            underlying = %self.fs.underlying_dir().display(),
            "folve filesystem ready"
        );
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("unmounting; stopping background work");
        self.fs.shutdown();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.inodes.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let size = self.estimated_size(&path);
        match self.attr_for(&path, size) {
            Some(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.inodes.path_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        // A currently open file knows its size estimate better than the
        // underlying filesystem does.
        let size = self.estimated_size(&path);
        match self.attr_for(&path, size) {
            Some(attr) => reply.attr(&ATTR_TTL, &attr),
            None => reply.error(libc::ENOENT),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match std::fs::read_link(self.underlying_path(path)) {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(dir_path) = self.inodes.path_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        let read_dir = match std::fs::read_dir(self.underlying_path(&dir_path)) {
            Ok(rd) => rd,
            Err(e) => {
                reply.error(e.raw_os_error().unwrap_or(libc::EIO));
                return;
            }
        };

        let parent_ino = if dir_path == "/" {
            ROOT_INO
        } else {
            let parent = match dir_path.rsplit_once('/') {
                Some(("", _)) | None => "/",
                Some((p, _)) => p,
            };
            self.inodes.ino_of(parent)
        };
        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for entry in read_dir.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let child = if dir_path == "/" {
                format!("/{name}")
            } else {
                format!("{dir_path}/{name}")
            };
            let kind = entry.file_type().map_or(FileType::RegularFile, |t| {
                if t.is_dir() {
                    FileType::Directory
                } else if t.is_symlink() {
                    FileType::Symlink
                } else {
                    FileType::RegularFile
                }
            });
            entries.push((self.inodes.ino_of(&child), kind, name));
        }

        for (i, (entry_ino, kind, name)) in
            entries.into_iter().enumerate().skip(offset.max(0) as usize)
        {
            if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.inodes.path_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.get_or_create_handler(&path) {
            Ok(handler) => {
                let fh = self.next_fh;
                self.next_fh += 1;
                self.open_files.insert(fh, OpenFile { path, handler });
                // Direct I/O: we are allowed to return partial reads, which
                // keeps metadata probing from triggering convolution.
                reply.opened(fh, fuser::consts::FOPEN_DIRECT_IO);
            }
            Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(open_file) = self.open_files.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut buf = vec![0u8; size as usize];
        match open_file.handler.read(&mut buf, offset.max(0) as u64) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some(open_file) = self.open_files.remove(&fh) {
            self.fs.close(&open_file.path, &*open_file.handler);
        }
        reply.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_preassigned() {
        let table = InodeTable::new();
        assert_eq!(table.path_of(ROOT_INO), Some("/"));
    }

    #[test]
    fn inodes_are_stable_per_path() {
        let mut table = InodeTable::new();
        let a = table.ino_of("/music/a.flac");
        let b = table.ino_of("/music/b.flac");
        assert_ne!(a, b);
        assert_eq!(table.ino_of("/music/a.flac"), a);
        assert_eq!(table.path_of(a), Some("/music/a.flac"));
    }

    #[test]
    fn child_paths_compose() {
        let mut table = InodeTable::new();
        assert_eq!(
            table.child_path(ROOT_INO, OsStr::new("music")),
            Some("/music".to_string())
        );
        let music = table.ino_of("/music");
        assert_eq!(
            table.child_path(music, OsStr::new("a.flac")),
            Some("/music/a.flac".to_string())
        );
        assert_eq!(table.child_path(999, OsStr::new("x")), None);
    }
}
