//! The filesystem operation surface (§4.4): wires the [`crate::resolver`]
//! and [`crate::cache`] components together behind a [`fuser::Filesystem`]
//! implementation, mapping virtual paths to FUSE inode numbers and
//! refusing every mutating operation.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, Request,
};
use tracing::{trace, warn};

use crate::archive::Archive;
use crate::cache::{self, ExtractionCache};
use crate::config::Config;
use crate::error::{Error, RarResult};
use crate::resolver::stat::Stat;
use crate::resolver::{OpenTarget, Resolver};

/// Attribute cache lifetime handed back to the kernel. The projection can
/// change underneath us (a file is added to the source tree, an archive's
/// contents are re-scanned), so this is kept short rather than `Duration`-
/// max like a strictly static filesystem would use.
const TTL: Duration = Duration::from_secs(1);

const ROOT_INO: u64 = 1;

/// A handle produced by [`Fs::open`], dispatched on read (§4.4, "Replace
/// dynamic dispatch for open files" in §9): a tagged union over where the
/// bytes actually live.
enum OpenFile {
    Host(fs::File),
    Store { archive: Arc<Archive>, entry_name: String },
    Cache { path: PathBuf, real_size: u64 },
}

/// Bidirectional virtual-path/inode mapping. FUSE addresses everything by
/// inode; the resolver addresses everything by path. Entries accumulate
/// for the process lifetime, same as the resolver's own VFS table (§3).
#[derive(Default)]
struct InodeTable {
    by_path: HashMap<PathBuf, u64>,
    by_ino: HashMap<u64, PathBuf>,
    next: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut table = InodeTable {
            by_path: HashMap::new(),
            by_ino: HashMap::new(),
            next: ROOT_INO + 1,
        };
        table.by_path.insert(PathBuf::from("/"), ROOT_INO);
        table.by_ino.insert(ROOT_INO, PathBuf::from("/"));
        table
    }

    fn intern(&mut self, path: PathBuf) -> u64 {
        if let Some(&ino) = self.by_path.get(&path) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_path.insert(path.clone(), ino);
        self.by_ino.insert(ino, path);
        ino
    }

    fn path(&self, ino: u64) -> Option<PathBuf> {
        self.by_ino.get(&ino).cloned()
    }
}

pub struct Fs {
    resolver: Resolver,
    cache: Option<ExtractionCache>,
    source_root: PathBuf,
    inodes: Mutex<InodeTable>,
    open_files: Mutex<HashMap<u64, OpenFile>>,
    next_fh: AtomicU64,
}

impl Fs {
    pub fn new(config: &Config) -> Self {
        let resolver = Resolver::new(config);
        let cache = config
            .enable_unrar
            .then(|| ExtractionCache::new(config.resolved_cache_dir()));

        Fs {
            source_root: resolver.source_root().to_path_buf(),
            resolver,
            cache,
            inodes: Mutex::new(InodeTable::new()),
            open_files: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    fn path_for_ino(&self, ino: u64) -> Option<PathBuf> {
        self.inodes.lock().unwrap().path(ino)
    }

    fn intern(&self, path: PathBuf) -> u64 {
        self.inodes.lock().unwrap().intern(path)
    }

    fn allocate_fh(&self, open: OpenFile) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.open_files.lock().unwrap().insert(fh, open);
        fh
    }

    fn entry_attr(&self, vpath: &Path) -> RarResult<Option<(u64, FileAttr)>> {
        let stat = match self.resolver.getattr(vpath)? {
            Some(stat) => stat,
            None => return Ok(None),
        };
        let ino = self.intern(vpath.to_path_buf());
        Ok(Some((ino, to_file_attr(ino, &stat))))
    }
}

fn join_name(parent: &Path, name: &OsStr) -> PathBuf {
    parent.join(name.to_string_lossy().as_ref())
}

fn file_type_of(stat: &Stat) -> FileType {
    if stat.is_dir() {
        FileType::Directory
    } else if stat.mode & libc::S_IFMT as u32 == libc::S_IFLNK as u32 {
        FileType::Symlink
    } else {
        FileType::RegularFile
    }
}

fn to_file_attr(ino: u64, stat: &Stat) -> FileAttr {
    FileAttr {
        ino,
        size: stat.size,
        blocks: stat.size.div_ceil(512),
        atime: stat.atime,
        mtime: stat.mtime,
        ctime: stat.ctime,
        crtime: stat.mtime,
        kind: file_type_of(stat),
        perm: (stat.mode & 0o7777) as u16,
        nlink: stat.nlink.max(1),
        uid: stat.uid,
        gid: stat.gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

impl Filesystem for Fs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.path_for_ino(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let vpath = join_name(&parent_path, name);

        match self.entry_attr(&vpath) {
            Ok(Some((_, attr))) => reply.entry(&TTL, &attr, 0),
            Ok(None) => reply.error(libc::ENOENT),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.path_for_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        match self.resolver.getattr(&path) {
            Ok(Some(stat)) => reply.attr(&TTL, &to_file_attr(ino, &stat)),
            Ok(None) => reply.error(libc::ENOENT),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    /// All mutations to attributes — chmod, chown, truncate, and utime are
    /// all routed through `setattr` by the kernel bridge — are refused
    /// (§4.4, §7).
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let _ = ino;
        reply.error(libc::EROFS);
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.path_for_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.resolver.readlink(&path) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(err) => reply.error(err.raw_os_error().unwrap_or(libc::ENOENT)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn unlink(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::EROFS);
    }

    fn rmdir(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::EROFS);
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _link_name: &OsStr,
        _target: &Path,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        reply.error(libc::EROFS);
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, mask: i32, reply: ReplyEmpty) {
        if mask & libc::W_OK != 0 {
            reply.error(libc::EACCES);
        } else {
            reply.ok();
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            reply.error(libc::EROFS);
            return;
        }

        let Some(path) = self.path_for_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let target = match self.resolver.resolve_open(&path) {
            Ok(target) => target,
            Err(err) => {
                reply.error(err.to_errno());
                return;
            }
        };

        match target {
            OpenTarget::Host(host_path) => match fs::File::open(&host_path) {
                Ok(file) => reply.opened(self.allocate_fh(OpenFile::Host(file)), 0),
                Err(err) => reply.error(err.raw_os_error().unwrap_or(libc::EIO)),
            },
            OpenTarget::Store { archive, entry_name } => {
                reply.opened(self.allocate_fh(OpenFile::Store { archive, entry_name }), 0)
            }
            OpenTarget::Compressed { archive, archive_path, entry_name, .. } => {
                let Some(cache) = &self.cache else {
                    reply.error(libc::ENOSYS);
                    return;
                };
                let Some(rar_entry) = archive.entry(&entry_name) else {
                    reply.error(libc::ENOENT);
                    return;
                };
                let real_size = rar_entry.file_size;
                match cache.get(&archive_path, &entry_name, real_size) {
                    Ok(cache_path) => reply.opened(
                        self.allocate_fh(OpenFile::Cache { path: cache_path, real_size }),
                        0,
                    ),
                    Err(err) => reply.error(err.to_errno()),
                }
            }
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
        let offset = offset.max(0) as u64;
        let length = size as u64;

        let open_files = self.open_files.lock().unwrap();
        let Some(open) = open_files.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };

        let result: RarResult<Vec<u8>> = match open {
            OpenFile::Host(file) => {
                let mut buf = vec![0u8; length as usize];
                match file.read_at(&mut buf, offset) {
                    Ok(n) => {
                        buf.truncate(n);
                        Ok(buf)
                    }
                    Err(err) => Err(Error::from(err)),
                }
            }
            OpenFile::Store { archive, entry_name } => archive.read_partial(entry_name, offset, length),
            OpenFile::Cache { path, real_size } => cache::partial_read(path, offset, length, *real_size),
        };
        drop(open_files);

        match result {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(err.to_errno()),
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
        self.open_files.lock().unwrap().remove(&fh);
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(path) = self.path_for_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let parent_path = path.parent().map(Path::to_path_buf).unwrap_or_else(|| path.clone());
        let parent_ino = self.intern(parent_path);

        let mut entries = vec![(ino, FileType::Directory, ".".to_string()), (parent_ino, FileType::Directory, "..".to_string())];

        match self.resolver.readdir(&path) {
            Ok(names) => {
                for name in names {
                    let child_vpath = path.join(&name);
                    match self.resolver.getattr(&child_vpath) {
                        Ok(Some(stat)) => {
                            let child_ino = self.intern(child_vpath);
                            entries.push((child_ino, file_type_of(&stat), name));
                        }
                        Ok(None) => {
                            trace!(name, "readdir child vanished before getattr");
                        }
                        Err(err) => {
                            warn!(name, %err, "getattr failed while listing directory");
                        }
                    }
                }
            }
            Err(err) => {
                reply.error(err.to_errno());
                return;
            }
        }

        for (i, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        use std::mem::MaybeUninit;

        let c_path = match std::ffi::CString::new(self.source_root.as_os_str().as_bytes()) {
            Ok(p) => p,
            Err(_) => {
                reply.error(libc::EIO);
                return;
            }
        };

        let mut buf = MaybeUninit::<libc::statvfs>::uninit();
        // SAFETY: `c_path` is a valid NUL-terminated string and `buf` is
        // fully written by a successful call before being read.
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), buf.as_mut_ptr()) };
        if rc != 0 {
            reply.error(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
            return;
        }
        let statvfs = unsafe { buf.assume_init() };

        reply.statfs(
            statvfs.f_blocks,
            statvfs.f_bfree,
            statvfs.f_bavail,
            statvfs.f_files,
            statvfs.f_ffree,
            statvfs.f_bsize as u32,
            255,
            statvfs.f_frsize as u32,
        );
    }
}
