//! FUSE bridge
//!
//! Translates inode-addressed fuser callbacks into logical paths and drives a
//! [`PathFilesystem`] with them.

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use libc::c_int;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use super::{
    handle::{HandleTable, HostHandle},
    inode::{InodeTable, ROOT_INO},
    ops::{Attributes, FileKind, PathFilesystem},
};
use crate::error::{Error, Result};

const TTL: Duration = Duration::from_secs(1);

/// `d_ino` reported for a listed entry that could not be stat'ed
const UNKNOWN_INO: u64 = u64::MAX;

/// One readdir record: inode, offset of the next record, kind, name
pub type DirRecord = (u64, i64, FileType, OsString);

impl FileKind {
    pub fn to_fuser_type(self) -> FileType {
        match self {
            FileKind::RegularFile => FileType::RegularFile,
            FileKind::Directory => FileType::Directory,
            FileKind::Symlink => FileType::Symlink,
            FileKind::BlockDevice => FileType::BlockDevice,
            FileKind::CharDevice => FileType::CharDevice,
            FileKind::Fifo => FileType::NamedPipe,
            FileKind::Socket => FileType::Socket,
        }
    }
}

/// Convert backing attributes to a fuser attribute record for `ino`
pub fn to_fuser_attr(ino: u64, attrs: &Attributes) -> FileAttr {
    FileAttr {
        ino,
        size: attrs.size,
        blocks: attrs.blocks,
        atime: attrs.atime,
        mtime: attrs.mtime,
        ctime: attrs.ctime,
        crtime: UNIX_EPOCH,
        kind: attrs.kind.to_fuser_type(),
        perm: attrs.perm,
        nlink: attrs.nlink as u32,
        uid: attrs.uid,
        gid: attrs.gid,
        rdev: attrs.rdev as u32,
        blksize: attrs.blksize as u32,
        flags: 0,
    }
}

fn resolve_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// Log a failed operation and return the errno to reply with
fn errno(op: &str, err: &Error) -> c_int {
    if err.is_expected() {
        debug!("{} failed: {}", op, err);
    } else {
        warn!("{} failed: {}", op, err);
    }
    err.errno()
}

/// Mount options for a read-only overlay
pub fn mount_options(allow_other: bool) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName("patchfs".to_string()),
        MountOption::RO,
        MountOption::AutoUnmount,
    ];

    if allow_other {
        options.push(MountOption::AllowOther);
    }

    options
}

/// fuser adapter around a path-level filesystem
pub struct PatchFuse<F: PathFilesystem> {
    ops: F,
    inodes: InodeTable,
    handles: HandleTable,
}

impl<F: PathFilesystem> PatchFuse<F> {
    pub fn new(ops: F) -> Self {
        Self {
            ops,
            inodes: InodeTable::new(),
            handles: HandleTable::new(),
        }
    }

    /// Logical path of an inode
    fn path(&self, ino: u64) -> Result<PathBuf> {
        self.inodes.path(ino).ok_or(Error::NotFound)
    }

    /// Logical path of `name` inside `parent`
    fn child_path(&self, parent: u64, name: &OsStr) -> Result<PathBuf> {
        self.inodes.child_path(parent, name).ok_or(Error::NotFound)
    }

    /// Attributes of a path the kernel already knows as `ino`
    fn attr(&self, ino: u64, path: &Path) -> Result<FileAttr> {
        let attrs = self.ops.getattr(path)?;
        Ok(to_fuser_attr(ino, &attrs))
    }

    /// Attributes for an entry reply; takes a lookup reference on success
    fn entry_attr(&self, path: &Path) -> Result<FileAttr> {
        let attrs = self.ops.getattr(path)?;
        Ok(to_fuser_attr(self.inodes.lookup(path), &attrs))
    }

    /// Inode and kind reported for a listed child.
    ///
    /// Known paths report their bridge inode, others the backing inode, so
    /// listing never allocates. Unreadable entries show as files.
    fn child_entry(&self, path: &Path) -> (u64, FileType) {
        let known = self.inodes.ino_of(path);
        match self.ops.getattr(path) {
            Ok(attrs) => (known.unwrap_or(attrs.ino), attrs.kind.to_fuser_type()),
            Err(_) => (known.unwrap_or(UNKNOWN_INO), FileType::RegularFile),
        }
    }

    /// Records of directory `ino`, resuming after `offset` records
    fn dir_entries<'a>(
        &'a self,
        ino: u64,
        offset: i64,
    ) -> Result<impl Iterator<Item = Result<DirRecord>> + 'a>
    where
        F::Dir: 'a,
    {
        let path = self.path(ino)?;
        let entries = self.ops.readdir(&path)?;
        let parent_ino = path
            .parent()
            .and_then(|parent| self.inodes.ino_of(parent))
            .unwrap_or(ROOT_INO);

        Ok(entries
            .enumerate()
            .skip(offset.max(0) as usize)
            .map(move |(i, entry)| {
                let name = entry?;
                let (entry_ino, kind) = match name.as_bytes() {
                    b"." => (ino, FileType::Directory),
                    b".." => (parent_ino, FileType::Directory),
                    _ => self.child_entry(&path.join(&name)),
                };
                Ok((entry_ino, (i + 1) as i64, kind, name))
            }))
    }

    fn reply_entry(op: &str, result: Result<FileAttr>, reply: ReplyEntry) {
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno(op, &e)),
        }
    }

    fn reply_empty(op: &str, result: Result<()>, reply: ReplyEmpty) {
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(op, &e)),
        }
    }

    /// Run `f` against an open handle; unknown handles are EBADF
    fn with_handle<T>(
        &self,
        fh: u64,
        f: impl FnOnce(&F, &mut HostHandle) -> Result<T>,
    ) -> Result<T> {
        self.handles
            .with(fh, |handle| f(&self.ops, handle))
            .unwrap_or(Err(Error::Os(libc::EBADF)))
    }
}

impl<F: PathFilesystem> Filesystem for PatchFuse<F> {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);
        let result = self
            .child_path(parent, name)
            .and_then(|path| self.entry_attr(&path));
        Self::reply_entry("lookup", result, reply);
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
        debug!(
            "forget(ino={}, nlookup={}) live={}",
            ino,
            nlookup,
            self.inodes.len()
        );
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);
        match self.path(ino).and_then(|path| self.attr(ino, &path)) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(errno("getattr", &e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino={}, mode={:?}, size={:?})", ino, mode, size);
        let result = self.path(ino).and_then(|path| {
            if let Some(mode) = mode {
                self.ops.chmod(&path, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                self.ops.chown(&path, uid, gid)?;
            }
            if let Some(size) = size {
                self.ops.truncate(&path, size)?;
            }
            if atime.is_some() || mtime.is_some() {
                self.ops
                    .utimens(&path, atime.map(resolve_time), mtime.map(resolve_time))?;
            }
            self.attr(ino, &path)
        });

        match result {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(errno("setattr", &e)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);
        match self.path(ino).and_then(|path| self.ops.readlink(&path)) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(errno("readlink", &e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={}, name={:?})", parent, name);
        let result = self.child_path(parent, name).and_then(|path| {
            self.ops.mknod(&path, mode, rdev)?;
            self.entry_attr(&path)
        });
        Self::reply_entry("mknod", result, reply);
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?})", parent, name);
        let result = self.child_path(parent, name).and_then(|path| {
            self.ops.mkdir(&path, mode)?;
            self.entry_attr(&path)
        });
        Self::reply_entry("mkdir", result, reply);
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);
        let result = self
            .child_path(parent, name)
            .and_then(|path| self.ops.unlink(&path));
        Self::reply_empty("unlink", result, reply);
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);
        let result = self
            .child_path(parent, name)
            .and_then(|path| self.ops.rmdir(&path));
        Self::reply_empty("rmdir", result, reply);
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink(parent={}, name={:?}, target={:?})", parent, name, target);
        let result = self.child_path(parent, name).and_then(|path| {
            self.ops.symlink(target, &path)?;
            self.entry_attr(&path)
        });
        Self::reply_entry("symlink", result, reply);
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );
        let result = self.child_path(parent, name).and_then(|from| {
            let to = self.child_path(newparent, newname)?;
            self.ops.rename(&from, &to)
        });
        Self::reply_empty("rename", result, reply);
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link(ino={}, newparent={}, newname={:?})", ino, newparent, newname);
        let result = self.path(ino).and_then(|existing| {
            let new = self.child_path(newparent, newname)?;
            self.ops.link(&existing, &new)?;
            self.entry_attr(&new)
        });
        Self::reply_entry("link", result, reply);
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#o})", ino, flags);
        match self.path(ino).and_then(|path| self.ops.open(&path, flags)) {
            Ok(handle) => reply.opened(self.handles.insert(handle), 0),
            Err(e) => reply.error(errno("open", &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }

        match self.with_handle(fh, |ops, handle| ops.read(handle, size, offset as u64)) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", &e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());
        let result = self.with_handle(fh, |ops, handle| {
            ops.write(handle, data, offset.max(0) as u64)
        });
        match result {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(errno("write", &e)),
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush(ino={}, fh={})", ino, fh);
        let result = self.with_handle(fh, |ops, handle| ops.flush(handle));
        Self::reply_empty("flush", result, reply);
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let result = match self.handles.remove(fh) {
            Some(handle) => self.ops.release(handle),
            None => Err(Error::Os(libc::EBADF)),
        };
        debug!("release(ino={}, fh={}, open={})", ino, fh, self.handles.len());
        Self::reply_empty("release", result, reply);
    }

    fn fsync(&mut self, _req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={}, datasync={})", ino, fh, datasync);
        let result = self.with_handle(fh, |ops, handle| ops.fsync(handle, datasync));
        Self::reply_empty("fsync", result, reply);
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);

        let entries = match self.dir_entries(ino, offset) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(errno("readdir", &e));
                return;
            }
        };

        for entry in entries {
            match entry {
                Ok((entry_ino, next, kind, name)) => {
                    if reply.add(entry_ino, next, kind, &name) {
                        break;
                    }
                }
                Err(e) => {
                    reply.error(errno("readdir", &e));
                    return;
                }
            }
        }

        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        debug!("statfs(ino={})", ino);
        match self.path(ino).and_then(|path| self.ops.statfs(&path)) {
            Ok(stats) => reply.statfs(
                stats.blocks_total,
                stats.blocks_free,
                stats.blocks_available,
                stats.inodes_total,
                stats.inodes_free,
                stats.block_size as u32,
                stats.max_name_length as u32,
                stats.fragment_size as u32,
            ),
            Err(e) => reply.error(errno("statfs", &e)),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);
        let result = self.path(ino).and_then(|path| self.ops.access(&path, mask));
        Self::reply_empty("access", result, reply);
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, flags={:#o})", parent, name, flags);
        let result = self.child_path(parent, name).and_then(|path| {
            let handle = self.ops.create(&path, mode, flags)?;
            let attr = self.entry_attr(&path)?;
            Ok((attr, self.handles.insert(handle)))
        });

        match result {
            Ok((attr, fh)) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(e) => reply.error(errno("create", &e)),
        }
    }
}
