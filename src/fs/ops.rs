//! Path-level filesystem operations
//!
//! [`PathFilesystem`] is the callback surface the transport drives, one
//! method per operation, addressed by logical path. [`PatchFs`] answers each
//! call through the layer stack and rejects everything that would mutate a
//! backing tree.

use crate::error::{Error, Result};
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::trace;

use nix::sys::statvfs::{statvfs, Statvfs};
use nix::unistd::AccessFlags;

use super::{dir::MergedDir, handle::HostHandle, layers::Layers};

/// Open flags that would modify the backing file
const MUTATING_OPEN_FLAGS: i32 = libc::O_CREAT | libc::O_TRUNC;

/// Kind of a backing entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl From<fs::FileType> for FileKind {
    fn from(ft: fs::FileType) -> Self {
        if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_block_device() {
            FileKind::BlockDevice
        } else if ft.is_char_device() {
            FileKind::CharDevice
        } else if ft.is_fifo() {
            FileKind::Fifo
        } else if ft.is_socket() {
            FileKind::Socket
        } else {
            FileKind::RegularFile
        }
    }
}

/// Status of a backing entry, taken without following a final symlink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
    pub ino: u64,
    pub kind: FileKind,
    /// Permission bits (no file type)
    pub perm: u16,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u64,
    pub rdev: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl Attributes {
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        Self {
            ino: meta.ino(),
            kind: FileKind::from(meta.file_type()),
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink(),
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.size(),
            blocks: meta.blocks(),
            blksize: meta.blksize(),
            rdev: meta.rdev(),
            atime: timestamp(meta.atime(), meta.atime_nsec()),
            mtime: timestamp(meta.mtime(), meta.mtime_nsec()),
            ctime: timestamp(meta.ctime(), meta.ctime_nsec()),
        }
    }
}

/// Seconds and nanoseconds since the epoch, possibly negative
fn timestamp(secs: i64, nsecs: i64) -> SystemTime {
    let nanos = Duration::from_nanos(nsecs.clamp(0, 999_999_999) as u64);
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64) + nanos
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + nanos
    }
}

/// Capacity and usage of the host filesystem holding a backing path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub blocks_available: u64,
    pub blocks_free: u64,
    pub blocks_total: u64,
    pub block_size: u64,
    pub inodes_available: u64,
    pub inodes_free: u64,
    pub inodes_total: u64,
    pub mount_flags: u64,
    pub fragment_size: u64,
    pub max_name_length: u64,
}

impl From<Statvfs> for FsStats {
    fn from(stats: Statvfs) -> Self {
        Self {
            blocks_available: stats.blocks_available() as u64,
            blocks_free: stats.blocks_free() as u64,
            blocks_total: stats.blocks() as u64,
            block_size: stats.block_size() as u64,
            inodes_available: stats.files_available() as u64,
            inodes_free: stats.files_free() as u64,
            inodes_total: stats.files() as u64,
            mount_flags: stats.flags().bits() as u64,
            fragment_size: stats.fragment_size() as u64,
            max_name_length: stats.name_max() as u64,
        }
    }
}

/// Filesystem operations addressed by logical path
pub trait PathFilesystem {
    /// Listing returned by [`PathFilesystem::readdir`]
    type Dir: Iterator<Item = Result<OsString>>;

    fn access(&self, path: &Path, mode: i32) -> Result<()>;
    fn getattr(&self, path: &Path) -> Result<Attributes>;
    fn readdir(&self, path: &Path) -> Result<Self::Dir>;
    fn readlink(&self, path: &Path) -> Result<PathBuf>;
    fn open(&self, path: &Path, flags: i32) -> Result<HostHandle>;
    fn read(&self, handle: &mut HostHandle, size: u32, offset: u64) -> Result<Vec<u8>>;
    fn flush(&self, handle: &HostHandle) -> Result<()>;
    fn release(&self, handle: HostHandle) -> Result<()>;
    fn fsync(&self, handle: &HostHandle, datasync: bool) -> Result<()>;
    fn statfs(&self, path: &Path) -> Result<FsStats>;

    fn create(&self, path: &Path, mode: u32, flags: i32) -> Result<HostHandle>;
    fn write(&self, handle: &mut HostHandle, data: &[u8], offset: u64) -> Result<u32>;
    fn truncate(&self, path: &Path, size: u64) -> Result<()>;
    fn mknod(&self, path: &Path, mode: u32, rdev: u32) -> Result<()>;
    fn mkdir(&self, path: &Path, mode: u32) -> Result<()>;
    fn rmdir(&self, path: &Path) -> Result<()>;
    fn unlink(&self, path: &Path) -> Result<()>;
    fn symlink(&self, target: &Path, link: &Path) -> Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    fn link(&self, existing: &Path, new: &Path) -> Result<()>;
    fn utimens(
        &self,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()>;
    fn chmod(&self, path: &Path, mode: u32) -> Result<()>;
    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()>;
}

/// Read-only overlay of a patch tree on top of a root tree
pub struct PatchFs {
    layers: Layers,
}

impl PatchFs {
    pub fn new(layers: Layers) -> Self {
        Self { layers }
    }

    /// Backing path answering `path`
    fn backing(&self, path: &Path) -> PathBuf {
        let backing = self.layers.choose(path);
        trace!("{:?} -> {:?}", path, backing);
        backing
    }
}

impl PathFilesystem for PatchFs {
    type Dir = MergedDir;

    fn access(&self, path: &Path, mode: i32) -> Result<()> {
        let flags = AccessFlags::from_bits_truncate(mode);
        nix::unistd::access(&self.backing(path), flags).map_err(|_| Error::PermissionDenied)
    }

    fn getattr(&self, path: &Path) -> Result<Attributes> {
        let meta = fs::symlink_metadata(self.backing(path))?;
        Ok(Attributes::from_metadata(&meta))
    }

    fn readdir(&self, path: &Path) -> Result<MergedDir> {
        MergedDir::open(
            self.layers
                .iter()
                .map(|layer| Layers::resolve_in(layer, path)),
        )
    }

    fn readlink(&self, path: &Path) -> Result<PathBuf> {
        let target = fs::read_link(self.backing(path))?;
        Ok(self.layers.rebase_link_target(&target))
    }

    fn open(&self, path: &Path, flags: i32) -> Result<HostHandle> {
        if (flags & libc::O_ACCMODE) != libc::O_RDONLY || (flags & MUTATING_OPEN_FLAGS) != 0 {
            return Err(Error::ReadOnly);
        }

        let file = OpenOptions::new()
            .read(true)
            .custom_flags(flags & !libc::O_ACCMODE)
            .open(self.backing(path))?;
        Ok(HostHandle::new(file))
    }

    fn read(&self, handle: &mut HostHandle, size: u32, offset: u64) -> Result<Vec<u8>> {
        let file = handle.file_mut();
        file.seek(SeekFrom::Start(offset))?;

        let mut buffer = Vec::with_capacity(size as usize);
        file.by_ref().take(size as u64).read_to_end(&mut buffer)?;
        Ok(buffer)
    }

    fn flush(&self, handle: &HostHandle) -> Result<()> {
        handle.file().sync_all()?;
        Ok(())
    }

    fn release(&self, handle: HostHandle) -> Result<()> {
        nix::unistd::close(handle.into_raw_fd())?;
        Ok(())
    }

    fn fsync(&self, handle: &HostHandle, _datasync: bool) -> Result<()> {
        self.flush(handle)
    }

    fn statfs(&self, path: &Path) -> Result<FsStats> {
        Ok(statvfs(&self.backing(path))?.into())
    }

    fn create(&self, _path: &Path, _mode: u32, _flags: i32) -> Result<HostHandle> {
        Err(Error::ReadOnly)
    }

    fn write(&self, _handle: &mut HostHandle, _data: &[u8], _offset: u64) -> Result<u32> {
        Err(Error::ReadOnly)
    }

    fn truncate(&self, _path: &Path, _size: u64) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn mknod(&self, _path: &Path, _mode: u32, _rdev: u32) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn mkdir(&self, _path: &Path, _mode: u32) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn rmdir(&self, _path: &Path) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn unlink(&self, _path: &Path) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn symlink(&self, _target: &Path, _link: &Path) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn rename(&self, _from: &Path, _to: &Path) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn link(&self, _existing: &Path, _new: &Path) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn utimens(
        &self,
        _path: &Path,
        _atime: Option<SystemTime>,
        _mtime: Option<SystemTime>,
    ) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn chmod(&self, _path: &Path, _mode: u32) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn chown(&self, _path: &Path, _uid: Option<u32>, _gid: Option<u32>) -> Result<()> {
        Err(Error::ReadOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::stat::fstat;
    use std::os::unix::fs::symlink;
    use std::panic::{self, AssertUnwindSafe};
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        patch: PathBuf,
        fs: PatchFs,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        let patch = dir.path().join("patch");
        fs::create_dir(&root).unwrap();
        fs::create_dir(&patch).unwrap();

        fs::write(root.join("a.txt"), b"root a").unwrap();
        fs::write(root.join("b.txt"), b"root b").unwrap();
        fs::write(patch.join("b.txt"), b"patch b").unwrap();
        fs::write(patch.join("c.txt"), b"patch c").unwrap();

        let fs = PatchFs::new(Layers::root_and_patch(root.clone(), patch.clone()));
        Fixture {
            _dir: dir,
            root,
            patch,
            fs,
        }
    }

    /// Releases its handle when dropped, unwinding included
    struct OpenFile<'a> {
        fs: &'a PatchFs,
        handle: Option<HostHandle>,
    }

    impl Drop for OpenFile<'_> {
        fn drop(&mut self) {
            if let Some(handle) = self.handle.take() {
                let released = self.fs.release(handle);
                if !std::thread::panicking() {
                    released.unwrap();
                }
            }
        }
    }

    /// Open, run `f`, and always release the handle afterwards
    fn with_open<T>(fs: &PatchFs, path: &str, f: impl FnOnce(&mut HostHandle) -> T) -> T {
        let mut open = OpenFile {
            fs,
            handle: Some(fs.open(Path::new(path), libc::O_RDONLY).unwrap()),
        };
        f(open.handle.as_mut().unwrap())
    }

    fn listing(fs: &PatchFs, path: &str) -> Vec<String> {
        fs.readdir(Path::new(path))
            .unwrap()
            .map(|name| name.unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_merged_listing() {
        let f = fixture();
        let entries = listing(&f.fs, "/");

        assert_eq!(&entries[..2], &[".", ".."]);
        let mut rest = entries[2..].to_vec();
        rest.sort();
        assert_eq!(rest, vec!["a.txt", "b.txt", "c.txt"]);
    }

    #[test]
    fn test_duplicate_takes_root_position_but_patch_content() {
        let f = fixture();
        let entries = listing(&f.fs, "/");

        // Every root entry is listed before any patch-only entry, so the
        // shared name sits among the root names.
        let pos_b = entries.iter().position(|n| n == "b.txt").unwrap();
        let pos_c = entries.iter().position(|n| n == "c.txt").unwrap();
        assert!(pos_b < pos_c);
        assert_eq!(entries.iter().filter(|n| *n == "b.txt").count(), 1);

        let data = with_open(&f.fs, "/b.txt", |h| f.fs.read(h, 64, 0).unwrap());
        assert_eq!(data, b"patch b");
    }

    #[test]
    fn test_listing_of_subdirectories() {
        let f = fixture();
        fs::create_dir(f.root.join("only_root")).unwrap();
        fs::write(f.root.join("only_root/x"), b"").unwrap();
        fs::create_dir(f.patch.join("only_patch")).unwrap();
        fs::write(f.patch.join("only_patch/y"), b"").unwrap();

        assert_eq!(listing(&f.fs, "/only_root"), vec![".", "..", "x"]);
        assert_eq!(listing(&f.fs, "/only_patch"), vec![".", "..", "y"]);
    }

    #[test]
    fn test_read_prefers_patch() {
        let f = fixture();
        let b = with_open(&f.fs, "/b.txt", |h| f.fs.read(h, 100, 0).unwrap());
        let a = with_open(&f.fs, "/a.txt", |h| f.fs.read(h, 100, 0).unwrap());
        assert_eq!(b, b"patch b");
        assert_eq!(a, b"root a");
    }

    #[test]
    fn test_read_with_offset() {
        let f = fixture();
        let data = with_open(&f.fs, "/c.txt", |h| {
            let tail = f.fs.read(h, 3, 2).unwrap();
            // Earlier offset after a later one: read always seeks first
            let head = f.fs.read(h, 5, 0).unwrap();
            (tail, head)
        });
        assert_eq!(data.0, b"tch");
        assert_eq!(data.1, b"patch");
    }

    #[test]
    fn test_read_past_eof_is_empty() {
        let f = fixture();
        fs::write(f.root.join("five.bin"), b"12345").unwrap();

        let data = with_open(&f.fs, "/five.bin", |h| f.fs.read(h, 10, 1000).unwrap());
        assert!(data.is_empty());

        let data = with_open(&f.fs, "/five.bin", |h| f.fs.read(h, 10, 3).unwrap());
        assert_eq!(data, b"45");
    }

    #[test]
    fn test_directories_in_both_trees_merge_per_entry() {
        let f = fixture();
        fs::create_dir(f.root.join("dir")).unwrap();
        fs::write(f.root.join("dir/from_root.txt"), b"root").unwrap();
        fs::write(f.root.join("dir/both.txt"), b"root").unwrap();
        fs::create_dir(f.patch.join("dir")).unwrap();
        fs::write(f.patch.join("dir/both.txt"), b"patch").unwrap();

        let mut entries = listing(&f.fs, "/dir");
        entries.sort();
        assert_eq!(entries, vec![".", "..", "both.txt", "from_root.txt"]);

        // Each child is resolved on its own path
        let root_only = with_open(&f.fs, "/dir/from_root.txt", |h| f.fs.read(h, 16, 0).unwrap());
        let both = with_open(&f.fs, "/dir/both.txt", |h| f.fs.read(h, 16, 0).unwrap());
        assert_eq!(root_only, b"root");
        assert_eq!(both, b"patch");
    }

    #[test]
    fn test_patch_file_shadows_root_directory() {
        let f = fixture();
        fs::create_dir(f.root.join("entry")).unwrap();
        fs::write(f.patch.join("entry"), b"file").unwrap();

        let attrs = f.fs.getattr(Path::new("/entry")).unwrap();
        assert_eq!(attrs.kind, FileKind::RegularFile);
    }

    #[test]
    fn test_getattr() {
        let f = fixture();
        let attrs = f.fs.getattr(Path::new("/b.txt")).unwrap();
        assert_eq!(attrs.kind, FileKind::RegularFile);
        assert_eq!(attrs.size, b"patch b".len() as u64);
        assert!(attrs.nlink >= 1);

        let root = f.fs.getattr(Path::new("/")).unwrap();
        assert_eq!(root.kind, FileKind::Directory);

        assert_eq!(f.fs.getattr(Path::new("/missing")), Err(Error::NotFound));
    }

    #[test]
    fn test_getattr_does_not_follow_symlink() {
        let f = fixture();
        symlink("a.txt", f.root.join("link")).unwrap();

        let attrs = f.fs.getattr(Path::new("/link")).unwrap();
        assert_eq!(attrs.kind, FileKind::Symlink);
    }

    #[test]
    fn test_readlink_rebases_absolute_targets() {
        let f = fixture();
        symlink(f.root.join("x/y"), f.root.join("abs")).unwrap();
        symlink("a.txt", f.root.join("rel")).unwrap();

        assert_eq!(
            f.fs.readlink(Path::new("/abs")).unwrap(),
            PathBuf::from("x/y")
        );
        assert_eq!(
            f.fs.readlink(Path::new("/rel")).unwrap(),
            PathBuf::from("a.txt")
        );
    }

    #[test]
    fn test_readlink_on_regular_file_fails() {
        let f = fixture();
        let err = f.fs.readlink(Path::new("/a.txt")).unwrap_err();
        assert_eq!(err, Error::Os(libc::EINVAL));
    }

    #[test]
    fn test_access() {
        let f = fixture();
        assert!(f.fs.access(Path::new("/a.txt"), libc::R_OK).is_ok());
        assert_eq!(
            f.fs.access(Path::new("/missing"), libc::F_OK),
            Err(Error::PermissionDenied)
        );
    }

    #[test]
    fn test_open_missing() {
        let f = fixture();
        let err = f.fs.open(Path::new("/missing"), libc::O_RDONLY).unwrap_err();
        assert_eq!(err, Error::NotFound);
    }

    #[test]
    fn test_open_rejects_writes() {
        let f = fixture();
        for flags in [
            libc::O_WRONLY,
            libc::O_RDWR,
            libc::O_RDONLY | libc::O_TRUNC,
            libc::O_RDONLY | libc::O_CREAT,
        ] {
            assert_eq!(
                f.fs.open(Path::new("/a.txt"), flags).unwrap_err(),
                Error::ReadOnly
            );
        }
        assert_eq!(fs::read(f.root.join("a.txt")).unwrap(), b"root a");
    }

    #[test]
    fn test_each_open_is_fresh() {
        let f = fixture();
        let first = f.fs.open(Path::new("/a.txt"), libc::O_RDONLY).unwrap();
        let second = f.fs.open(Path::new("/a.txt"), libc::O_RDONLY).unwrap();
        assert_ne!(first.raw_fd(), second.raw_fd());
        f.fs.release(first).unwrap();
        f.fs.release(second).unwrap();
    }

    #[test]
    fn test_handle_released_when_reader_panics() {
        let f = fixture();
        let mut opened = None;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            with_open::<()>(&f.fs, "/a.txt", |h| {
                let st = fstat(h.raw_fd()).unwrap();
                opened = Some((h.raw_fd(), st.st_dev, st.st_ino));
                panic!("reader failed");
            })
        }));
        assert!(outcome.is_err());

        // The descriptor is closed, or already reused for some other file
        let (fd, dev, ino) = opened.unwrap();
        match fstat(fd) {
            Err(errno) => assert_eq!(errno, nix::errno::Errno::EBADF),
            Ok(st) => assert!((st.st_dev, st.st_ino) != (dev, ino)),
        }
    }

    #[test]
    fn test_flush_and_fsync() {
        let f = fixture();
        with_open(&f.fs, "/a.txt", |h| {
            f.fs.flush(h).unwrap();
            f.fs.fsync(h, true).unwrap();
            f.fs.fsync(h, false).unwrap();
        });
    }

    #[test]
    fn test_statfs() {
        let f = fixture();
        let stats = f.fs.statfs(Path::new("/")).unwrap();
        assert!(stats.block_size > 0);
        assert!(stats.max_name_length > 0);
        assert!(stats.blocks_free <= stats.blocks_total);
    }

    #[test]
    fn test_mutations_are_rejected() {
        let f = fixture();
        let existing = Path::new("/a.txt");
        let missing = Path::new("/nope");

        for path in [existing, missing] {
            assert_eq!(f.fs.create(path, 0o644, libc::O_WRONLY).unwrap_err(), Error::ReadOnly);
            assert_eq!(f.fs.truncate(path, 0), Err(Error::ReadOnly));
            assert_eq!(f.fs.mknod(path, 0o644, 0), Err(Error::ReadOnly));
            assert_eq!(f.fs.mkdir(path, 0o755), Err(Error::ReadOnly));
            assert_eq!(f.fs.rmdir(path), Err(Error::ReadOnly));
            assert_eq!(f.fs.unlink(path), Err(Error::ReadOnly));
            assert_eq!(f.fs.symlink(Path::new("t"), path), Err(Error::ReadOnly));
            assert_eq!(f.fs.rename(path, Path::new("/other")), Err(Error::ReadOnly));
            assert_eq!(f.fs.link(path, Path::new("/other")), Err(Error::ReadOnly));
            assert_eq!(f.fs.utimens(path, None, None), Err(Error::ReadOnly));
            assert_eq!(f.fs.chmod(path, 0o777), Err(Error::ReadOnly));
            assert_eq!(f.fs.chown(path, Some(0), Some(0)), Err(Error::ReadOnly));
        }

        let err = with_open(&f.fs, "/a.txt", |h| f.fs.write(h, b"x", 0).unwrap_err());
        assert_eq!(err, Error::ReadOnly);

        assert_eq!(fs::read(f.root.join("a.txt")).unwrap(), b"root a");
        assert!(!f.root.join("nope").exists());
    }

    #[test]
    fn test_timestamp() {
        assert_eq!(timestamp(0, 0), UNIX_EPOCH);
        assert_eq!(
            timestamp(10, 5),
            UNIX_EPOCH + Duration::from_secs(10) + Duration::from_nanos(5)
        );
        assert_eq!(
            timestamp(-10, 0),
            UNIX_EPOCH - Duration::from_secs(10)
        );
    }
}
