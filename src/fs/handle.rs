//! Open file handles
//!
//! A [`HostHandle`] is the host descriptor returned by `open`. It is moved to
//! the caller and must be given back through `release`. The FUSE bridge keeps
//! live handles in a [`HandleTable`] keyed by their descriptor number.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};

/// Host file descriptor owned by whoever opened it
#[derive(Debug)]
pub struct HostHandle {
    file: File,
}

impl HostHandle {
    pub(crate) fn new(file: File) -> Self {
        Self { file }
    }

    /// Descriptor number issued by the host
    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub(crate) fn file(&self) -> &File {
        &self.file
    }

    pub(crate) fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Give up ownership of the descriptor without closing it
    pub(crate) fn into_raw_fd(self) -> RawFd {
        self.file.into_raw_fd()
    }
}

/// Live handles handed out to the kernel
pub struct HandleTable {
    handles: Mutex<HashMap<u64, HostHandle>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Register a handle and return the `fh` to give the kernel
    pub fn insert(&self, handle: HostHandle) -> u64 {
        let fh = handle.raw_fd() as u64;
        self.handles.lock().insert(fh, handle);
        fh
    }

    /// Run `f` against a live handle
    pub fn with<T>(&self, fh: u64, f: impl FnOnce(&mut HostHandle) -> T) -> Option<T> {
        self.handles.lock().get_mut(&fh).map(f)
    }

    /// Take a handle back out of the table
    pub fn remove(&self, fh: u64) -> Option<HostHandle> {
        self.handles.lock().remove(&fh)
    }

    /// Number of open handles
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
