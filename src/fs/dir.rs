//! Merged directory listings

use crate::error::Result;
use std::collections::{HashSet, VecDeque};
use std::ffi::OsString;
use std::fs::{self, ReadDir};
use std::iter::FusedIterator;
use std::path::PathBuf;

/// One-shot listing over several backing directories.
///
/// Yields `.` and `..` first, then the entries of each source in order,
/// skipping names already produced. Sources are read lazily; the listing
/// cannot be restarted, a fresh one is opened per call.
pub struct MergedDir {
    dots: std::array::IntoIter<&'static str, 2>,
    sources: VecDeque<ReadDir>,
    seen: HashSet<OsString>,
}

impl MergedDir {
    /// Open a listing over `dirs`, earliest first.
    ///
    /// Paths that are not directories (or do not exist) contribute nothing.
    pub fn open(dirs: impl IntoIterator<Item = PathBuf>) -> Result<Self> {
        let mut sources = VecDeque::new();
        for dir in dirs {
            if dir.is_dir() {
                sources.push_back(fs::read_dir(&dir)?);
            }
        }

        Ok(Self {
            dots: [".", ".."].into_iter(),
            sources,
            seen: HashSet::new(),
        })
    }
}

impl Iterator for MergedDir {
    type Item = Result<OsString>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(dot) = self.dots.next() {
            let name = OsString::from(dot);
            self.seen.insert(name.clone());
            return Some(Ok(name));
        }

        while let Some(source) = self.sources.front_mut() {
            match source.next() {
                Some(Ok(entry)) => {
                    let name = entry.file_name();
                    if self.seen.insert(name.clone()) {
                        return Some(Ok(name));
                    }
                }
                Some(Err(e)) => return Some(Err(e.into())),
                None => {
                    self.sources.pop_front();
                }
            }
        }

        None
    }
}

impl FusedIterator for MergedDir {}
