//! Mount configuration for patchfs

use crate::error::{Error, Result};
use crate::fs::Layers;
use std::path::{Path, PathBuf};

/// The three paths a mount is built from. Fixed for the life of the mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Base tree
    pub root: PathBuf,

    /// Override tree, shadows `root`
    pub patch: PathBuf,

    /// Where the merged view is mounted
    pub mountpoint: PathBuf,
}

impl Config {
    /// Build and validate a configuration.
    ///
    /// Relative paths are anchored at the current directory so symlink
    /// targets can be rebased against an absolute root later on.
    pub fn new(root: &Path, patch: &Path, mountpoint: &Path) -> Result<Self> {
        let config = Self {
            root: absolute(root)?,
            patch: absolute(patch)?,
            mountpoint: absolute(mountpoint)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that every configured path is an existing directory
    pub fn validate(&self) -> Result<()> {
        for (what, path) in [
            ("root", &self.root),
            ("patch", &self.patch),
            ("mountpoint", &self.mountpoint),
        ] {
            if !path.is_dir() {
                return Err(Error::InvalidConfig(format!(
                    "{} {:?} is not a directory",
                    what, path
                )));
            }
        }
        Ok(())
    }

    /// Layer stack with `patch` on top of `root`
    pub fn layers(&self) -> Layers {
        Layers::root_and_patch(self.root.clone(), self.patch.clone())
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
