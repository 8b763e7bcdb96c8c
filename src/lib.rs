//! patchfs - read-only overlay of a patch tree on top of a root tree
//!
//! This library provides a FUSE filesystem that merges two directory trees.
//! Any path present in the patch tree shadows the same path in the root
//! tree; everything else falls through to the root tree.

pub mod config;
pub mod error;
pub mod fs;

pub use config::Config;
pub use error::{Error, Result};
