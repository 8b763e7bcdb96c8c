//! Overlay filesystem
//!
//! Presents a patch tree on top of a root tree as one read-only view:
//! - `layers` decides which tree answers a logical path
//! - `ops` implements each filesystem operation against that decision
//! - `filesystem` bridges fuser's inode-based callbacks onto `ops`

mod dir;
mod filesystem;
mod handle;
mod inode;
mod layers;
mod ops;

pub use dir::MergedDir;
pub use filesystem::{mount_options, PatchFuse};
pub use handle::HostHandle;
pub use layers::Layers;
pub use ops::{Attributes, FileKind, FsStats, PathFilesystem, PatchFs};
