//! Layer stack and path resolution
//!
//! Maps logical (mount-relative) paths onto the backing trees. Layers are
//! kept base-first: index 0 is the root tree, the last entry is the patch
//! tree with the highest priority.

use std::path::{Component, Path, PathBuf};

/// Ordered set of backing trees
#[derive(Debug, Clone)]
pub struct Layers {
    layers: Vec<PathBuf>,
}

impl Layers {
    /// Create a stack from a base tree and overrides, lowest priority first
    pub fn new(base: PathBuf, overrides: impl IntoIterator<Item = PathBuf>) -> Self {
        let mut layers = vec![base];
        layers.extend(overrides);
        Self { layers }
    }

    /// Two-layer stack: `patch` shadows `root`
    pub fn root_and_patch(root: PathBuf, patch: PathBuf) -> Self {
        Self::new(root, [patch])
    }

    /// Base (root) tree
    pub fn base(&self) -> &Path {
        &self.layers[0]
    }

    /// Highest priority (patch) tree
    pub fn top(&self) -> &Path {
        &self.layers[self.layers.len() - 1]
    }

    /// All layer roots, base first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Path> {
        self.layers.iter().map(PathBuf::as_path)
    }

    /// Join a layer root with a logical path
    pub fn resolve_in(layer: &Path, path: &Path) -> PathBuf {
        let relative = path.strip_prefix("/").unwrap_or(path);
        layer.join(relative)
    }

    /// Backing path in the root tree. Never touches the filesystem.
    pub fn resolve_root(&self, path: &Path) -> PathBuf {
        Self::resolve_in(self.base(), path)
    }

    /// Backing path in the patch tree. Never touches the filesystem.
    pub fn resolve_patch(&self, path: &Path) -> PathBuf {
        Self::resolve_in(self.top(), path)
    }

    /// Pick the backing path that answers `path`.
    ///
    /// The first override layer, searching from the top, in which the path
    /// exists wins regardless of file type. Symlinks are followed for the
    /// existence check, so a dangling link does not shadow anything.
    /// Otherwise the base tree answers, whether or not the path exists there.
    pub fn choose(&self, path: &Path) -> PathBuf {
        self.layers[1..]
            .iter()
            .rev()
            .map(|layer| Self::resolve_in(layer, path))
            .find(|candidate| candidate.exists())
            .unwrap_or_else(|| self.resolve_root(path))
    }

    /// Rewrite an absolute symlink target relative to the base tree.
    ///
    /// Relative targets are returned unchanged.
    pub fn rebase_link_target(&self, target: &Path) -> PathBuf {
        if target.is_absolute() {
            relative_to(target, self.base())
        } else {
            target.to_path_buf()
        }
    }
}

/// Lexically normalize an absolute path, folding `.` and `..`
fn normalize(path: &Path) -> Vec<Component<'_>> {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.last(), Some(Component::Normal(_))) {
                    out.pop();
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Path of `target` relative to `base`, both absolute.
///
/// Purely lexical: walks up out of `base` with `..` for every component not
/// shared with `target`. Identical paths yield `.`.
pub fn relative_to(target: &Path, base: &Path) -> PathBuf {
    let target = normalize(target);
    let base = normalize(base);

    let common = target
        .iter()
        .zip(base.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base.len() {
        relative.push("..");
    }
    for component in &target[common..] {
        relative.push(component.as_os_str());
    }

    if relative.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        relative
    }
}
