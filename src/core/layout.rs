//! On-disk layout of the shared area and per-instance trees
//!
//! ```text
//! <base>/shared/
//! <base>/<instance>/data/
//! <base>/<instance>/content/<package>/
//! <base>/<instance>/worlds/<world>/
//! <base>/<instance>/backups/worlds/<world>_<timestamp>.zip
//! ```

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{IoContext, Result};

pub const SHARED_DIR: &str = "shared";

/// Resolves an instance name to its directory tree.
///
/// Content and world operations only need this much of the metadata store.
pub trait InstanceLocator: Send + Sync {
    fn locate(&self, name: &str) -> Result<InstancePaths>;

    /// Identifies the backing store, used to scope named locks
    fn scope(&self) -> &str;
}

/// Layout rooted at one base directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsLayout {
    base_dir: PathBuf,
}

impl FsLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn shared_dir(&self) -> PathBuf {
        self.base_dir.join(SHARED_DIR)
    }

    pub fn instance(&self, name: &str) -> InstancePaths {
        InstancePaths::new(self.base_dir.join(name))
    }

    pub fn ensure_shared(&self) -> Result<PathBuf> {
        let shared = self.shared_dir();
        std::fs::create_dir_all(&shared).at(&shared)?;
        Ok(shared)
    }

    /// Create any missing part of an instance tree.
    ///
    /// Returns the paths and whether the instance root had to be created.
    pub fn ensure_instance(&self, name: &str) -> Result<(InstancePaths, bool)> {
        self.ensure_shared()?;
        let paths = self.instance(name);
        let created = !paths.root.exists();
        for dir in paths.all_dirs() {
            std::fs::create_dir_all(dir).at(dir)?;
        }
        debug!("Ensured directory tree at {:?}", paths.root);
        Ok((paths, created))
    }
}

/// Resolved paths for one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePaths {
    pub root: PathBuf,
    pub data: PathBuf,
    pub content: PathBuf,
    pub worlds: PathBuf,
    pub world_backups: PathBuf,
}

impl InstancePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            data: root.join("data"),
            content: root.join("content"),
            worlds: root.join("worlds"),
            world_backups: root.join("backups").join("worlds"),
            root,
        }
    }

    pub fn package_dir(&self, package_id: &str) -> PathBuf {
        self.content.join(package_id)
    }

    pub fn world_dir(&self, world: &str) -> PathBuf {
        self.worlds.join(world)
    }

    fn all_dirs(&self) -> [&PathBuf; 5] {
        [
            &self.root,
            &self.data,
            &self.content,
            &self.worlds,
            &self.world_backups,
        ]
    }

    /// First directory of the tree that does not exist, root first
    pub fn missing_dir(&self) -> Option<&Path> {
        self.all_dirs()
            .into_iter()
            .find(|d| !d.is_dir())
            .map(PathBuf::as_path)
    }

    /// Recursively delete the tree; a missing tree is not an error
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Instance directory {:?} was already gone", self.root);
                Ok(())
            }
            Err(e) => Err(e).at(&self.root),
        }
    }
}

/// Visible subdirectories of `dir`, sorted by name; hidden staging entries are skipped
pub fn list_subdirs(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut result = Vec::new();
    for entry in std::fs::read_dir(dir).at(dir)? {
        let entry = entry.at(dir)?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        if entry.file_type().at(entry.path())?.is_dir() {
            result.push((name, entry.path()));
        }
    }
    result.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(result)
}

/// Total size in bytes of all regular files under `path`
pub fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(path).at(path)? {
        let entry = entry.at(path)?;
        let file_type = entry.file_type().at(entry.path())?;
        if file_type.is_dir() {
            total += dir_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata().at(entry.path())?.len();
        }
    }
    Ok(total)
}
