//! The pair of trees kept consistent by the mirror.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

/// Source and destination roots, fixed for the lifetime of the process.
///
/// Paths below either root are joined across trees by their relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRoots {
    source: PathBuf,
    destination: PathBuf,
}

impl SyncRoots {
    /// Build the pair, making both roots absolute.
    pub fn new(source: impl AsRef<Path>, destination: impl AsRef<Path>) -> Result<Self> {
        let source = std::path::absolute(source.as_ref())
            .with_context(|| format!("Invalid source path: {:?}", source.as_ref()))?;
        let destination = std::path::absolute(destination.as_ref())
            .with_context(|| format!("Invalid destination path: {:?}", destination.as_ref()))?;

        if source == destination {
            bail!("Source and destination must differ: {}", source.display());
        }

        Ok(Self {
            source,
            destination,
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Relative path of `path` under the source root, then the destination root.
    pub fn relative<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        path.strip_prefix(&self.source)
            .or_else(|_| path.strip_prefix(&self.destination))
            .ok()
    }

    /// Relative path of `path` under the source root only.
    pub fn relative_to_source<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        path.strip_prefix(&self.source).ok()
    }

    pub fn source_path(&self, relative: &Path) -> PathBuf {
        join_relative(&self.source, relative)
    }

    pub fn dest_path(&self, relative: &Path) -> PathBuf {
        join_relative(&self.destination, relative)
    }
}

fn join_relative(root: &Path, relative: &Path) -> PathBuf {
    if relative.as_os_str().is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}
