//! Cacheable work and the output trees it produces

use crate::{Error, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Shape of an output property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeType {
    /// A single file
    File,
    /// A directory tree
    Directory,
}

/// Something whose outputs can be packed into and restored from the cache
pub trait CacheableEntity: Send + Sync {
    /// Human-readable identity for diagnostics
    fn identity(&self) -> &str;

    /// Call `visitor` once per output property with its name, shape and root
    fn visit_output_trees(
        &self,
        visitor: &mut dyn FnMut(&str, TreeType, &Path) -> Result<()>,
    ) -> Result<()>;
}

/// Entity described by a fixed list of output properties
#[derive(Debug, Clone)]
pub struct OutputTrees {
    identity: String,
    trees: Vec<(String, TreeType, PathBuf)>,
}

impl OutputTrees {
    /// Entity with no outputs yet
    #[must_use]
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            trees: Vec::new(),
        }
    }

    /// Add an output property
    #[must_use]
    pub fn with_tree(
        mut self,
        property: impl Into<String>,
        tree_type: TreeType,
        root: impl Into<PathBuf>,
    ) -> Self {
        self.trees.push((property.into(), tree_type, root.into()));
        self
    }
}

impl CacheableEntity for OutputTrees {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn visit_output_trees(
        &self,
        visitor: &mut dyn FnMut(&str, TreeType, &Path) -> Result<()>,
    ) -> Result<()> {
        for (property, tree_type, root) in &self.trees {
            visitor(property, *tree_type, root)?;
        }
        Ok(())
    }
}

/// Prepare an output location for restoring cached content
///
/// Directories end up existing and empty. For files, the parent directory
/// exists and nothing is left at the root.
pub(crate) fn clean_output(tree_type: TreeType, root: &Path) -> Result<()> {
    match tree_type {
        TreeType::Directory => {
            remove_any(root)?;
            fs::create_dir_all(root).map_err(|e| Error::io(e, root, "create_dir_all"))
        }
        TreeType::File => {
            if let Some(parent) = root.parent().filter(|p| !p.as_os_str().is_empty()) {
                if parent.is_file() {
                    fs::remove_file(parent).map_err(|e| Error::io(e, parent, "remove_file"))?;
                }
                fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
            }
            remove_any(root)
        }
    }
}

/// Remove a file or directory tree; missing paths are fine
pub(crate) fn remove_any(path: &Path) -> Result<()> {
    let outcome = match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => Err(e),
    };
    outcome.map_err(|e| Error::io(e, path, "remove"))
}
