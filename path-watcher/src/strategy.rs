//! Policies deciding which directories get registered with the primitive.

use std::fs;
use std::path::Path;

use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::error::Result;
use crate::primitive::{Recursion, WatchPrimitive};
use crate::registry::WatchRegistry;

/// How an engine covers its root and reacts to newly created directories.
///
/// Chosen once per engine by [`RegistrationStrategy::select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStrategy {
    /// Only the root itself; descendants are never watched.
    NonRecursive,
    /// Every directory below the root, registered one by one. New
    /// directories are walked and registered as they appear.
    TreeWalking,
    /// The root registered once with subtree coverage by the primitive.
    NativeRecursive,
}

impl RegistrationStrategy {
    /// Pick the strategy for a request. Non-recursive requests ignore the
    /// platform; recursive ones prefer native recursion when available.
    pub fn select(recursive: bool, native_recursion: bool) -> Self {
        match (recursive, native_recursion) {
            (false, _) => Self::NonRecursive,
            (true, true) => Self::NativeRecursive,
            (true, false) => Self::TreeWalking,
        }
    }

    pub fn is_recursive(self) -> bool {
        !matches!(self, Self::NonRecursive)
    }

    /// Register the root. Any failure aborts setup.
    pub fn register_root(
        self,
        primitive: &mut dyn WatchPrimitive,
        registry: &mut WatchRegistry,
        root: &Path,
    ) -> Result<()> {
        match self {
            Self::NonRecursive => register(primitive, registry, root, Recursion::Directory),
            Self::NativeRecursive => register(primitive, registry, root, Recursion::Subtree),
            Self::TreeWalking => register_tree(primitive, registry, root),
        }
    }

    /// React to `child` having been created inside a watched directory.
    pub fn register_child(
        self,
        primitive: &mut dyn WatchPrimitive,
        registry: &mut WatchRegistry,
        child: &Path,
    ) -> Result<()> {
        match self {
            Self::NonRecursive | Self::NativeRecursive => Ok(()),
            Self::TreeWalking => {
                // Symlinked directories are not followed.
                let is_dir = fs::symlink_metadata(child)
                    .map(|m| m.is_dir())
                    .unwrap_or(false);
                if is_dir {
                    register_tree(primitive, registry, child)
                } else {
                    Ok(())
                }
            }
        }
    }
}

fn register(
    primitive: &mut dyn WatchPrimitive,
    registry: &mut WatchRegistry,
    dir: &Path,
    recursion: Recursion,
) -> Result<()> {
    let handle = primitive.register(dir, recursion)?;
    registry.insert(handle, dir.to_path_buf());
    Ok(())
}

fn register_tree(
    primitive: &mut dyn WatchPrimitive,
    registry: &mut WatchRegistry,
    top: &Path,
) -> Result<()> {
    let mut count = 0usize;
    for entry in WalkDir::new(top).follow_links(false) {
        let entry = entry?;
        if entry.file_type().is_dir() {
            trace!("Walking into {}", entry.path().display());
            register(primitive, registry, entry.path(), Recursion::Directory)?;
            count += 1;
        }
    }
    debug!("Registered {count} directories under {}", top.display());
    Ok(())
}
