//! Materialized Image Layers
//!
//! Everything that happens on the local filesystem once layer bytes
//! arrive from a registry:
//! - copy-on-write snapshot management (btrfs subvolumes with a plain
//!   directory fallback)
//! - streaming extraction through an external `tar` child process
//! - whiteout resolution and atomic promotion of finished layers
//! - local image aliases
//!
//! Each materialized layer is a read-only directory named
//! `.dkr-<layer id>` directly under the image root. A layer directory
//! that exists is complete; partially built layers only ever live at a
//! randomized temp path that is renamed into place as the final step.

mod extract;
pub mod layers;
pub mod snapshot;

pub use layers::LayerBuild;

use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::utils::constants::LAYER_DIR_PREFIX;

/// Errors that can occur while materializing layers
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("failed to create subvolume {path}: {source}")]
    SubvolumeCreate {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to snapshot {src} to {dst}: {source}")]
    SubvolumeSnapshot {
        src: PathBuf,
        dst: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to mark {path} read-only: {source}")]
    SubvolumeReadOnly {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to spawn extractor: {0}")]
    ExtractorSpawn(std::io::Error),

    #[error("extractor failed: {0}")]
    ExtractorFailed(std::process::ExitStatus),

    #[error("local image '{0}' already exists")]
    AlreadyExists(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ImageError>;

/// Directory a materialized layer lives at under the image root.
pub fn layer_dir(image_root: &Path, layer_id: &str) -> PathBuf {
    image_root.join(format!("{}{}", LAYER_DIR_PREFIX, layer_id))
}

/// Materialize a named local alias of a finished image.
///
/// Snapshots the image's tip layer directory to `<image_root>/<local>`.
/// An existing alias is an error unless `force` is set, in which case it
/// is replaced.
pub fn make_local_copy(
    final_path: &Path,
    image_root: &Path,
    local: &str,
    force: bool,
) -> Result<()> {
    let target = image_root.join(local);

    if target.exists() {
        if !force {
            return Err(ImageError::AlreadyExists(local.to_string()));
        }
        snapshot::subvol_remove(&target)?;
    }

    snapshot::subvol_snapshot(final_path, &target)?;

    tracing::info!(
        "Created local image '{}' from {}",
        local,
        final_path.display()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_layer_dir_naming() {
        let id = "ab".repeat(32);
        let dir = layer_dir(Path::new("/var/lib/strata"), &id);
        assert_eq!(
            dir,
            PathBuf::from(format!("/var/lib/strata/.dkr-{}", id))
        );
    }

    #[test]
    fn test_local_copy_and_collision() {
        let root = tempdir().unwrap();
        let tip = layer_dir(root.path(), &"aa".repeat(32));
        std::fs::create_dir(&tip).unwrap();
        std::fs::write(tip.join("rootfs.txt"), "data").unwrap();

        make_local_copy(&tip, root.path(), "web", false).unwrap();
        assert!(root.path().join("web/rootfs.txt").exists());

        // A second copy without force must fail and leave the alias alone.
        let err = make_local_copy(&tip, root.path(), "web", false).unwrap_err();
        assert!(matches!(err, ImageError::AlreadyExists(_)));

        // With force the alias is replaced.
        std::fs::write(tip.join("extra.txt"), "more").unwrap();
        make_local_copy(&tip, root.path(), "web", true).unwrap();
        assert!(root.path().join("web/extra.txt").exists());
    }
}
