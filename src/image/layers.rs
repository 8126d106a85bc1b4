//! Layer Materialization
//!
//! Handles the filesystem half of pulling one layer:
//! - a randomized temp snapshot next to the final layer directory
//! - stacking on the parent layer's snapshot when there is one
//! - streaming the archive body into the extractor child
//! - whiteout processing (.wh.* markers)
//! - read-only marking and atomic promotion via rename
//!
//! The rename into the final `.dkr-<id>` path is the commit point.
//! Everything before it lives only at the temp path, which is removed
//! on any failure, so a crashed or aborted build leaves no visible
//! layer behind.

use std::fs;
use std::io::Write as _;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use flate2::write::GzDecoder;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::image::{extract, layer_dir, snapshot, ImageError, Result};

/// An in-progress layer build: temp snapshot plus running extractor.
///
/// Created when the layer response is ready to deliver body bytes;
/// consumed by [`finish`](LayerBuild::finish) on success or
/// [`abort`](LayerBuild::abort) on failure. Dropping an unfinished
/// build kills the extractor and discards the temp snapshot.
pub struct LayerBuild {
    temp_path: PathBuf,
    final_path: PathBuf,
    child: Child,
    stdin: Option<ChildStdin>,
    decoder: Option<GzDecoder<Vec<u8>>>,
    probed: bool,
    committed: bool,
}

impl LayerBuild {
    /// Prepare the snapshot and extractor for one layer.
    ///
    /// With a parent layer the temp path starts as a writable snapshot
    /// of the parent's directory; the base layer starts from a fresh
    /// subvolume.
    pub fn begin(image_root: &Path, layer_id: &str, parent_id: Option<&str>) -> Result<Self> {
        let final_path = layer_dir(image_root, layer_id);
        let temp_path = tempfn_random(&final_path);

        if let Some(parent) = temp_path.parent() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)?;
        }

        match parent_id {
            Some(parent) => {
                let base_path = layer_dir(image_root, parent);
                snapshot::subvol_snapshot(&base_path, &temp_path)?;
            }
            None => snapshot::subvol_make(&temp_path)?,
        }

        let mut child = extract::fork_tar(&temp_path)?;
        let stdin = child.stdin.take();

        Ok(Self {
            temp_path,
            final_path,
            child,
            stdin,
            decoder: None,
            probed: false,
            committed: false,
        })
    }

    /// Feed one chunk of archive bytes to the extractor. Gzipped
    /// bodies are recognized by their magic on the first chunk and
    /// inflated before reaching the extractor.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if !self.probed {
            self.probed = true;
            if is_gzip(chunk) {
                self.decoder = Some(GzDecoder::new(Vec::new()));
            }
        }

        let stdin = self
            .stdin
            .as_mut()
            .expect("layer build already finished streaming");

        match &mut self.decoder {
            Some(decoder) => {
                decoder.write_all(chunk)?;
                let inflated = std::mem::take(decoder.get_mut());
                if !inflated.is_empty() {
                    stdin.write_all(&inflated).await?;
                }
            }
            None => stdin.write_all(chunk).await?,
        }

        Ok(())
    }

    /// Complete the build: EOF the extractor, reap it, resolve
    /// whiteouts, mark read-only and rename into the final path.
    pub async fn finish(mut self) -> Result<()> {
        // Drain whatever the decoder still buffers, then close stdin;
        // that is what lets the extractor see end-of-archive, so it
        // must happen before the wait.
        if let Some(decoder) = self.decoder.take() {
            match decoder.finish() {
                Ok(rest) => {
                    if !rest.is_empty() {
                        if let Some(stdin) = self.stdin.as_mut() {
                            stdin.write_all(&rest).await?;
                        }
                    }
                }
                Err(e) => {
                    let _ = self.child.start_kill();
                    let _ = self.child.wait().await;
                    self.discard();
                    return Err(e.into());
                }
            }
        }
        self.stdin.take();

        let status = self.child.wait().await?;
        if !status.success() {
            self.discard();
            return Err(ImageError::ExtractorFailed(status));
        }

        if let Err(e) = self.promote() {
            self.discard();
            return Err(e);
        }

        self.committed = true;
        tracing::info!("Completed writing to layer {}", self.final_path.display());
        Ok(())
    }

    fn promote(&self) -> Result<()> {
        resolve_whiteouts(&self.temp_path)?;
        snapshot::subvol_set_read_only(&self.temp_path)?;
        fs::rename(&self.temp_path, &self.final_path)?;
        Ok(())
    }

    /// Tear the build down: kill and reap the extractor, drop the temp
    /// snapshot.
    pub async fn abort(mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
        self.discard();
        self.committed = true;
    }

    fn discard(&mut self) {
        if let Err(e) = snapshot::subvol_remove(&self.temp_path) {
            tracing::warn!(
                "Failed to remove temp snapshot {}: {}",
                self.temp_path.display(),
                e
            );
        }
    }
}

impl Drop for LayerBuild {
    fn drop(&mut self) {
        // Normal paths go through finish()/abort(); this only fires on
        // cancellation. The extractor dies via kill-on-drop.
        if !self.committed {
            self.discard();
        }
    }
}

/// Check if data is gzip-compressed
fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

/// Randomized sibling of `path` used as the build destination.
fn tempfn_random(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix = Uuid::new_v4().simple().to_string();
    path.with_file_name(format!(".#{}{}", name, &suffix[..16]))
}

/// Resolve whiteout markers left by layered-filesystem deletions.
///
/// `.wh.<name>` deletes the shadowed `<name>` inherited from the parent
/// snapshot; `.wh..wh.*` markers are bookkeeping entries with no
/// shadowed counterpart and are simply dropped.
pub fn resolve_whiteouts(root: &Path) -> Result<()> {
    let mut markers = Vec::new();

    for entry in WalkDir::new(root).min_depth(1).into_iter().filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy();
        if name.starts_with(".wh.") {
            markers.push(entry.path().to_path_buf());
        }
    }

    for marker in markers {
        let name = marker
            .file_name()
            .expect("marker has a file name")
            .to_string_lossy()
            .into_owned();

        if !name.starts_with(".wh..wh.") {
            let shadowed = marker.with_file_name(&name[4..]);
            remove_entry(&shadowed)?;
        }

        remove_entry(&marker)?;
    }

    Ok(())
}

fn remove_entry(path: &Path) -> Result<()> {
    match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
