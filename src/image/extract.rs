//! Extractor Child Process
//!
//! Layer archives are never unpacked in-process: each layer gets its
//! own `tar` child rooted at the layer's build directory, fed the raw
//! body bytes through a pipe. The child is spawned with kill-on-drop so
//! an abandoned build can never leak a running extractor.

use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::image::{ImageError, Result};

/// Spawn `tar` extracting into `dir`, reading the archive from stdin.
pub(crate) fn fork_tar(dir: &Path) -> Result<Child> {
    Command::new("tar")
        .arg("--numeric-owner")
        .arg("-C")
        .arg(dir)
        .arg("-px")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(ImageError::ExtractorSpawn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn sample_tar() -> Vec<u8> {
        let mut data = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut data);
            let content = b"hello world";
            let mut header = tar::Header::new_gnu();
            header.set_path("hello.txt").unwrap();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, &content[..]).unwrap();
            builder.finish().unwrap();
        }
        data
    }

    #[tokio::test]
    async fn test_extract_stream() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = fork_tar(dir.path()).unwrap();

        let mut stdin = child.stdin.take().unwrap();
        stdin.write_all(&sample_tar()).await.unwrap();
        drop(stdin);

        let status = child.wait().await.unwrap();
        assert!(status.success());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("hello.txt")).unwrap(),
            "hello world"
        );
    }

    #[tokio::test]
    async fn test_garbage_input_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = fork_tar(dir.path()).unwrap();

        let mut stdin = child.stdin.take().unwrap();
        stdin.write_all(b"this is not a tar archive").await.unwrap();
        drop(stdin);

        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
