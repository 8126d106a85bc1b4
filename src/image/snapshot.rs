//! Copy-on-Write Snapshot Primitive
//!
//! Layer directories are btrfs subvolumes when the image root lives on
//! btrfs: creating a layer is a subvolume create, stacking a layer on
//! its parent is a subvolume snapshot, and promotion marks the
//! subvolume read-only.
//!
//! On filesystems without subvolume support every operation degrades to
//! plain directories: fresh layers are ordinary directories, snapshots
//! are recursive copies, and read-only marking strips the write bits
//! from the top-level directory. The degraded mode loses sharing, not
//! correctness.

use std::fs::{self, File};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use walkdir::WalkDir;

use crate::image::{ImageError, Result};

const BTRFS_IOC_SUBVOL_CREATE: libc::c_ulong = 0x5000_940e;
const BTRFS_IOC_SNAP_DESTROY: libc::c_ulong = 0x5000_940f;
const BTRFS_IOC_SNAP_CREATE_V2: libc::c_ulong = 0x5000_9417;
const BTRFS_IOC_SUBVOL_GETFLAGS: libc::c_ulong = 0x8008_9419;
const BTRFS_IOC_SUBVOL_SETFLAGS: libc::c_ulong = 0x4008_941a;

const BTRFS_SUBVOL_RDONLY: u64 = 1 << 1;

const BTRFS_PATH_NAME_LEN: usize = 4088;
const BTRFS_SUBVOL_NAME_LEN: usize = 4040;

#[repr(C)]
struct BtrfsVolArgs {
    fd: i64,
    name: [u8; BTRFS_PATH_NAME_LEN],
}

#[repr(C)]
struct BtrfsVolArgsV2 {
    fd: i64,
    transid: u64,
    flags: u64,
    unused: [u64; 4],
    name: [u8; BTRFS_SUBVOL_NAME_LEN],
}

/// Create a fresh subvolume (or plain directory) at `path`.
pub fn subvol_make(path: &Path) -> Result<()> {
    match btrfs_subvol_make(path) {
        Ok(()) => Ok(()),
        Err(e) if ioctl_unsupported(&e) => {
            fs::create_dir(path).map_err(|source| ImageError::SubvolumeCreate {
                path: path.to_path_buf(),
                source,
            })
        }
        Err(source) => Err(ImageError::SubvolumeCreate {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Snapshot `src` into a writable copy at `dst`.
pub fn subvol_snapshot(src: &Path, dst: &Path) -> Result<()> {
    match btrfs_subvol_snapshot(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if ioctl_unsupported(&e) => {
            copy_tree(src, dst).map_err(|source| ImageError::SubvolumeSnapshot {
                src: src.to_path_buf(),
                dst: dst.to_path_buf(),
                source,
            })
        }
        Err(source) => Err(ImageError::SubvolumeSnapshot {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
            source,
        }),
    }
}

/// Mark a finished snapshot read-only.
pub fn subvol_set_read_only(path: &Path) -> Result<()> {
    match btrfs_set_read_only(path) {
        Ok(()) => Ok(()),
        Err(e) if ioctl_unsupported(&e) => {
            chmod_read_only(path).map_err(|source| ImageError::SubvolumeReadOnly {
                path: path.to_path_buf(),
                source,
            })
        }
        Err(source) => Err(ImageError::SubvolumeReadOnly {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Whether a promoted layer is read-only: either the btrfs subvolume
/// flag is set or, in degraded mode, the write bits are stripped.
pub fn subvol_is_read_only(path: &Path) -> bool {
    if let Ok(flags) = btrfs_get_flags(path) {
        if flags & BTRFS_SUBVOL_RDONLY != 0 {
            return true;
        }
    }

    fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o222 == 0)
        .unwrap_or(false)
}

/// Remove a subvolume or directory tree. Missing paths are fine.
pub fn subvol_remove(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    if btrfs_subvol_destroy(path).is_ok() {
        return Ok(());
    }

    // Degraded read-only layers lost the write bits on the top
    // directory; restore them so the entries can be unlinked.
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o700));
    fs::remove_dir_all(path)?;
    Ok(())
}

fn ioctl_unsupported(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::ENOTTY) | Some(libc::EOPNOTSUPP) | Some(libc::EPERM) | Some(libc::ENOSYS)
    )
}

fn split_parent(path: &Path) -> io::Result<(&Path, &std::ffi::OsStr)> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    Ok((parent, name))
}

fn fill_name(buf: &mut [u8], name: &std::ffi::OsStr) -> io::Result<()> {
    let bytes = name.as_bytes();
    if bytes.len() >= buf.len() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "name too long"));
    }
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn btrfs_subvol_make(path: &Path) -> io::Result<()> {
    let (parent, name) = split_parent(path)?;
    let dir = File::open(parent)?;

    let mut args = BtrfsVolArgs {
        fd: 0,
        name: [0; BTRFS_PATH_NAME_LEN],
    };
    fill_name(&mut args.name, name)?;

    let r = unsafe { libc::ioctl(dir.as_raw_fd(), BTRFS_IOC_SUBVOL_CREATE, &args) };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn btrfs_subvol_snapshot(src: &Path, dst: &Path) -> io::Result<()> {
    let (parent, name) = split_parent(dst)?;
    let src_dir = File::open(src)?;
    let dst_dir = File::open(parent)?;

    let mut args = BtrfsVolArgsV2 {
        fd: src_dir.as_raw_fd() as i64,
        transid: 0,
        flags: 0,
        unused: [0; 4],
        name: [0; BTRFS_SUBVOL_NAME_LEN],
    };
    fill_name(&mut args.name, name)?;

    let r = unsafe { libc::ioctl(dst_dir.as_raw_fd(), BTRFS_IOC_SNAP_CREATE_V2, &args) };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn btrfs_get_flags(path: &Path) -> io::Result<u64> {
    let dir = File::open(path)?;

    let mut flags: u64 = 0;
    let r = unsafe { libc::ioctl(dir.as_raw_fd(), BTRFS_IOC_SUBVOL_GETFLAGS, &mut flags) };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags)
}

fn btrfs_set_read_only(path: &Path) -> io::Result<()> {
    let dir = File::open(path)?;
    let flags = btrfs_get_flags(path)? | BTRFS_SUBVOL_RDONLY;

    let r = unsafe { libc::ioctl(dir.as_raw_fd(), BTRFS_IOC_SUBVOL_SETFLAGS, &flags) };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn btrfs_subvol_destroy(path: &Path) -> io::Result<()> {
    let (parent, name) = split_parent(path)?;
    let dir = File::open(parent)?;

    let mut args = BtrfsVolArgs {
        fd: 0,
        name: [0; BTRFS_PATH_NAME_LEN],
    };
    fill_name(&mut args.name, name)?;

    let r = unsafe { libc::ioctl(dir.as_raw_fd(), BTRFS_IOC_SNAP_DESTROY, &args) };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn chmod_read_only(path: &Path) -> io::Result<()> {
    let mode = fs::metadata(path)?.permissions().mode();
    fs::set_permissions(path, fs::Permissions::from_mode(mode & !0o222))
}

/// Recursive copy fallback used when snapshots are unavailable.
///
/// The destination top-level directory is always created writable even
/// when the source was promoted read-only.
fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let src_mode = fs::metadata(src)?.permissions().mode();
    fs::create_dir(dst)?;
    fs::set_permissions(dst, fs::Permissions::from_mode(src_mode | 0o700))?;

    for entry in WalkDir::new(src).min_depth(1).into_iter().filter_map(|e| e.ok()) {
        let relative = entry.path().strip_prefix(src).expect("walked path under root");
        let target = dst.join(relative);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir(&target)?;
            let mode = entry.metadata()?.permissions().mode();
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link_target = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(&link_target, &target)?;
        }
    }

    Ok(())
}
