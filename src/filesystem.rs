//! Filesystem helpers shared by the build steps.

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use walkdir::WalkDir;

use crate::gadget::{align_up, MIB};

/// Recursively copy a directory, preserving symlinks.
///
/// Symlinks are recreated rather than followed. Existing files at the
/// destination are overwritten, so a step that copies into a partially
/// populated tree from an interrupted run still ends with a full copy.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    if !dst.exists() {
        fs::create_dir_all(dst)
            .with_context(|| format!("Failed to create directory: {}", dst.display()))?;
    }

    for entry in fs::read_dir(src)
        .with_context(|| format!("Failed to read directory: {}", src.display()))?
    {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            let target = fs::read_link(&src_path)?;
            if dst_path.exists() || dst_path.is_symlink() {
                fs::remove_file(&dst_path)?;
            }
            std::os::unix::fs::symlink(&target, &dst_path)
                .with_context(|| format!("Failed to create symlink: {}", dst_path.display()))?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)
                .with_context(|| format!("Failed to copy file: {}", src_path.display()))?;
        }
    }

    Ok(())
}

/// Remove `dir` if present and create it empty.
pub fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)
            .with_context(|| format!("Failed to remove {}", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))
}

/// Total size in bytes of the regular files under `path`. Symlinks are not
/// followed. A missing directory has size zero.
pub fn dir_size(path: &Path) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }

    let mut total = 0;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", path.display()))?;
        if entry.file_type().is_file() {
            total += entry
                .metadata()
                .with_context(|| format!("Failed to stat {}", entry.path().display()))?
                .len();
        }
    }
    Ok(total)
}

/// Size for a filesystem holding `content_size` bytes: half again for
/// metadata and slack, rounded up to whole MiB, never below 1 MiB.
pub fn filesystem_size(content_size: u64) -> u64 {
    align_up(content_size + content_size / 2, MIB).max(MIB)
}

/// Unpack a `.tar`, `.tar.zst` or `.tar.zstd` archive into `dest`.
pub fn extract_tarball(tarball: &Path, dest: &Path) -> Result<()> {
    let name = tarball
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let file =
        File::open(tarball).with_context(|| format!("Failed to open {}", tarball.display()))?;
    let reader: Box<dyn Read> = if name.ends_with(".tar.zst") || name.ends_with(".tar.zstd") {
        Box::new(zstd::stream::Decoder::new(file)?)
    } else if name.ends_with(".tar") {
        Box::new(file)
    } else {
        bail!(
            "unsupported rootfs tarball '{}' (expected .tar or .tar.zst)",
            tarball.display()
        );
    };

    fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive
        .unpack(dest)
        .with_context(|| format!("Failed to unpack {}", tarball.display()))?;
    Ok(())
}

/// Move a file by renaming, falling back to copy and delete across
/// filesystems.
pub fn move_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dst)
                .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
            fs::remove_file(src).with_context(|| format!("Failed to remove {}", src.display()))?;
            Ok(())
        }
    }
}
