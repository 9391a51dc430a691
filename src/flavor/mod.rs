//! Image flavors and the steps they share.
//!
//! Each flavor owns its option struct and builds its own
//! [`StepList`](crate::machine::StepList); the step bodies below are used by
//! more than one flavor.

pub mod classic;
pub mod snap;

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::disk;
use crate::filesystem;
use crate::gadget::{Placement, Volume};
use crate::machine::MachineState;

pub use classic::{ClassicFlavor, ClassicOptions};
pub use snap::{SnapFlavor, SnapOptions};

/// Create the workdir (a temporary one when none was given) and the
/// directories every later step writes into.
pub(crate) fn make_temporary_directories(state: &mut MachineState) -> Result<()> {
    let workdir = state.ensure_workdir()?.to_path_buf();
    log::debug!("workdir: {}", workdir.display());
    for dir in [
        state.rootfs_dir()?,
        state.unpack_dir()?,
        state.volumes_dir()?,
        state.scratch_dir()?,
    ] {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }
    Ok(())
}

/// Resolve and create the directory final artifacts are written to.
pub(crate) fn determine_output_directory(
    state: &mut MachineState,
    requested: Option<&Path>,
) -> Result<()> {
    let output_dir = match requested {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().context("Failed to resolve current directory")?,
    };
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output directory: {}", output_dir.display()))?;
    log::info!("artifacts will be written to {}", output_dir.display());
    state.aux.output_dir = Some(output_dir);
    Ok(())
}

/// Measure the populated rootfs and record the filesystem size it needs.
pub(crate) fn calculate_rootfs_size(state: &mut MachineState) -> Result<()> {
    let rootfs = state.rootfs_dir()?;
    let content = filesystem::dir_size(&rootfs)?;
    let size = filesystem::filesystem_size(content);
    log::info!(
        "rootfs holds {} bytes, filesystem will be {} MiB",
        content,
        size / crate::gadget::MIB
    );
    state.aux.rootfs_size = Some(size);
    Ok(())
}

/// Assemble one volume's disk image in scratch space and move it to the
/// output directory under `artifact`.
pub(crate) fn make_volume_disk(
    state: &MachineState,
    volume_name: &str,
    volume: &Volume,
    artifact: &str,
    size: u64,
) -> Result<PathBuf> {
    let layout = volume.layout(state.rootfs_size()?)?;
    let mut images: Vec<(Placement, PathBuf)> = Vec::new();
    for placement in &layout {
        let path = structure_image(state, volume_name, placement.index)?;
        if path.exists() {
            images.push((*placement, path));
        }
    }

    let scratch = state.scratch_dir()?.join(artifact);
    disk::assemble(&scratch, size, volume, &layout, &images)
        .with_context(|| format!("assembling volume '{}'", volume_name))?;

    let dest = state.output_dir()?.join(artifact);
    filesystem::move_file(&scratch, &dest)?;
    log::info!("wrote {} ({} bytes)", dest.display(), size);
    Ok(dest)
}

/// Directory structure contents are staged in before the filesystem is
/// built.
pub(crate) fn structure_dir(state: &MachineState, volume: &str, index: usize) -> Result<PathBuf> {
    Ok(state.volumes_dir()?.join(volume).join(format!("part{index}")))
}

/// Built image of one structure.
pub(crate) fn structure_image(state: &MachineState, volume: &str, index: usize) -> Result<PathBuf> {
    Ok(state
        .volumes_dir()?
        .join(volume)
        .join(format!("part{index}.img")))
}

/// Remove a temporary workdir. Kept workdirs stay for inspection and resume.
pub(crate) fn finish(state: &mut MachineState) -> Result<()> {
    if state.is_temporary_workdir() {
        log::debug!("removing temporary workdir");
    }
    state.cleanup_workdir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_directories_and_output() {
        let temp = TempDir::new().unwrap();
        let mut state = MachineState::new(Some(temp.path().join("work")));
        make_temporary_directories(&mut state).unwrap();
        assert!(temp.path().join("work/root").is_dir());
        assert!(temp.path().join("work/scratch").is_dir());

        let out = temp.path().join("out");
        determine_output_directory(&mut state, Some(out.as_path())).unwrap();
        assert!(out.is_dir());
        assert_eq!(state.output_dir().unwrap(), out);

        finish(&mut state).unwrap();
        assert!(temp.path().join("work").is_dir());
    }

    #[test]
    fn test_temporary_workdir_removed_on_finish() {
        let mut state = MachineState::new(None);
        make_temporary_directories(&mut state).unwrap();
        let workdir = state.workdir().unwrap().to_path_buf();
        assert!(workdir.join("volumes").is_dir());
        finish(&mut state).unwrap();
        assert!(!workdir.exists());
    }

    #[test]
    fn test_calculate_rootfs_size() {
        let temp = TempDir::new().unwrap();
        let mut state = MachineState::new(Some(temp.path().to_path_buf()));
        make_temporary_directories(&mut state).unwrap();
        fs::write(state.rootfs_dir().unwrap().join("blob"), vec![1u8; 3 * 1024 * 1024]).unwrap();
        calculate_rootfs_size(&mut state).unwrap();
        assert_eq!(state.aux.rootfs_size, Some(5 * crate::gadget::MIB));
    }

    #[test]
    fn test_structure_paths() {
        let temp = TempDir::new().unwrap();
        let state = MachineState::new(Some(temp.path().to_path_buf()));
        assert_eq!(
            structure_image(&state, "pc", 2).unwrap(),
            temp.path().join("volumes/pc/part2.img")
        );
        assert_eq!(
            structure_dir(&state, "pc", 2).unwrap(),
            temp.path().join("volumes/pc/part2")
        );
    }
}
