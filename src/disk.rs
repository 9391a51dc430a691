//! Partition images and disk assembly.
//!
//! Every structure of a volume is first built as its own image file, then
//! the disk is created sparse, partitioned with `sfdisk` and the structure
//! images are spliced in at their offsets.

use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::gadget::{Placement, Schema, Volume};
use crate::host;

/// Sector size in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// Create (or truncate) `path` as a sparse file of `size` bytes.
pub fn create_sparse(path: &Path, size: u64) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    file.set_len(size)
        .with_context(|| format!("Failed to size {} to {} bytes", path.display(), size))?;
    Ok(())
}

/// Build an ext4 image of `size` bytes populated from `content`, without
/// mounting.
pub fn make_ext4(image: &Path, size: u64, label: Option<&str>, content: &Path) -> Result<()> {
    create_sparse(image, size)?;
    let mkfs = host::locate(host::MKFS_EXT4)?;
    let mut cmd = Command::new(mkfs);
    cmd.args(["-q", "-F"]);
    if let Some(label) = label {
        cmd.args(["-L", label]);
    }
    cmd.arg("-d").arg(content).arg(image);
    host::run(&mut cmd, "mkfs.ext4 -d")
}

/// Build a FAT image of `size` bytes and copy the top level of `content`
/// into it with mtools.
pub fn make_vfat(image: &Path, size: u64, label: Option<&str>, content: &Path) -> Result<()> {
    create_sparse(image, size)?;
    let mkfs = host::locate(host::MKFS_VFAT)?;
    let mut cmd = Command::new(mkfs);
    if let Some(label) = label {
        cmd.args(["-n", label]);
    }
    cmd.arg(image);
    host::run(&mut cmd, "mkfs.vfat")?;

    let mut entries: Vec<PathBuf> = match fs::read_dir(content) {
        Ok(dir) => dir
            .map(|entry| entry.map(|e| e.path()))
            .collect::<io::Result<_>>()?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", content.display())),
    };
    if entries.is_empty() {
        return Ok(());
    }
    entries.sort();

    let mcopy = host::locate(host::MCOPY)?;
    let mut cmd = Command::new(mcopy);
    cmd.args(["-s", "-i"]).arg(image).args(&entries).arg("::");
    host::run(&mut cmd, "mcopy")
}

/// Build a raw structure image by concatenating `sources` and padding to
/// `size` bytes.
pub fn write_raw(image: &Path, size: u64, sources: &[PathBuf]) -> Result<()> {
    let mut out =
        File::create(image).with_context(|| format!("Failed to create {}", image.display()))?;
    let mut written = 0;
    for source in sources {
        let mut input =
            File::open(source).with_context(|| format!("Failed to open {}", source.display()))?;
        written += io::copy(&mut input, &mut out)
            .with_context(|| format!("Failed to copy {}", source.display()))?;
    }
    anyhow::ensure!(
        written <= size,
        "content of {} is {} bytes, larger than the structure size {}",
        image.display(),
        written,
        size
    );
    out.set_len(size)?;
    Ok(())
}

/// `sfdisk` script for the partitions of `volume`, or `None` when the
/// volume has no partitions.
pub fn partition_table_script(volume: &Volume, layout: &[Placement]) -> Option<String> {
    let mut script = match volume.schema {
        Schema::Gpt => String::from("label: gpt\n"),
        Schema::Mbr => String::from("label: dos\n"),
    };
    let mut partitions = 0;
    for placement in layout {
        let structure = &volume.structure[placement.index];
        if !structure.is_partition() {
            continue;
        }
        partitions += 1;
        let _ = write!(
            script,
            "start={}, size={}, type={}",
            placement.start / SECTOR_SIZE,
            placement.size.div_ceil(SECTOR_SIZE),
            structure.partition_type(volume.schema)
        );
        if let (Schema::Gpt, Some(name)) = (volume.schema, structure.name.as_deref()) {
            let _ = write!(script, ", name=\"{}\"", name);
        }
        script.push('\n');
    }
    (partitions > 0).then_some(script)
}

/// Copy `image` into `disk` at byte `offset`, leaving the rest of the disk
/// untouched.
pub fn splice(disk: &Path, image: &Path, offset: u64) -> Result<()> {
    let mut out = OpenOptions::new()
        .write(true)
        .open(disk)
        .with_context(|| format!("Failed to open {}", disk.display()))?;
    let mut input =
        File::open(image).with_context(|| format!("Failed to open {}", image.display()))?;
    out.seek(SeekFrom::Start(offset))?;
    io::copy(&mut input, &mut out).with_context(|| {
        format!(
            "Failed to write {} at offset {} of {}",
            image.display(),
            offset,
            disk.display()
        )
    })?;
    out.sync_all()?;
    Ok(())
}

/// Create the disk for `volume`: sparse file, partition table, then each
/// structure image that exists in `images`.
pub fn assemble(
    disk: &Path,
    size: u64,
    volume: &Volume,
    layout: &[Placement],
    images: &[(Placement, PathBuf)],
) -> Result<()> {
    create_sparse(disk, size)?;

    if let Some(script) = partition_table_script(volume, layout) {
        let sfdisk = host::locate(host::SFDISK)?;
        log::debug!("partition table for {}:\n{}", disk.display(), script);
        host::run_with_stdin(
            Command::new(sfdisk).arg("--no-reread").arg(disk),
            &script,
            "sfdisk",
        )?;
    }

    for (placement, image) in images {
        log::debug!(
            "writing {} at offset {}",
            image.display(),
            placement.start
        );
        splice(disk, image, placement.start)?;
    }
    Ok(())
}
