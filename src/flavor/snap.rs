//! Ubuntu Core images built from a model assertion.

use anyhow::{bail, Context};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::assertion::{self, ModelAssertion};
use crate::disk;
use crate::error::{Error, Result};
use crate::filesystem;
use crate::gadget::{Content, GadgetInfo};
use crate::host;
use crate::machine::{CommonOptions, Flavor, MachineState, StateField, Step, StepList};

use super::{structure_dir, structure_image};

/// File listing the seeded snaps, written next to the images.
pub const SNAPS_MANIFEST: &str = "snaps.manifest";

#[derive(Debug, Clone, Default)]
pub struct SnapOptions {
    /// Model assertion the image is built for.
    pub model: PathBuf,
    /// Channel snaps are fetched from.
    pub channel: Option<String>,
    /// Extra snaps to seed, as `name` or `name=channel`.
    pub snaps: Vec<String>,
    /// File copied to `.disk/info` in the rootfs.
    pub disk_info: Option<PathBuf>,
    /// Minimum size of every volume image, in bytes.
    pub image_size: Option<u64>,
}

#[derive(Debug)]
pub struct SnapFlavor {
    opts: SnapOptions,
    model: Option<ModelAssertion>,
}

impl SnapFlavor {
    pub fn new(opts: SnapOptions) -> Self {
        Self { opts, model: None }
    }

    /// The decoded model, once setup has derived it.
    pub fn model(&self) -> Option<&ModelAssertion> {
        self.model.as_ref()
    }
}

impl Flavor for SnapFlavor {
    fn name(&self) -> &'static str {
        "snap"
    }

    fn steps(&self, common: &CommonOptions) -> Result<StepList> {
        use StateField::*;

        let output_dir = common.output_dir.clone();
        let prepare = self.opts.clone();
        let disk_info = self.opts.disk_info.clone();
        let image_size = self.opts.image_size;

        StepList::new(vec![
            Step::new("make_temporary_directories", super::make_temporary_directories),
            Step::new("determine_output_directory", move |state| {
                super::determine_output_directory(state, output_dir.as_deref())
            })
            .writes(&[OutputDir]),
            Step::new("prepare_image", move |state| prepare_image(state, &prepare)),
            Step::new("load_gadget_yaml", load_gadget_yaml).writes(&[Gadget]),
            Step::new("set_artifact_names", set_artifact_names)
                .reads(&[Gadget])
                .writes(&[ArtifactNames]),
            Step::new("populate_rootfs_contents", populate_rootfs_contents),
            Step::new("generate_disk_info", move |state| {
                generate_disk_info(state, disk_info.as_deref())
            }),
            Step::new("calculate_rootfs_size", super::calculate_rootfs_size).writes(&[RootfsSize]),
            Step::new("populate_bootfs_contents", populate_bootfs_contents).reads(&[Gadget]),
            Step::new("populate_prepare_partitions", move |state| {
                populate_prepare_partitions(state, image_size)
            })
            .reads(&[Gadget, RootfsSize])
            .writes(&[ImageSizes]),
            Step::new("make_disk", make_disk).reads(&[
                OutputDir,
                Gadget,
                ArtifactNames,
                RootfsSize,
                ImageSizes,
            ]),
            Step::new("generate_manifest", generate_manifest).reads(&[OutputDir]),
            Step::new("finish", super::finish),
        ])
    }

    fn options(&self) -> Vec<(&'static str, String)> {
        vec![
            ("model", self.opts.model.display().to_string()),
            ("channel", format!("{:?}", self.opts.channel)),
            ("snaps", self.opts.snaps.join(",")),
            ("disk_info", format!("{:?}", self.opts.disk_info)),
            ("image_size", format!("{:?}", self.opts.image_size)),
        ]
    }

    fn locate_inputs(&mut self) -> Result<()> {
        require_file(&self.opts.model)?;
        if let Some(disk_info) = &self.opts.disk_info {
            require_file(disk_info)?;
        }
        Ok(())
    }

    fn derive_parameters(&mut self, state: &mut MachineState) -> Result<()> {
        let model = ModelAssertion::decode(&self.opts.model)?;
        assertion::validate(&model)?;
        let series = assertion::derive_series(&model)?;

        log::info!(
            "model {}/{}: series {}, gadget {}, kernel {}",
            model.brand_id().unwrap_or("?"),
            model.model().unwrap_or("?"),
            series,
            model.gadget().unwrap_or("none"),
            model.kernel().unwrap_or("none"),
        );

        state.aux.series = Some(series);
        state.aux.model_sha256 = Some(model.sha256().to_string());
        self.model = Some(model);
        Ok(())
    }
}

fn require_file(path: &Path) -> Result<()> {
    let metadata = fs::metadata(path).map_err(|e| Error::io(path, e))?;
    if !metadata.is_file() {
        return Err(Error::io(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
        ));
    }
    Ok(())
}

fn gadget_dir(state: &MachineState) -> anyhow::Result<PathBuf> {
    Ok(state.unpack_dir()?.join("gadget"))
}

fn seed_dir(state: &MachineState) -> anyhow::Result<PathBuf> {
    Ok(state.unpack_dir()?.join("image/var/lib/snapd/seed/snaps"))
}

fn prepare_image(state: &mut MachineState, opts: &SnapOptions) -> anyhow::Result<()> {
    let unpack = state.unpack_dir()?;
    filesystem::reset_dir(&unpack)?;

    let snap = host::locate(host::SNAP)?;
    let mut cmd = Command::new(snap);
    cmd.arg("prepare-image");
    if let Some(channel) = &opts.channel {
        cmd.arg(format!("--channel={channel}"));
    }
    for extra in &opts.snaps {
        cmd.arg(format!("--snap={extra}"));
    }
    cmd.arg(&opts.model).arg(&unpack);
    host::run(&mut cmd, "snap prepare-image")
}

fn load_gadget_yaml(state: &mut MachineState) -> anyhow::Result<()> {
    let path = gadget_dir(state)?.join("meta/gadget.yaml");
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let gadget = GadgetInfo::from_yaml(&raw)
        .with_context(|| format!("loading {}", path.display()))?;

    let names: Vec<&str> = gadget.volumes.keys().map(String::as_str).collect();
    log::info!("gadget declares volumes: {}", names.join(", "));
    state.aux.gadget = Some(gadget);
    Ok(())
}

fn set_artifact_names(state: &mut MachineState) -> anyhow::Result<()> {
    let names: BTreeMap<String, String> = state
        .gadget()?
        .volumes
        .keys()
        .map(|volume| (volume.clone(), format!("{volume}.img")))
        .collect();
    state.aux.artifact_names = Some(names);
    Ok(())
}

fn populate_rootfs_contents(state: &mut MachineState) -> anyhow::Result<()> {
    let image = state.unpack_dir()?.join("image");
    let rootfs = state.rootfs_dir()?;
    filesystem::reset_dir(&rootfs)?;
    filesystem::copy_dir_recursive(&image, &rootfs.join("system-data"))
}

fn generate_disk_info(state: &mut MachineState, disk_info: Option<&Path>) -> anyhow::Result<()> {
    let Some(source) = disk_info else {
        return Ok(());
    };
    let dest = state.rootfs_dir()?.join(".disk/info");
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, &dest)
        .with_context(|| format!("Failed to copy {} to {}", source.display(), dest.display()))?;
    Ok(())
}

/// Stage the gadget's `source: target` content for every non-rootfs
/// filesystem structure.
fn populate_bootfs_contents(state: &mut MachineState) -> anyhow::Result<()> {
    let gadget_dir = gadget_dir(state)?;
    for (name, volume) in &state.gadget()?.volumes {
        for (index, structure) in volume.structure.iter().enumerate() {
            if structure.is_system_data() || structure.filesystem.is_none() {
                continue;
            }
            let dir = structure_dir(state, name, index)?;
            filesystem::reset_dir(&dir)?;
            for content in &structure.content {
                if let Content::Files { source, target } = content {
                    stage_content(&gadget_dir, source, &dir, target).with_context(|| {
                        format!("volume '{}' structure #{}", name, index)
                    })?;
                }
            }
        }
    }
    Ok(())
}

fn stage_content(gadget_dir: &Path, source: &str, dest: &Path, target: &str) -> anyhow::Result<()> {
    let src = gadget_dir.join(source.trim_start_matches('/'));
    let dst = dest.join(target.trim_start_matches('/'));
    if src.is_dir() {
        return filesystem::copy_dir_recursive(&src, &dst);
    }

    let dst = if target.ends_with('/') {
        let file_name = src
            .file_name()
            .with_context(|| format!("content source '{}' has no file name", source))?;
        dst.join(file_name)
    } else {
        dst
    };
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(&src, &dst)
        .with_context(|| format!("Failed to copy gadget content {}", src.display()))?;
    Ok(())
}

/// Build an image file for every structure and record the size of each
/// volume.
fn populate_prepare_partitions(
    state: &mut MachineState,
    image_size: Option<u64>,
) -> anyhow::Result<()> {
    host::check_required_tools(&[host::MKFS_EXT4, host::MKFS_VFAT, host::MCOPY])?;

    let rootfs = state.rootfs_dir()?;
    let rootfs_size = state.rootfs_size()?;
    let gadget_dir = gadget_dir(state)?;
    let mut sizes = BTreeMap::new();

    for (name, volume) in &state.gadget()?.volumes {
        for placement in volume.layout(rootfs_size)? {
            let structure = &volume.structure[placement.index];
            let image = structure_image(state, name, placement.index)?;
            if let Some(parent) = image.parent() {
                fs::create_dir_all(parent)?;
            }

            if structure.is_system_data() {
                disk::make_ext4(&image, placement.size, structure.label(), &rootfs)?;
                continue;
            }
            match structure.filesystem.as_deref() {
                Some("ext4") => {
                    let staged = structure_dir(state, name, placement.index)?;
                    disk::make_ext4(&image, placement.size, structure.label(), &staged)?;
                }
                Some("vfat") => {
                    let staged = structure_dir(state, name, placement.index)?;
                    disk::make_vfat(&image, placement.size, structure.label(), &staged)?;
                }
                Some(other) => bail!(
                    "volume '{}' structure #{} has unsupported filesystem '{}'",
                    name,
                    placement.index,
                    other
                ),
                None => {
                    let sources: Vec<PathBuf> = structure
                        .content
                        .iter()
                        .filter_map(|content| match content {
                            Content::Image { image } => Some(gadget_dir.join(image)),
                            Content::Files { .. } => None,
                        })
                        .collect();
                    if !sources.is_empty() {
                        disk::write_raw(&image, placement.size, &sources)?;
                    }
                }
            }
        }

        let needed = volume.image_size(rootfs_size)?;
        let size = match image_size {
            Some(requested) if requested >= needed => requested,
            Some(requested) => {
                log::warn!(
                    "volume '{}' needs {} bytes, ignoring requested image size {}",
                    name,
                    needed,
                    requested
                );
                needed
            }
            None => needed,
        };
        sizes.insert(name.clone(), size);
    }

    state.aux.image_sizes = Some(sizes);
    Ok(())
}

fn make_disk(state: &mut MachineState) -> anyhow::Result<()> {
    host::check_required_tools(&[host::SFDISK])?;
    let names = state
        .aux
        .artifact_names
        .as_ref()
        .context("artifact names have not been set")?;
    let sizes = state
        .aux
        .image_sizes
        .as_ref()
        .context("image sizes have not been calculated")?;

    for (name, volume) in &state.gadget()?.volumes {
        let artifact = names
            .get(name)
            .with_context(|| format!("no artifact name for volume '{}'", name))?;
        let size = *sizes
            .get(name)
            .with_context(|| format!("no image size for volume '{}'", name))?;
        super::make_volume_disk(state, name, volume, artifact, size)?;
    }
    Ok(())
}

fn generate_manifest(state: &mut MachineState) -> anyhow::Result<()> {
    let manifest = snaps_manifest(&seed_dir(state)?)?;
    let path = state.output_dir()?.join(SNAPS_MANIFEST);
    fs::write(&path, manifest).with_context(|| format!("Failed to write {}", path.display()))?;
    log::info!("wrote {}", path.display());
    Ok(())
}

/// `<name> <revision>` for every `<name>_<revision>.snap` in `seed`, sorted.
pub fn snaps_manifest(seed: &Path) -> anyhow::Result<String> {
    let mut entries = Vec::new();
    for entry in
        fs::read_dir(seed).with_context(|| format!("Failed to read seed {}", seed.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("snap") {
            continue;
        }
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        match stem.rsplit_once('_') {
            Some((name, revision)) if !name.is_empty() && !revision.is_empty() => {
                entries.push(format!("{name} {revision}"));
            }
            _ => log::warn!("skipping seed file with unexpected name: {}", path.display()),
        }
    }
    entries.sort();

    let mut manifest = entries.join("\n");
    if !manifest.is_empty() {
        manifest.push('\n');
    }
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertion::tests::{model_with, PC_MODEL};
    use crate::gadget::tests::PC_GADGET;
    use tempfile::TempDir;

    fn flavor_with_model(temp: &TempDir, model: &str) -> SnapFlavor {
        let path = temp.path().join("pc.model");
        fs::write(&path, model).unwrap();
        SnapFlavor::new(SnapOptions {
            model: path,
            ..Default::default()
        })
    }

    /// Workdir laid out the way `snap prepare-image` leaves it.
    fn prepared_state(temp: &TempDir) -> MachineState {
        let mut state = MachineState::new(Some(temp.path().join("work")));
        super::super::make_temporary_directories(&mut state).unwrap();

        let gadget = state.unpack_dir().unwrap().join("gadget");
        fs::create_dir_all(gadget.join("meta")).unwrap();
        fs::write(gadget.join("meta/gadget.yaml"), PC_GADGET).unwrap();
        fs::write(gadget.join("grubx64.efi"), b"grub").unwrap();
        fs::write(gadget.join("pc-boot.img"), b"boot").unwrap();

        let seed = state
            .unpack_dir()
            .unwrap()
            .join("image/var/lib/snapd/seed/snaps");
        fs::create_dir_all(&seed).unwrap();
        for snap in ["pc_36.snap", "pc-kernel_123.snap", "core_4571.snap"] {
            fs::write(seed.join(snap), b"snap").unwrap();
        }
        fs::write(seed.join("README"), b"not a snap").unwrap();
        state
    }

    #[test]
    fn test_step_order() {
        let flavor = SnapFlavor::new(SnapOptions::default());
        let steps = flavor.steps(&CommonOptions::default()).unwrap();
        assert_eq!(
            steps.names(),
            [
                "make_temporary_directories",
                "determine_output_directory",
                "prepare_image",
                "load_gadget_yaml",
                "set_artifact_names",
                "populate_rootfs_contents",
                "generate_disk_info",
                "calculate_rootfs_size",
                "populate_bootfs_contents",
                "populate_prepare_partitions",
                "make_disk",
                "generate_manifest",
                "finish",
            ]
        );
    }

    #[test]
    fn test_locate_inputs() {
        let temp = TempDir::new().unwrap();
        let mut missing = SnapFlavor::new(SnapOptions {
            model: temp.path().join("missing.model"),
            ..Default::default()
        });
        assert!(matches!(
            missing.locate_inputs().unwrap_err(),
            Error::Io { .. }
        ));

        let mut flavor = flavor_with_model(&temp, PC_MODEL);
        assert!(flavor.locate_inputs().is_ok());
        flavor.opts.disk_info = Some(temp.path().join("no-info"));
        assert!(matches!(flavor.locate_inputs().unwrap_err(), Error::Io { .. }));

        let mut dir = SnapFlavor::new(SnapOptions {
            model: temp.path().to_path_buf(),
            ..Default::default()
        });
        assert!(dir.locate_inputs().is_err());
    }

    #[test]
    fn test_derive_parameters() {
        let temp = TempDir::new().unwrap();
        let mut flavor = flavor_with_model(&temp, PC_MODEL);
        let mut state = MachineState::default();
        flavor.derive_parameters(&mut state).unwrap();

        assert_eq!(state.aux.series.as_deref(), Some("16.04"));
        assert_eq!(state.aux.model_sha256.as_ref().map(String::len), Some(64));
        assert_eq!(flavor.model().and_then(|m| m.gadget()), Some("pc"));
    }

    #[test]
    fn test_derive_rejects_bad_models() {
        let temp = TempDir::new().unwrap();
        let mut reserved = flavor_with_model(&temp, &model_with("18", &[("class", "x")]));
        assert!(matches!(
            reserved
                .derive_parameters(&mut MachineState::default())
                .unwrap_err(),
            Error::Validation(_)
        ));

        let mut serial = flavor_with_model(&temp, "type: serial\nserial: 1\n\nSIG\n");
        assert!(matches!(
            serial
                .derive_parameters(&mut MachineState::default())
                .unwrap_err(),
            Error::Type { .. }
        ));

        let mut garbage = flavor_with_model(&temp, "no envelope here");
        assert!(matches!(
            garbage
                .derive_parameters(&mut MachineState::default())
                .unwrap_err(),
            Error::Decode { .. }
        ));
    }

    #[test]
    fn test_gadget_and_artifact_names() {
        let temp = TempDir::new().unwrap();
        let mut state = prepared_state(&temp);
        load_gadget_yaml(&mut state).unwrap();
        set_artifact_names(&mut state).unwrap();

        assert!(state.gadget().unwrap().volumes.contains_key("pc"));
        assert_eq!(
            state.aux.artifact_names.as_ref().unwrap()["pc"],
            "pc.img"
        );
    }

    #[test]
    fn test_missing_gadget_yaml() {
        let temp = TempDir::new().unwrap();
        let mut state = MachineState::new(Some(temp.path().to_path_buf()));
        let err = load_gadget_yaml(&mut state).unwrap_err();
        assert!(err.to_string().contains("gadget.yaml"));
    }

    #[test]
    fn test_rootfs_and_disk_info() {
        let temp = TempDir::new().unwrap();
        let mut state = prepared_state(&temp);
        // leftovers from an interrupted run are discarded
        fs::write(state.rootfs_dir().unwrap().join("stale"), b"x").unwrap();
        populate_rootfs_contents(&mut state).unwrap();

        let rootfs = state.rootfs_dir().unwrap();
        assert!(!rootfs.join("stale").exists());
        assert!(rootfs
            .join("system-data/var/lib/snapd/seed/snaps/pc_36.snap")
            .exists());

        let info = temp.path().join("info");
        fs::write(&info, "built for testing\n").unwrap();
        generate_disk_info(&mut state, Some(info.as_path())).unwrap();
        assert_eq!(
            fs::read_to_string(rootfs.join(".disk/info")).unwrap(),
            "built for testing\n"
        );
        generate_disk_info(&mut state, None).unwrap();
    }

    #[test]
    fn test_populate_bootfs_contents() {
        let temp = TempDir::new().unwrap();
        let mut state = prepared_state(&temp);
        load_gadget_yaml(&mut state).unwrap();
        populate_bootfs_contents(&mut state).unwrap();

        let efi = structure_dir(&state, "pc", 2).unwrap();
        assert_eq!(fs::read(efi.join("EFI/boot/grubx64.efi")).unwrap(), b"grub");
        // no staging for raw or rootfs structures
        assert!(!structure_dir(&state, "pc", 0).unwrap().exists());
        assert!(!structure_dir(&state, "pc", 3).unwrap().exists());
    }

    #[test]
    fn test_stage_content_into_directory() {
        let temp = TempDir::new().unwrap();
        let gadget = temp.path().join("gadget");
        fs::create_dir_all(gadget.join("boot-assets")).unwrap();
        fs::write(gadget.join("boot-assets/config.txt"), "x").unwrap();
        fs::write(gadget.join("shim.efi"), "shim").unwrap();

        let dest = temp.path().join("part");
        stage_content(&gadget, "shim.efi", &dest, "EFI/boot/").unwrap();
        stage_content(&gadget, "boot-assets/", &dest, "/").unwrap();
        assert!(dest.join("EFI/boot/shim.efi").exists());
        assert!(dest.join("config.txt").exists());
        assert!(stage_content(&gadget, "missing.bin", &dest, "x").is_err());
    }

    #[test]
    fn test_generate_manifest() {
        let temp = TempDir::new().unwrap();
        let mut state = prepared_state(&temp);
        let out = temp.path().join("out");
        super::super::determine_output_directory(&mut state, Some(out.as_path())).unwrap();
        generate_manifest(&mut state).unwrap();

        assert_eq!(
            fs::read_to_string(out.join(SNAPS_MANIFEST)).unwrap(),
            "core 4571\npc 36\npc-kernel 123\n"
        );
    }

    #[test]
    fn test_snaps_manifest_empty_and_missing() {
        let temp = TempDir::new().unwrap();
        assert_eq!(snaps_manifest(temp.path()).unwrap(), "");
        assert!(snaps_manifest(&temp.path().join("missing")).is_err());
    }
}
