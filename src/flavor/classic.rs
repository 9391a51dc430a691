//! Classic (deb based) images built from an image definition.

use anyhow::Context;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::cell::OnceCell;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::filesystem;
use crate::gadget::{Schema, Structure, Volume, ROLE_SYSTEM_DATA};
use crate::machine::{CommonOptions, Flavor, MachineState, StateField, Step, StepList};
use crate::{disk, validate};

use super::structure_image;

/// Package list written next to the image.
pub const FILESYSTEM_MANIFEST: &str = "filesystem.manifest";

const SOURCES_DIR: &str = "etc/apt/sources.list.d";
const FIRST_UID: u32 = 1000;
const LAST_UID: u32 = 59999;
const VOLUME_NAME: &str = "classic";
const ROOTFS_LABEL: &str = "cloudimg-rootfs";

#[derive(Debug, Clone, Default)]
pub struct ClassicOptions {
    pub image_definition: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageDefinitionToml {
    series: String,
    architecture: String,
    rootfs: RootfsToml,
    #[serde(default)]
    extra_ppas: Vec<PpaToml>,
    #[serde(default)]
    users: Vec<UserToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RootfsToml {
    tarball: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PpaToml {
    name: String,
    keep_enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UserToml {
    name: String,
    expire: Option<bool>,
}

/// A validated image definition. Every optional switch of the file has been
/// resolved to a concrete value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDefinition {
    pub series: String,
    pub architecture: String,
    /// Relative paths in the file are resolved against its directory.
    pub tarball: PathBuf,
    pub extra_ppas: Vec<Ppa>,
    pub users: Vec<User>,
    /// Digest of the file as read, compared on resume.
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ppa {
    pub owner: String,
    pub name: String,
    /// Leave the source configured in the final image.
    pub keep_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    /// Force a password change on first login.
    pub expire: bool,
}

impl ImageDefinition {
    /// Read and validate the definition at `path`. Relative tarball paths
    /// are resolved against the definition's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let parsed: ImageDefinitionToml = toml::from_str(&raw).map_err(|e| {
            Error::validation(format!(
                "invalid image definition '{}': {}",
                path.display(),
                e
            ))
        })?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let tarball = if parsed.rootfs.tarball.is_absolute() {
            parsed.rootfs.tarball
        } else {
            base.join(parsed.rootfs.tarball)
        };

        let extra_ppas = parsed
            .extra_ppas
            .into_iter()
            .map(|ppa| {
                let keep_enabled = validate::require_set(
                    ppa.keep_enabled,
                    &format!("keep_enabled of extra PPA '{}'", ppa.name),
                )?;
                let (owner, name) = parse_ppa_name(&ppa.name)?;
                Ok(Ppa {
                    owner,
                    name,
                    keep_enabled,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let users = parsed
            .users
            .into_iter()
            .map(|user| {
                let expire =
                    validate::require_set(user.expire, &format!("expire of user '{}'", user.name))?;
                if !valid_user_name(&user.name) {
                    return Err(Error::validation(format!(
                        "invalid user name '{}'",
                        user.name
                    )));
                }
                Ok(User {
                    name: user.name,
                    expire,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if parsed.series.trim().is_empty() {
            return Err(Error::validation("image definition has an empty series"));
        }

        Ok(Self {
            series: parsed.series,
            architecture: parsed.architecture,
            tarball,
            extra_ppas,
            users,
            sha256: format!("{:x}", Sha256::digest(raw.as_bytes())),
        })
    }

    /// File name of the disk image.
    pub fn artifact_name(&self) -> String {
        format!("ubuntu-{}-{}.img", self.series, self.architecture)
    }
}

fn parse_ppa_name(raw: &str) -> Result<(String, String)> {
    match raw.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((owner.to_string(), name.to_string()))
        }
        _ => Err(Error::validation(format!(
            "extra PPA '{raw}' must be written as <owner>/<name>"
        ))),
    }
}

fn valid_user_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

type SharedDefinition = Rc<OnceCell<ImageDefinition>>;

fn loaded(definition: &SharedDefinition) -> anyhow::Result<&ImageDefinition> {
    definition
        .get()
        .context("image definition has not been loaded")
}

#[derive(Debug)]
pub struct ClassicFlavor {
    opts: ClassicOptions,
    definition: SharedDefinition,
}

impl ClassicFlavor {
    pub fn new(opts: ClassicOptions) -> Self {
        Self {
            opts,
            definition: Rc::new(OnceCell::new()),
        }
    }

    pub fn definition(&self) -> Option<&ImageDefinition> {
        self.definition.get()
    }
}

impl Flavor for ClassicFlavor {
    fn name(&self) -> &'static str {
        "classic"
    }

    fn steps(&self, common: &CommonOptions) -> Result<StepList> {
        use StateField::*;

        let output_dir = common.output_dir.clone();
        let for_extract = Rc::clone(&self.definition);
        let for_ppas = Rc::clone(&self.definition);
        let for_users = Rc::clone(&self.definition);
        let for_disk = Rc::clone(&self.definition);

        StepList::new(vec![
            Step::new("make_temporary_directories", super::make_temporary_directories),
            Step::new("determine_output_directory", move |state| {
                super::determine_output_directory(state, output_dir.as_deref())
            })
            .writes(&[OutputDir]),
            Step::new("extract_rootfs_tarball", move |state| {
                extract_rootfs_tarball(state, loaded(&for_extract)?)
            }),
            Step::new("add_extra_ppas", move |state| {
                add_extra_ppas(state, loaded(&for_ppas)?)
            })
            .writes(&[PpaSources]),
            Step::new("add_users", move |state| {
                add_users(&state.rootfs_dir()?, &loaded(&for_users)?.users)
            }),
            Step::new("calculate_rootfs_size", super::calculate_rootfs_size).writes(&[RootfsSize]),
            Step::new("clean_extra_ppas", clean_extra_ppas).reads(&[PpaSources]),
            Step::new("make_disk", move |state| make_disk(state, loaded(&for_disk)?))
                .reads(&[OutputDir, RootfsSize]),
            Step::new("generate_manifest", generate_manifest).reads(&[OutputDir]),
            Step::new("finish", super::finish),
        ])
    }

    fn options(&self) -> Vec<(&'static str, String)> {
        vec![(
            "image_definition",
            self.opts.image_definition.display().to_string(),
        )]
    }

    fn locate_inputs(&mut self) -> Result<()> {
        let path = &self.opts.image_definition;
        fs::metadata(path).map_err(|e| Error::io(path, e))?;
        Ok(())
    }

    fn derive_parameters(&mut self, state: &mut MachineState) -> Result<()> {
        let definition = ImageDefinition::load(&self.opts.image_definition)?;
        fs::metadata(&definition.tarball).map_err(|e| Error::io(&definition.tarball, e))?;
        log::info!(
            "classic {} image for {} from {}",
            definition.series,
            definition.architecture,
            definition.tarball.display()
        );

        state.aux.series = Some(definition.series.clone());
        state.aux.definition_sha256 = Some(definition.sha256.clone());
        if self.definition.set(definition).is_err() {
            return Err(Error::validation("image definition loaded twice"));
        }
        Ok(())
    }
}

fn extract_rootfs_tarball(
    state: &mut MachineState,
    definition: &ImageDefinition,
) -> anyhow::Result<()> {
    let rootfs = state.rootfs_dir()?;
    filesystem::reset_dir(&rootfs)?;
    filesystem::extract_tarball(&definition.tarball, &rootfs)
}

/// deb822 source for a Launchpad PPA.
fn ppa_source(ppa: &Ppa, series: &str) -> String {
    format!(
        "Types: deb\nURIs: https://ppa.launchpadcontent.net/{}/{}/ubuntu\nSuites: {}\nComponents: main\n",
        ppa.owner, ppa.name, series
    )
}

fn add_extra_ppas(state: &mut MachineState, definition: &ImageDefinition) -> anyhow::Result<()> {
    let rootfs = state.rootfs_dir()?;
    let sources_dir = rootfs.join(SOURCES_DIR);
    fs::create_dir_all(&sources_dir)
        .with_context(|| format!("Failed to create {}", sources_dir.display()))?;

    let mut temporary = Vec::new();
    for ppa in &definition.extra_ppas {
        let relative = Path::new(SOURCES_DIR).join(format!(
            "{}-ubuntu-{}-{}.sources",
            ppa.owner, ppa.name, definition.series
        ));
        let path = rootfs.join(&relative);
        fs::write(&path, ppa_source(ppa, &definition.series))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        log::debug!("added PPA {}/{}", ppa.owner, ppa.name);
        if !ppa.keep_enabled {
            temporary.push(relative);
        }
    }

    state.aux.ppa_sources = Some(temporary);
    Ok(())
}

fn clean_extra_ppas(state: &mut MachineState) -> anyhow::Result<()> {
    let rootfs = state.rootfs_dir()?;
    let sources = state
        .aux
        .ppa_sources
        .as_deref()
        .context("PPA sources have not been recorded")?;
    for relative in sources {
        let path = rootfs.join(relative);
        match fs::remove_file(&path) {
            Ok(()) => log::debug!("removed {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to remove {}", path.display()))
            }
        }
    }
    Ok(())
}

/// Read a UID/GID pair from the rootfs passwd file.
///
/// Returns `Ok(None)` if the user or the file doesn't exist, and an error if
/// the file exists but is corrupted.
pub fn read_uid_from_rootfs(rootfs: &Path, username: &str) -> anyhow::Result<Option<(u32, u32)>> {
    Ok(passwd_entries(rootfs)?
        .into_iter()
        .find(|(name, _, _)| name == username)
        .map(|(_, uid, gid)| (uid, gid)))
}

fn passwd_entries(rootfs: &Path) -> anyhow::Result<Vec<(String, u32, u32)>> {
    let passwd_path = rootfs.join("etc/passwd");
    if !passwd_path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(&passwd_path)
        .with_context(|| format!("Failed to read passwd file at {}", passwd_path.display()))?;

    let mut entries = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() < 4 {
            anyhow::bail!(
                "Corrupted passwd file: malformed line '{}' at {}",
                line,
                passwd_path.display()
            );
        }
        let uid: u32 = parts[2].parse().with_context(|| {
            format!(
                "Corrupted passwd file: invalid UID '{}' for user '{}' at {}",
                parts[2],
                parts[0],
                passwd_path.display()
            )
        })?;
        let gid: u32 = parts[3].parse().with_context(|| {
            format!(
                "Corrupted passwd file: invalid GID '{}' for user '{}' at {}",
                parts[3],
                parts[0],
                passwd_path.display()
            )
        })?;
        entries.push((parts[0].to_string(), uid, gid));
    }
    Ok(entries)
}

fn append_line(path: &Path, line: &str) -> anyhow::Result<()> {
    let mut content = if path.exists() {
        fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?
    } else {
        String::new()
    };
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(line);
    content.push('\n');
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

fn days_since_epoch() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp() / 86_400
}

/// Ensure every user exists in the rootfs with a locked password, its own
/// group and a home directory. Users that already exist are left alone.
pub fn add_users(rootfs: &Path, users: &[User]) -> anyhow::Result<()> {
    let etc = rootfs.join("etc");
    fs::create_dir_all(&etc)?;

    for user in users {
        if read_uid_from_rootfs(rootfs, &user.name)?.is_some() {
            log::debug!("user {} already exists", user.name);
            continue;
        }

        let next = passwd_entries(rootfs)?
            .iter()
            .map(|(_, uid, _)| *uid)
            .filter(|uid| (FIRST_UID..=LAST_UID).contains(uid))
            .max()
            .map_or(FIRST_UID, |uid| uid + 1);
        anyhow::ensure!(next <= LAST_UID, "no free UID left for user {}", user.name);

        let home = format!("/home/{}", user.name);
        append_line(
            &etc.join("passwd"),
            &format!(
                "{name}:x:{next}:{next}:{name}:{home}:/bin/bash",
                name = user.name
            ),
        )?;
        append_line(&etc.join("group"), &format!("{}:x:{}:", user.name, next))?;

        // A last-change day of 0 forces a password change on first login.
        let last_change = if user.expire { 0 } else { days_since_epoch() };
        append_line(
            &etc.join("shadow"),
            &format!("{}:*:{}:0:99999:7:::", user.name, last_change),
        )?;

        fs::create_dir_all(rootfs.join(home.trim_start_matches('/')))?;
        log::info!("added user {} (uid {})", user.name, next);
    }
    Ok(())
}

/// Single GPT volume holding only the root filesystem.
fn classic_volume() -> Volume {
    Volume {
        schema: Schema::Gpt,
        bootloader: None,
        structure: vec![Structure {
            name: Some(ROOTFS_LABEL.to_string()),
            kind: "0FC63DAF-8483-4772-8E79-3D69D8477DE4".to_string(),
            role: Some(ROLE_SYSTEM_DATA.to_string()),
            size: 0,
            offset: None,
            filesystem: Some("ext4".to_string()),
            filesystem_label: Some(ROOTFS_LABEL.to_string()),
            content: Vec::new(),
        }],
    }
}

fn make_disk(state: &mut MachineState, definition: &ImageDefinition) -> anyhow::Result<()> {
    crate::host::check_required_tools(&[crate::host::MKFS_EXT4, crate::host::SFDISK])?;

    let volume = classic_volume();
    let rootfs_size = state.rootfs_size()?;
    let rootfs = state.rootfs_dir()?;
    for placement in volume.layout(rootfs_size)? {
        let structure = &volume.structure[placement.index];
        let image = structure_image(state, VOLUME_NAME, placement.index)?;
        if let Some(parent) = image.parent() {
            fs::create_dir_all(parent)?;
        }
        disk::make_ext4(&image, placement.size, structure.label(), &rootfs)?;
    }

    let size = volume.image_size(rootfs_size)?;
    super::make_volume_disk(
        state,
        VOLUME_NAME,
        &volume,
        &definition.artifact_name(),
        size,
    )?;
    Ok(())
}

/// `<package>\t<version>` for every installed package in the rootfs dpkg
/// database, sorted by package name.
pub fn filesystem_manifest(rootfs: &Path) -> anyhow::Result<String> {
    let status_path = rootfs.join("var/lib/dpkg/status");
    if !status_path.exists() {
        return Ok(String::new());
    }
    let status = fs::read_to_string(&status_path)
        .with_context(|| format!("Failed to read {}", status_path.display()))?;

    let mut packages = Vec::new();
    for stanza in status.split("\n\n") {
        let mut package = None;
        let mut version = None;
        let mut installed = false;
        for line in stanza.lines() {
            if let Some(value) = line.strip_prefix("Package:") {
                package = Some(value.trim());
            } else if let Some(value) = line.strip_prefix("Version:") {
                version = Some(value.trim());
            } else if let Some(value) = line.strip_prefix("Status:") {
                installed = value.trim().ends_with(" installed");
            }
        }
        if let (Some(package), Some(version), true) = (package, version, installed) {
            packages.push(format!("{package}\t{version}"));
        }
    }
    packages.sort();

    let mut manifest = packages.join("\n");
    if !manifest.is_empty() {
        manifest.push('\n');
    }
    Ok(manifest)
}

fn generate_manifest(state: &mut MachineState) -> anyhow::Result<()> {
    let manifest = filesystem_manifest(&state.rootfs_dir()?)?;
    let path = state.output_dir()?.join(FILESYSTEM_MANIFEST);
    fs::write(&path, manifest).with_context(|| format!("Failed to write {}", path.display()))?;
    log::info!("wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DEFINITION: &str = r#"
series = "jammy"
architecture = "amd64"

[rootfs]
tarball = "rootfs.tar"

[[extra_ppas]]
name = "canonical-foundations/ubuntu-image"
keep_enabled = false

[[extra_ppas]]
name = "deadsnakes/ppa"
keep_enabled = true

[[users]]
name = "ubuntu"
expire = true
"#;

    fn write_definition(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("image.toml");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_definition() {
        let temp = TempDir::new().unwrap();
        let definition = ImageDefinition::load(&write_definition(temp.path(), DEFINITION)).unwrap();

        assert_eq!(definition.series, "jammy");
        assert_eq!(definition.tarball, temp.path().join("rootfs.tar"));
        assert_eq!(
            definition.extra_ppas[0],
            Ppa {
                owner: "canonical-foundations".into(),
                name: "ubuntu-image".into(),
                keep_enabled: false,
            }
        );
        assert!(definition.extra_ppas[1].keep_enabled);
        assert_eq!(
            definition.users,
            vec![User {
                name: "ubuntu".into(),
                expire: true
            }]
        );
        assert_eq!(definition.artifact_name(), "ubuntu-jammy-amd64.img");

        let edited = DEFINITION.replace("expire = true", "expire = false");
        let other = ImageDefinition::load(&write_definition(temp.path(), &edited)).unwrap();
        assert_ne!(definition.sha256, other.sha256);
    }

    #[test]
    fn test_unset_switches_are_rejected() {
        let temp = TempDir::new().unwrap();
        let no_keep = DEFINITION.replace("keep_enabled = true\n", "");
        let err = ImageDefinition::load(&write_definition(temp.path(), &no_keep)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("keep_enabled of extra PPA 'deadsnakes/ppa'"));

        let no_expire = DEFINITION.replace("expire = true\n", "");
        let err = ImageDefinition::load(&write_definition(temp.path(), &no_expire)).unwrap_err();
        assert!(err.to_string().contains("expire of user 'ubuntu' is not set"));
    }

    #[test]
    fn test_invalid_definitions() {
        let temp = TempDir::new().unwrap();
        let cases = [
            DEFINITION.replace("series = \"jammy\"", "series = \"jammy\"\ncodename = \"x\""),
            DEFINITION.replace("deadsnakes/ppa", "deadsnakes"),
            DEFINITION.replace("name = \"ubuntu\"", "name = \"Bad User\""),
            DEFINITION.replace("\"jammy\"", "\" \""),
            "series = ".to_string(),
        ];
        for content in cases {
            let err = ImageDefinition::load(&write_definition(temp.path(), &content)).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{content}: {err}");
        }

        let err = ImageDefinition::load(&temp.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_step_order() {
        let flavor = ClassicFlavor::new(ClassicOptions::default());
        let steps = flavor.steps(&CommonOptions::default()).unwrap();
        assert_eq!(
            steps.names(),
            [
                "make_temporary_directories",
                "determine_output_directory",
                "extract_rootfs_tarball",
                "add_extra_ppas",
                "add_users",
                "calculate_rootfs_size",
                "clean_extra_ppas",
                "make_disk",
                "generate_manifest",
                "finish",
            ]
        );
    }

    #[test]
    fn test_derive_requires_tarball() {
        let temp = TempDir::new().unwrap();
        let mut flavor = ClassicFlavor::new(ClassicOptions {
            image_definition: write_definition(temp.path(), DEFINITION),
        });
        flavor.locate_inputs().unwrap();
        let err = flavor
            .derive_parameters(&mut MachineState::default())
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));

        fs::write(temp.path().join("rootfs.tar"), b"").unwrap();
        let mut state = MachineState::default();
        flavor.derive_parameters(&mut state).unwrap();
        assert_eq!(state.aux.series.as_deref(), Some("jammy"));
        assert_eq!(state.aux.definition_sha256.as_ref().map(String::len), Some(64));
        assert_eq!(flavor.definition().map(|d| d.users.len()), Some(1));
    }

    #[test]
    fn test_ppas_added_and_cleaned() {
        let temp = TempDir::new().unwrap();
        let definition = ImageDefinition::load(&write_definition(temp.path(), DEFINITION)).unwrap();
        let mut state = MachineState::new(Some(temp.path().join("work")));
        super::super::make_temporary_directories(&mut state).unwrap();

        add_extra_ppas(&mut state, &definition).unwrap();
        let sources = state.rootfs_dir().unwrap().join(SOURCES_DIR);
        let temporary = sources.join("canonical-foundations-ubuntu-ubuntu-image-jammy.sources");
        let kept = sources.join("deadsnakes-ubuntu-ppa-jammy.sources");
        assert!(fs::read_to_string(&temporary)
            .unwrap()
            .contains("URIs: https://ppa.launchpadcontent.net/canonical-foundations/ubuntu-image/ubuntu"));
        assert!(kept.exists());
        assert_eq!(state.aux.ppa_sources.as_ref().map(Vec::len), Some(1));

        clean_extra_ppas(&mut state).unwrap();
        assert!(!temporary.exists());
        assert!(kept.exists());
        // already removed
        clean_extra_ppas(&mut state).unwrap();
    }

    #[test]
    fn test_add_users() {
        let temp = TempDir::new().unwrap();
        let rootfs = temp.path();
        fs::create_dir_all(rootfs.join("etc")).unwrap();
        fs::write(
            rootfs.join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/bash\nnobody:x:65534:65534:nobody:/nonexistent:/usr/sbin/nologin\n",
        )
        .unwrap();

        let users = vec![
            User {
                name: "ubuntu".into(),
                expire: true,
            },
            User {
                name: "ops".into(),
                expire: false,
            },
        ];
        add_users(rootfs, &users).unwrap();
        // idempotent on resume
        add_users(rootfs, &users).unwrap();

        assert_eq!(read_uid_from_rootfs(rootfs, "ubuntu").unwrap(), Some((1000, 1000)));
        assert_eq!(read_uid_from_rootfs(rootfs, "ops").unwrap(), Some((1001, 1001)));
        assert_eq!(read_uid_from_rootfs(rootfs, "root").unwrap(), Some((0, 0)));
        assert_eq!(read_uid_from_rootfs(rootfs, "nobody").unwrap(), Some((65534, 65534)));

        let shadow = fs::read_to_string(rootfs.join("etc/shadow")).unwrap();
        assert!(shadow.contains("ubuntu:*:0:0:99999:7:::"));
        assert!(!shadow.contains("ops:*:0:"));
        assert_eq!(shadow.lines().count(), 2);
        assert!(fs::read_to_string(rootfs.join("etc/group"))
            .unwrap()
            .contains("ops:x:1001:"));
        assert!(rootfs.join("home/ubuntu").is_dir());
    }

    #[test]
    fn test_corrupt_passwd() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("etc")).unwrap();
        fs::write(temp.path().join("etc/passwd"), "root:x:zero:0:root:/root:/bin/sh\n").unwrap();
        let err = read_uid_from_rootfs(temp.path(), "root").unwrap_err();
        assert!(err.to_string().contains("Corrupted passwd file"));
        assert_eq!(read_uid_from_rootfs(&temp.path().join("none"), "root").unwrap(), None);
    }

    #[test]
    fn test_filesystem_manifest() {
        let temp = TempDir::new().unwrap();
        assert_eq!(filesystem_manifest(temp.path()).unwrap(), "");

        let status = temp.path().join("var/lib/dpkg/status");
        fs::create_dir_all(status.parent().unwrap()).unwrap();
        fs::write(
            &status,
            "Package: zlib1g\nStatus: install ok installed\nVersion: 1:1.2.13\n\n\
             Package: bash\nStatus: install ok installed\nArchitecture: amd64\nVersion: 5.1-6\n\n\
             Package: removed\nStatus: deinstall ok config-files\nVersion: 1.0\n",
        )
        .unwrap();
        assert_eq!(
            filesystem_manifest(temp.path()).unwrap(),
            "bash\t5.1-6\nzlib1g\t1:1.2.13\n"
        );
    }

    #[test]
    fn test_classic_volume_layout() {
        let volume = classic_volume();
        let layout = volume.layout(64 * crate::gadget::MIB).unwrap();
        assert_eq!(layout.len(), 1);
        assert_eq!(layout[0].start, crate::gadget::MIB);
        assert_eq!(layout[0].size, 64 * crate::gadget::MIB);
        assert_eq!(
            volume.image_size(64 * crate::gadget::MIB).unwrap(),
            66 * crate::gadget::MIB
        );
    }
}
