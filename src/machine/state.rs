//! State shared by the steps of one machine.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::gadget::GadgetInfo;

/// Fields that outlive a process restart. Everything a later step needs from
/// an earlier one lives here so resume metadata can snapshot it wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Auxiliary {
    pub series: Option<String>,
    pub model_sha256: Option<String>,
    pub definition_sha256: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub gadget: Option<GadgetInfo>,
    pub artifact_names: Option<BTreeMap<String, String>>,
    pub rootfs_size: Option<u64>,
    pub image_sizes: Option<BTreeMap<String, u64>>,
    pub ppa_sources: Option<Vec<PathBuf>>,
}

/// Names of the [`Auxiliary`] fields, used by steps to declare what they
/// consume and produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateField {
    Series,
    ModelSha256,
    DefinitionSha256,
    OutputDir,
    Gadget,
    ArtifactNames,
    RootfsSize,
    ImageSizes,
    PpaSources,
}

impl StateField {
    pub fn name(self) -> &'static str {
        match self {
            StateField::Series => "series",
            StateField::ModelSha256 => "model_sha256",
            StateField::DefinitionSha256 => "definition_sha256",
            StateField::OutputDir => "output_dir",
            StateField::Gadget => "gadget",
            StateField::ArtifactNames => "artifact_names",
            StateField::RootfsSize => "rootfs_size",
            StateField::ImageSizes => "image_sizes",
            StateField::PpaSources => "ppa_sources",
        }
    }
}

impl fmt::Display for StateField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Auxiliary {
    pub fn is_set(&self, field: StateField) -> bool {
        match field {
            StateField::Series => self.series.is_some(),
            StateField::ModelSha256 => self.model_sha256.is_some(),
            StateField::DefinitionSha256 => self.definition_sha256.is_some(),
            StateField::OutputDir => self.output_dir.is_some(),
            StateField::Gadget => self.gadget.is_some(),
            StateField::ArtifactNames => self.artifact_names.is_some(),
            StateField::RootfsSize => self.rootfs_size.is_some(),
            StateField::ImageSizes => self.image_sizes.is_some(),
            StateField::PpaSources => self.ppa_sources.is_some(),
        }
    }

    /// Field-keyed view used for persistence and mismatch reports.
    pub fn to_map(&self) -> BTreeMap<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        }
    }

    /// Fields set in both `self` and `other` with different values.
    pub fn conflicts_with(&self, other: &Auxiliary) -> Vec<String> {
        let ours = self.to_map();
        let theirs = other.to_map();
        ours.iter()
            .filter(|(_, value)| !value.is_null())
            .filter_map(|(name, value)| match theirs.get(name) {
                Some(other) if !other.is_null() && other != value => {
                    Some(format!("{name}: recorded {value}, now {other}"))
                }
                _ => None,
            })
            .collect()
    }
}

/// Mutable context handed to every step.
#[derive(Debug, Default)]
pub struct MachineState {
    workdir: Option<PathBuf>,
    temporary_workdir: Option<TempDir>,
    pub aux: Auxiliary,
}

impl MachineState {
    pub fn new(workdir: Option<PathBuf>) -> Self {
        Self {
            workdir,
            temporary_workdir: None,
            aux: Auxiliary::default(),
        }
    }

    /// The workspace directory. Fails before `make_temporary_directories`
    /// has run when no workdir was given.
    pub fn workdir(&self) -> Result<&Path> {
        self.workdir
            .as_deref()
            .context("workdir has not been created yet")
    }

    /// Create a throwaway workdir, removed again by [`Self::cleanup_workdir`].
    pub fn ensure_workdir(&mut self) -> Result<&Path> {
        if self.workdir.is_none() {
            let tmp = tempfile::Builder::new()
                .prefix("image-builder-")
                .tempdir()
                .context("creating temporary workdir")?;
            self.workdir = Some(tmp.path().to_path_buf());
            self.temporary_workdir = Some(tmp);
        }
        self.workdir()
    }

    pub fn is_temporary_workdir(&self) -> bool {
        self.temporary_workdir.is_some()
    }

    /// Remove a temporary workdir. User-supplied workdirs are kept.
    pub fn cleanup_workdir(&mut self) -> Result<()> {
        if let Some(tmp) = self.temporary_workdir.take() {
            let path = tmp.path().to_path_buf();
            tmp.close()
                .with_context(|| format!("removing temporary workdir '{}'", path.display()))?;
            self.workdir = None;
        }
        Ok(())
    }

    pub fn output_dir(&self) -> Result<&Path> {
        self.aux
            .output_dir
            .as_deref()
            .context("output directory has not been determined yet")
    }

    pub fn rootfs_dir(&self) -> Result<PathBuf> {
        Ok(self.workdir()?.join("root"))
    }

    pub fn unpack_dir(&self) -> Result<PathBuf> {
        Ok(self.workdir()?.join("unpack"))
    }

    pub fn volumes_dir(&self) -> Result<PathBuf> {
        Ok(self.workdir()?.join("volumes"))
    }

    pub fn scratch_dir(&self) -> Result<PathBuf> {
        Ok(self.workdir()?.join("scratch"))
    }

    pub fn gadget(&self) -> Result<&GadgetInfo> {
        self.aux.gadget.as_ref().context("gadget.yaml has not been loaded")
    }

    pub fn rootfs_size(&self) -> Result<u64> {
        self.aux
            .rootfs_size
            .context("rootfs size has not been calculated")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_set_tracks_fields() {
        let mut aux = Auxiliary::default();
        assert!(!aux.is_set(StateField::RootfsSize));
        aux.rootfs_size = Some(42);
        assert!(aux.is_set(StateField::RootfsSize));
        assert!(!aux.is_set(StateField::Series));
    }

    #[test]
    fn test_map_is_keyed_by_field_name() {
        let aux = Auxiliary {
            series: Some("16.04".into()),
            ..Default::default()
        };
        let map = aux.to_map();
        assert_eq!(map["series"], serde_json::json!("16.04"));
        assert!(map["rootfs_size"].is_null());
        for field in [
            StateField::Series,
            StateField::ModelSha256,
            StateField::DefinitionSha256,
            StateField::OutputDir,
            StateField::Gadget,
            StateField::ArtifactNames,
            StateField::RootfsSize,
            StateField::ImageSizes,
            StateField::PpaSources,
        ] {
            assert!(map.contains_key(field.name()), "missing {field}");
        }
    }

    #[test]
    fn test_conflicts_only_between_set_fields() {
        let recorded = Auxiliary {
            series: Some("16.04".into()),
            rootfs_size: Some(10),
            ..Default::default()
        };
        let derived = Auxiliary {
            series: Some("18.04".into()),
            ..Default::default()
        };
        let conflicts = recorded.conflicts_with(&derived);
        assert_eq!(conflicts, vec!["series: recorded \"16.04\", now \"18.04\""]);
        assert!(recorded.conflicts_with(&recorded).is_empty());
    }

    #[test]
    fn test_temporary_workdir_is_removed() {
        let mut state = MachineState::new(None);
        assert!(state.workdir().is_err());
        let path = state.ensure_workdir().unwrap().to_path_buf();
        assert!(path.is_dir());
        assert!(state.is_temporary_workdir());
        state.cleanup_workdir().unwrap();
        assert!(!path.exists());
        assert!(state.workdir().is_err());
    }

    #[test]
    fn test_given_workdir_is_kept() {
        let tmp = TempDir::new().unwrap();
        let mut state = MachineState::new(Some(tmp.path().to_path_buf()));
        assert_eq!(state.ensure_workdir().unwrap(), tmp.path());
        state.cleanup_workdir().unwrap();
        assert!(tmp.path().is_dir());
        assert_eq!(state.rootfs_dir().unwrap(), tmp.path().join("root"));
    }
}
