//! Gadget description (`meta/gadget.yaml`) as consumed by the snap steps.
//!
//! Only the parts needed to lay out and populate volumes are read. Sizes and
//! offsets are resolved to bytes when the file is loaded so the result can be
//! persisted in resume metadata as plain numbers.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const MIB: u64 = 1024 * 1024;

/// Role of the structure holding the root filesystem.
pub const ROLE_SYSTEM_DATA: &str = "system-data";
pub const ROLE_MBR: &str = "mbr";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GadgetInfo {
    pub volumes: BTreeMap<String, Volume>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub schema: Schema,
    pub bootloader: Option<String>,
    pub structure: Vec<Structure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Schema {
    Gpt,
    Mbr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Structure {
    pub name: Option<String>,
    pub kind: String,
    pub role: Option<String>,
    pub size: u64,
    pub offset: Option<u64>,
    pub filesystem: Option<String>,
    pub filesystem_label: Option<String>,
    pub content: Vec<Content>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Image { image: String },
    Files { source: String, target: String },
}

/// Where a structure lands on its volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub index: usize,
    pub start: u64,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
struct GadgetYaml {
    volumes: BTreeMap<String, VolumeYaml>,
}

#[derive(Debug, Deserialize)]
struct VolumeYaml {
    schema: Option<String>,
    bootloader: Option<String>,
    #[serde(default)]
    structure: Vec<StructureYaml>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct StructureYaml {
    name: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    role: Option<String>,
    size: SizeYaml,
    offset: Option<SizeYaml>,
    filesystem: Option<String>,
    filesystem_label: Option<String>,
    #[serde(default)]
    content: Vec<Content>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SizeYaml {
    Bytes(u64),
    Text(String),
}

impl GadgetInfo {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let parsed: GadgetYaml = serde_yaml::from_str(raw).context("parsing gadget.yaml")?;
        if parsed.volumes.is_empty() {
            bail!("gadget.yaml declares no volumes");
        }

        let mut volumes = BTreeMap::new();
        for (name, volume) in parsed.volumes {
            let schema = match volume.schema.as_deref() {
                None | Some("gpt") => Schema::Gpt,
                Some("mbr") => Schema::Mbr,
                Some(other) => bail!("volume '{}' has unsupported schema '{}'", name, other),
            };
            let structure = volume
                .structure
                .into_iter()
                .enumerate()
                .map(|(index, s)| {
                    resolve_structure(s)
                        .with_context(|| format!("volume '{}' structure #{}", name, index))
                })
                .collect::<Result<Vec<_>>>()?;
            let volume = Volume {
                schema,
                bootloader: volume.bootloader,
                structure,
            };
            volume
                .image_size(0)
                .with_context(|| format!("volume '{}'", name))?;
            volumes.insert(name, volume);
        }

        Ok(Self { volumes })
    }
}

fn resolve_structure(raw: StructureYaml) -> Result<Structure> {
    Ok(Structure {
        name: raw.name,
        kind: raw.kind,
        role: raw.role,
        size: resolve_size(raw.size)?,
        offset: raw.offset.map(resolve_size).transpose()?,
        filesystem: raw.filesystem.filter(|fs| fs != "none"),
        filesystem_label: raw.filesystem_label,
        content: raw.content,
    })
}

fn resolve_size(raw: SizeYaml) -> Result<u64> {
    match raw {
        SizeYaml::Bytes(bytes) => Ok(bytes),
        SizeYaml::Text(text) => parse_size(&text),
    }
}

/// Parse `440`, `1M`, `1.5G`-style sizes into bytes.
pub fn parse_size(text: &str) -> Result<u64> {
    let text = text.trim();
    let (number, unit) = match text.char_indices().find(|(_, c)| c.is_ascii_alphabetic()) {
        Some((pos, _)) => text.split_at(pos),
        None => (text, ""),
    };
    let multiplier = match unit {
        "" | "B" => 1,
        "K" => 1024,
        "M" => MIB,
        "G" => 1024 * MIB,
        other => bail!("unsupported size unit '{}' in '{}'", other, text),
    };
    if let Ok(whole) = number.parse::<u64>() {
        return whole
            .checked_mul(multiplier)
            .with_context(|| format!("size '{}' is too large", text));
    }
    let fractional: f64 = number
        .parse()
        .with_context(|| format!("invalid size '{}'", text))?;
    if fractional < 0.0 {
        bail!("size '{}' is negative", text);
    }
    Ok((fractional * multiplier as f64).ceil() as u64)
}

impl Structure {
    pub fn is_system_data(&self) -> bool {
        self.role.as_deref() == Some(ROLE_SYSTEM_DATA)
    }

    pub fn is_mbr(&self) -> bool {
        self.role.as_deref() == Some(ROLE_MBR) || self.kind == "mbr"
    }

    /// Bare structures are written as raw bytes and get no partition entry.
    pub fn is_partition(&self) -> bool {
        !self.is_mbr() && self.kind != "bare"
    }

    /// Partition type for the table of `schema`. Hybrid types are written
    /// as `<mbr>,<gpt>`.
    pub fn partition_type(&self, schema: Schema) -> &str {
        match (self.kind.split_once(','), schema) {
            (Some((mbr, _)), Schema::Mbr) => mbr,
            (Some((_, gpt)), Schema::Gpt) => gpt,
            (None, _) => &self.kind,
        }
    }

    pub fn label(&self) -> Option<&str> {
        self.filesystem_label.as_deref().or(self.name.as_deref())
    }
}

impl Volume {
    /// Lay out the structures. The system-data structure grows to
    /// `rootfs_size` when that is larger than declared.
    pub fn layout(&self, rootfs_size: u64) -> Result<Vec<Placement>> {
        let mut cursor = MIB;
        let mut placements = Vec::with_capacity(self.structure.len());
        for (index, structure) in self.structure.iter().enumerate() {
            let size = if structure.is_system_data() {
                structure.size.max(rootfs_size)
            } else {
                structure.size
            };
            let start = match (structure.offset, structure.is_mbr()) {
                (Some(offset), _) => offset,
                (None, true) => 0,
                (None, false) => cursor,
            };
            let placement = Placement { index, start, size };
            let end = placement.end()?;
            if !structure.is_mbr() {
                cursor = cursor.max(end);
            }
            placements.push(placement);
        }
        Ok(placements)
    }

    /// Bytes needed for the volume: end of the last structure plus room for
    /// the backup GPT.
    pub fn image_size(&self, rootfs_size: u64) -> Result<u64> {
        let mut end = MIB;
        for placement in self.layout(rootfs_size)? {
            end = end.max(placement.end()?);
        }
        end.checked_next_multiple_of(MIB)
            .and_then(|aligned| aligned.checked_add(MIB))
            .context("volume size overflows")
    }
}

impl Placement {
    pub fn end(&self) -> Result<u64> {
        self.start.checked_add(self.size).with_context(|| {
            format!(
                "structure #{} at offset {} with size {} overflows the volume",
                self.index, self.start, self.size
            )
        })
    }
}

pub fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}
