//! Resume metadata: which steps finished, plus the state later steps need.
//!
//! Stored as `<workdir>/build-state.json`. Every write goes to a temp file in
//! the same directory, is synced, and then renamed over the old file so a
//! crash leaves either the previous or the new record, never a torn one.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::machine::state::Auxiliary;

pub const METADATA_FILENAME: &str = "build-state.json";
pub const LOCK_FILENAME: &str = ".build.lock";
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeMetadata {
    pub schema: u32,
    pub flavor: String,
    pub completed_steps: Vec<String>,
    pub updated_at_utc: String,
    #[serde(default)]
    pub state: Auxiliary,
}

impl ResumeMetadata {
    pub fn new(flavor: &str) -> Self {
        Self {
            schema: SCHEMA_VERSION,
            flavor: flavor.to_string(),
            completed_steps: Vec::new(),
            updated_at_utc: String::new(),
            state: Auxiliary::default(),
        }
    }

    /// Check that this record can drive a machine of `flavor` running
    /// `steps`: same schema, same flavor, and the completed steps are a
    /// prefix of the step list.
    pub fn check_resumable(&self, flavor: &str, steps: &[&str]) -> Result<()> {
        if self.schema != SCHEMA_VERSION {
            return Err(Error::resume_mismatch(format!(
                "metadata schema {} is not supported (expected {})",
                self.schema, SCHEMA_VERSION
            )));
        }
        if self.flavor != flavor {
            return Err(Error::resume_mismatch(format!(
                "metadata was written by a '{}' build, this is a '{}' build",
                self.flavor, flavor
            )));
        }
        if self.completed_steps.len() > steps.len() {
            return Err(Error::resume_mismatch(format!(
                "metadata lists {} completed steps but this build has only {}",
                self.completed_steps.len(),
                steps.len()
            )));
        }
        for (index, (done, expected)) in self.completed_steps.iter().zip(steps).enumerate() {
            if done != expected {
                return Err(Error::resume_mismatch(format!(
                    "completed step #{} is '{}' but this build expects '{}'",
                    index, done, expected
                )));
            }
        }
        Ok(())
    }
}

pub fn metadata_path(workdir: &Path) -> PathBuf {
    workdir.join(METADATA_FILENAME)
}

/// Read the metadata from `workdir`. A missing or unparsable file is an
/// I/O error.
pub fn read(workdir: &Path) -> Result<ResumeMetadata> {
    let path = metadata_path(workdir);
    let bytes = fs::read(&path).map_err(|e| Error::io(&path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::io(&path, io::Error::from(e)))
}

/// Atomically replace the metadata in `workdir`.
pub fn write(workdir: &Path, metadata: &mut ResumeMetadata) -> Result<()> {
    metadata.updated_at_utc = now_utc_compact();

    fs::create_dir_all(workdir).map_err(|e| Error::io(workdir, e))?;
    let path = metadata_path(workdir);
    let tmp = workdir.join(format!(".{}.{}.tmp", METADATA_FILENAME, std::process::id()));

    let bytes = serde_json::to_vec_pretty(metadata).map_err(|e| Error::io(&tmp, e.into()))?;
    write_synced(&tmp, &bytes).map_err(|e| Error::io(&tmp, e))?;
    fs::rename(&tmp, &path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::io(&path, e)
    })?;
    sync_dir(workdir).map_err(|e| Error::io(workdir, e))?;

    log::debug!(
        "recorded {} completed steps in {}",
        metadata.completed_steps.len(),
        path.display()
    );
    Ok(())
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Held while a machine runs in a workdir; released on drop.
#[derive(Debug)]
pub struct WorkdirLock {
    file: File,
    path: PathBuf,
}

impl Drop for WorkdirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl WorkdirLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Take the exclusive lock on `workdir`, failing if another build holds it.
pub fn lock_workdir(workdir: &Path) -> Result<WorkdirLock> {
    fs::create_dir_all(workdir).map_err(|e| Error::io(workdir, e))?;
    let path = workdir.join(LOCK_FILENAME);

    // Never unlink the lock file: a second process could then lock a fresh
    // inode at the same path while the first still holds the old one.
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| Error::io(&path, e))?;

    if file.try_lock_exclusive().is_err() {
        return Err(Error::validation(format!(
            "workdir '{}' is in use by another build",
            workdir.display()
        )));
    }
    Ok(WorkdirLock { file, path })
}

fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

/// Field-by-field view of a metadata record, for diagnostics.
pub fn describe(metadata: &ResumeMetadata) -> BTreeMap<String, serde_json::Value> {
    let mut fields = metadata.state.to_map();
    fields.insert(
        "completed_steps".to_string(),
        serde_json::json!(metadata.completed_steps),
    );
    fields.insert("flavor".to_string(), serde_json::json!(metadata.flavor));
    fields
}
