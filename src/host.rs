//! Host tool lookup and invocation for build steps.
//!
//! Steps shell out to a handful of host tools (`snap`, `mkfs.*`, `mcopy`,
//! `sfdisk`). Missing tools are reported with the package that provides
//! them rather than as a bare spawn failure.

use anyhow::{bail, Context, Result};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Tool name and the package that ships it.
pub type HostTool = (&'static str, &'static str);

pub const SNAP: HostTool = ("snap", "snapd");
pub const SFDISK: HostTool = ("sfdisk", "fdisk");
pub const MKFS_EXT4: HostTool = ("mkfs.ext4", "e2fsprogs");
pub const MKFS_VFAT: HostTool = ("mkfs.vfat", "dosfstools");
pub const MCOPY: HostTool = ("mcopy", "mtools");

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Resolve a tool on PATH.
pub fn locate(tool: HostTool) -> Result<PathBuf> {
    let (cmd, package) = tool;
    which::which(cmd).with_context(|| format!("{} not found (install: {})", cmd, package))
}

/// Check that specific tools are available, listing every missing one.
pub fn check_required_tools(tools: &[HostTool]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, package)| format!("  {} (install: {})", tool, package))
        .collect();

    if !missing.is_empty() {
        bail!("Missing required host tools:\n{}", missing.join("\n"));
    }
    Ok(())
}

/// Run a prepared command, failing with its output when it exits non-zero.
pub fn run(cmd: &mut Command, what: &str) -> Result<()> {
    log::debug!("running {:?}", cmd);
    let output = cmd.output().with_context(|| format!("running {what}"))?;
    if output.status.success() {
        return Ok(());
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    bail!(
        "{} failed ({}): {}\n{}",
        what,
        output.status,
        stdout.trim(),
        stderr.trim()
    )
}

/// Run a command feeding `input` on stdin.
pub fn run_with_stdin(cmd: &mut Command, input: &str, what: &str) -> Result<()> {
    log::debug!("running {:?}", cmd);
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("running {what}"))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .with_context(|| format!("writing input to {what}"))?;
    }

    let output = child
        .wait_with_output()
        .with_context(|| format!("waiting for {what}"))?;
    if !output.status.success() {
        bail!(
            "{} failed ({}): {}",
            what,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
