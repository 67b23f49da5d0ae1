// src/machine.rs

//! Device identity and A/B slot access
//!
//! The updater never talks to hardware directly; everything it needs to know
//! about the appliance comes through the [`Machine`] trait: identification
//! strings for the update server, the block devices of the live and inactive
//! slots, and the commit operation that flips the next-boot selector.

use crate::error::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use tracing::info;

/// Known appliance hardware models
///
/// Closed set: anything the updater does not recognize is `Unknown`, which
/// still maps to a manifest model and performs the fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareModel {
    Nepos1,
    Dt410cEvalboard,
    Unknown,
}

impl HardwareModel {
    /// The model component of the manifest URL.
    ///
    /// The eval board runs the same OS build as the production hardware, so
    /// both resolve to the `nepos1` update line.
    pub fn manifest_model(&self) -> &'static str {
        match self {
            HardwareModel::Nepos1 | HardwareModel::Dt410cEvalboard => "nepos1",
            HardwareModel::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HardwareModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HardwareModel::Nepos1 => "nepos1",
            HardwareModel::Dt410cEvalboard => "dt410c-evalboard",
            HardwareModel::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for HardwareModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "nepos1" => Ok(HardwareModel::Nepos1),
            "dt410c-evalboard" => Ok(HardwareModel::Dt410cEvalboard),
            "unknown" => Ok(HardwareModel::Unknown),
            other => Err(Error::ParseError(format!(
                "unknown hardware model '{other}'"
            ))),
        }
    }
}

/// Everything the updater reads from (and the one thing it writes to) the
/// appliance.
///
/// Implementations must be callable from the install worker thread.
pub trait Machine: Send + Sync {
    /// Build id of the currently running OS.
    fn os_version(&self) -> u64;

    fn model(&self) -> HardwareModel;
    fn model_name(&self) -> &str;
    fn device_revision(&self) -> &str;
    fn device_serial(&self) -> &str;
    fn machine_id(&self) -> &str;

    /// Block device holding the live boot image. Never written.
    fn current_boot_device(&self) -> &Path;
    /// Block device holding the live root filesystem. Never written.
    fn current_rootfs_device(&self) -> &Path;
    /// Boot partition of the inactive slot, the install target.
    fn alt_boot_device(&self) -> &Path;
    /// Rootfs partition of the inactive slot, the install target.
    fn alt_rootfs_device(&self) -> &Path;

    /// Persist the decision to boot the inactive slot next.
    ///
    /// Only called after both alt partitions verified.
    fn commit_alt_boot(&self) -> Result<()>;
}

/// A `Machine` assembled from static values, used by the CLI.
///
/// The commit step runs an operator-supplied shell command (typically a
/// `fw_setenv` invocation); with no command configured, commit fails rather
/// than silently succeeding.
pub struct StaticMachine {
    pub os_version: u64,
    pub model: HardwareModel,
    pub model_name: String,
    pub device_revision: String,
    pub device_serial: String,
    pub machine_id: String,
    pub current_boot: PathBuf,
    pub current_rootfs: PathBuf,
    pub alt_boot: PathBuf,
    pub alt_rootfs: PathBuf,
    pub commit_command: Option<String>,
}

impl Machine for StaticMachine {
    fn os_version(&self) -> u64 {
        self.os_version
    }

    fn model(&self) -> HardwareModel {
        self.model
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn device_revision(&self) -> &str {
        &self.device_revision
    }

    fn device_serial(&self) -> &str {
        &self.device_serial
    }

    fn machine_id(&self) -> &str {
        &self.machine_id
    }

    fn current_boot_device(&self) -> &Path {
        &self.current_boot
    }

    fn current_rootfs_device(&self) -> &Path {
        &self.current_rootfs
    }

    fn alt_boot_device(&self) -> &Path {
        &self.alt_boot
    }

    fn alt_rootfs_device(&self) -> &Path {
        &self.alt_rootfs
    }

    fn commit_alt_boot(&self) -> Result<()> {
        let cmd = self.commit_command.as_deref().ok_or_else(|| {
            Error::IoError("no commit command configured, refusing to flip boot slot".to_string())
        })?;

        info!("Committing alt slot: {}", cmd);

        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg(cmd)
            .status()
            .map_err(|e| Error::IoError(format!("Failed to run commit command: {e}")))?;

        if !status.success() {
            return Err(Error::IoError(format!(
                "Commit command exited with {status}"
            )));
        }

        Ok(())
    }
}

/// Read the systemd machine id, if present. Used as the default for the
/// `X-nepos-machine-id` header.
pub fn read_machine_id() -> String {
    std::fs::read_to_string("/etc/machine-id")
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}
