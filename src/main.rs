// src/main.rs
//! Nepos System Updater - CLI Entry Point

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use nepos_updater::fetch::{CancelToken, HttpFetcher};
use nepos_updater::machine::read_machine_id;
use nepos_updater::signature::{GpgProcessVerifier, KeyringVerifier, SignatureVerifier};
use nepos_updater::updater::DEFAULT_UPDATE_SERVER;
use nepos_updater::{
    hash, HardwareModel, ImageKind, ImageReader, StaticMachine, Updater, UpdaterConfig,
    UpdaterEvent,
};
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

// =============================================================================
// CLI Definitions
// =============================================================================

#[derive(Parser)]
#[command(name = "nepos-updater")]
#[command(author = "Nepos GmbH")]
#[command(version)]
#[command(about = "A/B system-image updater for Nepos appliances", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Device identity and slot layout, normally provided by the init scripts.
#[derive(Args)]
struct MachineArgs {
    /// Build id of the running OS
    #[arg(long)]
    os_version: u64,

    /// Hardware model (nepos1, dt410c-evalboard, unknown)
    #[arg(long, default_value = "nepos1")]
    model: HardwareModel,

    /// Model name reported to the update server
    #[arg(long, default_value = "nepos1")]
    model_name: String,

    /// Hardware revision reported to the update server
    #[arg(long, default_value = "")]
    device_revision: String,

    /// Serial number reported to the update server
    #[arg(long, default_value = "")]
    device_serial: String,

    /// Machine id (defaults to /etc/machine-id)
    #[arg(long)]
    machine_id: Option<String>,

    /// Block device of the live boot image
    #[arg(long)]
    current_boot: PathBuf,

    /// Block device of the live root filesystem
    #[arg(long)]
    current_rootfs: PathBuf,

    /// Boot partition of the inactive slot
    #[arg(long)]
    alt_boot: PathBuf,

    /// Rootfs partition of the inactive slot
    #[arg(long)]
    alt_rootfs: PathBuf,

    /// Shell command that flips the next-boot selector (e.g. fw_setenv)
    #[arg(long)]
    commit_command: Option<String>,
}

#[derive(Args)]
struct ServerArgs {
    /// Update server base URL
    #[arg(long, default_value = DEFAULT_UPDATE_SERVER)]
    server: String,

    /// Directory for the staged manifest and signature
    #[arg(long, default_value = "/tmp")]
    staging_dir: PathBuf,

    /// OpenPGP certificate to verify manifests against; uses the system
    /// gpg keyring when not given
    #[arg(long)]
    keyring: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether a newer build is published
    Check {
        /// Update channel
        #[arg(long, default_value = "stable")]
        channel: String,

        #[command(flatten)]
        machine: MachineArgs,

        #[command(flatten)]
        server: ServerArgs,
    },

    /// Check and, when a newer build exists, install it into the inactive
    /// slot
    Install {
        /// Update channel
        #[arg(long, default_value = "stable")]
        channel: String,

        #[command(flatten)]
        machine: MachineArgs,

        #[command(flatten)]
        server: ServerArgs,
    },

    /// Print framing information and the digest of an image
    ShowImage {
        /// Image kind (squashfs or android-boot)
        #[arg(long)]
        kind: String,

        /// Image file or block device
        path: PathBuf,
    },
}

// =============================================================================
// Main Entry Point
// =============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check {
            channel,
            machine,
            server,
        } => cmd_check(&channel, machine, server),

        Commands::Install {
            channel,
            machine,
            server,
        } => cmd_install(&channel, machine, server),

        Commands::ShowImage { kind, path } => cmd_show_image(&kind, &path),
    }
}

fn build_updater(
    machine: MachineArgs,
    server: ServerArgs,
) -> (Updater, Receiver<UpdaterEvent>) {
    let machine = Arc::new(StaticMachine {
        os_version: machine.os_version,
        model: machine.model,
        model_name: machine.model_name,
        device_revision: machine.device_revision,
        device_serial: machine.device_serial,
        machine_id: machine.machine_id.unwrap_or_else(read_machine_id),
        current_boot: machine.current_boot,
        current_rootfs: machine.current_rootfs,
        alt_boot: machine.alt_boot,
        alt_rootfs: machine.alt_rootfs,
        commit_command: machine.commit_command,
    });

    let verifier: Arc<dyn SignatureVerifier> = match server.keyring {
        Some(keyring) => Arc::new(KeyringVerifier::new(keyring)),
        None => Arc::new(GpgProcessVerifier::new()),
    };

    let config = UpdaterConfig {
        server_base: server.server,
        staging_dir: server.staging_dir,
        ..Default::default()
    };

    Updater::new(machine, Arc::new(HttpFetcher::new()), verifier, config)
}

fn cmd_check(channel: &str, machine: MachineArgs, server: ServerArgs) -> Result<()> {
    let (mut updater, events) = build_updater(machine, server);
    updater.check(channel);

    for event in events.iter() {
        match event {
            UpdaterEvent::UpdateAvailable(version) => {
                println!("Update available: build {version}");
                return Ok(());
            }
            UpdaterEvent::AlreadyUpToDate => {
                println!("Already up to date");
                return Ok(());
            }
            UpdaterEvent::CheckFailed(reason) => anyhow::bail!("Check failed: {reason}"),
            _ => {}
        }
    }

    anyhow::bail!("Updater stopped without a result")
}

fn cmd_install(channel: &str, machine: MachineArgs, server: ServerArgs) -> Result<()> {
    let (mut updater, events) = build_updater(machine, server);
    updater.check(channel);

    let mut bar: Option<ProgressBar> = None;

    for event in events.iter() {
        match event {
            UpdaterEvent::UpdateAvailable(version) => {
                println!("Installing build {version}");
                updater.install();
            }
            UpdaterEvent::AlreadyUpToDate => {
                println!("Already up to date");
                return Ok(());
            }
            UpdaterEvent::CheckFailed(reason) => anyhow::bail!("Check failed: {reason}"),
            UpdaterEvent::Progress(p) => {
                let bar = bar.get_or_insert_with(|| {
                    let bar = ProgressBar::new(100);
                    bar.set_style(ProgressStyle::default_bar());
                    bar
                });
                bar.set_position((p * 100.0) as u64);
            }
            UpdaterEvent::UpdateSucceeded => {
                if let Some(bar) = bar.take() {
                    bar.finish_and_clear();
                }
                println!("Update installed; reboot to activate the new slot");
                return Ok(());
            }
            UpdaterEvent::UpdateFailed => {
                if let Some(bar) = bar.take() {
                    bar.abandon();
                }
                anyhow::bail!("Update failed; the running slot is unchanged");
            }
        }
    }

    anyhow::bail!("Updater stopped without a result")
}

fn cmd_show_image(kind: &str, path: &std::path::Path) -> Result<()> {
    let kind = match kind {
        "squashfs" => ImageKind::SquashFs,
        "android-boot" => ImageKind::AndroidBoot,
        other => anyhow::bail!("Unknown image kind '{other}'"),
    };

    let image = ImageReader::open(kind, path)?;
    let digest = hash::image_digest(image.bytes(), &CancelToken::new(), |_| {})?;

    println!("path:         {}", path.display());
    println!("kind:         {kind}");
    println!("logical size: {} bytes", image.logical_size());
    println!("sha512:       {digest}");

    Ok(())
}
