// src/updater/mod.rs

//! Update orchestration
//!
//! The [`Updater`] owns the two cycles of the update lifecycle:
//!
//! - **check** — fetch the signed manifest for this device's model and
//!   channel, verify the detached signature, compare versions, and publish
//!   an [`AvailableUpdate`];
//! - **install** — run the per-image pipelines against the inactive slot
//!   and commit the A/B selector once both images verify.
//!
//! Both cycles run on their own threads and report through a single event
//! channel handed out at construction. The caller's context never blocks:
//! a superseded check is canceled (it emits its own terminal event), and a
//! superseded installer is canceled and collected before the new one
//! starts, keeping exactly one writer on the target partitions.

mod pipeline;
mod worker;

pub use pipeline::ImagePipeline;

use crate::error::{Error, Result};
use crate::fetch::{fetch_to_vec, CancelToken, FetchRequest, Fetcher, Redirects};
use crate::machine::Machine;
use crate::manifest::{AvailableUpdate, UpdateManifest};
use crate::progress::InstallStage;
use crate::signature::SignatureVerifier;
use crate::vcdiff::MAX_TARGET_SIZE;
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Base URL the manifest location is built from:
/// `{server}/{model}/{channel}.json`.
pub const DEFAULT_UPDATE_SERVER: &str = "https://os.nepos.io/updates";

/// Staged manifest filename inside the staging directory.
const MANIFEST_FILE: &str = "update.json";
/// Staged detached-signature filename.
const SIGNATURE_FILE: &str = "update.json.sig";

/// Everything the updater tells the outside world.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdaterEvent {
    /// A newer build is published; carries its version string.
    UpdateAvailable(String),
    AlreadyUpToDate,
    CheckFailed(String),
    /// Overall install progress in `[0, 1]`.
    Progress(f32),
    UpdateSucceeded,
    UpdateFailed,
}

impl UpdaterEvent {
    /// Whether this event ends a check or install cycle.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UpdaterEvent::Progress(_))
    }
}

/// States of the check cycle, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Undefined,
    DownloadJson,
    DownloadSignature,
    VerifySignature,
    UpdateAvailable,
    AlreadyUpToDate,
    Failed,
}

/// States of the install cycle, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    Idle,
    DownloadBoot,
    VerifyBoot,
    DownloadRootfs,
    VerifyRootfs,
    Done,
    Failed,
}

impl InstallState {
    pub(crate) fn from_stage(stage: InstallStage) -> Self {
        match stage {
            InstallStage::BootDownload => InstallState::DownloadBoot,
            InstallStage::BootVerify => InstallState::VerifyBoot,
            InstallStage::RootfsDownload => InstallState::DownloadRootfs,
            InstallStage::RootfsVerify => InstallState::VerifyRootfs,
        }
    }
}

/// Tunables of the updater. The defaults are what production devices run
/// with; tests point the staging directory and server elsewhere.
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    pub server_base: String,
    pub staging_dir: PathBuf,
    pub max_image_size: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            server_base: DEFAULT_UPDATE_SERVER.to_string(),
            staging_dir: PathBuf::from("/tmp"),
            max_image_size: MAX_TARGET_SIZE,
        }
    }
}

struct Task {
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

/// The update orchestrator.
///
/// Owns the event channel's sending side and at most one check and one
/// install task. Dropping it cancels and collects whatever is in flight.
pub struct Updater {
    machine: Arc<dyn Machine>,
    fetcher: Arc<dyn Fetcher>,
    verifier: Arc<dyn SignatureVerifier>,
    config: UpdaterConfig,
    events: Sender<UpdaterEvent>,
    available: Arc<Mutex<AvailableUpdate>>,
    check_task: Option<Task>,
    install_task: Option<Task>,
}

impl Updater {
    /// Create an updater and the receiving end of its event stream.
    pub fn new(
        machine: Arc<dyn Machine>,
        fetcher: Arc<dyn Fetcher>,
        verifier: Arc<dyn SignatureVerifier>,
        config: UpdaterConfig,
    ) -> (Self, Receiver<UpdaterEvent>) {
        let (events, receiver) = channel();

        let updater = Self {
            machine,
            fetcher,
            verifier,
            config,
            events,
            available: Arc::new(Mutex::new(AvailableUpdate::none())),
            check_task: None,
            install_task: None,
        };

        (updater, receiver)
    }

    /// The update published by the last successful check, or the zeroed
    /// record.
    pub fn available_update(&self) -> AvailableUpdate {
        self.available.lock().unwrap().clone()
    }

    /// Start a check cycle for `channel`.
    ///
    /// A check already in flight is canceled; it delivers its own terminal
    /// `CheckFailed` event. This call does not block.
    pub fn check(&mut self, channel: &str) {
        if let Some(task) = self.check_task.take() {
            // Detach rather than join: the old thread may sit in a network
            // wait and will exit at its next cancellation point.
            task.cancel.cancel();
        }

        let cancel = CancelToken::new();
        let context = CheckContext {
            machine: self.machine.clone(),
            fetcher: self.fetcher.clone(),
            verifier: self.verifier.clone(),
            server_base: self.config.server_base.clone(),
            staging_dir: self.config.staging_dir.clone(),
            channel: channel.to_string(),
            events: self.events.clone(),
            available: self.available.clone(),
            cancel: cancel.clone(),
        };

        let handle = thread::spawn(move || context.run());
        self.check_task = Some(Task { cancel, handle });
    }

    /// Start an install of the currently available update.
    ///
    /// Emits `UpdateFailed` immediately when no installable update is
    /// known. An installer already in flight is canceled and collected
    /// first, so at most one worker writes to the alt partitions.
    pub fn install(&mut self) {
        let update = self.available_update();
        if !update.is_installable() {
            warn!("Install requested without an available update");
            let _ = self.events.send(UpdaterEvent::UpdateFailed);
            return;
        }

        if let Some(task) = self.install_task.take() {
            task.cancel.cancel();
            let _ = task.handle.join();
        }

        let cancel = CancelToken::new();
        let job = worker::InstallJob {
            machine: self.machine.clone(),
            fetcher: self.fetcher.clone(),
            update,
            events: self.events.clone(),
            cancel: cancel.clone(),
            max_image_size: self.config.max_image_size,
        };

        let handle = thread::spawn(move || job.run());
        self.install_task = Some(Task { cancel, handle });
    }
}

impl Drop for Updater {
    fn drop(&mut self) {
        for task in [self.check_task.take(), self.install_task.take()]
            .into_iter()
            .flatten()
        {
            task.cancel.cancel();
            let _ = task.handle.join();
        }
    }
}

enum CheckOutcome {
    UpdateAvailable(u64),
    AlreadyUpToDate,
}

/// One check cycle, run on its own thread.
struct CheckContext {
    machine: Arc<dyn Machine>,
    fetcher: Arc<dyn Fetcher>,
    verifier: Arc<dyn SignatureVerifier>,
    server_base: String,
    staging_dir: PathBuf,
    channel: String,
    events: Sender<UpdaterEvent>,
    available: Arc<Mutex<AvailableUpdate>>,
    cancel: CancelToken,
}

impl CheckContext {
    fn run(self) {
        match self.execute() {
            Ok(CheckOutcome::UpdateAvailable(version)) => {
                info!("Update to build {version} available");
                let _ = self
                    .events
                    .send(UpdaterEvent::UpdateAvailable(version.to_string()));
            }
            Ok(CheckOutcome::AlreadyUpToDate) => {
                info!("System is up to date");
                let _ = self.events.send(UpdaterEvent::AlreadyUpToDate);
            }
            Err(e) => {
                warn!("Update check failed: {e}");
                let _ = self.events.send(UpdaterEvent::CheckFailed(e.to_string()));
            }
        }
    }

    fn execute(&self) -> Result<CheckOutcome> {
        let current_version = self.machine.os_version();
        let model = self.machine.model().manifest_model();
        let manifest_url = format!("{}/{}/{}.json", self.server_base, model, self.channel);

        info!("Checking for updates on {manifest_url}");
        debug!("Check state: {:?}", CheckState::DownloadJson);

        let headers = [
            ("X-nepos-current", current_version.to_string()),
            ("X-nepos-machine-id", self.machine.machine_id().to_string()),
            ("X-nepos-device-model", self.machine.model_name().to_string()),
            (
                "X-nepos-device-revision",
                self.machine.device_revision().to_string(),
            ),
            (
                "X-nepos-device-serial",
                self.machine.device_serial().to_string(),
            ),
        ];

        let manifest_bytes = fetch_to_vec(
            self.fetcher.as_ref(),
            &FetchRequest {
                url: &manifest_url,
                headers: &headers,
                redirects: Redirects::Limited(1),
            },
            &self.cancel,
        )?;

        // Persist before parsing: the staged copy is what the signature
        // check runs against, and it is worth keeping even when parsing
        // fails.
        let manifest_path = self.staging_dir.join(MANIFEST_FILE);
        fs::write(&manifest_path, &manifest_bytes).map_err(|e| {
            Error::IoError(format!("Unable to write {}: {e}", manifest_path.display()))
        })?;

        let manifest = UpdateManifest::parse(&manifest_bytes)?;

        debug!("Check state: {:?}", CheckState::DownloadSignature);
        let signature_bytes = fetch_to_vec(
            self.fetcher.as_ref(),
            &FetchRequest {
                url: &manifest.signature,
                headers: &[],
                redirects: Redirects::None,
            },
            &self.cancel,
        )?;

        let signature_path = self.staging_dir.join(SIGNATURE_FILE);
        fs::write(&signature_path, &signature_bytes).map_err(|e| {
            Error::IoError(format!("Unable to write {}: {e}", signature_path.display()))
        })?;

        debug!("Check state: {:?}", CheckState::VerifySignature);
        if self.cancel.is_canceled() {
            return Err(Error::Canceled);
        }

        if let Err(e) = self
            .verifier
            .verify_detached(&manifest_path, &signature_path)
        {
            *self.available.lock().unwrap() = AvailableUpdate::none();
            return Err(e);
        }

        let build_id = manifest.build_id()?;
        if build_id > current_version {
            let update = AvailableUpdate::from_manifest(&manifest, current_version)?;
            *self.available.lock().unwrap() = update;
            Ok(CheckOutcome::UpdateAvailable(build_id))
        } else {
            Ok(CheckOutcome::AlreadyUpToDate)
        }
    }
}
