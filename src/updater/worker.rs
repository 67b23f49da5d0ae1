// src/updater/worker.rs

//! Install worker
//!
//! One install runs to completion on its own thread: boot image first, then
//! rootfs, then the A/B commit. All blocking work — network, decoding, disk
//! writes, hashing — happens here; the owning context only ever sees events
//! coming out of the channel.

use crate::fetch::{CancelToken, Fetcher};
use crate::image::ImageKind;
use crate::machine::Machine;
use crate::manifest::AvailableUpdate;
use crate::progress::{InstallStage, StageProgress};
use crate::updater::pipeline::ImagePipeline;
use crate::updater::{InstallState, UpdaterEvent};
use crate::Result;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use tracing::{info, warn};

pub(super) struct InstallJob {
    pub machine: Arc<dyn Machine>,
    pub fetcher: Arc<dyn Fetcher>,
    pub update: AvailableUpdate,
    pub events: Sender<UpdaterEvent>,
    pub cancel: CancelToken,
    pub max_image_size: u64,
}

impl InstallJob {
    pub fn run(self) {
        let events = self.events.clone();
        let progress = StageProgress::new(move |p| {
            let _ = events.send(UpdaterEvent::Progress(p));
        });

        match self.install(&progress) {
            Ok(()) => {
                info!("Update to build {} installed", self.update.version);
                let _ = self.events.send(UpdaterEvent::UpdateSucceeded);
            }
            Err(e) => {
                warn!(
                    "Install failed in {:?}: {e}",
                    InstallState::from_stage(progress.stage())
                );
                let _ = self.events.send(UpdaterEvent::UpdateFailed);
            }
        }
    }

    fn install(&self, progress: &StageProgress) -> Result<()> {
        info!("Installing build {}", self.update.version);

        ImagePipeline {
            kind: ImageKind::AndroidBoot,
            seed: self.machine.current_boot_device(),
            target: self.machine.alt_boot_device(),
            full_url: &self.update.bootimg_url,
            delta_url: &self.update.bootimg_delta_url,
            sha512: &self.update.bootimg_sha512,
            download_stage: InstallStage::BootDownload,
            verify_stage: InstallStage::BootVerify,
            max_image_size: self.max_image_size,
        }
        .run(self.fetcher.as_ref(), &self.cancel, progress)?;

        ImagePipeline {
            kind: ImageKind::SquashFs,
            seed: self.machine.current_rootfs_device(),
            target: self.machine.alt_rootfs_device(),
            full_url: &self.update.rootfs_url,
            delta_url: &self.update.rootfs_delta_url,
            sha512: &self.update.rootfs_sha512,
            download_stage: InstallStage::RootfsDownload,
            verify_stage: InstallStage::RootfsVerify,
            max_image_size: self.max_image_size,
        }
        .run(self.fetcher.as_ref(), &self.cancel, progress)?;

        // Both alt partitions verified; flipping the selector is now safe.
        self.machine.commit_alt_boot()
    }
}
