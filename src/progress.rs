// src/progress.rs

//! Install progress accounting
//!
//! An install is reported as a single float in `[0, 1]`, segmented into four
//! equal quarters: boot download, boot verification, rootfs download, rootfs
//! verification. Stage-local progress maps into the stage's quarter;
//! anything outside `[0, 1]` is discarded rather than clamped, since the
//! byte counters feeding this can jitter under redirects.

use std::cell::Cell;

/// The four progress quarters of an install, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStage {
    BootDownload,
    BootVerify,
    RootfsDownload,
    RootfsVerify,
}

impl InstallStage {
    /// Overall progress at which this stage begins.
    pub fn base(&self) -> f32 {
        match self {
            InstallStage::BootDownload => 0.0,
            InstallStage::BootVerify => 0.25,
            InstallStage::RootfsDownload => 0.5,
            InstallStage::RootfsVerify => 0.75,
        }
    }
}

/// Maps stage-local progress to overall progress and hands it to a callback.
///
/// Lives on the install worker; the callback typically pushes an event into
/// the channel consumed by the main context.
pub struct StageProgress {
    stage: Cell<InstallStage>,
    emit: Box<dyn Fn(f32) + Send>,
}

impl StageProgress {
    pub fn new(emit: impl Fn(f32) + Send + 'static) -> Self {
        Self {
            stage: Cell::new(InstallStage::BootDownload),
            emit: Box::new(emit),
        }
    }

    /// Move to a new stage. Later stages only; the mapping does not police
    /// ordering, the worker drives stages strictly forward.
    pub fn enter(&self, stage: InstallStage) {
        self.stage.set(stage);
    }

    pub fn stage(&self) -> InstallStage {
        self.stage.get()
    }

    /// Report stage-local progress `v ∈ [0, 1]`. Out-of-range values are
    /// dropped.
    pub fn report(&self, v: f32) {
        if !(0.0..=1.0).contains(&v) {
            return;
        }

        (self.emit)(self.stage.get().base() + v / 4.0);
    }
}

/// Stage-local ratio for a download, or `None` when the total is unknown
/// and progress cannot be normalized.
pub fn download_ratio(received: u64, total: Option<u64>) -> Option<f32> {
    match total {
        Some(total) if total > 0 => Some(received as f32 / total as f32),
        _ => None,
    }
}
