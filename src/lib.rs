// src/lib.rs

//! Nepos system updater
//!
//! A/B system-image updater for Nepos appliances. A signed JSON manifest
//! describes the latest OS build; the updater materializes its boot and
//! rootfs images into the inactive partition set — preferring a VCDIFF
//! delta seeded by the live images, falling back to full downloads — and
//! flips the next-boot selector only after both images verify against
//! their SHA-512 digests.
//!
//! # Architecture
//!
//! - One event channel out: check and install report progress and terminal
//!   results as [`updater::UpdaterEvent`]s
//! - Delta-first: the live slot is the dictionary, so updates cost a
//!   fraction of a full image on the wire
//! - Nothing is ever written to the live partitions; a failed install
//!   leaves the running system untouched and uncommitted

mod error;
pub mod fetch;
pub mod hash;
pub mod image;
pub mod machine;
pub mod manifest;
pub mod progress;
pub mod signature;
pub mod updater;
pub mod vcdiff;

pub use error::{Error, Result};
pub use image::{ImageKind, ImageReader};
pub use machine::{HardwareModel, Machine, StaticMachine};
pub use manifest::{AvailableUpdate, UpdateManifest};
pub use updater::{Updater, UpdaterConfig, UpdaterEvent};
