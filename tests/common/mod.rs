// tests/common/mod.rs

//! Shared test doubles and image builders for the end-to-end tests.

use nepos_updater::fetch::{CancelToken, FetchRequest, Fetcher};
use nepos_updater::hash;
use nepos_updater::machine::{HardwareModel, Machine};
use nepos_updater::signature::SignatureVerifier;
use nepos_updater::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tempfile::TempDir;

// =============================================================================
// Scripted fetcher
// =============================================================================

/// One canned response. Routes are consumed front to back; the last one
/// keeps serving, so a URL can behave differently on its first hit.
#[derive(Clone)]
pub enum Route {
    Body(Vec<u8>),
    NotFound,
    Timeout,
    /// Block until the request's cancel token fires.
    StallUntilCanceled,
}

#[derive(Default)]
pub struct FakeFetcher {
    routes: Mutex<HashMap<String, VecDeque<Route>>>,
    hits: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, url: &str, route: Route) {
        self.routes
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(route);
    }

    pub fn hits(&self) -> Vec<String> {
        self.hits.lock().unwrap().clone()
    }
}

impl Fetcher for FakeFetcher {
    fn fetch(
        &self,
        request: &FetchRequest<'_>,
        cancel: &CancelToken,
        on_chunk: &mut dyn FnMut(&[u8]) -> Result<()>,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<()> {
        self.hits.lock().unwrap().push(request.url.to_string());

        if cancel.is_canceled() {
            return Err(Error::Canceled);
        }

        let route = {
            let mut routes = self.routes.lock().unwrap();
            let deque = routes.get_mut(request.url);
            match deque {
                Some(deque) if deque.len() > 1 => deque.pop_front().unwrap(),
                Some(deque) => deque
                    .front()
                    .cloned()
                    .unwrap_or(Route::NotFound),
                None => Route::NotFound,
            }
        };

        match route {
            Route::Body(body) => {
                let total = body.len() as u64;
                let mut sent = 0u64;
                for chunk in body.chunks(1024) {
                    if cancel.is_canceled() {
                        return Err(Error::Canceled);
                    }
                    on_chunk(chunk)?;
                    sent += chunk.len() as u64;
                    on_progress(sent, Some(total));
                }
                Ok(())
            }
            Route::NotFound => Err(Error::DownloadError(format!(
                "HTTP 404 Not Found from {}",
                request.url
            ))),
            Route::Timeout => Err(Error::Timeout(request.url.to_string())),
            Route::StallUntilCanceled => {
                let deadline = Instant::now() + Duration::from_secs(10);
                while Instant::now() < deadline {
                    if cancel.is_canceled() {
                        return Err(Error::Canceled);
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(Error::DownloadError(
                    "stalled request was never canceled".to_string(),
                ))
            }
        }
    }
}

// =============================================================================
// Mock machine
// =============================================================================

/// A machine whose slots are plain files in a scratch directory.
pub struct MockMachine {
    os_version: u64,
    _dir: TempDir,
    current_boot: PathBuf,
    current_rootfs: PathBuf,
    alt_boot: PathBuf,
    alt_rootfs: PathBuf,
    committed: AtomicBool,
}

impl MockMachine {
    pub fn new(os_version: u64, boot_seed: &[u8], rootfs_seed: &[u8]) -> Self {
        let dir = TempDir::new().unwrap();
        let current_boot = dir.path().join("boot_a");
        let current_rootfs = dir.path().join("rootfs_a");
        let alt_boot = dir.path().join("boot_b");
        let alt_rootfs = dir.path().join("rootfs_b");

        std::fs::write(&current_boot, boot_seed).unwrap();
        std::fs::write(&current_rootfs, rootfs_seed).unwrap();

        Self {
            os_version,
            _dir: dir,
            current_boot,
            current_rootfs,
            alt_boot,
            alt_rootfs,
            committed: AtomicBool::new(false),
        }
    }

    pub fn committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }
}

impl Machine for MockMachine {
    fn os_version(&self) -> u64 {
        self.os_version
    }

    fn model(&self) -> HardwareModel {
        HardwareModel::Nepos1
    }

    fn model_name(&self) -> &str {
        "nepos1"
    }

    fn device_revision(&self) -> &str {
        "2"
    }

    fn device_serial(&self) -> &str {
        "NEP-TEST-0001"
    }

    fn machine_id(&self) -> &str {
        "8f4f4f2e63cf4c91b7f0a7a1f1e6d2aa"
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
        self.committed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Stub signature verifier
// =============================================================================

pub struct StubVerifier {
    ok: bool,
}

impl StubVerifier {
    pub fn accepting() -> Self {
        Self { ok: true }
    }

    pub fn rejecting() -> Self {
        Self { ok: false }
    }
}

impl SignatureVerifier for StubVerifier {
    fn verify_detached(&self, _content: &Path, _signature: &Path) -> Result<()> {
        if self.ok {
            Ok(())
        } else {
            Err(Error::GpgVerificationFailed("stub rejected".to_string()))
        }
    }
}

// =============================================================================
// Synthetic images
// =============================================================================

/// A 4 KiB SquashFS image: valid superblock, `fill` everywhere else.
pub fn squashfs_image(fill: u8) -> Vec<u8> {
    let mut image = vec![fill; 4096];
    image[0..48].fill(0);
    image[0..4].copy_from_slice(&0x73717368u32.to_le_bytes());
    image[40..48].copy_from_slice(&4096u64.to_le_bytes());
    image
}

/// A 4 KiB Android boot image: 2048-byte pages, 1000-byte kernel, no
/// initrd/second/dtb, `fill` everywhere past the header.
pub fn bootimg_image(fill: u8) -> Vec<u8> {
    let mut image = vec![fill; 4096];
    image[0..44].fill(0);
    image[0..4].copy_from_slice(&0x52444e41u32.to_le_bytes());
    image[4..8].copy_from_slice(&0x2144494fu32.to_le_bytes());
    image[8..12].copy_from_slice(&1000u32.to_le_bytes());
    image[36..40].copy_from_slice(&2048u32.to_le_bytes());
    image
}

pub fn sha512_hex(data: &[u8]) -> String {
    hash::image_digest(data, &CancelToken::new(), |_| {}).unwrap()
}

// =============================================================================
// VCDIFF patch construction
// =============================================================================

fn varint(mut value: u64) -> Vec<u8> {
    let mut groups = vec![(value & 0x7f) as u8];
    value >>= 7;
    while value > 0 {
        groups.push((value & 0x7f) as u8);
        value >>= 7;
    }
    groups.reverse();
    let last = groups.len() - 1;
    for byte in &mut groups[..last] {
        *byte |= 0x80;
    }
    groups
}

fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65521;
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for chunk in data.chunks(5552) {
        for &byte in chunk {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}

/// Encode a valid single-window VCDIFF delta from `source` to `target`:
/// COPY the common prefix out of the dictionary, ADD the rest, and stamp
/// the window with its Adler-32 checksum.
pub fn encode_delta(source: &[u8], target: &[u8]) -> Vec<u8> {
    let mut prefix = source
        .iter()
        .zip(target)
        .take_while(|(a, b)| a == b)
        .count();
    if prefix < 4 {
        prefix = 0;
    }

    let mut inst = Vec::new();
    let mut addr = Vec::new();
    let mut data = Vec::new();

    if prefix > 0 {
        inst.push(19); // COPY, explicit size, mode SELF
        inst.extend(varint(prefix as u64));
        addr.extend(varint(0));
    }
    let rest = &target[prefix..];
    if !rest.is_empty() {
        inst.push(1); // ADD, explicit size
        inst.extend(varint(rest.len() as u64));
        data.extend_from_slice(rest);
    }

    let mut body = varint(target.len() as u64);
    body.push(0); // delta indicator
    body.extend(varint(data.len() as u64));
    body.extend(varint(inst.len() as u64));
    body.extend(varint(addr.len() as u64));
    body.extend(adler32(target).to_be_bytes());
    body.extend(&data);
    body.extend(&inst);
    body.extend(&addr);

    let mut stream = vec![0xd6, 0xc3, 0xc4, 0x00, 0x00];
    let win_indicator = if prefix > 0 { 0x01 | 0x04 } else { 0x04 };
    stream.push(win_indicator);
    if prefix > 0 {
        stream.extend(varint(source.len() as u64));
        stream.extend(varint(0));
    }
    stream.extend(varint(body.len() as u64));
    stream.extend(body);
    stream
}

/// Manifest JSON as the update server would publish it.
#[allow(clippy::too_many_arguments)]
pub fn manifest_json(
    build_id: u64,
    bootimg_url: &str,
    bootimg_sha512: &str,
    rootfs_url: &str,
    rootfs_sha512: &str,
    bootimg_deltas: &str,
    rootfs_deltas: &str,
    signature_url: &str,
) -> Vec<u8> {
    format!(
        r#"{{
            "build_id": "{build_id}",
            "rootfs": "{rootfs_url}",
            "rootfs_sha512": "{rootfs_sha512}",
            "bootimg": "{bootimg_url}",
            "bootimg_sha512": "{bootimg_sha512}",
            "rootfs_deltas": "{rootfs_deltas}",
            "bootimg_deltas": "{bootimg_deltas}",
            "signature": "{signature_url}"
        }}"#
    )
    .into_bytes()
}
