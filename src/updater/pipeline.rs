// src/updater/pipeline.rs

//! Per-image install pipeline
//!
//! One pipeline run materializes one image into the inactive slot: try the
//! delta path seeded by the live image, verify; on any miss, fetch the full
//! image into the same target and verify again. The delta attempt is
//! best-effort — an unopenable seed, a decode error, a transport error or a
//! digest mismatch all just demote the run to the full download. Only the
//! full path's failures are terminal.

use crate::error::{Error, Result};
use crate::fetch::{CancelToken, FetchRequest, Fetcher};
use crate::hash;
use crate::image::{FileSink, ImageKind, ImageReader, UpdateSink};
use crate::progress::{download_ratio, InstallStage, StageProgress};
use crate::vcdiff::StreamingDecoder;
use std::path::Path;
use tracing::{debug, info, warn};

/// Inputs for installing one image kind.
pub struct ImagePipeline<'a> {
    pub kind: ImageKind,
    /// Live image used as the delta dictionary. Never written.
    pub seed: &'a Path,
    /// Partition (or file) of the inactive slot receiving the new image.
    pub target: &'a Path,
    pub full_url: &'a str,
    pub delta_url: &'a str,
    /// Expected SHA-512 over the logical target image, lowercase hex.
    pub sha512: &'a str,
    pub download_stage: InstallStage,
    pub verify_stage: InstallStage,
    pub max_image_size: u64,
}

impl ImagePipeline<'_> {
    /// Run the pipeline to completion. `Ok` means the target partition now
    /// holds an image whose logical bytes hash to `sha512`.
    pub fn run(
        &self,
        fetcher: &dyn Fetcher,
        cancel: &CancelToken,
        progress: &StageProgress,
    ) -> Result<()> {
        progress.enter(self.download_stage);

        match self.try_delta(fetcher, cancel, progress) {
            Ok(()) => {
                progress.enter(self.verify_stage);
                match self.verify(cancel, progress) {
                    Ok(()) => return Ok(()),
                    Err(e) if e.is_canceled() => return Err(e),
                    Err(e) => warn!("Delta result failed verification: {e}"),
                }
            }
            Err(e) if e.is_canceled() => return Err(e),
            Err(e) => debug!("Delta update not usable: {e}"),
        }

        progress.enter(self.download_stage);
        self.download_full(fetcher, cancel, progress)?;

        progress.enter(self.verify_stage);
        self.verify(cancel, progress)
    }

    /// Fetch the delta and stream it through the decoder into the target.
    fn try_delta(
        &self,
        fetcher: &dyn Fetcher,
        cancel: &CancelToken,
        progress: &StageProgress,
    ) -> Result<()> {
        let seed = ImageReader::open(self.kind, self.seed)?;

        info!("Downloading delta update from {}", self.delta_url);

        let mut sink = self.open_target()?;
        let mut decoder =
            StreamingDecoder::new(seed.bytes()).with_max_target_size(self.max_image_size);

        fetcher.fetch(
            &FetchRequest::new(self.delta_url),
            cancel,
            &mut |chunk| {
                decoder
                    .decode_chunk(chunk, &mut sink)
                    .map_err(|e| Error::DeltaError(e.to_string()))
            },
            &mut |received, total| {
                if let Some(v) = download_ratio(received, total) {
                    progress.report(v);
                }
            },
        )?;

        let decoded = decoder
            .finish(&mut sink)
            .map_err(|e| Error::DeltaError(e.to_string()))?;

        debug!(
            "Delta produced {} bytes at {}",
            decoded,
            self.target.display()
        );
        Ok(())
    }

    /// Fetch the full image straight into the target.
    fn download_full(
        &self,
        fetcher: &dyn Fetcher,
        cancel: &CancelToken,
        progress: &StageProgress,
    ) -> Result<()> {
        info!("Downloading full image from {}", self.full_url);

        let mut sink = self.open_target()?;

        fetcher.fetch(
            &FetchRequest::new(self.full_url),
            cancel,
            &mut |chunk| {
                sink.append(chunk)
                    .map_err(|e| Error::IoError(format!("Failed to write image data: {e}")))
            },
            &mut |received, total| {
                if let Some(v) = download_ratio(received, total) {
                    progress.report(v);
                }
            },
        )?;

        debug!(
            "Wrote {} bytes to {}",
            sink.size(),
            self.target.display()
        );
        Ok(())
    }

    fn open_target(&self) -> Result<FileSink> {
        FileSink::open(self.target)
            .map_err(|e| Error::IoError(format!("Unable to open {}: {e}", self.target.display())))
    }

    /// Hash the target's logical byte range against the manifest digest.
    fn verify(&self, cancel: &CancelToken, progress: &StageProgress) -> Result<()> {
        let image = ImageReader::open(self.kind, self.target)?;
        hash::verify_digest(image.bytes(), self.sha512, cancel, |v| progress.report(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    /// Serves canned bodies by URL; unknown URLs fail like a dead server.
    struct ScriptedFetcher {
        routes: HashMap<String, Vec<u8>>,
    }

    impl Fetcher for ScriptedFetcher {
        fn fetch(
            &self,
            request: &FetchRequest<'_>,
            _cancel: &CancelToken,
            on_chunk: &mut dyn FnMut(&[u8]) -> Result<()>,
            on_progress: &mut dyn FnMut(u64, Option<u64>),
        ) -> Result<()> {
            let body = self.routes.get(request.url).ok_or_else(|| {
                Error::DownloadError(format!("HTTP 404 Not Found from {}", request.url))
            })?;

            for chunk in body.chunks(7) {
                on_chunk(chunk)?;
            }
            on_progress(body.len() as u64, Some(body.len() as u64));
            Ok(())
        }
    }

    /// Minimal squashfs image: valid superblock, content padded to 4 KiB.
    fn squashfs_image(fill: u8) -> Vec<u8> {
        let mut image = vec![fill; 4096];
        image[0..4].copy_from_slice(&0x73717368u32.to_le_bytes());
        image[4..40].fill(0);
        image[40..48].copy_from_slice(&4096u64.to_le_bytes());
        image
    }

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

    /// A valid single-window VCDIFF stream that ADDs `target` verbatim.
    fn add_only_patch(target: &[u8]) -> Vec<u8> {
        let mut inst = vec![1];
        inst.extend(varint(target.len() as u64));

        let mut body = varint(target.len() as u64);
        body.push(0);
        body.extend(varint(target.len() as u64));
        body.extend(varint(inst.len() as u64));
        body.extend(varint(0));
        body.extend(target);
        body.extend(&inst);

        let mut stream = vec![0xd6, 0xc3, 0xc4, 0x00, 0x00, 0x00];
        stream.extend(varint(body.len() as u64));
        stream.extend(body);
        stream
    }

    fn digest_of(data: &[u8]) -> String {
        hash::image_digest(data, &CancelToken::new(), |_| {}).unwrap()
    }

    fn progress_sink() -> StageProgress {
        StageProgress::new(|_| {})
    }

    #[test]
    fn unopenable_seed_falls_through_to_full_download() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("target.img");
        let image = squashfs_image(0xaa);

        let fetcher = ScriptedFetcher {
            routes: HashMap::from([("http://u/full.img".to_string(), image.clone())]),
        };

        let digest = digest_of(&image);
        let pipeline = ImagePipeline {
            kind: ImageKind::SquashFs,
            seed: Path::new("/nonexistent/seed"),
            target: &target,
            full_url: "http://u/full.img",
            delta_url: "http://u/delta.vcdiff",
            sha512: &digest,
            download_stage: InstallStage::BootDownload,
            verify_stage: InstallStage::BootVerify,
            max_image_size: 1 << 20,
        };

        pipeline
            .run(&fetcher, &CancelToken::new(), &progress_sink())
            .unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), image);
    }

    #[test]
    fn delta_reconstructs_target_with_full_url_unreachable() {
        let dir = tempdir().unwrap();
        let seed_path = dir.path().join("seed.img");
        let target = dir.path().join("target.img");

        let seed = squashfs_image(0x11);
        let new_image = squashfs_image(0x22);
        std::fs::write(&seed_path, &seed).unwrap();

        let fetcher = ScriptedFetcher {
            routes: HashMap::from([(
                "http://u/delta.vcdiff".to_string(),
                add_only_patch(&new_image),
            )]),
        };

        let digest = digest_of(&new_image);
        let pipeline = ImagePipeline {
            kind: ImageKind::SquashFs,
            seed: &seed_path,
            target: &target,
            full_url: "http://u/full.img",
            delta_url: "http://u/delta.vcdiff",
            sha512: &digest,
            download_stage: InstallStage::RootfsDownload,
            verify_stage: InstallStage::RootfsVerify,
            max_image_size: 1 << 20,
        };

        pipeline
            .run(&fetcher, &CancelToken::new(), &progress_sink())
            .unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), new_image);
    }

    #[test]
    fn full_digest_mismatch_is_terminal() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("target.img");
        let image = squashfs_image(0xaa);

        let fetcher = ScriptedFetcher {
            routes: HashMap::from([("http://u/full.img".to_string(), image)]),
        };

        let digest = "0".repeat(128);
        let pipeline = ImagePipeline {
            kind: ImageKind::SquashFs,
            seed: Path::new("/nonexistent/seed"),
            target: &target,
            full_url: "http://u/full.img",
            delta_url: "http://u/delta.vcdiff",
            sha512: &digest,
            download_stage: InstallStage::BootDownload,
            verify_stage: InstallStage::BootVerify,
            max_image_size: 1 << 20,
        };

        let err = pipeline
            .run(&fetcher, &CancelToken::new(), &progress_sink())
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn corrupt_delta_falls_through_to_full() {
        let dir = tempdir().unwrap();
        let seed_path = dir.path().join("seed.img");
        let target = dir.path().join("target.img");

        let seed = squashfs_image(0x11);
        let image = squashfs_image(0x22);
        std::fs::write(&seed_path, &seed).unwrap();

        let mut truncated = add_only_patch(&image);
        truncated.truncate(truncated.len() / 2);

        let fetcher = ScriptedFetcher {
            routes: HashMap::from([
                ("http://u/delta.vcdiff".to_string(), truncated),
                ("http://u/full.img".to_string(), image.clone()),
            ]),
        };

        let digest = digest_of(&image);
        let pipeline = ImagePipeline {
            kind: ImageKind::SquashFs,
            seed: &seed_path,
            target: &target,
            full_url: "http://u/full.img",
            delta_url: "http://u/delta.vcdiff",
            sha512: &digest,
            download_stage: InstallStage::BootDownload,
            verify_stage: InstallStage::BootVerify,
            max_image_size: 1 << 20,
        };

        pipeline
            .run(&fetcher, &CancelToken::new(), &progress_sink())
            .unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), image);
    }
}
