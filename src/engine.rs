// Update engine
//
// Worker side of an install: for each image kind, in fixed order, apply a
// VCDIFF delta against the active partition onto the inactive one, fall
// back to a full image download when the delta path fails, and verify the
// written image by streaming SHA-512 over its header-derived length. The
// boot selector is never touched here; the controller commits only after
// the engine reports success.
//
// The engine owns its HTTP client: it is created inside the worker task
// and every transfer callback runs there, so response buffers are never
// touched from another context.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::UpdaterConfig;
use crate::image::{ImageError, ImageKind, ImageReader};
use crate::machine::{slot_paths, Machine};
use crate::manifest::AvailableUpdate;
use crate::sink::{DecoderSink, PartitionSink, SinkError};
use crate::vcdiff::{VcdiffDecoder, VcdiffError};
use crate::verify::{digest_matches, sha512_hex};

/// Events the engine reports back to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Progress(f32),
    Succeeded,
    Failed,
}

pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

// Which quarter pair of the progress range we are in.
#[derive(Debug, Clone, Copy)]
enum Phase {
    DownloadingBoot,
    DownloadingRootfs,
}

#[derive(Debug, Error)]
enum TransferError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server returned status {0}")]
    Status(u16),
    #[error("transfer stalled")]
    WatchdogExpired,
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Decode(#[from] VcdiffError),
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        TransferError::Transport(e.to_string())
    }
}

pub struct UpdateEngine {
    machine: Arc<dyn Machine>,
    config: UpdaterConfig,
    update: Arc<AvailableUpdate>,
    events: EngineEventSender,
    phase: Phase,
    last_progress: f32,
}

impl UpdateEngine {
    pub fn new(
        machine: Arc<dyn Machine>,
        config: UpdaterConfig,
        update: Arc<AvailableUpdate>,
        events: EngineEventSender,
    ) -> Self {
        Self {
            machine,
            config,
            update,
            events,
            phase: Phase::DownloadingBoot,
            last_progress: 0.0,
        }
    }

    /// Install both images. Emits exactly one of `Succeeded` / `Failed`.
    pub async fn run(mut self) {
        let client = match reqwest::Client::builder().build() {
            Ok(client) => client,
            Err(e) => {
                warn!("unable to create HTTP client: {}", e);
                let _ = self.events.send(EngineEvent::Failed);
                return;
            }
        };

        for kind in [ImageKind::Boot, ImageKind::Rootfs] {
            self.phase = match kind {
                ImageKind::Boot => Phase::DownloadingBoot,
                ImageKind::Rootfs => Phase::DownloadingRootfs,
            };

            if !self.download_and_verify(&client, kind).await {
                let _ = self.events.send(EngineEvent::Failed);
                return;
            }
        }

        let _ = self.events.send(EngineEvent::Succeeded);
    }

    async fn download_and_verify(&mut self, client: &reqwest::Client, kind: ImageKind) -> bool {
        let (dictionary, output) = slot_paths(self.machine.as_ref(), kind);
        let update = Arc::clone(&self.update);
        let (full_url, delta_url, expected) = match kind {
            ImageKind::Boot => (
                &update.bootimg_url,
                &update.bootimg_delta_url,
                &update.bootimg_sha512,
            ),
            ImageKind::Rootfs => (
                &update.rootfs_url,
                &update.rootfs_delta_url,
                &update.rootfs_sha512,
            ),
        };

        // Delta attempt. An unreadable dictionary skips it entirely; any
        // decoder or transport failure falls through to the full image.
        let mut delta_written = false;
        match ImageReader::open(kind, &dictionary) {
            Ok(mut dict) => {
                match self
                    .download_delta_image(client, delta_url, &mut dict, &output)
                    .await
                {
                    Ok(()) => delta_written = true,
                    Err(e) => warn!("delta update for {} failed: {}", kind.name(), e),
                }
            }
            Err(e) => info!(
                "no usable {} dictionary on {}: {}",
                kind.name(),
                dictionary.display(),
                e
            ),
        }

        if delta_written && self.verify_image(kind, &output, expected) {
            return true;
        }

        if let Err(e) = self.download_full_image(client, full_url, &output).await {
            warn!("full {} image download failed: {}", kind.name(), e);
            return false;
        }

        if self.verify_image(kind, &output, expected) {
            return true;
        }

        // Nothing left to try; the inactive slot now holds an image that
        // will not boot.
        warn!("full {} image failed verification as well", kind.name());
        false
    }

    async fn download_delta_image(
        &mut self,
        client: &reqwest::Client,
        url: &str,
        dict: &mut ImageReader,
        output: &Path,
    ) -> Result<(), TransferError> {
        info!("downloading delta update from {}", url);

        let mut sink = PartitionSink::open(output)?;
        let dictionary = dict.map()?;
        let mut decoder = VcdiffDecoder::new(dictionary, self.config.max_target_size);
        let watchdog = Duration::from_secs(self.config.transfer_watchdog_secs);

        let response = client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(TransferError::Status(response.status().as_u16()));
        }
        let total = response.content_length().filter(|t| *t > 0);
        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;

        loop {
            let chunk = match tokio::time::timeout(watchdog, stream.next()).await {
                Err(_) => return Err(TransferError::WatchdogExpired),
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(TransferError::Transport(e.to_string())),
                Ok(Some(Ok(chunk))) => chunk,
            };

            decoder.decode_chunk(&chunk, &mut sink)?;
            received += chunk.len() as u64;
            if let Some(total) = total {
                self.emit_progress(true, received as f32 / total as f32);
            }
        }

        let decoded = decoder.decoded_size();
        decoder.finish()?;
        info!("delta reconstructed {} bytes to {}", decoded, output.display());
        Ok(())
    }

    async fn download_full_image(
        &mut self,
        client: &reqwest::Client,
        url: &str,
        output: &Path,
    ) -> Result<(), TransferError> {
        info!("downloading full image from {}", url);

        let mut sink = PartitionSink::open(output)?;
        let watchdog = Duration::from_secs(self.config.transfer_watchdog_secs);

        let response = client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(TransferError::Status(response.status().as_u16()));
        }
        let total = response.content_length().filter(|t| *t > 0);
        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;

        loop {
            let chunk = match tokio::time::timeout(watchdog, stream.next()).await {
                Err(_) => return Err(TransferError::WatchdogExpired),
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(TransferError::Transport(e.to_string())),
                Ok(Some(Ok(chunk))) => chunk,
            };

            sink.append(&chunk)?;
            received += chunk.len() as u64;
            if let Some(total) = total {
                self.emit_progress(true, received as f32 / total as f32);
            }
        }

        Ok(())
    }

    /// Re-open the written image, re-parse its header and stream SHA-512
    /// over the header-derived length.
    fn verify_image(&mut self, kind: ImageKind, path: &Path, expected: &str) -> bool {
        let mut image = match ImageReader::open(kind, path) {
            Ok(image) => image,
            Err(e) => {
                warn!("unable to re-read written {} image: {}", kind.name(), e);
                return false;
            }
        };
        let data = match image.map() {
            Ok(data) => data,
            Err(e) => {
                warn!("unable to map written {} image: {}", kind.name(), e);
                return false;
            }
        };

        let digest = sha512_hex(data, |v| self.emit_progress(false, v));
        digest_matches(&digest, expected)
    }

    // Progress is segmented into four equal quarters: boot download, boot
    // verification, rootfs download, rootfs verification. Values outside
    // [0, 1] are dropped, and the reported sequence never decreases even
    // when a failed delta restarts a download quarter.
    fn emit_progress(&mut self, is_download: bool, value: f32) {
        if !(0.0..=1.0).contains(&value) {
            return;
        }

        let mut base = match self.phase {
            Phase::DownloadingBoot => 0.0,
            Phase::DownloadingRootfs => 0.5,
        };
        if !is_download {
            base += 0.25;
        }

        let overall = base + value / 4.0;
        if overall < self.last_progress {
            return;
        }
        self.last_progress = overall;
        let _ = self.events.send(EngineEvent::Progress(overall));
    }
}
