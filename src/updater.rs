// Update controller
//
// Control-domain side of the updater: fetches and verifies the signed
// manifest on `check`, owns the resulting AvailableUpdate record, and on
// `install` hands it to an UpdateEngine worker task, forwarding the
// engine's outcome to the daemon. The A/B selector is flipped here, on
// the success path only.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::UpdaterConfig;
use crate::engine::{EngineEvent, UpdateEngine};
use crate::events::{EventSender, UpdaterEvent};
use crate::machine::Machine;
use crate::manifest::{AvailableUpdate, Manifest};
use crate::verify::{GpgVerifier, SignatureVerifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Undefined,
    DownloadingManifest,
    DownloadingSignature,
    VerifyingSignature,
    Idle,
    Installing,
}

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("update server returned status {0}")]
    Status(u16),
    #[error("unable to parse Json content from update server: {0}")]
    ManifestParse(String),
    #[error("unable to verify manifest signature")]
    SignatureInvalid,
    #[error("unable to persist manifest: {0}")]
    Scratch(std::io::Error),
}

impl From<reqwest::Error> for CheckError {
    fn from(e: reqwest::Error) -> Self {
        CheckError::Transport(e.to_string())
    }
}

pub struct Updater {
    machine: Arc<dyn Machine>,
    config: UpdaterConfig,
    verifier: Arc<dyn SignatureVerifier>,
    events: EventSender,
    // Shared with the install forwarder task, which moves Installing back
    // to Idle when the engine reports its outcome.
    state: Arc<Mutex<ControllerState>>,
    available_update: AvailableUpdate,
}

impl Updater {
    /// Controller with the production GPG verifier.
    pub fn new(machine: Arc<dyn Machine>, config: UpdaterConfig, events: EventSender) -> Self {
        let verifier = Arc::new(GpgVerifier::new(
            config.gpg_path.clone(),
            Duration::from_secs(config.signature_wait_secs),
        ));
        Self::with_verifier(machine, config, verifier, events)
    }

    /// Controller with an injected signature verifier, for tests that
    /// bring their own trust anchor.
    pub fn with_verifier(
        machine: Arc<dyn Machine>,
        config: UpdaterConfig,
        verifier: Arc<dyn SignatureVerifier>,
        events: EventSender,
    ) -> Self {
        Self {
            machine,
            config,
            verifier,
            events,
            state: Arc::new(Mutex::new(ControllerState::Undefined)),
            available_update: AvailableUpdate::default(),
        }
    }

    pub fn state(&self) -> ControllerState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: ControllerState) {
        *self.state.lock().unwrap() = next;
    }

    pub fn available_update(&self) -> &AvailableUpdate {
        &self.available_update
    }

    /// Query the update server for `channel` and verify what it returns.
    ///
    /// Emits `update_available`, `already_up_to_date` or `check_failed`.
    /// Dropping the returned future cancels the check and aborts the
    /// in-flight request.
    pub async fn check(&mut self, channel: &str) {
        self.available_update.clear();

        match self.run_check(channel).await {
            Ok(update) => {
                self.set_state(ControllerState::Idle);
                if update.version > self.machine.os_version() {
                    let version = update.version.to_string();
                    self.available_update = update;
                    self.emit(UpdaterEvent::UpdateAvailable(version));
                } else {
                    self.emit(UpdaterEvent::AlreadyUpToDate);
                }
            }
            Err(e) => {
                self.set_state(ControllerState::Idle);
                self.available_update.clear();
                warn!("update check failed: {}", e);
                self.emit(UpdaterEvent::CheckFailed(e.to_string()));
            }
        }
    }

    async fn run_check(&mut self, channel: &str) -> Result<AvailableUpdate, CheckError> {
        let model = self.machine.model().update_slug();
        let url = format!(
            "{}/updates/{}/{}.json",
            self.config.server_base, model, channel
        );
        info!("checking for updates on {}", url);

        self.set_state(ControllerState::DownloadingManifest);
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(1))
            .build()?;
        let response = client
            .get(&url)
            .header("X-nepos-current", self.machine.os_version().to_string())
            .header("X-nepos-machine-id", self.machine.machine_id())
            .header("X-nepos-device-model", self.machine.model_name())
            .header("X-nepos-device-revision", self.machine.device_revision())
            .header("X-nepos-device-serial", self.machine.device_serial())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CheckError::Status(response.status().as_u16()));
        }
        let manifest_bytes = response.bytes().await?;

        // Persisted before parsing, so a rejected manifest is still on
        // disk for inspection.
        tokio::fs::write(self.config.manifest_path(), &manifest_bytes)
            .await
            .map_err(CheckError::Scratch)?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| CheckError::ManifestParse(e.to_string()))?;

        self.set_state(ControllerState::DownloadingSignature);
        let signature_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let signature_response = signature_client.get(&manifest.signature).send().await?;
        if !signature_response.status().is_success() {
            return Err(CheckError::Status(signature_response.status().as_u16()));
        }
        let signature_bytes = signature_response.bytes().await?;
        tokio::fs::write(self.config.signature_path(), &signature_bytes)
            .await
            .map_err(CheckError::Scratch)?;

        self.set_state(ControllerState::VerifyingSignature);
        let verified = self
            .verifier
            .verify_detached(&self.config.manifest_path(), &self.config.signature_path())
            .await;
        if !verified {
            warn!("unable to verify manifest signature");
            return Err(CheckError::SignatureInvalid);
        }

        Ok(AvailableUpdate::from_manifest(
            &manifest,
            self.machine.os_version(),
        ))
    }

    /// Install the pending update in a worker task.
    ///
    /// Without a pending update, or while a previous install is still
    /// running, this is a no-op that emits `update_failed` synchronously.
    pub fn install(&mut self) {
        if self.state() == ControllerState::Installing {
            // A second engine would race the first over the same
            // inactive partitions.
            warn!("install requested while an install is already running");
            self.emit(UpdaterEvent::UpdateFailed);
            return;
        }
        if !self.available_update.is_pending() {
            self.emit(UpdaterEvent::UpdateFailed);
            return;
        }

        self.set_state(ControllerState::Installing);

        let (engine_tx, mut engine_rx) = mpsc::unbounded_channel();
        let engine = UpdateEngine::new(
            Arc::clone(&self.machine),
            self.config.clone(),
            Arc::new(self.available_update.clone()),
            engine_tx,
        );
        tokio::spawn(engine.run());

        let machine = Arc::clone(&self.machine);
        let events = self.events.clone();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(event) = engine_rx.recv().await {
                match event {
                    EngineEvent::Progress(v) => {
                        let _ = events.send(UpdaterEvent::UpdateProgress(v));
                    }
                    EngineEvent::Succeeded => {
                        machine.commit_inactive();
                        *state.lock().unwrap() = ControllerState::Idle;
                        let _ = events.send(UpdaterEvent::UpdateSucceeded);
                        break;
                    }
                    EngineEvent::Failed => {
                        *state.lock().unwrap() = ControllerState::Idle;
                        let _ = events.send(UpdaterEvent::UpdateFailed);
                        break;
                    }
                }
            }
        });
    }

    fn emit(&self, event: UpdaterEvent) {
        let _ = self.events.send(event);
    }
}
