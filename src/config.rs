// Updater configuration
//
// Defaults match the production deployment; tests point server_base at a
// local mock and scratch_dir at a tempdir.

use std::path::PathBuf;

use serde::Deserialize;

const DEFAULT_MAX_TARGET_SIZE: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Update server base URL, no trailing slash.
    pub server_base: String,
    /// Directory holding the manifest and signature scratch files.
    pub scratch_dir: PathBuf,
    /// GPG binary used for detached signature verification.
    pub gpg_path: PathBuf,
    /// Seconds a transfer may go without yielding a chunk before it is
    /// treated as failed.
    pub transfer_watchdog_secs: u64,
    /// Bounded wait for the signature verification subprocess.
    pub signature_wait_secs: u64,
    /// Upper bound on the decoded size of a delta target image.
    pub max_target_size: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            server_base: "https://os.nepos.io".to_string(),
            scratch_dir: PathBuf::from("/tmp"),
            gpg_path: PathBuf::from("/usr/bin/gpg"),
            transfer_watchdog_secs: 60,
            signature_wait_secs: 30,
            max_target_size: DEFAULT_MAX_TARGET_SIZE,
        }
    }
}

impl UpdaterConfig {
    /// Scratch path the manifest bytes are persisted to on every check.
    pub fn manifest_path(&self) -> PathBuf {
        self.scratch_dir.join("update.json")
    }

    /// Scratch path the detached signature is persisted to.
    pub fn signature_path(&self) -> PathBuf {
        self.scratch_dir.join("update.json.sig")
    }
}
