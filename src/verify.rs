// Verification primitives
//
// Two concerns: detached GPG signatures over the update manifest, and
// SHA-512 over the header-derived byte range of a written image. The
// signature check shells out to the system gpg, whose keyring holds the
// deployment trust root; tests substitute their own verifier.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha512};
use tokio::process::Command;
use tracing::warn;

const HASH_CHUNK_SIZE: usize = 1024 * 1024;

/// Detached-signature verification capability.
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    /// True iff `signature` is a valid detached signature over `content`
    /// by a key in the configured trust root.
    async fn verify_detached(&self, content: &Path, signature: &Path) -> bool;
}

/// Signature verification through the system GPG binary.
pub struct GpgVerifier {
    binary: PathBuf,
    wait: Duration,
}

impl GpgVerifier {
    pub fn new(binary: PathBuf, wait: Duration) -> Self {
        Self { binary, wait }
    }
}

#[async_trait]
impl SignatureVerifier for GpgVerifier {
    async fn verify_detached(&self, content: &Path, signature: &Path) -> bool {
        let output = Command::new(&self.binary)
            .arg("--quiet")
            .arg("--verify")
            .arg(signature)
            .arg(content)
            .output();

        match tokio::time::timeout(self.wait, output).await {
            Ok(Ok(output)) => output.status.success(),
            Ok(Err(e)) => {
                warn!("unable to run {}: {}", self.binary.display(), e);
                false
            }
            Err(_) => {
                warn!("signature verification timed out");
                false
            }
        }
    }
}

/// Stream SHA-512 over `data` in 1 MiB chunks, reporting fractional
/// progress in `(0, 1]` after each chunk. Returns the lowercase hex digest.
pub fn sha512_hex<F: FnMut(f32)>(data: &[u8], mut progress: F) -> String {
    let mut hasher = Sha512::new();
    let mut pos = 0;

    while pos < data.len() {
        let len = HASH_CHUNK_SIZE.min(data.len() - pos);
        hasher.update(&data[pos..pos + len]);
        pos += len;
        progress(pos as f32 / data.len() as f32);
    }

    hex::encode(hasher.finalize())
}

/// Manifest digests have no guaranteed case; compare insensitively.
pub fn digest_matches(actual_hex: &str, expected_hex: &str) -> bool {
    actual_hex.eq_ignore_ascii_case(expected_hex.trim())
}
