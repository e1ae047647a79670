// Update manifest model
//
// The update server serves a signed JSON document per (model, channel).
// The two *_deltas fields are URL prefixes; the concrete delta URL
// depends on the version currently running on the device.

use serde::{Deserialize, Serialize};

/// Manifest document as served, before signature verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub build_id: String,
    pub rootfs: String,
    pub rootfs_sha512: String,
    pub bootimg: String,
    pub bootimg_sha512: String,
    pub rootfs_deltas: String,
    pub bootimg_deltas: String,
    pub signature: String,
}

/// A verified update candidate. `version == 0` means "no update pending";
/// a failed check resets the record to that state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AvailableUpdate {
    pub version: u64,
    pub rootfs_url: String,
    pub rootfs_sha512: String,
    pub bootimg_url: String,
    pub bootimg_sha512: String,
    pub rootfs_delta_url: String,
    pub bootimg_delta_url: String,
    pub signature_url: String,
}

impl AvailableUpdate {
    /// Build the candidate record from a verified manifest. The delta
    /// URLs are resolved against the version currently installed, since
    /// deltas are encoded per origin version.
    pub fn from_manifest(manifest: &Manifest, current_version: u64) -> Self {
        Self {
            version: manifest.build_id.trim().parse().unwrap_or(0),
            rootfs_url: manifest.rootfs.clone(),
            rootfs_sha512: manifest.rootfs_sha512.clone(),
            bootimg_url: manifest.bootimg.clone(),
            bootimg_sha512: manifest.bootimg_sha512.clone(),
            rootfs_delta_url: format!("{}{}.vcdiff", manifest.rootfs_deltas, current_version),
            bootimg_delta_url: format!("{}{}.vcdiff", manifest.bootimg_deltas, current_version),
            signature_url: manifest.signature.clone(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.version != 0
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
