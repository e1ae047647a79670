// Machine collaborator interface
//
// The surrounding daemon owns the concrete machine model (device tree
// probing, boot selector storage). The update core only needs identity
// strings, the partition map and the commit capability, so those are
// expressed as a trait the daemon implements and tests can fake.

use std::path::PathBuf;

use crate::image::ImageKind;

/// Hardware models known to the update server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Model {
    Nepos1,
    Dt410cEvalboard,
    Unknown,
}

impl Model {
    /// Path segment used when building manifest URLs.
    pub fn update_slug(&self) -> &'static str {
        match self {
            Model::Nepos1 | Model::Dt410cEvalboard => "nepos1",
            Model::Unknown => "unknown",
        }
    }
}

/// Device identity and A/B partition map, provided by the daemon.
///
/// `commit_inactive` flips the boot selector so the next boot uses the
/// alternate slot. It must be atomic; the engine calls it exactly once,
/// and only after both images have been written and verified.
pub trait Machine: Send + Sync {
    fn os_version(&self) -> u64;
    fn machine_id(&self) -> String;
    fn model_name(&self) -> String;
    fn device_revision(&self) -> String;
    fn device_serial(&self) -> String;
    fn model(&self) -> Model;

    fn current_boot_device(&self) -> PathBuf;
    fn alt_boot_device(&self) -> PathBuf;
    fn current_rootfs_device(&self) -> PathBuf;
    fn alt_rootfs_device(&self) -> PathBuf;

    fn commit_inactive(&self);
}

/// Resolve (dictionary, output) device paths for one image kind.
///
/// The active slot seeds the delta reconstruction, the inactive slot
/// receives the new image.
pub fn slot_paths(machine: &dyn Machine, kind: ImageKind) -> (PathBuf, PathBuf) {
    match kind {
        ImageKind::Boot => (machine.current_boot_device(), machine.alt_boot_device()),
        ImageKind::Rootfs => (machine.current_rootfs_device(), machine.alt_rootfs_device()),
    }
}
