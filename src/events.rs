// Updater event surface
//
// The six events the daemon and UI state store consume. They are the
// complete externally visible behavior of the update core; everything
// else stays internal.

use tokio::sync::mpsc;

/// Lifecycle events emitted by the updater.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdaterEvent {
    /// A newer OS version is available for installation.
    UpdateAvailable(String),
    /// The manifest matched or was older than the running version.
    AlreadyUpToDate,
    /// The check could not be completed; carries a reason string.
    CheckFailed(String),
    /// Install progress in `[0, 1]`, monotonically non-decreasing.
    UpdateProgress(f32),
    /// Both images were written and verified; the boot selector was flipped.
    UpdateSucceeded,
    /// The install failed; the boot selector was left untouched.
    UpdateFailed,
}

impl UpdaterEvent {
    pub fn name(&self) -> &'static str {
        match self {
            UpdaterEvent::UpdateAvailable(_) => "update_available",
            UpdaterEvent::AlreadyUpToDate => "already_up_to_date",
            UpdaterEvent::CheckFailed(_) => "check_failed",
            UpdaterEvent::UpdateProgress(_) => "update_progress",
            UpdaterEvent::UpdateSucceeded => "update_succeeded",
            UpdaterEvent::UpdateFailed => "update_failed",
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<UpdaterEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<UpdaterEvent>;

/// Create the event channel wiring the updater to the daemon.
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
