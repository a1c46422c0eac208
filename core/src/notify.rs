//! Persistent notification for the background torch
//!
//! Building the notification is a pure function of the requested light state;
//! posting it goes through the `NotificationSink` platform seam. The stop
//! action is how the user turns the torch off without reopening the app, and
//! it feeds back into the bridge via `notification_stop_requested`.

use serde::{Deserialize, Serialize};

/// Platform channel the persistent notification is posted on.
pub const NOTIFICATION_CHANNEL_ID: &str = "torch_foreground_channel";
/// Human-readable channel name shown in system settings.
pub const NOTIFICATION_CHANNEL_NAME: &str = "Torch active";
/// Default id for the single ongoing notification.
pub const NOTIFICATION_ID: u32 = 1001;

/// Actions the platform wires to pending intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationAction {
    /// Tap body: return to the app UI.
    OpenApp,
    /// Stop button: route a stop command into the background service.
    StopTorch,
}

/// Content of the ongoing foreground-service notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorchNotification {
    pub channel_id: String,
    pub title: String,
    pub body: String,
    pub tap_action: NotificationAction,
    pub stop_action: NotificationAction,
    /// Ongoing notifications cannot be swiped away while the service runs.
    pub ongoing: bool,
}

/// Build the notification for the requested light state. Stateless; the
/// service re-posts it whenever the requested state changes.
pub fn build_notification(is_on: bool) -> TorchNotification {
    let (title, body) = if is_on {
        ("Torch on", "The torch stays active in the background.")
    } else {
        ("Torch standby", "The torch is off.")
    };
    TorchNotification {
        channel_id: NOTIFICATION_CHANNEL_ID.to_string(),
        title: title.to_string(),
        body: body.to_string(),
        tap_action: NotificationAction::OpenApp,
        stop_action: NotificationAction::StopTorch,
        ongoing: true,
    }
}

/// Platform seam over the notification renderer. Implementations must be
/// callable from the service task's thread.
#[cfg_attr(test, mockall::automock)]
pub trait NotificationSink: Send + Sync {
    /// Post or update the notification under the given id.
    fn post(&self, id: u32, notification: &TorchNotification);

    /// Remove the notification (service teardown).
    fn clear(&self, id: u32);
}
