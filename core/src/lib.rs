// Torchlight Core — Torch Ownership Spine
//
// "Exactly one actor drives the flash at any moment."
//
// Everything here exists to enforce that hand-off between the UI context
// and the background service.

pub mod bridge;
pub mod hardware;
pub mod notify;
pub mod service;

pub use bridge::{BridgeState, TorchBridge, TorchError, UiDelegate};
pub use hardware::{CameraId, FlashUnit, HardwareError, TorchBackend};
pub use notify::{
    build_notification, NotificationAction, NotificationSink, TorchNotification,
    NOTIFICATION_CHANNEL_ID, NOTIFICATION_CHANNEL_NAME, NOTIFICATION_ID,
};
pub use service::{
    ServiceCommand, ServiceError, ServiceEvent, ServiceHandle, ServiceState, TorchService,
    TorchServiceConfig, DEFAULT_GRACE_DELAY_MS,
};
