// torchlight-mobile — Native packaging crate for iOS and Android
// Re-exports the torchlight core API for platform shells to link against.

pub use torchlight_core::*;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct SmokeTorch;

    impl TorchBackend for SmokeTorch {
        fn camera_ids(&self) -> Vec<CameraId> {
            vec![CameraId::from("0")]
        }

        fn has_flash_unit(&self, _id: &CameraId) -> bool {
            true
        }

        fn set_torch_mode(&self, _id: &CameraId, _on: bool) -> Result<(), HardwareError> {
            Ok(())
        }
    }

    struct SmokeSink;

    impl NotificationSink for SmokeSink {
        fn post(&self, _id: u32, _notification: &TorchNotification) {}
        fn clear(&self, _id: u32) {}
    }

    // Constructed outside any tokio context, the way a platform shell does
    // it: the bridge must fall back to its own global runtime.
    #[test]
    fn test_mobile_bridge_foreground_lifecycle() {
        let bridge = TorchBridge::new(
            TorchServiceConfig::default(),
            Arc::new(SmokeTorch),
            Arc::new(SmokeSink),
        )
        .expect("bridge must construct on a plain platform thread");

        assert_eq!(bridge.state(), BridgeState::Idle);

        bridge.set_torch(true).expect("torch on must succeed");
        assert_eq!(bridge.state(), BridgeState::ForegroundLit);

        bridge.set_torch(false).expect("torch off must succeed");
        assert_eq!(bridge.state(), BridgeState::Idle);
    }

    #[test]
    fn test_mobile_notification_content() {
        let lit = build_notification(true);
        assert_eq!(lit.channel_id, NOTIFICATION_CHANNEL_ID);
        assert_eq!(lit.stop_action, NotificationAction::StopTorch);

        let standby = build_notification(false);
        assert_ne!(lit.title, standby.title);
    }
}
