//! Camera flash hardware handle
//!
//! Wraps the platform camera enumeration/torch API behind the `TorchBackend`
//! trait and resolves which physical device actually carries a flash unit.
//! Resolution is cheap and is redone in every execution context (UI bridge
//! and background service) — contexts cannot share an in-memory handle.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the camera/torch hardware layer.
///
/// Only the synchronous UI path reports these to a caller; best-effort paths
/// (pre-backgrounding release, delayed acquire, teardown) log and swallow them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HardwareError {
    #[error("no flash-capable camera device")]
    NoFlashUnit,
    #[error("camera device {0} is busy (held by another owner)")]
    Busy(CameraId),
    #[error("camera device {0} is disconnected")]
    Disconnected(CameraId),
    #[error("camera platform error: {0}")]
    Platform(String),
}

/// Opaque platform identifier for a camera device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CameraId(pub String);

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CameraId {
    fn from(id: &str) -> Self {
        CameraId(id.to_string())
    }
}

/// Platform seam over the camera service (camera2 on Android, AVFoundation
/// on iOS). Implementations must be callable from any thread.
#[cfg_attr(test, mockall::automock)]
pub trait TorchBackend: Send + Sync {
    /// All camera device ids known to the platform, in platform order.
    fn camera_ids(&self) -> Vec<CameraId>;

    /// Whether the device's characteristics declare a flash unit.
    fn has_flash_unit(&self, id: &CameraId) -> bool;

    /// Set torch mode on the given device.
    fn set_torch_mode(&self, id: &CameraId, on: bool) -> Result<(), HardwareError>;
}

/// A resolved handle to the first flash-capable camera device.
pub struct FlashUnit {
    backend: Arc<dyn TorchBackend>,
    id: CameraId,
}

impl FlashUnit {
    /// Scan the backend's devices and bind to the first one that declares a
    /// flash unit. Fails with [`HardwareError::NoFlashUnit`] when none does;
    /// that error is uniform across the UI and background paths.
    pub fn resolve(backend: Arc<dyn TorchBackend>) -> Result<Self, HardwareError> {
        let id = backend
            .camera_ids()
            .into_iter()
            .find(|id| backend.has_flash_unit(id))
            .ok_or(HardwareError::NoFlashUnit)?;
        tracing::debug!("resolved flash-capable camera {id}");
        Ok(FlashUnit { backend, id })
    }

    pub fn id(&self) -> &CameraId {
        &self.id
    }

    /// Drive the torch. Errors propagate to the caller; this is the only
    /// hardware path with someone waiting on the result.
    pub fn set(&self, on: bool) -> Result<(), HardwareError> {
        self.backend.set_torch_mode(&self.id, on)
    }

    /// Best-effort off. Returns `true` when the platform accepted the call,
    /// `false` when it failed (logged, never surfaced) — the hand-off
    /// handshake uses this to decide whether to signal a clean release.
    pub fn release(&self) -> bool {
        match self.backend.set_torch_mode(&self.id, false) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("best-effort torch release failed on {}: {e}", self.id);
                false
            }
        }
    }
}

impl fmt::Debug for FlashUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlashUnit").field("id", &self.id).finish()
    }
}
