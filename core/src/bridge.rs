//! UI-facing control bridge
//!
//! The message-passing boundary the UI layer talks to: `set_torch` for direct
//! foreground toggling, `start_background`/`stop_background` for handing the
//! hardware to the background service, and the `UiDelegate` reverse channel
//! for the notification-initiated stop. The bridge replaces the usual global
//! mutable service-to-UI reference with an explicit event channel owned here,
//! and the delegate has a documented lifecycle: `attach` when the UI comes up,
//! `detach` when it goes away.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::hardware::{FlashUnit, HardwareError, TorchBackend};
use crate::notify::NotificationSink;
use crate::service::{ServiceEvent, ServiceHandle, TorchService, TorchServiceConfig};

// ============================================================================
// ERRORS & STATE
// ============================================================================

/// Errors surfaced to the UI layer. Maps onto the platform channel's
/// `TORCH_ERROR` code plus message.
#[derive(Debug, Error, Clone)]
pub enum TorchError {
    #[error("torch hardware error: {0}")]
    Hardware(#[from] HardwareError),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("background service unavailable")]
    ServiceUnavailable,
}

/// Where the hardware ownership currently sits, as seen from the UI side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeState {
    /// Nobody holds the light; it is off.
    Idle,
    /// The UI context holds the light and it is on.
    ForegroundLit,
    /// A start command was sent; the service has not confirmed the acquire.
    BackgroundRequested,
    /// The service confirmed it owns the hardware.
    BackgroundActive,
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeState::Idle => write!(f, "Idle"),
            BridgeState::ForegroundLit => write!(f, "ForegroundLit"),
            BridgeState::BackgroundRequested => write!(f, "BackgroundRequested"),
            BridgeState::BackgroundActive => write!(f, "BackgroundActive"),
        }
    }
}

/// Callback interface the UI layer registers to hear about service-initiated
/// changes. Called from the bridge's event-pump task, never from the thread
/// that triggered the event; implementations marshal onto their own UI queue.
pub trait UiDelegate: Send + Sync {
    /// The light was turned off via the notification's stop action.
    fn on_torch_stopped(&self);
}

// ============================================================================
// GLOBAL RUNTIME
// ============================================================================

// Process-wide runtime for the service and event-pump tasks. Mobile callback
// threads are not in a tokio context, so the bridge lazily owns one; an
// ambient runtime (tests, desktop hosts) is preferred when present.
static GLOBAL_RT: RwLock<Option<tokio::runtime::Runtime>> = RwLock::new(None);

fn global_runtime() -> tokio::runtime::Handle {
    let rt_read = GLOBAL_RT.read();
    if let Some(rt) = &*rt_read {
        return rt.handle().clone();
    }
    drop(rt_read);

    let mut rt_write = GLOBAL_RT.write();
    if let Some(rt) = &*rt_write {
        return rt.handle().clone();
    }

    tracing::info!("initializing global tokio runtime for torch tasks");
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_time()
        .thread_name("torch-worker")
        .build()
        .expect("failed to create global tokio runtime");
    let handle = rt.handle().clone();
    *rt_write = Some(rt);
    handle
}

fn runtime_handle() -> tokio::runtime::Handle {
    tokio::runtime::Handle::try_current().unwrap_or_else(|_| global_runtime())
}

// ============================================================================
// TORCH BRIDGE
// ============================================================================

/// The bridge the platform UI channel dispatches into.
///
/// Owns the flash handle for the UI context and the command handle to the
/// background service; each spawned service carries its reports back over
/// its own event channel, pumped into the bridge's shared state.
pub struct TorchBridge {
    config: TorchServiceConfig,
    backend: Arc<dyn TorchBackend>,
    notifier: Arc<dyn NotificationSink>,
    /// Flash handle resolved in the UI context; `None` when no device
    /// carries a flash unit (every light operation then errors uniformly).
    flash: Mutex<Option<FlashUnit>>,
    state: Arc<Mutex<BridgeState>>,
    delegate: Arc<RwLock<Option<Arc<dyn UiDelegate>>>>,
    service: Mutex<Option<ServiceHandle>>,
    /// Bumped on every fresh service spawn; event pumps from superseded
    /// tasks check it before touching bridge state.
    generation: Arc<AtomicU64>,
    runtime: tokio::runtime::Handle,
}

impl TorchBridge {
    /// Create the bridge for this UI activation. Resolves the flash unit in
    /// the UI context and spawns the event pump; a missing flash unit is not
    /// fatal here — the UI still loads, operations report the error.
    pub fn new(
        config: TorchServiceConfig,
        backend: Arc<dyn TorchBackend>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self, TorchError> {
        // Initialize tracing (idempotent).
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .try_init();

        config.validate().map_err(|e| TorchError::Config(e.to_string()))?;

        let flash = match FlashUnit::resolve(backend.clone()) {
            Ok(flash) => Some(flash),
            Err(e) => {
                tracing::warn!("no torch hardware in UI context: {e}");
                None
            }
        };

        let state = Arc::new(Mutex::new(BridgeState::Idle));
        let delegate: Arc<RwLock<Option<Arc<dyn UiDelegate>>>> = Arc::new(RwLock::new(None));

        Ok(TorchBridge {
            config,
            backend,
            notifier,
            flash: Mutex::new(flash),
            state,
            delegate,
            service: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            runtime: runtime_handle(),
        })
    }

    /// Forward one service task's reports to bridge state and the attached
    /// delegate. Exits when that task drops its event sender. Reports from a
    /// task superseded by a newer spawn describe a session the bridge has
    /// already moved past and are discarded under the state lock, so they can
    /// never clobber the state of the session that replaced them.
    async fn pump_events(
        mut events: mpsc::UnboundedReceiver<ServiceEvent>,
        state: Arc<Mutex<BridgeState>>,
        delegate: Arc<RwLock<Option<Arc<dyn UiDelegate>>>>,
        my_generation: u64,
        current_generation: Arc<AtomicU64>,
    ) {
        while let Some(event) = events.recv().await {
            let mut state = state.lock();
            if current_generation.load(Ordering::SeqCst) != my_generation {
                tracing::debug!("discarding report from superseded service task: {event:?}");
                continue;
            }
            match event {
                ServiceEvent::Acquired { is_on } => {
                    if *state == BridgeState::BackgroundRequested {
                        *state = BridgeState::BackgroundActive;
                    }
                    tracing::debug!("background acquire confirmed (is_on={is_on})");
                }
                ServiceEvent::Stopped { from_notification } => {
                    *state = BridgeState::Idle;
                    drop(state);
                    if from_notification {
                        let delegate = delegate.read().clone();
                        match delegate {
                            Some(delegate) => delegate.on_torch_stopped(),
                            None => {
                                tracing::debug!("torch stopped from notification, no UI attached")
                            }
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // DELEGATE LIFECYCLE
    // ------------------------------------------------------------------------

    /// Register the UI callback. Call when the UI layer comes up.
    pub fn attach(&self, delegate: Arc<dyn UiDelegate>) {
        *self.delegate.write() = Some(delegate);
    }

    /// Drop the UI callback. Call when the UI layer is torn down; events
    /// arriving afterwards are logged and discarded instead of reaching a
    /// stale reference.
    pub fn detach(&self) {
        *self.delegate.write() = None;
    }

    // ------------------------------------------------------------------------
    // OPERATIONS
    // ------------------------------------------------------------------------

    /// Toggle the torch directly from the UI context. Synchronous: the
    /// hardware state has changed when this returns `Ok`. Rejected while the
    /// background service owns the hardware (single-writer invariant).
    pub fn set_torch(&self, is_on: bool) -> Result<(), TorchError> {
        let mut state = self.state.lock();
        match *state {
            BridgeState::BackgroundRequested | BridgeState::BackgroundActive => {
                return Err(TorchError::InvalidState(format!(
                    "hardware is owned by the background service ({state})"
                )));
            }
            BridgeState::Idle | BridgeState::ForegroundLit => {}
        }

        let flash = self.flash.lock();
        let flash = flash.as_ref().ok_or(HardwareError::NoFlashUnit)?;
        flash.set(is_on)?;
        *state = if is_on {
            BridgeState::ForegroundLit
        } else {
            BridgeState::Idle
        };
        tracing::debug!("foreground torch set (is_on={is_on})");
        Ok(())
    }

    /// Hand the hardware to the background service with the requested state.
    ///
    /// Eventually consistent: returns as soon as the command is queued. The
    /// release in this context is best-effort; when it completes cleanly the
    /// service is signalled and acquires immediately, otherwise it waits out
    /// the configured grace delay first.
    pub fn start_background(&self, is_on: bool) -> Result<(), TorchError> {
        let (release_tx, release_rx) = oneshot::channel();
        match *self.state.lock() {
            // This context owns the hardware: release it here and signal the
            // service so it can acquire without waiting out the grace delay.
            BridgeState::Idle | BridgeState::ForegroundLit => match self.flash.lock().as_ref() {
                Some(flash) => {
                    if flash.release() {
                        let _ = release_tx.send(());
                    }
                    // On failure the sender drops unsignalled and the service
                    // falls back to the full grace delay.
                }
                None => {
                    tracing::warn!("no flash unit in UI context, skipping pre-background release");
                }
            },
            // A service task owns the hardware (or is tearing down with it)
            // and releases on its own stop path. The sender stays
            // unsignalled; the grace delay covers that teardown.
            BridgeState::BackgroundRequested | BridgeState::BackgroundActive => {
                drop(release_tx);
            }
        }

        let mut service = self.service.lock();
        let needs_spawn = service.as_ref().map_or(true, |h| !h.is_alive());
        if needs_spawn {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let (svc, handle) = TorchService::new(
                self.config.clone(),
                self.backend.clone(),
                self.notifier.clone(),
                events_tx,
            );
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            self.runtime.spawn(svc.run());
            self.runtime.spawn(Self::pump_events(
                events_rx,
                self.state.clone(),
                self.delegate.clone(),
                generation,
                self.generation.clone(),
            ));
            *service = Some(handle);
        }
        let handle = service.as_ref().expect("service handle ensured above");

        // The requested state goes up before the command: the service's
        // confirmation can race this thread and must find it in place.
        *self.state.lock() = BridgeState::BackgroundRequested;
        if handle.start(is_on, release_rx).is_err() {
            *self.state.lock() = BridgeState::Idle;
            return Err(TorchError::ServiceUnavailable);
        }
        tracing::info!("background torch requested (is_on={is_on})");
        Ok(())
    }

    /// Ask the background service to release the hardware and terminate.
    /// Fire-and-forget and idempotent: a stop with no running service is a
    /// logged no-op. The stored handle is dropped here so a later start
    /// spawns a fresh service task instead of queueing into the
    /// terminating one, whose loop exits without draining its channel.
    pub fn stop_background(&self) -> Result<(), TorchError> {
        let mut service = self.service.lock();
        match service.take().filter(|h| h.is_alive()) {
            Some(handle) => handle.stop(false).map_err(|_| TorchError::ServiceUnavailable)?,
            None => tracing::debug!("stop_background with no running service (no-op)"),
        }
        Ok(())
    }

    /// Entry point for the notification's stop action. Routes the stop into
    /// the service, which releases the hardware and reports back so the
    /// attached delegate receives exactly one `on_torch_stopped`. Drops the
    /// stored handle like [`TorchBridge::stop_background`] does.
    pub fn notification_stop_requested(&self) {
        let mut service = self.service.lock();
        match service.take().filter(|h| h.is_alive()) {
            Some(handle) => {
                if handle.stop(true).is_err() {
                    tracing::warn!("notification stop ignored: service command channel closed");
                }
            }
            None => tracing::debug!("notification stop with no running service (ignored)"),
        }
    }

    /// Current bridge-side view of hardware ownership.
    pub fn state(&self) -> BridgeState {
        *self.state.lock()
    }
}
