//! Background torch service
//!
//! Long-running task that owns the flash hardware while the app is not in the
//! foreground. The UI bridge creates it, hands it commands over a channel, and
//! observes it through `ServiceEvent`s. Lifecycle follows the platform
//! foreground-service contract: the notification is posted before any hardware
//! work so the foreground deadline is always met.
//!
//! The foreground→background hardware hand-off is a release handshake with a
//! bounded timeout rather than a bare fixed delay: the releasing context
//! signals completion over a oneshot, and the service waits on that signal for
//! at most the configured grace delay before acquiring anyway. A stop command
//! arriving inside the window cancels the pending acquire, so the hardware is
//! never re-lit after the user asked for it to go out.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Duration, Instant};

use crate::hardware::{FlashUnit, TorchBackend};
use crate::notify::{build_notification, NotificationSink, NOTIFICATION_ID};

/// Default wait for the release handshake before acquiring anyway.
pub const DEFAULT_GRACE_DELAY_MS: u64 = 300;

/// Service configuration provided by the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorchServiceConfig {
    /// Upper bound on the release handshake wait, in milliseconds.
    pub grace_delay_ms: u64,
    /// Id the ongoing notification is posted under.
    pub notification_id: u32,
}

impl Default for TorchServiceConfig {
    fn default() -> Self {
        Self {
            grace_delay_ms: DEFAULT_GRACE_DELAY_MS,
            notification_id: NOTIFICATION_ID,
        }
    }
}

impl TorchServiceConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.grace_delay_ms > 5_000 {
            return Err(ServiceError::ConfigError(
                "grace_delay_ms above 5000 defeats the foreground hand-off".to_string(),
            ));
        }
        if self.notification_id == 0 {
            // Android rejects id 0 for startForeground.
            return Err(ServiceError::ConfigError(
                "notification_id must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    fn grace_delay(&self) -> Duration {
        Duration::from_millis(self.grace_delay_ms)
    }
}

/// Lifecycle of the service task, observed inside the task only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Created,
    Foregrounded,
    Stopping,
    Destroyed,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Created => write!(f, "Created"),
            ServiceState::Foregrounded => write!(f, "Foregrounded"),
            ServiceState::Stopping => write!(f, "Stopping"),
            ServiceState::Destroyed => write!(f, "Destroyed"),
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum ServiceError {
    #[error("service command channel closed")]
    ChannelClosed,
    #[error("configuration error: {0}")]
    ConfigError(String),
}

/// Commands the bridge sends into the service task.
#[derive(Debug)]
pub enum ServiceCommand {
    /// Take over the hardware with the requested light state. `release_done`
    /// resolves when the sending context finished releasing the hardware; the
    /// service waits on it for at most the grace delay.
    Start {
        is_on: bool,
        release_done: oneshot::Receiver<()>,
    },
    /// Release the hardware and terminate. `from_notification` marks the
    /// user-initiated stop action, which must be echoed back to the UI.
    Stop { from_notification: bool },
}

/// Events the service reports back to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEvent {
    /// The delayed acquire completed and the hardware carries `is_on`.
    Acquired { is_on: bool },
    /// The service released the hardware and is terminating.
    Stopped { from_notification: bool },
}

/// Cloneable handle for sending commands into a running service task.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    commands: mpsc::UnboundedSender<ServiceCommand>,
}

impl ServiceHandle {
    pub fn start(
        &self,
        is_on: bool,
        release_done: oneshot::Receiver<()>,
    ) -> Result<(), ServiceError> {
        self.commands
            .send(ServiceCommand::Start { is_on, release_done })
            .map_err(|_| ServiceError::ChannelClosed)
    }

    pub fn stop(&self, from_notification: bool) -> Result<(), ServiceError> {
        self.commands
            .send(ServiceCommand::Stop { from_notification })
            .map_err(|_| ServiceError::ChannelClosed)
    }

    /// Whether the service task is still consuming commands.
    pub fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// An acquire scheduled behind the release handshake. At most one exists;
/// a newer start replaces it (last-write-wins), a stop drops it.
struct PendingAcquire {
    is_on: bool,
    release_done: Option<oneshot::Receiver<()>>,
    deadline: Instant,
}

/// The background service task. Create with [`TorchService::new`], then spawn
/// [`TorchService::run`] on a runtime.
pub struct TorchService {
    config: TorchServiceConfig,
    backend: Arc<dyn TorchBackend>,
    notifier: Arc<dyn NotificationSink>,
    commands: mpsc::UnboundedReceiver<ServiceCommand>,
    events: mpsc::UnboundedSender<ServiceEvent>,
    state: ServiceState,
    flash: Option<FlashUnit>,
}

impl TorchService {
    pub fn new(
        config: TorchServiceConfig,
        backend: Arc<dyn TorchBackend>,
        notifier: Arc<dyn NotificationSink>,
        events: mpsc::UnboundedSender<ServiceEvent>,
    ) -> (TorchService, ServiceHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = TorchService {
            config,
            backend,
            notifier,
            commands: rx,
            events,
            state: ServiceState::Created,
            flash: None,
        };
        (service, ServiceHandle { commands: tx })
    }

    /// Service main loop. Runs until a stop command arrives or every handle
    /// is dropped; either way the hardware ends released.
    pub async fn run(mut self) {
        tracing::info!("torch service created");
        let mut pending: Option<PendingAcquire> = None;

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(ServiceCommand::Start { is_on, release_done }) => {
                        self.handle_start(is_on, release_done, &mut pending);
                    }
                    Some(ServiceCommand::Stop { from_notification }) => {
                        pending = None;
                        self.handle_stop(from_notification);
                        break;
                    }
                    // Every handle dropped: supervisor teardown.
                    None => break,
                },
                () = Self::wait_ready(&mut pending) => {
                    if let Some(p) = pending.take() {
                        if !self.acquire(p.is_on) {
                            break;
                        }
                    }
                }
            }
        }

        self.destroy();
    }

    /// Resolve when the pending acquire may fire: the releasing context
    /// signalled completion, or the grace deadline passed. A dropped sender
    /// means the release never completed cleanly; wait out the full delay.
    /// Never resolves while nothing is pending.
    async fn wait_ready(pending: &mut Option<PendingAcquire>) {
        let Some(p) = pending.as_mut() else {
            return std::future::pending::<()>().await;
        };
        if let Some(rx) = p.release_done.as_mut() {
            tokio::select! {
                res = rx => {
                    p.release_done = None;
                    if res.is_ok() {
                        return;
                    }
                }
                () = sleep_until(p.deadline) => return,
            }
        }
        sleep_until(p.deadline).await;
    }

    fn handle_start(
        &mut self,
        is_on: bool,
        release_done: oneshot::Receiver<()>,
        pending: &mut Option<PendingAcquire>,
    ) {
        // Notification first: the platform's foreground deadline must be met
        // before any hardware work happens.
        self.notifier
            .post(self.config.notification_id, &build_notification(is_on));
        self.state = ServiceState::Foregrounded;

        if pending.is_some() {
            tracing::debug!("replacing pending acquire, latest request wins (is_on={is_on})");
        }
        *pending = Some(PendingAcquire {
            is_on,
            release_done: Some(release_done),
            deadline: Instant::now() + self.config.grace_delay(),
        });
        tracing::info!("torch service foregrounded (requested is_on={is_on})");
    }

    /// Take over the hardware. Returns `false` when the service should stop
    /// because no flash-capable device exists in this context.
    fn acquire(&mut self, is_on: bool) -> bool {
        match FlashUnit::resolve(self.backend.clone()) {
            Ok(flash) => {
                match flash.set(is_on) {
                    Ok(()) => {
                        tracing::info!("background acquire complete (is_on={is_on})");
                        let _ = self.events.send(ServiceEvent::Acquired { is_on });
                    }
                    Err(e) => {
                        // Nobody is waiting on this path; keep the service up
                        // so the user can still stop it from the notification.
                        tracing::warn!("delayed torch acquire failed: {e}");
                    }
                }
                self.flash = Some(flash);
                true
            }
            Err(e) => {
                // Uniform no-flash policy: log, report a stop, terminate.
                tracing::warn!("no flash unit in service context: {e}");
                let _ = self.events.send(ServiceEvent::Stopped {
                    from_notification: false,
                });
                self.state = ServiceState::Stopping;
                false
            }
        }
    }

    fn handle_stop(&mut self, from_notification: bool) {
        self.state = ServiceState::Stopping;
        self.release_hardware();
        let _ = self.events.send(ServiceEvent::Stopped { from_notification });
        tracing::info!("torch service stopping (from_notification={from_notification})");
    }

    /// Best-effort release. Falls back to a fresh resolve when the service
    /// never acquired, so a stop racing the hand-off still ends dark.
    fn release_hardware(&mut self) {
        let flash = match self.flash.take() {
            Some(flash) => Some(flash),
            None => FlashUnit::resolve(self.backend.clone()).ok(),
        };
        if let Some(flash) = flash {
            flash.release();
        }
    }

    /// Unconditional safety net on task exit, whatever triggered it.
    fn destroy(&mut self) {
        tracing::debug!("torch service tearing down from {}", self.state);
        self.state = ServiceState::Destroyed;
        self.release_hardware();
        self.notifier.clear(self.config.notification_id);
        tracing::info!("torch service destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{CameraId, HardwareError};
    use crate::notify::{MockNotificationSink, TorchNotification};
    use parking_lot::Mutex;
    use tokio::task::yield_now;

    /// In-memory torch hardware recording every set call.
    struct FakeTorch {
        has_flash: bool,
        torch_on: Mutex<bool>,
        sets: Mutex<Vec<bool>>,
    }

    impl FakeTorch {
        fn new() -> Arc<Self> {
            Arc::new(FakeTorch {
                has_flash: true,
                torch_on: Mutex::new(false),
                sets: Mutex::new(Vec::new()),
            })
        }

        fn without_flash() -> Arc<Self> {
            Arc::new(FakeTorch {
                has_flash: false,
                torch_on: Mutex::new(false),
                sets: Mutex::new(Vec::new()),
            })
        }

        fn is_on(&self) -> bool {
            *self.torch_on.lock()
        }

        fn sets(&self) -> Vec<bool> {
            self.sets.lock().clone()
        }
    }

    impl TorchBackend for FakeTorch {
        fn camera_ids(&self) -> Vec<CameraId> {
            vec!["0".into()]
        }

        fn has_flash_unit(&self, _id: &CameraId) -> bool {
            self.has_flash
        }

        fn set_torch_mode(&self, _id: &CameraId, on: bool) -> Result<(), HardwareError> {
            *self.torch_on.lock() = on;
            self.sets.lock().push(on);
            Ok(())
        }
    }

    /// Notification sink recording posts and clears.
    struct FakeSink {
        posted: Mutex<Vec<(u32, TorchNotification)>>,
        cleared: Mutex<Vec<u32>>,
    }

    impl FakeSink {
        fn new() -> Arc<Self> {
            Arc::new(FakeSink {
                posted: Mutex::new(Vec::new()),
                cleared: Mutex::new(Vec::new()),
            })
        }
    }

    impl NotificationSink for FakeSink {
        fn post(&self, id: u32, notification: &TorchNotification) {
            self.posted.lock().push((id, notification.clone()));
        }

        fn clear(&self, id: u32) {
            self.cleared.lock().push(id);
        }
    }

    fn spawn_service(
        backend: Arc<FakeTorch>,
        sink: Arc<FakeSink>,
    ) -> (ServiceHandle, mpsc::UnboundedReceiver<ServiceEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (service, handle) =
            TorchService::new(TorchServiceConfig::default(), backend, sink, events_tx);
        tokio::spawn(service.run());
        (handle, events_rx)
    }

    /// Let the service task run until it has no more ready work.
    async fn settle() {
        for _ in 0..32 {
            yield_now().await;
        }
    }

    /// A oneshot receiver whose sender already fired: clean release hand-off.
    fn signalled_release() -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(());
        rx
    }

    /// A oneshot receiver whose sender was dropped: no release signal.
    fn dropped_release() -> oneshot::Receiver<()> {
        let (_tx, rx) = oneshot::channel();
        rx
    }

    #[test]
    fn test_config_default_is_valid() {
        assert!(TorchServiceConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_rejects_excessive_grace_delay() {
        let config = TorchServiceConfig {
            grace_delay_ms: 60_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_zero_notification_id() {
        let config = TorchServiceConfig {
            notification_id: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_service_state_display() {
        assert_eq!(format!("{}", ServiceState::Created), "Created");
        assert_eq!(format!("{}", ServiceState::Foregrounded), "Foregrounded");
        assert_eq!(format!("{}", ServiceState::Stopping), "Stopping");
        assert_eq!(format!("{}", ServiceState::Destroyed), "Destroyed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_posted_before_hardware_acquire() {
        let backend = FakeTorch::new();
        let sink = FakeSink::new();
        let (handle, _events) = spawn_service(backend.clone(), sink.clone());

        handle.start(true, signalled_release()).unwrap();
        settle().await;

        // Signalled hand-off: acquire happens without waiting out the delay.
        assert!(backend.is_on());
        let posted = sink.posted.lock();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].1.title, "Torch on");
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_notification_id_reaches_sink() {
        let mut sink = MockNotificationSink::new();
        sink.expect_post()
            .withf(|id, n| *id == 42 && n.title == "Torch on")
            .times(1)
            .return_const(());
        sink.expect_clear()
            .withf(|id| *id == 42)
            .times(1)
            .return_const(());

        let backend = FakeTorch::new();
        let config = TorchServiceConfig {
            notification_id: 42,
            ..Default::default()
        };
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (service, handle) =
            TorchService::new(config, backend.clone(), Arc::new(sink), events_tx);
        tokio::spawn(service.run());

        handle.start(true, signalled_release()).unwrap();
        settle().await;
        assert!(backend.is_on());

        handle.stop(false).unwrap();
        settle().await;
        assert!(!backend.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_fallback_when_release_never_signalled() {
        let backend = FakeTorch::new();
        let sink = FakeSink::new();
        let (handle, _events) = spawn_service(backend.clone(), sink.clone());

        handle.start(true, dropped_release()).unwrap();
        settle().await;

        // Notification is up immediately, hardware untouched until the
        // grace deadline.
        assert_eq!(sink.posted.lock().len(), 1);
        assert!(!backend.is_on());

        tokio::time::advance(Duration::from_millis(DEFAULT_GRACE_DELAY_MS - 1)).await;
        settle().await;
        assert!(!backend.is_on());

        tokio::time::advance(Duration::from_millis(2)).await;
        settle().await;
        assert!(backend.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_inside_grace_window_cancels_acquire() {
        let backend = FakeTorch::new();
        let sink = FakeSink::new();
        let (handle, mut events) = spawn_service(backend.clone(), sink.clone());

        handle.start(true, dropped_release()).unwrap();
        handle.stop(false).unwrap();
        settle().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;

        // The pending acquire must never fire: no `true` reaches hardware.
        assert!(!backend.sets().contains(&true));
        assert!(!backend.is_on());
        assert_eq!(
            events.try_recv().unwrap(),
            ServiceEvent::Stopped {
                from_notification: false
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_wins_over_first() {
        let backend = FakeTorch::new();
        let sink = FakeSink::new();
        let (handle, _events) = spawn_service(backend.clone(), sink.clone());

        // First request never signals its release; second one does.
        let (_keep_tx, first_rx) = oneshot::channel();
        handle.start(true, first_rx).unwrap();
        handle.start(false, signalled_release()).unwrap();
        settle().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;

        // Only the latest requested state ever reached the hardware.
        assert!(!backend.sets().contains(&true));
        assert_eq!(sink.posted.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_from_notification_reports_back() {
        let backend = FakeTorch::new();
        let sink = FakeSink::new();
        let (handle, mut events) = spawn_service(backend.clone(), sink.clone());

        handle.start(true, signalled_release()).unwrap();
        settle().await;
        assert_eq!(
            events.try_recv().unwrap(),
            ServiceEvent::Acquired { is_on: true }
        );

        handle.stop(true).unwrap();
        settle().await;

        assert!(!backend.is_on());
        assert_eq!(
            events.try_recv().unwrap(),
            ServiceEvent::Stopped {
                from_notification: true
            }
        );
        assert!(!handle.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_drop_releases_hardware_and_clears_notification() {
        let backend = FakeTorch::new();
        let sink = FakeSink::new();
        let (handle, _events) = spawn_service(backend.clone(), sink.clone());

        handle.start(true, signalled_release()).unwrap();
        settle().await;
        assert!(backend.is_on());

        drop(handle);
        settle().await;

        assert!(!backend.is_on());
        assert_eq!(sink.cleared.lock().as_slice(), &[NOTIFICATION_ID]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_flash_unit_stops_service_cleanly() {
        let backend = FakeTorch::without_flash();
        let sink = FakeSink::new();
        let (handle, mut events) = spawn_service(backend.clone(), sink.clone());

        handle.start(true, signalled_release()).unwrap();
        settle().await;

        // Notification went up first, then the acquire failed and the
        // service reported a stop instead of pretending success.
        assert_eq!(sink.posted.lock().len(), 1);
        assert_eq!(
            events.try_recv().unwrap(),
            ServiceEvent::Stopped {
                from_notification: false
            }
        );
        assert!(!handle.is_alive());
        assert_eq!(sink.cleared.lock().as_slice(), &[NOTIFICATION_ID]);
    }
}
