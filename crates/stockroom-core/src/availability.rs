//! Availability monitor
//!
//! Tracks two signals and combines them:
//!
//! - `transport_online`: the host's platform connectivity signal
//! - `server_reachable`: outcome of the last probe against the catalog server
//!
//! The engine is *online* only when both are true. Every change of the
//! combined value is announced exactly once to listeners as a
//! [`Transition`]. Probes run on start, on a fixed interval and right after
//! the transport comes back.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::client::CatalogApi;
use crate::config::{Config, MAX_PROBE_TIMEOUT_SECS};

/// Combined connectivity state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityState {
    pub transport_online: bool,
    pub server_reachable: bool,
}

impl AvailabilityState {
    pub fn effective_online(&self) -> bool {
        self.transport_online && self.server_reachable
    }
}

impl Default for AvailabilityState {
    /// Transport assumed up, server unknown until the first probe
    fn default() -> Self {
        Self {
            transport_online: true,
            server_reachable: false,
        }
    }
}

/// Change of the combined online flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    WentOnline,
    WentOffline,
}

type Listener = Arc<dyn Fn(Transition) + Send + Sync>;
type Listeners = Mutex<BTreeMap<u64, Listener>>;

/// Keeps a listener registered; dropping it unsubscribes
pub struct Subscription {
    id: u64,
    listeners: Weak<Listeners>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners).remove(&self.id);
        }
    }
}

fn lock(listeners: &Listeners) -> MutexGuard<'_, BTreeMap<u64, Listener>> {
    listeners.lock().unwrap_or_else(|e| e.into_inner())
}

/// Commands accepted by the probe loop
#[derive(Debug, Clone, Copy)]
pub enum MonitorCommand {
    Shutdown,
}

/// Handle to the background probe loop
pub struct MonitorHandle {
    pub command_tx: mpsc::Sender<MonitorCommand>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stop the loop and wait for it to finish
    pub async fn shutdown(self) {
        let _ = self.command_tx.send(MonitorCommand::Shutdown).await;
        let _ = self.task.await;
    }
}

/// Watches transport and server availability
pub struct AvailabilityMonitor {
    api: Arc<dyn CatalogApi>,
    state_tx: watch::Sender<AvailabilityState>,
    listeners: Arc<Listeners>,
    next_listener: AtomicU64,
    /// Completion time and result of the last probe
    last_probe: tokio::sync::Mutex<Option<(Instant, bool)>>,
    transport_up: Notify,
    probe_timeout: Duration,
    debounce: Duration,
}

impl AvailabilityMonitor {
    pub fn new(api: Arc<dyn CatalogApi>, probe_timeout: Duration, debounce: Duration) -> Self {
        let (state_tx, _) = watch::channel(AvailabilityState::default());
        Self {
            api,
            state_tx,
            listeners: Arc::new(Mutex::new(BTreeMap::new())),
            next_listener: AtomicU64::new(0),
            last_probe: tokio::sync::Mutex::new(None),
            transport_up: Notify::new(),
            probe_timeout: probe_timeout.min(Duration::from_secs(MAX_PROBE_TIMEOUT_SECS)),
            debounce,
        }
    }

    pub fn from_config(api: Arc<dyn CatalogApi>, config: &Config) -> Self {
        Self::new(api, config.probe_timeout(), config.probe_debounce())
    }

    pub fn state(&self) -> AvailabilityState {
        *self.state_tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state().effective_online()
    }

    /// Receiver that observes every state change
    pub fn subscribe(&self) -> watch::Receiver<AvailabilityState> {
        self.state_tx.subscribe()
    }

    /// Register a transition listener
    ///
    /// Listeners run synchronously on the task that caused the transition
    /// and must not block.
    pub fn on_change(&self, listener: impl Fn(Transition) + Send + Sync + 'static) -> Subscription {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        lock(&self.listeners).insert(id, Arc::new(listener));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Feed the platform connectivity signal
    pub fn set_transport_online(&self, online: bool) {
        let was_online = self.state().transport_online;
        self.update(|state| state.transport_online = online);
        if online && !was_online {
            self.transport_up.notify_one();
        }
    }

    /// Record that a request just failed to reach the server
    pub fn note_server_unreachable(&self) {
        if let Ok(mut last) = self.last_probe.try_lock() {
            *last = None;
        }
        self.update(|state| state.server_reachable = false);
    }

    /// Probe the server now and update the state
    ///
    /// Returns false without a request when the transport is down. Probes
    /// that overlap, or start within the debounce window of the previous
    /// one, reuse its result.
    pub async fn probe_server_now(&self) -> bool {
        if !self.state().transport_online {
            debug!("Transport offline, skipping probe");
            return false;
        }

        let mut last = self.last_probe.lock().await;
        if let Some((at, reachable)) = *last {
            if at.elapsed() < self.debounce {
                debug!(reachable, "Reusing recent probe result");
                return reachable;
            }
        }

        let reachable = match tokio::time::timeout(self.probe_timeout, self.api.probe()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("Probe failed: {}", e);
                false
            }
            Err(_) => {
                debug!(timeout = ?self.probe_timeout, "Probe timed out");
                false
            }
        };

        *last = Some((Instant::now(), reachable));
        self.update(|state| state.server_reachable = reachable);
        reachable
    }

    /// Apply `change` and announce a transition if the online flag flipped
    ///
    /// The comparison happens under the watch channel's lock, so racing
    /// updates cannot both observe the same flip.
    fn update(&self, change: impl FnOnce(&mut AvailabilityState)) {
        let mut transition = None;
        self.state_tx.send_if_modified(|state| {
            let before = *state;
            change(state);
            if before.effective_online() != state.effective_online() {
                transition = Some(if state.effective_online() {
                    Transition::WentOnline
                } else {
                    Transition::WentOffline
                });
            }
            before != *state
        });

        if let Some(transition) = transition {
            info!(?transition, "Availability changed");
            let listeners: Vec<Listener> = lock(&self.listeners).values().cloned().collect();
            for listener in listeners {
                listener(transition);
            }
        }
    }

    /// Start the periodic probe loop
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> MonitorHandle {
        let (command_tx, command_rx) = mpsc::channel(8);
        let task = tokio::spawn(probe_loop(Arc::clone(self), interval, command_rx));
        MonitorHandle { command_tx, task }
    }
}

async fn probe_loop(
    monitor: Arc<AvailabilityMonitor>,
    interval: Duration,
    mut command_rx: mpsc::Receiver<MonitorCommand>,
) {
    monitor.probe_server_now().await;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                monitor.probe_server_now().await;
            }
            _ = monitor.transport_up.notified() => {
                monitor.probe_server_now().await;
            }
            cmd = command_rx.recv() => {
                match cmd {
                    Some(MonitorCommand::Shutdown) | None => break,
                }
            }
        }
    }

    debug!("Probe loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeCatalogApi;

    fn monitor(api: &Arc<FakeCatalogApi>) -> Arc<AvailabilityMonitor> {
        let api: Arc<dyn CatalogApi> = api.clone();
        Arc::new(AvailabilityMonitor::new(
            api,
            Duration::from_secs(10),
            Duration::from_millis(500),
        ))
    }

    fn recorder(monitor: &AvailabilityMonitor) -> (Arc<Mutex<Vec<Transition>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = monitor.on_change(move |t| sink.lock().unwrap().push(t));
        (seen, sub)
    }

    #[tokio::test]
    async fn test_probe_success_goes_online_once() {
        let api = Arc::new(FakeCatalogApi::new());
        let monitor = monitor(&api);
        let (seen, _sub) = recorder(&monitor);

        assert!(!monitor.is_online());
        let results = futures_util::future::join_all((0..5).map(|_| monitor.probe_server_now())).await;

        assert!(results.iter().all(|r| *r));
        assert!(monitor.is_online());
        assert_eq!(*seen.lock().unwrap(), vec![Transition::WentOnline]);
        assert_eq!(api.probe_count(), 1);
    }

    #[tokio::test]
    async fn test_transport_offline_skips_probe() {
        let api = Arc::new(FakeCatalogApi::new());
        let monitor = monitor(&api);
        monitor.probe_server_now().await;

        let (seen, _sub) = recorder(&monitor);
        monitor.set_transport_online(false);

        assert!(!monitor.probe_server_now().await);
        assert_eq!(api.probe_count(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![Transition::WentOffline]);
        assert!(monitor.state().server_reachable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_marks_unreachable() {
        let api = Arc::new(FakeCatalogApi::new());
        api.set_probe_delay(Duration::from_secs(60));
        let monitor = monitor(&api);

        let started = Instant::now();
        assert!(!monitor.probe_server_now().await);
        assert!(started.elapsed() <= Duration::from_secs(10));
        assert!(!monitor.state().server_reachable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_window() {
        let api = Arc::new(FakeCatalogApi::new());
        let monitor = monitor(&api);

        monitor.probe_server_now().await;
        monitor.probe_server_now().await;
        assert_eq!(api.probe_count(), 1);

        tokio::time::advance(Duration::from_millis(600)).await;
        monitor.probe_server_now().await;
        assert_eq!(api.probe_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_probe_goes_offline() {
        let api = Arc::new(FakeCatalogApi::new());
        let monitor = Arc::new(AvailabilityMonitor::new(
            api.clone(),
            Duration::from_secs(1),
            Duration::ZERO,
        ));
        monitor.probe_server_now().await;
        let (seen, _sub) = recorder(&monitor);

        api.set_reachable(false);
        assert!(!monitor.probe_server_now().await);
        assert!(!monitor.probe_server_now().await);
        assert_eq!(*seen.lock().unwrap(), vec![Transition::WentOffline]);
    }

    #[tokio::test]
    async fn test_dropped_subscription_stops_notifications() {
        let api = Arc::new(FakeCatalogApi::new());
        let monitor = monitor(&api);
        let (seen, sub) = recorder(&monitor);
        drop(sub);

        monitor.probe_server_now().await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watch_receiver_sees_changes() {
        let api = Arc::new(FakeCatalogApi::new());
        let monitor = monitor(&api);
        let mut rx = monitor.subscribe();

        monitor.probe_server_now().await;
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().effective_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_loop_runs_on_interval() {
        let api = Arc::new(FakeCatalogApi::new());
        let monitor = monitor(&api);
        let handle = monitor.spawn(Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(api.probe_count(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(api.probe_count(), 2);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_recovery_triggers_probe() {
        let api = Arc::new(FakeCatalogApi::new());
        let monitor = monitor(&api);
        let handle = monitor.spawn(Duration::from_secs(300));
        tokio::time::sleep(Duration::from_secs(1)).await;

        monitor.set_transport_online(false);
        tokio::time::sleep(Duration::from_secs(1)).await;
        monitor.set_transport_online(true);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(api.probe_count(), 2);
        assert!(monitor.is_online());
        handle.shutdown().await;
    }
}
