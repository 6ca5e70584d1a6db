//! Network reachability observation with debounced fan-out.
//!
//! The platform side is abstracted behind [`NetworkProbe`]: it hands out a
//! stream of raw [`RawNetworkState`] events and answers one-off probes. The
//! [`ConnectivityMonitor`] coalesces raw events so that a connection flapping
//! inside the debounce window reaches subscribers at most once, with the
//! settled state.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::{config::MonitorConfig, types::NetworkStatus};

/// One platform connectivity reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawNetworkState {
    /// Link-level connection; `None` when the platform has not decided yet.
    pub is_connected: Option<bool>,
    /// Internet reachability; `None` when indeterminate.
    pub is_internet_reachable: Option<bool>,
}

impl RawNetworkState {
    /// Connected and reachable.
    pub fn online() -> Self {
        Self {
            is_connected: Some(true),
            is_internet_reachable: Some(true),
        }
    }

    /// Disconnected.
    pub fn offline() -> Self {
        Self {
            is_connected: Some(false),
            is_internet_reachable: Some(false),
        }
    }

    /// Maps a raw reading to the tri-state status.
    ///
    /// Indeterminate reachability counts as reachable, since some platforms
    /// never resolve it. A missing connection flag is `Unknown`, not `Offline`.
    pub fn status(&self) -> NetworkStatus {
        match self.is_connected {
            None => NetworkStatus::Unknown,
            Some(false) => NetworkStatus::Offline,
            Some(true) => {
                if self.is_internet_reachable == Some(false) {
                    NetworkStatus::Offline
                } else {
                    NetworkStatus::Online
                }
            }
        }
    }
}

/// Probe failure reported by the platform layer.
#[derive(Debug, Clone, thiserror::Error)]
#[error("connectivity probe failed: {0}")]
pub struct ProbeError(pub String);

/// Platform connectivity source.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// Starts delivering raw change events. Called once per `initialize`.
    fn listen(&self) -> mpsc::UnboundedReceiver<RawNetworkState>;

    /// Reads the current state right now.
    async fn probe(&self) -> Result<RawNetworkState, ProbeError>;
}

type Listener = Arc<dyn Fn(NetworkStatus) + Send + Sync>;

#[derive(Default)]
struct Inner {
    listeners: HashMap<u64, Listener>,
    next_listener_id: u64,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    inner: Mutex<Inner>,
    status_tx: watch::Sender<NetworkStatus>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Listener bookkeeping stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records `status` and notifies listeners when it differs from the
    /// current one.
    fn publish(&self, status: NetworkStatus) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if !changed {
            return;
        }

        info!(?status, "network status changed");
        let listeners: Vec<Listener> = self.lock().listeners.values().cloned().collect();
        for listener in listeners {
            listener(status);
        }
    }
}

/// Observes platform connectivity and publishes a debounced tri-state status.
///
/// Construct one per process; `initialize` and `cleanup` bracket its life.
pub struct ConnectivityMonitor {
    probe: Arc<dyn NetworkProbe>,
    config: MonitorConfig,
    shared: Arc<Shared>,
}

impl fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("status", &self.status())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl ConnectivityMonitor {
    /// Builds an idle monitor; nothing is observed until [`initialize`](Self::initialize).
    pub fn new(probe: Arc<dyn NetworkProbe>, config: MonitorConfig) -> Self {
        let (status_tx, _) = watch::channel(NetworkStatus::Unknown);
        Self {
            probe,
            config,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                status_tx,
            }),
        }
    }

    /// Starts observing the platform. Calling it again while initialized is a no-op.
    pub async fn initialize(&self) {
        if self.is_initialized() {
            return;
        }

        let raw_rx = self.probe.listen();
        let task = tokio::spawn(debounce_loop(
            raw_rx,
            Arc::clone(&self.shared),
            self.config.debounce(),
        ));
        {
            let mut inner = self.shared.lock();
            if inner.task.is_some() {
                // Lost a race with a concurrent initialize.
                task.abort();
                return;
            }
            inner.task = Some(task);
        }

        match self.probe.probe().await {
            Ok(raw) => self.shared.publish(raw.status()),
            Err(err) => warn!(error = %err, "initial connectivity probe failed"),
        }
        debug!(status = ?self.status(), "connectivity monitor initialized");
    }

    /// True once the platform listener is running.
    pub fn is_initialized(&self) -> bool {
        self.shared.lock().task.is_some()
    }

    /// Registers `listener`; it is called right away with the current status
    /// and again on every settled change.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(NetworkStatus) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        let id = {
            let mut inner = self.shared.lock();
            let id = inner.next_listener_id;
            inner.next_listener_id += 1;
            inner.listeners.insert(id, Arc::clone(&listener));
            id
        };
        listener(self.status());
        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Receiver that always holds the current settled status.
    pub fn watch(&self) -> watch::Receiver<NetworkStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Current settled status.
    pub fn status(&self) -> NetworkStatus {
        *self.shared.status_tx.borrow()
    }

    /// Probes immediately, bypassing the debounce. Probe failures report
    /// `false` instead of erroring.
    pub async fn check_connection(&self) -> bool {
        match self.probe.probe().await {
            Ok(raw) => {
                let status = raw.status();
                self.shared.publish(status);
                status == NetworkStatus::Online
            }
            Err(err) => {
                debug!(error = %err, "connectivity check failed");
                false
            }
        }
    }

    /// Drops every listener and stops observation so a later `initialize`
    /// starts afresh.
    pub fn cleanup(&self) {
        let task = {
            let mut inner = self.shared.lock();
            inner.listeners.clear();
            inner.task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        debug!("connectivity monitor cleaned up");
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.shared.lock().task.take() {
            task.abort();
        }
    }
}

/// Registration returned by [`ConnectivityMonitor::subscribe`].
#[derive(Debug)]
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    id: u64,
    shared: std::sync::Weak<Shared>,
}

impl Subscription {
    /// Stops further notifications to this listener.
    pub fn unsubscribe(self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.lock().listeners.remove(&self.id);
        }
    }
}

async fn debounce_loop(
    mut raw_rx: mpsc::UnboundedReceiver<RawNetworkState>,
    shared: Arc<Shared>,
    debounce: Duration,
) {
    let mut settling: Option<NetworkStatus> = None;
    let mut deadline = Instant::now();

    loop {
        tokio::select! {
            raw = raw_rx.recv() => {
                let Some(raw) = raw else { break; };
                settling = Some(raw.status());
                deadline = Instant::now() + debounce;
            }
            _ = tokio::time::sleep_until(deadline), if settling.is_some() => {
                if let Some(status) = settling.take() {
                    shared.publish(status);
                }
            }
        }
    }
    debug!("platform connectivity stream closed");
}
