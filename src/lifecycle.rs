//! Host lifecycle: startup phases and shutdown coordination.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::info;

/// Receives the host startup phases, each exactly once and in order, and
/// the shutdown notice.
pub trait LifecycleListener: Send + Sync {
    fn on_services_initialized(&self) {}
    fn on_configuration_loaded(&self) {}
    fn on_startup_completed(&self) {}
    fn on_shutdown(&self) {}
}

pub struct SystemService {
    listeners: Mutex<Vec<Arc<dyn LifecycleListener>>>,
    created_at: Instant,
    startup_duration: Mutex<Option<Duration>>,
}

impl SystemService {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            created_at: Instant::now(),
            startup_duration: Mutex::new(None),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.listeners().push(listener);
    }

    pub fn startup_duration(&self) -> Option<Duration> {
        *self
            .startup_duration
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn on_services_initialized(&self) {
        for listener in self.snapshot() {
            listener.on_services_initialized();
        }
        info!("Services initialized.");
    }

    pub fn on_configuration_loaded(&self) {
        for listener in self.snapshot() {
            listener.on_configuration_loaded();
        }
        info!("Configuration loaded.");
    }

    pub fn on_startup_completed(&self) {
        let duration = self.created_at.elapsed();
        *self
            .startup_duration
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(duration);

        for listener in self.snapshot() {
            listener.on_startup_completed();
        }
        info!("Startup completed in {:?}.", duration);
    }

    pub fn on_shutdown(&self) {
        info!("Host is shutting down...");
        for listener in self.snapshot() {
            listener.on_shutdown();
        }
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn LifecycleListener>>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self) -> Vec<Arc<dyn LifecycleListener>> {
        self.listeners().clone()
    }
}

impl Default for SystemService {
    fn default() -> Self {
        Self::new()
    }
}

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that all long-running tasks can subscribe to.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
