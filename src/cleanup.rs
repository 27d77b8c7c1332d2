//! Shutdown restoration: bring the interface up, put the primary MAC back,
//! stop the tunnel we started.
//!
//! Every step is attempted even if an earlier one failed, and running the
//! coordinator on an already-clean system changes nothing.

use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};

use crate::mac::MacAddress;
use crate::network::LinkControl;
use crate::store::IdentityStore;
use crate::vpn::{BackendKind, SharedBackend, StopOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceStep {
    AlreadyUp,
    BroughtUp,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacStep {
    AlreadyPrimary(MacAddress),
    Restored { from: MacAddress, to: MacAddress },
    NoRecord,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStep {
    /// No tunnel was started by this run
    NotStarted,
    Stopped(BackendKind),
    NothingRunning(BackendKind),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub interface: InterfaceStep,
    pub mac: MacStep,
    pub backend: BackendStep,
}

impl CleanupReport {
    /// True when the primary MAC is in place and no step failed
    pub fn is_clean(&self) -> bool {
        !matches!(self.interface, InterfaceStep::Failed(_))
            && matches!(self.mac, MacStep::AlreadyPrimary(_) | MacStep::Restored { .. })
            && !matches!(self.backend, BackendStep::Failed(_))
    }

    fn log(&self, iface: &str) {
        match &self.mac {
            MacStep::AlreadyPrimary(mac) => info!("{} already has its primary MAC {}", iface, mac),
            MacStep::Restored { from, to } => {
                info!("Restored primary MAC of {}: {} -> {}", iface, from, to)
            }
            MacStep::NoRecord => warn!("No primary MAC recorded for {}, nothing restored", iface),
            MacStep::Failed(e) => error!("Failed to restore the primary MAC of {}: {}", iface, e),
        }
        match &self.backend {
            BackendStep::NotStarted => debug!("No VPN backend was started"),
            BackendStep::Stopped(kind) => info!("{} stopped", kind),
            BackendStep::NothingRunning(kind) => info!("{} was not running", kind),
            BackendStep::Failed(e) => error!("Failed to stop VPN backend: {}", e),
        }
    }
}

pub struct CleanupCoordinator {
    iface: String,
    link: Arc<LinkControl>,
    store: IdentityStore,
    backend: Option<SharedBackend>,
}

impl CleanupCoordinator {
    pub fn new(iface: &str, link: Arc<LinkControl>, store: IdentityStore) -> Self {
        Self {
            iface: iface.to_string(),
            link,
            store,
            backend: None,
        }
    }

    pub fn with_backend(mut self, backend: SharedBackend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn run(&self) -> CleanupReport {
        debug!("Cleaning up {}", self.iface);
        let report = CleanupReport {
            interface: self.ensure_up(),
            mac: self.restore_mac(),
            backend: self.stop_backend(),
        };
        report.log(&self.iface);
        report
    }

    fn ensure_up(&self) -> InterfaceStep {
        match self.link.is_up(&self.iface) {
            Ok(true) => InterfaceStep::AlreadyUp,
            Ok(false) => {
                info!("Interface {} is down, bringing it back up", self.iface);
                match self.link.set_state(&self.iface, true) {
                    Ok(()) => InterfaceStep::BroughtUp,
                    Err(e) => {
                        error!("Failed to bring {} up: {}", self.iface, e);
                        InterfaceStep::Failed(e.to_string())
                    }
                }
            }
            Err(e) => {
                error!("Failed to check whether {} is up: {}", self.iface, e);
                InterfaceStep::Failed(e.to_string())
            }
        }
    }

    fn restore_mac(&self) -> MacStep {
        let primary = match self.store.load(&self.iface) {
            Ok(Some(mac)) => mac,
            Ok(None) => return MacStep::NoRecord,
            Err(e) => return MacStep::Failed(e.to_string()),
        };

        let current = match self.link.current(&self.iface) {
            Ok(mac) => mac,
            Err(e) => return MacStep::Failed(e.to_string()),
        };
        if current == primary {
            return MacStep::AlreadyPrimary(primary);
        }

        info!(
            "Current MAC {} differs from primary {}, restoring",
            current, primary
        );
        match self.link.apply(&self.iface, &primary) {
            Ok(_) => MacStep::Restored {
                from: current,
                to: primary,
            },
            Err(e) => MacStep::Failed(e.to_string()),
        }
    }

    fn stop_backend(&self) -> BackendStep {
        let Some(backend) = &self.backend else {
            return BackendStep::NotStarted;
        };
        // A task that panicked while holding the lock leaves it poisoned; the
        // backend itself is still usable for teardown.
        let mut backend = backend.lock().unwrap_or_else(PoisonError::into_inner);
        if backend.session().is_none() {
            return BackendStep::NotStarted;
        }

        let kind = backend.kind();
        match backend.stop() {
            Ok(StopOutcome::Stopped) => BackendStep::Stopped(kind),
            Ok(StopOutcome::NothingRunning) => BackendStep::NothingRunning(kind),
            Err(e) => BackendStep::Failed(e.to_string()),
        }
    }
}

/// Runs the coordinator at most once: explicitly, or on drop if the
/// process unwinds first.
pub struct CleanupGuard {
    coordinator: CleanupCoordinator,
    done: AtomicBool,
}

impl CleanupGuard {
    pub fn new(coordinator: CleanupCoordinator) -> Self {
        Self {
            coordinator,
            done: AtomicBool::new(false),
        }
    }

    /// Returns `None` if cleanup already ran
    pub fn run(&self) -> Option<CleanupReport> {
        if self.done.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(self.coordinator.run())
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.run().is_some() {
            warn!("Cleanup ran from an unexpected exit path");
        }
    }
}
