//! One-shot operations on a single interface: pre-flight checks, primary MAC
//! capture and restore, manual MAC change, status.

use log::{error, info, warn};
use std::fmt;
use std::sync::{Arc, PoisonError};

use crate::cancel::CancellationToken;
use crate::errors::{ShiftError, ShiftResult};
use crate::mac::{validate_interface_name, MacAddress};
use crate::network::LinkControl;
use crate::retry::{retry, RetryOutcome, RetryPolicy};
use crate::store::IdentityStore;
use crate::vpn::SharedBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryOutcome {
    AlreadyPrimary(MacAddress),
    Restored { from: MacAddress, to: MacAddress },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceStatus {
    pub iface: String,
    pub current: MacAddress,
    pub primary: Option<MacAddress>,
    pub up: Option<bool>,
}

impl fmt::Display for InterfaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Current MAC address for {}: {}", self.iface, self.current)?;
        if self.primary == Some(self.current) {
            write!(f, " (primary)")?;
        }
        match self.primary {
            Some(p) if p != self.current => write!(f, "\nPrimary MAC address: {}", p)?,
            None => write!(f, "\nPrimary MAC address: not recorded")?,
            _ => {}
        }
        match self.up {
            Some(true) => write!(f, "\nLink: up"),
            Some(false) => write!(f, "\nLink: down"),
            None => write!(f, "\nLink: unknown"),
        }
    }
}

/// What a single-shot run managed to do before it was interrupted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SingleShotReport {
    /// Address the interface had before the change, if the change applied
    pub previous: Option<MacAddress>,
    pub vpn_started: bool,
}

pub struct Engine {
    iface: String,
    link: Arc<LinkControl>,
    store: IdentityStore,
}

impl Engine {
    pub fn new(iface: &str, link: Arc<LinkControl>, store: IdentityStore) -> Self {
        Self {
            iface: iface.to_string(),
            link,
            store,
        }
    }

    /// Interface name syntax and existence
    pub fn preflight(&self) -> ShiftResult<()> {
        validate_interface_name(&self.iface)?;
        if !self.link.exists(&self.iface) {
            return Err(ShiftError::InterfaceNotFound(self.iface.clone()));
        }
        Ok(())
    }

    /// The stored primary MAC, recording the current one first if there is
    /// no record yet. Failure here must abort: without a primary there is
    /// nothing to restore.
    pub fn capture_primary(&self) -> ShiftResult<MacAddress> {
        if let Some(primary) = self.store.load(&self.iface)? {
            return Ok(primary);
        }
        warn!(
            "No primary MAC address recorded for {}, saving the current one",
            self.iface
        );
        let current = self.link.current(&self.iface)?;
        self.store.save(&self.iface, &current)?;
        Ok(current)
    }

    /// Put the primary MAC back on the interface
    pub fn set_primary(&self) -> ShiftResult<PrimaryOutcome> {
        let primary = self.capture_primary()?;
        let current = self.link.current(&self.iface)?;
        if current == primary {
            info!("{} already uses its primary MAC {}", self.iface, primary);
            return Ok(PrimaryOutcome::AlreadyPrimary(primary));
        }
        self.link.apply(&self.iface, &primary)?;
        Ok(PrimaryOutcome::Restored {
            from: current,
            to: primary,
        })
    }

    /// Apply `mac`, making sure the primary is recorded first.
    /// Returns the address the interface had before.
    pub fn change_mac(&self, mac: &MacAddress) -> ShiftResult<MacAddress> {
        self.capture_primary()?;
        let previous = self.link.current(&self.iface)?;
        self.link.apply(&self.iface, mac)?;
        Ok(previous)
    }

    pub fn status(&self) -> ShiftResult<InterfaceStatus> {
        Ok(InterfaceStatus {
            iface: self.iface.clone(),
            current: self.link.current(&self.iface)?,
            primary: self.store.load(&self.iface)?,
            up: self.link.is_up(&self.iface).ok(),
        })
    }

    pub fn reset_primary(&self) -> ShiftResult<bool> {
        self.store.reset(&self.iface)
    }

    /// Start `backend` once, with the same bounded retry the scheduler uses
    pub fn start_vpn(
        &self,
        backend: &SharedBackend,
        policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> ShiftResult<()> {
        let mut guard = backend.lock().unwrap_or_else(PoisonError::into_inner);
        let kind = guard.kind();
        let label = format!("{} start", kind);
        match retry(&label, policy, cancel, |_| guard.start(&self.iface)) {
            RetryOutcome::Succeeded { .. } => Ok(()),
            RetryOutcome::Exhausted {
                last_error: Some(e),
                ..
            } => Err(e),
            RetryOutcome::Exhausted { attempts, .. } => Err(ShiftError::Start {
                backend: kind.to_string(),
                reason: format!("gave up after {} attempts", attempts),
            }),
            RetryOutcome::Cancelled { .. } => Err(ShiftError::Start {
                backend: kind.to_string(),
                reason: "cancelled".to_string(),
            }),
        }
    }

    /// Apply `mac`, optionally start `backend`, then hold until `cancel`
    /// fires. Neither failure ends the run; both are logged and reported.
    pub fn single_shot(
        &self,
        mac: &MacAddress,
        backend: Option<&SharedBackend>,
        policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> SingleShotReport {
        let mut report = SingleShotReport::default();
        match self.change_mac(mac) {
            Ok(previous) => {
                info!("{}: {} -> {}", self.iface, previous, mac);
                report.previous = Some(previous);
            }
            Err(e) => error!("Failed to change MAC address of {}: {}", self.iface, e),
        }
        if let Some(b) = backend {
            match self.start_vpn(b, policy, cancel) {
                Ok(()) => report.vpn_started = true,
                Err(e) => error!("VPN not started: {}", e),
            }
        }
        info!("Press CTRL+C to exit.");
        cancel.wait();
        report
    }
}
