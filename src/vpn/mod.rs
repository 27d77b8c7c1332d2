//! Interchangeable VPN backends.
//!
//! The backend is chosen once from a [`BackendKind`] and driven through the
//! [`VpnBackend`] trait afterwards. Backends never check for each other; the
//! scheduler stops the running session before it starts the next one.

pub mod anonsurf;
pub mod openvpn;
pub mod pool;
pub mod wireguard;

use log::{info, warn};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::errors::{ShiftError, ShiftResult};
use crate::network::{CommandRunner, LinkControl};

pub use anonsurf::AnonSurf;
pub use openvpn::OpenVpn;
pub use pool::ConfigPool;
pub use wireguard::WireGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[value(name = "wireguard", alias = "wg")]
    WireGuard,
    #[value(name = "openvpn")]
    OpenVpn,
    #[value(name = "anonsurf")]
    AnonSurf,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [
        BackendKind::WireGuard,
        BackendKind::OpenVpn,
        BackendKind::AnonSurf,
    ];
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::WireGuard => "WireGuard",
            BackendKind::OpenVpn => "OpenVPN",
            BackendKind::AnonSurf => "AnonSurf",
        })
    }
}

/// The tunnel most recently started by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnSession {
    pub kind: BackendKind,
    /// Config slot used, if the backend has slots
    pub config: Option<PathBuf>,
    /// Tunnel interface name, if the backend creates one
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NothingRunning,
}

pub trait VpnBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Bring a tunnel up for traffic leaving `iface`
    fn start(&mut self, iface: &str) -> ShiftResult<()>;

    /// Tear down whatever this backend has running. Nothing running is
    /// `Ok(StopOutcome::NothingRunning)`.
    fn stop(&mut self) -> ShiftResult<StopOutcome>;

    fn is_running(&self) -> bool;

    /// Session started by this instance and not yet stopped
    fn session(&self) -> Option<&VpnSession>;
}

/// A backend shared between the rotation task and cleanup
pub type SharedBackend = Arc<Mutex<Box<dyn VpnBackend>>>;

pub fn shared(backend: Box<dyn VpnBackend>) -> SharedBackend {
    Arc::new(Mutex::new(backend))
}

/// Everything a backend needs from the host
#[derive(Clone)]
pub struct BackendContext {
    pub runner: Arc<dyn CommandRunner>,
    pub link: Arc<LinkControl>,
    pub pool: ConfigPool,
    pub cancel: CancellationToken,
    /// Poll interval while waiting for an interface to come up
    pub poll: Duration,
}

impl BackendKind {
    pub fn build(self, ctx: &BackendContext) -> Box<dyn VpnBackend> {
        match self {
            BackendKind::WireGuard => Box::new(WireGuard::new(ctx.clone())),
            BackendKind::OpenVpn => Box::new(OpenVpn::new(ctx.runner.clone(), ctx.pool.clone())),
            BackendKind::AnonSurf => Box::new(AnonSurf::new(ctx.runner.clone())),
        }
    }
}

pub(crate) fn start_error(kind: BackendKind, err: ShiftError) -> ShiftError {
    match err {
        ShiftError::Start { .. } => err,
        other => ShiftError::Start {
            backend: kind.to_string(),
            reason: other.to_string(),
        },
    }
}

pub(crate) fn stop_error(kind: BackendKind, err: ShiftError) -> ShiftError {
    match err {
        ShiftError::Stop { .. } => err,
        other => ShiftError::Stop {
            backend: kind.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Stop every backend regardless of which process started it
pub fn stop_all(ctx: &BackendContext) -> Vec<(BackendKind, ShiftResult<StopOutcome>)> {
    BackendKind::ALL
        .iter()
        .map(|kind| {
            let result = kind.build(ctx).stop();
            match &result {
                Ok(StopOutcome::Stopped) => info!("Stopped {} successfully", kind),
                Ok(StopOutcome::NothingRunning) => info!("No active {} service found", kind),
                Err(e) => warn!("{}", e),
            }
            (*kind, result)
        })
        .collect()
}
