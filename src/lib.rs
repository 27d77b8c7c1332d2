//! # Stealth Shift
//!
//! Periodically rotates the MAC address of one network interface and the
//! active anonymity tunnel (WireGuard, OpenVPN or AnonSurf), checks that the
//! public IP actually moved, and on every exit path restores the original MAC
//! and tears down any tunnel it started.

pub mod cancel;
pub mod cleanup;
pub mod config;
pub mod engine;
pub mod errors;
pub mod ip;
pub mod mac;
pub mod network;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod vpn;

use serde::Deserialize;
use std::fmt;
use std::time::Duration;

// Re-export commonly used types and functions
pub use cancel::CancellationToken;
pub use cleanup::{CleanupCoordinator, CleanupGuard, CleanupReport};
pub use engine::{Engine, SingleShotReport};
pub use errors::{ShiftError, ShiftResult};
pub use ip::{IpChange, IpResolver, IpVerifier};
pub use mac::{is_valid_mac, validate_interface_name, MacAddress};
pub use network::{CommandOutput, CommandRunner, LinkControl, LinkMechanism, SystemRunner};
pub use scheduler::{RotationPolicy, Rotator};
pub use store::IdentityStore;
pub use vpn::{BackendKind, SharedBackend, StopOutcome, VpnBackend, VpnSession};

/// Shortest and longest allowed rotation interval in seconds
pub const MIN_INTERVAL_SECS: u64 = 10;
pub const MAX_INTERVAL_SECS: u64 = 3600;

/// What gets rotated on each tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RotationMode {
    /// MAC address only
    Mac,
    /// VPN backend only
    Vpn,
    /// MAC and VPN on independent timers with the same interval
    Both,
}

impl RotationMode {
    pub fn rotates_mac(self) -> bool {
        matches!(self, RotationMode::Mac | RotationMode::Both)
    }

    pub fn rotates_vpn(self) -> bool {
        matches!(self, RotationMode::Vpn | RotationMode::Both)
    }
}

impl fmt::Display for RotationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RotationMode::Mac => "mac",
            RotationMode::Vpn => "vpn",
            RotationMode::Both => "both",
        })
    }
}

/// Validated rotation settings, fixed once rotation starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationConfig {
    interval: Duration,
    mode: RotationMode,
}

impl RotationConfig {
    pub fn new(interval_secs: u64, mode: RotationMode) -> ShiftResult<Self> {
        if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&interval_secs) {
            return Err(ShiftError::InvalidConfiguration(format!(
                "rotation interval must be between {} and {} seconds, got {}",
                MIN_INTERVAL_SECS, MAX_INTERVAL_SECS, interval_secs
            )));
        }
        Ok(Self {
            interval: Duration::from_secs(interval_secs),
            mode,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn mode(&self) -> RotationMode {
        self.mode
    }
}
