use log::{debug, info};
use std::sync::Arc;

use super::{start_error, stop_error, BackendKind, StopOutcome, VpnBackend, VpnSession};
use crate::errors::ShiftResult;
use crate::network::CommandRunner;

/// Tor routing through the external `anonsurf` controller. No config slots.
pub struct AnonSurf {
    runner: Arc<dyn CommandRunner>,
    session: Option<VpnSession>,
}

impl AnonSurf {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            session: None,
        }
    }

    /// Ask the controller for a fresh Tor identity
    pub fn change(&self) -> ShiftResult<()> {
        self.runner
            .run_checked("anonsurf", &["change"])
            .map_err(|e| start_error(self.kind(), e))?;
        info!("AnonSurf identity changed");
        Ok(())
    }
}

/// "active" without "inactive" means running
pub fn parse_status(out: &str) -> bool {
    let lower = out.to_lowercase();
    lower.contains("active") && !lower.contains("inactive")
}

impl VpnBackend for AnonSurf {
    fn kind(&self) -> BackendKind {
        BackendKind::AnonSurf
    }

    fn start(&mut self, _iface: &str) -> ShiftResult<()> {
        self.runner
            .run_checked("anonsurf", &["start"])
            .map_err(|e| start_error(self.kind(), e))?;
        info!("AnonSurf started");
        self.session = Some(VpnSession {
            kind: self.kind(),
            config: None,
            interface: None,
        });
        Ok(())
    }

    fn stop(&mut self) -> ShiftResult<StopOutcome> {
        self.session = None;
        if !self.is_running() {
            debug!("AnonSurf is not active");
            return Ok(StopOutcome::NothingRunning);
        }
        self.runner
            .run_checked("anonsurf", &["stop"])
            .map_err(|e| stop_error(self.kind(), e))?;
        info!("AnonSurf stopped");
        Ok(StopOutcome::Stopped)
    }

    fn is_running(&self) -> bool {
        match self.runner.run("anonsurf", &["status"]) {
            Ok(out) => parse_status(&out.stdout),
            Err(e) => {
                debug!("anonsurf status failed: {}", e);
                false
            }
        }
    }

    fn session(&self) -> Option<&VpnSession> {
        self.session.as_ref()
    }
}
