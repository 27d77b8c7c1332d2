use log::{debug, info, warn};
use std::sync::Arc;

use super::{start_error, stop_error, BackendKind, ConfigPool, StopOutcome, VpnBackend, VpnSession};
use crate::errors::ShiftResult;
use crate::network::CommandRunner;

/// OpenVPN client launched as a daemon.
///
/// `start` returns once the daemon is spawned; whether the tunnel actually
/// came up is left to the public IP check.
pub struct OpenVpn {
    runner: Arc<dyn CommandRunner>,
    pool: ConfigPool,
    session: Option<VpnSession>,
}

impl OpenVpn {
    pub fn new(runner: Arc<dyn CommandRunner>, pool: ConfigPool) -> Self {
        Self {
            runner,
            pool,
            session: None,
        }
    }

    /// PIDs of every running `openvpn` process
    pub fn process_ids(&self) -> ShiftResult<Vec<String>> {
        let out = self.runner.run("pgrep", &["-x", "openvpn"])?;
        // pgrep exits 1 when nothing matches
        if !out.success {
            return Ok(Vec::new());
        }
        Ok(parse_pids(&out.stdout))
    }
}

pub fn parse_pids(out: &str) -> Vec<String> {
    out.split_whitespace()
        .filter(|t| t.parse::<u32>().is_ok())
        .map(str::to_string)
        .collect()
}

impl VpnBackend for OpenVpn {
    fn kind(&self) -> BackendKind {
        BackendKind::OpenVpn
    }

    fn start(&mut self, _iface: &str) -> ShiftResult<()> {
        let config = ConfigPool::pick(&self.pool.openvpn_configs(), "OpenVPN")?;
        if let Some(auth) = ConfigPool::slot_of(&config).map(|n| self.pool.auth_file(n)) {
            if !auth.is_file() {
                warn!("Credentials file {:?} is missing, OpenVPN may prompt and fail", auth);
            }
        }

        // auth-user-pass paths inside the configs are relative to the pool root
        let root = self.pool.root().display().to_string();
        let relative = config
            .strip_prefix(self.pool.root())
            .unwrap_or(&config)
            .display()
            .to_string();

        self.runner
            .run_checked("openvpn", &["--cd", &root, "--config", &relative, "--daemon"])
            .map_err(|e| start_error(self.kind(), e))?;

        info!("OpenVPN daemon launched with {}", relative);
        self.session = Some(VpnSession {
            kind: self.kind(),
            config: Some(config),
            interface: None,
        });
        Ok(())
    }

    fn stop(&mut self) -> ShiftResult<StopOutcome> {
        self.session = None;
        let pids = self.process_ids().map_err(|e| stop_error(self.kind(), e))?;
        if pids.is_empty() {
            debug!("No OpenVPN processes found");
            return Ok(StopOutcome::NothingRunning);
        }

        let args: Vec<&str> = pids.iter().map(String::as_str).collect();
        self.runner
            .run_checked("kill", &args)
            .map_err(|e| stop_error(self.kind(), e))?;
        info!("Stopped OpenVPN (pids {})", pids.join(", "));
        Ok(StopOutcome::Stopped)
    }

    fn is_running(&self) -> bool {
        self.process_ids().map(|p| !p.is_empty()).unwrap_or(false)
    }

    fn session(&self) -> Option<&VpnSession> {
        self.session.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_parsing_skips_noise() {
        assert_eq!(parse_pids("123\n456\n"), vec!["123", "456"]);
        assert!(parse_pids("").is_empty());
        assert_eq!(parse_pids("12 abc 7"), vec!["12", "7"]);
    }
}
