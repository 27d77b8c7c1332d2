use log::{debug, info, warn};
use std::path::Path;

use super::{
    start_error, BackendContext, BackendKind, ConfigPool, StopOutcome, VpnBackend,
    VpnSession,
};
use crate::errors::{ShiftError, ShiftResult};
use crate::network::wait_until_up;

/// Kernel WireGuard through `wg-quick`
pub struct WireGuard {
    ctx: BackendContext,
    session: Option<VpnSession>,
}

impl WireGuard {
    pub fn new(ctx: BackendContext) -> Self {
        Self { ctx, session: None }
    }

    /// Names reported by `wg show interfaces`. Any failure reads as none.
    pub fn active_interfaces(&self) -> Vec<String> {
        match self.ctx.runner.run("wg", &["show", "interfaces"]) {
            Ok(out) if out.success => parse_interfaces(&out.stdout),
            Ok(out) => {
                debug!("wg show failed: {}", out.stderr.trim());
                Vec::new()
            }
            Err(e) => {
                debug!("wg unavailable: {}", e);
                Vec::new()
            }
        }
    }

    /// `wg-quick down` needs the config path when it lives outside /etc/wireguard
    fn down_target(&self, name: &str) -> String {
        let path = self.ctx.pool.wireguard_dir().join(format!("{}.conf", name));
        if path.is_file() {
            path.display().to_string()
        } else {
            name.to_string()
        }
    }
}

fn interface_name(config: &Path) -> Option<String> {
    config.file_stem().map(|s| s.to_string_lossy().into_owned())
}

pub fn parse_interfaces(out: &str) -> Vec<String> {
    out.split_whitespace().map(str::to_string).collect()
}

impl VpnBackend for WireGuard {
    fn kind(&self) -> BackendKind {
        BackendKind::WireGuard
    }

    fn start(&mut self, iface: &str) -> ShiftResult<()> {
        let config = ConfigPool::pick(&self.ctx.pool.wireguard_configs(), "WireGuard")?;
        let path = config.display().to_string();

        self.ctx
            .runner
            .run_checked("wg-quick", &["up", &path])
            .map_err(|e| start_error(self.kind(), e))?;

        self.session = Some(VpnSession {
            kind: self.kind(),
            interface: interface_name(&config),
            config: Some(config),
        });

        if !wait_until_up(&self.ctx.link, iface, &self.ctx.cancel, self.ctx.poll) {
            return Err(ShiftError::Start {
                backend: self.kind().to_string(),
                reason: format!("cancelled while waiting for {} to come up", iface),
            });
        }

        info!("WireGuard started with {}", path);
        Ok(())
    }

    fn stop(&mut self) -> ShiftResult<StopOutcome> {
        let active = self.active_interfaces();
        self.session = None;
        if active.is_empty() {
            debug!("No active WireGuard interfaces found");
            return Ok(StopOutcome::NothingRunning);
        }

        let mut failures = Vec::new();
        for name in &active {
            let target = self.down_target(name);
            match self.ctx.runner.run_checked("wg-quick", &["down", &target]) {
                Ok(_) => info!("WireGuard interface {} stopped", name),
                Err(e) => {
                    warn!("Failed to stop WireGuard interface {}: {}", name, e);
                    failures.push(format!("{}: {}", name, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(StopOutcome::Stopped)
        } else {
            Err(ShiftError::Stop {
                backend: self.kind().to_string(),
                reason: failures.join("; "),
            })
        }
    }

    fn is_running(&self) -> bool {
        !self.active_interfaces().is_empty()
    }

    fn session(&self) -> Option<&VpnSession> {
        self.session.as_ref()
    }
}
