//! Periodic MAC and VPN rotation.
//!
//! Each rotation kind runs on its own thread and is the only writer of its
//! resource: the MAC task owns the interface address, the VPN task owns the
//! backend. Besides the cancellation token and read-only configuration the
//! threads share only their published next-tick deadlines, each written by
//! its own task and read by the countdown.

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::cancel::CancellationToken;
use crate::errors::{ShiftError, ShiftResult};
use crate::ip::{IpChange, IpVerifier};
use crate::mac::MacAddress;
use crate::network::{wait_until_up, LinkControl};
use crate::retry::{retry, RetryOutcome, RetryPolicy};
use crate::vpn::{SharedBackend, StopOutcome};
use crate::{RotationConfig, RotationMode};

/// Retry budgets and poll intervals used inside rotation ticks
#[derive(Debug, Clone, Copy)]
pub struct RotationPolicy {
    /// Backend start attempts per VPN tick
    pub start: RetryPolicy,
    /// Public IP checks after a successful start
    pub verify: RetryPolicy,
    /// Interface-up poll interval
    pub poll: Duration,
    /// Render the countdown line in `both` mode
    pub countdown: bool,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            start: RetryPolicy::new(5, Duration::from_secs(3)),
            verify: RetryPolicy::new(5, Duration::from_secs(5)),
            poll: Duration::from_secs(1),
            countdown: true,
        }
    }
}

/// Result of one VPN rotation tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VpnTickOutcome {
    /// New backend started and the public IP was checked
    Rotated(IpChange),
    /// New backend started, no baseline to compare against
    Unverified,
    /// Every start attempt failed; the tick was skipped
    StartAbandoned,
    Cancelled,
}

/// Per-task tick counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub ticks: u32,
    pub succeeded: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RotationSummary {
    pub mac: TaskStats,
    pub vpn: TaskStats,
    /// Tasks that panicked instead of returning
    pub panicked: Vec<&'static str>,
}

/// Next tick deadline of each task, in millis since the run started.
/// `u64::MAX` means the task has not published one.
struct Deadlines {
    started: Instant,
    mac: AtomicU64,
    vpn: AtomicU64,
}

impl Deadlines {
    fn new(started: Instant) -> Self {
        Self {
            started,
            mac: AtomicU64::new(u64::MAX),
            vpn: AtomicU64::new(u64::MAX),
        }
    }

    /// Record that the task owning `slot` fires again `interval` from now
    fn publish(&self, slot: &AtomicU64, interval: Duration) {
        let at = self.started.elapsed() + interval;
        slot.store(at.as_millis() as u64, Ordering::SeqCst);
    }

    /// Earliest published deadline
    fn next(&self) -> Option<u64> {
        let at = self
            .mac
            .load(Ordering::SeqCst)
            .min(self.vpn.load(Ordering::SeqCst));
        (at != u64::MAX).then_some(at)
    }

    fn remaining(&self) -> Option<Duration> {
        self.next()
            .map(|at| remaining_until(at, self.started.elapsed()))
    }
}

/// Cancels the whole run if the owning task unwinds
struct CancelOnPanic<'a>(&'a CancellationToken);

impl Drop for CancelOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.cancel();
        }
    }
}

pub struct Rotator {
    iface: String,
    config: RotationConfig,
    policy: RotationPolicy,
    link: Arc<LinkControl>,
    backend: Option<SharedBackend>,
    verifier: Option<Arc<IpVerifier>>,
    cancel: CancellationToken,
}

impl Rotator {
    pub fn new(
        iface: &str,
        config: RotationConfig,
        link: Arc<LinkControl>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            iface: iface.to_string(),
            config,
            policy: RotationPolicy::default(),
            link,
            backend: None,
            verifier: None,
            cancel,
        }
    }

    pub fn with_policy(mut self, policy: RotationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_backend(mut self, backend: SharedBackend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<IpVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Run until the cancellation token fires, then join every task.
    pub fn run(&self) -> ShiftResult<RotationSummary> {
        let mode = self.config.mode();
        let backend = match (&self.backend, mode.rotates_vpn()) {
            (Some(b), true) => Some(b),
            (None, true) => {
                return Err(ShiftError::InvalidConfiguration(format!(
                    "rotation mode '{}' needs a VPN backend",
                    mode
                )))
            }
            (_, false) => None,
        };

        let baseline = match (&self.verifier, backend) {
            (Some(verifier), Some(_)) => match verifier.fetch() {
                Ok(ip) => {
                    info!("Baseline public IP: {}", ip);
                    Some(ip)
                }
                Err(e) => {
                    warn!(
                        "Could not capture baseline public IP, rotations will not be verified: {}",
                        e
                    );
                    None
                }
            },
            _ => None,
        };

        info!(
            "Starting {} rotation on {} every {:?}",
            mode,
            self.iface,
            self.config.interval()
        );
        let deadlines = Deadlines::new(Instant::now());
        let deadlines = &deadlines;
        let mut summary = RotationSummary::default();

        let baseline = baseline.as_deref();
        let spawn_failed = |e: io::Error| {
            // Tasks already spawned only return once cancelled
            self.cancel.cancel();
            ShiftError::from(e)
        };

        thread::scope(|s| -> ShiftResult<()> {
            let mac = if mode.rotates_mac() {
                Some(
                    thread::Builder::new()
                        .name("mac-rotation".into())
                        .spawn_scoped(s, move || self.mac_task(deadlines))
                        .map_err(spawn_failed)?,
                )
            } else {
                None
            };

            let vpn = match backend {
                Some(b) => Some(
                    thread::Builder::new()
                        .name("vpn-rotation".into())
                        .spawn_scoped(s, move || self.vpn_task(b, baseline, deadlines))
                        .map_err(spawn_failed)?,
                ),
                None => None,
            };

            let countdown = if mode == RotationMode::Both && self.policy.countdown {
                Some(
                    thread::Builder::new()
                        .name("countdown".into())
                        .spawn_scoped(s, move || self.countdown_task(deadlines))
                        .map_err(spawn_failed)?,
                )
            } else {
                None
            };

            if let Some(h) = mac {
                match h.join() {
                    Ok(stats) => summary.mac = stats,
                    Err(_) => summary.panicked.push("mac-rotation"),
                }
            }
            if let Some(h) = vpn {
                match h.join() {
                    Ok(stats) => summary.vpn = stats,
                    Err(_) => summary.panicked.push("vpn-rotation"),
                }
            }
            if let Some(h) = countdown {
                if h.join().is_err() {
                    summary.panicked.push("countdown");
                }
            }
            Ok(())
        })?;

        for task in &summary.panicked {
            error!("Rotation task {} panicked", task);
        }
        info!(
            "Rotation stopped: MAC {}/{} ticks succeeded, VPN {}/{} ticks succeeded",
            summary.mac.succeeded, summary.mac.ticks, summary.vpn.succeeded, summary.vpn.ticks
        );
        Ok(summary)
    }

    /// Generate and apply one random MAC
    pub fn mac_tick(&self) -> ShiftResult<MacAddress> {
        let mac = MacAddress::generate();
        self.link.apply(&self.iface, &mac)?;
        Ok(mac)
    }

    fn mac_task(&self, deadlines: &Deadlines) -> TaskStats {
        let _guard = CancelOnPanic(&self.cancel);
        let mut stats = TaskStats::default();
        while !self.cancel.is_cancelled() {
            stats.ticks += 1;
            match self.mac_tick() {
                Ok(mac) => {
                    stats.succeeded += 1;
                    info!("MAC rotation #{}: {} is now {}", stats.ticks, self.iface, mac);
                }
                Err(e) => {
                    stats.failed += 1;
                    error!("MAC rotation #{} failed: {}", stats.ticks, e);
                }
            }
            deadlines.publish(&deadlines.mac, self.config.interval());
            if self.cancel.sleep(self.config.interval()) {
                break;
            }
        }
        debug!("MAC rotation task exiting");
        stats
    }

    /// Stop the old tunnel, wait for the interface, start a new tunnel with
    /// bounded retries, then check the public IP.
    pub fn vpn_tick(&self, backend: &SharedBackend, baseline: Option<&str>) -> VpnTickOutcome {
        let mut guard = backend.lock().unwrap_or_else(PoisonError::into_inner);
        let kind = guard.kind();

        match guard.stop() {
            Ok(StopOutcome::Stopped) => info!("Stopped previous {} session", kind),
            Ok(StopOutcome::NothingRunning) => debug!("No {} session to stop", kind),
            Err(e) => warn!("Ignoring stop failure: {}", e),
        }

        if !wait_until_up(&self.link, &self.iface, &self.cancel, self.policy.poll) {
            return VpnTickOutcome::Cancelled;
        }

        let label = format!("{} start", kind);
        match retry(&label, self.policy.start, &self.cancel, |_| guard.start(&self.iface)) {
            RetryOutcome::Succeeded { attempts, .. } => {
                info!("{} started (attempt {})", kind, attempts);
            }
            RetryOutcome::Exhausted { attempts, .. } => {
                error!(
                    "{} failed to start after {} attempts, skipping this rotation",
                    kind, attempts
                );
                return VpnTickOutcome::StartAbandoned;
            }
            RetryOutcome::Cancelled { .. } => return VpnTickOutcome::Cancelled,
        }
        drop(guard);

        match (&self.verifier, baseline) {
            (Some(verifier), Some(baseline)) => VpnTickOutcome::Rotated(verifier.wait_for_change(
                baseline,
                self.policy.verify,
                &self.cancel,
            )),
            _ => VpnTickOutcome::Unverified,
        }
    }

    fn vpn_task(
        &self,
        backend: &SharedBackend,
        baseline: Option<&str>,
        deadlines: &Deadlines,
    ) -> TaskStats {
        let _guard = CancelOnPanic(&self.cancel);
        let mut stats = TaskStats::default();
        while !self.cancel.is_cancelled() {
            stats.ticks += 1;
            match self.vpn_tick(backend, baseline) {
                VpnTickOutcome::Rotated(IpChange::Changed(ip)) => {
                    stats.succeeded += 1;
                    info!("VPN rotation #{}: public IP is now {}", stats.ticks, ip);
                }
                VpnTickOutcome::Rotated(IpChange::Unchanged) => {
                    stats.succeeded += 1;
                    warn!("VPN rotation #{}: public IP did not change", stats.ticks);
                }
                VpnTickOutcome::Unverified => {
                    stats.succeeded += 1;
                    info!("VPN rotation #{} done (unverified)", stats.ticks);
                }
                VpnTickOutcome::StartAbandoned => stats.failed += 1,
                VpnTickOutcome::Cancelled => break,
            }
            deadlines.publish(&deadlines.vpn, self.config.interval());
            if self.cancel.sleep(self.config.interval()) {
                break;
            }
        }
        debug!("VPN rotation task exiting");
        stats
    }

    fn countdown_task(&self, deadlines: &Deadlines) {
        let mut out = io::stdout();
        while !self.cancel.sleep(Duration::from_secs(1)) {
            // Nothing to show while the first ticks are still running
            let Some(remaining) = deadlines.remaining() else {
                continue;
            };
            let _ = write!(out, "\r{}", format_countdown(remaining, Local::now()));
            let _ = out.flush();
        }
        let _ = writeln!(out);
    }
}

/// Time left until `deadline_ms`, both measured from the start of the run.
/// A deadline already passed means a tick is in progress.
pub fn remaining_until(deadline_ms: u64, elapsed: Duration) -> Duration {
    Duration::from_millis(deadline_ms).saturating_sub(elapsed)
}

pub fn format_countdown(remaining: Duration, now: DateTime<Local>) -> String {
    let secs = remaining.as_secs();
    let at = now + chrono::Duration::seconds(secs as i64);
    format!(
        "Next rotation in {:02}:{:02} (at {})",
        secs / 60,
        secs % 60,
        at.format("%H:%M:%S")
    )
}
