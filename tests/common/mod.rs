//! Scripted stand-ins for the host: link state, external commands, VPN
//! backends and the public IP endpoint.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stealth_shift::{
    BackendKind, CommandOutput, CommandRunner, IpResolver, LinkControl, LinkMechanism,
    MacAddress, RotationPolicy, ShiftError, ShiftResult, StopOutcome, VpnBackend, VpnSession,
};
use stealth_shift::retry::RetryPolicy;

pub fn mac(s: &str) -> MacAddress {
    s.parse().unwrap()
}

/// Millisecond budgets so tick tests finish quickly
pub fn fast_policy() -> RotationPolicy {
    RotationPolicy {
        start: RetryPolicy::new(5, Duration::from_millis(5)),
        verify: RetryPolicy::new(3, Duration::from_millis(5)),
        poll: Duration::from_millis(5),
        countdown: false,
    }
}

#[derive(Debug)]
pub struct LinkState {
    pub exists: bool,
    pub mac: MacAddress,
    pub up: bool,
    /// Number of upcoming `apply_mac` calls that fail
    pub failing_applies: u32,
    pub fail_state_queries: bool,
    pub applied: Vec<MacAddress>,
    pub state_changes: Vec<bool>,
}

/// In-memory interface driven through the `LinkMechanism` seam
#[derive(Clone)]
pub struct FakeLink {
    pub state: Arc<Mutex<LinkState>>,
}

impl FakeLink {
    pub fn new(current: MacAddress) -> Self {
        Self {
            state: Arc::new(Mutex::new(LinkState {
                exists: true,
                mac: current,
                up: true,
                failing_applies: 0,
                fail_state_queries: false,
                applied: Vec::new(),
                state_changes: Vec::new(),
            })),
        }
    }

    pub fn control(&self) -> Arc<LinkControl> {
        Arc::new(LinkControl::new(vec![Box::new(self.clone())]))
    }

    pub fn current(&self) -> MacAddress {
        self.state.lock().unwrap().mac
    }

    pub fn applied(&self) -> Vec<MacAddress> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn set_up(&self, up: bool) {
        self.state.lock().unwrap().up = up;
    }

    pub fn is_up_now(&self) -> bool {
        self.state.lock().unwrap().up
    }

    pub fn fail_next_applies(&self, n: u32) {
        self.state.lock().unwrap().failing_applies = n;
    }
}

impl LinkMechanism for FakeLink {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn read_mac(&self, iface: &str) -> ShiftResult<MacAddress> {
        let state = self.state.lock().unwrap();
        if !state.exists {
            return Err(ShiftError::InterfaceNotFound(iface.to_string()));
        }
        Ok(state.mac)
    }

    fn is_up(&self, iface: &str) -> ShiftResult<bool> {
        let state = self.state.lock().unwrap();
        if !state.exists {
            return Err(ShiftError::InterfaceNotFound(iface.to_string()));
        }
        if state.fail_state_queries {
            return Err(ShiftError::Unknown("flags unavailable".to_string()));
        }
        Ok(state.up)
    }

    fn set_state(&self, iface: &str, up: bool) -> ShiftResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.exists {
            return Err(ShiftError::InterfaceNotFound(iface.to_string()));
        }
        state.up = up;
        state.state_changes.push(up);
        Ok(())
    }

    fn apply_mac(&self, iface: &str, mac: &MacAddress) -> ShiftResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.exists {
            return Err(ShiftError::InterfaceNotFound(iface.to_string()));
        }
        if state.failing_applies > 0 {
            state.failing_applies -= 1;
            return Err(ShiftError::CommandFailed {
                command: format!("set {}", iface),
                code: Some(1),
                stderr: "device busy".to_string(),
            });
        }
        state.mac = *mac;
        state.applied.push(*mac);
        Ok(())
    }
}

/// Canned command results keyed by the full command line
#[derive(Default)]
pub struct ScriptedRunner {
    responses: Mutex<Vec<(String, CommandOutput)>>,
    missing: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every later run of `command` returns `output`
    pub fn on(&self, command: &str, output: CommandOutput) {
        self.responses
            .lock()
            .unwrap()
            .push((command.to_string(), output));
    }

    /// `program` is not installed
    pub fn missing(&self, program: &str) {
        self.missing.lock().unwrap().push(program.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, command: &str) -> bool {
        self.calls().iter().any(|c| c == command)
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[&str]) -> ShiftResult<CommandOutput> {
        let line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.lock().unwrap().push(line.clone());

        if self.missing.lock().unwrap().iter().any(|p| p == program) {
            return Err(ShiftError::ToolNotFound(program.to_string()));
        }
        let responses = self.responses.lock().unwrap();
        Ok(responses
            .iter()
            .rev()
            .find(|(cmd, _)| *cmd == line)
            .map(|(_, out)| out.clone())
            .unwrap_or_else(|| CommandOutput::failed(1, "")))
    }
}

/// Counters shared between a fake backend and the test
#[derive(Debug, Default)]
pub struct BackendProbe {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    /// Sessions currently up across every fake backend sharing this probe
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
}

impl BackendProbe {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

pub struct FakeBackend {
    kind: BackendKind,
    probe: Arc<BackendProbe>,
    /// Number of upcoming starts that fail; `u32::MAX` fails forever
    failing_starts: u32,
    fail_stop: bool,
    up: usize,
    session: Option<VpnSession>,
}

impl FakeBackend {
    pub fn new(kind: BackendKind, probe: Arc<BackendProbe>) -> Self {
        Self {
            kind,
            probe,
            failing_starts: 0,
            fail_stop: false,
            up: 0,
            session: None,
        }
    }

    pub fn failing_starts(mut self, n: u32) -> Self {
        self.failing_starts = n;
        self
    }

    pub fn failing_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }
}

impl VpnBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn start(&mut self, _iface: &str) -> ShiftResult<()> {
        self.probe.starts.fetch_add(1, Ordering::SeqCst);
        if self.failing_starts > 0 {
            if self.failing_starts != u32::MAX {
                self.failing_starts -= 1;
            }
            return Err(ShiftError::Start {
                backend: self.kind.to_string(),
                reason: "handshake timed out".to_string(),
            });
        }
        // Starting over a live session counts twice on purpose
        let live = self.probe.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_live.fetch_max(live, Ordering::SeqCst);
        self.up += 1;
        self.session = Some(VpnSession {
            kind: self.kind,
            config: None,
            interface: None,
        });
        Ok(())
    }

    fn stop(&mut self) -> ShiftResult<StopOutcome> {
        self.probe.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop {
            return Err(ShiftError::Stop {
                backend: self.kind.to_string(),
                reason: "permission denied".to_string(),
            });
        }
        self.session = None;
        if self.up == 0 {
            return Ok(StopOutcome::NothingRunning);
        }
        self.probe.live.fetch_sub(self.up, Ordering::SeqCst);
        self.up = 0;
        Ok(StopOutcome::Stopped)
    }

    fn is_running(&self) -> bool {
        self.up > 0
    }

    fn session(&self) -> Option<&VpnSession> {
        self.session.as_ref()
    }
}

/// Replays a list of lookups, then keeps returning the last one.
/// `None` entries are fetch failures.
pub struct ScriptedResolver {
    script: Mutex<VecDeque<Option<String>>>,
    last: Mutex<Option<String>>,
    pub calls: Arc<AtomicUsize>,
}

impl ScriptedResolver {
    pub fn new(script: &[Option<&str>]) -> Self {
        Self {
            script: Mutex::new(script.iter().map(|s| s.map(str::to_string)).collect()),
            last: Mutex::new(None),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl IpResolver for ScriptedResolver {
    fn fetch(&self) -> ShiftResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        let value = match next {
            Some(v) => {
                *last = v.clone();
                v
            }
            None => last.clone(),
        };
        value.ok_or_else(|| ShiftError::Fetch("connection refused".to_string()))
    }
}
