//! External command surface and link-layer control of a single interface.
//!
//! MAC reads and writes go through an ordered list of [`LinkMechanism`]s:
//! the direct ioctl path first, then `ifconfig`, then `ip link`. The first
//! mechanism that succeeds wins.

use log::{debug, info, warn};
use std::io;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::errors::{ShiftError, ShiftResult};
use crate::mac::MacAddress;

/// Captured result of an external command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: &str) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: &str) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

/// Runs external tools. Every network, tunnel and process command goes
/// through this so tests can script the system.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`. A missing binary is `ToolNotFound`; a
    /// non-zero exit is returned as an unsuccessful [`CommandOutput`].
    fn run(&self, program: &str, args: &[&str]) -> ShiftResult<CommandOutput>;

    /// Like [`CommandRunner::run`] but a non-zero exit is `CommandFailed`
    fn run_checked(&self, program: &str, args: &[&str]) -> ShiftResult<CommandOutput> {
        let output = self.run(program, args)?;
        if output.success {
            Ok(output)
        } else {
            Err(ShiftError::CommandFailed {
                command: format!("{} {}", program, args.join(" ")),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

/// Runs commands on the host, optionally through `sudo`
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    sudo: bool,
}

impl SystemRunner {
    pub fn new(sudo: bool) -> Self {
        Self { sudo }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> ShiftResult<CommandOutput> {
        let mut cmd = if self.sudo {
            let mut c = Command::new("sudo");
            c.arg(program);
            c
        } else {
            Command::new(program)
        };
        cmd.args(args).stdin(Stdio::null());

        debug!("Executing command: {:?}", cmd);
        let output = cmd.output().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ShiftError::ToolNotFound(program.to_string()),
            _ => ShiftError::IOError(e),
        })?;

        let result = CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.success {
            debug!(
                "Command {} exited with {:?}: {}",
                program,
                result.code,
                result.stderr.trim()
            );
        }
        Ok(result)
    }
}

/// One way of reading and changing an interface's link-layer state
#[cfg_attr(test, mockall::automock)]
pub trait LinkMechanism: Send + Sync {
    fn name(&self) -> &'static str;
    fn read_mac(&self, iface: &str) -> ShiftResult<MacAddress>;
    fn is_up(&self, iface: &str) -> ShiftResult<bool>;
    fn set_state(&self, iface: &str, up: bool) -> ShiftResult<()>;
    fn apply_mac(&self, iface: &str, mac: &MacAddress) -> ShiftResult<()>;
}

/// Ordered chain of link mechanisms for one host
pub struct LinkControl {
    mechanisms: Vec<Box<dyn LinkMechanism>>,
}

impl LinkControl {
    pub fn new(mechanisms: Vec<Box<dyn LinkMechanism>>) -> Self {
        Self { mechanisms }
    }

    /// ioctl, then `ifconfig`, then `ip link`
    pub fn system(runner: Arc<dyn CommandRunner>) -> Self {
        Self::new(vec![
            Box::new(IoctlLink),
            Box::new(IfconfigLink::new(runner.clone())),
            Box::new(IpLink::new(runner)),
        ])
    }

    pub fn mechanism_names(&self) -> Vec<&'static str> {
        self.mechanisms.iter().map(|m| m.name()).collect()
    }

    /// Try each mechanism in order. A missing interface stops the chain.
    fn first_success<T>(
        &self,
        what: &str,
        iface: &str,
        op: impl Fn(&dyn LinkMechanism) -> ShiftResult<T>,
    ) -> Result<(T, &'static str), ShiftError> {
        let mut failures = Vec::new();
        for mechanism in &self.mechanisms {
            match op(mechanism.as_ref()) {
                Ok(value) => return Ok((value, mechanism.name())),
                Err(e) if e.is_not_found() => return Err(e),
                Err(e) => {
                    debug!("{} on {} via {} failed: {}", what, iface, mechanism.name(), e);
                    failures.push(format!("{}: {}", mechanism.name(), e));
                }
            }
        }
        if failures.is_empty() {
            failures.push("no mechanisms configured".to_string());
        }
        Err(ShiftError::InterfaceQuery {
            iface: iface.to_string(),
            reason: failures.join("; "),
        })
    }

    /// Check if a given interface exists
    pub fn exists(&self, iface: &str) -> bool {
        match self.first_success("existence check", iface, |m| m.is_up(iface)) {
            Ok(_) => true,
            Err(e) => {
                debug!("Interface {} unavailable: {}", iface, e);
                false
            }
        }
    }

    /// Current MAC of `iface`
    pub fn current(&self, iface: &str) -> ShiftResult<MacAddress> {
        let (mac, via) = self.first_success("MAC query", iface, |m| m.read_mac(iface))?;
        debug!("Current MAC of {} is {} (via {})", iface, mac, via);
        Ok(mac)
    }

    pub fn is_up(&self, iface: &str) -> ShiftResult<bool> {
        self.first_success("state query", iface, |m| m.is_up(iface))
            .map(|(up, _)| up)
    }

    pub fn set_state(&self, iface: &str, up: bool) -> ShiftResult<()> {
        let (_, via) = self.first_success("state change", iface, |m| m.set_state(iface, up))?;
        debug!("Set {} {} via {}", iface, if up { "up" } else { "down" }, via);
        Ok(())
    }

    /// Apply `mac` to `iface`, returning the name of the mechanism that worked.
    ///
    /// The interface may be briefly down while this runs.
    pub fn apply(&self, iface: &str, mac: &MacAddress) -> ShiftResult<&'static str> {
        match self.first_success("MAC change", iface, |m| m.apply_mac(iface, mac)) {
            Ok((_, via)) => {
                info!("MAC address of {} changed to {} using {}", iface, mac, via);
                Ok(via)
            }
            Err(ShiftError::InterfaceQuery { reason, .. }) => Err(ShiftError::Apply {
                iface: iface.to_string(),
                mac: mac.to_string(),
                reason,
            }),
            Err(e) => Err(e),
        }
    }
}

/// Poll until `iface` reports up. Returns false if cancelled first.
pub fn wait_until_up(
    link: &LinkControl,
    iface: &str,
    cancel: &CancellationToken,
    poll: Duration,
) -> bool {
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        match link.is_up(iface) {
            Ok(true) => return true,
            Ok(false) => debug!("Waiting for {} to come up", iface),
            Err(e) => warn!("Could not read state of {}: {}", iface, e),
        }
        if cancel.sleep(poll) {
            return false;
        }
    }
}

const IFNAMSIZ: usize = libc::IFNAMSIZ;

#[repr(C)]
struct IfReqFlags {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 24 - std::mem::size_of::<libc::c_short>()],
}

#[repr(C)]
struct IfReqHwaddr {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_hwaddr: libc::sockaddr,
    _pad: [u8; 24 - std::mem::size_of::<libc::sockaddr>()],
}

/// Datagram socket used only as an ioctl handle
struct IoctlSocket(libc::c_int);

impl IoctlSocket {
    fn open() -> io::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(fd))
    }
}

impl Drop for IoctlSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

fn write_ifname(dst: &mut [libc::c_char; IFNAMSIZ], name: &str) -> ShiftResult<()> {
    if name.len() >= IFNAMSIZ {
        return Err(ShiftError::Validation(format!(
            "interface name too long: {}",
            name
        )));
    }
    for b in dst.iter_mut() {
        *b = 0;
    }
    for (i, b) in name.as_bytes().iter().enumerate() {
        dst[i] = *b as libc::c_char;
    }
    Ok(())
}

fn ioctl_error(iface: &str, op: &str, err: io::Error) -> ShiftError {
    match err.raw_os_error() {
        Some(libc::ENODEV) | Some(libc::ENXIO) => ShiftError::InterfaceNotFound(iface.to_string()),
        Some(libc::EPERM) | Some(libc::EACCES) => ShiftError::InsufficientPermissions,
        _ => ShiftError::InterfaceQuery {
            iface: iface.to_string(),
            reason: format!("{}: {}", op, err),
        },
    }
}

/// Direct kernel access through `SIOC[GS]IFHWADDR` and `SIOC[GS]IFFLAGS`
pub struct IoctlLink;

impl IoctlLink {
    fn flags(sock: &IoctlSocket, iface: &str) -> ShiftResult<IfReqFlags> {
        let mut ifr = IfReqFlags {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: 0,
            _pad: [0; 24 - std::mem::size_of::<libc::c_short>()],
        };
        write_ifname(&mut ifr.ifr_name, iface)?;
        let ret = unsafe { libc::ioctl(sock.0, libc::SIOCGIFFLAGS as _, &mut ifr) };
        if ret < 0 {
            return Err(ioctl_error(iface, "SIOCGIFFLAGS", io::Error::last_os_error()));
        }
        Ok(ifr)
    }
}

impl LinkMechanism for IoctlLink {
    fn name(&self) -> &'static str {
        "ioctl"
    }

    fn read_mac(&self, iface: &str) -> ShiftResult<MacAddress> {
        let sock = IoctlSocket::open()?;
        let mut ifr = IfReqHwaddr {
            ifr_name: [0; IFNAMSIZ],
            ifr_hwaddr: libc::sockaddr {
                sa_family: 0,
                sa_data: [0; 14],
            },
            _pad: [0; 24 - std::mem::size_of::<libc::sockaddr>()],
        };
        write_ifname(&mut ifr.ifr_name, iface)?;

        let ret = unsafe { libc::ioctl(sock.0, libc::SIOCGIFHWADDR as _, &mut ifr) };
        if ret < 0 {
            return Err(ioctl_error(iface, "SIOCGIFHWADDR", io::Error::last_os_error()));
        }

        let mut mac = [0u8; 6];
        for (i, slot) in mac.iter_mut().enumerate() {
            *slot = ifr.ifr_hwaddr.sa_data[i] as u8;
        }
        Ok(MacAddress::new(mac))
    }

    fn is_up(&self, iface: &str) -> ShiftResult<bool> {
        let sock = IoctlSocket::open()?;
        let ifr = Self::flags(&sock, iface)?;
        Ok(ifr.ifr_flags & libc::IFF_UP as libc::c_short != 0)
    }

    fn set_state(&self, iface: &str, up: bool) -> ShiftResult<()> {
        let sock = IoctlSocket::open()?;
        let mut ifr = Self::flags(&sock, iface)?;
        if up {
            ifr.ifr_flags |= libc::IFF_UP as libc::c_short;
        } else {
            ifr.ifr_flags &= !(libc::IFF_UP as libc::c_short);
        }
        let ret = unsafe { libc::ioctl(sock.0, libc::SIOCSIFFLAGS as _, &ifr) };
        if ret < 0 {
            return Err(ioctl_error(iface, "SIOCSIFFLAGS", io::Error::last_os_error()));
        }
        Ok(())
    }

    fn apply_mac(&self, iface: &str, mac: &MacAddress) -> ShiftResult<()> {
        let sock = IoctlSocket::open()?;
        let mut ifr = IfReqHwaddr {
            ifr_name: [0; IFNAMSIZ],
            ifr_hwaddr: libc::sockaddr {
                sa_family: libc::ARPHRD_ETHER as libc::sa_family_t,
                sa_data: [0; 14],
            },
            _pad: [0; 24 - std::mem::size_of::<libc::sockaddr>()],
        };
        write_ifname(&mut ifr.ifr_name, iface)?;
        for (idx, b) in mac.octets().iter().enumerate() {
            ifr.ifr_hwaddr.sa_data[idx] = *b as libc::c_char;
        }

        let ret = unsafe { libc::ioctl(sock.0, libc::SIOCSIFHWADDR as _, &ifr) };
        if ret < 0 {
            return Err(ioctl_error(iface, "SIOCSIFHWADDR", io::Error::last_os_error()));
        }
        Ok(())
    }
}

/// Run down / change / up, bringing the interface back up even when the
/// change itself fails.
fn down_change_up(
    mechanism: &dyn LinkMechanism,
    iface: &str,
    change: impl FnOnce() -> ShiftResult<()>,
) -> ShiftResult<()> {
    mechanism.set_state(iface, false)?;
    let changed = change();
    let restored = mechanism.set_state(iface, true);
    changed?;
    restored
}

fn not_found_or(iface: &str, output: &CommandOutput, markers: &[&str]) -> Option<ShiftError> {
    let stderr = output.stderr.to_lowercase();
    if markers.iter().any(|m| stderr.contains(m)) {
        Some(ShiftError::InterfaceNotFound(iface.to_string()))
    } else {
        None
    }
}

/// Net-tools `ifconfig`
pub struct IfconfigLink {
    runner: Arc<dyn CommandRunner>,
}

impl IfconfigLink {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn show(&self, iface: &str) -> ShiftResult<String> {
        let output = self.runner.run("ifconfig", &[iface])?;
        if !output.success {
            return Err(not_found_or(iface, &output, &["device not found", "does not exist"])
                .unwrap_or_else(|| ShiftError::InterfaceQuery {
                    iface: iface.to_string(),
                    reason: output.stderr.trim().to_string(),
                }));
        }
        Ok(output.stdout)
    }
}

impl LinkMechanism for IfconfigLink {
    fn name(&self) -> &'static str {
        "ifconfig"
    }

    fn read_mac(&self, iface: &str) -> ShiftResult<MacAddress> {
        let out = self.show(iface)?;
        parse_ifconfig_mac(&out).ok_or_else(|| ShiftError::InterfaceQuery {
            iface: iface.to_string(),
            reason: "no hardware address in ifconfig output".to_string(),
        })
    }

    fn is_up(&self, iface: &str) -> ShiftResult<bool> {
        Ok(parse_ifconfig_up(&self.show(iface)?))
    }

    fn set_state(&self, iface: &str, up: bool) -> ShiftResult<()> {
        self.runner
            .run_checked("ifconfig", &[iface, if up { "up" } else { "down" }])?;
        Ok(())
    }

    fn apply_mac(&self, iface: &str, mac: &MacAddress) -> ShiftResult<()> {
        let mac = mac.to_string();
        down_change_up(self, iface, || {
            self.runner
                .run_checked("ifconfig", &[iface, "hw", "ether", &mac])
                .map(|_| ())
        })
    }
}

/// iproute2 `ip link`
pub struct IpLink {
    runner: Arc<dyn CommandRunner>,
}

impl IpLink {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn show(&self, iface: &str) -> ShiftResult<String> {
        let output = self.runner.run("ip", &["link", "show", "dev", iface])?;
        if !output.success {
            return Err(not_found_or(iface, &output, &["does not exist", "cannot find device"])
                .unwrap_or_else(|| ShiftError::InterfaceQuery {
                    iface: iface.to_string(),
                    reason: output.stderr.trim().to_string(),
                }));
        }
        Ok(output.stdout)
    }
}

impl LinkMechanism for IpLink {
    fn name(&self) -> &'static str {
        "ip link"
    }

    fn read_mac(&self, iface: &str) -> ShiftResult<MacAddress> {
        let out = self.show(iface)?;
        parse_ip_link_mac(&out).ok_or_else(|| ShiftError::InterfaceQuery {
            iface: iface.to_string(),
            reason: "no link/ether address in ip output".to_string(),
        })
    }

    fn is_up(&self, iface: &str) -> ShiftResult<bool> {
        Ok(parse_ip_link_up(&self.show(iface)?))
    }

    fn set_state(&self, iface: &str, up: bool) -> ShiftResult<()> {
        self.runner.run_checked(
            "ip",
            &["link", "set", "dev", iface, if up { "up" } else { "down" }],
        )?;
        Ok(())
    }

    fn apply_mac(&self, iface: &str, mac: &MacAddress) -> ShiftResult<()> {
        let mac = mac.to_string();
        down_change_up(self, iface, || {
            self.runner
                .run_checked("ip", &["link", "set", "dev", iface, "address", &mac])
                .map(|_| ())
        })
    }
}

/// Flags between the first `<` and `>`, e.g. `<BROADCAST,MULTICAST,UP>`
fn bracket_flags(line: &str) -> Option<Vec<&str>> {
    let start = line.find('<')?;
    let end = start + line[start..].find('>')?;
    Some(line[start + 1..end].split(',').collect())
}

/// Value following `marker` in whitespace-separated output, parsed as a MAC
fn mac_after(out: &str, markers: &[&str]) -> Option<MacAddress> {
    let tokens: Vec<&str> = out.split_whitespace().collect();
    tokens
        .windows(2)
        .find(|w| markers.contains(&w[0]))
        .and_then(|w| w[1].parse().ok())
}

pub fn parse_ip_link_mac(out: &str) -> Option<MacAddress> {
    mac_after(out, &["link/ether"])
}

pub fn parse_ip_link_up(out: &str) -> bool {
    out.lines()
        .next()
        .and_then(bracket_flags)
        .map(|flags| flags.contains(&"UP"))
        .unwrap_or(false)
}

pub fn parse_ifconfig_mac(out: &str) -> Option<MacAddress> {
    mac_after(out, &["ether", "HWaddr"])
}

/// Handles both `flags=4163<UP,...>` and the older `UP BROADCAST RUNNING` form
pub fn parse_ifconfig_up(out: &str) -> bool {
    if let Some(flags) = out.lines().next().and_then(bracket_flags) {
        return flags.contains(&"UP");
    }
    out.lines()
        .any(|line| line.split_whitespace().any(|token| token == "UP"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP_LINK_UP: &str = "2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP mode DEFAULT group default qlen 1000\n    link/ether 52:54:00:12:34:56 brd ff:ff:ff:ff:ff:ff\n";
    const IP_LINK_DOWN: &str = "2: eth0: <BROADCAST,MULTICAST> mtu 1500 qdisc fq_codel state DOWN mode DEFAULT group default qlen 1000\n    link/ether 52:54:00:12:34:56 brd ff:ff:ff:ff:ff:ff\n";
    const IFCONFIG_NEW: &str = "eth0: flags=4163<UP,BROADCAST,RUNNING,MULTICAST>  mtu 1500\n        inet 10.0.2.15  netmask 255.255.255.0  broadcast 10.0.2.255\n        ether 08:00:27:aa:bb:cc  txqueuelen 1000  (Ethernet)\n";
    const IFCONFIG_OLD: &str = "eth0      Link encap:Ethernet  HWaddr 08:00:27:AA:BB:CC\n          UP BROADCAST RUNNING MULTICAST  MTU:1500  Metric:1\n";

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    fn failing(name: &'static str) -> MockLinkMechanism {
        let mut m = MockLinkMechanism::new();
        m.expect_name().return_const(name);
        m.expect_apply_mac().times(1).returning(move |_, _| {
            Err(ShiftError::CommandFailed {
                command: name.to_string(),
                code: Some(1),
                stderr: "busy".to_string(),
            })
        });
        m
    }

    #[test]
    fn parses_ip_link_output() {
        assert_eq!(parse_ip_link_mac(IP_LINK_UP), Some(mac("52:54:00:12:34:56")));
        assert!(parse_ip_link_up(IP_LINK_UP));
        assert!(!parse_ip_link_up(IP_LINK_DOWN));
        assert_eq!(parse_ip_link_mac("1: lo: <LOOPBACK,UP>\n    link/loopback 00:00:00:00:00:00"), None);
    }

    #[test]
    fn parses_both_ifconfig_formats() {
        assert_eq!(parse_ifconfig_mac(IFCONFIG_NEW), Some(mac("08:00:27:AA:BB:CC")));
        assert_eq!(parse_ifconfig_mac(IFCONFIG_OLD), Some(mac("08:00:27:AA:BB:CC")));
        assert!(parse_ifconfig_up(IFCONFIG_NEW));
        assert!(parse_ifconfig_up(IFCONFIG_OLD));
        assert!(!parse_ifconfig_up("eth0: flags=4098<BROADCAST,MULTICAST>  mtu 1500\n"));
    }

    #[test]
    fn apply_falls_back_to_second_mechanism() {
        let target = mac("02:11:22:33:44:55");

        let mut second = MockLinkMechanism::new();
        second.expect_name().return_const("ifconfig");
        second
            .expect_apply_mac()
            .withf(move |iface, m| iface == "eth0" && *m == target)
            .times(1)
            .returning(|_, _| Ok(()));

        let mut third = MockLinkMechanism::new();
        third.expect_name().return_const("ip link");
        third.expect_apply_mac().never();

        let link = LinkControl::new(vec![
            Box::new(failing("ioctl")),
            Box::new(second),
            Box::new(third),
        ]);

        assert_eq!(link.apply("eth0", &target).unwrap(), "ifconfig");
    }

    #[test]
    fn apply_reports_every_failed_mechanism() {
        let link = LinkControl::new(vec![Box::new(failing("ioctl")), Box::new(failing("ip link"))]);

        match link.apply("eth0", &mac("02:00:00:00:00:01")) {
            Err(ShiftError::Apply { iface, reason, .. }) => {
                assert_eq!(iface, "eth0");
                assert!(reason.contains("ioctl"));
                assert!(reason.contains("ip link"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn missing_interface_stops_the_chain() {
        let mut first = MockLinkMechanism::new();
        first.expect_name().return_const("ioctl");
        first
            .expect_read_mac()
            .returning(|iface| Err(ShiftError::InterfaceNotFound(iface.to_string())));

        let mut second = MockLinkMechanism::new();
        second.expect_name().return_const("ip link");
        second.expect_read_mac().never();
        second.expect_is_up().never();
        first
            .expect_is_up()
            .returning(|iface| Err(ShiftError::InterfaceNotFound(iface.to_string())));

        let link = LinkControl::new(vec![Box::new(first), Box::new(second)]);
        assert!(link.current("ghost0").unwrap_err().is_not_found());
        assert!(!link.exists("ghost0"));
    }

    #[test]
    fn wait_until_up_observes_cancellation() {
        let mut down = MockLinkMechanism::new();
        down.expect_name().return_const("ioctl");
        down.expect_is_up().returning(|_| Ok(false));
        let link = LinkControl::new(vec![Box::new(down)]);

        let cancel = CancellationToken::new();
        let other = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            other.cancel();
        });

        assert!(!wait_until_up(&link, "eth0", &cancel, Duration::from_millis(10)));
        handle.join().unwrap();
    }
}
