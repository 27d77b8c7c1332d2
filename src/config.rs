//! Settings from the command line, an optional TOML file, and defaults, in
//! that order of precedence.

use log::debug;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{ShiftError, ShiftResult};
use crate::ip::DEFAULT_RESOLVER_URL;
use crate::retry::RetryPolicy;
use crate::scheduler::RotationPolicy;
use crate::vpn::BackendKind;
use crate::{RotationConfig, RotationMode};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/stealth-shift/config.toml";
pub const DEFAULT_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub interface: Option<InterfaceSection>,
    pub rotation: Option<RotationSection>,
    pub vpn: Option<VpnSection>,
    pub verify: Option<VerifySection>,
    pub state: Option<StateSection>,
    pub commands: Option<CommandsSection>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct InterfaceSection {
    pub name: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RotationSection {
    pub interval: Option<u64>,
    pub mode: Option<RotationMode>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct VpnSection {
    pub backend: Option<BackendKind>,
    pub pool_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct VerifySection {
    pub url: Option<String>,
    pub attempts: Option<u32>,
    pub delay_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StateSection {
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CommandsSection {
    pub sudo: Option<bool>,
}

impl FileConfig {
    pub fn parse(content: &str) -> ShiftResult<Self> {
        toml::from_str(content)
            .map_err(|e| ShiftError::InvalidConfiguration(format!("failed to parse TOML: {}", e)))
    }

    /// Load `path` if it exists
    pub fn load(path: &Path) -> ShiftResult<Option<Self>> {
        if !path.exists() {
            debug!("Configuration file {:?} does not exist", path);
            return Ok(None);
        }
        debug!("Reading configuration from {:?}", path);
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content).map(Some)
    }
}

/// Values given on the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub interface: Option<String>,
    pub interval: Option<u64>,
    pub mode: Option<RotationMode>,
    pub backend: Option<BackendKind>,
    pub pool_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub sudo: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub interface: Option<String>,
    pub interval_secs: u64,
    pub mode: RotationMode,
    pub backend: Option<BackendKind>,
    pub pool_dir: PathBuf,
    pub state_dir: PathBuf,
    pub verify_url: String,
    pub verify_attempts: u32,
    pub verify_delay: Duration,
    pub sudo: bool,
}

impl Settings {
    pub fn resolve(args: Overrides, file: Option<FileConfig>) -> ShiftResult<Self> {
        let file = file.unwrap_or_default();
        let rotation = file.rotation.unwrap_or_default();
        let vpn = file.vpn.unwrap_or_default();
        let verify = file.verify.unwrap_or_default();

        let interface = args
            .interface
            .or_else(|| file.interface.and_then(|i| i.name));

        let backend = args.backend.or(vpn.backend);
        let mode = args.mode.or(rotation.mode).unwrap_or(if backend.is_some() {
            RotationMode::Both
        } else {
            RotationMode::Mac
        });

        let verify_attempts = verify.attempts.unwrap_or(5);
        if verify_attempts == 0 {
            return Err(ShiftError::InvalidConfiguration(
                "verify.attempts must be at least 1".into(),
            ));
        }

        Ok(Self {
            interface,
            interval_secs: args
                .interval
                .or(rotation.interval)
                .unwrap_or(DEFAULT_INTERVAL_SECS),
            mode,
            backend,
            pool_dir: args
                .pool_dir
                .or(vpn.pool_dir)
                .unwrap_or_else(|| PathBuf::from(".")),
            state_dir: args
                .state_dir
                .or(file.state.and_then(|s| s.dir))
                .unwrap_or_else(|| PathBuf::from(".")),
            verify_url: verify
                .url
                .unwrap_or_else(|| DEFAULT_RESOLVER_URL.to_string()),
            verify_attempts,
            verify_delay: Duration::from_secs(verify.delay_secs.unwrap_or(5)),
            sudo: args.sudo || file.commands.and_then(|c| c.sudo).unwrap_or(false),
        })
    }

    pub fn interface(&self) -> ShiftResult<&str> {
        self.interface.as_deref().ok_or_else(|| {
            ShiftError::InvalidConfiguration("interface is required (in args or config)".into())
        })
    }

    pub fn rotation_config(&self) -> ShiftResult<RotationConfig> {
        RotationConfig::new(self.interval_secs, self.mode)
    }

    pub fn rotation_policy(&self) -> RotationPolicy {
        RotationPolicy {
            verify: RetryPolicy::new(self.verify_attempts, self.verify_delay),
            ..RotationPolicy::default()
        }
    }
}
