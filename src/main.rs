use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::Parser;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use stealth_shift::cleanup::{CleanupCoordinator, CleanupGuard};
use stealth_shift::config::{FileConfig, Overrides, Settings, DEFAULT_CONFIG_PATH};
use stealth_shift::engine::{Engine, PrimaryOutcome};
use stealth_shift::ip::{HttpResolver, IpVerifier};
use stealth_shift::vpn::{self, BackendContext, ConfigPool};
use stealth_shift::{
    CancellationToken, CommandRunner, IdentityStore, LinkControl, MacAddress, RotationMode,
    Rotator, ShiftError, SystemRunner,
};

/// Stealth Shift - MAC address and VPN identity rotation
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
struct Args {
    /// The network interface to manage (e.g., eth0, wlan0)
    #[clap(short = 'i', long)]
    interface: Option<String>,

    /// Path to configuration file
    #[clap(long)]
    config: Option<PathBuf>,

    /// Set the MAC address to this value
    #[clap(short = 'm', long, conflicts_with = "random")]
    mac: Option<String>,

    /// Set a random MAC address
    #[clap(short = 'r', long)]
    random: bool,

    /// Restore the primary MAC address (recording the current one if none is stored)
    #[clap(short = 'p', long)]
    primary: bool,

    /// Show current status of the interface
    #[clap(short = 's', long)]
    status: bool,

    /// Forget the stored primary MAC address
    #[clap(long)]
    reset_primary: bool,

    /// Stop every WireGuard, OpenVPN and AnonSurf session and exit
    #[clap(long)]
    stop_vpn: bool,

    /// Rotate periodically until interrupted
    #[clap(long)]
    rotate: bool,

    /// What to rotate
    #[clap(long, value_enum)]
    mode: Option<RotationMode>,

    /// Rotation interval in seconds (10-3600)
    #[clap(short = 't', long)]
    interval: Option<u64>,

    /// VPN backend to use
    #[clap(long, value_enum)]
    vpn: Option<vpn::BackendKind>,

    /// Directory holding OP_VPNS/, AUTH/ and WG_VPNS/
    #[clap(long)]
    pool_dir: Option<PathBuf>,

    /// Directory for primary MAC records
    #[clap(long)]
    state_dir: Option<PathBuf>,

    /// Prefix external commands with sudo
    #[clap(long)]
    sudo: bool,

    /// Enable verbose output
    #[clap(short = 'v', long)]
    verbose: bool,
}

enum Action {
    StopVpn,
    Status,
    ResetPrimary,
    Primary,
    Rotate,
    Change(MacAddress),
}

fn log_with_timestamp(msg: &str) {
    info!("[{}] {}", Local::now().format("%Y-%m-%d %H:%M:%S"), msg);
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

fn require_root(settings: &Settings) -> Result<()> {
    if settings.sudo || unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }
    Err(ShiftError::InsufficientPermissions.into())
}

fn choose_action(args: &Args) -> Result<Action> {
    if args.stop_vpn {
        return Ok(Action::StopVpn);
    }
    if args.status {
        return Ok(Action::Status);
    }
    if args.reset_primary {
        return Ok(Action::ResetPrimary);
    }
    if args.primary {
        return Ok(Action::Primary);
    }
    if args.rotate {
        return Ok(Action::Rotate);
    }
    if let Some(mac) = &args.mac {
        let mac: MacAddress = mac.parse()?;
        return Ok(Action::Change(mac));
    }
    if args.random {
        return Ok(Action::Change(MacAddress::generate()));
    }
    bail!("No action specified. Use -r for random, -m to specify a MAC address, --rotate, -p or -s")
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let file = FileConfig::load(&config_path)
        .with_context(|| format!("Failed to load config file {:?}", config_path))?;

    let overrides = Overrides {
        interface: args.interface.clone(),
        interval: args.interval,
        mode: args.mode,
        backend: args.vpn,
        pool_dir: args.pool_dir.clone(),
        state_dir: args.state_dir.clone(),
        sudo: args.sudo,
    };
    let settings = Settings::resolve(overrides, file)?;

    // Pre-flight: everything below may exit non-zero before any change is made
    let action = choose_action(&args)?;

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new(settings.sudo));
    let link = Arc::new(LinkControl::system(runner.clone()));
    let cancel = CancellationToken::new();
    let ctx = BackendContext {
        runner,
        link: link.clone(),
        pool: ConfigPool::new(&settings.pool_dir),
        cancel: cancel.clone(),
        poll: Duration::from_secs(1),
    };

    if let Action::StopVpn = action {
        require_root(&settings)?;
        let failures = vpn::stop_all(&ctx)
            .into_iter()
            .filter(|(_, r)| r.is_err())
            .count();
        if failures > 0 {
            bail!("{} backend(s) could not be stopped", failures);
        }
        return Ok(());
    }

    let iface = settings.interface()?.to_string();
    let store = IdentityStore::new(&settings.state_dir);
    let engine = Engine::new(&iface, link.clone(), store.clone());
    engine.preflight()?;

    match action {
        Action::Status => {
            println!("{}", engine.status()?);
            return Ok(());
        }
        Action::ResetPrimary => {
            require_root(&settings)?;
            if !engine.reset_primary()? {
                warn!("No primary MAC address was recorded for {}", iface);
            }
            return Ok(());
        }
        Action::Primary => {
            require_root(&settings)?;
            match engine.set_primary()? {
                PrimaryOutcome::AlreadyPrimary(mac) => {
                    info!("MAC address of {} is already the primary {}", iface, mac)
                }
                PrimaryOutcome::Restored { to, .. } => {
                    info!("MAC address successfully set to {} for {}", to, iface)
                }
            }
            return Ok(());
        }
        _ => {}
    }

    require_root(&settings)?;
    let rotation = match action {
        Action::Rotate => Some(settings.rotation_config()?),
        _ => None,
    };
    if rotation.map_or(false, |r| r.mode().rotates_vpn()) && settings.backend.is_none() {
        bail!("Rotation mode '{}' needs --vpn", settings.mode);
    }

    let handler_cancel = cancel.clone();
    ctrlc::set_handler(move || {
        if handler_cancel.cancel() {
            info!("Interrupt received, stopping...");
        }
    })
    .context("Failed to install signal handler")?;

    // Without a primary record there is nothing to restore later
    let primary = engine
        .capture_primary()
        .context("Failed to record the primary MAC address")?;
    info!("Primary MAC address for {}: {}", iface, primary);

    let backend = settings.backend.map(|kind| vpn::shared(kind.build(&ctx)));
    let mut coordinator = CleanupCoordinator::new(&iface, link.clone(), store);
    if let Some(b) = &backend {
        coordinator = coordinator.with_backend(b.clone());
    }
    let cleanup = CleanupGuard::new(coordinator);

    let result = match (action, rotation) {
        (Action::Rotate, Some(rotation)) => {
            let mut rotator = Rotator::new(&iface, rotation, link, cancel.clone())
                .with_policy(settings.rotation_policy());
            if let Some(b) = &backend {
                let resolver = HttpResolver::new(&settings.verify_url, Duration::from_secs(10))?;
                rotator = rotator
                    .with_backend(b.clone())
                    .with_verifier(Arc::new(IpVerifier::new(Box::new(resolver))));
            }
            log_with_timestamp("Rotation running. Press CTRL+C to stop.");
            rotator.run().map(|_| ()).map_err(anyhow::Error::from)
        }
        (Action::Change(mac), _) => {
            let report = engine.single_shot(
                &mac,
                backend.as_ref(),
                settings.rotation_policy().start,
                &cancel,
            );
            debug!("Single-shot run finished: {:?}", report);
            Ok(())
        }
        _ => Ok(()),
    };

    if let Some(report) = cleanup.run() {
        if !report.is_clean() {
            error!("Cleanup finished with errors: {:?}", report);
        }
    }
    result
}
