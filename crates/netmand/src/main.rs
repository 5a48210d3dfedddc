// # netmand - Network Management Daemon
//
// The netmand daemon is a thin integration layer over netman-core. It is
// responsible for:
// 1. Reading configuration from the environment and a JSON file
// 2. Initializing logging and the runtime
// 3. Building the platform backend and the device manager
// 4. Activating autoconnect profiles
// 5. Running until SIGTERM / SIGINT
//
// All activation, merge and commit logic lives in netman-core.
//
// ## Configuration
//
// - `NETMAN_CONFIG`: Path to the JSON configuration file (required)
// - `NETMAN_LOG_LEVEL`: trace, debug, info, warn, error (default: info)
//
// ## Example
//
// ```json
// {
//   "platform": { "type": "memory", "links": [{ "ifindex": 2, "name": "eth0", "carrier": true }] },
//   "devices": [{ "ifindex": 2, "name": "eth0", "kind": { "type": "ethernet" } }],
//   "profiles": [{
//     "id": "wired",
//     "kind": { "type": "ethernet" },
//     "ipv4": { "method": "manual", "addresses": ["10.0.0.5/24"], "gateway": "10.0.0.1" },
//     "ipv6": { "method": "disabled" }
//   }]
// }
// ```
//
// ```bash
// NETMAN_CONFIG=/etc/netman/netman.json netmand
// ```
//
// Collaborator requests (DHCP, authentication, connectivity checks) are
// logged; no collaborator is attached to the daemon.

use anyhow::{Context, Result};
use netman_core::config::{NetmanConfig, PlatformConfig};
use netman_core::device::{DeviceNotification, DeviceRequest, DeviceState};
use netman_core::engine::DeviceManager;
use netman_core::platform::MemoryPlatform;
use netman_core::profile::Profile;
use netman_core::registry::DefaultRouteRegistry;
use netman_core::traits::Platform;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum NetmanExitCode {
    CleanShutdown = 0,
    ConfigError = 1,
    RuntimeError = 2,
}

impl From<NetmanExitCode> for ExitCode {
    fn from(code: NetmanExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Settings taken from the environment
struct Settings {
    config_path: PathBuf,
    log_level: String,
}

impl Settings {
    fn from_env() -> Result<Self> {
        let config_path = env::var("NETMAN_CONFIG").context(
            "NETMAN_CONFIG is required. Set it via: export NETMAN_CONFIG=/etc/netman/netman.json",
        )?;
        Ok(Self {
            config_path: PathBuf::from(config_path),
            log_level: env::var("NETMAN_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    fn log_level(&self) -> Result<Level> {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Ok(Level::TRACE),
            "debug" => Ok(Level::DEBUG),
            "info" => Ok(Level::INFO),
            "warn" => Ok(Level::WARN),
            "error" => Ok(Level::ERROR),
            _ => anyhow::bail!(
                "NETMAN_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }
    }

    /// Read and validate the configuration file
    fn load_config(&self) -> Result<NetmanConfig> {
        let contents = std::fs::read_to_string(&self.config_path)
            .with_context(|| format!("cannot read {}", self.config_path.display()))?;
        let config: NetmanConfig = serde_json::from_str(&contents)
            .with_context(|| format!("cannot parse {}", self.config_path.display()))?;
        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return NetmanExitCode::ConfigError.into();
        }
    };

    let log_level = match settings.log_level() {
        Ok(level) => level,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return NetmanExitCode::ConfigError.into();
        }
    };

    let config = match settings.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration validation error: {:#}", e);
            return NetmanExitCode::ConfigError.into();
        }
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return NetmanExitCode::ConfigError.into();
    }

    info!("Starting netmand daemon");
    info!(
        "Configuration loaded: {} device(s), {} profile(s)",
        config.devices.len(),
        config.profiles.len()
    );

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return NetmanExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        if let Err(e) = run_daemon(config).await {
            error!("Daemon error: {:#}", e);
            NetmanExitCode::RuntimeError
        } else {
            NetmanExitCode::CleanShutdown
        }
    });

    result.into()
}

async fn build_platform(config: &PlatformConfig) -> Arc<dyn Platform> {
    match config {
        PlatformConfig::Memory { links } => {
            let platform = MemoryPlatform::new();
            for link in links {
                platform.add_link(link.clone()).await;
            }
            info!("Using in-memory platform with {} link(s)", links.len());
            Arc::new(platform)
        }
    }
}

/// Run the daemon
async fn run_daemon(config: NetmanConfig) -> Result<()> {
    let platform = build_platform(&config.platform).await;
    let registry = Arc::new(DefaultRouteRegistry::new());
    let (manager, notifications, requests) =
        DeviceManager::new(platform, registry, config.engine.clone())?;
    let manager = Arc::new(manager);

    for spec in &config.devices {
        manager
            .add_device(spec.clone())
            .await
            .with_context(|| format!("cannot manage {}", spec.name))?;
    }

    tokio::spawn(log_notifications(notifications));
    tokio::spawn(log_requests(requests));

    for spec in &config.devices {
        let candidate = config
            .profiles
            .iter()
            .find(|p| p.autoconnect && spec.kind.is_compatible(&p.kind));
        match candidate {
            Some(profile) => {
                tokio::spawn(autoconnect(
                    Arc::clone(&manager),
                    spec.ifindex,
                    profile.clone(),
                ));
            }
            None => debug!("No autoconnect profile for {}", spec.name),
        }
    }

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        match wait_for_shutdown().await {
            Ok(signal) => info!("Received shutdown signal: {}", signal),
            Err(e) => error!("Signal handling failed: {}", e),
        }
        let _ = shutdown_tx.send(());
    });

    manager.run_with_shutdown(Some(shutdown_rx)).await?;
    info!("Shutting down daemon");
    Ok(())
}

/// Activate `profile` once the device is ready for it
async fn autoconnect(manager: Arc<DeviceManager>, ifindex: u32, profile: Profile) {
    let Some(mut watch) = manager.watch_device(ifindex).await else {
        return;
    };
    if watch
        .wait_for(|s| s.state == DeviceState::Disconnected)
        .await
        .is_err()
    {
        return;
    }
    info!("Autoconnecting {} on ifindex {}", profile.id, ifindex);
    if let Err(e) = manager.activate(ifindex, profile).await {
        warn!("Autoconnect on ifindex {} failed: {}", ifindex, e);
    }
}

async fn log_notifications(mut notifications: mpsc::Receiver<DeviceNotification>) {
    while let Some(notification) = notifications.recv().await {
        match notification {
            DeviceNotification::StateChanged {
                ifindex,
                old,
                new,
                reason,
                ..
            } => info!("ifindex {}: {} -> {} ({})", ifindex, old, new, reason),
            DeviceNotification::IpConfigChanged {
                ifindex, family, ..
            } => debug!("ifindex {}: {} configuration committed", ifindex, family),
            DeviceNotification::Activated { ifindex, profile } => {
                info!("ifindex {}: {} activated", ifindex, profile)
            }
        }
    }
}

async fn log_requests(mut requests: mpsc::UnboundedReceiver<DeviceRequest>) {
    while let Some(request) = requests.recv().await {
        warn!(
            "No collaborator for request on ifindex {}: {:?}",
            request.ifindex(),
            request
        );
    }
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for shutdown signals (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
