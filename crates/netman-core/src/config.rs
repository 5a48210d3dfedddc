//! Configuration types for the network manager
//!
//! This module defines all configuration structures used throughout the crate.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::profile::{DeviceKind, Profile};
use crate::traits::Link;

/// Main netman configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetmanConfig {
    /// Platform backend
    #[serde(default)]
    pub platform: PlatformConfig,

    /// Interfaces to manage
    pub devices: Vec<DeviceSpec>,

    /// Connection profiles available for activation
    #[serde(default)]
    pub profiles: Vec<Profile>,

    /// Optional engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

impl NetmanConfig {
    /// Create a configuration with no devices
    pub fn new() -> Self {
        Self {
            platform: PlatformConfig::default(),
            devices: Vec::new(),
            profiles: Vec::new(),
            engine: EngineConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.devices.is_empty() {
            return Err(crate::Error::config("No devices configured"));
        }

        let mut ifindexes = HashSet::new();
        let mut names = HashSet::new();
        for device in &self.devices {
            device.validate()?;
            if !ifindexes.insert(device.ifindex) {
                return Err(crate::Error::config(format!(
                    "Duplicate device ifindex {}",
                    device.ifindex
                )));
            }
            if !names.insert(device.name.as_str()) {
                return Err(crate::Error::config(format!(
                    "Duplicate device name {}",
                    device.name
                )));
            }
        }

        let mut ids = HashSet::new();
        for profile in &self.profiles {
            profile.validate()?;
            if !ids.insert(profile.id.as_str()) {
                return Err(crate::Error::config(format!(
                    "Duplicate profile id {}",
                    profile.id
                )));
            }
        }

        self.platform.validate()?;
        self.engine.validate()?;
        Ok(())
    }

    /// Look up a profile by id
    pub fn profile(&self, id: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.id == id)
    }
}

impl Default for NetmanConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Platform backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlatformConfig {
    /// Simulated in-memory kernel tables
    Memory {
        /// Links present at startup
        #[serde(default)]
        links: Vec<Link>,
    },
}

impl PlatformConfig {
    /// Validate the platform configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            PlatformConfig::Memory { links } => {
                let mut seen = HashSet::new();
                for link in links {
                    if link.ifindex == 0 {
                        return Err(crate::Error::config("Link ifindex must be > 0"));
                    }
                    if !seen.insert(link.ifindex) {
                        return Err(crate::Error::config(format!(
                            "Duplicate link ifindex {}",
                            link.ifindex
                        )));
                    }
                }
                Ok(())
            }
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        PlatformConfig::Memory { links: Vec::new() }
    }
}

/// A managed interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub ifindex: u32,
    pub name: String,
    pub kind: DeviceKind,
}

impl DeviceSpec {
    pub fn new(ifindex: u32, name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            ifindex,
            name: name.into(),
            kind,
        }
    }

    /// Validate the device specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.ifindex == 0 {
            return Err(crate::Error::config("Device ifindex must be > 0"));
        }
        if self.name.is_empty() || self.name.len() > 15 {
            return Err(crate::Error::config(format!(
                "Invalid interface name '{}'",
                self.name
            )));
        }
        Ok(())
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retries of a platform call that failed transiently
    #[serde(default = "default_commit_max_retries")]
    pub commit_max_retries: u32,

    /// Delay between commit retries (in milliseconds)
    #[serde(default = "default_commit_retry_delay_ms")]
    pub commit_retry_delay_ms: u64,

    /// How long to wait for a DHCP lease
    #[serde(default = "default_dhcp_timeout_secs")]
    pub dhcp_timeout_secs: u64,

    /// How long to wait for IPv6 auto-configuration
    #[serde(default = "default_autoconf_timeout_secs")]
    pub autoconf_timeout_secs: u64,

    /// How long to wait for authentication
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,

    /// Run a connectivity check before declaring a device activated
    #[serde(default)]
    pub connectivity_check: bool,

    #[serde(default = "default_connectivity_timeout_secs")]
    pub connectivity_timeout_secs: u64,

    /// How long to wait for secondary connections
    #[serde(default = "default_secondaries_timeout_secs")]
    pub secondaries_timeout_secs: u64,

    /// Upper bound on deconfiguration; DISCONNECTED is forced afterwards
    #[serde(default = "default_teardown_timeout_secs")]
    pub teardown_timeout_secs: u64,

    /// Capacity of the notification channel
    ///
    /// When full, new notifications will be dropped (with a warning log).
    ///
    /// Default: 1000 notifications
    #[serde(default = "default_notification_channel_capacity")]
    pub notification_channel_capacity: usize,

    /// Capacity of each device's event queue
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    /// resolv.conf consulted when capturing externally configured DNS
    #[serde(default)]
    pub resolv_conf_path: Option<PathBuf>,
}

impl EngineConfig {
    /// Validate the engine configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        let timeouts = [
            ("dhcp_timeout_secs", self.dhcp_timeout_secs),
            ("autoconf_timeout_secs", self.autoconf_timeout_secs),
            ("auth_timeout_secs", self.auth_timeout_secs),
            ("connectivity_timeout_secs", self.connectivity_timeout_secs),
            ("secondaries_timeout_secs", self.secondaries_timeout_secs),
            ("teardown_timeout_secs", self.teardown_timeout_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(crate::Error::config(format!("{} must be > 0", name)));
            }
        }
        if self.notification_channel_capacity == 0 {
            return Err(crate::Error::config(
                "notification_channel_capacity must be > 0",
            ));
        }
        if self.event_queue_capacity == 0 {
            return Err(crate::Error::config("event_queue_capacity must be > 0"));
        }
        Ok(())
    }

    pub fn commit_retry_delay(&self) -> Duration {
        Duration::from_millis(self.commit_retry_delay_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_secs(self.teardown_timeout_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            commit_max_retries: default_commit_max_retries(),
            commit_retry_delay_ms: default_commit_retry_delay_ms(),
            dhcp_timeout_secs: default_dhcp_timeout_secs(),
            autoconf_timeout_secs: default_autoconf_timeout_secs(),
            auth_timeout_secs: default_auth_timeout_secs(),
            connectivity_check: false,
            connectivity_timeout_secs: default_connectivity_timeout_secs(),
            secondaries_timeout_secs: default_secondaries_timeout_secs(),
            teardown_timeout_secs: default_teardown_timeout_secs(),
            notification_channel_capacity: default_notification_channel_capacity(),
            event_queue_capacity: default_event_queue_capacity(),
            resolv_conf_path: None,
        }
    }
}

fn default_commit_max_retries() -> u32 {
    3
}

fn default_commit_retry_delay_ms() -> u64 {
    50
}

fn default_dhcp_timeout_secs() -> u64 {
    45
}

fn default_autoconf_timeout_secs() -> u64 {
    30
}

fn default_auth_timeout_secs() -> u64 {
    25
}

fn default_connectivity_timeout_secs() -> u64 {
    20
}

fn default_secondaries_timeout_secs() -> u64 {
    30
}

fn default_teardown_timeout_secs() -> u64 {
    5
}

fn default_notification_channel_capacity() -> usize {
    1000
}

fn default_event_queue_capacity() -> usize {
    256
}
