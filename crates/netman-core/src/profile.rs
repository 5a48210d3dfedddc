//! Connection profiles
//!
//! A [`Profile`] is the immutable snapshot the settings service hands to a
//! device at activation time. Profile and device categories are closed
//! enums; the state machine matches on them instead of inspecting runtime
//! types.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::error::{Error, Result};
use crate::ip_config::AddrFamily;

/// A connection profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Human-readable unique id
    pub id: String,

    /// Category-specific settings
    pub kind: ProfileKind,

    #[serde(default)]
    pub ipv4: IpSetting,

    #[serde(default)]
    pub ipv6: IpSetting,

    /// MTU applied during L2 setup
    #[serde(default)]
    pub mtu: Option<u32>,

    /// Ids of profiles that must be active before this one completes
    #[serde(default)]
    pub secondaries: Vec<String>,

    /// Whether the daemon may activate this profile on its own
    #[serde(default = "default_autoconnect")]
    pub autoconnect: bool,
}

fn default_autoconnect() -> bool {
    true
}

impl Profile {
    /// Create a profile with automatic addressing on both families
    pub fn new(id: impl Into<String>, kind: ProfileKind) -> Self {
        Self {
            id: id.into(),
            kind,
            ipv4: IpSetting::default(),
            ipv6: IpSetting::default(),
            mtu: None,
            secondaries: Vec::new(),
            autoconnect: true,
        }
    }

    pub fn with_ipv4(mut self, setting: IpSetting) -> Self {
        self.ipv4 = setting;
        self
    }

    pub fn with_ipv6(mut self, setting: IpSetting) -> Self {
        self.ipv6 = setting;
        self
    }

    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = Some(mtu);
        self
    }

    pub fn with_secondaries(mut self, secondaries: Vec<String>) -> Self {
        self.secondaries = secondaries;
        self
    }

    /// Settings for one family
    pub fn ip_setting(&self, family: AddrFamily) -> &IpSetting {
        match family {
            AddrFamily::V4 => &self.ipv4,
            AddrFamily::V6 => &self.ipv6,
        }
    }

    /// Whether the link needs credentials before addressing can start
    pub fn requires_auth(&self) -> bool {
        match &self.kind {
            ProfileKind::Ethernet { ieee8021x } => *ieee8021x,
            ProfileKind::Wifi { security, .. } => *security != WifiSecurity::Open,
            ProfileKind::Vlan { .. } | ProfileKind::Generic => false,
        }
    }

    /// Validate the profile
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::config("Profile id cannot be empty"));
        }

        match &self.kind {
            ProfileKind::Wifi { ssid, .. } if ssid.is_empty() || ssid.len() > 32 => {
                return Err(Error::config(format!(
                    "Profile {}: SSID must be 1-32 bytes",
                    self.id
                )));
            }
            ProfileKind::Vlan { parent, id } if parent.is_empty() || *id == 0 || *id > 4094 => {
                return Err(Error::config(format!(
                    "Profile {}: VLAN needs a parent and an id in 1-4094",
                    self.id
                )));
            }
            _ => {}
        }

        if let Some(mtu) = self.mtu {
            if !(68..=65535).contains(&mtu) {
                return Err(Error::config(format!(
                    "Profile {}: MTU {} out of range",
                    self.id, mtu
                )));
            }
        }

        for family in AddrFamily::ALL {
            self.ip_setting(family)
                .validate(family)
                .map_err(|e| Error::config(format!("Profile {}: {}", self.id, e)))?;
        }

        Ok(())
    }
}

/// Profile category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProfileKind {
    /// Wired ethernet
    Ethernet {
        /// 802.1X port authentication
        #[serde(default)]
        ieee8021x: bool,
    },

    /// Wi-Fi
    Wifi {
        ssid: String,
        #[serde(default)]
        security: WifiSecurity,
    },

    /// 802.1Q VLAN on top of a parent link
    Vlan { parent: String, id: u16 },

    /// Any other link type, addressing only
    Generic,
}

/// Wi-Fi security mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WifiSecurity {
    #[default]
    Open,
    WpaPsk,
    WpaEap,
}

/// Device category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceKind {
    Ethernet,
    Wifi,
    Vlan { parent: String, id: u16 },
    Generic,
}

impl DeviceKind {
    /// Whether a profile can be activated on a device of this kind
    pub fn is_compatible(&self, profile: &ProfileKind) -> bool {
        match (self, profile) {
            (DeviceKind::Ethernet, ProfileKind::Ethernet { .. }) => true,
            (DeviceKind::Wifi, ProfileKind::Wifi { .. }) => true,
            (
                DeviceKind::Vlan { parent, id },
                ProfileKind::Vlan {
                    parent: profile_parent,
                    id: profile_id,
                },
            ) => parent == profile_parent && id == profile_id,
            (_, ProfileKind::Generic) => true,
            _ => false,
        }
    }

    /// Metric for default routes when the profile does not set one
    pub fn default_route_metric(&self) -> u32 {
        match self {
            DeviceKind::Ethernet => 100,
            DeviceKind::Vlan { .. } => 400,
            DeviceKind::Wifi => 600,
            DeviceKind::Generic => 950,
        }
    }
}

/// How a family gets its addresses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IpMethod {
    /// DHCP for IPv4, router advertisements for IPv6
    #[default]
    Auto,
    /// Addresses from the profile only
    Manual,
    /// Kernel link-local addressing only
    LinkLocal,
    /// Family not configured
    Disabled,
}

/// A static route in a profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSetting {
    pub dest: IpNet,
    #[serde(default)]
    pub next_hop: Option<IpAddr>,
    #[serde(default)]
    pub metric: Option<u32>,
}

/// Per-family IP settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpSetting {
    #[serde(default)]
    pub method: IpMethod,

    /// Static addresses, e.g. `10.0.0.5/24`
    #[serde(default)]
    pub addresses: Vec<IpNet>,

    #[serde(default)]
    pub gateway: Option<IpAddr>,

    #[serde(default)]
    pub routes: Vec<RouteSetting>,

    #[serde(default)]
    pub dns: Vec<IpAddr>,

    #[serde(default)]
    pub dns_search: Vec<String>,

    #[serde(default)]
    pub dns_options: Vec<String>,

    /// 0 means "use the default"
    #[serde(default)]
    pub dns_priority: i32,

    /// Metric for routes without one; device default when unset
    #[serde(default)]
    pub route_metric: Option<u32>,

    #[serde(default)]
    pub never_default: bool,

    /// Tolerate failure of this family during activation
    #[serde(default = "default_may_fail")]
    pub may_fail: bool,

    #[serde(default)]
    pub ignore_auto_dns: bool,

    #[serde(default)]
    pub ignore_auto_routes: bool,

    /// Override of the engine's DHCP / auto-configuration timeout
    #[serde(default)]
    pub dhcp_timeout_secs: Option<u64>,
}

fn default_may_fail() -> bool {
    true
}

impl Default for IpSetting {
    fn default() -> Self {
        Self::with_method(IpMethod::Auto)
    }
}

impl IpSetting {
    /// Empty settings using `method`
    pub fn with_method(method: IpMethod) -> Self {
        Self {
            method,
            addresses: Vec::new(),
            gateway: None,
            routes: Vec::new(),
            dns: Vec::new(),
            dns_search: Vec::new(),
            dns_options: Vec::new(),
            dns_priority: 0,
            route_metric: None,
            never_default: false,
            may_fail: default_may_fail(),
            ignore_auto_dns: false,
            ignore_auto_routes: false,
            dhcp_timeout_secs: None,
        }
    }

    /// Manual settings with the given addresses
    pub fn manual(addresses: Vec<IpNet>) -> Self {
        Self {
            addresses,
            ..Self::with_method(IpMethod::Manual)
        }
    }

    pub fn disabled() -> Self {
        Self::with_method(IpMethod::Disabled)
    }

    pub fn with_gateway(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_dns(mut self, dns: Vec<IpAddr>) -> Self {
        self.dns = dns;
        self
    }

    pub fn with_may_fail(mut self, may_fail: bool) -> Self {
        self.may_fail = may_fail;
        self
    }

    pub fn with_never_default(mut self, never_default: bool) -> Self {
        self.never_default = never_default;
        self
    }

    pub fn with_route(mut self, route: RouteSetting) -> Self {
        self.routes.push(route);
        self
    }

    /// Validate the settings for `family`
    pub fn validate(&self, family: AddrFamily) -> Result<()> {
        if self.method == IpMethod::Manual && self.addresses.is_empty() {
            return Err(Error::config(format!(
                "{} method manual requires at least one address",
                family
            )));
        }

        let wrong_family = |addr: &IpAddr| AddrFamily::of(addr) != family;

        if let Some(addr) = self.addresses.iter().find(|net| wrong_family(&net.addr())) {
            return Err(Error::config(format!("{} address {} has the wrong family", family, addr)));
        }
        if let Some(addr) = self.addresses.iter().find(|net| net.addr().is_unspecified()) {
            return Err(Error::config(format!("{} address {} is unspecified", family, addr)));
        }
        if let Some(gateway) = self.gateway.filter(|gw| wrong_family(gw)) {
            return Err(Error::config(format!("{} gateway {} has the wrong family", family, gateway)));
        }
        for route in &self.routes {
            if wrong_family(&route.dest.addr()) || route.next_hop.as_ref().is_some_and(wrong_family)
            {
                return Err(Error::config(format!(
                    "{} route {} has the wrong family",
                    family, route.dest
                )));
            }
        }
        if let Some(ns) = self.dns.iter().find(|ns| wrong_family(ns)) {
            return Err(Error::config(format!("{} nameserver {} has the wrong family", family, ns)));
        }

        Ok(())
    }
}
