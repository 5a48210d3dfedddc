//! Address and route value objects
//!
//! Both types are immutable once built; the builder-style `with_*` methods
//! consume and return a new value.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::dedup::DedupEntry;

/// Address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddrFamily {
    V4,
    V6,
}

impl AddrFamily {
    /// Both families, IPv4 first
    pub const ALL: [AddrFamily; 2] = [AddrFamily::V4, AddrFamily::V6];

    /// Family of an address
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddrFamily::V4,
            IpAddr::V6(_) => AddrFamily::V6,
        }
    }

    /// Longest valid prefix length
    pub fn max_plen(self) -> u8 {
        match self {
            AddrFamily::V4 => 32,
            AddrFamily::V6 => 128,
        }
    }

    /// The unspecified ("any") address of this family
    pub fn unspecified(self) -> IpAddr {
        match self {
            AddrFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddrFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

impl fmt::Display for AddrFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrFamily::V4 => write!(f, "ipv4"),
            AddrFamily::V6 => write!(f, "ipv6"),
        }
    }
}

/// Named contributor of configuration fragments
///
/// Variants are declared in merge order: when a device builds its composite
/// configuration it merges fragments from the first variant to the last, so
/// later sources win scalar fields. Static profile settings come last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigSource {
    /// Created by the kernel itself (prefix routes, link-local addresses)
    Kernel,
    /// Inherited from a master device
    Slave,
    /// IPv6 router advertisements / SLAAC
    Autoconf,
    /// DHCP lease
    Dhcp,
    /// VPN plugin
    Vpn,
    /// Added to the interface by another actor
    External,
    /// Profile settings
    Static,
}

impl ConfigSource {
    /// Stable name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigSource::Kernel => "kernel",
            ConfigSource::Slave => "slave",
            ConfigSource::Autoconf => "autoconf",
            ConfigSource::Dhcp => "dhcp",
            ConfigSource::Vpn => "vpn",
            ConfigSource::External => "external",
            ConfigSource::Static => "static",
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address lifetimes in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lifetime {
    pub preferred: u32,
    pub valid: u32,
}

impl Lifetime {
    pub const INFINITE: u32 = u32::MAX;

    /// Permanent address
    pub fn infinite() -> Self {
        Self {
            preferred: Self::INFINITE,
            valid: Self::INFINITE,
        }
    }

    /// Finite lifetime; `preferred` is clamped to `valid`
    pub fn new(preferred: u32, valid: u32) -> Self {
        Self {
            preferred: preferred.min(valid),
            valid,
        }
    }

    pub fn is_infinite(&self) -> bool {
        self.valid == Self::INFINITE
    }
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::infinite()
    }
}

/// Identity of an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressKey {
    pub address: IpAddr,
    pub plen: u8,
}

/// An address assigned to an interface
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpAddress {
    pub address: IpAddr,
    pub plen: u8,
    #[serde(default)]
    pub peer: Option<IpAddr>,
    pub source: ConfigSource,
    #[serde(default)]
    pub lifetime: Lifetime,
    /// Duplicate address detection still pending
    #[serde(default)]
    pub tentative: bool,
}

impl IpAddress {
    /// Permanent static address
    pub fn new(address: IpAddr, plen: u8) -> Self {
        Self {
            address,
            plen,
            peer: None,
            source: ConfigSource::Static,
            lifetime: Lifetime::infinite(),
            tentative: false,
        }
    }

    pub fn with_source(mut self, source: ConfigSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn with_peer(mut self, peer: IpAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_tentative(mut self, tentative: bool) -> Self {
        self.tentative = tentative;
        self
    }

    pub fn family(&self) -> AddrFamily {
        AddrFamily::of(&self.address)
    }

    /// The subnet this address lives in
    pub fn network(&self) -> Option<IpNet> {
        IpNet::new(self.address, self.plen).ok().map(|net| net.trunc())
    }

    /// `address/plen` with the host bits kept
    pub fn network_with_host(&self) -> Option<IpNet> {
        IpNet::new(self.address, self.plen).ok()
    }

    pub fn is_link_local(&self) -> bool {
        match self.address {
            IpAddr::V4(v4) => v4.is_link_local(),
            IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
        }
    }

    /// Check the entry is acceptable for an interface of `family`
    pub fn validate(&self, family: AddrFamily) -> crate::Result<()> {
        if self.family() != family {
            return Err(crate::Error::invalid_input(format!(
                "address {} is not {}",
                self.address, family
            )));
        }
        if self.address.is_unspecified() {
            return Err(crate::Error::invalid_input("address is unspecified"));
        }
        if self.plen > family.max_plen() {
            return Err(crate::Error::invalid_input(format!(
                "prefix length {} out of range for {}",
                self.plen, family
            )));
        }
        Ok(())
    }

    /// Whether the kernel would see both addresses as the same object
    ///
    /// The source tag is bookkeeping only and never reaches the platform.
    pub fn same_on_platform(&self, other: &Self) -> bool {
        self.address == other.address
            && self.plen == other.plen
            && self.peer == other.peer
            && self.lifetime == other.lifetime
    }
}

impl DedupEntry for IpAddress {
    type Key = AddressKey;

    fn key(&self) -> AddressKey {
        AddressKey {
            address: self.address,
            plen: self.plen,
        }
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.plen)?;
        if let Some(peer) = self.peer {
            write!(f, " peer {}", peer)?;
        }
        if !self.lifetime.is_infinite() {
            write!(
                f,
                " lft {}/{}",
                self.lifetime.preferred, self.lifetime.valid
            )?;
        }
        write!(f, " src {}", self.source)
    }
}

/// Identity of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub network: IpAddr,
    pub plen: u8,
    pub metric: u32,
}

/// A route through an interface
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpRoute {
    /// Destination, masked to `plen`
    pub network: IpAddr,
    pub plen: u8,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    pub metric: u32,
    #[serde(default)]
    pub mss: u32,
    pub source: ConfigSource,
}

impl IpRoute {
    /// On-link route to `network/plen`; host bits are cleared
    pub fn new(network: IpAddr, plen: u8, metric: u32) -> Self {
        let network = IpNet::new(network, plen)
            .map(|net| net.network())
            .unwrap_or(network);
        Self {
            network,
            plen,
            gateway: None,
            metric,
            mss: 0,
            source: ConfigSource::Static,
        }
    }

    /// Default route via `gateway`
    pub fn default_via(gateway: IpAddr, metric: u32) -> Self {
        Self::new(AddrFamily::of(&gateway).unspecified(), 0, metric).with_gateway(gateway)
    }

    pub fn with_gateway(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_source(mut self, source: ConfigSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_mss(mut self, mss: u32) -> Self {
        self.mss = mss;
        self
    }

    pub fn with_metric(mut self, metric: u32) -> Self {
        self.metric = metric;
        self
    }

    pub fn family(&self) -> AddrFamily {
        AddrFamily::of(&self.network)
    }

    pub fn is_default(&self) -> bool {
        self.plen == 0
    }

    pub fn destination(&self) -> Option<IpNet> {
        IpNet::new(self.network, self.plen).ok()
    }

    /// Check the entry is acceptable for an interface of `family`
    pub fn validate(&self, family: AddrFamily) -> crate::Result<()> {
        if self.family() != family {
            return Err(crate::Error::invalid_input(format!(
                "route {}/{} is not {}",
                self.network, self.plen, family
            )));
        }
        if self.plen > family.max_plen() {
            return Err(crate::Error::invalid_input(format!(
                "prefix length {} out of range for {}",
                self.plen, family
            )));
        }
        if let Some(gateway) = self.gateway {
            if AddrFamily::of(&gateway) != family {
                return Err(crate::Error::invalid_input(format!(
                    "gateway {} is not {}",
                    gateway, family
                )));
            }
        }
        Ok(())
    }

    /// Whether the kernel would see both routes as the same object
    pub fn same_on_platform(&self, other: &Self) -> bool {
        self.network == other.network
            && self.plen == other.plen
            && self.metric == other.metric
            && self.gateway == other.gateway
            && self.mss == other.mss
    }
}

impl DedupEntry for IpRoute {
    type Key = RouteKey;

    fn key(&self) -> RouteKey {
        RouteKey {
            network: self.network,
            plen: self.plen,
            metric: self.metric,
        }
    }
}

impl fmt::Display for IpRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            write!(f, "default")?;
        } else {
            write!(f, "{}/{}", self.network, self.plen)?;
        }
        if let Some(gateway) = self.gateway {
            write!(f, " via {}", gateway)?;
        }
        write!(f, " metric {}", self.metric)?;
        if self.mss != 0 {
            write!(f, " mss {}", self.mss)?;
        }
        write!(f, " src {}", self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_network_is_masked() {
        let route = IpRoute::new("192.168.7.99".parse().unwrap(), 24, 100);
        assert_eq!(route.network, "192.168.7.0".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_default_route() {
        let route = IpRoute::default_via("10.0.0.1".parse().unwrap(), 100);
        assert!(route.is_default());
        assert_eq!(route.network, "0.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(route.to_string(), "default via 10.0.0.1 metric 100 src static");
    }

    #[test]
    fn test_route_identity_includes_metric() {
        let a = IpRoute::default_via("10.0.0.1".parse().unwrap(), 100);
        let b = IpRoute::default_via("10.0.0.254".parse().unwrap(), 100);
        let c = a.clone().with_metric(200);

        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_address_validation() {
        let any = IpAddress::new("0.0.0.0".parse().unwrap(), 8);
        assert!(any.validate(AddrFamily::V4).is_err());

        let v6 = IpAddress::new("2001:db8::1".parse().unwrap(), 64);
        assert!(v6.validate(AddrFamily::V4).is_err());
        assert!(v6.validate(AddrFamily::V6).is_ok());

        let long = IpAddress::new("10.0.0.1".parse().unwrap(), 33);
        assert!(long.validate(AddrFamily::V4).is_err());
    }

    #[test]
    fn test_address_platform_equality_ignores_source() {
        let a = IpAddress::new("10.0.0.5".parse().unwrap(), 24);
        let b = a.clone().with_source(ConfigSource::Dhcp);

        assert_ne!(a, b);
        assert!(a.same_on_platform(&b));
        assert!(!a.same_on_platform(&b.with_lifetime(Lifetime::new(300, 600))));
    }

    #[test]
    fn test_link_local_detection() {
        assert!(IpAddress::new("fe80::1".parse().unwrap(), 64).is_link_local());
        assert!(IpAddress::new("169.254.3.4".parse().unwrap(), 16).is_link_local());
        assert!(!IpAddress::new("2001:db8::1".parse().unwrap(), 64).is_link_local());
    }
}
