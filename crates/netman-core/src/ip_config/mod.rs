//! Per-interface, per-family IP configuration
//!
//! An [`IpConfig`] is a mutable, value-comparable bag of addresses, routes,
//! DNS data and a handful of scalars. Devices build one composite per family
//! by merging the fragments contributed by each [`ConfigSource`]:
//!
//! ```text
//!   kernel ─┐
//!   autoconf├─► merge ─► composite ─► commit ─► platform
//!   dhcp ───┤    ▲
//!   static ─┘    └── subtract(fragment) when a source retracts
//! ```
//!
//! Collections are [`DedupIndex`]es, so an entry contributed by two sources
//! survives the retraction of either one.

mod entry;
mod resolv;
mod setting;

pub use entry::{
    AddrFamily, AddressKey, ConfigSource, IpAddress, IpRoute, Lifetime, RouteKey,
};
pub use resolv::{parse_resolv_conf, read_resolv_conf, ResolvConf};

use sha2::{Digest, Sha256};
use std::fmt;
use std::net::IpAddr;
use tracing::debug;

use crate::dedup::{DedupEntry, DedupIndex, EntryHandle};
use crate::error::{Error, Result};
use crate::traits::Platform;

/// Options controlling [`IpConfig::merge`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeFlags {
    /// Skip default routes and the gateway
    pub never_default: bool,
    /// Skip non-default routes
    pub no_routes: bool,
    /// Skip nameservers, domains, searches and DNS options
    pub no_dns: bool,
    /// Give on-link routes of the source its gateway
    pub inherit_gateway: bool,
}

impl MergeFlags {
    pub fn never_default(mut self) -> Self {
        self.never_default = true;
        self
    }

    pub fn no_routes(mut self) -> Self {
        self.no_routes = true;
        self
    }

    pub fn no_dns(mut self) -> Self {
        self.no_dns = true;
        self
    }

    pub fn inherit_gateway(mut self) -> Self {
        self.inherit_gateway = true;
        self
    }
}

/// SHA-256 digest of a configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfigDigest([u8; 32]);

impl ConfigDigest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ConfigDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// IP configuration of one interface and one address family
#[derive(Debug, Clone, PartialEq)]
pub struct IpConfig {
    ifindex: u32,
    family: AddrFamily,
    addresses: DedupIndex<IpAddress>,
    routes: DedupIndex<IpRoute>,
    nameservers: DedupIndex<IpAddr>,
    domains: DedupIndex<String>,
    searches: DedupIndex<String>,
    dns_options: DedupIndex<String>,
    gateway: Option<IpAddr>,
    never_default: bool,
    dns_priority: i32,
    mss: u32,
    mtu: u32,
}

impl IpConfig {
    /// Empty configuration
    pub fn new(ifindex: u32, family: AddrFamily) -> Self {
        Self {
            ifindex,
            family,
            addresses: DedupIndex::new(),
            routes: DedupIndex::new(),
            nameservers: DedupIndex::new(),
            domains: DedupIndex::new(),
            searches: DedupIndex::new(),
            dns_options: DedupIndex::new(),
            gateway: None,
            never_default: false,
            dns_priority: 0,
            mss: 0,
            mtu: 0,
        }
    }

    /// Read the live configuration of an interface from the platform
    ///
    /// Entries the platform reports that fail validation are skipped. The
    /// gateway is taken from the best default route.
    pub async fn capture(
        platform: &dyn Platform,
        ifindex: u32,
        family: AddrFamily,
    ) -> Result<Self> {
        let mut config = Self::new(ifindex, family);
        for address in platform.get_addresses(ifindex, family).await? {
            if let Err(e) = config.add_address(address) {
                debug!("[{}] capture: skipping address: {}", ifindex, e);
            }
        }
        for route in platform.get_routes(ifindex, family).await? {
            if let Err(e) = config.add_route(route) {
                debug!("[{}] capture: skipping route: {}", ifindex, e);
            }
        }
        config.gateway = config.best_default_route().and_then(|r| r.gateway);
        Ok(config)
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    pub fn family(&self) -> AddrFamily {
        self.family
    }

    /// True when nothing at all is configured
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
            && self.routes.is_empty()
            && self.nameservers.is_empty()
            && self.domains.is_empty()
            && self.searches.is_empty()
            && self.dns_options.is_empty()
            && self.gateway.is_none()
    }

    // ---- composition -------------------------------------------------

    /// Union `src` into this configuration
    ///
    /// Every entry of `src` adds one ownership reference; scalars set in
    /// `src` overwrite ours. Membership does not depend on merge order.
    pub fn merge(&mut self, src: &IpConfig, flags: MergeFlags) {
        if src.family != self.family {
            debug!(
                "[{}] refusing to merge {} config into {}",
                self.ifindex, src.family, self.family
            );
            return;
        }
        let contribution = src.contribution(flags, self.gateway);

        for address in contribution.addresses.iter_shared() {
            self.addresses.insert_shared(address.clone());
        }
        for route in contribution.routes.iter_shared() {
            self.routes.insert_shared(route.clone());
        }
        for ns in contribution.nameservers.iter_shared() {
            self.nameservers.insert_shared(ns.clone());
        }
        for domain in contribution.domains.iter_shared() {
            self.domains.insert_shared(domain.clone());
        }
        for search in contribution.searches.iter_shared() {
            self.searches.insert_shared(search.clone());
        }
        for option in contribution.dns_options.iter_shared() {
            self.dns_options.insert_shared(option.clone());
        }

        if contribution.gateway.is_some() {
            self.gateway = contribution.gateway;
        }
        if contribution.dns_priority != 0 {
            self.dns_priority = contribution.dns_priority;
        }
        if contribution.mss != 0 {
            self.mss = contribution.mss;
        }
        if contribution.mtu != 0 {
            self.mtu = contribution.mtu;
        }
    }

    /// The exact part of this configuration that `merge` would take
    ///
    /// Merging the result with default flags is equivalent to merging
    /// `self` with `flags`, so a caller that keeps the filtered fragment can
    /// later `subtract` precisely what it added.
    pub fn filtered(&self, flags: MergeFlags) -> IpConfig {
        self.contribution(flags, None)
    }

    fn contribution(&self, flags: MergeFlags, fallback_gateway: Option<IpAddr>) -> IpConfig {
        let family = self.family;
        let never_default = flags.never_default || self.never_default;
        let mut out = IpConfig::new(self.ifindex, family);
        out.never_default = never_default;

        for address in self.addresses.iter_shared() {
            match address.validate(family) {
                Ok(()) => {
                    out.addresses.insert_shared(address.clone());
                }
                Err(e) => debug!("[{}] merge: dropping address: {}", self.ifindex, e),
            }
        }

        let inherited = if flags.inherit_gateway {
            self.gateway.or(fallback_gateway)
        } else {
            None
        };
        for route in self.routes.iter_shared() {
            if route.is_default() {
                if never_default {
                    continue;
                }
            } else if flags.no_routes {
                continue;
            }
            if let Err(e) = route.validate(family) {
                debug!("[{}] merge: dropping route: {}", self.ifindex, e);
                continue;
            }
            match (route.gateway, inherited) {
                (None, Some(gateway)) => {
                    out.routes.insert((**route).clone().with_gateway(gateway));
                }
                _ => {
                    out.routes.insert_shared(route.clone());
                }
            }
        }

        if !never_default {
            out.gateway = self.gateway.filter(|gw| valid_host(gw, family));
        }

        if !flags.no_dns {
            for ns in self.nameservers.iter_shared() {
                if valid_host(ns, family) {
                    out.nameservers.insert_shared(ns.clone());
                }
            }
            for domain in self.domains.iter_shared() {
                out.domains.insert_shared(domain.clone());
            }
            for search in self.searches.iter_shared() {
                out.searches.insert_shared(search.clone());
            }
            for option in self.dns_options.iter_shared() {
                out.dns_options.insert_shared(option.clone());
            }
            out.dns_priority = self.dns_priority;
        }
        out.mss = self.mss;
        out.mtu = self.mtu;
        out
    }

    /// Remove what `other` contributed
    ///
    /// Each entry of `other` releases one ownership reference, so entries
    /// also held by another source stay. Scalars equal to `other`'s are
    /// cleared.
    pub fn subtract(&mut self, other: &IpConfig) {
        for address in other.addresses.iter() {
            self.addresses.release(address);
        }
        for route in other.routes.iter() {
            self.routes.release(route);
        }
        for ns in other.nameservers.iter() {
            self.nameservers.release(ns);
        }
        for domain in other.domains.iter() {
            self.domains.release(domain);
        }
        for search in other.searches.iter() {
            self.searches.release(search);
        }
        for option in other.dns_options.iter() {
            self.dns_options.release(option);
        }
        if self.gateway.is_some() && self.gateway == other.gateway {
            self.gateway = None;
        }
        if other.dns_priority != 0 && self.dns_priority == other.dns_priority {
            self.dns_priority = 0;
        }
        if other.mss != 0 && self.mss == other.mss {
            self.mss = 0;
        }
        if other.mtu != 0 && self.mtu == other.mtu {
            self.mtu = 0;
        }
    }

    /// Keep only addresses and routes that `other` also has
    pub fn intersect(&mut self, other: &IpConfig) {
        self.addresses
            .retain(|a| other.addresses.contains_key(&a.key()));
        self.routes.retain(|r| other.routes.contains_key(&r.key()));
        if self.gateway != other.gateway {
            self.gateway = None;
        }
    }

    /// Make this configuration structurally equal to `other`
    ///
    /// Returns whether anything changed.
    pub fn replace(&mut self, other: &IpConfig) -> bool {
        if self == other {
            return false;
        }
        *self = other.clone();
        true
    }

    /// Digest over the configuration
    ///
    /// With `dns_only` only nameservers, domains, searches, options and the
    /// DNS priority are covered. Addresses and routes are hashed in identity
    /// order so that insertion order does not matter; DNS lists keep their
    /// order because it is significant to resolvers.
    pub fn hash(&self, dns_only: bool) -> ConfigDigest {
        let mut hasher = Sha256::new();
        if !dns_only {
            hasher.update([self.family.max_plen()]);

            let mut addresses: Vec<&IpAddress> = self.addresses.iter().collect();
            addresses.sort_by_key(|a| a.key());
            for a in addresses {
                hash_ip(&mut hasher, &a.address);
                hasher.update([a.plen]);
                match a.peer {
                    Some(peer) => hash_ip(&mut hasher, &peer),
                    None => hasher.update([0u8]),
                }
                hasher.update(a.lifetime.preferred.to_le_bytes());
                hasher.update(a.lifetime.valid.to_le_bytes());
            }

            let mut routes: Vec<&IpRoute> = self.routes.iter().collect();
            routes.sort_by_key(|r| r.key());
            for r in routes {
                hash_ip(&mut hasher, &r.network);
                hasher.update([r.plen]);
                match r.gateway {
                    Some(gw) => hash_ip(&mut hasher, &gw),
                    None => hasher.update([0u8]),
                }
                hasher.update(r.metric.to_le_bytes());
                hasher.update(r.mss.to_le_bytes());
            }

            match self.gateway {
                Some(gw) => hash_ip(&mut hasher, &gw),
                None => hasher.update([0u8]),
            }
            hasher.update([u8::from(self.never_default)]);
            hasher.update(self.mss.to_le_bytes());
            hasher.update(self.mtu.to_le_bytes());
        }

        for ns in self.nameservers.iter() {
            hash_ip(&mut hasher, ns);
        }
        for list in [&self.domains, &self.searches, &self.dns_options] {
            hasher.update((list.len() as u32).to_le_bytes());
            for s in list.iter() {
                hasher.update((s.len() as u32).to_le_bytes());
                hasher.update(s.as_bytes());
            }
        }
        hasher.update(self.dns_priority.to_le_bytes());

        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        ConfigDigest(out)
    }

    /// Structural equality (identical to `==`)
    pub fn equal(&self, other: &IpConfig) -> bool {
        self == other
    }

    /// Log the full configuration at debug level
    pub fn dump(&self, detail: &str) {
        debug!(
            "--------- IpConfig {} ifindex {} ({})",
            self.family, self.ifindex, detail
        );
        for a in self.addresses.iter() {
            debug!("    a: {}", a);
        }
        for r in self.routes.iter() {
            debug!("   rt: {}", r);
        }
        if let Some(gw) = self.gateway {
            debug!("   gw: {}", gw);
        }
        for ns in self.nameservers.iter() {
            debug!("   ns: {}", ns);
        }
        for d in self.domains.iter() {
            debug!(" domn: {}", d);
        }
        for s in self.searches.iter() {
            debug!("  srch: {}", s);
        }
        for o in self.dns_options.iter() {
            debug!(" dnsopt: {}", o);
        }
        debug!(
            " never_default: {} dns_priority: {} mss: {} mtu: {}",
            self.never_default, self.dns_priority, self.mss, self.mtu
        );
    }

    /// Load nameservers and options from resolv.conf contents
    ///
    /// Only entries of this configuration's family are taken. Returns true
    /// when anything was added.
    pub fn capture_resolv_conf(&mut self, contents: &str) -> bool {
        let parsed = parse_resolv_conf(contents);
        let mut changed = false;
        for ns in parsed.nameservers {
            if AddrFamily::of(&ns) == self.family {
                changed |= self.add_nameserver(ns);
            }
        }
        for option in parsed.options {
            changed |= self.add_dns_option(&option);
        }
        changed
    }

    // ---- addresses ---------------------------------------------------

    /// Add an address, replacing the metadata of an existing identity
    pub fn add_address(&mut self, address: IpAddress) -> Result<EntryHandle> {
        address.validate(self.family)?;
        if let Some(handle) = self.addresses.handle_of(&address.key()) {
            if self.addresses.lookup(&address.key()) == Some(&address) {
                return Ok(handle);
            }
            self.addresses.remove_key(&address.key());
        }
        Ok(self.addresses.insert(address))
    }

    /// Release the reference held through `handle`
    pub fn remove_address(&mut self, handle: EntryHandle) -> bool {
        self.addresses.remove(handle).is_some()
    }

    /// Drop an address regardless of who contributed it
    pub fn del_address(&mut self, key: &AddressKey) -> bool {
        self.addresses.remove_key(key).is_some()
    }

    pub fn reset_addresses(&mut self) {
        self.addresses.clear();
    }

    pub fn addresses(&self) -> impl Iterator<Item = &IpAddress> + '_ {
        self.addresses.iter()
    }

    pub fn address_index(&self) -> &DedupIndex<IpAddress> {
        &self.addresses
    }

    pub fn num_addresses(&self) -> usize {
        self.addresses.len()
    }

    pub fn address(&self, i: usize) -> Option<&IpAddress> {
        self.addresses.get(i)
    }

    pub fn first_address(&self) -> Option<&IpAddress> {
        self.addresses.get(0)
    }

    /// Find the address entry carrying `addr`, whatever its prefix
    pub fn lookup_address(&self, addr: &IpAddr) -> Option<&IpAddress> {
        self.addresses.iter().find(|a| a.address == *addr)
    }

    /// Whether an address with the same identity is present
    pub fn address_exists(&self, address: &IpAddress) -> bool {
        self.addresses.contains_key(&address.key())
    }

    /// First address that has completed DAD
    pub fn first_nontentative_address(&self, link_local: bool) -> Option<&IpAddress> {
        self.addresses
            .iter()
            .find(|a| !a.tentative && a.is_link_local() == link_local)
    }

    /// Whether any of `candidates` is still tentative here
    pub fn has_any_dad_pending(&self, candidates: &IpConfig) -> bool {
        self.addresses
            .iter()
            .any(|a| a.tentative && candidates.addresses.contains_key(&a.key()))
    }

    /// Order addresses by preference
    ///
    /// Global before link-local, usable before tentative, preferred before
    /// deprecated. Returns true when the order changed.
    pub fn sort_addresses(&mut self) -> bool {
        let before: Vec<AddressKey> = self.addresses.iter().map(|a| a.key()).collect();
        self.addresses.sort_by(|a, b| address_rank(a).cmp(&address_rank(b)));
        let after: Vec<AddressKey> = self.addresses.iter().map(|a| a.key()).collect();
        before != after
    }

    // ---- routes ------------------------------------------------------

    /// Add a route, replacing the metadata of an existing identity
    ///
    /// An unspecified gateway is normalized to an on-link route.
    pub fn add_route(&mut self, mut route: IpRoute) -> Result<EntryHandle> {
        route.validate(self.family)?;
        if route.gateway.is_some_and(|gw| gw.is_unspecified()) {
            route.gateway = None;
        }
        if let Some(handle) = self.routes.handle_of(&route.key()) {
            if self.routes.lookup(&route.key()) == Some(&route) {
                return Ok(handle);
            }
            self.routes.remove_key(&route.key());
        }
        Ok(self.routes.insert(route))
    }

    pub fn remove_route(&mut self, handle: EntryHandle) -> bool {
        self.routes.remove(handle).is_some()
    }

    pub fn del_route(&mut self, key: &RouteKey) -> bool {
        self.routes.remove_key(key).is_some()
    }

    pub fn reset_routes(&mut self) {
        self.routes.clear();
    }

    pub fn routes(&self) -> impl Iterator<Item = &IpRoute> + '_ {
        self.routes.iter()
    }

    pub fn route_index(&self) -> &DedupIndex<IpRoute> {
        &self.routes
    }

    pub fn num_routes(&self) -> usize {
        self.routes.len()
    }

    pub fn route(&self, i: usize) -> Option<&IpRoute> {
        self.routes.get(i)
    }

    pub fn lookup_route(&self, key: &RouteKey) -> Option<&IpRoute> {
        self.routes.lookup(key)
    }

    /// Lowest-metric default route
    pub fn best_default_route(&self) -> Option<&IpRoute> {
        self.routes
            .iter()
            .filter(|r| r.is_default())
            .min_by_key(|r| r.metric)
    }

    pub fn has_default_route(&self) -> bool {
        self.routes.iter().any(IpRoute::is_default)
    }

    /// Most specific on-link route covering `host`
    pub fn direct_route_for_host(&self, host: &IpAddr) -> Option<&IpRoute> {
        self.routes
            .iter()
            .filter(|r| r.gateway.is_none() && !r.is_default())
            .filter(|r| r.destination().is_some_and(|net| net.contains(host)))
            .min_by(|a, b| b.plen.cmp(&a.plen).then(a.metric.cmp(&b.metric)))
    }

    /// The address whose subnet contains `host`
    pub fn subnet_for_host(&self, host: &IpAddr) -> Option<&IpAddress> {
        self.addresses
            .iter()
            .find(|a| a.network().is_some_and(|net| net.contains(host)))
    }

    /// Whether `dest/plen` is reachable without a gateway
    pub fn destination_is_direct(&self, dest: &IpAddr, plen: u8) -> bool {
        self.addresses.iter().any(|a| {
            a.plen <= plen && a.network().is_some_and(|net| net.contains(dest))
        })
    }

    // ---- DNS ---------------------------------------------------------

    /// Add a nameserver; duplicates and invalid addresses are ignored
    pub fn add_nameserver(&mut self, ns: IpAddr) -> bool {
        if !valid_host(&ns, self.family) || self.nameservers.contains_key(&ns) {
            return false;
        }
        self.nameservers.insert(ns);
        true
    }

    pub fn del_nameserver(&mut self, i: usize) -> bool {
        remove_nth(&mut self.nameservers, i)
    }

    pub fn reset_nameservers(&mut self) {
        self.nameservers.clear();
    }

    pub fn nameservers(&self) -> impl Iterator<Item = &IpAddr> + '_ {
        self.nameservers.iter()
    }

    pub fn num_nameservers(&self) -> usize {
        self.nameservers.len()
    }

    pub fn nameserver(&self, i: usize) -> Option<&IpAddr> {
        self.nameservers.get(i)
    }

    pub fn add_domain(&mut self, domain: &str) -> bool {
        add_string(&mut self.domains, domain)
    }

    pub fn del_domain(&mut self, i: usize) -> bool {
        remove_nth(&mut self.domains, i)
    }

    pub fn reset_domains(&mut self) {
        self.domains.clear();
    }

    pub fn domains(&self) -> impl Iterator<Item = &String> + '_ {
        self.domains.iter()
    }

    pub fn add_search(&mut self, search: &str) -> bool {
        add_string(&mut self.searches, search)
    }

    pub fn del_search(&mut self, i: usize) -> bool {
        remove_nth(&mut self.searches, i)
    }

    pub fn reset_searches(&mut self) {
        self.searches.clear();
    }

    pub fn searches(&self) -> impl Iterator<Item = &String> + '_ {
        self.searches.iter()
    }

    pub fn add_dns_option(&mut self, option: &str) -> bool {
        add_string(&mut self.dns_options, option)
    }

    pub fn del_dns_option(&mut self, i: usize) -> bool {
        remove_nth(&mut self.dns_options, i)
    }

    pub fn reset_dns_options(&mut self) {
        self.dns_options.clear();
    }

    pub fn dns_options(&self) -> impl Iterator<Item = &String> + '_ {
        self.dns_options.iter()
    }

    // ---- scalars -----------------------------------------------------

    pub fn gateway(&self) -> Option<IpAddr> {
        self.gateway
    }

    /// Set the gateway; an unspecified or wrong-family address clears it
    pub fn set_gateway(&mut self, gateway: Option<IpAddr>) {
        self.gateway = gateway.filter(|gw| valid_host(gw, self.family));
    }

    pub fn never_default(&self) -> bool {
        self.never_default
    }

    pub fn set_never_default(&mut self, never_default: bool) {
        self.never_default = never_default;
    }

    pub fn dns_priority(&self) -> i32 {
        self.dns_priority
    }

    pub fn set_dns_priority(&mut self, priority: i32) {
        self.dns_priority = priority;
    }

    pub fn mss(&self) -> u32 {
        self.mss
    }

    pub fn set_mss(&mut self, mss: u32) {
        self.mss = mss;
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    pub fn set_mtu(&mut self, mtu: u32) {
        self.mtu = mtu;
    }

    /// Reject a configuration that can never be committed
    pub fn validate(&self) -> Result<()> {
        for a in self.addresses.iter() {
            a.validate(self.family)?;
        }
        for r in self.routes.iter() {
            r.validate(self.family)?;
        }
        if let Some(gw) = self.gateway {
            if !valid_host(&gw, self.family) {
                return Err(Error::invalid_input(format!("invalid gateway {}", gw)));
            }
        }
        Ok(())
    }
}

fn valid_host(addr: &IpAddr, family: AddrFamily) -> bool {
    AddrFamily::of(addr) == family && !addr.is_unspecified()
}

fn hash_ip(hasher: &mut Sha256, addr: &IpAddr) {
    match addr {
        IpAddr::V4(v4) => {
            hasher.update([4u8]);
            hasher.update(v4.octets());
        }
        IpAddr::V6(v6) => {
            hasher.update([6u8]);
            hasher.update(v6.octets());
        }
    }
}

fn address_rank(a: &IpAddress) -> (bool, bool, bool) {
    (a.is_link_local(), a.tentative, a.lifetime.preferred == 0)
}

fn add_string(index: &mut DedupIndex<String>, value: &str) -> bool {
    let value = value.trim();
    if value.is_empty() || index.contains_key(&value.to_string()) {
        return false;
    }
    index.insert(value.to_string());
    true
}

fn remove_nth<T: DedupEntry>(index: &mut DedupIndex<T>, i: usize) -> bool {
    match index.get(i).map(DedupEntry::key) {
        Some(key) => index.remove_key(&key).is_some(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn dhcp_fragment() -> IpConfig {
        let mut cfg = IpConfig::new(2, AddrFamily::V4);
        cfg.add_address(
            IpAddress::new(ip("192.168.1.10"), 24)
                .with_source(ConfigSource::Dhcp)
                .with_lifetime(Lifetime::new(3600, 3600)),
        )
        .unwrap();
        cfg.add_route(
            IpRoute::default_via(ip("192.168.1.1"), 100).with_source(ConfigSource::Dhcp),
        )
        .unwrap();
        cfg.set_gateway(Some(ip("192.168.1.1")));
        cfg.add_nameserver(ip("192.168.1.1"));
        cfg
    }

    fn static_fragment() -> IpConfig {
        let mut cfg = IpConfig::new(2, AddrFamily::V4);
        cfg.add_address(IpAddress::new(ip("10.0.0.5"), 24)).unwrap();
        cfg.add_route(IpRoute::default_via(ip("192.168.1.1"), 100))
            .unwrap();
        cfg.add_nameserver(ip("8.8.8.8"));
        cfg
    }

    fn address_keys(cfg: &IpConfig) -> Vec<AddressKey> {
        let mut keys: Vec<_> = cfg.addresses().map(|a| a.key()).collect();
        keys.sort();
        keys
    }

    fn route_keys(cfg: &IpConfig) -> Vec<RouteKey> {
        let mut keys: Vec<_> = cfg.routes().map(|r| r.key()).collect();
        keys.sort();
        keys
    }

    #[test]
    fn test_merge_membership_is_order_independent() {
        let mut ab = IpConfig::new(2, AddrFamily::V4);
        ab.merge(&dhcp_fragment(), MergeFlags::default());
        ab.merge(&static_fragment(), MergeFlags::default());

        let mut ba = IpConfig::new(2, AddrFamily::V4);
        ba.merge(&static_fragment(), MergeFlags::default());
        ba.merge(&dhcp_fragment(), MergeFlags::default());

        assert_eq!(address_keys(&ab), address_keys(&ba));
        assert_eq!(route_keys(&ab), route_keys(&ba));
        assert_eq!(ab.hash(false), ba.hash(false) );
    }

    #[test]
    fn test_merge_then_subtract_restores_shared_route() {
        let mut composite = IpConfig::new(2, AddrFamily::V4);
        composite.merge(&static_fragment(), MergeFlags::default());
        let before = composite.clone();

        let dhcp = dhcp_fragment();
        composite.merge(&dhcp, MergeFlags::default());
        assert_eq!(composite.num_addresses(), 2);
        assert_eq!(composite.num_routes(), 1);

        composite.subtract(&dhcp);
        assert_eq!(address_keys(&composite), address_keys(&before));
        assert_eq!(composite.num_routes(), 1);
        let route = composite.best_default_route().unwrap();
        assert_eq!(route.source, ConfigSource::Static);
    }

    #[test]
    fn test_merge_never_default_drops_default_routes() {
        let mut composite = IpConfig::new(2, AddrFamily::V4);
        composite.merge(&dhcp_fragment(), MergeFlags::default().never_default());
        assert!(!composite.has_default_route());
        assert_eq!(composite.gateway(), None);
        assert_eq!(composite.num_addresses(), 1);
    }

    #[test]
    fn test_merge_no_dns_and_no_routes() {
        let mut frag = dhcp_fragment();
        frag.add_route(IpRoute::new(ip("172.16.0.0"), 16, 100)).unwrap();

        let mut composite = IpConfig::new(2, AddrFamily::V4);
        composite.merge(&frag, MergeFlags::default().no_dns().no_routes());
        assert_eq!(composite.num_nameservers(), 0);
        // default routes are governed by never_default only
        assert_eq!(composite.num_routes(), 1);
        assert!(composite.has_default_route());
    }

    #[test]
    fn test_merge_inherit_gateway() {
        let mut frag = IpConfig::new(2, AddrFamily::V4);
        frag.add_route(IpRoute::new(ip("172.16.0.0"), 16, 50)).unwrap();
        frag.set_gateway(Some(ip("10.0.0.1")));

        let mut composite = IpConfig::new(2, AddrFamily::V4);
        composite.merge(&frag, MergeFlags::default().inherit_gateway());
        let route = composite.route(0).unwrap();
        assert_eq!(route.gateway, Some(ip("10.0.0.1")));
    }

    #[test]
    fn test_filtered_subtracts_exactly() {
        let mut composite = IpConfig::new(2, AddrFamily::V4);
        composite.merge(&static_fragment(), MergeFlags::default());

        let flags = MergeFlags::default().never_default();
        let contribution = dhcp_fragment().filtered(flags);
        composite.merge(&contribution, MergeFlags::default());
        composite.subtract(&contribution);

        // the static default route was never shadowed, so it must survive
        assert!(composite.has_default_route());
    }

    #[test]
    fn test_invalid_entries_rejected() {
        let mut cfg = IpConfig::new(2, AddrFamily::V4);
        assert!(cfg.add_address(IpAddress::new(ip("0.0.0.0"), 0)).is_err());
        assert!(cfg.add_address(IpAddress::new(ip("fe80::1"), 64)).is_err());
        assert!(!cfg.add_nameserver(ip("0.0.0.0")));
        cfg.set_gateway(Some(ip("0.0.0.0")));
        assert_eq!(cfg.gateway(), None);

        cfg.add_route(IpRoute::default_via(ip("0.0.0.0"), 10))
            .unwrap();
        assert_eq!(cfg.route(0).unwrap().gateway, None);
    }

    #[test]
    fn test_duplicate_address_replaces_metadata() {
        let mut cfg = IpConfig::new(2, AddrFamily::V4);
        cfg.add_address(IpAddress::new(ip("10.0.0.5"), 24)).unwrap();
        cfg.add_address(
            IpAddress::new(ip("10.0.0.5"), 24).with_lifetime(Lifetime::new(60, 120)),
        )
        .unwrap();
        assert_eq!(cfg.num_addresses(), 1);
        assert_eq!(cfg.first_address().unwrap().lifetime.valid, 120);
    }

    #[test]
    fn test_hash_independent_of_insertion_order() {
        let mut a = IpConfig::new(2, AddrFamily::V4);
        a.add_address(IpAddress::new(ip("10.0.0.5"), 24)).unwrap();
        a.add_address(IpAddress::new(ip("10.0.1.5"), 24)).unwrap();

        let mut b = IpConfig::new(2, AddrFamily::V4);
        b.add_address(IpAddress::new(ip("10.0.1.5"), 24)).unwrap();
        b.add_address(IpAddress::new(ip("10.0.0.5"), 24)).unwrap();

        assert_eq!(a.hash(false), b.hash(false));
        assert_eq!(a.hash(true), IpConfig::new(2, AddrFamily::V4).hash(true));
    }

    #[test]
    fn test_hash_dns_order_matters() {
        let mut a = IpConfig::new(2, AddrFamily::V4);
        a.add_nameserver(ip("1.1.1.1"));
        a.add_nameserver(ip("8.8.8.8"));

        let mut b = IpConfig::new(2, AddrFamily::V4);
        b.add_nameserver(ip("8.8.8.8"));
        b.add_nameserver(ip("1.1.1.1"));

        assert_ne!(a.hash(true), b.hash(true));
    }

    #[test]
    fn test_replace_reports_change() {
        let mut a = IpConfig::new(2, AddrFamily::V4);
        let b = static_fragment();
        assert!(a.replace(&b));
        assert!(a.equal(&b));
        assert!(!a.replace(&b));
    }

    #[test]
    fn test_intersect() {
        let mut live = dhcp_fragment();
        live.add_address(IpAddress::new(ip("10.9.9.9"), 8)).unwrap();
        live.intersect(&dhcp_fragment());
        assert_eq!(live.num_addresses(), 1);
        assert_eq!(live.gateway(), Some(ip("192.168.1.1")));
    }

    #[test]
    fn test_host_lookups() {
        let mut cfg = IpConfig::new(2, AddrFamily::V4);
        cfg.add_address(IpAddress::new(ip("192.168.1.10"), 24)).unwrap();
        cfg.add_route(IpRoute::new(ip("192.168.1.0"), 24, 100)).unwrap();
        cfg.add_route(IpRoute::new(ip("192.168.1.128"), 25, 100))
            .unwrap();

        assert!(cfg.destination_is_direct(&ip("192.168.1.0"), 24));
        assert!(!cfg.destination_is_direct(&ip("10.0.0.0"), 8));
        assert_eq!(
            cfg.subnet_for_host(&ip("192.168.1.77")).unwrap().address,
            ip("192.168.1.10")
        );
        assert_eq!(
            cfg.direct_route_for_host(&ip("192.168.1.200")).unwrap().plen,
            25
        );
        assert_eq!(cfg.lookup_address(&ip("192.168.1.10")).unwrap().plen, 24);
    }

    #[test]
    fn test_dad_and_sorting() {
        let mut cfg = IpConfig::new(2, AddrFamily::V6);
        cfg.add_address(IpAddress::new(ip("fe80::1"), 64)).unwrap();
        cfg.add_address(IpAddress::new(ip("2001:db8::1"), 64).with_tentative(true))
            .unwrap();
        cfg.add_address(IpAddress::new(ip("2001:db8::2"), 64)).unwrap();

        assert_eq!(
            cfg.first_nontentative_address(false).unwrap().address,
            ip("2001:db8::2")
        );
        assert!(cfg.has_any_dad_pending(&cfg.clone()));

        assert!(cfg.sort_addresses());
        assert_eq!(cfg.first_address().unwrap().address, ip("2001:db8::2"));
        assert!(!cfg.sort_addresses());
    }

    #[test]
    fn test_capture_resolv_conf_filters_family() {
        let mut cfg = IpConfig::new(2, AddrFamily::V4);
        let changed = cfg.capture_resolv_conf(
            "nameserver 9.9.9.9\nnameserver 2001:4860::8888\noptions rotate\n",
        );
        assert!(changed);
        assert_eq!(cfg.nameservers().collect::<Vec<_>>(), vec![&ip("9.9.9.9")]);
        assert_eq!(cfg.dns_options().count(), 1);
        assert!(!cfg.capture_resolv_conf("nameserver 9.9.9.9\n"));
    }

    #[test]
    fn test_dns_lists_deduplicate() {
        let mut cfg = IpConfig::new(2, AddrFamily::V4);
        assert!(cfg.add_search("example.com"));
        assert!(!cfg.add_search("example.com"));
        assert!(!cfg.add_search("  "));
        assert!(cfg.del_search(0));
        assert!(!cfg.del_search(0));
    }
}
