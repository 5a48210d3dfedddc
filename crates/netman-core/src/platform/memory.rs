// # Memory Platform
//
// In-memory implementation of Platform.
//
// ## Purpose
//
// Simulates the kernel's link, address and route tables so that devices and
// the commit engine can be driven without privileges. Used by the tests and
// by the daemon's simulated mode.
//
// ## Behavior
//
// - Adding an existing address or route fails with "File exists"
// - Deleting an absent address or route fails with `Error::NotFound`
// - A route via a gateway that no address or on-link route covers fails
//   with "Network is unreachable"
// - Every attempted mutation is recorded, including failed ones
// - Events are emitted only for changes made through the `external_*` and
//   link hooks; changes requested through the `Platform` trait are silent

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{trace, warn};

use crate::dedup::DedupEntry;
use crate::ip_config::{AddrFamily, IpAddress, IpRoute};
use crate::traits::platform::{Link, Platform, PlatformEvent};
use crate::Error;

const EVENT_CAPACITY: usize = 256;

/// Kind of a platform mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformOpKind {
    AddAddress,
    ReplaceAddress,
    DeleteAddress,
    AddRoute,
    ReplaceRoute,
    DeleteRoute,
    SetMtu,
}

/// A recorded platform mutation
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformOp {
    AddAddress { ifindex: u32, address: IpAddress },
    ReplaceAddress { ifindex: u32, address: IpAddress },
    DeleteAddress { ifindex: u32, address: IpAddress },
    AddRoute { ifindex: u32, route: IpRoute },
    ReplaceRoute { ifindex: u32, route: IpRoute },
    DeleteRoute { ifindex: u32, route: IpRoute },
    SetMtu { ifindex: u32, mtu: u32 },
}

impl PlatformOp {
    pub fn kind(&self) -> PlatformOpKind {
        match self {
            PlatformOp::AddAddress { .. } => PlatformOpKind::AddAddress,
            PlatformOp::ReplaceAddress { .. } => PlatformOpKind::ReplaceAddress,
            PlatformOp::DeleteAddress { .. } => PlatformOpKind::DeleteAddress,
            PlatformOp::AddRoute { .. } => PlatformOpKind::AddRoute,
            PlatformOp::ReplaceRoute { .. } => PlatformOpKind::ReplaceRoute,
            PlatformOp::DeleteRoute { .. } => PlatformOpKind::DeleteRoute,
            PlatformOp::SetMtu { .. } => PlatformOpKind::SetMtu,
        }
    }

    pub fn ifindex(&self) -> u32 {
        match self {
            PlatformOp::AddAddress { ifindex, .. }
            | PlatformOp::ReplaceAddress { ifindex, .. }
            | PlatformOp::DeleteAddress { ifindex, .. }
            | PlatformOp::AddRoute { ifindex, .. }
            | PlatformOp::ReplaceRoute { ifindex, .. }
            | PlatformOp::DeleteRoute { ifindex, .. }
            | PlatformOp::SetMtu { ifindex, .. } => *ifindex,
        }
    }

    /// Whether the operation touches `addr` (address, destination or gateway)
    fn touches(&self, addr: &IpAddr) -> bool {
        match self {
            PlatformOp::AddAddress { address, .. }
            | PlatformOp::ReplaceAddress { address, .. }
            | PlatformOp::DeleteAddress { address, .. } => address.address == *addr,
            PlatformOp::AddRoute { route, .. }
            | PlatformOp::ReplaceRoute { route, .. }
            | PlatformOp::DeleteRoute { route, .. } => {
                route.network == *addr || route.gateway == Some(*addr)
            }
            PlatformOp::SetMtu { .. } => false,
        }
    }
}

/// How an injected failure manifests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Transient (EBUSY)
    Busy,
    /// Permanent rejection
    Reject,
}

#[derive(Debug, Clone)]
struct FailureRule {
    kind: PlatformOpKind,
    target: Option<IpAddr>,
    failure: InjectedFailure,
    remaining: usize,
}

#[derive(Debug, Default)]
struct Inner {
    links: BTreeMap<u32, Link>,
    addresses: BTreeMap<u32, Vec<IpAddress>>,
    routes: BTreeMap<u32, Vec<IpRoute>>,
    ops: Vec<PlatformOp>,
    failures: Vec<FailureRule>,
}

impl Inner {
    fn record(&mut self, op: PlatformOp) -> Result<(), Error> {
        trace!("memory platform: {:?}", op);
        let failure = self
            .failures
            .iter_mut()
            .find(|rule| {
                rule.remaining > 0
                    && rule.kind == op.kind()
                    && rule.target.is_none_or(|target| op.touches(&target))
            })
            .map(|rule| {
                rule.remaining -= 1;
                rule.failure
            });
        self.failures.retain(|rule| rule.remaining > 0);
        let ifindex = op.ifindex();
        self.ops.push(op);

        match failure {
            Some(InjectedFailure::Busy) => Err(Error::busy("Device or resource busy")),
            Some(InjectedFailure::Reject) => Err(Error::platform("Operation not permitted")),
            None if !self.links.contains_key(&ifindex) => {
                Err(Error::not_found(format!("link {}", ifindex)))
            }
            None => Ok(()),
        }
    }

    fn gateway_reachable(&self, ifindex: u32, gateway: &IpAddr) -> bool {
        if let IpAddr::V6(v6) = gateway {
            if (v6.segments()[0] & 0xffc0) == 0xfe80 {
                return true;
            }
        }
        let via_address = self.addresses.get(&ifindex).is_some_and(|addrs| {
            addrs
                .iter()
                .any(|a| a.network().is_some_and(|net| net.contains(gateway)))
        });
        let via_route = self.routes.get(&ifindex).is_some_and(|routes| {
            routes.iter().any(|r| {
                r.gateway.is_none() && r.destination().is_some_and(|net| net.contains(gateway))
            })
        });
        via_address || via_route
    }

    fn upsert_address(&mut self, ifindex: u32, address: &IpAddress) {
        let list = self.addresses.entry(ifindex).or_default();
        match list.iter_mut().find(|a| a.key() == address.key()) {
            Some(existing) => *existing = address.clone(),
            None => list.push(address.clone()),
        }
    }

    fn remove_address(&mut self, ifindex: u32, address: &IpAddress) -> bool {
        let Some(list) = self.addresses.get_mut(&ifindex) else {
            return false;
        };
        let before = list.len();
        list.retain(|a| a.key() != address.key());
        before != list.len()
    }

    fn upsert_route(&mut self, ifindex: u32, route: &IpRoute) {
        let list = self.routes.entry(ifindex).or_default();
        match list.iter_mut().find(|r| r.key() == route.key()) {
            Some(existing) => *existing = route.clone(),
            None => list.push(route.clone()),
        }
    }

    fn remove_route(&mut self, ifindex: u32, route: &IpRoute) -> bool {
        let Some(list) = self.routes.get_mut(&ifindex) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.key() != route.key());
        before != list.len()
    }
}

/// In-memory platform implementation
///
/// Cloning yields another handle onto the same tables.
///
/// # Example
///
/// ```rust,no_run
/// use netman_core::platform::MemoryPlatform;
/// use netman_core::traits::{Link, Platform};
/// use netman_core::ip_config::{AddrFamily, IpAddress};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let platform = MemoryPlatform::new();
///     platform.add_link(Link::new(2, "eth0").with_carrier(true)).await;
///
///     let addr = IpAddress::new("10.0.0.5".parse()?, 24);
///     platform.add_address(2, &addr).await?;
///     assert_eq!(platform.get_addresses(2, AddrFamily::V4).await?.len(), 1);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryPlatform {
    inner: Arc<RwLock<Inner>>,
    events: broadcast::Sender<PlatformEvent>,
}

impl MemoryPlatform {
    /// Create an empty platform with no links
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            events,
        }
    }

    /// Broadcast an event to every watcher
    pub fn emit(&self, event: PlatformEvent) {
        // no watchers is fine
        let _ = self.events.send(event);
    }

    /// Create or update a link
    pub async fn add_link(&self, link: Link) {
        self.inner
            .write()
            .await
            .links
            .insert(link.ifindex, link.clone());
        self.emit(PlatformEvent::LinkChanged(link));
    }

    /// Change the carrier of an existing link
    pub async fn set_carrier(&self, ifindex: u32, carrier: bool) -> Result<(), Error> {
        let link = {
            let mut guard = self.inner.write().await;
            let link = guard
                .links
                .get_mut(&ifindex)
                .ok_or_else(|| Error::not_found(format!("link {}", ifindex)))?;
            link.carrier = carrier;
            link.clone()
        };
        self.emit(PlatformEvent::LinkChanged(link));
        Ok(())
    }

    /// Remove a link together with its addresses and routes
    pub async fn remove_link(&self, ifindex: u32) {
        let removed = {
            let mut guard = self.inner.write().await;
            guard.addresses.remove(&ifindex);
            guard.routes.remove(&ifindex);
            guard.links.remove(&ifindex).is_some()
        };
        if removed {
            self.emit(PlatformEvent::LinkRemoved { ifindex });
        }
    }

    /// Another actor adds an address
    pub async fn external_add_address(&self, ifindex: u32, address: IpAddress) {
        self.inner.write().await.upsert_address(ifindex, &address);
        self.emit(PlatformEvent::AddressAdded { ifindex, address });
    }

    /// Another actor removes an address
    pub async fn external_remove_address(&self, ifindex: u32, address: IpAddress) {
        if self.inner.write().await.remove_address(ifindex, &address) {
            self.emit(PlatformEvent::AddressRemoved { ifindex, address });
        }
    }

    /// Another actor (usually the kernel) adds a route
    pub async fn external_add_route(&self, ifindex: u32, route: IpRoute) {
        self.inner.write().await.upsert_route(ifindex, &route);
        self.emit(PlatformEvent::RouteAdded { ifindex, route });
    }

    /// Another actor removes a route
    pub async fn external_remove_route(&self, ifindex: u32, route: IpRoute) {
        if self.inner.write().await.remove_route(ifindex, &route) {
            self.emit(PlatformEvent::RouteRemoved { ifindex, route });
        }
    }

    /// Fail the next `times` operations of `kind`
    pub async fn fail_next(&self, kind: PlatformOpKind, failure: InjectedFailure, times: usize) {
        self.inner.write().await.failures.push(FailureRule {
            kind,
            target: None,
            failure,
            remaining: times,
        });
    }

    /// Fail the next `times` operations of `kind` that touch `target`
    pub async fn fail_matching(
        &self,
        kind: PlatformOpKind,
        target: IpAddr,
        failure: InjectedFailure,
        times: usize,
    ) {
        self.inner.write().await.failures.push(FailureRule {
            kind,
            target: Some(target),
            failure,
            remaining: times,
        });
    }

    /// Every mutation attempted so far
    pub async fn operations(&self) -> Vec<PlatformOp> {
        self.inner.read().await.ops.clone()
    }

    pub async fn clear_operations(&self) {
        self.inner.write().await.ops.clear();
    }

    /// All links
    pub async fn links(&self) -> Vec<Link> {
        self.inner.read().await.links.values().cloned().collect()
    }
}

impl Default for MemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Platform for MemoryPlatform {
    async fn link(&self, ifindex: u32) -> Result<Option<Link>, Error> {
        Ok(self.inner.read().await.links.get(&ifindex).cloned())
    }

    async fn set_link_mtu(&self, ifindex: u32, mtu: u32) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        guard.record(PlatformOp::SetMtu { ifindex, mtu })?;
        if let Some(link) = guard.links.get_mut(&ifindex) {
            link.mtu = mtu;
        }
        Ok(())
    }

    async fn get_addresses(&self, ifindex: u32, family: AddrFamily) -> Result<Vec<IpAddress>, Error> {
        let guard = self.inner.read().await;
        Ok(guard
            .addresses
            .get(&ifindex)
            .map(|list| list.iter().filter(|a| a.family() == family).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_routes(&self, ifindex: u32, family: AddrFamily) -> Result<Vec<IpRoute>, Error> {
        let guard = self.inner.read().await;
        Ok(guard
            .routes
            .get(&ifindex)
            .map(|list| list.iter().filter(|r| r.family() == family).cloned().collect())
            .unwrap_or_default())
    }

    async fn add_address(&self, ifindex: u32, address: &IpAddress) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        guard.record(PlatformOp::AddAddress {
            ifindex,
            address: address.clone(),
        })?;
        let exists = guard
            .addresses
            .get(&ifindex)
            .is_some_and(|list| list.iter().any(|a| a.key() == address.key()));
        if exists {
            return Err(Error::platform(format!("{}: File exists", address)));
        }
        guard.upsert_address(ifindex, address);
        Ok(())
    }

    async fn replace_address(&self, ifindex: u32, address: &IpAddress) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        guard.record(PlatformOp::ReplaceAddress {
            ifindex,
            address: address.clone(),
        })?;
        guard.upsert_address(ifindex, address);
        Ok(())
    }

    async fn delete_address(&self, ifindex: u32, address: &IpAddress) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        guard.record(PlatformOp::DeleteAddress {
            ifindex,
            address: address.clone(),
        })?;
        if guard.remove_address(ifindex, address) {
            Ok(())
        } else {
            Err(Error::not_found(format!("address {}", address)))
        }
    }

    async fn add_route(&self, ifindex: u32, route: &IpRoute) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        guard.record(PlatformOp::AddRoute {
            ifindex,
            route: route.clone(),
        })?;
        let exists = guard
            .routes
            .get(&ifindex)
            .is_some_and(|list| list.iter().any(|r| r.key() == route.key()));
        if exists {
            return Err(Error::platform(format!("{}: File exists", route)));
        }
        if let Some(gateway) = route.gateway {
            if !guard.gateway_reachable(ifindex, &gateway) {
                return Err(Error::platform(format!("{}: Network is unreachable", route)));
            }
        }
        guard.upsert_route(ifindex, route);
        Ok(())
    }

    async fn replace_route(&self, ifindex: u32, route: &IpRoute) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        guard.record(PlatformOp::ReplaceRoute {
            ifindex,
            route: route.clone(),
        })?;
        if let Some(gateway) = route.gateway {
            if !guard.gateway_reachable(ifindex, &gateway) {
                return Err(Error::platform(format!("{}: Network is unreachable", route)));
            }
        }
        guard.upsert_route(ifindex, route);
        Ok(())
    }

    async fn delete_route(&self, ifindex: u32, route: &IpRoute) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        guard.record(PlatformOp::DeleteRoute {
            ifindex,
            route: route.clone(),
        })?;
        if guard.remove_route(ifindex, route) {
            Ok(())
        } else {
            Err(Error::not_found(format!("route {}", route)))
        }
    }

    fn watch(&self) -> Pin<Box<dyn Stream<Item = PlatformEvent> + Send + 'static>> {
        let stream = BroadcastStream::new(self.events.subscribe()).map(|event| match event {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                warn!("Platform watcher lagged, {} event(s) lost", missed);
                PlatformEvent::Overflow { missed }
            }
        });
        Box::pin(stream)
    }
}
