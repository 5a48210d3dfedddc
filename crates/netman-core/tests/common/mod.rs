//! Test doubles and common utilities for architecture contract tests
//!
//! The in-memory platform stands in for the kernel; `CountingPlatform`
//! wraps it to count every call the core makes, queries included.

#![allow(dead_code)]

use async_trait::async_trait;
use netman_core::config::{DeviceSpec, EngineConfig};
use netman_core::device::{ActivationId, Device, DeviceEvent, DeviceNotification, SourceOutcome};
use netman_core::ip_config::{AddrFamily, ConfigSource, IpAddress, IpConfig, IpRoute};
use netman_core::platform::{MemoryPlatform, PlatformOp, PlatformOpKind};
use netman_core::profile::{DeviceKind, IpSetting, Profile, ProfileKind};
use netman_core::registry::DefaultRouteRegistry;
use netman_core::traits::{Link, Platform, PlatformEvent};
use netman_core::Error;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::Stream;

pub const IFINDEX: u32 = 2;

/// Platform wrapper that counts calls
#[derive(Clone)]
pub struct CountingPlatform {
    inner: MemoryPlatform,
    queries: Arc<AtomicUsize>,
    mutations: Arc<AtomicUsize>,
}

impl CountingPlatform {
    pub fn new(inner: MemoryPlatform) -> Self {
        Self {
            inner,
            queries: Arc::new(AtomicUsize::new(0)),
            mutations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of get_addresses / get_routes / link calls
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Number of add / replace / delete / set_link_mtu calls
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn reset_counts(&self) {
        self.queries.store(0, Ordering::SeqCst);
        self.mutations.store(0, Ordering::SeqCst);
    }

    fn query(&self) {
        self.queries.fetch_add(1, Ordering::SeqCst);
    }

    fn mutation(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Platform for CountingPlatform {
    async fn link(&self, ifindex: u32) -> Result<Option<Link>, Error> {
        self.query();
        self.inner.link(ifindex).await
    }

    async fn set_link_mtu(&self, ifindex: u32, mtu: u32) -> Result<(), Error> {
        self.mutation();
        self.inner.set_link_mtu(ifindex, mtu).await
    }

    async fn get_addresses(&self, ifindex: u32, family: AddrFamily) -> Result<Vec<IpAddress>, Error> {
        self.query();
        self.inner.get_addresses(ifindex, family).await
    }

    async fn get_routes(&self, ifindex: u32, family: AddrFamily) -> Result<Vec<IpRoute>, Error> {
        self.query();
        self.inner.get_routes(ifindex, family).await
    }

    async fn add_address(&self, ifindex: u32, address: &IpAddress) -> Result<(), Error> {
        self.mutation();
        self.inner.add_address(ifindex, address).await
    }

    async fn replace_address(&self, ifindex: u32, address: &IpAddress) -> Result<(), Error> {
        self.mutation();
        self.inner.replace_address(ifindex, address).await
    }

    async fn delete_address(&self, ifindex: u32, address: &IpAddress) -> Result<(), Error> {
        self.mutation();
        self.inner.delete_address(ifindex, address).await
    }

    async fn add_route(&self, ifindex: u32, route: &IpRoute) -> Result<(), Error> {
        self.mutation();
        self.inner.add_route(ifindex, route).await
    }

    async fn replace_route(&self, ifindex: u32, route: &IpRoute) -> Result<(), Error> {
        self.mutation();
        self.inner.replace_route(ifindex, route).await
    }

    async fn delete_route(&self, ifindex: u32, route: &IpRoute) -> Result<(), Error> {
        self.mutation();
        self.inner.delete_route(ifindex, route).await
    }

    fn watch(&self) -> Pin<Box<dyn Stream<Item = PlatformEvent> + Send + 'static>> {
        self.inner.watch()
    }
}

/// A device wired to an in-memory platform with one link
pub struct TestDevice {
    pub device: Device,
    pub platform: MemoryPlatform,
    pub counting: CountingPlatform,
    pub registry: Arc<DefaultRouteRegistry>,
    pub notifications: mpsc::Receiver<DeviceNotification>,
}

impl TestDevice {
    /// Ethernet device on a link with carrier, already DISCONNECTED
    pub async fn ethernet() -> Self {
        Self::with_config(EngineConfig::default()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        let platform = MemoryPlatform::new();
        let link = Link::new(IFINDEX, "eth0").with_carrier(true);
        platform.add_link(link.clone()).await;
        let counting = CountingPlatform::new(platform.clone());
        let registry = Arc::new(DefaultRouteRegistry::new());
        let (tx, notifications) = mpsc::channel(1024);

        let mut device = Device::new(
            DeviceSpec::new(IFINDEX, "eth0", DeviceKind::Ethernet),
            Some(&link),
            Arc::new(counting.clone()),
            Arc::clone(&registry),
            config,
            tx,
        );
        device.drain().await.expect("initial events drain");

        Self {
            device,
            platform,
            counting,
            registry,
            notifications,
        }
    }

    pub async fn activate(&mut self, profile: Profile) {
        self.device
            .handle(DeviceEvent::Activate(Arc::new(profile)))
            .await
            .expect("activation is accepted");
    }

    pub fn activation(&self) -> ActivationId {
        self.device.activation_id().expect("device has an activation")
    }

    /// Deliver a DHCP lease for the current activation
    pub async fn dhcp_bound(&mut self, lease: IpConfig) {
        let activation = self.activation();
        self.device
            .handle(DeviceEvent::SourceUpdate {
                activation,
                family: AddrFamily::V4,
                source: ConfigSource::Dhcp,
                outcome: SourceOutcome::Bound(lease),
            })
            .await
            .expect("lease is processed");
    }

    pub async fn operations(&self) -> Vec<PlatformOp> {
        self.platform.operations().await
    }

    pub async fn clear_operations(&self) {
        self.platform.clear_operations().await;
    }

    pub async fn live_addresses(&self) -> Vec<IpAddr> {
        let mut addrs: Vec<IpAddr> = self
            .platform
            .get_addresses(IFINDEX, AddrFamily::V4)
            .await
            .expect("link exists")
            .into_iter()
            .map(|a| a.address)
            .collect();
        addrs.sort();
        addrs
    }
}

pub fn ip(s: &str) -> IpAddr {
    s.parse().expect("valid address")
}

/// Ethernet profile: IPv4 via DHCP plus static extras, IPv6 disabled
pub fn dhcp_profile_with_static(addr: &str, gateway: &str) -> Profile {
    let mut ipv4 = IpSetting::default();
    ipv4.addresses = vec![addr.parse().expect("valid prefix")];
    ipv4.gateway = Some(ip(gateway));
    Profile::new("wired", ProfileKind::Ethernet { ieee8021x: false })
        .with_ipv4(ipv4)
        .with_ipv6(IpSetting::disabled())
}

/// Ethernet profile with static IPv4 only
pub fn static_profile(addr: &str, gateway: &str) -> Profile {
    let mut ipv4 = IpSetting::manual(vec![addr.parse().expect("valid prefix")]);
    ipv4.gateway = Some(ip(gateway));
    Profile::new("static", ProfileKind::Ethernet { ieee8021x: false })
        .with_ipv4(ipv4)
        .with_ipv6(IpSetting::disabled())
}

/// A DHCP lease as the client would report it
pub fn dhcp_lease(addr: &str, gateway: &str, dns: &str, metric: u32) -> IpConfig {
    let mut lease = IpConfig::new(IFINDEX, AddrFamily::V4);
    lease
        .add_address(IpAddress::new(ip(addr), 24).with_source(ConfigSource::Dhcp))
        .expect("valid address");
    lease
        .add_route(IpRoute::default_via(ip(gateway), metric).with_source(ConfigSource::Dhcp))
        .expect("valid route");
    lease.set_gateway(Some(ip(gateway)));
    lease.add_nameserver(ip(dns));
    lease
}

/// Count operations of one kind
pub fn count(ops: &[PlatformOp], kind: PlatformOpKind) -> usize {
    ops.iter().filter(|op| op.kind() == kind).count()
}
