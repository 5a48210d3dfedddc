// # Platform Trait
//
// Defines the interface to the kernel's link, address and route tables.
//
// ## Implementations
//
// - In-memory: `crate::platform::MemoryPlatform` (tests, the daemon's
//   simulated mode)
// - Future: rtnetlink
//
// ## Usage
//
// ```rust,ignore
// use netman_core::traits::Platform;
// use tokio_stream::StreamExt;
//
// let platform = /* Platform implementation */;
// let addrs = platform.get_addresses(2, AddrFamily::V4).await?;
//
// let mut events = platform.watch();
// while let Some(event) = events.next().await {
//     println!("platform event: {:?}", event);
// }
// ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

use crate::ip_config::{AddrFamily, IpAddress, IpRoute};

/// State of a network link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub ifindex: u32,
    pub name: String,
    /// Physical carrier present
    #[serde(default)]
    pub carrier: bool,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
}

fn default_mtu() -> u32 {
    1500
}

impl Link {
    pub fn new(ifindex: u32, name: impl Into<String>) -> Self {
        Self {
            ifindex,
            name: name.into(),
            carrier: false,
            mtu: default_mtu(),
        }
    }

    pub fn with_carrier(mut self, carrier: bool) -> Self {
        self.carrier = carrier;
        self
    }
}

/// Change notification from the platform
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    /// Link appeared or one of its properties changed
    LinkChanged(Link),
    /// Link disappeared
    LinkRemoved { ifindex: u32 },
    AddressAdded { ifindex: u32, address: IpAddress },
    AddressRemoved { ifindex: u32, address: IpAddress },
    RouteAdded { ifindex: u32, route: IpRoute },
    RouteRemoved { ifindex: u32, route: IpRoute },
    /// Unrecoverable error on a link
    Fatal { ifindex: u32, message: String },
    /// The watcher fell behind and `missed` events were lost; every link
    /// must be re-read
    Overflow { missed: u64 },
}

impl PlatformEvent {
    /// Interface the event concerns, `None` when it concerns all of them
    pub fn ifindex(&self) -> Option<u32> {
        match self {
            PlatformEvent::LinkChanged(link) => Some(link.ifindex),
            PlatformEvent::LinkRemoved { ifindex }
            | PlatformEvent::AddressAdded { ifindex, .. }
            | PlatformEvent::AddressRemoved { ifindex, .. }
            | PlatformEvent::RouteAdded { ifindex, .. }
            | PlatformEvent::RouteRemoved { ifindex, .. }
            | PlatformEvent::Fatal { ifindex, .. } => Some(*ifindex),
            PlatformEvent::Overflow { .. } => None,
        }
    }
}

/// Trait for platform implementations
///
/// Every call is independent; there is no transaction. Implementations
/// report transient conditions (EBUSY, EAGAIN) as
/// [`crate::Error::PlatformBusy`] so callers can retry, rejections as
/// [`crate::Error::Platform`], and deletion of an absent object as
/// [`crate::Error::NotFound`].
///
/// # Trust Level: Semi-Trusted
///
/// Platforms perform I/O against the kernel but make no decisions: they
/// never retry, never reorder and never merge configurations. Retry and
/// ordering belong to the commit engine.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Current state of a link, `None` if it does not exist
    async fn link(&self, ifindex: u32) -> Result<Option<Link>, crate::Error>;

    async fn set_link_mtu(&self, ifindex: u32, mtu: u32) -> Result<(), crate::Error>;

    /// Addresses currently assigned to the interface
    async fn get_addresses(
        &self,
        ifindex: u32,
        family: AddrFamily,
    ) -> Result<Vec<IpAddress>, crate::Error>;

    /// Routes currently installed through the interface
    async fn get_routes(
        &self,
        ifindex: u32,
        family: AddrFamily,
    ) -> Result<Vec<IpRoute>, crate::Error>;

    /// Add an address; fails if the identity already exists
    async fn add_address(&self, ifindex: u32, address: &IpAddress) -> Result<(), crate::Error>;

    /// Add or update an address in place
    async fn replace_address(
        &self,
        ifindex: u32,
        address: &IpAddress,
    ) -> Result<(), crate::Error>;

    async fn delete_address(&self, ifindex: u32, address: &IpAddress)
        -> Result<(), crate::Error>;

    /// Add a route; fails if the identity already exists or the gateway is
    /// unreachable
    async fn add_route(&self, ifindex: u32, route: &IpRoute) -> Result<(), crate::Error>;

    /// Add or update a route in place
    async fn replace_route(&self, ifindex: u32, route: &IpRoute) -> Result<(), crate::Error>;

    async fn delete_route(&self, ifindex: u32, route: &IpRoute) -> Result<(), crate::Error>;

    /// Watch for changes made by anyone
    ///
    /// The stream must be cancellation-safe: dropping it releases the
    /// subscription. Events the watcher could not keep up with are reported
    /// as [`PlatformEvent::Overflow`] rather than skipped.
    fn watch(&self) -> Pin<Box<dyn Stream<Item = PlatformEvent> + Send + 'static>>;
}
