//! Device events, collaborator requests and notifications

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::state::{DeviceState, StateReason};
use crate::ip_config::{AddrFamily, ConfigDigest, ConfigSource, IpConfig};
use crate::profile::Profile;
use crate::traits::PlatformEvent;

/// Identity of one activation attempt
///
/// Completion events carry the id of the activation that requested them;
/// events for any other id are stale and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActivationId(pub u64);

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Stage timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// DHCP / auto-configuration of one family
    IpConfig(AddrFamily),
    Auth,
    Connectivity,
    Secondaries,
}

/// Result reported by a DHCP or auto-configuration client
#[derive(Debug, Clone, PartialEq)]
pub enum SourceOutcome {
    /// Lease obtained or renewed; the fragment replaces the previous one
    Bound(IpConfig),
    /// No lease, or the lease was lost
    Failed(String),
}

/// Input to a device's state machine
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    CarrierChanged(bool),
    LinkRemoved,
    Activate(Arc<Profile>),
    Deactivate,
    /// The device finished its own preparation
    LinkPrepared {
        activation: ActivationId,
    },
    /// Link-layer setup finished
    L2Ready {
        activation: ActivationId,
    },
    AuthCompleted {
        activation: ActivationId,
        result: Result<(), String>,
    },
    SourceUpdate {
        activation: ActivationId,
        family: AddrFamily,
        source: ConfigSource,
        outcome: SourceOutcome,
    },
    ConnectivityChecked {
        activation: ActivationId,
        reachable: bool,
    },
    SecondariesCompleted {
        activation: ActivationId,
        result: Result<(), String>,
    },
    Timeout {
        activation: ActivationId,
        timer: TimerKind,
    },
    /// Change observed on the platform
    External(PlatformEvent),
    /// The default route ranking moved; recommit default routes
    DefaultRouteRankingChanged,
    /// Unrecoverable platform error on this link
    PlatformFailure(String),
}

impl DeviceEvent {
    /// Activation the event belongs to, if it is a completion event
    pub fn activation(&self) -> Option<ActivationId> {
        match self {
            DeviceEvent::LinkPrepared { activation }
            | DeviceEvent::L2Ready { activation }
            | DeviceEvent::AuthCompleted { activation, .. }
            | DeviceEvent::SourceUpdate { activation, .. }
            | DeviceEvent::ConnectivityChecked { activation, .. }
            | DeviceEvent::SecondariesCompleted { activation, .. }
            | DeviceEvent::Timeout { activation, .. } => Some(*activation),
            _ => None,
        }
    }
}

/// Work a device asks its collaborators to do
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceRequest {
    StartDhcp {
        ifindex: u32,
        activation: ActivationId,
        /// Metric the client should give the lease's default route
        route_metric: u32,
    },
    StartAutoconf {
        ifindex: u32,
        activation: ActivationId,
        route_metric: u32,
    },
    Authenticate {
        ifindex: u32,
        activation: ActivationId,
        profile: String,
    },
    CheckConnectivity {
        ifindex: u32,
        activation: ActivationId,
    },
    ActivateSecondaries {
        ifindex: u32,
        activation: ActivationId,
        profiles: Vec<String>,
    },
    /// Stop everything started for this activation
    CancelActivation {
        ifindex: u32,
        activation: ActivationId,
    },
    /// Deliver `Timeout { activation, timer }` after `after`
    ArmTimer {
        ifindex: u32,
        activation: ActivationId,
        timer: TimerKind,
        after: Duration,
    },
}

impl DeviceRequest {
    pub fn ifindex(&self) -> u32 {
        match self {
            DeviceRequest::StartDhcp { ifindex, .. }
            | DeviceRequest::StartAutoconf { ifindex, .. }
            | DeviceRequest::Authenticate { ifindex, .. }
            | DeviceRequest::CheckConnectivity { ifindex, .. }
            | DeviceRequest::ActivateSecondaries { ifindex, .. }
            | DeviceRequest::CancelActivation { ifindex, .. }
            | DeviceRequest::ArmTimer { ifindex, .. } => *ifindex,
        }
    }
}

/// Status published to the bus layer
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceNotification {
    StateChanged {
        ifindex: u32,
        old: DeviceState,
        new: DeviceState,
        reason: StateReason,
        at: DateTime<Utc>,
    },
    IpConfigChanged {
        ifindex: u32,
        family: AddrFamily,
        digest: ConfigDigest,
    },
    Activated {
        ifindex: u32,
        profile: String,
    },
}
