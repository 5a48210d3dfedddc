// # Default Route Policy Trait
//
// Decides which device's default route wins when several devices offer one.
// The registry (`crate::registry::DefaultRouteRegistry`) owns the candidate
// set; policies only order it.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::ip_config::AddrFamily;

/// A default route a device would like to install
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultRouteCandidate {
    pub ifindex: u32,
    pub family: AddrFamily,
    /// Metric requested by the device's configuration
    pub metric: u32,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
}

/// Ordering policy for default route candidates
///
/// The first candidate after `rank` is the best one.
pub trait DefaultRoutePolicy: Send + Sync {
    /// Sort candidates of one family, best first
    fn rank(&self, candidates: &mut [DefaultRouteCandidate]);

    /// Policy name for logging
    fn name(&self) -> &'static str;
}

/// Lowest requested metric wins; ties go to the lower ifindex
#[derive(Debug, Clone, Copy, Default)]
pub struct LowestMetricPolicy;

impl DefaultRoutePolicy for LowestMetricPolicy {
    fn rank(&self, candidates: &mut [DefaultRouteCandidate]) {
        candidates.sort_by_key(|c| (c.metric, c.ifindex));
    }

    fn name(&self) -> &'static str {
        "lowest-metric"
    }
}
