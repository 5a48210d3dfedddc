//! Default route registry
//!
//! Devices publish the default route they would like to install; the
//! registry ranks the candidates of each family with a
//! [`DefaultRoutePolicy`] and hands out *effective* metrics so that two
//! devices never install default routes with the same metric.
//!
//! ```text
//!   device A ──publish(metric 100)──┐
//!                                   ├─► rank ─► A: 100, B: 101
//!   device B ──publish(metric 100)──┘
//! ```
//!
//! Every change bumps a generation counter; devices subscribe to it and
//! recommit their default routes when the ranking moves.
//!
//! ## Thread Safety
//!
//! The registry is shared between device tasks behind an `Arc` and uses a
//! std `RwLock` internally; no lock is held across an await point.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::watch;
use tracing::debug;

use crate::ip_config::AddrFamily;
use crate::traits::{DefaultRouteCandidate, DefaultRoutePolicy, LowestMetricPolicy};

/// A ranked candidate with the metric it must be installed with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedRoute {
    pub candidate: DefaultRouteCandidate,
    pub effective_metric: u32,
}

/// Shared registry of default route candidates
pub struct DefaultRouteRegistry {
    policy: Box<dyn DefaultRoutePolicy>,
    candidates: RwLock<BTreeMap<(AddrFamily, u32), DefaultRouteCandidate>>,
    generation: watch::Sender<u64>,
}

impl Default for DefaultRouteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultRouteRegistry {
    /// Create a registry using [`LowestMetricPolicy`]
    pub fn new() -> Self {
        Self::with_policy(Box::new(LowestMetricPolicy))
    }

    pub fn with_policy(policy: Box<dyn DefaultRoutePolicy>) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            policy,
            candidates: RwLock::new(BTreeMap::new()),
            generation,
        }
    }

    /// Publish or update a device's candidate
    ///
    /// Returns true when the candidate set changed.
    pub fn publish(&self, candidate: DefaultRouteCandidate) -> bool {
        let key = (candidate.family, candidate.ifindex);
        let changed = {
            let mut candidates = self
                .candidates
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if candidates.get(&key) == Some(&candidate) {
                false
            } else {
                candidates.insert(key, candidate);
                true
            }
        };
        if changed {
            debug!(
                "Default route candidate published for ifindex {} ({})",
                key.1, key.0
            );
            self.bump();
        }
        changed
    }

    /// Remove a device's candidate for one family
    pub fn withdraw(&self, ifindex: u32, family: AddrFamily) -> bool {
        let removed = self
            .candidates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(family, ifindex))
            .is_some();
        if removed {
            debug!(
                "Default route candidate withdrawn for ifindex {} ({})",
                ifindex, family
            );
            self.bump();
        }
        removed
    }

    /// Remove all candidates of a device
    pub fn withdraw_all(&self, ifindex: u32) {
        for family in AddrFamily::ALL {
            self.withdraw(ifindex, family);
        }
    }

    /// Candidates of `family`, best first, with their effective metrics
    pub fn ranking(&self, family: AddrFamily) -> Vec<RankedRoute> {
        let mut ranked: Vec<DefaultRouteCandidate> = self
            .candidates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|c| c.family == family)
            .cloned()
            .collect();
        self.policy.rank(&mut ranked);

        let mut out = Vec::with_capacity(ranked.len());
        let mut floor: Option<u32> = None;
        for candidate in ranked {
            let effective = match floor {
                Some(prev) => candidate.metric.max(prev.saturating_add(1)),
                None => candidate.metric,
            };
            floor = Some(effective);
            out.push(RankedRoute {
                candidate,
                effective_metric: effective,
            });
        }
        out
    }

    /// Metric a device must use for its default route
    ///
    /// `None` if the device has no published candidate.
    pub fn effective_metric(&self, ifindex: u32, family: AddrFamily) -> Option<u32> {
        self.ranking(family)
            .into_iter()
            .find(|r| r.candidate.ifindex == ifindex)
            .map(|r| r.effective_metric)
    }

    /// Best candidate of a family
    pub fn best(&self, family: AddrFamily) -> Option<DefaultRouteCandidate> {
        self.ranking(family).into_iter().next().map(|r| r.candidate)
    }

    /// Subscribe to ranking changes
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }
}
