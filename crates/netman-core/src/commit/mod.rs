//! Commit engine
//!
//! Reconciles the platform with a desired [`IpConfig`] for one interface and
//! family. Each commit reads the live state, plans the difference and applies
//! it in a fixed order:
//!
//! ```text
//!   1. remove stale routes
//!   2. remove stale addresses
//!   3. add / replace addresses
//!   4. add / replace on-link routes
//!   5. add / replace routes via a gateway
//!   6. add / replace default routes   (deferred while there is neither
//!                                      an address nor another route)
//! ```
//!
//! Committing the same configuration twice is a no-op: the engine remembers
//! the digest of the last complete commit and skips the platform entirely
//! when it has not changed.
//!
//! ## Retry Architecture
//!
//! Transient platform errors are retried here, a bounded number of times with
//! a fixed delay. Platforms never retry on their own.

use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dedup::DedupEntry;
use crate::error::{Error, Result};
use crate::ip_config::{AddrFamily, ConfigDigest, ConfigSource, IpAddress, IpConfig, IpRoute};
use crate::registry::DefaultRouteRegistry;
use crate::traits::Platform;

/// Which live routes a commit may remove
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSync {
    /// Remove every live route that is not desired, except kernel-owned ones
    Full,
    /// Only remove routes this engine committed earlier
    Incremental,
}

/// A single add or in-place update
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    Add(T),
    Replace(T),
}

impl<T> Change<T> {
    pub fn entry(&self) -> &T {
        match self {
            Change::Add(entry) | Change::Replace(entry) => entry,
        }
    }
}

/// Operations needed to move the platform to a desired configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitPlan {
    pub remove_routes: Vec<IpRoute>,
    pub remove_addresses: Vec<IpAddress>,
    pub addresses: Vec<Change<IpAddress>>,
    /// On-link routes first, then gatewayed routes, then default routes
    pub routes: Vec<Change<IpRoute>>,
}

impl CommitPlan {
    pub fn is_empty(&self) -> bool {
        self.operation_count() == 0
    }

    pub fn operation_count(&self) -> usize {
        self.remove_routes.len() + self.remove_addresses.len() + self.addresses.len() + self.routes.len()
    }
}

/// Compute the operations that turn `live` into `desired`
///
/// `committed` is what this engine installed last time; entries it owns may
/// always be removed, while others are only removed on a full sync and never
/// when they belong to the kernel or are link-local.
pub fn plan(
    live: &IpConfig,
    desired: &IpConfig,
    committed: Option<&IpConfig>,
    sync: RouteSync,
) -> CommitPlan {
    let mut plan = CommitPlan::default();
    let owned_address = |a: &IpAddress| committed.is_some_and(|c| c.address_exists(a));
    let owned_route =
        |r: &IpRoute| committed.is_some_and(|c| c.lookup_route(&r.key()).is_some());

    let addresses = live
        .address_index()
        .diff(desired.address_index(), IpAddress::same_on_platform);
    for address in addresses.only_left {
        let removable = match sync {
            RouteSync::Incremental => owned_address(address),
            RouteSync::Full => {
                owned_address(address)
                    || !(address.is_link_local() || address.source == ConfigSource::Kernel)
            }
        };
        if removable {
            plan.remove_addresses.push(address.clone());
        }
    }
    let added: HashSet<_> = addresses.only_right.iter().map(|a| a.key()).collect();
    let replaced: HashSet<_> = addresses.changed.iter().map(|(_, ours)| ours.key()).collect();
    for address in desired.addresses() {
        let key = address.key();
        if added.contains(&key) {
            plan.addresses.push(Change::Add(address.clone()));
        } else if replaced.contains(&key) {
            plan.addresses.push(Change::Replace(address.clone()));
        }
    }

    let routes = live
        .route_index()
        .diff(desired.route_index(), IpRoute::same_on_platform);
    for route in routes.only_left {
        let removable = match sync {
            RouteSync::Incremental => owned_route(route),
            RouteSync::Full => owned_route(route) || route.source != ConfigSource::Kernel,
        };
        if removable {
            plan.remove_routes.push(route.clone());
        }
    }
    let added: HashSet<_> = routes.only_right.iter().map(|r| r.key()).collect();
    let replaced: HashSet<_> = routes.changed.iter().map(|(_, ours)| ours.key()).collect();
    let mut pending: Vec<Change<IpRoute>> = Vec::new();
    for route in desired.routes() {
        let key = route.key();
        if added.contains(&key) {
            pending.push(Change::Add(route.clone()));
        } else if replaced.contains(&key) {
            pending.push(Change::Replace(route.clone()));
        }
    }
    pending.sort_by_key(|change| route_stage(change.entry()));
    plan.routes = pending;

    plan
}

fn route_stage(route: &IpRoute) -> u8 {
    match (route.is_default(), route.gateway.is_some()) {
        (false, false) => 0,
        (false, true) => 1,
        (true, _) => 2,
    }
}

/// Outcome of a commit
#[derive(Debug, Clone, PartialEq)]
pub struct CommitReport {
    /// Platform mutations performed, retries excluded
    pub operations: usize,
    /// Nothing changed since the last complete commit
    pub skipped: bool,
    /// Default routes held back because neither an address nor a non-default route exists
    pub deferred_default_routes: bool,
    /// Non-fatal failures
    pub failures: Vec<String>,
    pub digest: ConfigDigest,
}

impl CommitReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && !self.deferred_default_routes
    }
}

/// Commit engine for one interface and family
#[derive(Debug)]
pub struct CommitEngine {
    ifindex: u32,
    family: AddrFamily,
    max_retries: u32,
    retry_delay: Duration,
    committed: Option<IpConfig>,
    last_digest: Option<ConfigDigest>,
}

impl CommitEngine {
    pub fn new(ifindex: u32, family: AddrFamily) -> Self {
        Self {
            ifindex,
            family,
            max_retries: 3,
            retry_delay: Duration::from_millis(50),
            committed: None,
            last_digest: None,
        }
    }

    pub fn with_retry(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn family(&self) -> AddrFamily {
        self.family
    }

    /// Whether a configuration has been committed since the last reset
    pub fn has_committed(&self) -> bool {
        self.committed.is_some()
    }

    /// The configuration installed by the last commit
    pub fn committed(&self) -> Option<&IpConfig> {
        self.committed.as_ref()
    }

    /// Force the next commit to consult the platform
    pub fn invalidate(&mut self) {
        self.last_digest = None;
    }

    /// Install `desired` on the platform
    ///
    /// Default routes are installed with the metric assigned by `registry`.
    /// A missing configuration is a programming error and fails with
    /// [`Error::Invariant`]. Failing to install the only address fails the
    /// commit; other failures are reported and the rest of the plan is
    /// still applied.
    pub async fn commit(
        &mut self,
        platform: &dyn Platform,
        registry: &DefaultRouteRegistry,
        desired: Option<&IpConfig>,
        sync: RouteSync,
    ) -> Result<CommitReport> {
        let desired = desired.ok_or_else(|| {
            Error::invariant(format!(
                "commit of {} on ifindex {} without a configuration",
                self.family, self.ifindex
            ))
        })?;
        if desired.family() != self.family {
            return Err(Error::invariant(format!(
                "{} configuration handed to {} commit engine",
                desired.family(),
                self.family
            )));
        }
        desired.validate()?;

        let effective = self.apply_route_metrics(desired, registry)?;
        let digest = effective.hash(false);
        if self.last_digest == Some(digest) {
            debug!(
                "[{}] {} configuration unchanged, skipping commit",
                self.ifindex, self.family
            );
            return Ok(CommitReport {
                operations: 0,
                skipped: true,
                deferred_default_routes: false,
                failures: Vec::new(),
                digest,
            });
        }

        let live = IpConfig::capture(platform, self.ifindex, self.family).await?;
        let mut plan = plan(&live, &effective, self.committed.as_ref(), sync);

        // any address or non-default route makes the gateway worth trying
        let reachable =
            effective.num_addresses() > 0 || effective.routes().any(|r| !r.is_default());
        let deferred = !reachable && plan.routes.iter().any(|c| c.entry().is_default());
        if deferred {
            info!(
                "[{}] deferring {} default route until an address is configured",
                self.ifindex, self.family
            );
            plan.routes.retain(|c| !c.entry().is_default());
        }

        let mut report = CommitReport {
            operations: 0,
            skipped: false,
            deferred_default_routes: deferred,
            failures: Vec::new(),
            digest,
        };
        if !plan.is_empty() {
            debug!(
                "[{}] committing {} operations for {}",
                self.ifindex,
                plan.operation_count(),
                self.family
            );
        }

        for route in &plan.remove_routes {
            match self.retrying(|| platform.delete_route(self.ifindex, route)).await {
                Ok(()) => report.operations += 1,
                Err(Error::NotFound(_)) => {}
                Err(e) => report.failures.push(format!("delete route {}: {}", route, e)),
            }
        }

        for address in &plan.remove_addresses {
            match self
                .retrying(|| platform.delete_address(self.ifindex, address))
                .await
            {
                Ok(()) => report.operations += 1,
                Err(Error::NotFound(_)) => {}
                Err(e) => report
                    .failures
                    .push(format!("delete address {}: {}", address, e)),
            }
        }

        let sole_address = effective.num_addresses() == 1;
        for change in &plan.addresses {
            let result = match change {
                Change::Add(a) => self.retrying(|| platform.add_address(self.ifindex, a)).await,
                Change::Replace(a) => {
                    self.retrying(|| platform.replace_address(self.ifindex, a))
                        .await
                }
            };
            match result {
                Ok(()) => report.operations += 1,
                Err(e) if sole_address => {
                    // keep ownership of what was already installed
                    self.committed = Some(effective.clone());
                    self.last_digest = None;
                    return Err(Error::commit(
                        self.family,
                        format!("address {}: {}", change.entry(), e),
                    ));
                }
                Err(e) => {
                    warn!("[{}] failed to add address {}: {}", self.ifindex, change.entry(), e);
                    report
                        .failures
                        .push(format!("address {}: {}", change.entry(), e));
                }
            }
        }

        for change in &plan.routes {
            let result = match change {
                Change::Add(r) => self.retrying(|| platform.add_route(self.ifindex, r)).await,
                Change::Replace(r) => {
                    self.retrying(|| platform.replace_route(self.ifindex, r)).await
                }
            };
            match result {
                Ok(()) => report.operations += 1,
                Err(e) => {
                    warn!("[{}] failed to add route {}: {}", self.ifindex, change.entry(), e);
                    report
                        .failures
                        .push(format!("route {}: {}", change.entry(), e));
                }
            }
        }

        if effective.mtu() != 0 {
            let current = platform.link(self.ifindex).await?.map(|l| l.mtu);
            if current.is_some_and(|mtu| mtu != effective.mtu()) {
                match self
                    .retrying(|| platform.set_link_mtu(self.ifindex, effective.mtu()))
                    .await
                {
                    Ok(()) => report.operations += 1,
                    Err(e) => report.failures.push(format!("mtu {}: {}", effective.mtu(), e)),
                }
            }
        }

        self.last_digest = report.is_complete().then_some(digest);
        self.committed = Some(effective);
        Ok(report)
    }

    /// Remove everything this engine committed and forget it
    ///
    /// Entries are forgotten one by one as they are handled, so a withdraw
    /// that is cancelled halfway keeps ownership of whatever it did not
    /// reach. The next commit or withdraw removes those.
    pub async fn withdraw(&mut self, platform: &dyn Platform) -> Result<usize> {
        let Some(committed) = self.committed.clone() else {
            return Ok(0);
        };
        self.last_digest = None;

        let mut removed = 0;
        let mut routes: Vec<&IpRoute> = committed.routes().collect();
        routes.sort_by_key(|r| std::cmp::Reverse(route_stage(r)));
        for route in routes {
            match self.retrying(|| platform.delete_route(self.ifindex, route)).await {
                Ok(()) => removed += 1,
                Err(Error::NotFound(_)) => {}
                Err(e) => warn!("[{}] failed to remove route {}: {}", self.ifindex, route, e),
            }
            if let Some(owned) = self.committed.as_mut() {
                owned.del_route(&route.key());
            }
        }
        for address in committed.addresses() {
            match self
                .retrying(|| platform.delete_address(self.ifindex, address))
                .await
            {
                Ok(()) => removed += 1,
                Err(Error::NotFound(_)) => {}
                Err(e) => warn!(
                    "[{}] failed to remove address {}: {}",
                    self.ifindex, address, e
                ),
            }
            if let Some(owned) = self.committed.as_mut() {
                owned.del_address(&address.key());
            }
        }
        self.committed = None;
        Ok(removed)
    }

    /// Rewrite default route metrics to the ones the registry assigned
    fn apply_route_metrics(
        &self,
        desired: &IpConfig,
        registry: &DefaultRouteRegistry,
    ) -> Result<IpConfig> {
        let mut effective = desired.clone();
        let Some(assigned) = registry.effective_metric(self.ifindex, self.family) else {
            return Ok(effective);
        };
        let Some(best) = desired.best_default_route().map(|r| r.metric) else {
            return Ok(effective);
        };
        if assigned == best {
            return Ok(effective);
        }

        let defaults: Vec<IpRoute> = desired.routes().filter(|r| r.is_default()).cloned().collect();
        for route in &defaults {
            effective.del_route(&route.key());
        }
        for route in defaults {
            let metric = assigned.saturating_add(route.metric - best);
            effective.add_route(route.with_metric(metric))?;
        }
        Ok(effective)
    }

    async fn retrying<F, Fut>(&self, mut op: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    debug!(
                        "[{}] transient platform error (attempt {}/{}): {}",
                        self.ifindex, attempt, self.max_retries, e
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{InjectedFailure, MemoryPlatform, PlatformOp, PlatformOpKind};
    use crate::traits::{DefaultRouteCandidate, Link};
    use std::net::IpAddr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn desired() -> IpConfig {
        let mut cfg = IpConfig::new(2, AddrFamily::V4);
        cfg.add_address(IpAddress::new(ip("192.168.1.10"), 24)).unwrap();
        cfg.add_route(IpRoute::new(ip("192.168.1.0"), 24, 100)).unwrap();
        cfg.add_route(IpRoute::default_via(ip("192.168.1.1"), 100))
            .unwrap();
        cfg
    }

    async fn setup() -> (MemoryPlatform, DefaultRouteRegistry, CommitEngine) {
        let platform = MemoryPlatform::new();
        platform.add_link(Link::new(2, "eth0").with_carrier(true)).await;
        let engine =
            CommitEngine::new(2, AddrFamily::V4).with_retry(3, Duration::from_millis(1));
        (platform, DefaultRouteRegistry::new(), engine)
    }

    #[test]
    fn test_plan_orders_routes() {
        let live = IpConfig::new(2, AddrFamily::V4);
        let mut want = desired();
        want.add_route(
            IpRoute::new(ip("10.0.0.0"), 8, 100).with_gateway(ip("192.168.1.1")),
        )
        .unwrap();

        let plan = plan(&live, &want, None, RouteSync::Full);
        let stages: Vec<u8> = plan.routes.iter().map(|c| route_stage(c.entry())).collect();
        assert_eq!(stages, vec![0, 1, 2]);
        assert_eq!(plan.addresses.len(), 1);
        assert_eq!(plan.operation_count(), 4);
    }

    #[test]
    fn test_plan_incremental_leaves_foreign_routes() {
        let mut live = desired();
        live.add_route(IpRoute::new(ip("172.16.0.0"), 16, 50)).unwrap();

        let plan_inc = plan(&live, &desired(), None, RouteSync::Incremental);
        assert!(plan_inc.is_empty());

        let plan_full = plan(&live, &desired(), None, RouteSync::Full);
        assert_eq!(plan_full.remove_routes.len(), 1);
    }

    #[test]
    fn test_plan_full_keeps_kernel_and_link_local() {
        let mut live = IpConfig::new(2, AddrFamily::V6);
        live.add_address(IpAddress::new(ip("fe80::1"), 64)).unwrap();
        live.add_route(
            IpRoute::new(ip("fe80::"), 64, 256).with_source(ConfigSource::Kernel),
        )
        .unwrap();

        let plan = plan(&live, &IpConfig::new(2, AddrFamily::V6), None, RouteSync::Full);
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn test_commit_is_idempotent() {
        let (platform, registry, mut engine) = setup().await;
        let cfg = desired();

        let first = engine
            .commit(&platform, &registry, Some(&cfg), RouteSync::Full)
            .await
            .unwrap();
        assert_eq!(first.operations, 3);
        assert!(first.is_complete());

        platform.clear_operations().await;
        let second = engine
            .commit(&platform, &registry, Some(&cfg), RouteSync::Full)
            .await
            .unwrap();
        assert!(second.skipped);
        assert!(platform.operations().await.is_empty());

        engine.invalidate();
        let third = engine
            .commit(&platform, &registry, Some(&cfg), RouteSync::Full)
            .await
            .unwrap();
        assert!(!third.skipped);
        assert_eq!(third.operations, 0);
        assert!(platform.operations().await.is_empty());
    }

    #[tokio::test]
    async fn test_commit_without_config_is_invariant_error() {
        let (platform, registry, mut engine) = setup().await;
        let err = engine
            .commit(&platform, &registry, None, RouteSync::Full)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let (platform, registry, mut engine) = setup().await;
        platform
            .fail_next(PlatformOpKind::AddAddress, InjectedFailure::Busy, 2)
            .await;

        let report = engine
            .commit(&platform, &registry, Some(&desired()), RouteSync::Full)
            .await
            .unwrap();
        assert!(report.is_complete());
        let adds = platform
            .operations()
            .await
            .into_iter()
            .filter(|op| op.kind() == PlatformOpKind::AddAddress)
            .count();
        assert_eq!(adds, 3);
    }

    #[tokio::test]
    async fn test_sole_address_failure_fails_commit() {
        let (platform, registry, mut engine) = setup().await;
        platform
            .fail_next(PlatformOpKind::AddAddress, InjectedFailure::Reject, 1)
            .await;

        let err = engine
            .commit(&platform, &registry, Some(&desired()), RouteSync::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Commit { family: AddrFamily::V4, .. }));
    }

    #[tokio::test]
    async fn test_partial_failure_is_reported() {
        let (platform, registry, mut engine) = setup().await;
        let mut cfg = desired();
        cfg.add_address(IpAddress::new(ip("192.168.1.11"), 24)).unwrap();
        platform
            .fail_matching(
                PlatformOpKind::AddAddress,
                ip("192.168.1.11"),
                InjectedFailure::Reject,
                1,
            )
            .await;

        let report = engine
            .commit(&platform, &registry, Some(&cfg), RouteSync::Full)
            .await
            .unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(platform.get_addresses(2, AddrFamily::V4).await.unwrap().len(), 1);

        // an incomplete commit is retried in full next time
        let retry = engine
            .commit(&platform, &registry, Some(&cfg), RouteSync::Full)
            .await
            .unwrap();
        assert!(retry.is_complete());
        assert_eq!(retry.operations, 1);
    }

    #[tokio::test]
    async fn test_default_route_deferred_without_address() {
        let (platform, registry, mut engine) = setup().await;
        let mut cfg = IpConfig::new(2, AddrFamily::V4);
        cfg.add_route(IpRoute::default_via(ip("192.168.1.1"), 100))
            .unwrap();

        let report = engine
            .commit(&platform, &registry, Some(&cfg), RouteSync::Full)
            .await
            .unwrap();
        assert!(report.deferred_default_routes);
        assert!(platform.operations().await.is_empty());
    }

    #[tokio::test]
    async fn test_gatewayed_route_lifts_default_route_deferral() {
        let (platform, registry, mut engine) = setup().await;
        let mut cfg = IpConfig::new(2, AddrFamily::V4);
        cfg.add_route(
            IpRoute::new(ip("10.0.0.0"), 8, 100).with_gateway(ip("192.168.1.1")),
        )
        .unwrap();
        cfg.add_route(IpRoute::default_via(ip("192.168.1.1"), 100))
            .unwrap();

        let report = engine
            .commit(&platform, &registry, Some(&cfg), RouteSync::Full)
            .await
            .unwrap();
        assert!(!report.deferred_default_routes);
        let adds = platform
            .operations()
            .await
            .into_iter()
            .filter(|op| op.kind() == PlatformOpKind::AddRoute)
            .count();
        assert_eq!(adds, 2);
    }

    #[tokio::test]
    async fn test_effective_metric_applied() {
        let (platform, registry, mut engine) = setup().await;
        registry.publish(DefaultRouteCandidate {
            ifindex: 1,
            family: AddrFamily::V4,
            metric: 100,
            gateway: None,
        });
        registry.publish(DefaultRouteCandidate {
            ifindex: 2,
            family: AddrFamily::V4,
            metric: 100,
            gateway: Some(ip("192.168.1.1")),
        });

        engine
            .commit(&platform, &registry, Some(&desired()), RouteSync::Full)
            .await
            .unwrap();
        let routes = platform.get_routes(2, AddrFamily::V4).await.unwrap();
        let default = routes.iter().find(|r| r.is_default()).unwrap();
        assert_eq!(default.metric, 101);

        // ranking change moves the route on the next commit
        registry.withdraw(1, AddrFamily::V4);
        engine
            .commit(&platform, &registry, Some(&desired()), RouteSync::Full)
            .await
            .unwrap();
        let routes = platform.get_routes(2, AddrFamily::V4).await.unwrap();
        let defaults: Vec<_> = routes.iter().filter(|r| r.is_default()).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].metric, 100);
    }

    #[tokio::test]
    async fn test_withdraw_removes_committed() {
        let (platform, registry, mut engine) = setup().await;
        engine
            .commit(&platform, &registry, Some(&desired()), RouteSync::Full)
            .await
            .unwrap();
        platform.clear_operations().await;

        let removed = engine.withdraw(&platform).await.unwrap();
        assert_eq!(removed, 3);
        assert!(!engine.has_committed());
        let ops = platform.operations().await;
        assert!(matches!(ops[0], PlatformOp::DeleteRoute { ref route, .. } if route.is_default()));
        assert!(platform.get_addresses(2, AddrFamily::V4).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_withdraw_keeps_what_it_did_not_reach() {
        let platform = MemoryPlatform::new();
        platform.add_link(Link::new(2, "eth0").with_carrier(true)).await;
        let registry = DefaultRouteRegistry::new();
        let mut engine =
            CommitEngine::new(2, AddrFamily::V4).with_retry(3, Duration::from_secs(10));
        engine
            .commit(&platform, &registry, Some(&desired()), RouteSync::Full)
            .await
            .unwrap();
        platform
            .fail_next(PlatformOpKind::DeleteAddress, InjectedFailure::Busy, 1)
            .await;

        // routes go first; the address is stuck in its retry delay
        let withdraw = tokio::time::timeout(Duration::from_secs(1), engine.withdraw(&platform));
        assert!(withdraw.await.is_err());

        let left = engine.committed().unwrap();
        assert_eq!(left.num_routes(), 0);
        assert_eq!(left.num_addresses(), 1);
        assert_eq!(platform.get_addresses(2, AddrFamily::V4).await.unwrap().len(), 1);

        assert_eq!(engine.withdraw(&platform).await.unwrap(), 1);
        assert!(!engine.has_committed());
        assert!(platform.get_addresses(2, AddrFamily::V4).await.unwrap().is_empty());
    }
}
