//! Device activation state machine
//!
//! One [`Device`] owns one managed interface. Events are processed strictly
//! one at a time; follow-up events a transition produces are queued inside
//! the device and drained before [`Device::handle`] returns.
//!
//! ```text
//!  UNMANAGED ─► UNAVAILABLE ◄─► DISCONNECTED ─► PREPARE ─► CONFIG ─┬─► NEED_AUTH ─┐
//!                                    ▲                             │              ▼
//!                                    │                             └─────────► IP_CONFIG
//!                                    │                                            │
//!                              DEACTIVATING ◄── any active state                  ▼
//!                                                                              IP_CHECK
//!                                                                                 │
//!                                               ACTIVATED ◄── SECONDARIES ◄───────┘
//! ```
//!
//! Every activation gets a fresh [`ActivationId`]. Collaborators echo it in
//! their completion events, so results that belong to a cancelled
//! activation are recognised and dropped.
//!
//! ## IP configuration
//!
//! Each family keeps the fragment every source contributed, already
//! filtered by the profile's merge flags, next to the merged composite. An
//! update subtracts the source's previous fragment and merges the new one,
//! so a renewal only touches what actually changed.
//!
//! ## Collaborators
//!
//! A device never talks to DHCP clients, supplicants or timers directly. It
//! appends [`DeviceRequest`]s to an outbox the owner drains with
//! [`Device::take_requests`], and publishes [`DeviceNotification`]s on a
//! bounded channel.

mod event;
mod state;

pub use crate::config::DeviceSpec;
pub use event::{
    ActivationId, DeviceEvent, DeviceNotification, DeviceRequest, SourceOutcome, TimerKind,
};
pub use state::{DeviceState, StateReason};

use chrono::Utc;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::commit::{CommitEngine, RouteSync};
use crate::config::EngineConfig;
use crate::dedup::DedupEntry;
use crate::error::{Error, Result};
use crate::ip_config::{
    read_resolv_conf, AddrFamily, ConfigSource, IpAddress, IpConfig, IpRoute, MergeFlags,
};
use crate::profile::{IpMethod, IpSetting, Profile};
use crate::registry::DefaultRouteRegistry;
use crate::traits::{DefaultRouteCandidate, Link, Platform, PlatformEvent};

/// Progress of one family during IP_CONFIG
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FamilyStatus {
    Disabled,
    Pending,
    Ready,
    Failed,
}

#[derive(Debug)]
struct FamilyConfig {
    family: AddrFamily,
    status: FamilyStatus,
    /// Filtered contribution of every source, in merge priority order
    fragments: BTreeMap<ConfigSource, IpConfig>,
    /// Merged configuration; present between PREPARE and teardown
    composite: Option<IpConfig>,
    engine: CommitEngine,
}

impl FamilyConfig {
    fn new(ifindex: u32, family: AddrFamily, config: &EngineConfig) -> Self {
        Self {
            family,
            status: FamilyStatus::Disabled,
            fragments: BTreeMap::new(),
            composite: None,
            engine: CommitEngine::new(ifindex, family)
                .with_retry(config.commit_max_retries, config.commit_retry_delay()),
        }
    }

    fn begin(&mut self, ifindex: u32) {
        self.clear();
        self.composite = Some(IpConfig::new(ifindex, self.family));
    }

    /// Drop the activation's configuration
    ///
    /// The engine keeps whatever an interrupted teardown left installed.
    fn clear(&mut self) {
        self.status = FamilyStatus::Disabled;
        self.fragments.clear();
        self.composite = None;
        self.engine.invalidate();
    }

    /// Replace the contribution of `source` with `fragment`
    fn apply(&mut self, source: ConfigSource, fragment: IpConfig) -> Result<()> {
        let composite = self.composite.as_mut().ok_or_else(|| {
            Error::invariant(format!("{} fragment applied outside an activation", self.family))
        })?;
        if let Some(previous) = self.fragments.remove(&source) {
            composite.subtract(&previous);
        }
        composite.merge(&fragment, MergeFlags::default());
        self.fragments.insert(source, fragment);
        self.settle_scalars();
        Ok(())
    }

    /// Drop the contribution of `source`
    fn withdraw(&mut self, source: ConfigSource) -> bool {
        let (Some(composite), Some(previous)) =
            (self.composite.as_mut(), self.fragments.remove(&source))
        else {
            return false;
        };
        composite.subtract(&previous);
        self.settle_scalars();
        true
    }

    /// Scalars follow source priority rather than arrival order
    fn settle_scalars(&mut self) {
        let Some(composite) = self.composite.as_mut() else {
            return;
        };
        for fragment in self.fragments.values() {
            if fragment.gateway().is_some() {
                composite.set_gateway(fragment.gateway());
            }
            if fragment.dns_priority() != 0 {
                composite.set_dns_priority(fragment.dns_priority());
            }
            if fragment.mss() != 0 {
                composite.set_mss(fragment.mss());
            }
            if fragment.mtu() != 0 {
                composite.set_mtu(fragment.mtu());
            }
        }
    }

    fn num_addresses(&self) -> usize {
        self.composite.as_ref().map_or(0, IpConfig::num_addresses)
    }
}

/// Flags a source's fragments are merged with
fn merge_flags(setting: &IpSetting, source: ConfigSource) -> MergeFlags {
    let mut flags = MergeFlags::default();
    if matches!(source, ConfigSource::Dhcp | ConfigSource::Autoconf) {
        if setting.never_default {
            flags = flags.never_default();
        }
        if setting.ignore_auto_dns {
            flags = flags.no_dns();
        }
        if setting.ignore_auto_routes {
            flags = flags.no_routes();
        }
    }
    flags
}

fn slot(family: AddrFamily) -> usize {
    match family {
        AddrFamily::V4 => 0,
        AddrFamily::V6 => 1,
    }
}

#[derive(Debug, Clone)]
struct Activation {
    id: ActivationId,
    profile: Arc<Profile>,
}

/// Read-only view of a device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub ifindex: u32,
    pub name: String,
    pub state: DeviceState,
    pub reason: StateReason,
    pub activation: Option<ActivationId>,
    pub profile: Option<String>,
    pub ip4: Option<IpConfig>,
    pub ip6: Option<IpConfig>,
}

/// Activation state machine for one interface
pub struct Device {
    spec: DeviceSpec,
    platform: Arc<dyn Platform>,
    registry: Arc<DefaultRouteRegistry>,
    config: EngineConfig,
    notify_tx: mpsc::Sender<DeviceNotification>,

    state: DeviceState,
    reason: StateReason,
    link_present: bool,
    carrier: bool,

    activation: Option<Activation>,
    next_activation: u64,
    /// Profile waiting for the current activation to tear down
    queued: Option<Arc<Profile>>,

    pending: VecDeque<DeviceEvent>,
    requests: Vec<DeviceRequest>,
    families: [FamilyConfig; 2],
}

impl Device {
    /// Create a device for `spec`
    ///
    /// The device starts UNMANAGED when `link` is absent and UNAVAILABLE
    /// otherwise. A link with carrier queues the move to DISCONNECTED; call
    /// [`Device::drain`] to process it.
    pub fn new(
        spec: DeviceSpec,
        link: Option<&Link>,
        platform: Arc<dyn Platform>,
        registry: Arc<DefaultRouteRegistry>,
        config: EngineConfig,
        notify_tx: mpsc::Sender<DeviceNotification>,
    ) -> Self {
        let families = AddrFamily::ALL.map(|family| FamilyConfig::new(spec.ifindex, family, &config));
        let mut device = Self {
            spec,
            platform,
            registry,
            config,
            notify_tx,
            state: DeviceState::Unmanaged,
            reason: StateReason::None,
            link_present: false,
            carrier: false,
            activation: None,
            next_activation: 0,
            queued: None,
            pending: VecDeque::new(),
            requests: Vec::new(),
            families,
        };

        if let Some(link) = link {
            device.link_present = true;
            device.carrier = link.carrier;
            device.state = DeviceState::Unavailable;
            device.reason = StateReason::NowManaged;
            if link.carrier {
                device.pending.push_back(DeviceEvent::CarrierChanged(true));
            }
        }
        device
    }

    pub fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    pub fn ifindex(&self) -> u32 {
        self.spec.ifindex
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Reason of the last transition
    pub fn reason(&self) -> StateReason {
        self.reason
    }

    pub fn activation_id(&self) -> Option<ActivationId> {
        self.activation.as_ref().map(|a| a.id)
    }

    /// Profile of the current activation
    pub fn profile(&self) -> Option<&Profile> {
        self.activation.as_ref().map(|a| a.profile.as_ref())
    }

    /// Merged configuration of one family
    pub fn ip_config(&self, family: AddrFamily) -> Option<&IpConfig> {
        self.families[slot(family)].composite.as_ref()
    }

    /// Filtered contribution of one source
    pub fn fragment(&self, family: AddrFamily, source: ConfigSource) -> Option<&IpConfig> {
        self.families[slot(family)].fragments.get(&source)
    }

    /// Whether internal follow-up events are waiting
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Collaborator requests produced since the last call
    pub fn take_requests(&mut self) -> Vec<DeviceRequest> {
        std::mem::take(&mut self.requests)
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            ifindex: self.spec.ifindex,
            name: self.spec.name.clone(),
            state: self.state,
            reason: self.reason,
            activation: self.activation_id(),
            profile: self.profile().map(|p| p.id.clone()),
            ip4: self.ip_config(AddrFamily::V4).cloned(),
            ip6: self.ip_config(AddrFamily::V6).cloned(),
        }
    }

    /// Process `event` and every follow-up event it produces
    ///
    /// An `Activate` carrying a profile the device cannot use is refused
    /// before it is queued and leaves the device untouched. Apart from
    /// that only fatal errors are returned; the device is FAILED by then.
    pub async fn handle(&mut self, event: DeviceEvent) -> Result<()> {
        if let DeviceEvent::Activate(profile) = &event {
            self.check_profile(profile)?;
        }
        self.pending.push_back(event);
        self.drain().await
    }

    /// Process queued follow-up events
    pub async fn drain(&mut self) -> Result<()> {
        while let Some(event) = self.pending.pop_front() {
            let Err(e) = self.process(event).await else {
                continue;
            };

            if e.is_fatal() {
                error!("[{}] {}", self.spec.name, e);
                self.pending.clear();
                self.fail(StateReason::InternalError).await;
                return Err(e);
            }

            match e {
                Error::Commit { .. } | Error::InvalidInput(_) | Error::Config(_)
                    if self.state.is_active() =>
                {
                    warn!("[{}] configuration failed: {}", self.spec.name, e);
                    self.fail(StateReason::ConfigFailed).await;
                }
                Error::Platform(_) | Error::PlatformBusy(_) | Error::NotFound(_) | Error::Io(_)
                    if self.state.is_active() =>
                {
                    warn!("[{}] platform failure: {}", self.spec.name, e);
                    self.fail(StateReason::PlatformError).await;
                }
                other => warn!("[{}] event dropped: {}", self.spec.name, other),
            }
        }
        Ok(())
    }

    async fn process(&mut self, event: DeviceEvent) -> Result<()> {
        if let Some(id) = event.activation() {
            if self.activation_id() != Some(id) {
                debug!("[{}] dropping stale event of activation {}", self.spec.name, id);
                return Ok(());
            }
        }

        match event {
            DeviceEvent::CarrierChanged(carrier) => self.carrier_changed(carrier).await,
            DeviceEvent::LinkRemoved => self.link_removed().await,
            DeviceEvent::Activate(profile) => self.activate(profile).await,
            DeviceEvent::Deactivate => self.deactivate().await,
            DeviceEvent::LinkPrepared { .. } => self.link_prepared().await,
            DeviceEvent::L2Ready { .. } => self.l2_ready().await,
            DeviceEvent::AuthCompleted { result, .. } => {
                if self.state != DeviceState::NeedAuth {
                    return Ok(());
                }
                match result {
                    Ok(()) => self.start_ip_config().await,
                    Err(message) => {
                        warn!("[{}] authentication failed: {}", self.spec.name, message);
                        self.fail(StateReason::AuthFailed).await;
                        Ok(())
                    }
                }
            }
            DeviceEvent::SourceUpdate {
                family,
                source,
                outcome,
                ..
            } => self.source_update(family, source, outcome).await,
            DeviceEvent::ConnectivityChecked { reachable, .. } => {
                if self.state != DeviceState::IpCheck {
                    return Ok(());
                }
                if !reachable {
                    info!("[{}] connectivity check failed", self.spec.name);
                }
                self.enter_secondaries()
            }
            DeviceEvent::SecondariesCompleted { result, .. } => {
                if self.state != DeviceState::Secondaries {
                    return Ok(());
                }
                match result {
                    Ok(()) => self.activated(),
                    Err(message) => {
                        warn!("[{}] secondary connections failed: {}", self.spec.name, message);
                        self.fail(StateReason::SecondaryConnectionFailed).await;
                        Ok(())
                    }
                }
            }
            DeviceEvent::Timeout { timer, .. } => self.timeout(timer).await,
            DeviceEvent::External(event) => self.external(event).await,
            DeviceEvent::DefaultRouteRankingChanged => {
                if !self.state.is_configured() {
                    return Ok(());
                }
                self.publish_default_routes();
                self.commit_all(RouteSync::Incremental).await
            }
            DeviceEvent::PlatformFailure(message) => {
                self.platform_failure(&message).await;
                Ok(())
            }
        }
    }

    // ---- link ------------------------------------------------------

    async fn carrier_changed(&mut self, carrier: bool) -> Result<()> {
        self.carrier = carrier;
        match (self.state, carrier) {
            (DeviceState::Unavailable, true) => {
                self.set_state(DeviceState::Disconnected, StateReason::CarrierChanged)?;
                self.start_queued()
            }
            (DeviceState::Disconnected | DeviceState::Failed, false) => {
                self.set_state(DeviceState::Unavailable, StateReason::CarrierChanged)
            }
            (state, false) if state.is_active() => {
                self.begin_deactivate(StateReason::CarrierChanged).await
            }
            _ => Ok(()),
        }
    }

    async fn link_changed(&mut self, link: Link) -> Result<()> {
        if !self.link_present {
            self.link_present = true;
            self.carrier = link.carrier;
            self.set_state(DeviceState::Unavailable, StateReason::NowManaged)?;
            if link.carrier {
                self.pending.push_back(DeviceEvent::CarrierChanged(true));
            }
            return Ok(());
        }
        if link.carrier != self.carrier {
            return self.carrier_changed(link.carrier).await;
        }
        Ok(())
    }

    async fn link_removed(&mut self) -> Result<()> {
        self.link_present = false;
        self.carrier = false;
        match self.state {
            DeviceState::Unmanaged => Ok(()),
            state if state.is_active() => self.begin_deactivate(StateReason::LinkRemoved).await,
            _ => {
                self.queued = None;
                self.set_state(DeviceState::Unmanaged, StateReason::LinkRemoved)
            }
        }
    }

    async fn platform_failure(&mut self, message: &str) {
        if self.state.is_active() {
            error!("[{}] fatal platform error: {}", self.spec.name, message);
            self.fail(StateReason::PlatformError).await;
        } else {
            debug!("[{}] platform error while idle: {}", self.spec.name, message);
        }
    }

    // ---- activation ------------------------------------------------

    fn check_profile(&self, profile: &Profile) -> Result<()> {
        profile.validate()?;
        if !self.spec.kind.is_compatible(&profile.kind) {
            return Err(Error::Incompatible {
                ifindex: self.spec.ifindex,
                profile: profile.id.clone(),
            });
        }
        Ok(())
    }

    async fn activate(&mut self, profile: Arc<Profile>) -> Result<()> {
        if let Err(e) = self.check_profile(&profile) {
            warn!("[{}] refusing profile {}: {}", self.spec.name, profile.id, e);
            return Ok(());
        }

        match self.state {
            DeviceState::Disconnected => self.start_activation(profile, StateReason::UserRequested),
            DeviceState::Failed => {
                self.set_state(DeviceState::Disconnected, StateReason::UserRequested)?;
                self.start_activation(profile, StateReason::UserRequested)
            }
            state if state.is_active() => {
                info!(
                    "[{}] profile {} replaces the current activation",
                    self.spec.name, profile.id
                );
                self.queued = Some(profile);
                self.begin_deactivate(StateReason::NewActivation).await
            }
            state => Err(Error::unavailable(
                self.spec.ifindex,
                format!("cannot activate in state {}", state),
            )),
        }
    }

    fn start_queued(&mut self) -> Result<()> {
        match self.queued.take() {
            Some(profile) => self.start_activation(profile, StateReason::NewActivation),
            None => Ok(()),
        }
    }

    fn start_activation(&mut self, profile: Arc<Profile>, reason: StateReason) -> Result<()> {
        self.next_activation += 1;
        let id = ActivationId(self.next_activation);
        let ifindex = self.spec.ifindex;
        for family in &mut self.families {
            family.begin(ifindex);
        }

        info!(
            "[{}] activating profile {} ({})",
            self.spec.name, profile.id, id
        );
        self.activation = Some(Activation { id, profile });
        self.set_state(DeviceState::Prepare, reason)?;
        self.pending
            .push_back(DeviceEvent::LinkPrepared { activation: id });
        Ok(())
    }

    fn current(&self) -> Result<(ActivationId, Arc<Profile>)> {
        self.activation
            .as_ref()
            .map(|a| (a.id, Arc::clone(&a.profile)))
            .ok_or_else(|| {
                Error::invariant(format!(
                    "{} in state {} without an activation",
                    self.spec.name, self.state
                ))
            })
    }

    /// PREPARE -> CONFIG, then link-layer setup
    async fn link_prepared(&mut self) -> Result<()> {
        if self.state != DeviceState::Prepare {
            return Ok(());
        }
        let (id, profile) = self.current()?;
        self.set_state(DeviceState::Config, StateReason::None)?;

        if let Some(mtu) = profile.mtu {
            self.platform.set_link_mtu(self.spec.ifindex, mtu).await?;
            debug!("[{}] MTU set to {}", self.spec.name, mtu);
        }

        self.pending.push_back(DeviceEvent::L2Ready { activation: id });
        Ok(())
    }

    async fn l2_ready(&mut self) -> Result<()> {
        if self.state != DeviceState::Config {
            return Ok(());
        }
        let (id, profile) = self.current()?;
        if !profile.requires_auth() {
            return self.start_ip_config().await;
        }

        self.set_state(DeviceState::NeedAuth, StateReason::None)?;
        self.requests.push(DeviceRequest::Authenticate {
            ifindex: self.spec.ifindex,
            activation: id,
            profile: profile.id.clone(),
        });
        self.arm_timer(id, TimerKind::Auth, self.config.auth_timeout_secs);
        Ok(())
    }

    async fn start_ip_config(&mut self) -> Result<()> {
        let (id, profile) = self.current()?;
        self.set_state(DeviceState::IpConfig, StateReason::None)?;

        for family in AddrFamily::ALL {
            let setting = profile.ip_setting(family);
            let metric = setting
                .route_metric
                .unwrap_or_else(|| self.spec.kind.default_route_metric());

            let status = match setting.method {
                IpMethod::Disabled => FamilyStatus::Disabled,
                IpMethod::Manual | IpMethod::LinkLocal => FamilyStatus::Ready,
                IpMethod::Auto => FamilyStatus::Pending,
            };
            if status != FamilyStatus::Disabled {
                let fragment = IpConfig::from_setting(self.spec.ifindex, family, setting, metric)?;
                self.families[slot(family)].apply(ConfigSource::Static, fragment)?;
            }

            if status == FamilyStatus::Pending {
                let (request, default_timeout) = match family {
                    AddrFamily::V4 => (
                        DeviceRequest::StartDhcp {
                            ifindex: self.spec.ifindex,
                            activation: id,
                            route_metric: metric,
                        },
                        self.config.dhcp_timeout_secs,
                    ),
                    AddrFamily::V6 => (
                        DeviceRequest::StartAutoconf {
                            ifindex: self.spec.ifindex,
                            activation: id,
                            route_metric: metric,
                        },
                        self.config.autoconf_timeout_secs,
                    ),
                };
                self.requests.push(request);
                self.arm_timer(
                    id,
                    TimerKind::IpConfig(family),
                    setting.dhcp_timeout_secs.unwrap_or(default_timeout),
                );
            }
            self.families[slot(family)].status = status;
        }

        self.check_ip_config().await
    }

    /// Leave IP_CONFIG once no family is pending
    async fn check_ip_config(&mut self) -> Result<()> {
        if self.state != DeviceState::IpConfig {
            return Ok(());
        }
        if self
            .families
            .iter()
            .any(|f| f.status == FamilyStatus::Pending)
        {
            return Ok(());
        }

        let (id, profile) = self.current()?;
        let required_failed = self.families.iter().find(|f| {
            f.status == FamilyStatus::Failed && !profile.ip_setting(f.family).may_fail
        });
        if let Some(family) = required_failed {
            warn!(
                "[{}] required {} configuration failed",
                self.spec.name, family.family
            );
            self.fail(StateReason::IpConfigUnavailable).await;
            return Ok(());
        }

        let enabled = self
            .families
            .iter()
            .filter(|f| f.status != FamilyStatus::Disabled)
            .count();
        let failed = self
            .families
            .iter()
            .filter(|f| f.status == FamilyStatus::Failed)
            .count();
        if enabled > 0 && enabled == failed {
            warn!("[{}] no address family could be configured", self.spec.name);
            self.fail(StateReason::IpConfigUnavailable).await;
            return Ok(());
        }

        self.publish_default_routes();
        self.commit_all(RouteSync::Full).await?;
        self.set_state(DeviceState::IpCheck, StateReason::None)?;

        if self.config.connectivity_check {
            self.requests.push(DeviceRequest::CheckConnectivity {
                ifindex: self.spec.ifindex,
                activation: id,
            });
            self.arm_timer(
                id,
                TimerKind::Connectivity,
                self.config.connectivity_timeout_secs,
            );
            return Ok(());
        }
        self.enter_secondaries()
    }

    fn enter_secondaries(&mut self) -> Result<()> {
        let (id, profile) = self.current()?;
        self.set_state(DeviceState::Secondaries, StateReason::None)?;
        if profile.secondaries.is_empty() {
            return self.activated();
        }

        self.requests.push(DeviceRequest::ActivateSecondaries {
            ifindex: self.spec.ifindex,
            activation: id,
            profiles: profile.secondaries.clone(),
        });
        self.arm_timer(
            id,
            TimerKind::Secondaries,
            self.config.secondaries_timeout_secs,
        );
        Ok(())
    }

    fn activated(&mut self) -> Result<()> {
        let (_, profile) = self.current()?;
        self.set_state(DeviceState::Activated, StateReason::None)?;
        info!("[{}] profile {} activated", self.spec.name, profile.id);
        self.emit(DeviceNotification::Activated {
            ifindex: self.spec.ifindex,
            profile: profile.id.clone(),
        });
        Ok(())
    }

    async fn timeout(&mut self, timer: TimerKind) -> Result<()> {
        match timer {
            TimerKind::Auth if self.state == DeviceState::NeedAuth => {
                warn!("[{}] authentication timed out", self.spec.name);
                self.fail(StateReason::AuthFailed).await;
                Ok(())
            }
            TimerKind::IpConfig(family)
                if self.state == DeviceState::IpConfig
                    && self.families[slot(family)].status == FamilyStatus::Pending =>
            {
                warn!("[{}] {} configuration timed out", self.spec.name, family);
                self.families[slot(family)].status = FamilyStatus::Failed;
                self.check_ip_config().await
            }
            TimerKind::Connectivity if self.state == DeviceState::IpCheck => {
                info!("[{}] connectivity check timed out", self.spec.name);
                self.enter_secondaries()
            }
            TimerKind::Secondaries if self.state == DeviceState::Secondaries => {
                warn!("[{}] secondary connections timed out", self.spec.name);
                self.fail(StateReason::SecondaryConnectionFailed).await;
                Ok(())
            }
            timer => {
                debug!("[{}] {:?} timer outlived its stage", self.spec.name, timer);
                Ok(())
            }
        }
    }

    // ---- IP configuration ------------------------------------------

    async fn source_update(
        &mut self,
        family: AddrFamily,
        source: ConfigSource,
        outcome: SourceOutcome,
    ) -> Result<()> {
        let configuring = self.state == DeviceState::IpConfig;
        if !configuring && !self.state.is_configured() {
            debug!(
                "[{}] {} update from {} ignored in state {}",
                self.spec.name, family, source, self.state
            );
            return Ok(());
        }
        let idx = slot(family);
        if self.families[idx].status == FamilyStatus::Disabled {
            debug!("[{}] {} is disabled, ignoring {}", self.spec.name, family, source);
            return Ok(());
        }
        let (_, profile) = self.current()?;
        let setting = profile.ip_setting(family);

        match outcome {
            SourceOutcome::Bound(config) => {
                if config.family() != family {
                    return Err(Error::invalid_input(format!(
                        "{} fragment reported for {}",
                        config.family(),
                        family
                    )));
                }
                config.validate()?;
                let fragment = config.filtered(merge_flags(setting, source));
                self.families[idx].apply(source, fragment)?;
                self.families[idx].status = FamilyStatus::Ready;

                if configuring {
                    return self.check_ip_config().await;
                }
                info!("[{}] {} configuration from {} updated", self.spec.name, family, source);
                self.publish_default_routes();
                self.commit_family(idx, RouteSync::Incremental).await
            }
            SourceOutcome::Failed(message) => {
                warn!(
                    "[{}] {} configuration from {} failed: {}",
                    self.spec.name, family, source, message
                );
                if configuring {
                    if self.families[idx].status == FamilyStatus::Pending {
                        self.families[idx].status = FamilyStatus::Failed;
                    }
                    return self.check_ip_config().await;
                }

                self.families[idx].withdraw(source);
                let other = self.families[1 - idx].num_addresses();
                if self.families[idx].num_addresses() == 0 && (!setting.may_fail || other == 0) {
                    self.fail(StateReason::IpConfigExpired).await;
                    return Ok(());
                }
                self.publish_default_routes();
                self.commit_family(idx, RouteSync::Incremental).await
            }
        }
    }

    async fn external(&mut self, event: PlatformEvent) -> Result<()> {
        match event {
            PlatformEvent::LinkChanged(link) => self.link_changed(link).await,
            PlatformEvent::LinkRemoved { .. } => self.link_removed().await,
            PlatformEvent::Fatal { message, .. } => {
                self.platform_failure(&message).await;
                Ok(())
            }
            PlatformEvent::AddressAdded { address, .. } => self.external_address_added(address).await,
            PlatformEvent::AddressRemoved { address, .. } => {
                self.external_address_removed(address).await
            }
            PlatformEvent::RouteRemoved { route, .. } => self.external_route_removed(route).await,
            PlatformEvent::RouteAdded { route, .. } => {
                debug!("[{}] route {} added externally", self.spec.name, route);
                Ok(())
            }
            PlatformEvent::Overflow { missed } => self.resync(missed).await,
        }
    }

    /// Re-read the link and restore committed configuration after
    /// platform events were lost
    async fn resync(&mut self, missed: u64) -> Result<()> {
        match self.platform.link(self.spec.ifindex).await? {
            Some(link) => self.link_changed(link).await?,
            None if self.link_present => return self.link_removed().await,
            None => return Ok(()),
        }
        if !self.state.is_configured() {
            return Ok(());
        }

        info!(
            "[{}] {} platform event(s) lost, recommitting",
            self.spec.name, missed
        );
        for family in &mut self.families {
            family.engine.invalidate();
        }
        self.commit_all(RouteSync::Incremental).await
    }

    /// Capture an address someone else assigned so later commits keep it
    async fn external_address_added(&mut self, address: IpAddress) -> Result<()> {
        if !self.state.is_configured() {
            return Ok(());
        }
        let family = address.family();
        let idx = slot(family);
        let Some(composite) = self.families[idx].composite.as_ref() else {
            return Ok(());
        };
        if composite.lookup_address(&address.address).is_some() {
            return Ok(());
        }
        let needs_dns = composite.num_nameservers() == 0;

        let mut external = self.families[idx]
            .fragments
            .get(&ConfigSource::External)
            .cloned()
            .unwrap_or_else(|| IpConfig::new(self.spec.ifindex, family));
        external.add_address(address.clone().with_source(ConfigSource::External))?;

        if needs_dns {
            if let Some(path) = &self.config.resolv_conf_path {
                match read_resolv_conf(path).await {
                    Ok(resolv) => {
                        for ns in resolv.nameservers {
                            if AddrFamily::of(&ns) == family {
                                external.add_nameserver(ns);
                            }
                        }
                        for search in &resolv.searches {
                            external.add_search(search);
                        }
                        for option in &resolv.options {
                            external.add_dns_option(option);
                        }
                    }
                    Err(e) => warn!(
                        "[{}] cannot read {}: {}",
                        self.spec.name,
                        path.display(),
                        e
                    ),
                }
            }
        }

        info!("[{}] captured external address {}", self.spec.name, address);
        self.families[idx].apply(ConfigSource::External, external)?;
        self.families[idx].engine.invalidate();
        Ok(())
    }

    async fn external_address_removed(&mut self, address: IpAddress) -> Result<()> {
        if !self.state.is_configured() {
            return Ok(());
        }
        let idx = slot(address.family());
        let key = address.key();

        if let Some(external) = self.families[idx].fragments.get(&ConfigSource::External) {
            if external.address_index().contains_key(&key) {
                let mut external = external.clone();
                external.del_address(&key);
                debug!("[{}] external address {} went away", self.spec.name, address);
                return self.families[idx].apply(ConfigSource::External, external);
            }
        }

        let committed = self.families[idx]
            .engine
            .committed()
            .is_some_and(|c| c.address_index().contains_key(&key));
        if !committed {
            return Ok(());
        }
        info!("[{}] address {} removed externally, restoring", self.spec.name, address);
        self.families[idx].engine.invalidate();
        self.commit_family(idx, RouteSync::Incremental).await
    }

    async fn external_route_removed(&mut self, route: IpRoute) -> Result<()> {
        if !self.state.is_configured() {
            return Ok(());
        }
        let idx = slot(route.family());
        let committed = self.families[idx]
            .engine
            .committed()
            .is_some_and(|c| c.lookup_route(&route.key()).is_some());
        if !committed {
            return Ok(());
        }
        info!("[{}] route {} removed externally, restoring", self.spec.name, route);
        self.families[idx].engine.invalidate();
        self.commit_family(idx, RouteSync::Incremental).await
    }

    fn publish_default_routes(&self) {
        for family in &self.families {
            let route = (family.status == FamilyStatus::Ready)
                .then_some(family.composite.as_ref())
                .flatten()
                .and_then(IpConfig::best_default_route);
            match route {
                Some(route) => {
                    self.registry.publish(DefaultRouteCandidate {
                        ifindex: self.spec.ifindex,
                        family: family.family,
                        metric: route.metric,
                        gateway: route.gateway,
                    });
                }
                None => {
                    self.registry.withdraw(self.spec.ifindex, family.family);
                }
            }
        }
    }

    async fn commit_all(&mut self, sync: RouteSync) -> Result<()> {
        for idx in 0..self.families.len() {
            if self.families[idx].status == FamilyStatus::Ready {
                self.commit_family(idx, sync).await?;
            }
        }
        Ok(())
    }

    async fn commit_family(&mut self, idx: usize, sync: RouteSync) -> Result<()> {
        let platform = Arc::clone(&self.platform);
        let registry = Arc::clone(&self.registry);
        let family = &mut self.families[idx];
        let report = family
            .engine
            .commit(
                platform.as_ref(),
                registry.as_ref(),
                family.composite.as_ref(),
                sync,
            )
            .await?;

        for failure in &report.failures {
            warn!("[{}] {}: {}", self.spec.name, family.family, failure);
        }
        if !report.skipped {
            let family = family.family;
            self.emit(DeviceNotification::IpConfigChanged {
                ifindex: self.spec.ifindex,
                family,
                digest: report.digest,
            });
        }
        Ok(())
    }

    // ---- deactivation ----------------------------------------------

    async fn deactivate(&mut self) -> Result<()> {
        self.queued = None;
        match self.state {
            DeviceState::Failed => self.begin_deactivate(StateReason::UserRequested).await,
            state if state.is_active() => self.begin_deactivate(StateReason::UserRequested).await,
            state => {
                debug!("[{}] nothing to deactivate in state {}", self.spec.name, state);
                Ok(())
            }
        }
    }

    /// DEACTIVATING, teardown, DISCONNECTED, then wherever the link allows
    async fn begin_deactivate(&mut self, reason: StateReason) -> Result<()> {
        self.set_state(DeviceState::Deactivating, reason)?;
        self.cancel_activation();
        self.teardown().await;
        self.set_state(DeviceState::Disconnected, reason)?;

        if !self.link_present {
            self.queued = None;
            self.set_state(DeviceState::Unmanaged, StateReason::LinkRemoved)
        } else if !self.carrier {
            self.set_state(DeviceState::Unavailable, StateReason::CarrierChanged)
        } else {
            self.start_queued()
        }
    }

    /// Move to FAILED and remove everything the activation installed
    async fn fail(&mut self, reason: StateReason) {
        if !self.state.is_active() {
            debug!(
                "[{}] ignoring failure ({}) in state {}",
                self.spec.name, reason, self.state
            );
            return;
        }
        if let Err(e) = self.set_state(DeviceState::Failed, reason) {
            error!("[{}] {}", self.spec.name, e);
            return;
        }
        self.cancel_activation();
        self.teardown().await;
    }

    fn cancel_activation(&mut self) {
        if let Some(activation) = self.activation.take() {
            self.requests.push(DeviceRequest::CancelActivation {
                ifindex: self.spec.ifindex,
                activation: activation.id,
            });
        }
    }

    /// Withdraw committed configuration; bounded so it always finishes
    async fn teardown(&mut self) {
        let platform = Arc::clone(&self.platform);
        let limit = self.config.teardown_timeout();
        let name = self.spec.name.clone();
        let families = &mut self.families;

        let withdraw = async {
            for family in families.iter_mut() {
                match family.engine.withdraw(platform.as_ref()).await {
                    Ok(0) => {}
                    Ok(removed) => debug!("[{}] removed {} {} entries", name, removed, family.family),
                    Err(e) => warn!("[{}] {} teardown: {}", name, family.family, e),
                }
            }
        };
        if tokio::time::timeout(limit, withdraw).await.is_err() {
            warn!("[{}] teardown timed out after {:?}", self.spec.name, limit);
            for family in &self.families {
                if let Some(left) = family.engine.committed() {
                    warn!(
                        "[{}] {} address(es) and {} route(s) of {} still installed",
                        self.spec.name,
                        left.num_addresses(),
                        left.num_routes(),
                        family.family
                    );
                }
            }
        }

        self.registry.withdraw_all(self.spec.ifindex);
        for family in &mut self.families {
            family.clear();
        }
    }

    // ---- plumbing --------------------------------------------------

    fn set_state(&mut self, new: DeviceState, reason: StateReason) -> Result<()> {
        let old = self.state;
        if !old.can_transition(new) {
            return Err(Error::InvalidTransition {
                from: old.to_string(),
                to: new.to_string(),
            });
        }
        self.state = new;
        self.reason = reason;
        info!("[{}] {} -> {} ({})", self.spec.name, old, new, reason);
        self.emit(DeviceNotification::StateChanged {
            ifindex: self.spec.ifindex,
            old,
            new,
            reason,
            at: Utc::now(),
        });
        Ok(())
    }

    fn arm_timer(&mut self, activation: ActivationId, timer: TimerKind, secs: u64) {
        self.requests.push(DeviceRequest::ArmTimer {
            ifindex: self.spec.ifindex,
            activation,
            timer,
            after: Duration::from_secs(secs),
        });
    }

    fn emit(&self, notification: DeviceNotification) {
        // Dropped with a warning when the bus side falls behind
        if self.notify_tx.try_send(notification).is_err() {
            warn!(
                "[{}] notification channel full, dropping notification. Consider increasing notification_channel_capacity.",
                self.spec.name
            );
        }
    }
}
