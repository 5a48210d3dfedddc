//! Device manager
//!
//! The DeviceManager is responsible for:
//! - Running one task per managed device, fed by a bounded event queue
//! - Routing platform change notifications to the device they concern
//! - Fanning default-route ranking changes out to every device
//! - Arming stage timers and forwarding collaborator requests
//! - Publishing read-only device snapshots
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  PlatformEvent   ┌───────────────┐   DeviceEvent   ┌──────────┐
//! │  Platform   │─────────────────►│ DeviceManager │────────────────►│  Device  │ (task per
//! └─────────────┘                  └───────────────┘                 └──────────┘  interface)
//!        ▲                                 ▲                           │  │  │
//!        │                                 │ ranking generation        │  │  │
//!        │                         ┌───────────────┐                   │  │  │
//!        │                         │ DefaultRoute  │◄──── publish ─────┘  │  │
//!        │                         │   Registry    │                      │  │
//!        │                         └───────────────┘                      │  │
//!        └──────────────────── commit / withdraw ─────────────────────────┘  │
//!                                                                            ▼
//!                                            DeviceNotification / DeviceRequest channels
//! ```
//!
//! ## Timers
//!
//! `ArmTimer` requests never leave the manager. Each one becomes a sleeping
//! task holding a weak sender of the device's queue; the timeout comes back
//! through the normal event path, and closing the queue is enough to make
//! pending timers vanish.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::device::{
    Device, DeviceEvent, DeviceNotification, DeviceRequest, DeviceSnapshot, DeviceSpec,
    DeviceState,
};
use crate::error::{Error, Result};
use crate::profile::Profile;
use crate::registry::DefaultRouteRegistry;
use crate::traits::{Platform, PlatformEvent};

struct DeviceHandle {
    spec: DeviceSpec,
    queue: mpsc::Sender<DeviceEvent>,
    snapshot: watch::Receiver<DeviceSnapshot>,
    task: JoinHandle<()>,
}

/// Owner of every managed device
///
/// ## Lifecycle
///
/// 1. Create with [`DeviceManager::new()`]
/// 2. Add devices with [`DeviceManager::add_device()`]
/// 3. Start with [`DeviceManager::run()`]
/// 4. `run` returns after shutdown, once every device task has exited
///
/// ## Load Resistance
///
/// - **Bounded device queues**: producers wait when a device falls behind
/// - **Bounded notification channel**: notifications are dropped (logged)
///   when the bus side does not keep up
pub struct DeviceManager {
    platform: Arc<dyn Platform>,
    registry: Arc<DefaultRouteRegistry>,
    config: EngineConfig,
    notify_tx: mpsc::Sender<DeviceNotification>,
    request_tx: mpsc::UnboundedSender<DeviceRequest>,
    devices: RwLock<BTreeMap<u32, DeviceHandle>>,
}

impl DeviceManager {
    /// Create a new device manager
    ///
    /// # Returns
    ///
    /// A tuple of (manager, notification receiver, request receiver). The
    /// request receiver yields the collaborator work devices ask for
    /// (DHCP, authentication, connectivity checks...).
    pub fn new(
        platform: Arc<dyn Platform>,
        registry: Arc<DefaultRouteRegistry>,
        config: EngineConfig,
    ) -> Result<(
        Self,
        mpsc::Receiver<DeviceNotification>,
        mpsc::UnboundedReceiver<DeviceRequest>,
    )> {
        config.validate()?;

        let (notify_tx, notify_rx) = mpsc::channel(config.notification_channel_capacity);
        let (request_tx, request_rx) = mpsc::unbounded_channel();

        let manager = Self {
            platform,
            registry,
            config,
            notify_tx,
            request_tx,
            devices: RwLock::new(BTreeMap::new()),
        };

        Ok((manager, notify_rx, request_rx))
    }

    pub fn registry(&self) -> &Arc<DefaultRouteRegistry> {
        &self.registry
    }

    /// Start managing an interface
    pub async fn add_device(&self, spec: DeviceSpec) -> Result<()> {
        spec.validate()?;
        let mut devices = self.devices.write().await;
        if devices.contains_key(&spec.ifindex) {
            return Err(Error::config(format!(
                "Device ifindex {} is already managed",
                spec.ifindex
            )));
        }

        let link = self.platform.link(spec.ifindex).await?;
        let device = Device::new(
            spec.clone(),
            link.as_ref(),
            Arc::clone(&self.platform),
            Arc::clone(&self.registry),
            self.config.clone(),
            self.notify_tx.clone(),
        );

        let (queue, events) = mpsc::channel(self.config.event_queue_capacity);
        let (snapshot_tx, snapshot) = watch::channel(device.snapshot());
        let task = tokio::spawn(run_device(
            device,
            events,
            queue.downgrade(),
            snapshot_tx,
            self.request_tx.clone(),
        ));

        info!("Managing {} (ifindex {})", spec.name, spec.ifindex);
        devices.insert(
            spec.ifindex,
            DeviceHandle {
                spec,
                queue,
                snapshot,
                task,
            },
        );
        Ok(())
    }

    /// Stop managing an interface
    ///
    /// The device is deactivated first; returns once its task has exited.
    pub async fn remove_device(&self, ifindex: u32) -> Result<()> {
        let handle = self
            .devices
            .write()
            .await
            .remove(&ifindex)
            .ok_or(Error::UnknownDevice(ifindex))?;

        if handle.queue.send(DeviceEvent::Deactivate).await.is_err() {
            debug!("Device {} queue already closed", ifindex);
        }
        drop(handle.queue);
        if let Err(e) = handle.task.await {
            error!("Device {} task failed: {}", ifindex, e);
        }
        info!("Stopped managing {} (ifindex {})", handle.spec.name, ifindex);
        Ok(())
    }

    /// Queue an event for one device
    pub async fn submit(&self, ifindex: u32, event: DeviceEvent) -> Result<()> {
        let queue = self
            .devices
            .read()
            .await
            .get(&ifindex)
            .map(|h| h.queue.clone())
            .ok_or(Error::UnknownDevice(ifindex))?;
        queue
            .send(event)
            .await
            .map_err(|_| Error::ChannelClosed(format!("device {} queue", ifindex)))
    }

    /// Request activation of `profile` on a device
    ///
    /// Profiles that are invalid, incompatible with the device, or aimed at
    /// a device without a usable link are refused here rather than queued.
    pub async fn activate(&self, ifindex: u32, profile: Profile) -> Result<()> {
        profile.validate()?;
        {
            let devices = self.devices.read().await;
            let handle = devices.get(&ifindex).ok_or(Error::UnknownDevice(ifindex))?;
            if !handle.spec.kind.is_compatible(&profile.kind) {
                return Err(Error::Incompatible {
                    ifindex,
                    profile: profile.id,
                });
            }
            let state = handle.snapshot.borrow().state;
            if matches!(state, DeviceState::Unmanaged | DeviceState::Unavailable) {
                return Err(Error::unavailable(
                    ifindex,
                    format!("cannot activate in state {}", state),
                ));
            }
        }
        self.submit(ifindex, DeviceEvent::Activate(Arc::new(profile)))
            .await
    }

    pub async fn deactivate(&self, ifindex: u32) -> Result<()> {
        self.submit(ifindex, DeviceEvent::Deactivate).await
    }

    /// Latest published view of a device
    pub async fn snapshot(&self, ifindex: u32) -> Option<DeviceSnapshot> {
        self.devices
            .read()
            .await
            .get(&ifindex)
            .map(|h| h.snapshot.borrow().clone())
    }

    /// Views of every device, ordered by ifindex
    pub async fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.devices
            .read()
            .await
            .values()
            .map(|h| h.snapshot.borrow().clone())
            .collect()
    }

    /// Follow a device's snapshots as they change
    pub async fn watch_device(&self, ifindex: u32) -> Option<watch::Receiver<DeviceSnapshot>> {
        self.devices
            .read()
            .await
            .get(&ifindex)
            .map(|h| h.snapshot.clone())
    }

    /// Run the manager until SIGINT
    ///
    /// # Returns
    ///
    /// - `Ok(())`: Clean shutdown
    /// - `Err(Error)`: Fatal error
    pub async fn run(&self) -> Result<()> {
        self.run_internal(None).await
    }

    async fn run_internal(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        let mut platform_events = self.platform.watch();
        let mut ranking = self.registry.subscribe();
        info!(
            "Device manager started with {} device(s), default route policy {}",
            self.devices.read().await.len(),
            self.registry.policy_name()
        );

        let shutdown = async move {
            match shutdown_rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to wait for CTRL-C: {}", e);
                    }
                }
            }
        };
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                Some(event) = platform_events.next() => {
                    self.route_platform_event(event).await;
                }

                Ok(()) = ranking.changed() => {
                    let generation = *ranking.borrow_and_update();
                    debug!("Default route ranking changed (generation {})", generation);
                    self.broadcast(DeviceEvent::DefaultRouteRankingChanged).await;
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown().await;
        info!("All device tasks stopped, manager stopped");
        Ok(())
    }

    async fn route_platform_event(&self, event: PlatformEvent) {
        let Some(ifindex) = event.ifindex() else {
            warn!("Platform events were lost, resynchronizing every device");
            self.broadcast(DeviceEvent::External(event)).await;
            return;
        };
        let queue = self
            .devices
            .read()
            .await
            .get(&ifindex)
            .map(|h| h.queue.clone());
        match queue {
            Some(queue) => {
                if queue.send(DeviceEvent::External(event)).await.is_err() {
                    warn!("Device {} queue closed, dropping platform event", ifindex);
                }
            }
            None => debug!("Platform event for unmanaged ifindex {}", ifindex),
        }
    }

    async fn broadcast(&self, event: DeviceEvent) {
        let queues: Vec<_> = self
            .devices
            .read()
            .await
            .values()
            .map(|h| h.queue.clone())
            .collect();
        for queue in queues {
            if queue.send(event.clone()).await.is_err() {
                debug!("Device queue closed during broadcast");
            }
        }
    }

    /// Close every device queue and wait for the tasks to finish
    ///
    /// Interfaces keep their configuration; only the manager goes away.
    async fn shutdown(&self) {
        let handles = std::mem::take(&mut *self.devices.write().await);
        for (ifindex, handle) in handles {
            drop(handle.queue);
            if let Err(e) = handle.task.await {
                error!("Device {} task failed: {}", ifindex, e);
            }
        }
    }

    /// Test-only helper to run the manager with a controlled shutdown signal
    ///
    /// **TESTING ONLY**: contract tests require controlled shutdown.
    /// The daemon uses the same entry point with a signal-driven channel.
    pub async fn run_with_shutdown(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        self.run_internal(shutdown_rx).await
    }
}

/// Body of a device task
///
/// Exits when every strong sender of the queue is gone.
async fn run_device(
    mut device: Device,
    mut events: mpsc::Receiver<DeviceEvent>,
    queue: mpsc::WeakSender<DeviceEvent>,
    snapshot: watch::Sender<DeviceSnapshot>,
    requests: mpsc::UnboundedSender<DeviceRequest>,
) {
    if let Err(e) = device.drain().await {
        error!("[{}] {}", device.name(), e);
    }
    dispatch(&mut device, &queue, &requests);
    snapshot.send_replace(device.snapshot());

    while let Some(event) = events.recv().await {
        if let Err(e) = device.handle(event).await {
            error!("[{}] event processing failed: {}", device.name(), e);
        }
        dispatch(&mut device, &queue, &requests);
        snapshot.send_replace(device.snapshot());
    }
    debug!("[{}] device task exiting", device.name());
}

fn dispatch(
    device: &mut Device,
    queue: &mpsc::WeakSender<DeviceEvent>,
    requests: &mpsc::UnboundedSender<DeviceRequest>,
) {
    for request in device.take_requests() {
        match request {
            DeviceRequest::ArmTimer {
                activation,
                timer,
                after,
                ..
            } => {
                let queue = queue.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let delivered = match queue.upgrade() {
                        Some(queue) => queue
                            .send(DeviceEvent::Timeout { activation, timer })
                            .await
                            .is_ok(),
                        None => false,
                    };
                    if !delivered {
                        debug!("Device queue closed, dropping {:?} timeout", timer);
                    }
                });
            }
            request => {
                if requests.send(request).is_err() {
                    debug!("[{}] request receiver dropped", device.name());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip_config::AddrFamily;
    use crate::platform::MemoryPlatform;
    use crate::profile::{DeviceKind, IpSetting, ProfileKind};
    use crate::traits::Link;
    use std::time::Duration;

    async fn manager_with(
        platform: &MemoryPlatform,
    ) -> (
        DeviceManager,
        mpsc::Receiver<DeviceNotification>,
        mpsc::UnboundedReceiver<DeviceRequest>,
    ) {
        DeviceManager::new(
            Arc::new(platform.clone()),
            Arc::new(DefaultRouteRegistry::new()),
            EngineConfig::default(),
        )
        .unwrap()
    }

    fn wired(addr: &str) -> Profile {
        Profile::new("wired", ProfileKind::Ethernet { ieee8021x: false })
            .with_ipv4(IpSetting::manual(vec![addr.parse().unwrap()]))
            .with_ipv6(IpSetting::disabled())
    }

    #[tokio::test]
    async fn test_add_device_publishes_snapshot() {
        let platform = MemoryPlatform::new();
        platform
            .add_link(Link::new(2, "eth0").with_carrier(true))
            .await;
        let (manager, _notes, _requests) = manager_with(&platform).await;

        manager
            .add_device(DeviceSpec::new(2, "eth0", DeviceKind::Ethernet))
            .await
            .unwrap();
        let mut watch = manager.watch_device(2).await.unwrap();
        let snapshot = watch
            .wait_for(|s| s.state == DeviceState::Disconnected)
            .await
            .unwrap()
            .clone();
        assert_eq!(snapshot.name, "eth0");

        assert!(manager
            .add_device(DeviceSpec::new(2, "eth0", DeviceKind::Ethernet))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_activate_refuses_early() {
        let platform = MemoryPlatform::new();
        platform.add_link(Link::new(2, "eth0")).await;
        let (manager, _notes, _requests) = manager_with(&platform).await;
        manager
            .add_device(DeviceSpec::new(2, "eth0", DeviceKind::Ethernet))
            .await
            .unwrap();

        let err = manager.activate(2, wired("10.0.0.5/24")).await.unwrap_err();
        assert!(matches!(err, Error::DeviceUnavailable { ifindex: 2, .. }));

        let err = manager.activate(7, wired("10.0.0.5/24")).await.unwrap_err();
        assert!(matches!(err, Error::UnknownDevice(7)));
    }

    #[tokio::test]
    async fn test_platform_events_reach_devices() {
        let platform = MemoryPlatform::new();
        platform.add_link(Link::new(2, "eth0")).await;
        let (manager, _notes, _requests) = manager_with(&platform).await;
        let manager = Arc::new(manager);
        manager
            .add_device(DeviceSpec::new(2, "eth0", DeviceKind::Ethernet))
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let runner = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.run_with_shutdown(Some(shutdown_rx)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        platform.set_carrier(2, true).await.unwrap();
        let mut watch = manager.watch_device(2).await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(2),
            watch.wait_for(|s| s.state == DeviceState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();

        manager.activate(2, wired("10.0.0.5/24")).await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(2),
            watch.wait_for(|s| s.state == DeviceState::Activated),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(
            platform.get_addresses(2, AddrFamily::V4).await.unwrap().len(),
            1
        );

        shutdown_tx.send(()).unwrap();
        runner.await.unwrap().unwrap();
        assert!(manager.snapshots().await.is_empty());
    }
}
