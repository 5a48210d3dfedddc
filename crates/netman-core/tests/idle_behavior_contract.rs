//! Architectural Contract Test: Idle Behavior
//!
//! This test verifies that the manager does NO work when nothing happens.
//!
//! Constraints verified:
//! - No platform queries or mutations without events
//! - No periodic re-commits of activated devices
//! - Devices stay where they are while idle
//!
//! If this test fails, someone has added:
//! - Polling loops
//! - Background periodic reconciliation

mod common;

use common::*;
use netman_core::config::{DeviceSpec, EngineConfig};
use netman_core::device::DeviceState;
use netman_core::engine::DeviceManager;
use netman_core::platform::MemoryPlatform;
use netman_core::profile::DeviceKind;
use netman_core::registry::DefaultRouteRegistry;
use netman_core::traits::Link;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

async fn idle_for(activate: bool, idle: Duration) -> (CountingPlatform, DeviceState) {
    let memory = MemoryPlatform::new();
    memory
        .add_link(Link::new(IFINDEX, "eth0").with_carrier(true))
        .await;
    let counting = CountingPlatform::new(memory);
    let (manager, _notifications, _requests) = DeviceManager::new(
        Arc::new(counting.clone()),
        Arc::new(DefaultRouteRegistry::new()),
        EngineConfig::default(),
    )
    .unwrap();
    let manager = Arc::new(manager);
    manager
        .add_device(DeviceSpec::new(IFINDEX, "eth0", DeviceKind::Ethernet))
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let runner = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.run_with_shutdown(Some(shutdown_rx)).await })
    };

    let mut watch = manager.watch_device(IFINDEX).await.unwrap();
    watch
        .wait_for(|s| s.state == DeviceState::Disconnected)
        .await
        .unwrap();
    if activate {
        manager
            .activate(IFINDEX, static_profile("10.0.0.5/24", "10.0.0.1"))
            .await
            .unwrap();
        watch
            .wait_for(|s| s.state == DeviceState::Activated)
            .await
            .unwrap();
    }

    counting.reset_counts();
    tokio::time::sleep(idle).await;
    let state = watch.borrow().state;

    shutdown_tx.send(()).unwrap();
    runner.await.unwrap().unwrap();
    (counting, state)
}

#[tokio::test(start_paused = true)]
async fn idle_disconnected_device_does_nothing() {
    let (counting, state) = idle_for(false, Duration::from_secs(3600)).await;

    assert_eq!(state, DeviceState::Disconnected);
    assert_eq!(counting.query_count(), 0);
    assert_eq!(counting.mutation_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn idle_activated_device_is_not_recommitted() {
    let (counting, state) = idle_for(true, Duration::from_secs(3600)).await;

    assert_eq!(state, DeviceState::Activated);
    assert_eq!(counting.query_count(), 0, "no polling of the platform");
    assert_eq!(counting.mutation_count(), 0, "no periodic re-commit");
}
