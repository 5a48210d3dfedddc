//! Architectural Contract Test: Retry Architecture
//!
//! This test verifies that retries live in exactly one place: the commit
//! engine, bounded by configuration.
//!
//! Constraints verified:
//! - Transient (busy) failures are retried up to commit_max_retries times
//! - Permanent failures are never retried
//! - With retries disabled a busy platform fails the activation at once
//! - The platform itself never retries
//!
//! If this test fails, someone has added:
//! - Retry loops in the platform layer
//! - Unbounded retries in the commit path

mod common;

use common::*;
use netman_core::config::EngineConfig;
use netman_core::device::{DeviceState, StateReason};
use netman_core::ip_config::IpAddress;
use netman_core::platform::{InjectedFailure, MemoryPlatform, PlatformOpKind};
use netman_core::traits::{Link, Platform};
use tokio_test::{assert_err, assert_ok};

fn fast_retries(max_retries: u32) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.commit_max_retries = max_retries;
    config.commit_retry_delay_ms = 1;
    config
}

#[tokio::test]
async fn busy_platform_without_retries_fails_after_one_attempt() {
    let mut test = TestDevice::with_config(fast_retries(0)).await;
    test.platform
        .fail_next(PlatformOpKind::AddAddress, InjectedFailure::Busy, 1)
        .await;

    test.activate(static_profile("10.0.0.5/24", "10.0.0.1")).await;

    assert_eq!(test.device.state(), DeviceState::Failed);
    assert_eq!(test.device.reason(), StateReason::ConfigFailed);
    let ops = test.operations().await;
    assert_eq!(count(&ops, PlatformOpKind::AddAddress), 1, "ops: {:?}", ops);
    assert!(test.live_addresses().await.is_empty());
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let mut test = TestDevice::with_config(fast_retries(3)).await;
    test.platform
        .fail_next(PlatformOpKind::AddAddress, InjectedFailure::Busy, 2)
        .await;

    test.activate(static_profile("10.0.0.5/24", "10.0.0.1")).await;

    assert_eq!(test.device.state(), DeviceState::Activated);
    let ops = test.operations().await;
    assert_eq!(count(&ops, PlatformOpKind::AddAddress), 3, "ops: {:?}", ops);
    assert_eq!(test.live_addresses().await, vec![ip("10.0.0.5")]);
}

#[tokio::test]
async fn retries_are_bounded() {
    let mut test = TestDevice::with_config(fast_retries(2)).await;
    test.platform
        .fail_next(PlatformOpKind::AddAddress, InjectedFailure::Busy, 10)
        .await;

    test.activate(static_profile("10.0.0.5/24", "10.0.0.1")).await;

    assert_eq!(test.device.state(), DeviceState::Failed);
    let ops = test.operations().await;
    assert_eq!(count(&ops, PlatformOpKind::AddAddress), 3, "1 attempt + 2 retries");
}

#[tokio::test]
async fn permanent_failures_are_not_retried() {
    let mut test = TestDevice::with_config(fast_retries(3)).await;
    test.platform
        .fail_next(PlatformOpKind::AddAddress, InjectedFailure::Reject, 1)
        .await;

    test.activate(static_profile("10.0.0.5/24", "10.0.0.1")).await;

    assert_eq!(test.device.state(), DeviceState::Failed);
    assert_eq!(test.device.reason(), StateReason::ConfigFailed);
    let ops = test.operations().await;
    assert_eq!(count(&ops, PlatformOpKind::AddAddress), 1);
}

#[tokio::test]
async fn platform_reports_busy_without_retrying() {
    let platform = MemoryPlatform::new();
    platform
        .add_link(Link::new(IFINDEX, "eth0").with_carrier(true))
        .await;
    platform
        .fail_next(PlatformOpKind::AddAddress, InjectedFailure::Busy, 1)
        .await;
    let address = IpAddress::new(ip("10.0.0.5"), 24);

    let err = assert_err!(platform.add_address(IFINDEX, &address).await);
    assert!(err.is_transient());
    assert_eq!(platform.operations().await.len(), 1);

    assert_ok!(platform.add_address(IFINDEX, &address).await);
    assert_eq!(platform.operations().await.len(), 2);
}
