//! Architectural Contract Test: Lease Renewal
//!
//! This test verifies that a renewed lease changes only what changed.
//!
//! Constraints verified:
//! - A new address replaces the old one with one delete and one add
//! - Unchanged routes are not touched
//! - Renewing with an identical lease performs no platform operations
//! - Static addresses survive every renewal
//!
//! If this test fails, someone has added:
//! - Full teardown and re-apply on lease change
//! - Route churn on address-only changes

mod common;

use common::*;
use netman_core::device::DeviceState;
use netman_core::ip_config::AddrFamily;
use netman_core::platform::{PlatformOp, PlatformOpKind};

async fn activated() -> TestDevice {
    let mut test = TestDevice::ethernet().await;
    test.activate(dhcp_profile_with_static("10.0.0.5/24", "10.0.0.1"))
        .await;
    test.dhcp_bound(dhcp_lease("10.0.0.9", "10.0.0.1", "8.8.8.8", 100))
        .await;
    assert_eq!(test.device.state(), DeviceState::Activated);
    test.clear_operations().await;
    test
}

#[tokio::test]
async fn new_lease_address_is_one_delete_and_one_add() {
    let mut test = activated().await;

    test.dhcp_bound(dhcp_lease("10.0.0.12", "10.0.0.1", "8.8.8.8", 100))
        .await;

    let ops = test.operations().await;
    assert_eq!(ops.len(), 2, "unexpected operations: {:?}", ops);
    assert!(ops.iter().any(|op| matches!(
        op,
        PlatformOp::DeleteAddress { address, .. } if address.address == ip("10.0.0.9")
    )));
    assert!(ops.iter().any(|op| matches!(
        op,
        PlatformOp::AddAddress { address, .. } if address.address == ip("10.0.0.12")
    )));
    assert_eq!(count(&ops, PlatformOpKind::AddRoute), 0);
    assert_eq!(count(&ops, PlatformOpKind::DeleteRoute), 0);

    assert_eq!(test.device.state(), DeviceState::Activated);
    assert_eq!(
        test.live_addresses().await,
        vec![ip("10.0.0.5"), ip("10.0.0.12")]
    );
}

#[tokio::test]
async fn identical_renewal_is_silent() {
    let mut test = activated().await;
    let digest = test.device.ip_config(AddrFamily::V4).unwrap().hash(false);
    test.counting.reset_counts();

    test.dhcp_bound(dhcp_lease("10.0.0.9", "10.0.0.1", "8.8.8.8", 100))
        .await;

    assert!(test.operations().await.is_empty());
    assert_eq!(test.counting.mutation_count(), 0);
    assert_eq!(
        test.device.ip_config(AddrFamily::V4).unwrap().hash(false),
        digest
    );
}

#[tokio::test]
async fn renewed_dns_changes_configuration_without_platform_writes() {
    let mut test = activated().await;

    test.dhcp_bound(dhcp_lease("10.0.0.9", "10.0.0.1", "1.1.1.1", 100))
        .await;

    let config = test.device.ip_config(AddrFamily::V4).unwrap();
    assert_eq!(
        config.nameservers().copied().collect::<Vec<_>>(),
        vec![ip("1.1.1.1")]
    );
    assert!(test.operations().await.is_empty());
}
