//! Activation states, transitions and reason codes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Activation state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceState {
    /// The link does not exist
    Unmanaged,
    /// The link exists but has no carrier
    Unavailable,
    /// Ready for activation
    Disconnected,
    Prepare,
    Config,
    NeedAuth,
    IpConfig,
    IpCheck,
    Secondaries,
    Activated,
    Deactivating,
    /// Last activation failed; resting state
    Failed,
}

impl DeviceState {
    /// Stable name used in logs and notifications
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Unmanaged => "unmanaged",
            DeviceState::Unavailable => "unavailable",
            DeviceState::Disconnected => "disconnected",
            DeviceState::Prepare => "prepare",
            DeviceState::Config => "config",
            DeviceState::NeedAuth => "need-auth",
            DeviceState::IpConfig => "ip-config",
            DeviceState::IpCheck => "ip-check",
            DeviceState::Secondaries => "secondaries",
            DeviceState::Activated => "activated",
            DeviceState::Deactivating => "deactivating",
            DeviceState::Failed => "failed",
        }
    }

    /// An activation is in flight or complete
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DeviceState::Prepare
                | DeviceState::Config
                | DeviceState::NeedAuth
                | DeviceState::IpConfig
                | DeviceState::IpCheck
                | DeviceState::Secondaries
                | DeviceState::Activated
        )
    }

    /// Addresses have been committed for the current activation
    pub fn is_configured(&self) -> bool {
        matches!(
            self,
            DeviceState::IpCheck | DeviceState::Secondaries | DeviceState::Activated
        )
    }

    /// Whether `self -> to` is a legal transition
    pub fn can_transition(&self, to: DeviceState) -> bool {
        use DeviceState::*;

        match (*self, to) {
            (Unmanaged, Unavailable) => true,
            (Unavailable, Disconnected | Unmanaged) => true,
            (Disconnected, Prepare | Unavailable | Unmanaged) => true,
            (Failed, Disconnected | Unavailable | Unmanaged | Deactivating) => true,
            (Prepare, Config) => true,
            (Config, NeedAuth | IpConfig) => true,
            (NeedAuth, IpConfig) => true,
            (IpConfig, IpCheck) => true,
            (IpCheck, Secondaries) => true,
            (Secondaries, Activated) => true,
            (from, Deactivating | Failed) if from.is_active() => true,
            (Deactivating, Disconnected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a device changed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateReason {
    None,
    NowManaged,
    CarrierChanged,
    UserRequested,
    NewActivation,
    LinkRemoved,
    AuthFailed,
    IpConfigUnavailable,
    IpConfigExpired,
    SecondaryConnectionFailed,
    PlatformError,
    ConfigFailed,
    InternalError,
}

impl StateReason {
    /// Stable machine-readable code
    pub fn as_str(&self) -> &'static str {
        match self {
            StateReason::None => "none",
            StateReason::NowManaged => "now-managed",
            StateReason::CarrierChanged => "carrier-changed",
            StateReason::UserRequested => "user-requested",
            StateReason::NewActivation => "new-activation",
            StateReason::LinkRemoved => "link-removed",
            StateReason::AuthFailed => "auth-failed",
            StateReason::IpConfigUnavailable => "ip-config-unavailable",
            StateReason::IpConfigExpired => "ip-config-expired",
            StateReason::SecondaryConnectionFailed => "secondary-connection-failed",
            StateReason::PlatformError => "platform-error",
            StateReason::ConfigFailed => "config-failed",
            StateReason::InternalError => "internal-error",
        }
    }
}

impl fmt::Display for StateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
