// # netman-core
//
// Core library of the netman network management daemon.
//
// ## Architecture Overview
//
// - **Platform**: Trait for the kernel's address/route/link tables
// - **DedupIndex**: Reference-counted, identity-keyed entry container
// - **IpConfig**: Desired IP configuration of one interface and family
// - **CommitEngine**: Minimal ordered reconciliation of an IpConfig with the platform
// - **DefaultRouteRegistry**: Shared ranking of default routes across interfaces
// - **Device**: Per-interface activation state machine
// - **DeviceManager**: One task per device, event routing, timers and snapshots
//
// ## Design Principles
//
// 1. **Separation of Concerns**: Decisions live in the core, I/O behind traits
// 2. **Event-Driven**: Each device consumes one bounded event queue
// 3. **Minimal Change**: Commits touch only what differs from the live state
// 4. **Library-First**: The daemon is a thin layer over this crate
// 5. **Idempotency**: Committing an unchanged configuration is a no-op

pub mod traits;
pub mod dedup;
pub mod ip_config;
pub mod profile;
pub mod platform;
pub mod commit;
pub mod registry;
pub mod device;
pub mod engine;
pub mod config;
pub mod error;

// Re-export core types for convenience
pub use traits::{DefaultRoutePolicy, Link, Platform, PlatformEvent};
pub use dedup::{DedupEntry, DedupIndex};
pub use ip_config::{AddrFamily, ConfigSource, IpAddress, IpConfig, IpRoute, MergeFlags};
pub use profile::{DeviceKind, Profile, ProfileKind};
pub use platform::MemoryPlatform;
pub use commit::{CommitEngine, RouteSync};
pub use registry::DefaultRouteRegistry;
pub use device::{Device, DeviceEvent, DeviceNotification, DeviceRequest, DeviceState, StateReason};
pub use engine::DeviceManager;
pub use config::{EngineConfig, NetmanConfig, PlatformConfig};
pub use error::{Error, Result};
