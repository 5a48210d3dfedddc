//! Core traits for the network manager
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`Platform`]: Kernel link, address and route tables
//! - [`DefaultRoutePolicy`]: Ranking of competing default routes

pub mod platform;
pub mod route_policy;

pub use platform::{Link, Platform, PlatformEvent};
pub use route_policy::{DefaultRouteCandidate, DefaultRoutePolicy, LowestMetricPolicy};
