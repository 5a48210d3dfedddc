// # Platform Implementations
//
// This module provides implementations of the Platform trait.

pub mod memory;

pub use memory::{InjectedFailure, MemoryPlatform, PlatformOp, PlatformOpKind};
