//! Pooled GPU devices for conformance-style test harnesses.
//!
//! - [`descriptor`] canonicalizes WebGPU-shaped device descriptors into
//!   stable cache keys.
//! - [`holder`] brackets each usage window in error scopes and classifies
//!   what they caught.
//! - [`map`] keeps holders in a bounded LRU and remembers descriptors the
//!   adapter cannot satisfy.
//! - [`pool`] ties it together: lease, release, retire.
//!
//! The pool is runtime-backed: usage-window teardown races a tokio timer,
//! so acquire and release must run inside a tokio runtime.

#![deny(unsafe_code)]

pub mod config;
pub mod descriptor;
pub mod error;
pub mod holder;
pub mod map;
pub mod pool;
pub mod stats;

#[cfg(test)]
mod proptests;

pub use config::{
    PoolOptions, DEFAULT_CAPACITY, DEFAULT_REPLACE_AFTER_USES, DEFAULT_SCOPE_TIMEOUT,
};
pub use descriptor::{
    canonicalize, CanonicalDescriptor, CanonicalKey, DescriptorModifier, DeviceDescriptor,
    IdentityModifier,
};
pub use error::{AcquireError, CapturedError, ReleaseError};
pub use holder::{DeviceHolder, HolderState, ScopeFault, ScopeOutcome};
pub use map::HolderMap;
pub use pool::{DeviceLease, DevicePool, PoolStatus, ReleaseReport};
pub use stats::{PoolStats, PoolStatsSnapshot};
