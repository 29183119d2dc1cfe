//! Device-provisioning seam for the whetstone test harness.
//!
//! This crate is intentionally self-contained: it provides
//! - the capability model (tiers, known limits, known features) descriptors
//!   are normalized against
//! - the `DeviceProvider`/`PooledDevice` traits the pool consumes
//! - a one-shot device-loss channel
//! - a deterministic software provider for tests (`soft`)
//! - a `wgpu`-backed provider for real adapters (feature `wgpu-backend`)

#![deny(unsafe_code)]

mod caps;
mod lost;
mod provider;
pub mod soft;
#[cfg(feature = "wgpu-backend")]
pub mod webgpu;

pub use caps::{default_limit, limit_spec, CapabilityTier, LimitSpec, KNOWN_FEATURES, KNOWN_LIMITS};
pub use lost::{device_lost_channel, DeviceLoss, DeviceLostReceiver, DeviceLostSender, LossReason};
pub use provider::{
    AdapterProfile, DeviceProvider, DeviceRequest, EmptyScopeStack, ErrorScopeKind, LimitRequest,
    PooledDevice, ProvisionError, ProvisionedDevice,
};
