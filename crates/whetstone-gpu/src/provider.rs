//! Provisioning traits the pool consumes, plus the request/profile types
//! exchanged across that seam.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::caps::CapabilityTier;
use crate::lost::DeviceLostReceiver;

/// Error classes an error scope can filter on, in the order the usage-scope
/// protocol pushes them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorScopeKind {
    Validation,
    Internal,
    OutOfMemory,
}

impl ErrorScopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorScopeKind::Validation => "validation",
            ErrorScopeKind::Internal => "internal",
            ErrorScopeKind::OutOfMemory => "out-of-memory",
        }
    }
}

impl fmt::Display for ErrorScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One limit override carried by a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LimitRequest {
    pub name: String,
    pub value: u64,
}

impl LimitRequest {
    pub fn new(name: impl Into<String>, value: u64) -> Self {
        Self { name: name.into(), value }
    }
}

/// Fully resolved device request: the normalized form a descriptor reduces
/// to. Features are sorted and deduplicated; limits carry only values that
/// differ from the tier defaults, in recognized-table order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceRequest {
    pub tier: CapabilityTier,
    pub features: Vec<String>,
    pub limits: Vec<LimitRequest>,
}

impl DeviceRequest {
    /// Request for a plain device at `tier` with no features or overrides.
    pub fn baseline(tier: CapabilityTier) -> Self {
        Self { tier, features: Vec::new(), limits: Vec::new() }
    }
}

/// Capability snapshot of the adapter backing a provider.
#[derive(Clone, Debug, Default)]
pub struct AdapterProfile {
    pub name: String,
    pub features: BTreeSet<String>,
    /// Maximum supported value per recognized limit.
    pub limits: BTreeMap<String, u64>,
}

impl AdapterProfile {
    pub fn supports_feature(&self, name: &str) -> bool {
        self.features.contains(name)
    }

    /// Requested features the adapter does not support, in request order.
    pub fn missing_features<'a, I>(&self, requested: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        requested
            .into_iter()
            .filter(|name| !self.supports_feature(name))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The adapter cannot satisfy the requested feature set. The pool treats
    /// this as permanently unsupported for the descriptor's key.
    #[error("adapter does not support required features: {}", missing.join(", "))]
    UnsupportedFeatures { missing: Vec<String> },
    #[error("no suitable adapter available: {0}")]
    NoAdapter(String),
    #[error("requested limit {name}={requested} exceeds adapter maximum {maximum}")]
    LimitExceeded { name: String, requested: u64, maximum: u64 },
    #[error("device request failed: {0}")]
    RequestFailed(String),
}

impl ProvisionError {
    /// True for failures that mean "this descriptor will never work here",
    /// as opposed to the request itself going wrong.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, ProvisionError::UnsupportedFeatures { .. })
    }
}

/// Marker error for popping an empty error-scope stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("error scope stack is empty")]
pub struct EmptyScopeStack;

/// A freshly provisioned device plus the channel its loss will be reported
/// on.
#[derive(Debug)]
pub struct ProvisionedDevice<D> {
    pub device: D,
    pub lost: DeviceLostReceiver,
}

/// A live device handle as the pool sees it. Handles are cheap clones of a
/// shared underlying device, matching `wgpu::Device` semantics.
#[async_trait]
pub trait PooledDevice: Clone + Send + Sync + 'static {
    /// Opens a scope capturing the next error of the given class.
    fn push_error_scope(&self, filter: ErrorScopeKind);

    /// Pops the innermost scope, resolving with the message of the error it
    /// captured, if any. Fails when no scope is open.
    async fn pop_error_scope(&self) -> Result<Option<String>, EmptyScopeStack>;

    /// Resolves once all work submitted so far has completed, including any
    /// asynchronously reported errors.
    async fn submitted_work_done(&self);

    /// Destroys the underlying handle. Idempotent; the loss is reported
    /// through the device's loss channel with the `Destroyed` reason.
    fn destroy(&self);
}

#[async_trait]
pub trait DeviceProvider: Send + Sync + 'static {
    type Device: PooledDevice;

    /// Capability snapshot of the backing adapter.
    async fn adapter_profile(&self) -> Result<AdapterProfile, ProvisionError>;

    /// Provisions a device satisfying `request`.
    async fn request_device(
        &self,
        request: &DeviceRequest,
    ) -> Result<ProvisionedDevice<Self::Device>, ProvisionError>;

    /// Best-effort pass releasing resources held outside the pool's own
    /// handles. Invoked after an out-of-memory failure.
    async fn reclaim(&self) {}
}
