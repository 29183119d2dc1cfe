use std::fmt;

use thiserror::Error;

use whetstone_gpu::{ErrorScopeKind, ProvisionError};

/// Error captured by one of the bracketing error scopes during a usage
/// window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedError {
    pub kind: ErrorScopeKind,
    pub message: String,
}

impl fmt::Display for CapturedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Error)]
pub enum AcquireError {
    /// The adapter cannot satisfy the descriptor. Permanent for this
    /// adapter, so callers should skip whatever work needed the device.
    #[error("descriptor unsupported by adapter: {}", missing.join(", "))]
    Unsupported { missing: Vec<String> },
    /// The pool failed to initialize earlier and will not retry.
    #[error("device pool previously failed: {original}; not retrying")]
    PoolFailed { original: String },
    #[error("device request failed: {0}")]
    Creation(#[from] ProvisionError),
    /// The descriptor's holder is still leased out.
    #[error("device for this descriptor is already leased")]
    HolderInUse,
    /// Every pooled slot is leased, so nothing can be evicted.
    #[error("all {capacity} pooled devices are leased")]
    Exhausted { capacity: usize },
    #[error("device pool invariant violated: {0}")]
    Internal(String),
}

impl AcquireError {
    /// True when the caller should skip rather than fail.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}

/// Errors that compromise the release protocol itself, as opposed to
/// outcomes that merely describe how the usage window went.
#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("usage scope teardown exceeded {limit_ms} ms")]
    ScopeTimeout { limit_ms: u64 },
    /// A fourth scope popped cleanly, so the usage window left scopes
    /// behind that the pool did not push.
    #[error("stray error scope left on device after usage window")]
    StrayErrorScope,
    /// The usage window popped scopes the pool pushed.
    #[error("error scope stack underflow during teardown")]
    ScopeUnderflow,
    #[error("lease does not match the holder's current lease")]
    StaleLease,
    #[error("no pooled device for key {0}")]
    HolderMissing(String),
    #[error("pool is not ready: {0}")]
    PoolUnavailable(String),
}
