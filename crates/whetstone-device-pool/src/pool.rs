//! The device pool.
//!
//! A pool is created cold and initializes itself on first acquire by
//! provisioning a baseline device, proving the adapter can produce devices
//! at all. If that fails the pool latches into a failed state and every
//! later acquire reports the original failure instead of retrying.

use std::sync::Arc;

use whetstone_gpu::{DeviceLoss, DeviceProvider, LossReason, PooledDevice};

use crate::config::PoolOptions;
use crate::descriptor::{
    canonicalize, CanonicalKey, DescriptorModifier, DeviceDescriptor, IdentityModifier,
};
use crate::error::{AcquireError, CapturedError, ReleaseError};
use crate::holder::{HolderState, ScopeFault, ScopeOutcome};
use crate::map::HolderMap;
use crate::stats::{PoolStats, PoolStatsSnapshot};

enum PoolState<D: PooledDevice> {
    Uninitialized,
    Ready(HolderMap<D>),
    Failed { original: String },
}

/// Where the pool is in its life cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolStatus {
    Uninitialized,
    Ready,
    Failed,
}

/// Proof of an outstanding usage window on one pooled device.
///
/// A lease must come back through [`DevicePool::release`]; a dropped lease
/// leaves its holder marked in use.
#[derive(Debug)]
pub struct DeviceLease<D: PooledDevice> {
    device: D,
    key: CanonicalKey,
    lease_id: u64,
    expected_loss: Option<LossReason>,
}

impl<D: PooledDevice> DeviceLease<D> {
    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn key(&self) -> &CanonicalKey {
        &self.key
    }

    /// Promises that this device will be lost with the given reason before
    /// the window closes. Release then treats that loss as the expected
    /// outcome and anything else as fatal.
    pub fn expect_device_lost(&mut self, reason: LossReason) {
        self.expected_loss = Some(reason);
    }
}

/// What a finished usage window means for the caller.
#[derive(Debug)]
pub enum ReleaseReport {
    /// No errors, no loss. `device_retired` reports wear replacement.
    Clean { device_retired: bool },
    /// The bracketing scopes caught validation or internal errors. The
    /// device itself stays pooled.
    TestFailed { errors: Vec<CapturedError> },
    /// The promised loss arrived with the promised reason.
    DeviceLost { loss: DeviceLoss },
    /// The device was compromised and has been destroyed.
    Fatal { fault: ScopeFault },
}

impl ReleaseReport {
    /// True when the window met its expectations.
    pub fn test_passed(&self) -> bool {
        matches!(self, Self::Clean { .. } | Self::DeviceLost { .. })
    }
}

pub struct DevicePool<P: DeviceProvider> {
    provider: P,
    state: PoolState<P::Device>,
    options: PoolOptions,
    modifier: Box<dyn DescriptorModifier>,
    stats: Arc<PoolStats>,
    next_lease: u64,
}

impl<P: DeviceProvider> DevicePool<P> {
    pub fn new(provider: P) -> Self {
        Self::with_options(provider, PoolOptions::default())
    }

    pub fn with_options(provider: P, options: PoolOptions) -> Self {
        Self {
            provider,
            state: PoolState::Uninitialized,
            options,
            modifier: Box::new(IdentityModifier),
            stats: Arc::new(PoolStats::default()),
            next_lease: 1,
        }
    }

    /// Installs a descriptor modifier. Applies to every request from then
    /// on, the baseline included.
    pub fn with_modifier(mut self, modifier: impl DescriptorModifier + 'static) -> Self {
        self.modifier = Box::new(modifier);
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn status(&self) -> PoolStatus {
        match &self.state {
            PoolState::Uninitialized => PoolStatus::Uninitialized,
            PoolState::Ready(_) => PoolStatus::Ready,
            PoolState::Failed { .. } => PoolStatus::Failed,
        }
    }

    /// The message the pool failed with, if it failed.
    pub fn failure(&self) -> Option<&str> {
        match &self.state {
            PoolState::Failed { original } => Some(original),
            _ => None,
        }
    }

    /// Devices currently pooled, leased ones included.
    pub fn pooled_devices(&self) -> usize {
        match &self.state {
            PoolState::Ready(map) => map.len(),
            _ => 0,
        }
    }

    /// Leases the device for `descriptor`, provisioning one on first use.
    ///
    /// `None` asks for the baseline device. The returned lease opens a
    /// usage window bracketed by error scopes; it must come back through
    /// [`release`](Self::release).
    pub async fn acquire(
        &mut self,
        descriptor: Option<&DeviceDescriptor>,
    ) -> Result<DeviceLease<P::Device>, AcquireError> {
        self.ensure_ready().await?;
        let map = match &mut self.state {
            PoolState::Ready(map) => map,
            _ => return Err(AcquireError::Internal("pool state changed mid-acquire".into())),
        };

        let canonical = canonicalize(descriptor, self.options.tier);
        let holder = map
            .get_or_create(&self.provider, &canonical, self.modifier.as_ref())
            .await?;
        if !holder.is_free() {
            return Err(AcquireError::HolderInUse);
        }

        let lease_id = self.next_lease;
        self.next_lease += 1;
        holder.begin_usage_scope(lease_id);
        self.stats.inc_acquires();
        tracing::debug!(
            key = %holder.key(),
            lease = lease_id,
            uses = holder.uses(),
            "leased pooled device",
        );
        Ok(DeviceLease {
            device: holder.device().clone(),
            key: holder.key().clone(),
            lease_id,
            expected_loss: None,
        })
    }

    /// Closes the lease's usage window and classifies how it went.
    ///
    /// `Ok` reports describe the window, failures included; `Err` means the
    /// release protocol itself was compromised. Either way the holder is
    /// settled: reusable devices go back on the shelf, compromised ones are
    /// destroyed.
    pub async fn release(
        &mut self,
        lease: DeviceLease<P::Device>,
    ) -> Result<ReleaseReport, ReleaseError> {
        let DeviceLease {
            key,
            lease_id,
            expected_loss,
            ..
        } = lease;

        let map = match &mut self.state {
            PoolState::Ready(map) => map,
            PoolState::Uninitialized => {
                return Err(ReleaseError::PoolUnavailable("pool is uninitialized".into()))
            }
            PoolState::Failed { original } => {
                return Err(ReleaseError::PoolUnavailable(original.clone()))
            }
        };
        let holder = map
            .get_mut(&key)
            .ok_or_else(|| ReleaseError::HolderMissing(key.to_string()))?;
        match holder.state() {
            HolderState::Acquired { lease_id: current } if current == lease_id => {}
            _ => return Err(ReleaseError::StaleLease),
        }

        self.stats.inc_releases();
        let outcome = holder
            .end_usage_scope(expected_loss, self.options.scope_timeout)
            .await;
        let uses = holder.uses();
        let worn = uses >= self.options.replace_after_uses;

        match outcome {
            ScopeOutcome::Clean => {
                if worn {
                    map.remove_and_destroy(&key);
                    self.stats.inc_evictions_worn();
                    tracing::debug!(key = %key, uses, "retired worn pooled device");
                }
                Ok(ReleaseReport::Clean { device_retired: worn })
            }
            ScopeOutcome::CapturedErrors(errors) => {
                if worn {
                    map.remove_and_destroy(&key);
                    self.stats.inc_evictions_worn();
                    tracing::debug!(key = %key, uses, "retired worn pooled device");
                }
                Ok(ReleaseReport::TestFailed { errors })
            }
            ScopeOutcome::LossConfirmed(loss) => {
                map.remove_and_destroy(&key);
                Ok(ReleaseReport::DeviceLost { loss })
            }
            ScopeOutcome::Fatal(fault) => {
                map.remove_and_destroy(&key);
                self.stats.inc_evictions_fatal();
                match fault {
                    ScopeFault::OutOfMemory { .. } => {
                        tracing::warn!(key = %key, "device ran out of memory, reclaiming");
                        self.provider.reclaim().await;
                        self.stats.inc_reclaim_passes();
                        Ok(ReleaseReport::Fatal { fault })
                    }
                    ScopeFault::UnexpectedLoss(_) | ScopeFault::LossReasonMismatch { .. } => {
                        tracing::warn!(key = %key, "device lost off-script, destroyed");
                        Ok(ReleaseReport::Fatal { fault })
                    }
                    ScopeFault::Timeout { limit } => Err(ReleaseError::ScopeTimeout {
                        limit_ms: limit.as_millis() as u64,
                    }),
                    ScopeFault::StrayErrorScope => Err(ReleaseError::StrayErrorScope),
                    ScopeFault::ScopeUnderflow => Err(ReleaseError::ScopeUnderflow),
                }
            }
        }
    }

    /// Destroys every pooled device and retires the pool for good.
    pub fn destroy(&mut self) {
        if let PoolState::Ready(map) = &mut self.state {
            map.clear_all();
        }
        self.state = PoolState::Failed {
            original: "pool destroyed".into(),
        };
        tracing::debug!("device pool destroyed");
    }

    async fn ensure_ready(&mut self) -> Result<(), AcquireError> {
        match &self.state {
            PoolState::Ready(_) => return Ok(()),
            PoolState::Failed { original } => {
                return Err(AcquireError::PoolFailed {
                    original: original.clone(),
                });
            }
            PoolState::Uninitialized => {}
        }

        // Baseline smoke test: one default device proves the adapter works.
        let mut map = HolderMap::new(self.options.capacity, Arc::clone(&self.stats));
        let canonical = canonicalize(None, self.options.tier);
        match map
            .get_or_create(&self.provider, &canonical, self.modifier.as_ref())
            .await
        {
            Ok(_) => {
                tracing::debug!(capacity = self.options.capacity, "device pool ready");
                self.state = PoolState::Ready(map);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "device pool failed to initialize");
                self.state = PoolState::Failed {
                    original: err.to_string(),
                };
                Err(err)
            }
        }
    }
}
