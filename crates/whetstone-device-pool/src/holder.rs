//! One pooled device and its usage-window protocol.
//!
//! Every lease brackets the caller's work in three error scopes, pushed
//! validation, internal, out-of-memory so the out-of-memory scope sits
//! innermost. Winding the window down drains queued work, pops the scopes
//! in reverse, and classifies what they caught together with any device
//! loss. The whole teardown races one timeout; a device that cannot wind
//! down in time is written off rather than waited on.

use std::time::Duration;

use tokio::time::timeout;

use whetstone_gpu::{
    DeviceLoss, DeviceLostReceiver, EmptyScopeStack, ErrorScopeKind, LossReason, PooledDevice,
};

use crate::descriptor::CanonicalKey;
use crate::error::CapturedError;

/// Whether a holder's device is currently leased out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HolderState {
    Free,
    Acquired { lease_id: u64 },
}

/// Faults that end a device's pool life.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScopeFault {
    /// The out-of-memory scope caught an error.
    OutOfMemory { message: String },
    /// The device was lost with no loss expectation in place.
    UnexpectedLoss(DeviceLoss),
    /// Loss was expected but did not arrive as promised.
    LossReasonMismatch {
        expected: LossReason,
        observed: Option<DeviceLoss>,
    },
    StrayErrorScope,
    ScopeUnderflow,
    Timeout { limit: Duration },
}

/// How one usage window ended.
#[derive(Debug)]
pub enum ScopeOutcome {
    /// Scopes empty, no loss. The device goes back on the shelf.
    Clean,
    /// The expected loss arrived with the promised reason.
    LossConfirmed(DeviceLoss),
    /// Validation or internal errors surfaced. A test failure, but the
    /// device itself stays usable.
    CapturedErrors(Vec<CapturedError>),
    Fatal(ScopeFault),
}

#[derive(Debug)]
pub struct DeviceHolder<D: PooledDevice> {
    device: D,
    lost: DeviceLostReceiver,
    state: HolderState,
    uses: u32,
    key: CanonicalKey,
}

impl<D: PooledDevice> DeviceHolder<D> {
    pub fn new(device: D, lost: DeviceLostReceiver, key: CanonicalKey) -> Self {
        Self {
            device,
            lost,
            state: HolderState::Free,
            uses: 0,
            key,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn state(&self) -> HolderState {
        self.state
    }

    pub fn is_free(&self) -> bool {
        self.state == HolderState::Free
    }

    /// Usage windows completed or started on this device.
    pub fn uses(&self) -> u32 {
        self.uses
    }

    pub fn key(&self) -> &CanonicalKey {
        &self.key
    }

    /// True once the device reported loss, even while sitting free.
    pub fn loss_observed(&mut self) -> bool {
        self.lost.observed().is_some()
    }

    pub fn destroy_device(&self) {
        self.device.destroy();
    }

    /// Marks the holder leased and opens the usage window.
    pub fn begin_usage_scope(&mut self, lease_id: u64) {
        debug_assert!(self.is_free());
        self.state = HolderState::Acquired { lease_id };
        self.uses += 1;
        self.device.push_error_scope(ErrorScopeKind::Validation);
        self.device.push_error_scope(ErrorScopeKind::Internal);
        self.device.push_error_scope(ErrorScopeKind::OutOfMemory);
    }

    /// Winds down the usage window and classifies its outcome.
    ///
    /// The holder is free again afterwards whatever the outcome; fatal
    /// outcomes mean the map should drop it entirely.
    pub async fn end_usage_scope(
        &mut self,
        expected_loss: Option<LossReason>,
        limit: Duration,
    ) -> ScopeOutcome {
        self.state = HolderState::Free;
        match timeout(limit, self.wind_down(expected_loss)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!(
                    key = %self.key,
                    limit_ms = limit.as_millis() as u64,
                    "usage window did not wind down in time",
                );
                ScopeOutcome::Fatal(ScopeFault::Timeout { limit })
            }
        }
    }

    async fn wind_down(&mut self, expected_loss: Option<LossReason>) -> ScopeOutcome {
        self.device.submitted_work_done().await;

        let oom = match self.device.pop_error_scope().await {
            Ok(captured) => captured,
            Err(EmptyScopeStack) => return ScopeOutcome::Fatal(ScopeFault::ScopeUnderflow),
        };
        let internal = match self.device.pop_error_scope().await {
            Ok(captured) => captured,
            Err(EmptyScopeStack) => return ScopeOutcome::Fatal(ScopeFault::ScopeUnderflow),
        };
        let validation = match self.device.pop_error_scope().await {
            Ok(captured) => captured,
            Err(EmptyScopeStack) => return ScopeOutcome::Fatal(ScopeFault::ScopeUnderflow),
        };

        if let Some(message) = oom {
            return ScopeOutcome::Fatal(ScopeFault::OutOfMemory { message });
        }

        let mut captured = Vec::new();
        if let Some(message) = internal {
            captured.push(CapturedError {
                kind: ErrorScopeKind::Internal,
                message,
            });
        }
        if let Some(message) = validation {
            captured.push(CapturedError {
                kind: ErrorScopeKind::Validation,
                message,
            });
        }

        let Some(expected) = expected_loss else {
            if let Some(loss) = self.lost.observed() {
                let loss = loss.clone();
                if !captured.is_empty() {
                    tracing::warn!(
                        key = %self.key,
                        discarded = captured.len(),
                        "device lost mid-window, discarding captured errors",
                    );
                }
                return ScopeOutcome::Fatal(ScopeFault::UnexpectedLoss(loss));
            }
            // A fourth pop succeeding means the window pushed scopes it
            // never popped.
            match self.device.pop_error_scope().await {
                Ok(_) => return ScopeOutcome::Fatal(ScopeFault::StrayErrorScope),
                Err(EmptyScopeStack) => {}
            }
            return if captured.is_empty() {
                ScopeOutcome::Clean
            } else {
                ScopeOutcome::CapturedErrors(captured)
            };
        };

        // Loss promised: hold the window open until it arrives. The outer
        // timeout bounds the wait.
        let observed = self.lost.wait().await.cloned();
        match observed {
            Some(loss) if loss.reason == expected => {
                if !captured.is_empty() {
                    tracing::warn!(
                        key = %self.key,
                        discarded = captured.len(),
                        "confirmed loss outranks captured errors",
                    );
                }
                ScopeOutcome::LossConfirmed(loss)
            }
            observed => ScopeOutcome::Fatal(ScopeFault::LossReasonMismatch { expected, observed }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use whetstone_gpu::soft::SoftGpuProvider;
    use whetstone_gpu::{DeviceProvider, DeviceRequest};

    const LIMIT: Duration = Duration::from_millis(5000);

    async fn fresh_holder(provider: &SoftGpuProvider) -> DeviceHolder<whetstone_gpu::soft::SoftDevice> {
        let request = DeviceRequest::baseline(Default::default());
        let provisioned = provider.request_device(&request).await.unwrap();
        DeviceHolder::new(provisioned.device, provisioned.lost, CanonicalKey::baseline())
    }

    #[tokio::test]
    async fn clean_window_probes_for_strays() {
        let provider = SoftGpuProvider::new();
        let mut holder = fresh_holder(&provider).await;
        holder.begin_usage_scope(1);
        assert_eq!(holder.state(), HolderState::Acquired { lease_id: 1 });
        assert_eq!(provider.device(0).unwrap().scope_depth(), 3);

        let outcome = holder.end_usage_scope(None, LIMIT).await;
        assert!(matches!(outcome, ScopeOutcome::Clean));
        assert!(holder.is_free());
        assert_eq!(holder.uses(), 1);
        // Three bracketing pops plus the stray probe.
        assert_eq!(provider.device(0).unwrap().pop_count(), 4);
        assert_eq!(provider.device(0).unwrap().work_done_calls(), 1);
    }

    #[tokio::test]
    async fn validation_error_is_captured_and_device_survives() {
        let provider = SoftGpuProvider::new();
        let mut holder = fresh_holder(&provider).await;
        holder.begin_usage_scope(1);
        provider
            .device(0)
            .unwrap()
            .inject_error(ErrorScopeKind::Validation, "bad bind group");

        let outcome = holder.end_usage_scope(None, LIMIT).await;
        match outcome {
            ScopeOutcome::CapturedErrors(errors) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].kind, ErrorScopeKind::Validation);
                assert_eq!(errors[0].message, "bad bind group");
            }
            other => panic!("expected captured errors, got {other:?}"),
        }

        // Still usable for another window.
        holder.begin_usage_scope(2);
        let outcome = holder.end_usage_scope(None, LIMIT).await;
        assert!(matches!(outcome, ScopeOutcome::Clean));
        assert_eq!(holder.uses(), 2);
    }

    #[tokio::test]
    async fn internal_and_validation_errors_report_together() {
        let provider = SoftGpuProvider::new();
        let mut holder = fresh_holder(&provider).await;
        holder.begin_usage_scope(1);
        provider
            .device(0)
            .unwrap()
            .inject_error(ErrorScopeKind::Internal, "shader translation failed");
        provider
            .device(0)
            .unwrap()
            .inject_error(ErrorScopeKind::Validation, "bad usage flags");

        match holder.end_usage_scope(None, LIMIT).await {
            ScopeOutcome::CapturedErrors(errors) => {
                assert_eq!(errors.len(), 2);
                assert_eq!(errors[0].kind, ErrorScopeKind::Internal);
                assert_eq!(errors[1].kind, ErrorScopeKind::Validation);
            }
            other => panic!("expected captured errors, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oom_is_fatal() {
        let provider = SoftGpuProvider::new();
        let mut holder = fresh_holder(&provider).await;
        holder.begin_usage_scope(1);
        provider
            .device(0)
            .unwrap()
            .inject_error(ErrorScopeKind::OutOfMemory, "allocation of 2 GiB failed");

        match holder.end_usage_scope(None, LIMIT).await {
            ScopeOutcome::Fatal(ScopeFault::OutOfMemory { message }) => {
                assert_eq!(message, "allocation of 2 GiB failed");
            }
            other => panic!("expected oom fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unexpected_loss_outranks_captured_errors() {
        let provider = SoftGpuProvider::new();
        let mut holder = fresh_holder(&provider).await;
        holder.begin_usage_scope(1);
        provider
            .device(0)
            .unwrap()
            .inject_error(ErrorScopeKind::Validation, "moot");
        provider
            .device(0)
            .unwrap()
            .trigger_loss(LossReason::Unknown, "gpu reset");

        match holder.end_usage_scope(None, LIMIT).await {
            ScopeOutcome::Fatal(ScopeFault::UnexpectedLoss(loss)) => {
                assert_eq!(loss.reason, LossReason::Unknown);
                assert_eq!(loss.message, "gpu reset");
            }
            other => panic!("expected unexpected-loss fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expected_loss_confirms_on_matching_reason() {
        let provider = SoftGpuProvider::new();
        let mut holder = fresh_holder(&provider).await;
        holder.begin_usage_scope(1);
        holder.device().destroy();

        match holder.end_usage_scope(Some(LossReason::Destroyed), LIMIT).await {
            ScopeOutcome::LossConfirmed(loss) => {
                assert_eq!(loss.reason, LossReason::Destroyed);
            }
            other => panic!("expected confirmed loss, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expected_loss_with_wrong_reason_is_fatal() {
        let provider = SoftGpuProvider::new();
        let mut holder = fresh_holder(&provider).await;
        holder.begin_usage_scope(1);
        provider
            .device(0)
            .unwrap()
            .trigger_loss(LossReason::Unknown, "driver fault");

        match holder.end_usage_scope(Some(LossReason::Destroyed), LIMIT).await {
            ScopeOutcome::Fatal(ScopeFault::LossReasonMismatch { expected, observed }) => {
                assert_eq!(expected, LossReason::Destroyed);
                assert_eq!(observed.unwrap().reason, LossReason::Unknown);
            }
            other => panic!("expected mismatch fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stray_scope_is_detected() {
        let provider = SoftGpuProvider::new();
        let mut holder = fresh_holder(&provider).await;
        holder.begin_usage_scope(1);
        // The window pushes a scope and forgets to pop it.
        holder.device().push_error_scope(ErrorScopeKind::Validation);

        match holder.end_usage_scope(None, LIMIT).await {
            ScopeOutcome::Fatal(ScopeFault::StrayErrorScope) => {}
            other => panic!("expected stray-scope fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn scope_underflow_is_detected() {
        let provider = SoftGpuProvider::new();
        let mut holder = fresh_holder(&provider).await;
        holder.begin_usage_scope(1);
        // The window pops a scope it never pushed.
        holder.device().pop_error_scope().await.unwrap();

        match holder.end_usage_scope(None, LIMIT).await {
            ScopeOutcome::Fatal(ScopeFault::ScopeUnderflow) => {}
            other => panic!("expected underflow fault, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_teardown_times_out() {
        let provider = SoftGpuProvider::new();
        let mut holder = fresh_holder(&provider).await;
        holder.begin_usage_scope(1);
        provider.device(0).unwrap().stall_submitted_work();

        match holder.end_usage_scope(None, LIMIT).await {
            ScopeOutcome::Fatal(ScopeFault::Timeout { limit }) => assert_eq!(limit, LIMIT),
            other => panic!("expected timeout fault, got {other:?}"),
        }
        assert!(holder.is_free());
    }

    #[tokio::test(start_paused = true)]
    async fn promised_loss_that_never_arrives_times_out() {
        let provider = SoftGpuProvider::new();
        let mut holder = fresh_holder(&provider).await;
        holder.begin_usage_scope(1);

        match holder.end_usage_scope(Some(LossReason::Destroyed), LIMIT).await {
            ScopeOutcome::Fatal(ScopeFault::Timeout { .. }) => {}
            other => panic!("expected timeout fault, got {other:?}"),
        }
    }
}
