//! Deterministic in-memory provider used by unit and scenario tests.
//!
//! `SoftDevice` mirrors the semantics the pool relies on from a real GPU
//! stack: nested error scopes with filter matching, errors delivered at the
//! work-done boundary, one-shot loss notification, idempotent destroy. The
//! provider keeps an audit trail (requests, devices, reclaim passes) and
//! exposes fault injection for conditions a real stack only produces under
//! driver trouble.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::caps::KNOWN_LIMITS;
use crate::lost::{device_lost_channel, DeviceLoss, DeviceLostSender, LossReason};
use crate::provider::{
    AdapterProfile, DeviceProvider, DeviceRequest, EmptyScopeStack, ErrorScopeKind, PooledDevice,
    ProvisionError, ProvisionedDevice,
};

const SOFT_ADAPTER_NAME: &str = "whetstone soft adapter";

/// Adapter maxima are seeded at this multiple of the core defaults so that
/// moderate overrides provision cleanly.
const ADAPTER_LIMIT_HEADROOM: u64 = 4;

#[derive(Default)]
struct ProviderState {
    features: Mutex<BTreeSet<String>>,
    limits: Mutex<BTreeMap<String, u64>>,
    fail_requests: Mutex<Option<String>>,
    devices: Mutex<Vec<SoftDevice>>,
    requests: Mutex<Vec<DeviceRequest>>,
    profile_calls: AtomicU64,
    reclaim_passes: AtomicU64,
}

/// Software provider. Clones share state, so a test can keep one handle for
/// fault injection while the pool owns another.
#[derive(Clone)]
pub struct SoftGpuProvider {
    state: Arc<ProviderState>,
}

impl Default for SoftGpuProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftGpuProvider {
    pub fn new() -> Self {
        let state = ProviderState::default();
        {
            let mut limits = state.limits.lock().unwrap();
            for spec in KNOWN_LIMITS {
                limits.insert(
                    spec.name.to_string(),
                    spec.core_default.saturating_mul(ADAPTER_LIMIT_HEADROOM),
                );
            }
        }
        Self { state: Arc::new(state) }
    }

    /// Provider whose adapter advertises the given features.
    pub fn with_features<I, S>(features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let provider = Self::new();
        for feature in features {
            provider.add_feature(feature);
        }
        provider
    }

    pub fn add_feature(&self, name: impl Into<String>) {
        self.state.features.lock().unwrap().insert(name.into());
    }

    pub fn set_adapter_limit(&self, name: impl Into<String>, value: u64) {
        self.state.limits.lock().unwrap().insert(name.into(), value);
    }

    /// Makes every subsequent `request_device` fail with the given message.
    pub fn fail_requests(&self, message: impl Into<String>) {
        *self.state.fail_requests.lock().unwrap() = Some(message.into());
    }

    pub fn clear_request_failure(&self) {
        *self.state.fail_requests.lock().unwrap() = None;
    }

    /// Devices provisioned so far, in creation order.
    pub fn devices(&self) -> Vec<SoftDevice> {
        self.state.devices.lock().unwrap().clone()
    }

    pub fn device(&self, index: usize) -> Option<SoftDevice> {
        self.state.devices.lock().unwrap().get(index).cloned()
    }

    pub fn request_count(&self) -> usize {
        self.state.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<DeviceRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    /// How often the adapter profile has been read.
    pub fn profile_calls(&self) -> u64 {
        self.state.profile_calls.load(Ordering::Relaxed)
    }

    pub fn reclaim_passes(&self) -> u64 {
        self.state.reclaim_passes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DeviceProvider for SoftGpuProvider {
    type Device = SoftDevice;

    async fn adapter_profile(&self) -> Result<AdapterProfile, ProvisionError> {
        self.state.profile_calls.fetch_add(1, Ordering::Relaxed);
        Ok(AdapterProfile {
            name: SOFT_ADAPTER_NAME.to_string(),
            features: self.state.features.lock().unwrap().clone(),
            limits: self.state.limits.lock().unwrap().clone(),
        })
    }

    async fn request_device(
        &self,
        request: &DeviceRequest,
    ) -> Result<ProvisionedDevice<SoftDevice>, ProvisionError> {
        let index = {
            let mut requests = self.state.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len() - 1
        };

        if let Some(message) = self.state.fail_requests.lock().unwrap().clone() {
            return Err(ProvisionError::RequestFailed(message));
        }

        let missing: Vec<String> = {
            let features = self.state.features.lock().unwrap();
            request
                .features
                .iter()
                .filter(|name| !features.contains(name.as_str()))
                .cloned()
                .collect()
        };
        if !missing.is_empty() {
            return Err(ProvisionError::UnsupportedFeatures { missing });
        }

        {
            let limits = self.state.limits.lock().unwrap();
            for limit in &request.limits {
                let maximum = limits.get(&limit.name).copied().unwrap_or(0);
                if limit.value > maximum {
                    return Err(ProvisionError::LimitExceeded {
                        name: limit.name.clone(),
                        requested: limit.value,
                        maximum,
                    });
                }
            }
        }

        let (lost_tx, lost) = device_lost_channel();
        let device = SoftDevice::new(index, lost_tx);
        self.state.devices.lock().unwrap().push(device.clone());
        Ok(ProvisionedDevice { device, lost })
    }

    async fn reclaim(&self) {
        self.state.reclaim_passes.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct ScopeFrame {
    filter: ErrorScopeKind,
    captured: Option<String>,
}

#[derive(Debug)]
struct DeviceState {
    label: String,
    scopes: Mutex<Vec<ScopeFrame>>,
    /// Errors that only materialize once outstanding work completes.
    deferred: Mutex<Vec<(ErrorScopeKind, String)>>,
    uncaptured: Mutex<Vec<(ErrorScopeKind, String)>>,
    lost_tx: Mutex<Option<DeviceLostSender>>,
    destroyed: AtomicBool,
    stall_work_done: AtomicBool,
    pushes: AtomicU64,
    pops: AtomicU64,
    work_done_calls: AtomicU64,
}

/// One provisioned software device. Clones share the underlying state, like
/// real device handles.
#[derive(Clone, Debug)]
pub struct SoftDevice {
    state: Arc<DeviceState>,
}

impl SoftDevice {
    fn new(index: usize, lost_tx: DeviceLostSender) -> Self {
        Self {
            state: Arc::new(DeviceState {
                label: format!("soft device #{index}"),
                scopes: Mutex::new(Vec::new()),
                deferred: Mutex::new(Vec::new()),
                uncaptured: Mutex::new(Vec::new()),
                lost_tx: Mutex::new(Some(lost_tx)),
                destroyed: AtomicBool::new(false),
                stall_work_done: AtomicBool::new(false),
                pushes: AtomicU64::new(0),
                pops: AtomicU64::new(0),
                work_done_calls: AtomicU64::new(0),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.state.label
    }

    /// Raises an error immediately, as a synchronous operation would.
    pub fn inject_error(&self, kind: ErrorScopeKind, message: impl Into<String>) {
        self.deliver(kind, message.into());
    }

    /// Raises an error at the next work-done boundary, as asynchronously
    /// validated work would.
    pub fn inject_async_error(&self, kind: ErrorScopeKind, message: impl Into<String>) {
        self.state.deferred.lock().unwrap().push((kind, message.into()));
    }

    /// Reports a loss without destroying the handle (driver fault).
    pub fn trigger_loss(&self, reason: LossReason, message: impl Into<String>) {
        if let Some(tx) = self.state.lost_tx.lock().unwrap().take() {
            tx.send(DeviceLoss::new(reason, message));
        }
    }

    /// Makes `submitted_work_done` hang forever.
    pub fn stall_submitted_work(&self) {
        self.state.stall_work_done.store(true, Ordering::Relaxed);
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.destroyed.load(Ordering::Relaxed)
    }

    pub fn scope_depth(&self) -> usize {
        self.state.scopes.lock().unwrap().len()
    }

    /// Errors no scope filtered, oldest first.
    pub fn uncaptured_errors(&self) -> Vec<(ErrorScopeKind, String)> {
        self.state.uncaptured.lock().unwrap().clone()
    }

    pub fn push_count(&self) -> u64 {
        self.state.pushes.load(Ordering::Relaxed)
    }

    pub fn pop_count(&self) -> u64 {
        self.state.pops.load(Ordering::Relaxed)
    }

    pub fn work_done_calls(&self) -> u64 {
        self.state.work_done_calls.load(Ordering::Relaxed)
    }

    /// Routes an error to the innermost scope with a matching filter. A scope
    /// keeps only the first error it captures; later matches are swallowed.
    fn deliver(&self, kind: ErrorScopeKind, message: String) {
        if self.is_destroyed() {
            return;
        }
        let mut scopes = self.state.scopes.lock().unwrap();
        match scopes.iter_mut().rev().find(|frame| frame.filter == kind) {
            Some(frame) => {
                if frame.captured.is_none() {
                    frame.captured = Some(message);
                }
            }
            None => {
                drop(scopes);
                self.state.uncaptured.lock().unwrap().push((kind, message));
            }
        }
    }
}

#[async_trait]
impl PooledDevice for SoftDevice {
    fn push_error_scope(&self, filter: ErrorScopeKind) {
        self.state.pushes.fetch_add(1, Ordering::Relaxed);
        self.state.scopes.lock().unwrap().push(ScopeFrame { filter, captured: None });
    }

    async fn pop_error_scope(&self) -> Result<Option<String>, EmptyScopeStack> {
        self.state.pops.fetch_add(1, Ordering::Relaxed);
        let frame = self.state.scopes.lock().unwrap().pop().ok_or(EmptyScopeStack)?;
        if self.is_destroyed() {
            // A lost device resolves its scopes empty.
            return Ok(None);
        }
        Ok(frame.captured)
    }

    async fn submitted_work_done(&self) {
        self.state.work_done_calls.fetch_add(1, Ordering::Relaxed);
        if self.state.stall_work_done.load(Ordering::Relaxed) {
            std::future::pending::<()>().await;
        }
        let deferred: Vec<(ErrorScopeKind, String)> =
            self.state.deferred.lock().unwrap().drain(..).collect();
        for (kind, message) in deferred {
            self.deliver(kind, message);
        }
    }

    fn destroy(&self) {
        if !self.state.destroyed.swap(true, Ordering::Relaxed) {
            if let Some(tx) = self.state.lost_tx.lock().unwrap().take() {
                tx.send(DeviceLoss::new(LossReason::Destroyed, "device destroyed"));
            }
        }
    }
}
