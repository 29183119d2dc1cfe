//! `wgpu`-backed provider for real adapters.
//!
//! Feature names and limit names are translated through the fixed tables in
//! `caps`; requested limits start from the tier's base limits
//! (`wgpu::Limits::default()` or `downlevel_defaults()`) with overrides
//! applied on top, so a pooled device always carries a fully populated limit
//! set.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::caps::{CapabilityTier, KNOWN_FEATURES, KNOWN_LIMITS};
use crate::lost::{device_lost_channel, DeviceLoss, LossReason};
use crate::provider::{
    AdapterProfile, DeviceProvider, DeviceRequest, EmptyScopeStack, ErrorScopeKind, PooledDevice,
    ProvisionError, ProvisionedDevice,
};

#[derive(Clone, Debug)]
pub struct WgpuProviderOptions {
    pub backends: wgpu::Backends,
    pub power_preference: wgpu::PowerPreference,
    pub force_fallback_adapter: bool,
}

impl Default for WgpuProviderOptions {
    fn default() -> Self {
        Self {
            backends: wgpu::Backends::PRIMARY,
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
        }
    }
}

/// Provider bound to one `wgpu::Adapter`.
pub struct WgpuProvider {
    adapter: wgpu::Adapter,
    devices: Mutex<Vec<WgpuDevice>>,
}

impl WgpuProvider {
    /// Acquires an adapter per `options`.
    pub async fn new(options: WgpuProviderOptions) -> Result<Self, ProvisionError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: options.backends,
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: options.power_preference,
                compatible_surface: None,
                force_fallback_adapter: options.force_fallback_adapter,
            })
            .await
            .ok_or_else(|| ProvisionError::NoAdapter("no suitable wgpu adapter found".into()))?;
        Ok(Self::with_adapter(adapter))
    }

    /// Wraps an adapter the caller already acquired.
    pub fn with_adapter(adapter: wgpu::Adapter) -> Self {
        Self { adapter, devices: Mutex::new(Vec::new()) }
    }

    pub fn adapter_info(&self) -> wgpu::AdapterInfo {
        self.adapter.get_info()
    }
}

#[async_trait]
impl DeviceProvider for WgpuProvider {
    type Device = WgpuDevice;

    async fn adapter_profile(&self) -> Result<AdapterProfile, ProvisionError> {
        let supported = self.adapter.features();
        let mut features = BTreeSet::new();
        for name in KNOWN_FEATURES {
            if let Some(bits) = feature_bits(name) {
                if supported.contains(bits) {
                    features.insert((*name).to_string());
                }
            }
        }
        let adapter_limits = self.adapter.limits();
        let mut limits = BTreeMap::new();
        for spec in KNOWN_LIMITS {
            if let Some(value) = limit_value(&adapter_limits, spec.name) {
                limits.insert(spec.name.to_string(), value);
            }
        }
        Ok(AdapterProfile { name: self.adapter.get_info().name, features, limits })
    }

    async fn request_device(
        &self,
        request: &DeviceRequest,
    ) -> Result<ProvisionedDevice<WgpuDevice>, ProvisionError> {
        let mut required_features = wgpu::Features::empty();
        let mut missing = Vec::new();
        for name in &request.features {
            match feature_bits(name) {
                Some(bits) if self.adapter.features().contains(bits) => {
                    required_features |= bits;
                }
                _ => missing.push(name.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(ProvisionError::UnsupportedFeatures { missing });
        }

        let mut required_limits = base_limits(request.tier);
        for limit in &request.limits {
            if !apply_limit(&mut required_limits, &limit.name, limit.value) {
                tracing::debug!(name = %limit.name, "ignoring unrecognized limit override");
            }
        }

        let (device, queue) = self
            .adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("whetstone pooled device"),
                    required_features,
                    required_limits,
                },
                None,
            )
            .await
            .map_err(|err| ProvisionError::RequestFailed(err.to_string()))?;

        let (lost_tx, lost) = device_lost_channel();
        // The callback is `Fn`, but the sender is consumed on send; park it in
        // a Mutex<Option<_>> so the first invocation can take it.
        let lost_tx = Mutex::new(Some(lost_tx));
        device.set_device_lost_callback(move |reason, message| {
            let reason = match reason {
                wgpu::DeviceLostReason::Destroyed => LossReason::Destroyed,
                _ => LossReason::Unknown,
            };
            if let Some(lost_tx) = lost_tx.lock().unwrap().take() {
                lost_tx.send(DeviceLoss::new(reason, message));
            }
        });

        let device = WgpuDevice::new(device, queue);
        self.devices.lock().unwrap().push(device.clone());
        Ok(ProvisionedDevice { device, lost })
    }

    async fn reclaim(&self) {
        // Drive outstanding work on every device we handed out so deferred
        // destruction and buffer frees can actually run.
        let devices = self.devices.lock().unwrap().clone();
        for device in devices {
            device.poll_wait();
        }
    }
}

#[derive(Debug)]
struct WgpuDeviceShared {
    device: wgpu::Device,
    queue: wgpu::Queue,
    /// Local scope depth; wgpu offers no non-faulting probe for an empty
    /// scope stack. Scopes pushed directly on the raw device bypass this
    /// count, so tests must balance their own pushes.
    scope_depth: AtomicUsize,
}

/// One pooled wgpu device. Clones share the underlying handles.
#[derive(Clone, Debug)]
pub struct WgpuDevice {
    shared: Arc<WgpuDeviceShared>,
}

impl WgpuDevice {
    fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            shared: Arc::new(WgpuDeviceShared {
                device,
                queue,
                scope_depth: AtomicUsize::new(0),
            }),
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.shared.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.shared.queue
    }

    fn poll_wait(&self) {
        self.shared.device.poll(wgpu::Maintain::Wait);
    }
}

#[async_trait]
impl PooledDevice for WgpuDevice {
    fn push_error_scope(&self, filter: ErrorScopeKind) {
        let filter = match filter {
            ErrorScopeKind::Validation => wgpu::ErrorFilter::Validation,
            ErrorScopeKind::Internal => wgpu::ErrorFilter::Internal,
            ErrorScopeKind::OutOfMemory => wgpu::ErrorFilter::OutOfMemory,
        };
        self.shared.scope_depth.fetch_add(1, Ordering::Relaxed);
        self.shared.device.push_error_scope(filter);
    }

    async fn pop_error_scope(&self) -> Result<Option<String>, EmptyScopeStack> {
        if self.shared.scope_depth.load(Ordering::Relaxed) == 0 {
            return Err(EmptyScopeStack);
        }
        self.shared.scope_depth.fetch_sub(1, Ordering::Relaxed);
        self.poll_wait();
        Ok(self.shared.device.pop_error_scope().await.map(|err| err.to_string()))
    }

    async fn submitted_work_done(&self) {
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        self.shared.queue.on_submitted_work_done(move || {
            sender.send(()).ok();
        });
        self.poll_wait();
        if receiver.receive().await.is_none() {
            tracing::warn!("submitted-work-done callback dropped without completing");
        }
    }

    fn destroy(&self) {
        self.shared.device.destroy();
    }
}

fn base_limits(tier: CapabilityTier) -> wgpu::Limits {
    match tier {
        CapabilityTier::Core => wgpu::Limits::default(),
        CapabilityTier::Compat => wgpu::Limits::downlevel_defaults(),
    }
}

fn feature_bits(name: &str) -> Option<wgpu::Features> {
    Some(match name {
        "bgra8unorm-storage" => wgpu::Features::BGRA8UNORM_STORAGE,
        "depth-clip-control" => wgpu::Features::DEPTH_CLIP_CONTROL,
        "depth32float-stencil8" => wgpu::Features::DEPTH32FLOAT_STENCIL8,
        "float32-filterable" => wgpu::Features::FLOAT32_FILTERABLE,
        "indirect-first-instance" => wgpu::Features::INDIRECT_FIRST_INSTANCE,
        "rg11b10ufloat-renderable" => wgpu::Features::RG11B10UFLOAT_RENDERABLE,
        "shader-f16" => wgpu::Features::SHADER_F16,
        "texture-compression-astc" => wgpu::Features::TEXTURE_COMPRESSION_ASTC,
        "texture-compression-bc" => wgpu::Features::TEXTURE_COMPRESSION_BC,
        "texture-compression-etc2" => wgpu::Features::TEXTURE_COMPRESSION_ETC2,
        "timestamp-query" => wgpu::Features::TIMESTAMP_QUERY,
        _ => return None,
    })
}

fn limit_value(limits: &wgpu::Limits, name: &str) -> Option<u64> {
    Some(match name {
        "max_texture_dimension_1d" => limits.max_texture_dimension_1d.into(),
        "max_texture_dimension_2d" => limits.max_texture_dimension_2d.into(),
        "max_texture_dimension_3d" => limits.max_texture_dimension_3d.into(),
        "max_texture_array_layers" => limits.max_texture_array_layers.into(),
        "max_bind_groups" => limits.max_bind_groups.into(),
        "max_uniform_buffer_binding_size" => limits.max_uniform_buffer_binding_size.into(),
        "max_storage_buffer_binding_size" => limits.max_storage_buffer_binding_size.into(),
        "max_buffer_size" => limits.max_buffer_size,
        "max_vertex_buffers" => limits.max_vertex_buffers.into(),
        "max_vertex_attributes" => limits.max_vertex_attributes.into(),
        "max_compute_invocations_per_workgroup" => {
            limits.max_compute_invocations_per_workgroup.into()
        }
        "max_compute_workgroups_per_dimension" => {
            limits.max_compute_workgroups_per_dimension.into()
        }
        _ => return None,
    })
}

fn apply_limit(limits: &mut wgpu::Limits, name: &str, value: u64) -> bool {
    let narrow = u32::try_from(value).unwrap_or(u32::MAX);
    match name {
        "max_texture_dimension_1d" => limits.max_texture_dimension_1d = narrow,
        "max_texture_dimension_2d" => limits.max_texture_dimension_2d = narrow,
        "max_texture_dimension_3d" => limits.max_texture_dimension_3d = narrow,
        "max_texture_array_layers" => limits.max_texture_array_layers = narrow,
        "max_bind_groups" => limits.max_bind_groups = narrow,
        "max_uniform_buffer_binding_size" => limits.max_uniform_buffer_binding_size = narrow,
        "max_storage_buffer_binding_size" => limits.max_storage_buffer_binding_size = narrow,
        "max_buffer_size" => limits.max_buffer_size = value,
        "max_vertex_buffers" => limits.max_vertex_buffers = narrow,
        "max_vertex_attributes" => limits.max_vertex_attributes = narrow,
        "max_compute_invocations_per_workgroup" => {
            limits.max_compute_invocations_per_workgroup = narrow
        }
        "max_compute_workgroups_per_dimension" => {
            limits.max_compute_workgroups_per_dimension = narrow
        }
        _ => return false,
    }
    true
}
