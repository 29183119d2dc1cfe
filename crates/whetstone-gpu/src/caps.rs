//! Capability tiers and the fixed tables of recognized features and limits.
//!
//! The tables are the single source of truth for descriptor normalization:
//! a limit request equal to the tier default is indistinguishable from not
//! requesting it, and canonical keys serialize limits in table order.

use std::fmt;

/// Feature level devices are provisioned at. Selects the default-limits
/// table requests are normalized against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CapabilityTier {
    #[default]
    Core,
    /// Downlevel tier for adapters without full core support.
    Compat,
}

impl CapabilityTier {
    pub fn as_str(self) -> &'static str {
        match self {
            CapabilityTier::Core => "core",
            CapabilityTier::Compat => "compat",
        }
    }
}

impl fmt::Display for CapabilityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recognized limit: its name plus the per-tier default requests are
/// compared against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LimitSpec {
    pub name: &'static str,
    pub core_default: u64,
    pub compat_default: u64,
}

impl LimitSpec {
    pub fn default_for(&self, tier: CapabilityTier) -> u64 {
        match tier {
            CapabilityTier::Core => self.core_default,
            CapabilityTier::Compat => self.compat_default,
        }
    }
}

/// Limits recognized in descriptors. Core values mirror the WebGPU base
/// limits (`wgpu::Limits::default()`), compat values the downlevel defaults
/// (`wgpu::Limits::downlevel_defaults()`). Unrecognized limit names in a
/// descriptor are dropped during normalization.
pub const KNOWN_LIMITS: &[LimitSpec] = &[
    LimitSpec { name: "max_texture_dimension_1d", core_default: 8192, compat_default: 2048 },
    LimitSpec { name: "max_texture_dimension_2d", core_default: 8192, compat_default: 2048 },
    LimitSpec { name: "max_texture_dimension_3d", core_default: 2048, compat_default: 256 },
    LimitSpec { name: "max_texture_array_layers", core_default: 256, compat_default: 256 },
    LimitSpec { name: "max_bind_groups", core_default: 4, compat_default: 4 },
    LimitSpec { name: "max_uniform_buffer_binding_size", core_default: 65536, compat_default: 16384 },
    LimitSpec { name: "max_storage_buffer_binding_size", core_default: 134217728, compat_default: 134217728 },
    LimitSpec { name: "max_buffer_size", core_default: 268435456, compat_default: 268435456 },
    LimitSpec { name: "max_vertex_buffers", core_default: 8, compat_default: 8 },
    LimitSpec { name: "max_vertex_attributes", core_default: 16, compat_default: 16 },
    LimitSpec { name: "max_compute_invocations_per_workgroup", core_default: 256, compat_default: 256 },
    LimitSpec { name: "max_compute_workgroups_per_dimension", core_default: 65535, compat_default: 65535 },
];

/// Feature names recognized by the bundled providers. Descriptors may carry
/// names outside this table; they fail adapter verification instead of being
/// rejected up front.
pub const KNOWN_FEATURES: &[&str] = &[
    "bgra8unorm-storage",
    "depth-clip-control",
    "depth32float-stencil8",
    "float32-filterable",
    "indirect-first-instance",
    "rg11b10ufloat-renderable",
    "shader-f16",
    "texture-compression-astc",
    "texture-compression-bc",
    "texture-compression-etc2",
    "timestamp-query",
];

pub fn limit_spec(name: &str) -> Option<&'static LimitSpec> {
    KNOWN_LIMITS.iter().find(|spec| spec.name == name)
}

/// Default value of a recognized limit for `tier`, or `None` for an
/// unrecognized name.
pub fn default_limit(name: &str, tier: CapabilityTier) -> Option<u64> {
    limit_spec(name).map(|spec| spec.default_for(tier))
}
