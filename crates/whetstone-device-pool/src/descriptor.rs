//! Descriptor canonicalization.
//!
//! Two descriptors asking for the same device must land on the same holder,
//! so before a descriptor touches the pool it is reduced to a canonical
//! form: features deduplicated and sorted, limits stripped when they equal
//! the tier default, and the remainder serialized into a stable string key.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use whetstone_gpu::{
    limit_spec, AdapterProfile, CapabilityTier, DeviceRequest, LimitRequest, KNOWN_LIMITS,
};

/// Caller-facing descriptor, WebGPU-shaped: feature names plus limit
/// overrides.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub required_features: Vec<String>,
    pub required_limits: BTreeMap<String, u64>,
}

impl DeviceDescriptor {
    pub fn with_feature(mut self, name: &str) -> Self {
        self.required_features.push(name.to_string());
        self
    }

    pub fn with_limit(mut self, name: &str, value: u64) -> Self {
        self.required_limits.insert(name.to_string(), value);
        self
    }
}

impl From<&DeviceRequest> for DeviceDescriptor {
    fn from(request: &DeviceRequest) -> Self {
        Self {
            required_features: request.features.clone(),
            required_limits: request
                .limits
                .iter()
                .map(|limit| (limit.name.clone(), limit.value))
                .collect(),
        }
    }
}

/// Map key derived from a canonicalized descriptor.
///
/// The empty string is reserved for "no descriptor given", the baseline
/// device; an explicitly empty descriptor keys differently.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    pub fn baseline() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_baseline(&self) -> bool {
        self.0.is_empty()
    }

    /// Derives a distinct key from this one, for modifiers that change
    /// device identity.
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self(format!("{}#{}", self.0, suffix))
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_baseline() {
            f.write_str("<baseline>")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// A descriptor reduced to canonical form plus the request that satisfies
/// it.
#[derive(Clone, Debug)]
pub struct CanonicalDescriptor {
    pub request: DeviceRequest,
    pub key: CanonicalKey,
}

/// Canonicalizes `descriptor` against `tier` defaults.
///
/// `None` maps to the baseline request under the reserved empty key. The
/// key serializes features first and limits second, limits in fixed table
/// order, so equivalent descriptors always collide. Unknown limit names are
/// dropped; unknown feature names are kept and will surface as unsupported
/// when checked against the adapter.
pub fn canonicalize(
    descriptor: Option<&DeviceDescriptor>,
    tier: CapabilityTier,
) -> CanonicalDescriptor {
    let Some(descriptor) = descriptor else {
        return CanonicalDescriptor {
            request: DeviceRequest::baseline(tier),
            key: CanonicalKey::baseline(),
        };
    };

    let features: BTreeSet<&str> = descriptor
        .required_features
        .iter()
        .map(String::as_str)
        .collect();

    let mut limits = Vec::new();
    for spec in KNOWN_LIMITS {
        if let Some(&value) = descriptor.required_limits.get(spec.name) {
            if value != spec.default_for(tier) {
                limits.push(LimitRequest::new(spec.name, value));
            }
        }
    }
    for name in descriptor.required_limits.keys() {
        if limit_spec(name).is_none() {
            tracing::debug!(name = %name, "dropping unrecognized limit from descriptor");
        }
    }

    let mut key = String::from("{\"features\":[");
    for (index, name) in features.iter().enumerate() {
        if index > 0 {
            key.push(',');
        }
        key.push('"');
        key.push_str(name);
        key.push('"');
    }
    key.push_str("],\"limits\":{");
    for (index, limit) in limits.iter().enumerate() {
        if index > 0 {
            key.push(',');
        }
        key.push('"');
        key.push_str(&limit.name);
        key.push_str("\":");
        key.push_str(&limit.value.to_string());
    }
    key.push_str("}}");

    CanonicalDescriptor {
        request: DeviceRequest {
            tier,
            features: features.into_iter().map(str::to_string).collect(),
            limits,
        },
        key: CanonicalKey(key),
    }
}

/// Hook that lets a harness adapt requests to adapter quirks before a
/// device is created.
///
/// The adjusted request is not re-canonicalized; a modifier that changes
/// device identity must also change the cache key.
pub trait DescriptorModifier: Send + Sync {
    fn adjust(&self, _profile: &AdapterProfile, request: DeviceRequest) -> DeviceRequest {
        request
    }

    fn cache_key(&self, base: &CanonicalKey) -> CanonicalKey {
        base.clone()
    }
}

/// Modifier that changes nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityModifier;

impl DescriptorModifier for IdentityModifier {}
