use std::time::Duration;

use whetstone_gpu::CapabilityTier;

pub const DEFAULT_CAPACITY: usize = 5;
pub const DEFAULT_REPLACE_AFTER_USES: u32 = 100;
pub const DEFAULT_SCOPE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Tuning knobs for a [`DevicePool`](crate::DevicePool).
#[derive(Clone, Debug)]
pub struct PoolOptions {
    /// Most devices kept alive at once, leased ones included.
    pub capacity: usize,
    /// A device that finished this many usage windows is retired instead of
    /// going back on the shelf.
    pub replace_after_uses: u32,
    /// Upper bound on winding down one usage window, covering queued work,
    /// scope pops, and an expected device loss.
    pub scope_timeout: Duration,
    pub tier: CapabilityTier,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            replace_after_uses: DEFAULT_REPLACE_AFTER_USES,
            scope_timeout: DEFAULT_SCOPE_TIMEOUT,
            tier: CapabilityTier::Core,
        }
    }
}

impl PoolOptions {
    /// Defaults overridden by `WHETSTONE_POOL_CAPACITY`,
    /// `WHETSTONE_DEVICE_REUSE_LIMIT`, `WHETSTONE_SCOPE_TIMEOUT_MS`, and
    /// `WHETSTONE_COMPAT`. Malformed values are logged and ignored.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(value) = env_u64("WHETSTONE_POOL_CAPACITY") {
            options.capacity = value.clamp(1, 1024) as usize;
        }
        if let Some(value) = env_u64("WHETSTONE_DEVICE_REUSE_LIMIT") {
            options.replace_after_uses = value.min(u64::from(u32::MAX)) as u32;
        }
        if let Some(value) = env_u64("WHETSTONE_SCOPE_TIMEOUT_MS") {
            options.scope_timeout = Duration::from_millis(value);
        }
        if env_truthy("WHETSTONE_COMPAT") {
            options.tier = CapabilityTier::Compat;
        }
        options
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(name, value = %raw, "ignoring malformed environment override");
            None
        }
    }
}

fn env_truthy(name: &str) -> bool {
    matches!(
        std::env::var(name).ok().as_deref().map(str::trim),
        Some("1" | "true" | "yes" | "on")
    )
}
