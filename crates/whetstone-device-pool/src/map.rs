//! Descriptor-keyed holder map with bounded capacity.
//!
//! Reuse is LRU: creating past capacity evicts the least recently used free
//! holder and destroys its device. Descriptors the adapter cannot satisfy
//! are remembered so repeat requests skip without consulting the provider
//! again.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use whetstone_gpu::{DeviceProvider, PooledDevice, ProvisionError};

use crate::descriptor::{CanonicalDescriptor, CanonicalKey, DescriptorModifier};
use crate::error::AcquireError;
use crate::holder::DeviceHolder;
use crate::stats::PoolStats;

pub struct HolderMap<D: PooledDevice> {
    holders: LruCache<CanonicalKey, DeviceHolder<D>>,
    unsupported: HashMap<CanonicalKey, Vec<String>>,
    stats: Arc<PoolStats>,
}

impl<D: PooledDevice> HolderMap<D> {
    pub fn new(capacity: usize, stats: Arc<PoolStats>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            holders: LruCache::new(capacity),
            unsupported: HashMap::new(),
            stats,
        }
    }

    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.holders.cap().get()
    }

    pub fn is_unsupported(&self, key: &CanonicalKey) -> bool {
        self.unsupported.contains_key(key)
    }

    /// Returns the holder for `canonical`, creating and pooling a device on
    /// first use. Marks the effective key most recently used.
    pub async fn get_or_create<P>(
        &mut self,
        provider: &P,
        canonical: &CanonicalDescriptor,
        modifier: &dyn DescriptorModifier,
    ) -> Result<&mut DeviceHolder<D>, AcquireError>
    where
        P: DeviceProvider<Device = D>,
    {
        let key = modifier.cache_key(&canonical.key);

        if let Some(missing) = self.unsupported.get(&key) {
            self.stats.inc_unsupported_skips();
            tracing::debug!(key = %key, "descriptor known unsupported, skipping");
            return Err(AcquireError::Unsupported {
                missing: missing.clone(),
            });
        }

        // A device lost while idle would fail whatever runs on it next.
        let lost_while_idle = match self.holders.peek_mut(&key) {
            Some(holder) => holder.is_free() && holder.loss_observed(),
            None => false,
        };
        if lost_while_idle {
            tracing::debug!(key = %key, "dropping idle pooled device that reported loss");
            self.remove_and_destroy(&key);
        }

        if self.holders.contains(&key) {
            self.stats.inc_cache_hits();
        } else {
            self.create(provider, canonical, modifier, &key).await?;
        }

        self.holders
            .get_mut(&key)
            .ok_or_else(|| AcquireError::Internal("pooled device vanished during lookup".into()))
    }

    async fn create<P>(
        &mut self,
        provider: &P,
        canonical: &CanonicalDescriptor,
        modifier: &dyn DescriptorModifier,
        key: &CanonicalKey,
    ) -> Result<(), AcquireError>
    where
        P: DeviceProvider<Device = D>,
    {
        self.stats.inc_cache_misses();
        let profile = provider.adapter_profile().await?;
        let request = modifier.adjust(&profile, canonical.request.clone());

        let mut missing = profile.missing_features(&request.features);
        for limit in &request.limits {
            if let Some(&maximum) = profile.limits.get(&limit.name) {
                if limit.value > maximum {
                    missing.push(format!(
                        "{}={} exceeds adapter maximum {}",
                        limit.name, limit.value, maximum
                    ));
                }
            }
        }
        if !missing.is_empty() {
            self.remember_unsupported(key, missing.clone());
            return Err(AcquireError::Unsupported { missing });
        }

        let provisioned = match provider.request_device(&request).await {
            Ok(provisioned) => provisioned,
            Err(ProvisionError::UnsupportedFeatures { missing }) => {
                self.remember_unsupported(key, missing.clone());
                return Err(AcquireError::Unsupported { missing });
            }
            Err(err) => return Err(AcquireError::Creation(err)),
        };

        self.make_room()?;
        self.stats.inc_devices_created();
        tracing::debug!(key = %key, "created pooled device");
        let holder = DeviceHolder::new(provisioned.device, provisioned.lost, key.clone());
        self.holders.put(key.clone(), holder);
        Ok(())
    }

    fn remember_unsupported(&mut self, key: &CanonicalKey, missing: Vec<String>) {
        self.stats.inc_unsupported_skips();
        tracing::debug!(key = %key, missing = missing.len(), "descriptor unsupported by adapter");
        self.unsupported.insert(key.clone(), missing);
    }

    /// Evicts free holders, least recently used first, until a slot is
    /// open. Leased holders are never evicted.
    fn make_room(&mut self) -> Result<(), AcquireError> {
        while self.holders.len() >= self.capacity() {
            let victim = self
                .holders
                .iter()
                .rev()
                .find(|(_, holder)| holder.is_free())
                .map(|(key, _)| key.clone());
            match victim {
                Some(key) => {
                    self.remove_and_destroy(&key);
                    self.stats.inc_evictions_lru();
                    tracing::debug!(key = %key, "evicted least recently used device");
                }
                None => {
                    return Err(AcquireError::Exhausted {
                        capacity: self.capacity(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn get_mut(&mut self, key: &CanonicalKey) -> Option<&mut DeviceHolder<D>> {
        self.holders.get_mut(key)
    }

    /// Destroys the keyed device and forgets its holder.
    pub fn remove_and_destroy(&mut self, key: &CanonicalKey) -> bool {
        match self.holders.pop(key) {
            Some(holder) => {
                holder.destroy_device();
                self.stats.inc_devices_destroyed();
                true
            }
            None => false,
        }
    }

    /// Destroys every pooled device.
    pub fn clear_all(&mut self) {
        while let Some((_, holder)) = self.holders.pop_lru() {
            holder.destroy_device();
            self.stats.inc_devices_destroyed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use whetstone_gpu::soft::SoftGpuProvider;
    use whetstone_gpu::{CapabilityTier, LossReason};

    use crate::descriptor::{canonicalize, DeviceDescriptor, IdentityModifier};

    fn new_stats() -> Arc<PoolStats> {
        Arc::new(PoolStats::default())
    }

    fn canonical_for(features: &[&str]) -> CanonicalDescriptor {
        let mut descriptor = DeviceDescriptor::default();
        for feature in features {
            descriptor = descriptor.with_feature(feature);
        }
        canonicalize(Some(&descriptor), CapabilityTier::Core)
    }

    #[tokio::test]
    async fn creates_once_then_reuses() {
        let provider = SoftGpuProvider::new();
        let stats = new_stats();
        let mut map = HolderMap::new(2, Arc::clone(&stats));
        let canonical = canonical_for(&[]);

        map.get_or_create(&provider, &canonical, &IdentityModifier)
            .await
            .unwrap();
        map.get_or_create(&provider, &canonical, &IdentityModifier)
            .await
            .unwrap();

        assert_eq!(provider.request_count(), 1);
        assert_eq!(map.len(), 1);
        let snap = stats.snapshot();
        assert_eq!(snap.devices_created, 1);
        assert_eq!(snap.cache_misses, 1);
        assert_eq!(snap.cache_hits, 1);
    }

    #[tokio::test]
    async fn unsupported_descriptor_is_remembered() {
        let provider = SoftGpuProvider::new();
        let stats = new_stats();
        let mut map = HolderMap::new(2, Arc::clone(&stats));
        let canonical = canonical_for(&["timestamp-query"]);

        let err = map
            .get_or_create(&provider, &canonical, &IdentityModifier)
            .await
            .unwrap_err();
        assert!(err.is_skip());
        let err = map
            .get_or_create(&provider, &canonical, &IdentityModifier)
            .await
            .unwrap_err();
        assert!(
            matches!(err, AcquireError::Unsupported { missing } if missing == vec!["timestamp-query".to_string()])
        );

        // Only the first attempt consulted the adapter; no device request
        // was ever issued.
        assert_eq!(provider.profile_calls(), 1);
        assert_eq!(provider.request_count(), 0);
        assert_eq!(stats.snapshot().unsupported_skips, 2);
    }

    #[tokio::test]
    async fn limit_beyond_adapter_maximum_is_unsupported() {
        let provider = SoftGpuProvider::new();
        let stats = new_stats();
        let mut map = HolderMap::new(2, Arc::clone(&stats));
        let descriptor = DeviceDescriptor::default().with_limit("max_bind_groups", 64);
        let canonical = canonicalize(Some(&descriptor), CapabilityTier::Core);

        let err = map
            .get_or_create(&provider, &canonical, &IdentityModifier)
            .await
            .unwrap_err();
        match err {
            AcquireError::Unsupported { missing } => {
                assert_eq!(
                    missing,
                    vec!["max_bind_groups=64 exceeds adapter maximum 16".to_string()]
                );
            }
            other => panic!("expected unsupported, got {other}"),
        }
        assert!(map.is_unsupported(&canonical.key));
        assert_eq!(provider.request_count(), 0);
    }

    #[tokio::test]
    async fn evicts_least_recently_used_free_holder() {
        let provider =
            SoftGpuProvider::with_features(["shader-f16", "timestamp-query", "depth-clip-control"]);
        let stats = new_stats();
        let mut map = HolderMap::new(2, Arc::clone(&stats));
        let first = canonical_for(&["shader-f16"]);
        let second = canonical_for(&["timestamp-query"]);
        let third = canonical_for(&["depth-clip-control"]);

        map.get_or_create(&provider, &first, &IdentityModifier).await.unwrap();
        map.get_or_create(&provider, &second, &IdentityModifier).await.unwrap();
        // Touch the first so the second becomes least recently used.
        map.get_or_create(&provider, &first, &IdentityModifier).await.unwrap();
        map.get_or_create(&provider, &third, &IdentityModifier).await.unwrap();

        assert_eq!(map.len(), 2);
        assert!(provider.device(1).unwrap().is_destroyed());
        assert!(!provider.device(0).unwrap().is_destroyed());
        let snap = stats.snapshot();
        assert_eq!(snap.evictions_lru, 1);
        assert_eq!(snap.devices_destroyed, 1);
    }

    #[tokio::test]
    async fn eviction_skips_leased_holders() {
        let provider =
            SoftGpuProvider::with_features(["shader-f16", "timestamp-query", "depth-clip-control"]);
        let stats = new_stats();
        let mut map = HolderMap::new(2, Arc::clone(&stats));
        let first = canonical_for(&["shader-f16"]);
        let second = canonical_for(&["timestamp-query"]);
        let third = canonical_for(&["depth-clip-control"]);

        let holder = map.get_or_create(&provider, &first, &IdentityModifier).await.unwrap();
        holder.begin_usage_scope(1);
        map.get_or_create(&provider, &second, &IdentityModifier).await.unwrap();
        // The leased first device is older, but the free second one goes.
        map.get_or_create(&provider, &third, &IdentityModifier).await.unwrap();

        assert!(!provider.device(0).unwrap().is_destroyed());
        assert!(provider.device(1).unwrap().is_destroyed());
    }

    #[tokio::test]
    async fn exhausted_when_every_holder_is_leased() {
        let provider = SoftGpuProvider::with_features(["shader-f16", "timestamp-query"]);
        let stats = new_stats();
        let mut map = HolderMap::new(1, Arc::clone(&stats));
        let first = canonical_for(&["shader-f16"]);
        let second = canonical_for(&["timestamp-query"]);

        let holder = map.get_or_create(&provider, &first, &IdentityModifier).await.unwrap();
        holder.begin_usage_scope(1);
        let err = map
            .get_or_create(&provider, &second, &IdentityModifier)
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::Exhausted { capacity: 1 }));
        // The leased device is untouched.
        assert!(!provider.device(0).unwrap().is_destroyed());
    }

    #[tokio::test]
    async fn idle_device_lost_out_of_band_is_replaced() {
        let provider = SoftGpuProvider::new();
        let stats = new_stats();
        let mut map = HolderMap::new(2, Arc::clone(&stats));
        let canonical = canonical_for(&[]);

        map.get_or_create(&provider, &canonical, &IdentityModifier).await.unwrap();
        provider
            .device(0)
            .unwrap()
            .trigger_loss(LossReason::Unknown, "driver restarted");

        map.get_or_create(&provider, &canonical, &IdentityModifier).await.unwrap();
        assert_eq!(provider.request_count(), 2);
        assert!(provider.device(0).unwrap().is_destroyed());
        assert!(!provider.device(1).unwrap().is_destroyed());
        let snap = stats.snapshot();
        assert_eq!(snap.devices_created, 2);
        assert_eq!(snap.devices_destroyed, 1);
    }

    #[tokio::test]
    async fn clear_all_destroys_everything() {
        let provider = SoftGpuProvider::with_features(["shader-f16"]);
        let stats = new_stats();
        let mut map = HolderMap::new(2, Arc::clone(&stats));
        map.get_or_create(&provider, &canonical_for(&[]), &IdentityModifier).await.unwrap();
        map.get_or_create(&provider, &canonical_for(&["shader-f16"]), &IdentityModifier)
            .await
            .unwrap();

        map.clear_all();
        assert!(map.is_empty());
        assert!(provider.device(0).unwrap().is_destroyed());
        assert!(provider.device(1).unwrap().is_destroyed());
        assert_eq!(stats.snapshot().devices_destroyed, 2);
    }
}
