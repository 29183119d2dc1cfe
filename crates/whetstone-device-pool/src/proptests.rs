//! Property tests for descriptor canonicalization.

use proptest::prelude::*;

use whetstone_gpu::{CapabilityTier, KNOWN_FEATURES, KNOWN_LIMITS};

use crate::descriptor::{canonicalize, DeviceDescriptor};

fn arb_tier() -> impl Strategy<Value = CapabilityTier> {
    prop_oneof![Just(CapabilityTier::Core), Just(CapabilityTier::Compat)]
}

fn arb_features() -> impl Strategy<Value = Vec<String>> {
    proptest::collection::vec(
        (0..KNOWN_FEATURES.len()).prop_map(|index| KNOWN_FEATURES[index].to_string()),
        0..6,
    )
}

// Unique names: duplicate keys would make insertion order observable and
// the order-independence property vacuous.
fn arb_limit_entries() -> impl Strategy<Value = Vec<(String, u64)>> {
    proptest::collection::btree_set(0..KNOWN_LIMITS.len(), 0..6).prop_flat_map(|indices| {
        let names: Vec<String> = indices
            .iter()
            .map(|&index| KNOWN_LIMITS[index].name.to_string())
            .collect();
        proptest::collection::vec(0u64..1 << 40, names.len()).prop_map(move |values| {
            names.iter().cloned().zip(values).collect()
        })
    })
}

fn descriptor_from(features: &[String], limits: &[(String, u64)]) -> DeviceDescriptor {
    let mut descriptor = DeviceDescriptor::default();
    for name in features {
        descriptor = descriptor.with_feature(name);
    }
    for (name, value) in limits {
        descriptor = descriptor.with_limit(name, *value);
    }
    descriptor
}

proptest! {
    #[test]
    fn key_ignores_input_order(
        features in arb_features(),
        limits in arb_limit_entries(),
        tier in arb_tier(),
    ) {
        let forward = descriptor_from(&features, &limits);
        let reversed_features: Vec<String> = features.iter().rev().cloned().collect();
        let reversed_limits: Vec<(String, u64)> = limits.iter().rev().cloned().collect();
        let backward = descriptor_from(&reversed_features, &reversed_limits);

        let first = canonicalize(Some(&forward), tier);
        let second = canonicalize(Some(&backward), tier);
        prop_assert_eq!(first.key, second.key);
    }

    #[test]
    fn canonicalization_is_idempotent(
        features in arb_features(),
        limits in arb_limit_entries(),
        tier in arb_tier(),
    ) {
        let descriptor = descriptor_from(&features, &limits);
        let first = canonicalize(Some(&descriptor), tier);
        let rebuilt = DeviceDescriptor::from(&first.request);
        let second = canonicalize(Some(&rebuilt), tier);

        prop_assert_eq!(&first.key, &second.key);
        prop_assert_eq!(&first.request.features, &second.request.features);
        prop_assert_eq!(first.request.limits.len(), second.request.limits.len());
    }

    #[test]
    fn canonical_requests_carry_no_defaults(
        features in arb_features(),
        limits in arb_limit_entries(),
        tier in arb_tier(),
    ) {
        let descriptor = descriptor_from(&features, &limits);
        let canonical = canonicalize(Some(&descriptor), tier);

        let mut sorted = canonical.request.features.clone();
        sorted.sort_unstable();
        sorted.dedup();
        prop_assert_eq!(&canonical.request.features, &sorted);

        for limit in &canonical.request.limits {
            let spec = KNOWN_LIMITS
                .iter()
                .find(|spec| spec.name == limit.name)
                .expect("canonical limits only carry known names");
            prop_assert_ne!(limit.value, spec.default_for(tier));
        }
        prop_assert!(!canonical.key.is_baseline());
    }
}
