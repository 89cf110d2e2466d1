//! Counters for key lifecycle events.
//!
//! Instruments come from the global meter provider; without one installed
//! (tests, or no OTLP endpoint) they are no-ops.

use common::KeyType;
use opentelemetry::{
    global,
    metrics::{Counter, Meter},
    KeyValue,
};

/// Lifecycle counters, labelled by key type.
#[derive(Clone)]
pub struct KeyMetrics {
    created: Counter<u64>,
    rotated: Counter<u64>,
    retired: Counter<u64>,
    sweep_failures: Counter<u64>,
    cache_lookups: Counter<u64>,
}

impl KeyMetrics {
    pub fn new() -> Self {
        Self::from_meter(&global::meter("keyring"))
    }

    fn from_meter(meter: &Meter) -> Self {
        Self {
            created: meter
                .u64_counter("keyring.keys.created")
                .with_description("Keys created, including rotation successors")
                .init(),
            rotated: meter
                .u64_counter("keyring.keys.rotated")
                .with_description("Keys moved from active to retiring")
                .init(),
            retired: meter
                .u64_counter("keyring.keys.retired")
                .with_description("Keys moved to retired")
                .init(),
            sweep_failures: meter
                .u64_counter("keyring.sweep.failures")
                .with_description("Expired keys the sweep failed to process")
                .init(),
            cache_lookups: meter
                .u64_counter("keyring.cache.lookups")
                .with_description("Key cache lookups by result")
                .init(),
        }
    }

    pub fn key_created(&self, key_type: KeyType) {
        self.created.add(1, &[type_label(key_type)]);
    }

    pub fn key_rotated(&self, key_type: KeyType) {
        self.rotated.add(1, &[type_label(key_type)]);
    }

    pub fn key_retired(&self, key_type: KeyType) {
        self.retired.add(1, &[type_label(key_type)]);
    }

    pub fn sweep_failure(&self, key_type: KeyType) {
        self.sweep_failures.add(1, &[type_label(key_type)]);
    }

    pub fn cache_lookup(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups.add(1, &[KeyValue::new("result", result)]);
    }
}

impl std::fmt::Debug for KeyMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMetrics").finish_non_exhaustive()
    }
}

impl Default for KeyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn type_label(key_type: KeyType) -> KeyValue {
    KeyValue::new("key_type", key_type.as_str())
}
