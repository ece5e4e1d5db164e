use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::clock::TimestampMs;
use crate::domain::event::VEHICLE_UPDATED;

/// Suppression window for repeated delivery of the same logical event.
pub const DEDUP_WINDOW_MS: i64 = 2_000;
/// Entries older than this are pruned to bound memory.
pub const DEDUP_HORIZON_MS: i64 = 60_000;
/// Persist at least one sample per vehicle this often, even if unchanged.
pub const SAMPLE_CACHE_TTL_MS: i64 = 5 * 60 * 1_000;

/// Short-window dedup of webhook deliveries keyed by `(vehicle_id, event_type)`.
/// Process-local; a restart simply forgets recent deliveries, which at worst
/// lets one duplicate through.
#[derive(Debug, Default)]
pub struct DedupCache {
    entries: Mutex<HashMap<(String, String), TimestampMs>>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the event should be processed, recording `now` when it
    /// passes. Only vehicle-update events are deduplicated; everything else
    /// always proceeds.
    pub fn should_process(
        &self,
        vehicle_id: Option<&str>,
        event_type: &str,
        now: TimestampMs,
    ) -> bool {
        let Some(vehicle_id) = vehicle_id else {
            return true;
        };
        if event_type != VEHICLE_UPDATED {
            return true;
        }

        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        entries.retain(|_, last| now.millis_since(*last) <= DEDUP_HORIZON_MS);

        let key = (vehicle_id.to_string(), event_type.to_string());
        if let Some(last) = entries.get(&key)
            && now.millis_since(*last) < DEDUP_WINDOW_MS
        {
            return false;
        }

        entries.insert(key, now);
        true
    }
}

/// Last recorded per-vehicle state feeding the significance filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessEntry {
    pub battery_level: Option<i64>,
    pub is_charging: Option<bool>,
    pub saved_at: TimestampMs,
}

/// Last observed per-vehicle state feeding transition-based notifications.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReachabilityEntry {
    pub is_charging: Option<bool>,
    pub is_reachable: Option<bool>,
    pub is_fully_charged: Option<bool>,
}

/// Process-local per-vehicle liveness state. No durability guarantee: a
/// restart forgets recent history, and the session engine re-derives what it
/// needs from persisted samples.
#[derive(Debug, Default)]
pub struct LivenessCache {
    samples: Mutex<HashMap<String, LivenessEntry>>,
    reachability: Mutex<HashMap<String, ReachabilityEntry>>,
}

impl LivenessCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_entry(&self, vehicle_id: &str) -> Option<LivenessEntry> {
        let samples = match self.samples.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        samples.get(vehicle_id).copied()
    }

    pub fn record_sample(&self, vehicle_id: &str, entry: LivenessEntry) {
        let mut samples = match self.samples.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        samples.insert(vehicle_id.to_string(), entry);
    }

    /// Stores the new reachability state and returns the previous one, so the
    /// caller can derive state transitions.
    pub fn swap_reachability(
        &self,
        vehicle_id: &str,
        entry: ReachabilityEntry,
    ) -> Option<ReachabilityEntry> {
        let mut reachability = match self.reachability.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        reachability.insert(vehicle_id.to_string(), entry)
    }
}

/// The significance filter: decides whether a new snapshot is different or
/// old enough to warrant persistence. Bounds storage volume from
/// high-frequency near-duplicate vendor pushes.
pub fn significant(
    cached: Option<&LivenessEntry>,
    battery_level: Option<i64>,
    is_charging: Option<bool>,
    now: TimestampMs,
) -> bool {
    // Always persist while charging; session reconstruction wants dense samples.
    if is_charging == Some(true) {
        return true;
    }

    let Some(cached) = cached else {
        return true;
    };

    if now.millis_since(cached.saved_at) > SAMPLE_CACHE_TTL_MS {
        return true;
    }

    if let (Some(old), Some(new)) = (cached.battery_level, battery_level)
        && (new - old).abs() >= 1
    {
        return true;
    }

    cached.is_charging != is_charging
}
