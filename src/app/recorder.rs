use std::sync::{Arc, Mutex};

use chrono::DateTime;
use rusqlite::Connection;
use thiserror::Error;
use uuid::Uuid;

use crate::adapters::db::{self, DbError};
use crate::domain::caches::{LivenessCache, LivenessEntry, significant};
use crate::domain::clock::Clock;
use crate::domain::models::TelemetrySample;
use crate::domain::vehicle::VehicleSnapshot;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("database lock poisoned")]
    DbLockPoisoned,
    #[error("database operation failed: {0}")]
    Database(#[from] DbError),
}

/// Persists vehicle snapshots as telemetry samples, dropping stale and
/// insignificant ones before they reach storage.
#[derive(Clone)]
pub struct SampleRecorder<Cl> {
    connection: Arc<Mutex<Connection>>,
    liveness: Arc<LivenessCache>,
    clock: Cl,
}

impl<Cl: Clock> SampleRecorder<Cl> {
    pub fn new(connection: Arc<Mutex<Connection>>, liveness: Arc<LivenessCache>, clock: Cl) -> Self {
        Self {
            connection,
            liveness,
            clock,
        }
    }

    /// Records a snapshot. Returns the new sample id, or `None` when the
    /// snapshot was rejected as stale (older than the newest stored sample)
    /// or insignificant (unchanged state within the cache TTL).
    pub fn record(
        &self,
        snapshot: &VehicleSnapshot,
        user_id: &str,
        source_event_id: Option<&str>,
    ) -> Result<Option<String>, RecorderError> {
        let now = self.clock.now();
        let sample_time = snapshot
            .last_seen
            .clone()
            .unwrap_or_else(|| now.to_rfc3339());

        let connection = self
            .connection
            .lock()
            .map_err(|_| RecorderError::DbLockPoisoned)?;

        let newest = db::latest_sample_time(
            &connection,
            &snapshot.vehicle_id,
            snapshot.vin.as_deref(),
        )?;
        if let Some(newest) = newest
            && is_older(&sample_time, &newest)
        {
            tracing::debug!(
                vehicle_id = %snapshot.vehicle_id,
                sample_time,
                newest,
                "dropping stale sample"
            );
            return Ok(None);
        }

        let cached = self.liveness.sample_entry(&snapshot.vehicle_id);
        if !significant(
            cached.as_ref(),
            snapshot.battery_level,
            snapshot.is_charging,
            now,
        ) {
            tracing::debug!(
                vehicle_id = %snapshot.vehicle_id,
                "dropping insignificant sample"
            );
            return Ok(None);
        }

        let sample = TelemetrySample {
            id: Uuid::new_v4().to_string(),
            source_event_id: source_event_id.map(ToString::to_string),
            vehicle_id: snapshot.vehicle_id.clone(),
            user_id: user_id.to_string(),
            sample_time,
            created_at: now.to_rfc3339(),
            is_charging: snapshot.is_charging,
            is_plugged_in: snapshot.is_plugged_in,
            is_fully_charged: snapshot.is_fully_charged,
            is_reachable: snapshot.is_reachable,
            battery_level: snapshot.battery_level,
            battery_capacity_kwh: snapshot.battery_capacity_kwh,
            charge_rate_kw: snapshot.charge_rate_kw,
            power_delivery_state: snapshot.power_delivery_state.clone(),
            odometer_km: snapshot.odometer_km,
            location: snapshot.location,
            vin: snapshot.vin.clone(),
            brand: snapshot.brand.clone(),
            model: snapshot.model.clone(),
            year: snapshot.year,
        };

        db::insert_sample(&connection, &sample)?;

        self.liveness.record_sample(
            &snapshot.vehicle_id,
            LivenessEntry {
                battery_level: snapshot.battery_level,
                is_charging: snapshot.is_charging,
                saved_at: now,
            },
        );

        tracing::debug!(
            vehicle_id = %snapshot.vehicle_id,
            sample_id = %sample.id,
            battery_level = ?snapshot.battery_level,
            "telemetry sample recorded"
        );

        Ok(Some(sample.id))
    }
}

/// Strict ordering check on sample timestamps. Both sides are RFC 3339 with
/// identical formatting in practice, so the string comparison fallback stays
/// correct when parsing fails.
fn is_older(candidate: &str, newest: &str) -> bool {
    match (
        DateTime::parse_from_rfc3339(candidate),
        DateTime::parse_from_rfc3339(newest),
    ) {
        (Ok(candidate), Ok(newest)) => candidate < newest,
        _ => candidate < newest,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use crate::domain::caches::{LivenessCache, SAMPLE_CACHE_TTL_MS};
    use crate::domain::clock::{Clock, TimestampMs};
    use crate::domain::vehicle::VehicleSnapshot;
    use crate::test_support::migrated_connection;

    use super::SampleRecorder;

    #[derive(Clone)]
    struct FakeClock(Arc<Mutex<i64>>);

    impl FakeClock {
        fn new(start: i64) -> Self {
            Self(Arc::new(Mutex::new(start)))
        }

        fn advance(&self, millis: i64) {
            *self.0.lock().expect("clock lock") += millis;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> TimestampMs {
            TimestampMs(*self.0.lock().expect("clock lock"))
        }
    }

    fn snapshot(last_seen: &str, battery: i64, charging: bool) -> VehicleSnapshot {
        VehicleSnapshot::from_payload(&json!({
            "id": "vehicle-1",
            "lastSeen": last_seen,
            "chargeState": {"isCharging": charging, "batteryLevel": battery},
        }))
        .expect("snapshot should extract")
    }

    fn recorder(clock: FakeClock) -> SampleRecorder<FakeClock> {
        let connection = Arc::new(Mutex::new(migrated_connection()));
        SampleRecorder::new(connection, Arc::new(LivenessCache::new()), clock)
    }

    #[test]
    fn records_first_sample_for_vehicle() {
        let recorder = recorder(FakeClock::new(1_000));

        let id = recorder
            .record(&snapshot("2026-03-01T10:00:00.000Z", 40, true), "user-1", None)
            .expect("record should succeed");

        assert!(id.is_some());
    }

    #[test]
    fn rejects_sample_older_than_newest_stored() {
        let recorder = recorder(FakeClock::new(1_000));

        recorder
            .record(&snapshot("2026-03-01T10:00:00.000Z", 40, true), "user-1", None)
            .expect("record should succeed");

        let stale = recorder
            .record(&snapshot("2026-03-01T09:00:00.000Z", 35, true), "user-1", None)
            .expect("record should succeed");

        assert_eq!(stale, None);
    }

    #[test]
    fn rejects_unchanged_idle_sample_within_ttl() {
        let clock = FakeClock::new(1_000);
        let recorder = recorder(clock.clone());

        recorder
            .record(&snapshot("2026-03-01T10:00:00.000Z", 40, false), "user-1", None)
            .expect("record should succeed");

        let repeat = recorder
            .record(&snapshot("2026-03-01T10:00:10.000Z", 40, false), "user-1", None)
            .expect("record should succeed");
        assert_eq!(repeat, None);

        // Battery moved a point, so the repeat becomes significant.
        let changed = recorder
            .record(&snapshot("2026-03-01T10:00:20.000Z", 41, false), "user-1", None)
            .expect("record should succeed");
        assert!(changed.is_some());

        clock.advance(SAMPLE_CACHE_TTL_MS + 1);

        // And after the TTL even an unchanged sample is kept.
        let aged = recorder
            .record(&snapshot("2026-03-01T10:06:00.000Z", 41, false), "user-1", None)
            .expect("record should succeed");
        assert!(aged.is_some());
    }

    #[test]
    fn always_records_while_charging() {
        let recorder = recorder(FakeClock::new(1_000));

        for (second, battery) in [(0, 40), (10, 40), (20, 40)] {
            let id = recorder
                .record(
                    &snapshot(
                        &format!("2026-03-01T10:00:{second:02}.000Z"),
                        battery,
                        true,
                    ),
                    "user-1",
                    None,
                )
                .expect("record should succeed");
            assert!(id.is_some());
        }
    }
}
