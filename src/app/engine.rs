use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration, SecondsFormat, Utc};
use rusqlite::Connection;
use thiserror::Error;

use crate::adapters::db::{self, DbError};
use crate::domain::models::ChargingSession;
use crate::domain::session_detect::{build_session, charge_ended, scan_forward, trace_back};

/// How many recent samples feed the end-of-charge check.
const DETECT_WINDOW: u32 = 50;
/// How many recent samples feed the backward session reconstruction.
const FINALIZE_WINDOW: u32 = 200;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("database lock poisoned")]
    DbLockPoisoned,
    #[error("database operation failed: {0}")]
    Database(#[from] DbError),
}

/// Derives charging sessions from stored telemetry, both incrementally after
/// each new sample and in bulk over history.
#[derive(Clone)]
pub struct SessionEngine {
    connection: Arc<Mutex<Connection>>,
}

impl SessionEngine {
    pub fn new(connection: Arc<Mutex<Connection>>) -> Self {
        Self { connection }
    }

    /// Called after a sample lands: if the newest samples show a charge that
    /// just ended, reconstructs and persists the session.
    pub fn check(
        &self,
        vehicle_id: &str,
        user_id: &str,
    ) -> Result<Option<ChargingSession>, EngineError> {
        let connection = self
            .connection
            .lock()
            .map_err(|_| EngineError::DbLockPoisoned)?;

        let samples = db::recent_samples(&connection, vehicle_id, DETECT_WINDOW)?;
        let Some(reason) = charge_ended(&samples) else {
            return Ok(None);
        };

        tracing::info!(vehicle_id, ?reason, "charge end detected");

        Self::finalize_locked(&connection, vehicle_id, user_id)
    }

    fn finalize_locked(
        connection: &Connection,
        vehicle_id: &str,
        user_id: &str,
    ) -> Result<Option<ChargingSession>, EngineError> {
        let samples = db::recent_samples(connection, vehicle_id, FINALIZE_WINDOW)?;
        if samples.len() < 2 {
            return Ok(None);
        }

        let Some(draft) = trace_back(&samples) else {
            return Ok(None);
        };
        let Some(session) = build_session(vehicle_id, user_id, &draft) else {
            return Ok(None);
        };

        if db::session_exists_since(connection, vehicle_id, &session.start_time)? {
            tracing::debug!(
                vehicle_id,
                start_time = %session.start_time,
                "session already recorded, skipping"
            );
            return Ok(None);
        }

        db::insert_session(connection, &session)?;

        tracing::info!(
            vehicle_id,
            session_id = %session.session_id,
            start_battery = session.start_battery_level,
            end_battery = session.end_battery_level,
            energy_added_kwh = session.energy_added_kwh,
            duration_minutes = session.duration_minutes,
            "charging session persisted"
        );

        Ok(Some(session))
    }

    /// Rebuilds sessions from stored samples over the last `days_back` days.
    /// Returns per-vehicle counts of newly inserted sessions. Existing
    /// sessions are never touched; the duplicate guard skips periods already
    /// covered.
    pub fn regenerate(&self, days_back: u32) -> Result<HashMap<String, u32>, EngineError> {
        let cutoff = (Utc::now() - Duration::days(i64::from(days_back)))
            .to_rfc3339_opts(SecondsFormat::Millis, true);

        let connection = self
            .connection
            .lock()
            .map_err(|_| EngineError::DbLockPoisoned)?;

        let samples = db::samples_since(&connection, &cutoff)?;

        let mut by_vehicle: HashMap<String, (String, Vec<_>)> = HashMap::new();
        for sample in samples {
            let entry = by_vehicle
                .entry(sample.vehicle_id.clone())
                .or_insert_with(|| (sample.user_id.clone(), Vec::new()));
            entry.1.push(sample);
        }

        let mut inserted = HashMap::new();
        for (vehicle_id, (user_id, samples)) in by_vehicle {
            let mut count = 0_u32;
            for session in scan_forward(&vehicle_id, &user_id, &samples) {
                if db::session_exists_since(&connection, &vehicle_id, &session.start_time)? {
                    continue;
                }
                db::insert_session(&connection, &session)?;
                count += 1;
            }
            if count > 0 {
                tracing::info!(vehicle_id = %vehicle_id, count, "regenerated sessions");
            }
            inserted.insert(vehicle_id, count);
        }

        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use crate::adapters::db;
    use crate::domain::caches::LivenessCache;
    use crate::domain::clock::SystemClock;
    use crate::domain::vehicle::VehicleSnapshot;
    use crate::app::recorder::SampleRecorder;
    use crate::test_support::migrated_connection;

    use super::SessionEngine;

    fn snapshot(minute: u32, battery: i64, charging: bool) -> VehicleSnapshot {
        VehicleSnapshot::from_payload(&json!({
            "id": "vehicle-1",
            "lastSeen": format!("2026-03-01T10:{minute:02}:00.000Z"),
            "chargeState": {
                "isCharging": charging,
                "batteryLevel": battery,
                "batteryCapacity": 60.0,
            },
        }))
        .expect("snapshot should extract")
    }

    #[test]
    fn detects_and_persists_session_end_to_end() {
        let connection = Arc::new(Mutex::new(migrated_connection()));
        let recorder = SampleRecorder::new(
            Arc::clone(&connection),
            Arc::new(LivenessCache::new()),
            SystemClock,
        );
        let engine = SessionEngine::new(Arc::clone(&connection));

        // Idle, then a 20 -> 50 charge, then the post-charge dip to 49.
        let trace = [
            (0, 20, false),
            (10, 20, true),
            (20, 35, true),
            (30, 50, true),
            (40, 49, false),
        ];

        let mut session = None;
        for (minute, battery, charging) in trace {
            recorder
                .record(&snapshot(minute, battery, charging), "user-1", None)
                .expect("record should succeed");
            if let Some(found) = engine
                .check("vehicle-1", "user-1")
                .expect("check should succeed")
            {
                session = Some(found);
            }
        }

        let session = session.expect("session should be detected");
        assert_eq!(session.start_battery_level, 20);
        assert_eq!(session.end_battery_level, 50);
        assert_eq!(session.start_time, "2026-03-01T10:10:00.000Z");
        assert_eq!(session.end_time, "2026-03-01T10:30:00.000Z");
        assert!((session.energy_added_kwh - 18.0).abs() < 1e-9);
        assert!((session.duration_minutes - 20.0).abs() < 1e-9);

        // A repeat check after the same data must not duplicate it.
        let repeat = engine
            .check("vehicle-1", "user-1")
            .expect("check should succeed");
        assert!(repeat.is_none());

        let locked = connection.lock().expect("database lock");
        let count: i64 = locked
            .query_row("SELECT COUNT(*) FROM charging_sessions", [], |row| {
                row.get(0)
            })
            .expect("count query should succeed");
        assert_eq!(count, 1);
    }

    #[test]
    fn check_is_quiet_without_a_charge_end() {
        let connection = Arc::new(Mutex::new(migrated_connection()));
        let recorder = SampleRecorder::new(
            Arc::clone(&connection),
            Arc::new(LivenessCache::new()),
            SystemClock,
        );
        let engine = SessionEngine::new(Arc::clone(&connection));

        recorder
            .record(&snapshot(0, 20, true), "user-1", None)
            .expect("record should succeed");
        recorder
            .record(&snapshot(10, 30, true), "user-1", None)
            .expect("record should succeed");

        let result = engine
            .check("vehicle-1", "user-1")
            .expect("check should succeed");
        assert!(result.is_none());
    }

    #[test]
    fn regenerate_rebuilds_history_without_duplicates() {
        let connection = Arc::new(Mutex::new(migrated_connection()));
        let engine = SessionEngine::new(Arc::clone(&connection));

        {
            let locked = connection.lock().expect("database lock");
            let now = chrono::Utc::now();
            let trace = [
                (300, 20, false),
                (290, 35, true),
                (280, 50, true),
                (270, 49, false),
                (200, 30, false),
                (190, 55, true),
                (180, 70, true),
                (170, 69, false),
            ];
            for (minutes_ago, battery, charging) in trace {
                let time = (now - chrono::Duration::minutes(minutes_ago))
                    .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
                let snapshot = VehicleSnapshot::from_payload(&json!({
                    "id": "vehicle-1",
                    "lastSeen": time,
                    "chargeState": {
                        "isCharging": charging,
                        "batteryLevel": battery,
                        "batteryCapacity": 60.0,
                    },
                }))
                .expect("snapshot should extract");

                let sample = crate::domain::models::TelemetrySample {
                    id: uuid::Uuid::new_v4().to_string(),
                    source_event_id: None,
                    vehicle_id: snapshot.vehicle_id.clone(),
                    user_id: "user-1".to_string(),
                    sample_time: time.clone(),
                    created_at: time,
                    is_charging: snapshot.is_charging,
                    is_plugged_in: None,
                    is_fully_charged: None,
                    is_reachable: None,
                    battery_level: snapshot.battery_level,
                    battery_capacity_kwh: snapshot.battery_capacity_kwh,
                    charge_rate_kw: None,
                    power_delivery_state: None,
                    odometer_km: None,
                    location: None,
                    vin: None,
                    brand: None,
                    model: None,
                    year: None,
                };
                db::insert_sample(&locked, &sample).expect("insert should succeed");
            }
        }

        let first = engine.regenerate(7).expect("regenerate should succeed");
        assert_eq!(first.get("vehicle-1"), Some(&2));

        let second = engine.regenerate(7).expect("regenerate should succeed");
        assert_eq!(second.get("vehicle-1"), Some(&0));
    }
}
