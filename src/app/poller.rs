use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use serde_json::{Value, json};

use crate::adapters::db;
use crate::adapters::enode::EnodeApi;
use crate::adapters::push::{Notifier, spawn_push};
use crate::app::engine::SessionEngine;
use crate::app::recorder::SampleRecorder;
use crate::domain::clock::Clock;
use crate::domain::vehicle::VehicleSnapshot;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    pub users_polled: u32,
    pub vehicles_updated: u32,
    pub errors: u32,
}

/// Active safety net behind the webhook: periodically fetches vehicle state
/// for every known user so missed deliveries cannot leave history with holes.
/// Samples flow through the same recorder, so the staleness and significance
/// filters keep webhook-delivered and polled data from duplicating.
pub struct VehiclePoller<A, Cl> {
    enode: Arc<A>,
    connection: Arc<Mutex<Connection>>,
    recorder: SampleRecorder<Cl>,
    engine: SessionEngine,
    notifier: Arc<Notifier>,
}

impl<A, Cl> VehiclePoller<A, Cl>
where
    A: EnodeApi,
    Cl: Clock,
{
    pub fn new(
        enode: Arc<A>,
        connection: Arc<Mutex<Connection>>,
        recorder: SampleRecorder<Cl>,
        engine: SessionEngine,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            enode,
            connection,
            recorder,
            engine,
            notifier,
        }
    }

    /// Polls every user with a registered push target. Per-user failures are
    /// counted and logged; one broken user never blocks the rest.
    pub fn poll_all(&self) -> PollSummary {
        let targets = match self.connection.lock() {
            Ok(connection) => match db::list_push_targets(&connection) {
                Ok(targets) => targets,
                Err(error) => {
                    tracing::warn!(error = %error, "failed to list poll users");
                    return PollSummary {
                        errors: 1,
                        ..PollSummary::default()
                    };
                }
            },
            Err(_) => {
                tracing::warn!("database lock poisoned, skipping poll cycle");
                return PollSummary {
                    errors: 1,
                    ..PollSummary::default()
                };
            }
        };

        let mut summary = PollSummary::default();
        for target in targets {
            match self.poll_user(&target.user_id, Some(&target.url)) {
                Ok(updated) => {
                    summary.users_polled += 1;
                    summary.vehicles_updated += updated;
                }
                Err(error) => {
                    summary.errors += 1;
                    tracing::warn!(user_id = %target.user_id, error = %error, "user poll failed");
                }
            }
        }

        tracing::info!(
            users_polled = summary.users_polled,
            vehicles_updated = summary.vehicles_updated,
            errors = summary.errors,
            "poll cycle finished"
        );

        summary
    }

    /// Fetches and records one user's vehicles. Returns how many produced a
    /// fresh sample. Fresh polled state is forwarded downstream the same way
    /// a webhook delivery would be.
    pub fn poll_user(
        &self,
        user_id: &str,
        push_url: Option<&str>,
    ) -> Result<u32, crate::adapters::enode::EnodeError> {
        let vehicles = self.enode.user_vehicles(user_id)?;

        let mut updated = 0_u32;
        for vehicle in vehicles {
            let Some(snapshot) = VehicleSnapshot::from_payload(&vehicle) else {
                tracing::warn!(user_id, "polled vehicle without usable payload");
                continue;
            };

            let recorded = match self.recorder.record(&snapshot, user_id, None) {
                Ok(id) => id.is_some(),
                Err(error) => {
                    tracing::error!(
                        vehicle_id = %snapshot.vehicle_id,
                        error = %error,
                        "failed to record polled sample"
                    );
                    continue;
                }
            };
            if !recorded {
                continue;
            }
            updated += 1;

            if let Err(error) = self.engine.check(&snapshot.vehicle_id, user_id) {
                tracing::error!(
                    vehicle_id = %snapshot.vehicle_id,
                    error = %error,
                    "session check failed after poll"
                );
            }

            if let Some(url) = push_url {
                let event = wrap_polled_vehicle(&vehicle, user_id);
                spawn_push(Arc::clone(&self.notifier), url.to_string(), event);
            }
        }

        Ok(updated)
    }
}

/// Wraps a polled vehicle object in the same envelope the vendor webhook
/// uses, so downstream consumers see one format regardless of source.
fn wrap_polled_vehicle(vehicle: &Value, user_id: &str) -> Value {
    json!({
        "event": "user:vehicle:updated",
        "vehicle": vehicle,
        "user": {"id": user_id},
        "createdAt": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "source": "polling",
    })
}

pub fn start_vehicle_poller<A, Cl>(
    poller: VehiclePoller<A, Cl>,
    grace: Duration,
    interval: Duration,
    stop_flag: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    A: EnodeApi + 'static,
    Cl: Clock + Send + 'static,
{
    std::thread::spawn(move || {
        if wait_or_stop(&stop_flag, grace) {
            return;
        }
        loop {
            poller.poll_all();
            if wait_or_stop(&stop_flag, interval) {
                return;
            }
        }
    })
}

/// Sleeps in short slices so shutdown does not wait out a long interval.
/// Returns true when the stop flag was raised.
pub(crate) fn wait_or_stop(stop_flag: &AtomicBool, duration: Duration) -> bool {
    const SLICE: Duration = Duration::from_millis(200);

    let mut remaining = duration;
    while !remaining.is_zero() {
        if stop_flag.load(Ordering::Relaxed) {
            return true;
        }
        let step = remaining.min(SLICE);
        std::thread::sleep(step);
        remaining -= step;
    }

    stop_flag.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::{Value, json};

    use crate::adapters::db;
    use crate::adapters::enode::{EnodeApi, EnodeError};
    use crate::adapters::push::Notifier;
    use crate::app::engine::SessionEngine;
    use crate::app::recorder::SampleRecorder;
    use crate::domain::caches::LivenessCache;
    use crate::domain::clock::SystemClock;
    use crate::test_support::migrated_connection;

    use super::VehiclePoller;

    struct FakeEnode {
        vehicles: Vec<Value>,
        fail_users: Vec<String>,
    }

    impl EnodeApi for FakeEnode {
        fn vehicles(&self) -> Result<Vec<Value>, EnodeError> {
            Ok(self.vehicles.clone())
        }

        fn user_vehicles(&self, user_id: &str) -> Result<Vec<Value>, EnodeError> {
            if self.fail_users.iter().any(|u| u == user_id) {
                return Err(EnodeError::MissingField("data"));
            }
            Ok(self.vehicles.clone())
        }

        fn list_subscriptions(&self) -> Result<Vec<Value>, EnodeError> {
            Ok(Vec::new())
        }

        fn create_subscription(&self, _url: &str, _secret: &str) -> Result<Value, EnodeError> {
            Ok(Value::Null)
        }

        fn delete_subscription(&self, _webhook_id: &str) -> Result<(), EnodeError> {
            Ok(())
        }

        fn test_subscription(&self, _webhook_id: &str) -> Result<Value, EnodeError> {
            Ok(Value::Null)
        }
    }

    fn build_poller(
        fake: FakeEnode,
    ) -> (
        VehiclePoller<FakeEnode, SystemClock>,
        Arc<Mutex<rusqlite::Connection>>,
    ) {
        let connection = Arc::new(Mutex::new(migrated_connection()));
        let recorder = SampleRecorder::new(
            Arc::clone(&connection),
            Arc::new(LivenessCache::new()),
            SystemClock,
        );
        let engine = SessionEngine::new(Arc::clone(&connection));
        let poller = VehiclePoller::new(
            Arc::new(fake),
            Arc::clone(&connection),
            recorder,
            engine,
            Arc::new(Notifier::new(None).expect("notifier should build")),
        );
        (poller, connection)
    }

    fn vehicle(id: &str, battery: i64) -> Value {
        json!({
            "id": id,
            "lastSeen": "2026-03-01T10:00:00.000Z",
            "chargeState": {"isCharging": true, "batteryLevel": battery},
        })
    }

    #[test]
    fn records_polled_vehicles_for_registered_users() {
        let (poller, connection) = build_poller(FakeEnode {
            vehicles: vec![vehicle("vehicle-1", 40), vehicle("vehicle-2", 70)],
            fail_users: Vec::new(),
        });

        {
            let locked = connection.lock().expect("database lock");
            db::upsert_push_target(&locked, "user-1", "http://127.0.0.1:9/webhook")
                .expect("target insert should succeed");
        }

        let summary = poller.poll_all();

        assert_eq!(summary.users_polled, 1);
        assert_eq!(summary.vehicles_updated, 2);
        assert_eq!(summary.errors, 0);

        let locked = connection.lock().expect("database lock");
        let samples: i64 = locked
            .query_row("SELECT COUNT(*) FROM charging_samples", [], |row| row.get(0))
            .expect("count query should succeed");
        assert_eq!(samples, 2);
    }

    #[test]
    fn repeated_poll_of_unchanged_state_records_nothing_new() {
        let idle_vehicle = json!({
            "id": "vehicle-1",
            "lastSeen": "2026-03-01T10:00:00.000Z",
            "chargeState": {"isCharging": false, "batteryLevel": 40},
        });
        let (poller, connection) = build_poller(FakeEnode {
            vehicles: vec![idle_vehicle],
            fail_users: Vec::new(),
        });

        {
            let locked = connection.lock().expect("database lock");
            db::upsert_push_target(&locked, "user-1", "http://127.0.0.1:9/webhook")
                .expect("target insert should succeed");
        }

        let first = poller.poll_all();
        assert_eq!(first.vehicles_updated, 1);

        // Unchanged idle state inside the cache TTL is insignificant.
        let second = poller.poll_all();
        assert_eq!(second.vehicles_updated, 0);
        assert_eq!(second.errors, 0);

        let locked = connection.lock().expect("database lock");
        let samples: i64 = locked
            .query_row("SELECT COUNT(*) FROM charging_samples", [], |row| row.get(0))
            .expect("count query should succeed");
        assert_eq!(samples, 1);
    }

    #[test]
    fn one_failing_user_does_not_block_others() {
        let (poller, connection) = build_poller(FakeEnode {
            vehicles: vec![vehicle("vehicle-1", 40)],
            fail_users: vec!["user-bad".to_string()],
        });

        {
            let locked = connection.lock().expect("database lock");
            db::upsert_push_target(&locked, "user-bad", "http://127.0.0.1:9/a")
                .expect("target insert should succeed");
            db::upsert_push_target(&locked, "user-good", "http://127.0.0.1:9/b")
                .expect("target insert should succeed");
        }

        let summary = poller.poll_all();

        assert_eq!(summary.users_polled, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.vehicles_updated, 1);
    }
}
