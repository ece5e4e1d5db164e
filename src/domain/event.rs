use serde_json::Value;

pub const HEARTBEAT: &str = "system:heartbeat";
pub const VEHICLE_DISCOVERED: &str = "user:vehicle:discovered";
pub const VEHICLE_UPDATED: &str = "user:vehicle:updated";

/// A classified webhook event. Vehicle variants keep the raw vehicle object
/// so it can be forwarded downstream unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    Heartbeat,
    VehicleDiscovered(VehicleEvent),
    VehicleUpdated(VehicleEvent),
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VehicleEvent {
    pub event_id: Option<String>,
    pub user_id: Option<String>,
    pub vehicle: Value,
}

pub fn classify(event: &Value) -> WebhookEvent {
    let event_type = event_type(event);

    match event_type {
        HEARTBEAT => WebhookEvent::Heartbeat,
        VEHICLE_DISCOVERED | VEHICLE_UPDATED => {
            let vehicle_event = VehicleEvent {
                event_id: event.get("id").and_then(Value::as_str).map(ToString::to_string),
                user_id: user_id(event).map(ToString::to_string),
                vehicle: event.get("vehicle").cloned().unwrap_or(Value::Null),
            };
            if event_type == VEHICLE_DISCOVERED {
                WebhookEvent::VehicleDiscovered(vehicle_event)
            } else {
                WebhookEvent::VehicleUpdated(vehicle_event)
            }
        }
        other => WebhookEvent::Unknown(other.to_string()),
    }
}

pub fn event_type(event: &Value) -> &str {
    event.get("event").and_then(Value::as_str).unwrap_or("")
}

pub fn vehicle_id(event: &Value) -> Option<&str> {
    event
        .get("vehicle")
        .and_then(|vehicle| vehicle.get("id"))
        .and_then(Value::as_str)
}

pub fn user_id(event: &Value) -> Option<&str> {
    event
        .get("user")
        .and_then(|user| user.get("id"))
        .and_then(Value::as_str)
}

fn vehicle_last_seen(event: &Value) -> &str {
    event
        .get("vehicle")
        .and_then(|vehicle| vehicle.get("lastSeen"))
        .and_then(Value::as_str)
        .unwrap_or("")
}

/// Reduces a webhook batch to at most one vehicle event per vehicle, keeping
/// the one with the most recent vendor-reported `lastSeen`. The vendor orders
/// batches by `createdAt`, not `lastSeen`, so the freshest snapshot can sit
/// anywhere in the batch. Non-vehicle events pass through untouched.
pub fn dedupe_batch_by_latest(events: Vec<Value>) -> Vec<Value> {
    let incoming = events.len();
    let mut passthrough: Vec<Value> = Vec::new();
    let mut latest_by_vehicle: Vec<(String, Value)> = Vec::new();

    for event in events {
        let event_type = event_type(&event);
        if event_type != VEHICLE_DISCOVERED && event_type != VEHICLE_UPDATED {
            passthrough.push(event);
            continue;
        }

        let Some(id) = vehicle_id(&event).map(ToString::to_string) else {
            passthrough.push(event);
            continue;
        };

        match latest_by_vehicle.iter_mut().find(|(existing, _)| *existing == id) {
            Some((_, existing_event)) => {
                // RFC3339 timestamps compare correctly as strings.
                if vehicle_last_seen(&event) > vehicle_last_seen(existing_event) {
                    *existing_event = event;
                }
            }
            None => latest_by_vehicle.push((id, event)),
        }
    }

    let mut result = passthrough;
    result.extend(latest_by_vehicle.into_iter().map(|(_, event)| event));

    if result.len() != incoming {
        tracing::info!(
            incoming,
            kept = result.len(),
            "batch reduced to latest event per vehicle"
        );
    }

    result
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::{WebhookEvent, classify, dedupe_batch_by_latest};

    fn update_event(vehicle_id: &str, last_seen: &str, battery: i64) -> Value {
        json!({
            "event": "user:vehicle:updated",
            "user": {"id": "user-1"},
            "vehicle": {
                "id": vehicle_id,
                "lastSeen": last_seen,
                "chargeState": {"batteryLevel": battery}
            }
        })
    }

    #[test]
    fn classifies_heartbeat() {
        assert_eq!(
            classify(&json!({"event": "system:heartbeat"})),
            WebhookEvent::Heartbeat
        );
    }

    #[test]
    fn classifies_vehicle_update_with_user() {
        let event = classify(&update_event("vehicle-1", "2026-03-01T10:00:00.000Z", 50));
        match event {
            WebhookEvent::VehicleUpdated(vehicle_event) => {
                assert_eq!(vehicle_event.user_id.as_deref(), Some("user-1"));
                assert_eq!(vehicle_event.vehicle["id"], "vehicle-1");
            }
            other => panic!("expected VehicleUpdated, got {other:?}"),
        }
    }

    #[test]
    fn classifies_unknown_event_type() {
        assert_eq!(
            classify(&json!({"event": "user:vendor:action:updated"})),
            WebhookEvent::Unknown("user:vendor:action:updated".to_string())
        );
    }

    #[test]
    fn batch_dedup_keeps_latest_last_seen_in_arbitrary_order() {
        let events = vec![
            update_event("vehicle-1", "2026-03-01T10:02:00.000Z", 52),
            update_event("vehicle-1", "2026-03-01T10:00:00.000Z", 50),
            update_event("vehicle-1", "2026-03-01T10:04:00.000Z", 54),
        ];

        let deduped = dedupe_batch_by_latest(events);

        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0]["vehicle"]["lastSeen"], "2026-03-01T10:04:00.000Z");
        assert_eq!(deduped[0]["vehicle"]["chargeState"]["batteryLevel"], 54);
    }

    #[test]
    fn batch_dedup_passes_heartbeats_and_other_vehicles_through() {
        let events = vec![
            json!({"event": "system:heartbeat"}),
            update_event("vehicle-1", "2026-03-01T10:00:00.000Z", 50),
            update_event("vehicle-2", "2026-03-01T10:00:00.000Z", 70),
        ];

        let deduped = dedupe_batch_by_latest(events);

        assert_eq!(deduped.len(), 3);
    }

    #[test]
    fn batch_dedup_keeps_vehicle_events_without_id() {
        let events = vec![
            json!({"event": "user:vehicle:updated", "vehicle": {}}),
            json!({"event": "user:vehicle:updated", "vehicle": {}}),
        ];

        assert_eq!(dedupe_batch_by_latest(events).len(), 2);
    }
}
