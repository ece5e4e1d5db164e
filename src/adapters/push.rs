use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;

use crate::domain::caches::ReachabilityEntry;
use crate::domain::vehicle::VehicleSnapshot;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// State transitions derived from comparing a snapshot against the previously
/// observed reachability entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transitions {
    pub charge_started: bool,
    pub charge_complete: bool,
    pub went_offline: bool,
    pub came_online: bool,
}

impl Transitions {
    pub fn any(&self) -> bool {
        self.charge_started || self.charge_complete || self.went_offline || self.came_online
    }
}

/// Derives notification-worthy transitions. Only fires on an actual flip;
/// the first observation of a vehicle produces nothing.
pub fn derive_transitions(
    snapshot: &VehicleSnapshot,
    previous: Option<&ReachabilityEntry>,
) -> Transitions {
    let Some(previous) = previous else {
        return Transitions::default();
    };

    let was_charging = previous.is_charging.unwrap_or(false);
    let now_charging = snapshot.is_charging.unwrap_or(false);
    let was_reachable = previous.is_reachable.unwrap_or(true);
    let now_reachable = snapshot.is_reachable.unwrap_or(true);
    let was_full = previous.is_fully_charged.unwrap_or(false);
    let now_full = snapshot.is_fully_charged.unwrap_or(false);

    Transitions {
        charge_started: !was_charging && now_charging,
        charge_complete: !was_full && now_full,
        went_offline: was_reachable && !now_reachable,
        came_online: !was_reachable && now_reachable,
    }
}

/// Forwards vehicle updates and transition alerts to per-user downstream
/// webhooks (home automation) and an optional shared mobile push endpoint.
pub struct Notifier {
    http: reqwest::blocking::Client,
    mobile_push_url: Option<String>,
}

impl Notifier {
    pub fn new(mobile_push_url: Option<String>) -> Result<Self, PushError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            mobile_push_url,
        })
    }

    /// POSTs the full event to a user's home-automation webhook. The vehicle
    /// object gets a `displayName` so automations need not assemble one.
    pub fn push_vehicle_event(&self, target_url: &str, event: &Value) -> Result<(), PushError> {
        let mut event = event.clone();
        if let Some(vehicle) = event.get_mut("vehicle").and_then(Value::as_object_mut)
            && !vehicle.contains_key("displayName")
        {
            let name = display_name(vehicle);
            vehicle.insert("displayName".to_string(), Value::String(name));
        }

        self.http
            .post(target_url)
            .json(&event)
            .send()?
            .error_for_status()?;

        Ok(())
    }

    pub fn push_mobile(&self, title: &str, message: &str) -> Result<(), PushError> {
        let Some(url) = &self.mobile_push_url else {
            return Ok(());
        };

        self.http
            .post(url)
            .json(&json!({"title": title, "message": message}))
            .send()?
            .error_for_status()?;

        Ok(())
    }

    /// Sends mobile alerts for every transition that fired. Failures are
    /// logged per alert so one dead endpoint cannot mask the rest.
    pub fn notify_transitions(
        &self,
        snapshot: &VehicleSnapshot,
        transitions: Transitions,
    ) {
        let name = snapshot
            .brand
            .clone()
            .or_else(|| snapshot.model.clone())
            .unwrap_or_else(|| snapshot.vehicle_id.clone());

        let mut alerts: Vec<(&str, String)> = Vec::new();
        if transitions.charge_started {
            alerts.push(("Charging started", format!("{name} started charging")));
        }
        if transitions.charge_complete {
            alerts.push(("Charging complete", format!("{name} is fully charged")));
        }
        if transitions.went_offline {
            alerts.push(("Vehicle offline", format!("{name} became unreachable")));
        }
        if transitions.came_online {
            alerts.push(("Vehicle online", format!("{name} is reachable again")));
        }

        for (title, message) in alerts {
            if let Err(error) = self.push_mobile(title, &message) {
                tracing::warn!(
                    vehicle_id = %snapshot.vehicle_id,
                    title,
                    error = %error,
                    "mobile push failed"
                );
            }
        }
    }
}

/// Fire-and-forget delivery on a detached thread. Webhook handling must not
/// block on downstream endpoints.
pub fn spawn_push(notifier: Arc<Notifier>, target_url: String, event: Value) {
    std::thread::spawn(move || {
        if let Err(error) = notifier.push_vehicle_event(&target_url, &event) {
            tracing::warn!(target_url, error = %error, "downstream push failed");
        }
    });
}

fn display_name(vehicle: &serde_json::Map<String, Value>) -> String {
    let information = vehicle.get("information").and_then(Value::as_object);
    let brand = information
        .and_then(|o| o.get("brand"))
        .and_then(Value::as_str);
    let model = information
        .and_then(|o| o.get("model"))
        .and_then(Value::as_str);

    match (brand, model) {
        (Some(brand), Some(model)) => format!("{brand} {model}"),
        (Some(brand), None) => brand.to_string(),
        (None, Some(model)) => model.to_string(),
        (None, None) => "Vehicle".to_string(),
    }
}
