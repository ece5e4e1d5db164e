use serde_json::{Map, Value};

use crate::domain::models::GeoPoint;

/// A vehicle state snapshot extracted from a vendor payload.
///
/// The vendor emits loosely-typed nested JSON; everything except the vehicle
/// identifier is optional and extracted with explicit defaults rather than
/// threading an untyped map through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleSnapshot {
    pub vehicle_id: String,
    pub vin: Option<String>,
    pub last_seen: Option<String>,
    pub is_reachable: Option<bool>,
    pub is_charging: Option<bool>,
    pub is_plugged_in: Option<bool>,
    pub is_fully_charged: Option<bool>,
    pub battery_level: Option<i64>,
    pub battery_capacity_kwh: Option<f64>,
    pub charge_rate_kw: Option<f64>,
    pub power_delivery_state: Option<String>,
    pub odometer_km: Option<f64>,
    pub location: Option<GeoPoint>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub year: Option<i64>,
}

impl VehicleSnapshot {
    /// Extracts a snapshot from a vendor vehicle object. Returns `None` when
    /// no vehicle identifier is present.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let object = payload.as_object()?;

        let vehicle_id = find_string(object, &["id", "vehicle_id"])?;

        let charge_state = nested_object(object, "chargeState");
        let information = nested_object(object, "information");
        let odometer = nested_object(object, "odometer");

        Some(Self {
            vehicle_id,
            vin: information.and_then(|o| find_string(o, &["vin"])),
            last_seen: find_string(object, &["lastSeen"]),
            is_reachable: object.get("isReachable").and_then(Value::as_bool),
            is_charging: field_bool(charge_state, "isCharging"),
            is_plugged_in: field_bool(charge_state, "isPluggedIn"),
            is_fully_charged: field_bool(charge_state, "isFullyCharged"),
            battery_level: field_i64(charge_state, "batteryLevel"),
            battery_capacity_kwh: field_f64(charge_state, "batteryCapacity"),
            charge_rate_kw: field_f64(charge_state, "chargeRate"),
            power_delivery_state: charge_state.and_then(|o| find_string(o, &["powerDeliveryState"])),
            odometer_km: field_f64(odometer, "distance"),
            location: extract_location(object),
            brand: information.and_then(|o| find_string(o, &["brand"])),
            model: information.and_then(|o| find_string(o, &["model"])),
            year: field_i64(information, "year"),
        })
    }
}

fn nested_object<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Map<String, Value>> {
    object.get(key).and_then(Value::as_object)
}

fn find_string(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .map(ToString::to_string)
}

fn field_bool(object: Option<&Map<String, Value>>, key: &str) -> Option<bool> {
    object.and_then(|o| o.get(key)).and_then(Value::as_bool)
}

fn field_i64(object: Option<&Map<String, Value>>, key: &str) -> Option<i64> {
    object.and_then(|o| o.get(key)).and_then(Value::as_i64)
}

fn field_f64(object: Option<&Map<String, Value>>, key: &str) -> Option<f64> {
    object.and_then(|o| o.get(key)).and_then(Value::as_f64)
}

fn extract_location(object: &Map<String, Value>) -> Option<GeoPoint> {
    let location = nested_object(object, "location")?;
    let latitude = location.get("latitude").and_then(Value::as_f64)?;
    let longitude = location.get("longitude").and_then(Value::as_f64)?;
    Some(GeoPoint {
        latitude,
        longitude,
    })
}
