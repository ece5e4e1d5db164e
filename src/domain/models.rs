#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// One persisted, timestamped snapshot of a vehicle's reported state.
/// Immutable once written; ordered by `sample_time` per vehicle, though
/// out-of-order arrivals are tolerated upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub id: String,
    pub source_event_id: Option<String>,
    pub vehicle_id: String,
    pub user_id: String,
    pub sample_time: String,
    pub created_at: String,
    pub is_charging: Option<bool>,
    pub is_plugged_in: Option<bool>,
    pub is_fully_charged: Option<bool>,
    pub is_reachable: Option<bool>,
    pub battery_level: Option<i64>,
    pub battery_capacity_kwh: Option<f64>,
    pub charge_rate_kw: Option<f64>,
    pub power_delivery_state: Option<String>,
    pub odometer_km: Option<f64>,
    pub location: Option<GeoPoint>,
    pub vin: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub year: Option<i64>,
}

/// A derived charging episode, validated against the minimum battery-increase
/// and minimum-energy thresholds before creation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargingSession {
    pub session_id: String,
    pub vehicle_id: String,
    pub user_id: String,
    pub start_time: String,
    pub end_time: String,
    pub start_battery_level: i64,
    pub end_battery_level: i64,
    pub energy_added_kwh: f64,
    pub duration_minutes: f64,
    pub average_charge_rate_kw: Option<f64>,
    pub max_charge_rate_kw: Option<f64>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub year: Option<i64>,
    pub start_location: Option<GeoPoint>,
    pub end_location: Option<GeoPoint>,
    pub created_at: String,
}

/// Reconciled copy of one upstream webhook subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRecord {
    pub enode_webhook_id: String,
    pub url: String,
    pub events: String,
    pub is_active: bool,
    pub api_version: Option<String>,
    pub last_success: Option<String>,
    pub created_at: Option<String>,
}

/// A user's configured downstream push destination (home-automation webhook).
#[derive(Debug, Clone, PartialEq)]
pub struct PushTarget {
    pub user_id: String,
    pub url: String,
}
