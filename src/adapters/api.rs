use std::sync::{Arc, Mutex};

use actix_web::{HttpRequest, HttpResponse, Responder, get, post, web};
use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::adapters::db;
use crate::adapters::push::{Notifier, derive_transitions, spawn_push};
use crate::app::dispatcher::process_event;
use crate::app::engine::SessionEngine;
use crate::app::recorder::SampleRecorder;
use crate::domain::caches::{DedupCache, LivenessCache, ReachabilityEntry};
use crate::domain::clock::{Clock, SystemClock};
use crate::domain::event::{self, WebhookEvent, classify};
use crate::domain::signature::verify_signature;
use crate::domain::vehicle::VehicleSnapshot;

const SIGNATURE_HEADER: &str = "X-Enode-Signature";

#[derive(Clone)]
pub struct ApiState {
    pub connection: Arc<Mutex<Connection>>,
    pub recorder: SampleRecorder<SystemClock>,
    pub engine: SessionEngine,
    pub dedup: Arc<DedupCache>,
    pub liveness: Arc<LivenessCache>,
    pub notifier: Arc<Notifier>,
    pub webhook_secret: String,
}

#[derive(Debug, Deserialize)]
pub struct RegenerateQuery {
    pub days: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct PushTargetBody {
    pub user_id: String,
    pub url: String,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(receive_webhook)
        .service(register_push_target_endpoint)
        .service(regenerate_sessions_endpoint);
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

/// Vendor webhook intake. Signature failures return 401 so the vendor keeps
/// retrying against a misconfigured secret rather than silently dropping
/// deliveries; malformed JSON is rejected with 400 and never retried into
/// the pipeline.
#[post("/webhook/enode")]
async fn receive_webhook(
    state: web::Data<ApiState>,
    request: HttpRequest,
    body: web::Bytes,
) -> impl Responder {
    let signature = request
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    if !verify_signature(&state.webhook_secret, &body, signature) {
        tracing::warn!("webhook signature verification failed");
        return HttpResponse::Unauthorized().json(json!({ "error": "invalid signature" }));
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(error = %error, "webhook payload is not valid json");
            return HttpResponse::BadRequest().json(json!({ "error": "invalid payload" }));
        }
    };

    audit_payload(&state, &payload);

    let events = match payload {
        Value::Array(batch) => event::dedupe_batch_by_latest(batch),
        single => vec![single],
    };

    let mut handled = 0_u32;
    for incoming in events {
        let now = SystemClock.now();
        if !state.dedup.should_process(
            event::vehicle_id(&incoming),
            event::event_type(&incoming),
            now,
        ) {
            tracing::debug!(
                vehicle_id = ?event::vehicle_id(&incoming),
                "duplicate delivery suppressed"
            );
            continue;
        }

        let outcome = process_event(&incoming, &state.recorder, &state.engine);
        if outcome.handled {
            handled += 1;
        }
        if outcome.recorded {
            schedule_pushes(&state, &incoming);
        }
    }

    HttpResponse::Ok().json(json!({ "status": "ok", "handled": handled }))
}

/// Registers or replaces a user's downstream push destination. Users with a
/// target here are also the ones the fallback poller covers.
#[post("/admin/push-targets")]
async fn register_push_target_endpoint(
    state: web::Data<ApiState>,
    body: web::Json<PushTargetBody>,
) -> impl Responder {
    let result = match state.connection.lock() {
        Ok(connection) => db::upsert_push_target(&connection, &body.user_id, &body.url),
        Err(_) => {
            return HttpResponse::InternalServerError()
                .json(json!({ "error": "database lock poisoned" }));
        }
    };

    match result {
        Ok(()) => {
            tracing::info!(user_id = %body.user_id, "push target registered");
            HttpResponse::Ok().json(json!({ "status": "ok" }))
        }
        Err(error) => {
            tracing::error!(error = %error, "failed to store push target");
            HttpResponse::InternalServerError()
                .json(json!({ "error": format!("store failed: {error}") }))
        }
    }
}

/// Rebuilds sessions from stored samples. Additive only; existing sessions
/// are left alone.
#[post("/admin/sessions/regenerate")]
async fn regenerate_sessions_endpoint(
    state: web::Data<ApiState>,
    query: web::Query<RegenerateQuery>,
) -> impl Responder {
    let days = query.days.unwrap_or(30).clamp(1, 365);

    match state.engine.regenerate(days) {
        Ok(inserted) => {
            let total: u32 = inserted.values().sum();
            HttpResponse::Ok().json(json!({
                "status": "ok",
                "days": days,
                "inserted": total,
                "vehicles": inserted,
            }))
        }
        Err(error) => {
            tracing::error!(error = %error, "session regeneration failed");
            HttpResponse::InternalServerError().json(json!({
                "error": format!("regeneration failed: {error}")
            }))
        }
    }
}

/// Best-effort audit trail. A failed audit write must never reject the
/// delivery.
fn audit_payload(state: &ApiState, payload: &Value) {
    let event_type = match payload {
        Value::Array(_) => "batch",
        single => event::event_type(single),
    };
    let received_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

    let result = match state.connection.lock() {
        Ok(connection) => db::insert_webhook_event(
            &connection,
            event_type,
            &received_at,
            &payload.to_string(),
        ),
        Err(_) => {
            tracing::warn!("database lock poisoned, skipping webhook audit record");
            return;
        }
    };

    if let Err(error) = result {
        tracing::warn!(error = %error, "failed to persist webhook audit record");
    }
}

/// Forwards a freshly recorded event downstream: the user's home-automation
/// webhook gets the full event, and reachability or charge transitions fire
/// mobile alerts. All delivery happens on detached threads.
fn schedule_pushes(state: &ApiState, incoming: &Value) {
    let vehicle = match classify(incoming) {
        WebhookEvent::VehicleDiscovered(vehicle) | WebhookEvent::VehicleUpdated(vehicle) => vehicle,
        _ => return,
    };
    let Some(snapshot) = VehicleSnapshot::from_payload(&vehicle.vehicle) else {
        return;
    };
    let Some(user_id) = vehicle.user_id.as_deref() else {
        return;
    };

    let previous = state.liveness.swap_reachability(
        &snapshot.vehicle_id,
        ReachabilityEntry {
            is_charging: snapshot.is_charging,
            is_reachable: snapshot.is_reachable,
            is_fully_charged: snapshot.is_fully_charged,
        },
    );

    let target = match state.connection.lock() {
        Ok(connection) => match db::get_push_target(&connection, user_id) {
            Ok(target) => target,
            Err(error) => {
                tracing::warn!(user_id, error = %error, "push target lookup failed");
                None
            }
        },
        Err(_) => {
            tracing::warn!("database lock poisoned, skipping downstream push");
            None
        }
    };

    if let Some(target) = target {
        spawn_push(Arc::clone(&state.notifier), target.url, incoming.clone());
    }

    let transitions = derive_transitions(&snapshot, previous.as_ref());
    if transitions.any() {
        let notifier = Arc::clone(&state.notifier);
        std::thread::spawn(move || {
            notifier.notify_transitions(&snapshot, transitions);
        });
    }
}
