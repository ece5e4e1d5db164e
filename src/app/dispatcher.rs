use serde_json::Value;

use crate::app::engine::SessionEngine;
use crate::app::recorder::SampleRecorder;
use crate::domain::clock::Clock;
use crate::domain::event::{WebhookEvent, classify};
use crate::domain::vehicle::VehicleSnapshot;

/// Outcome of handling one webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// Counts toward the response's handled total.
    pub handled: bool,
    /// A new sample was persisted, so downstream pushes should fire.
    pub recorded: bool,
}

/// Routes one classified webhook event into the recording pipeline.
/// Unparseable or unknown events are logged and skipped, never errors; the
/// vendor retries on non-2xx and a poison event must not wedge the queue.
pub fn process_event<Cl: Clock>(
    event: &Value,
    recorder: &SampleRecorder<Cl>,
    engine: &SessionEngine,
) -> Outcome {
    match classify(event) {
        WebhookEvent::Heartbeat => {
            tracing::debug!("vendor heartbeat received");
            Outcome {
                handled: true,
                recorded: false,
            }
        }
        WebhookEvent::VehicleDiscovered(vehicle) | WebhookEvent::VehicleUpdated(vehicle) => {
            let Some(snapshot) = VehicleSnapshot::from_payload(&vehicle.vehicle) else {
                tracing::warn!("vehicle event without usable vehicle payload");
                return Outcome {
                    handled: false,
                    recorded: false,
                };
            };
            let Some(user_id) = vehicle.user_id.as_deref() else {
                tracing::warn!(vehicle_id = %snapshot.vehicle_id, "vehicle event without user id");
                return Outcome {
                    handled: false,
                    recorded: false,
                };
            };

            let recorded = match recorder.record(
                &snapshot,
                user_id,
                vehicle.event_id.as_deref(),
            ) {
                Ok(Some(_)) => {
                    if let Err(error) = engine.check(&snapshot.vehicle_id, user_id) {
                        tracing::error!(
                            vehicle_id = %snapshot.vehicle_id,
                            error = %error,
                            "session check failed"
                        );
                    }
                    true
                }
                Ok(None) => false,
                Err(error) => {
                    tracing::error!(
                        vehicle_id = %snapshot.vehicle_id,
                        error = %error,
                        "failed to record sample"
                    );
                    false
                }
            };

            Outcome {
                handled: true,
                recorded,
            }
        }
        WebhookEvent::Unknown(event_type) => {
            tracing::warn!(event_type, "unknown webhook event type");
            Outcome {
                handled: false,
                recorded: false,
            }
        }
    }
}
