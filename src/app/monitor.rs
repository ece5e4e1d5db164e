use std::sync::{
    Arc, Mutex,
    atomic::AtomicBool,
};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::Value;

use crate::adapters::db;
use crate::adapters::enode::EnodeApi;
use crate::app::poller::wait_or_stop;
use crate::domain::models::SubscriptionRecord;

/// An active subscription with no confirmed delivery for this long is
/// reported as stale.
const STALE_DELIVERY_THRESHOLD_HOURS: i64 = 2;

/// What one monitor pass did, for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CheckReport {
    pub created: bool,
    pub pinged_inactive: u32,
    pub stale: bool,
}

/// Keeps the vendor webhook subscription alive: mirrors the vendor's
/// subscription list locally, recreates the subscription when it disappears,
/// and pings inactive ones so the vendor re-enables delivery.
pub struct SubscriptionMonitor<A> {
    enode: Arc<A>,
    connection: Arc<Mutex<Connection>>,
    webhook_url: String,
    webhook_secret: String,
}

impl<A: EnodeApi> SubscriptionMonitor<A> {
    pub fn new(
        enode: Arc<A>,
        connection: Arc<Mutex<Connection>>,
        webhook_url: String,
        webhook_secret: String,
    ) -> Self {
        Self {
            enode,
            connection,
            webhook_url,
            webhook_secret,
        }
    }

    pub fn run_check(&self) -> CheckReport {
        let mut report = CheckReport::default();

        self.sync_from_vendor();

        let ours: Vec<SubscriptionRecord> = match self.connection.lock() {
            Ok(connection) => match db::list_subscriptions(&connection) {
                Ok(subscriptions) => subscriptions
                    .into_iter()
                    .filter(|s| s.url == self.webhook_url)
                    .collect(),
                Err(error) => {
                    tracing::warn!(error = %error, "failed to read mirrored subscriptions");
                    return report;
                }
            },
            Err(_) => {
                tracing::warn!("database lock poisoned, skipping subscription check");
                return report;
            }
        };

        if ours.is_empty() {
            report.created = self.create_subscription();
            return report;
        }

        for subscription in &ours {
            if !subscription.is_active {
                tracing::warn!(
                    webhook_id = %subscription.enode_webhook_id,
                    "subscription inactive, requesting test delivery"
                );
                match self.enode.test_subscription(&subscription.enode_webhook_id) {
                    Ok(_) => report.pinged_inactive += 1,
                    Err(error) => {
                        tracing::warn!(
                            webhook_id = %subscription.enode_webhook_id,
                            error = %error,
                            "subscription test delivery failed"
                        );
                    }
                }
            } else if is_stale(subscription.last_success.as_deref()) {
                tracing::warn!(
                    webhook_id = %subscription.enode_webhook_id,
                    last_success = ?subscription.last_success,
                    "subscription active but deliveries look stale"
                );
                report.stale = true;
            }
        }

        // A test delivery may have reactivated the subscription; pick up the
        // vendor's new state right away instead of next cycle.
        if report.pinged_inactive > 0 {
            self.sync_from_vendor();
        }

        report
    }

    /// Mirrors the vendor's subscription list into local storage. Failures
    /// are logged; the check then works from the last good mirror.
    fn sync_from_vendor(&self) {
        let subscriptions = match self.enode.list_subscriptions() {
            Ok(subscriptions) => subscriptions,
            Err(error) => {
                tracing::warn!(error = %error, "failed to list vendor subscriptions");
                return;
            }
        };

        let Ok(connection) = self.connection.lock() else {
            tracing::warn!("database lock poisoned, skipping subscription mirror");
            return;
        };

        for payload in subscriptions {
            let Some(record) = subscription_from_payload(&payload) else {
                tracing::warn!("vendor subscription without id, skipping");
                continue;
            };
            if let Err(error) = db::upsert_subscription(&connection, &record) {
                tracing::warn!(
                    webhook_id = %record.enode_webhook_id,
                    error = %error,
                    "failed to mirror subscription"
                );
            }
        }
    }

    fn create_subscription(&self) -> bool {
        tracing::info!(url = %self.webhook_url, "no subscription for our url, creating one");

        match self
            .enode
            .create_subscription(&self.webhook_url, &self.webhook_secret)
        {
            Ok(created) => {
                if let Some(record) = subscription_from_payload(&created)
                    && let Ok(connection) = self.connection.lock()
                    && let Err(error) = db::upsert_subscription(&connection, &record)
                {
                    tracing::warn!(error = %error, "failed to mirror created subscription");
                }
                tracing::info!("webhook subscription created");
                true
            }
            Err(error) => {
                tracing::error!(error = %error, "failed to create webhook subscription");
                false
            }
        }
    }
}

fn subscription_from_payload(payload: &Value) -> Option<SubscriptionRecord> {
    let id = payload.get("id").and_then(Value::as_str)?;

    Some(SubscriptionRecord {
        enode_webhook_id: id.to_string(),
        url: payload
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        events: payload
            .get("events")
            .map(ToString::to_string)
            .unwrap_or_else(|| "[]".to_string()),
        is_active: payload
            .get("isActive")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        api_version: payload
            .get("apiVersion")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        last_success: payload
            .get("lastSuccess")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        created_at: payload
            .get("createdAt")
            .and_then(Value::as_str)
            .map(ToString::to_string),
    })
}

/// No recorded delivery at all counts as stale.
fn is_stale(last_success: Option<&str>) -> bool {
    let Some(last_success) = last_success else {
        return true;
    };
    let Ok(parsed) = DateTime::parse_from_rfc3339(last_success) else {
        return true;
    };
    Utc::now().signed_duration_since(parsed) > chrono::Duration::hours(STALE_DELIVERY_THRESHOLD_HOURS)
}

pub fn start_subscription_monitor<A>(
    monitor: SubscriptionMonitor<A>,
    grace: Duration,
    interval: Duration,
    stop_flag: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    A: EnodeApi + 'static,
{
    std::thread::spawn(move || {
        if wait_or_stop(&stop_flag, grace) {
            return;
        }
        loop {
            monitor.run_check();
            if wait_or_stop(&stop_flag, interval) {
                return;
            }
        }
    })
}
