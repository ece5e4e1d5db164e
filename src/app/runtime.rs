use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use actix_web::{App, HttpServer, web};

use crate::adapters::api::{ApiState, configure_routes};
use crate::adapters::enode::EnodeClient;
use crate::adapters::push::Notifier;
use crate::app::config::AppConfig;
use crate::app::engine::SessionEngine;
use crate::app::error::AppError;
use crate::app::monitor::{SubscriptionMonitor, start_subscription_monitor};
use crate::app::poller::{VehiclePoller, start_vehicle_poller};
use crate::app::recorder::SampleRecorder;
use crate::domain::caches::{DedupCache, LivenessCache};
use crate::domain::clock::SystemClock;

pub fn run(config: AppConfig) -> Result<(), AppError> {
    let mut connection =
        crate::adapters::db::open_connection(&config.db_path).map_err(AppError::database_init)?;
    crate::adapters::db::run_migrations(&mut connection).map_err(AppError::database_init)?;

    let shared_connection = Arc::new(Mutex::new(connection));
    let dedup = Arc::new(DedupCache::new());
    let liveness = Arc::new(LivenessCache::new());

    // Blocking HTTP clients are built before entering the async runtime;
    // they are only ever driven from background threads.
    let notifier = Arc::new(Notifier::new(config.mobile_push_url.clone()).map_err(AppError::runtime)?);
    let enode = Arc::new(
        EnodeClient::new(
            &config.enode_base_url,
            &config.enode_auth_url,
            &config.enode_client_id,
            &config.enode_client_secret,
        )
        .map_err(AppError::runtime)?,
    );

    let recorder = SampleRecorder::new(
        Arc::clone(&shared_connection),
        Arc::clone(&liveness),
        SystemClock,
    );
    let engine = SessionEngine::new(Arc::clone(&shared_connection));

    let stop_flag = Arc::new(AtomicBool::new(false));

    let poller = VehiclePoller::new(
        Arc::clone(&enode),
        Arc::clone(&shared_connection),
        recorder.clone(),
        engine.clone(),
        Arc::clone(&notifier),
    );
    let poller_handle = start_vehicle_poller(
        poller,
        Duration::from_secs(config.poll_grace_secs),
        Duration::from_secs(config.poll_interval_secs),
        Arc::clone(&stop_flag),
    );

    let monitor = SubscriptionMonitor::new(
        Arc::clone(&enode),
        Arc::clone(&shared_connection),
        config.webhook_url.clone(),
        config.webhook_secret.clone(),
    );
    let monitor_handle = start_subscription_monitor(
        monitor,
        Duration::from_secs(config.monitor_grace_secs),
        Duration::from_secs(config.monitor_interval_secs),
        Arc::clone(&stop_flag),
    );

    let api_state = ApiState {
        connection: Arc::clone(&shared_connection),
        recorder,
        engine,
        dedup,
        liveness,
        notifier,
        webhook_secret: config.webhook_secret.clone(),
    };

    tracing::info!(bind = %config.http_bind, "http server starting");

    let server_result = actix_web::rt::System::new().block_on(async move {
        HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(api_state.clone()))
                .configure(configure_routes)
        })
        .bind(&config.http_bind)?
        .run()
        .await
    });

    stop_flag.store(true, Ordering::Relaxed);

    if poller_handle.join().is_err() {
        return Err(AppError::runtime("vehicle poller thread panicked"));
    }
    if monitor_handle.join().is_err() {
        return Err(AppError::runtime("subscription monitor thread panicked"));
    }

    server_result.map_err(AppError::runtime)
}
