use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;

use crate::domain::models::{
    ChargingSession, GeoPoint, PushTarget, SubscriptionRecord, TelemetrySample,
};

pub const LATEST_SCHEMA_VERSION: u32 = 1;

const MIGRATIONS: &[(u32, &str)] = &[(
    1,
    r#"
CREATE TABLE IF NOT EXISTS charging_samples (
    id TEXT PRIMARY KEY,
    source_event_id TEXT,
    vehicle_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    sample_time TEXT NOT NULL,
    created_at TEXT NOT NULL,
    is_charging INTEGER,
    is_plugged_in INTEGER,
    is_fully_charged INTEGER,
    is_reachable INTEGER,
    battery_level INTEGER,
    battery_capacity_kwh REAL,
    charge_rate_kw REAL,
    power_delivery_state TEXT,
    odometer_km REAL,
    latitude REAL,
    longitude REAL,
    vin TEXT,
    brand TEXT,
    model TEXT,
    year INTEGER
);

CREATE INDEX IF NOT EXISTS idx_samples_vehicle_time_desc
ON charging_samples (vehicle_id, sample_time DESC);

CREATE TABLE IF NOT EXISTS charging_sessions (
    session_id TEXT PRIMARY KEY,
    vehicle_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    start_battery_level INTEGER NOT NULL,
    end_battery_level INTEGER NOT NULL,
    energy_added_kwh REAL NOT NULL,
    duration_minutes REAL NOT NULL,
    average_charge_rate_kw REAL,
    max_charge_rate_kw REAL,
    brand TEXT,
    model TEXT,
    year INTEGER,
    start_latitude REAL,
    start_longitude REAL,
    end_latitude REAL,
    end_longitude REAL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_vehicle_start
ON charging_sessions (vehicle_id, start_time);

CREATE TABLE IF NOT EXISTS webhook_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    received_at TEXT NOT NULL,
    payload TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS webhook_subscriptions (
    enode_webhook_id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    events TEXT NOT NULL,
    is_active INTEGER NOT NULL,
    api_version TEXT,
    last_success TEXT,
    created_at TEXT
);

CREATE TABLE IF NOT EXISTS push_targets (
    user_id TEXT PRIMARY KEY,
    url TEXT NOT NULL
);
"#,
)];

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database operation failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported schema version {current}; latest supported is {latest}")]
    UnsupportedSchemaVersion { current: u32, latest: u32 },
}

pub fn open_connection(path: &str) -> Result<Connection, DbError> {
    Connection::open(path).map_err(DbError::from)
}

pub fn run_migrations(connection: &mut Connection) -> Result<(), DbError> {
    let current_version = schema_version(connection)?;

    if current_version > LATEST_SCHEMA_VERSION {
        return Err(DbError::UnsupportedSchemaVersion {
            current: current_version,
            latest: LATEST_SCHEMA_VERSION,
        });
    }

    let transaction = connection.transaction()?;

    for (version, sql) in MIGRATIONS {
        if *version > current_version {
            transaction.execute_batch(sql)?;
            transaction.pragma_update(None, "user_version", version)?;
        }
    }

    transaction.commit()?;

    Ok(())
}

pub fn schema_version(connection: &Connection) -> Result<u32, DbError> {
    let version = connection.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

const SAMPLE_COLUMNS: &str = "id, source_event_id, vehicle_id, user_id, sample_time, created_at, \
     is_charging, is_plugged_in, is_fully_charged, is_reachable, battery_level, \
     battery_capacity_kwh, charge_rate_kw, power_delivery_state, odometer_km, \
     latitude, longitude, vin, brand, model, year";

fn sample_from_row(row: &Row<'_>) -> rusqlite::Result<TelemetrySample> {
    let latitude: Option<f64> = row.get(15)?;
    let longitude: Option<f64> = row.get(16)?;
    Ok(TelemetrySample {
        id: row.get(0)?,
        source_event_id: row.get(1)?,
        vehicle_id: row.get(2)?,
        user_id: row.get(3)?,
        sample_time: row.get(4)?,
        created_at: row.get(5)?,
        is_charging: row.get(6)?,
        is_plugged_in: row.get(7)?,
        is_fully_charged: row.get(8)?,
        is_reachable: row.get(9)?,
        battery_level: row.get(10)?,
        battery_capacity_kwh: row.get(11)?,
        charge_rate_kw: row.get(12)?,
        power_delivery_state: row.get(13)?,
        odometer_km: row.get(14)?,
        location: match (latitude, longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoPoint {
                latitude,
                longitude,
            }),
            _ => None,
        },
        vin: row.get(17)?,
        brand: row.get(18)?,
        model: row.get(19)?,
        year: row.get(20)?,
    })
}

pub fn insert_sample(connection: &Connection, sample: &TelemetrySample) -> Result<(), DbError> {
    connection.execute(
        "INSERT INTO charging_samples (id, source_event_id, vehicle_id, user_id, sample_time, \
         created_at, is_charging, is_plugged_in, is_fully_charged, is_reachable, battery_level, \
         battery_capacity_kwh, charge_rate_kw, power_delivery_state, odometer_km, latitude, \
         longitude, vin, brand, model, year) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
        params![
            sample.id,
            sample.source_event_id,
            sample.vehicle_id,
            sample.user_id,
            sample.sample_time,
            sample.created_at,
            sample.is_charging,
            sample.is_plugged_in,
            sample.is_fully_charged,
            sample.is_reachable,
            sample.battery_level,
            sample.battery_capacity_kwh,
            sample.charge_rate_kw,
            sample.power_delivery_state,
            sample.odometer_km,
            sample.location.map(|p| p.latitude),
            sample.location.map(|p| p.longitude),
            sample.vin,
            sample.brand,
            sample.model,
            sample.year,
        ],
    )?;

    Ok(())
}

/// Newest samples for one vehicle, descending by sample time.
pub fn recent_samples(
    connection: &Connection,
    vehicle_id: &str,
    limit: u32,
) -> Result<Vec<TelemetrySample>, DbError> {
    let mut statement = connection.prepare(&format!(
        "SELECT {SAMPLE_COLUMNS} FROM charging_samples \
         WHERE vehicle_id = ?1 \
         ORDER BY sample_time DESC \
         LIMIT ?2"
    ))?;

    let rows = statement.query_map(params![vehicle_id, i64::from(limit)], sample_from_row)?;

    let mut samples = Vec::new();
    for row in rows {
        samples.push(row?);
    }

    Ok(samples)
}

/// All samples at or after the cutoff, ascending by sample time, for
/// history-wide regeneration.
pub fn samples_since(connection: &Connection, cutoff: &str) -> Result<Vec<TelemetrySample>, DbError> {
    let mut statement = connection.prepare(&format!(
        "SELECT {SAMPLE_COLUMNS} FROM charging_samples \
         WHERE sample_time >= ?1 \
         ORDER BY sample_time ASC"
    ))?;

    let rows = statement.query_map(params![cutoff], sample_from_row)?;

    let mut samples = Vec::new();
    for row in rows {
        samples.push(row?);
    }

    Ok(samples)
}

/// Newest stored sample time for a vehicle, matching by vehicle id or, when
/// known, by VIN. The VIN match catches vehicles that were re-linked upstream
/// under a new id.
pub fn latest_sample_time(
    connection: &Connection,
    vehicle_id: &str,
    vin: Option<&str>,
) -> Result<Option<String>, DbError> {
    let newest = match vin {
        Some(vin) => connection
            .query_row(
                "SELECT sample_time FROM charging_samples \
                 WHERE vehicle_id = ?1 OR vin = ?2 \
                 ORDER BY sample_time DESC \
                 LIMIT 1",
                params![vehicle_id, vin],
                |row| row.get(0),
            )
            .optional()?,
        None => connection
            .query_row(
                "SELECT sample_time FROM charging_samples \
                 WHERE vehicle_id = ?1 \
                 ORDER BY sample_time DESC \
                 LIMIT 1",
                params![vehicle_id],
                |row| row.get(0),
            )
            .optional()?,
    };

    Ok(newest)
}

pub fn insert_session(connection: &Connection, session: &ChargingSession) -> Result<(), DbError> {
    connection.execute(
        "INSERT INTO charging_sessions (session_id, vehicle_id, user_id, start_time, end_time, \
         start_battery_level, end_battery_level, energy_added_kwh, duration_minutes, \
         average_charge_rate_kw, max_charge_rate_kw, brand, model, year, start_latitude, \
         start_longitude, end_latitude, end_longitude, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        params![
            session.session_id,
            session.vehicle_id,
            session.user_id,
            session.start_time,
            session.end_time,
            session.start_battery_level,
            session.end_battery_level,
            session.energy_added_kwh,
            session.duration_minutes,
            session.average_charge_rate_kw,
            session.max_charge_rate_kw,
            session.brand,
            session.model,
            session.year,
            session.start_location.map(|p| p.latitude),
            session.start_location.map(|p| p.longitude),
            session.end_location.map(|p| p.latitude),
            session.end_location.map(|p| p.longitude),
            session.created_at,
        ],
    )?;

    Ok(())
}

/// True when a session for the vehicle already starts at or after the given
/// time. Used as the duplicate guard before inserting a derived session.
pub fn session_exists_since(
    connection: &Connection,
    vehicle_id: &str,
    start_time: &str,
) -> Result<bool, DbError> {
    let count: i64 = connection.query_row(
        "SELECT COUNT(*) FROM charging_sessions \
         WHERE vehicle_id = ?1 AND start_time >= ?2",
        params![vehicle_id, start_time],
        |row| row.get(0),
    )?;

    Ok(count > 0)
}

pub fn insert_webhook_event(
    connection: &Connection,
    event_type: &str,
    received_at: &str,
    payload: &str,
) -> Result<(), DbError> {
    connection.execute(
        "INSERT INTO webhook_events (event_type, received_at, payload) VALUES (?1, ?2, ?3)",
        params![event_type, received_at, payload],
    )?;

    Ok(())
}

pub fn upsert_subscription(
    connection: &Connection,
    record: &SubscriptionRecord,
) -> Result<(), DbError> {
    connection.execute(
        "INSERT INTO webhook_subscriptions \
         (enode_webhook_id, url, events, is_active, api_version, last_success, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
         ON CONFLICT(enode_webhook_id) DO UPDATE SET \
         url = excluded.url, events = excluded.events, is_active = excluded.is_active, \
         api_version = excluded.api_version, last_success = excluded.last_success, \
         created_at = excluded.created_at",
        params![
            record.enode_webhook_id,
            record.url,
            record.events,
            record.is_active,
            record.api_version,
            record.last_success,
            record.created_at,
        ],
    )?;

    Ok(())
}

pub fn list_subscriptions(connection: &Connection) -> Result<Vec<SubscriptionRecord>, DbError> {
    let mut statement = connection.prepare(
        "SELECT enode_webhook_id, url, events, is_active, api_version, last_success, created_at \
         FROM webhook_subscriptions \
         ORDER BY enode_webhook_id",
    )?;

    let rows = statement.query_map([], |row| {
        Ok(SubscriptionRecord {
            enode_webhook_id: row.get(0)?,
            url: row.get(1)?,
            events: row.get(2)?,
            is_active: row.get(3)?,
            api_version: row.get(4)?,
            last_success: row.get(5)?,
            created_at: row.get(6)?,
        })
    })?;

    let mut subscriptions = Vec::new();
    for row in rows {
        subscriptions.push(row?);
    }

    Ok(subscriptions)
}

pub fn upsert_push_target(
    connection: &Connection,
    user_id: &str,
    url: &str,
) -> Result<(), DbError> {
    connection.execute(
        "INSERT INTO push_targets (user_id, url) VALUES (?1, ?2) \
         ON CONFLICT(user_id) DO UPDATE SET url = excluded.url",
        params![user_id, url],
    )?;

    Ok(())
}

pub fn list_push_targets(connection: &Connection) -> Result<Vec<PushTarget>, DbError> {
    let mut statement =
        connection.prepare("SELECT user_id, url FROM push_targets ORDER BY user_id")?;

    let rows = statement.query_map([], |row| {
        Ok(PushTarget {
            user_id: row.get(0)?,
            url: row.get(1)?,
        })
    })?;

    let mut targets = Vec::new();
    for row in rows {
        targets.push(row?);
    }

    Ok(targets)
}

pub fn get_push_target(
    connection: &Connection,
    user_id: &str,
) -> Result<Option<PushTarget>, DbError> {
    let target = connection
        .query_row(
            "SELECT user_id, url FROM push_targets WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(PushTarget {
                    user_id: row.get(0)?,
                    url: row.get(1)?,
                })
            },
        )
        .optional()?;

    Ok(target)
}
