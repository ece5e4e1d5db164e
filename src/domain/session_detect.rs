use chrono::{DateTime, Duration, FixedOffset, SecondsFormat, Utc};
use uuid::Uuid;

use crate::domain::models::{ChargingSession, TelemetrySample};

/// Minimum battery increase (percentage points) to count as a session.
pub const MIN_BATTERY_INCREASE: i64 = 5;
/// Minimum energy delivered (kWh) to count as a session.
pub const MIN_ENERGY_KWH: f64 = 1.0;
/// Samples further apart than this belong to disconnected periods.
pub const MAX_GAP_HOURS: i64 = 8;
/// Battery drop (points) treated as the end of a charging episode.
pub const MIN_TREND_DROP: i64 = 2;

/// How many of the newest samples are scanned for the charging peak.
const PEAK_SCAN_WINDOW: usize = 10;
/// A rise this far above the running minimum means the backward walk has
/// crossed into an earlier, separate session.
const START_RISE_TOLERANCE: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The vendor's `isCharging` flag flipped from true to false.
    FlagCleared,
    /// Battery was rising, then dropped; the flag never signaled the end.
    BatteryDrop,
}

/// Decides whether the newest samples (descending by time) show a charging
/// episode that has plausibly just ended.
///
/// The flag check alone is not enough: the vendor's `isCharging` is known to
/// under-report, so a battery-trend fallback catches episodes the flag missed.
pub fn charge_ended(samples: &[TelemetrySample]) -> Option<EndReason> {
    if samples.len() < 2 {
        return None;
    }

    let current = &samples[0];
    let previous = &samples[1];

    if previous.is_charging.unwrap_or(false) && !current.is_charging.unwrap_or(false) {
        return Some(EndReason::FlagCleared);
    }

    if samples.len() >= 3
        && let (Some(current_battery), Some(previous_battery), Some(before_battery)) = (
            current.battery_level,
            previous.battery_level,
            samples[2].battery_level,
        )
    {
        let was_rising = previous_battery > before_battery;
        let dropped = previous_battery - current_battery >= MIN_TREND_DROP;
        if was_rising && dropped {
            return Some(EndReason::BatteryDrop);
        }
    }

    None
}

/// The boundaries of one charging episode located within recent history.
#[derive(Debug)]
pub struct SessionDraft<'a> {
    pub start: &'a TelemetrySample,
    pub end: &'a TelemetrySample,
    pub start_battery: i64,
    pub end_battery: i64,
    /// Samples belonging to the episode, newest first.
    pub samples: Vec<&'a TelemetrySample>,
}

/// Locates the most recent charging episode by finding the battery peak among
/// the newest samples and walking backward toward the charge start.
///
/// Input must be sorted descending by `sample_time`. The walk stops at a time
/// gap over [`MAX_GAP_HOURS`] or when battery rises more than
/// [`START_RISE_TOLERANCE`] points above the running minimum, which means an
/// earlier, unrelated session has been reached.
pub fn trace_back(samples: &[TelemetrySample]) -> Option<SessionDraft<'_>> {
    if samples.len() < 2 {
        return None;
    }

    let mut peak_idx = 0;
    let mut peak_battery = samples[0].battery_level.unwrap_or(0);
    for (idx, sample) in samples.iter().enumerate().take(PEAK_SCAN_WINDOW).skip(1) {
        if let Some(battery) = sample.battery_level
            && battery > peak_battery
        {
            peak_battery = battery;
            peak_idx = idx;
        }
    }

    let mut session_samples = vec![&samples[peak_idx]];
    let mut min_battery = peak_battery;
    let mut min_idx = peak_idx;
    let mut prev_time = parse_time(&samples[peak_idx].sample_time);

    for (idx, sample) in samples.iter().enumerate().skip(peak_idx + 1) {
        let Some(battery) = sample.battery_level else {
            continue;
        };
        let Some(sample_time) = parse_time(&sample.sample_time) else {
            continue;
        };

        if let Some(prev) = prev_time
            && prev - sample_time > Duration::hours(MAX_GAP_HOURS)
        {
            break;
        }

        if battery < min_battery {
            min_battery = battery;
            min_idx = idx;
            session_samples.push(sample);
        } else if battery > min_battery + START_RISE_TOLERANCE {
            break;
        } else {
            session_samples.push(sample);
        }

        prev_time = Some(sample_time);
    }

    Some(SessionDraft {
        start: &samples[min_idx],
        end: &samples[peak_idx],
        start_battery: min_battery,
        end_battery: peak_battery,
        samples: session_samples,
    })
}

/// Validates a draft against the session thresholds and computes its metrics.
/// Returns `None` when the increase or energy is below the minimum, or when
/// no sample reported a battery capacity.
pub fn build_session(
    vehicle_id: &str,
    user_id: &str,
    draft: &SessionDraft<'_>,
) -> Option<ChargingSession> {
    let battery_increase = draft.end_battery - draft.start_battery;
    if battery_increase < MIN_BATTERY_INCREASE {
        tracing::debug!(
            vehicle_id,
            battery_increase,
            "battery increase below session threshold"
        );
        return None;
    }

    let capacity = draft
        .start
        .battery_capacity_kwh
        .or(draft.end.battery_capacity_kwh)
        .or_else(|| draft.samples.iter().find_map(|s| s.battery_capacity_kwh))?;

    let energy_added_kwh = capacity * battery_increase as f64 / 100.0;
    if energy_added_kwh < MIN_ENERGY_KWH {
        tracing::debug!(vehicle_id, energy_added_kwh, "energy below session threshold");
        return None;
    }

    let start_time = parse_time(&draft.start.sample_time)?;
    let end_time = parse_time(&draft.end.sample_time)?;
    let duration_minutes = (end_time - start_time).num_seconds() as f64 / 60.0;

    let rates: Vec<f64> = draft
        .samples
        .iter()
        .filter_map(|s| s.charge_rate_kw)
        .filter(|rate| *rate > 0.0)
        .collect();

    let (average_charge_rate_kw, max_charge_rate_kw) = if rates.is_empty() {
        // No sample reported a rate; estimate a flat average from the totals.
        if duration_minutes > 0.0 {
            let estimate = energy_added_kwh / (duration_minutes / 60.0);
            (Some(estimate), Some(estimate))
        } else {
            (None, None)
        }
    } else {
        let sum: f64 = rates.iter().sum();
        let max = rates.iter().copied().fold(f64::MIN, f64::max);
        (Some(sum / rates.len() as f64), Some(max))
    };

    Some(ChargingSession {
        session_id: Uuid::new_v4().to_string(),
        vehicle_id: vehicle_id.to_string(),
        user_id: user_id.to_string(),
        start_time: draft.start.sample_time.clone(),
        end_time: draft.end.sample_time.clone(),
        start_battery_level: draft.start_battery,
        end_battery_level: draft.end_battery,
        energy_added_kwh,
        duration_minutes,
        average_charge_rate_kw,
        max_charge_rate_kw,
        brand: draft.start.brand.clone().or_else(|| draft.end.brand.clone()),
        model: draft.start.model.clone().or_else(|| draft.end.model.clone()),
        year: draft.start.year.or(draft.end.year),
        start_location: draft.start.location,
        end_location: draft.end.location,
        created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

/// Bulk-regeneration scan over historical samples, oldest first: finds every
/// period where battery rose, bounded by the same gap and drop rules as the
/// live path, and builds validated sessions for each.
pub fn scan_forward(
    vehicle_id: &str,
    user_id: &str,
    samples: &[TelemetrySample],
) -> Vec<ChargingSession> {
    if samples.iter().all(|s| s.battery_capacity_kwh.is_none()) {
        tracing::warn!(vehicle_id, "no battery capacity in history, skipping vehicle");
        return Vec::new();
    }

    let mut sessions = Vec::new();
    let mut cursor = 0;

    while cursor + 1 < samples.len() {
        let mut start: Option<(usize, i64)> = None;
        while cursor + 1 < samples.len() {
            if let (Some(current), Some(next)) = (
                samples[cursor].battery_level,
                samples[cursor + 1].battery_level,
            ) && next > current
            {
                start = Some((cursor, current));
                break;
            }
            cursor += 1;
        }

        let Some((start_idx, start_battery)) = start else {
            break;
        };

        let mut end_idx = start_idx;
        let mut end_battery = start_battery;
        let mut prev_time: Option<DateTime<FixedOffset>> = None;

        for (idx, sample) in samples.iter().enumerate().skip(start_idx) {
            let Some(battery) = sample.battery_level else {
                continue;
            };
            let sample_time = parse_time(&sample.sample_time);

            if let (Some(prev), Some(current)) = (prev_time, sample_time)
                && current - prev > Duration::hours(MAX_GAP_HOURS)
            {
                break;
            }
            if let Some(current) = sample_time {
                prev_time = Some(current);
            }

            if battery >= end_battery {
                end_battery = battery;
                end_idx = idx;
            } else if battery < end_battery - MIN_TREND_DROP {
                break;
            }
        }

        let draft = SessionDraft {
            start: &samples[start_idx],
            end: &samples[end_idx],
            start_battery,
            end_battery,
            samples: samples[start_idx..=end_idx].iter().rev().collect(),
        };

        if let Some(session) = build_session(vehicle_id, user_id, &draft) {
            sessions.push(session);
        }

        cursor = end_idx + 1;
    }

    sessions
}

pub(crate) fn parse_time(value: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(value).ok()
}
