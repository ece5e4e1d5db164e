use chrono::{DateTime, SecondsFormat, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimestampMs(pub i64);

impl TimestampMs {
    pub fn millis_since(self, earlier: TimestampMs) -> i64 {
        self.0 - earlier.0
    }

    pub fn to_rfc3339(self) -> String {
        let datetime = DateTime::<Utc>::from_timestamp_millis(self.0)
            .unwrap_or_else(|| DateTime::<Utc>::from(std::time::UNIX_EPOCH));
        datetime.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

pub trait Clock {
    fn now(&self) -> TimestampMs;
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimestampMs {
        TimestampMs(Utc::now().timestamp_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::TimestampMs;

    #[test]
    fn formats_timestamp_as_rfc3339_millis() {
        let formatted = TimestampMs(1_700_000_000_000).to_rfc3339();
        assert_eq!(formatted, "2023-11-14T22:13:20.000Z");
    }

    #[test]
    fn computes_elapsed_millis() {
        assert_eq!(TimestampMs(5_000).millis_since(TimestampMs(2_000)), 3_000);
    }
}
