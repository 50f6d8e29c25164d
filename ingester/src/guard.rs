//! Future-timestamp guard.
//!
//! The sensor-declared time is the canonical timestamp downstream; a node
//! with a misset RTC produces permanently unaligned data, so readings ahead
//! of the ingester clock beyond a small tolerance are rejected before they
//! reach the correlator. Rejections go to a dedicated size-rotated log
//! stream so broken nodes can be chased down later.

pub const FUTURE_TOLERANCE_SECS: i64 = 30;

/// Returns `Some(delta_seconds)` when `sensor_time` is too far ahead of
/// `now` and the reading must be dropped. Exactly at the tolerance is
/// accepted.
pub fn future_delta(sensor_time: i64, now: i64) -> Option<i64> {
    let delta = sensor_time - now;
    (delta > FUTURE_TOLERANCE_SECS).then_some(delta)
}

/// Human-readable rendering of how far ahead a clock is, for the log line.
pub fn format_ahead(delta_secs: i64) -> String {
    if delta_secs > 86_400 {
        format!("{:.1} days", delta_secs as f64 / 86_400.0)
    } else if delta_secs > 3_600 {
        format!("{:.1} hours", delta_secs as f64 / 3_600.0)
    } else if delta_secs > 60 {
        format!("{:.1} minutes", delta_secs as f64 / 60.0)
    } else {
        format!("{delta_secs} seconds")
    }
}

/// One rejection, routed to the future-timestamps log stream.
#[derive(Clone, Debug)]
pub struct FutureTimestampEvent {
    pub node: u32,
    pub region: String,
    pub sensor_time: i64,
    pub delta_seconds: i64,
}

impl FutureTimestampEvent {
    pub fn log_line(&self, now: i64) -> String {
        format!(
            "{} | FUTURE_TIMESTAMP | node={} | region={} | sensor_time={} | delta_seconds={} | ahead_by={}",
            chrono::DateTime::from_timestamp(now, 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| now.to_string()),
            crate::model::device_id(self.node),
            self.region,
            self.sensor_time,
            self.delta_seconds,
            format_ahead(self.delta_seconds),
        )
    }
}
