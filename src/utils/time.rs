use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::debug;

/// Timestamps as the metrics API writes them: `2024-05-01 10:00:00.123Z`,
/// or RFC 3339. Anything else is treated as "now".
pub fn parse_timestamp(value: &str) -> DateTime<Utc> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return parsed.with_timezone(&Utc);
    }

    for layout in ["%Y-%m-%d %H:%M:%S%.fZ", "%Y-%m-%dT%H:%M:%S%.fZ", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, layout) {
            return naive.and_utc();
        }
    }

    debug!("Unparsable timestamp {:?}, using current time", value);
    Utc::now()
}
