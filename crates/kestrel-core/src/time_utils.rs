use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{SecondsFormat, Utc};

fn since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Wall-clock Unix seconds; heartbeat due checks compare against these.
pub fn current_unix_timestamp() -> u64 {
    since_epoch().as_secs()
}

pub fn current_unix_timestamp_ms() -> u64 {
    u64::try_from(since_epoch().as_millis()).unwrap_or(u64::MAX)
}

/// UTC now as `YYYY-MM-DDTHH:MM:SS.mmmZ`, the format stored in job and daemon records.
pub fn current_utc_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
