//! Time utilities for the cluster master

use chrono::{DateTime, DurationRound, Utc};

/// Current wall-clock time truncated to millisecond precision
///
/// Persisted timestamps are compared for equality after a round trip
/// through storage, so sub-millisecond precision is dropped up front.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    now.duration_trunc(chrono::Duration::milliseconds(1))
        .unwrap_or(now)
}

/// End time for records left open by a previous master process
///
/// Uses the last heartbeat the previous process wrote, falling back to now
/// when the cluster has never heartbeated.
pub fn last_known_alive(last_heartbeat: Option<DateTime<Utc>>) -> DateTime<Utc> {
    last_heartbeat.unwrap_or_else(now_millis)
}
