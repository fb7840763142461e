//! Millisecond epoch timestamps, the protocol's only notion of time.

/// Current time as milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
