//! Timestamp helpers. Every domain entity carries `created_at`/
//! `updated_at` as `DateTime<Utc>`.

use chrono::{DateTime, Utc};

/// The current time, used instead of calling `Utc::now()` directly so
/// that call sites read consistently across the workspace.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Whether `since` is at least `seconds` in the past relative to now.
pub fn elapsed_at_least(since: DateTime<Utc>, seconds: i64) -> bool {
    (now() - since).num_seconds() >= seconds
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn elapsed_at_least_detects_past_timestamps() {
        let past = now() - Duration::seconds(120);
        assert!(elapsed_at_least(past, 60));
        assert!(!elapsed_at_least(past, 600));
    }
}
