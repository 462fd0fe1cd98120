//! Clock abstraction for deadline checks and status timestamps
//!
//! Controllers use `SystemClock`; tests use `MockClock` to place "now"
//! relative to the condition timestamps in their fixtures.

use chrono::{DateTime, SecondsFormat, Utc};

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current time as written into Canary status fields
    fn now_rfc3339(&self) -> String {
        self.now().to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

/// Wall clock backed by `chrono::Utc::now()`
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Parse an RFC3339 timestamp, `None` when absent or malformed
pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Whether `since + deadline_seconds` lies before `now`
pub fn deadline_exceeded(since: DateTime<Utc>, deadline_seconds: i32, now: DateTime<Utc>) -> bool {
    since + chrono::Duration::seconds(deadline_seconds as i64) < now
}

/// Settable clock for tests
#[cfg(test)]
#[allow(clippy::expect_used)]
pub struct MockClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl MockClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    /// Clock fixed at an RFC3339 instant
    pub fn at(rfc3339: &str) -> Self {
        Self::new(parse_rfc3339(rfc3339).expect("valid RFC3339 timestamp"))
    }

    #[allow(dead_code)]
    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock().expect("MockClock lock poisoned");
        *now += duration;
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("MockClock lock poisoned")
    }
}
