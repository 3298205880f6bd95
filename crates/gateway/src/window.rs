//! UTC calendar-day accounting windows and the clock that drives them.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

/// Safety margin added to a fresh counter's expiry past the window end.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

const DAY: Duration = Duration::from_secs(86_400);

/// Source of wall-clock time for window derivation.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock (useful for tests).
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("clock poisoned") = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock poisoned");
        *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock poisoned")
    }
}

/// One UTC calendar day, captured from a single clock read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    day: NaiveDate,
    at: DateTime<Utc>,
}

impl Window {
    /// The window containing `at`.
    pub fn containing(at: DateTime<Utc>) -> Self {
        Self {
            day: at.date_naive(),
            at,
        }
    }

    /// Window identifier, `YYYYMMDD`.
    pub fn id(&self) -> String {
        self.day.format("%Y%m%d").to_string()
    }

    /// Time left until the next UTC midnight.
    pub fn remaining(&self) -> Duration {
        let Some(next) = self.day.succ_opt() else {
            return DAY;
        };
        let end = next.and_time(NaiveTime::MIN).and_utc();
        (end - self.at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Expiry to set on a counter created in this window.
    pub fn counter_ttl(&self) -> Duration {
        self.remaining() + EXPIRY_MARGIN
    }

    /// Counter key for `credential` in this window.
    pub fn counter_key(&self, credential: &str) -> String {
        format!("{}{}:{}", COUNTER_KEY_PREFIX, credential, self.id())
    }
}

/// Common prefix of every usage counter key.
pub const COUNTER_KEY_PREFIX: &str = "ratelimit:";

/// Split a counter key into `(credential, window id)`.
pub fn parse_counter_key(key: &str) -> Option<(&str, &str)> {
    let (credential, window_id) = key.strip_prefix(COUNTER_KEY_PREFIX)?.rsplit_once(':')?;
    if credential.is_empty()
        || window_id.len() != 8
        || !window_id.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    Some((credential, window_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    #[test]
    fn window_id_is_utc_date() {
        let window = Window::containing(at(2024, 3, 9, 23, 59, 59));
        assert_eq!(window.id(), "20240309");
        assert_eq!(window.counter_key("k1"), "ratelimit:k1:20240309");
    }

    #[test]
    fn counter_key_parses_back() {
        let key = Window::containing(at(2024, 3, 9, 8, 0, 0)).counter_key("addr_abc");
        assert_eq!(parse_counter_key(&key), Some(("addr_abc", "20240309")));
        assert_eq!(parse_counter_key("ratelimit:k:today"), None);
        assert_eq!(parse_counter_key("ratelimit::20240309"), None);
        assert_eq!(parse_counter_key("session:k:20240309"), None);
    }

    #[test]
    fn midnight_starts_a_new_window() {
        let before = Window::containing(at(2024, 3, 9, 23, 59, 59));
        let after = Window::containing(at(2024, 3, 10, 0, 0, 0));
        assert_ne!(before.id(), after.id());
        assert_eq!(after.id(), "20240310");
    }

    #[test]
    fn remaining_counts_down_to_midnight() {
        assert_eq!(
            Window::containing(at(2024, 3, 9, 0, 0, 0)).remaining(),
            Duration::from_secs(86_400)
        );
        assert_eq!(
            Window::containing(at(2024, 3, 9, 23, 0, 0)).remaining(),
            Duration::from_secs(3_600)
        );
        assert_eq!(
            Window::containing(at(2024, 12, 31, 23, 59, 59)).remaining(),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn counter_ttl_outlives_window() {
        let window = Window::containing(at(2024, 3, 9, 12, 0, 0));
        assert_eq!(
            window.counter_ttl(),
            Duration::from_secs(12 * 3_600) + EXPIRY_MARGIN
        );
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(at(2024, 3, 9, 23, 0, 0));
        clock.advance(Duration::from_secs(3_600));
        assert_eq!(clock.now(), at(2024, 3, 10, 0, 0, 0));
        clock.set(at(2025, 1, 1, 0, 0, 0));
        assert_eq!(Window::containing(clock.now()).id(), "20250101");
    }
}
