use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// Metric key for requests without a usable credential.
pub const MISSING_API_KEY: &str = "<missing>";
/// Metric key for credentials the directory does not know.
pub const UNKNOWN_API_KEY: &str = "<unknown>";

type MinuteCounts = HashMap<u64, HashMap<u16, u64>>;

/// In-memory per-minute response status counts keyed by API key.
#[derive(Default)]
pub struct Metrics {
    counts: Mutex<HashMap<String, MinuteCounts>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a status code occurrence using the current wall-clock time.
    pub fn record(&self, api_key: &str, status: u16) {
        self.record_at(api_key, status, SystemTime::now());
    }

    /// Record a status code occurrence at a provided time (useful for tests).
    pub fn record_at(&self, api_key: &str, status: u16, at: SystemTime) {
        let minute = minute_bucket(at);
        let mut guard = self.counts.lock().expect("metrics store poisoned");
        *guard
            .entry(api_key.to_string())
            .or_default()
            .entry(minute)
            .or_default()
            .entry(status)
            .or_insert(0) += 1;
    }

    /// Per-minute counts for a key. Empty when the key is unknown.
    pub fn snapshot(&self, api_key: &str) -> MinuteCounts {
        self.counts
            .lock()
            .expect("metrics store poisoned")
            .get(api_key)
            .cloned()
            .unwrap_or_default()
    }

    /// Counts per status for a key, summed over all retained minutes.
    pub fn totals(&self, api_key: &str) -> HashMap<u16, u64> {
        let mut totals = HashMap::new();
        for per_status in self.snapshot(api_key).values() {
            for (status, count) in per_status {
                *totals.entry(*status).or_insert(0) += count;
            }
        }
        totals
    }

    /// Drop minutes older than `keep` before `now`. Returns the number of
    /// minute buckets removed.
    pub fn prune(&self, now: SystemTime, keep: Duration) -> usize {
        let oldest = minute_bucket(now).saturating_sub(keep.as_secs() / 60);
        let mut guard = self.counts.lock().expect("metrics store poisoned");
        let mut removed = 0;
        guard.retain(|_, minutes| {
            let before = minutes.len();
            minutes.retain(|minute, _| *minute >= oldest);
            removed += before - minutes.len();
            !minutes.is_empty()
        });
        removed
    }
}

fn minute_bucket(at: SystemTime) -> u64 {
    at.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
        / 60
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn minute_bucket_groups_by_60_seconds() {
        assert_eq!(minute_bucket(at(59)), 0);
        assert_eq!(minute_bucket(at(60)), 1);
    }

    #[test]
    fn record_and_snapshot_counts() {
        let metrics = Metrics::new();
        metrics.record_at("k", 200, at(5));
        metrics.record_at("k", 429, at(5));
        metrics.record_at("k", 200, at(65));

        let snap = metrics.snapshot("k");
        assert_eq!(snap[&0].get(&200), Some(&1));
        assert_eq!(snap[&0].get(&429), Some(&1));
        assert_eq!(snap[&1].get(&200), Some(&1));

        let totals = metrics.totals("k");
        assert_eq!(totals.get(&200), Some(&2));
        assert_eq!(totals.get(&429), Some(&1));
    }

    #[test]
    fn snapshot_unknown_key_is_empty() {
        let metrics = Metrics::new();
        assert!(metrics.snapshot("missing").is_empty());
        assert!(metrics.totals("missing").is_empty());
    }

    #[test]
    fn prune_drops_old_minutes_and_empty_keys() {
        let metrics = Metrics::new();
        metrics.record_at("old", 200, at(0));
        metrics.record_at("k", 200, at(0));
        metrics.record_at("k", 200, at(3600));

        let removed = metrics.prune(at(3600), Duration::from_secs(600));
        assert_eq!(removed, 2);
        assert!(metrics.snapshot("old").is_empty());
        assert_eq!(metrics.totals("k").get(&200), Some(&1));
    }
}
