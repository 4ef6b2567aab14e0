use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Run-level counters. Workers only ever increment these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricField {
    TasksCompleted,
    TasksFailed,
    TasksRetried,
    TasksSkipped,
    CombinationsSkipped,
    RecordsSaved,
    MatchesFound,
    SessionResets,
    BrowserRecreations,
    Recycles,
    GateDenials,
    VillagesCompleted,
}

impl MetricField {
    pub const ALL: [MetricField; 12] = [
        MetricField::TasksCompleted,
        MetricField::TasksFailed,
        MetricField::TasksRetried,
        MetricField::TasksSkipped,
        MetricField::CombinationsSkipped,
        MetricField::RecordsSaved,
        MetricField::MatchesFound,
        MetricField::SessionResets,
        MetricField::BrowserRecreations,
        MetricField::Recycles,
        MetricField::GateDenials,
        MetricField::VillagesCompleted,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            MetricField::TasksCompleted => "tasks_completed",
            MetricField::TasksFailed => "tasks_failed",
            MetricField::TasksRetried => "tasks_retried",
            MetricField::TasksSkipped => "tasks_skipped",
            MetricField::CombinationsSkipped => "combinations_skipped",
            MetricField::RecordsSaved => "records_saved",
            MetricField::MatchesFound => "matches_found",
            MetricField::SessionResets => "session_resets",
            MetricField::BrowserRecreations => "browser_recreations",
            MetricField::Recycles => "recycles",
            MetricField::GateDenials => "gate_denials",
            MetricField::VillagesCompleted => "villages_completed",
        }
    }

    fn index(&self) -> usize {
        Self::ALL.iter().position(|f| f == self).unwrap_or(0)
    }
}

/// Aggregated view of the counters
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RunMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub tasks_skipped: u64,
    pub combinations_skipped: u64,
    pub records_saved: u64,
    pub matches_found: u64,
    pub session_resets: u64,
    pub browser_recreations: u64,
    pub recycles: u64,
    pub gate_denials: u64,
    pub villages_completed: u64,
}

impl RunMetrics {
    /// Build from `field key -> count` pairs, ignoring unknown keys
    pub fn from_counts(counts: &HashMap<String, u64>) -> Self {
        let mut metrics = Self::default();
        for field in MetricField::ALL {
            if let Some(value) = counts.get(field.key()) {
                *metrics.slot(field) = *value;
            }
        }
        metrics
    }

    fn slot(&mut self, field: MetricField) -> &mut u64 {
        match field {
            MetricField::TasksCompleted => &mut self.tasks_completed,
            MetricField::TasksFailed => &mut self.tasks_failed,
            MetricField::TasksRetried => &mut self.tasks_retried,
            MetricField::TasksSkipped => &mut self.tasks_skipped,
            MetricField::CombinationsSkipped => &mut self.combinations_skipped,
            MetricField::RecordsSaved => &mut self.records_saved,
            MetricField::MatchesFound => &mut self.matches_found,
            MetricField::SessionResets => &mut self.session_resets,
            MetricField::BrowserRecreations => &mut self.browser_recreations,
            MetricField::Recycles => &mut self.recycles,
            MetricField::GateDenials => &mut self.gate_denials,
            MetricField::VillagesCompleted => &mut self.villages_completed,
        }
    }

    /// Surveys that reached a terminal state
    pub fn tasks_finished(&self) -> u64 {
        self.tasks_completed + self.tasks_skipped
    }

    pub fn tasks_per_minute(&self, started_at: DateTime<Utc>) -> f64 {
        let minutes = (Utc::now() - started_at).num_seconds().max(1) as f64 / 60.0;
        self.tasks_finished() as f64 / minutes
    }
}

/// Lock-free counters for in-process aggregation
#[derive(Debug, Default)]
pub struct SharedMetrics {
    counters: [AtomicU64; 12],
}

impl SharedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, field: MetricField, by: u64) {
        self.counters[field.index()].fetch_add(by, Ordering::Relaxed);
    }

    pub fn get(&self, field: MetricField) -> u64 {
        self.counters[field.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> RunMetrics {
        let counts: HashMap<String, u64> = MetricField::ALL
            .iter()
            .map(|field| (field.key().to_string(), self.get(*field)))
            .collect();
        RunMetrics::from_counts(&counts)
    }
}

/// Request timer for measuring request durations
pub struct RequestTimer {
    start: Instant,
}

impl RequestTimer {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// End timing and get the duration in milliseconds
    pub fn end(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_field_keys_are_unique() {
        let keys: std::collections::HashSet<_> = MetricField::ALL.iter().map(|f| f.key()).collect();
        assert_eq!(keys.len(), MetricField::ALL.len());
    }

    #[test]
    fn test_concurrent_increments() {
        let metrics = Arc::new(SharedMetrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.incr(MetricField::RecordsSaved, 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        metrics.incr(MetricField::TasksCompleted, 3);
        metrics.incr(MetricField::TasksSkipped, 2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_saved, 4000);
        assert_eq!(snapshot.tasks_finished(), 5);
    }

    #[test]
    fn test_from_counts_ignores_unknown_keys() {
        let mut counts = HashMap::new();
        counts.insert("matches_found".to_string(), 7);
        counts.insert("bogus".to_string(), 1);

        let metrics = RunMetrics::from_counts(&counts);
        assert_eq!(metrics.matches_found, 7);
        assert_eq!(metrics, RunMetrics { matches_found: 7, ..Default::default() });
    }
}
