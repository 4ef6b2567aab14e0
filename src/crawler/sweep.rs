use serde::{Serialize, Deserialize};
use std::fmt;

use crate::cli::config::SweepSettings;
use crate::storage::VillageProgress;

/// What one survey number produced once every combination was processed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveyReport {
    pub survey_no: u32,
    /// surnoc × hissa × period combinations that reached the fetch step
    pub combinations: u32,
    pub records: u32,
    pub matches: u32,
    /// Combinations abandoned after exhausting their retries
    pub skipped: u32,
    /// Surnoc values fully processed for this survey
    pub processed_surnocs: Vec<String>,
}

impl SurveyReport {
    pub fn empty(survey_no: u32) -> Self {
        Self {
            survey_no,
            ..Default::default()
        }
    }

    pub fn has_data(&self) -> bool {
        self.records > 0
    }
}

/// Why a village sweep ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A sustained run of empty surveys
    SmartStop,
    /// Every survey up to `max_survey` was visited
    MaxReached,
    /// The sweep was abandoned (browser lost, retries exhausted)
    Error,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::SmartStop => "smart_stop",
            StopReason::MaxReached => "max_reached",
            StopReason::Error => "error",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

impl ConfidenceLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            ConfidenceLevel::High
        } else if score >= 50.0 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceLevel::High => "HIGH",
            ConfidenceLevel::Medium => "MEDIUM",
            ConfidenceLevel::Low => "LOW",
        }
    }
}

/// Diagnostic estimate of how complete a village's coverage is.
/// Reporting only; nothing in the pipeline branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Confidence {
    pub score: f64,
    pub level: ConfidenceLevel,
}

/// Inputs describing how a sweep ended
#[derive(Debug, Clone, Copy)]
pub struct SweepEnd {
    pub stop_point: u32,
    pub last_with_data: Option<u32>,
    pub checked: u32,
    pub skipped: u32,
    pub reason: StopReason,
}

const SKIP_WEIGHT: f64 = 50.0;

impl Confidence {
    pub fn compute(end: &SweepEnd) -> Self {
        let mut score = 100.0;

        if end.checked > 0 {
            let ratio = (end.skipped as f64 / end.checked as f64).min(1.0);
            score -= ratio * SKIP_WEIGHT;
        }

        // Stopping close to the last survey that had data is the risky case
        let gap = end.stop_point.saturating_sub(end.last_with_data.unwrap_or(0));
        score -= match gap {
            0..=4 => 20.0,
            5..=9 => 10.0,
            10..=19 => 5.0,
            _ => 0.0,
        };

        match end.reason {
            StopReason::Error => score -= 30.0,
            StopReason::MaxReached => score -= 10.0,
            StopReason::SmartStop if gap >= 20 => score += 5.0,
            StopReason::SmartStop => {}
        }

        let score = score.clamp(0.0, 100.0);
        Self {
            score,
            level: ConfidenceLevel::from_score(score),
        }
    }
}

/// Outcome of feeding one survey into the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepDecision {
    Continue,
    Stop(StopReason),
}

/// Per-village sequential sweep state: smart stop and final confidence.
#[derive(Debug, Clone)]
pub struct SweepTracker {
    settings: SweepSettings,
    max_survey: u32,

    pub surveys_checked: u32,
    pub consecutive_empty: u32,
    pub last_with_data: Option<u32>,
    pub last_checked: u32,
    pub skipped: u32,
    pub records_found: u64,
    pub matches_found: u64,

    stopped: Option<StopReason>,
}

impl SweepTracker {
    pub fn new(settings: SweepSettings, max_survey: u32) -> Self {
        Self {
            settings,
            max_survey,
            surveys_checked: 0,
            consecutive_empty: 0,
            last_with_data: None,
            last_checked: 0,
            skipped: 0,
            records_found: 0,
            matches_found: 0,
            stopped: None,
        }
    }

    /// Pick up an in-progress sweep from what the ledger last stored
    pub fn restore(settings: SweepSettings, max_survey: u32, progress: &VillageProgress) -> Self {
        Self {
            surveys_checked: progress.surveys_checked,
            consecutive_empty: progress.consecutive_empty,
            last_with_data: progress.last_with_data,
            last_checked: progress.last_survey_no,
            skipped: progress.skipped_count,
            records_found: progress.records_found,
            matches_found: progress.matches_found,
            ..Self::new(settings, max_survey)
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_some()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stopped
    }

    /// Record a fully processed survey and decide whether the sweep goes on
    pub fn record_survey(&mut self, report: &SurveyReport) -> SweepDecision {
        if let Some(reason) = self.stopped {
            return SweepDecision::Stop(reason);
        }

        self.surveys_checked += 1;
        self.last_checked = self.last_checked.max(report.survey_no);
        self.skipped += report.skipped;
        self.records_found += report.records as u64;
        self.matches_found += report.matches as u64;

        if report.has_data() {
            self.consecutive_empty = 0;
            self.last_with_data = Some(report.survey_no);
        } else {
            self.consecutive_empty += 1;
        }

        let decision = if report.survey_no >= self.max_survey {
            SweepDecision::Stop(StopReason::MaxReached)
        } else if self.settings.smart_stop_enabled
            && self.consecutive_empty >= self.settings.empty_survey_threshold
            && self.surveys_checked >= self.settings.min_surveys_before_stop
        {
            SweepDecision::Stop(StopReason::SmartStop)
        } else {
            SweepDecision::Continue
        };

        if let SweepDecision::Stop(reason) = decision {
            self.stopped = Some(reason);
        }
        decision
    }

    /// Count a whole survey that was abandoned without a report
    pub fn record_skipped_survey(&mut self, survey_no: u32) -> SweepDecision {
        if let Some(reason) = self.stopped {
            return SweepDecision::Stop(reason);
        }

        self.surveys_checked += 1;
        self.skipped += 1;
        self.last_checked = self.last_checked.max(survey_no);

        if survey_no >= self.max_survey {
            self.stopped = Some(StopReason::MaxReached);
            return SweepDecision::Stop(StopReason::MaxReached);
        }
        SweepDecision::Continue
    }

    /// Abandon the sweep (browser lost for good, village given up)
    pub fn abort(&mut self) {
        self.stopped.get_or_insert(StopReason::Error);
    }

    pub fn confidence(&self) -> Confidence {
        Confidence::compute(&SweepEnd {
            stop_point: self.last_checked,
            last_with_data: self.last_with_data,
            checked: self.surveys_checked,
            skipped: self.skipped,
            reason: self.stopped.unwrap_or(StopReason::Error),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(threshold: u32, min: u32) -> SweepSettings {
        SweepSettings {
            smart_stop_enabled: true,
            empty_survey_threshold: threshold,
            min_surveys_before_stop: min,
        }
    }

    fn report(survey_no: u32, records: u32) -> SurveyReport {
        SurveyReport {
            survey_no,
            combinations: records.min(1),
            records,
            ..Default::default()
        }
    }

    #[test]
    fn test_smart_stop_after_empty_run() {
        let mut tracker = SweepTracker::new(settings(3, 5), 100);

        assert_eq!(tracker.record_survey(&report(1, 2)), SweepDecision::Continue);
        assert_eq!(tracker.record_survey(&report(2, 1)), SweepDecision::Continue);
        assert_eq!(tracker.record_survey(&report(3, 0)), SweepDecision::Continue);
        assert_eq!(tracker.record_survey(&report(4, 0)), SweepDecision::Continue);
        assert_eq!(
            tracker.record_survey(&report(5, 0)),
            SweepDecision::Stop(StopReason::SmartStop)
        );
        assert!(tracker.is_stopped());
        assert_eq!(tracker.last_with_data, Some(2));
        assert_eq!(tracker.records_found, 3);
    }

    #[test]
    fn test_smart_stop_waits_for_minimum_surveys() {
        let mut tracker = SweepTracker::new(settings(2, 4), 100);

        assert_eq!(tracker.record_survey(&report(1, 0)), SweepDecision::Continue);
        assert_eq!(tracker.record_survey(&report(2, 0)), SweepDecision::Continue);
        assert_eq!(tracker.record_survey(&report(3, 0)), SweepDecision::Continue);
        assert_eq!(
            tracker.record_survey(&report(4, 0)),
            SweepDecision::Stop(StopReason::SmartStop)
        );
    }

    #[test]
    fn test_max_reached_and_disabled_smart_stop() {
        let mut disabled = settings(1, 1);
        disabled.smart_stop_enabled = false;
        let mut tracker = SweepTracker::new(disabled, 3);

        assert_eq!(tracker.record_survey(&report(1, 0)), SweepDecision::Continue);
        assert_eq!(tracker.record_survey(&report(2, 0)), SweepDecision::Continue);
        assert_eq!(
            tracker.record_survey(&report(3, 0)),
            SweepDecision::Stop(StopReason::MaxReached)
        );
    }

    #[test]
    fn test_confidence_levels() {
        let clean = Confidence::compute(&SweepEnd {
            stop_point: 80,
            last_with_data: Some(30),
            checked: 80,
            skipped: 0,
            reason: StopReason::SmartStop,
        });
        assert_eq!(clean.score, 100.0);
        assert_eq!(clean.level, ConfidenceLevel::High);

        let close_to_data = Confidence::compute(&SweepEnd {
            stop_point: 50,
            last_with_data: Some(48),
            checked: 50,
            skipped: 10,
            reason: StopReason::MaxReached,
        });
        // 100 - 10 (skips) - 20 (gap) - 10 (max reached)
        assert_eq!(close_to_data.score, 60.0);
        assert_eq!(close_to_data.level, ConfidenceLevel::Medium);

        let errored = Confidence::compute(&SweepEnd {
            stop_point: 4,
            last_with_data: Some(3),
            checked: 4,
            skipped: 4,
            reason: StopReason::Error,
        });
        assert_eq!(errored.score, 0.0);
        assert_eq!(errored.level, ConfidenceLevel::Low);
    }

    #[test]
    fn test_confidence_never_rises_with_more_skips() {
        for reason in [StopReason::SmartStop, StopReason::MaxReached, StopReason::Error] {
            for last_with_data in [None, Some(10), Some(45), Some(58)] {
                let mut previous = f64::MAX;
                for skipped in 0..=80 {
                    let score = Confidence::compute(&SweepEnd {
                        stop_point: 60,
                        last_with_data,
                        checked: 60,
                        skipped,
                        reason,
                    })
                    .score;
                    assert!(score <= previous, "{:?} skipped={} rose to {}", reason, skipped, score);
                    assert!((0.0..=100.0).contains(&score));
                    previous = score;
                }
            }
        }
    }

    #[test]
    fn test_abort_marks_error() {
        let mut tracker = SweepTracker::new(settings(50, 10), 200);
        tracker.record_survey(&report(1, 1));
        assert_eq!(tracker.record_skipped_survey(2), SweepDecision::Continue);
        tracker.abort();

        assert_eq!(tracker.stop_reason(), Some(StopReason::Error));
        assert_eq!(tracker.skipped, 1);
        assert_eq!(tracker.confidence().level, ConfidenceLevel::Low);
    }

    #[test]
    fn test_restored_tracker_keeps_the_empty_run() {
        let mut first = SweepTracker::new(settings(5, 10), 30);
        first.record_survey(&report(1, 2));
        for survey in 2..=7 {
            assert_eq!(first.record_survey(&report(survey, 0)), SweepDecision::Continue);
        }

        let progress = VillageProgress {
            session_id: "s1".into(),
            village_code: "101".into(),
            village_name: "Hebbal".into(),
            hobli_name: "Bilikere".into(),
            status: "in_progress".into(),
            last_survey_no: first.last_checked,
            max_survey_no: 30,
            records_found: first.records_found,
            matches_found: 0,
            stop_reason: None,
            confidence: None,
            confidence_level: None,
            error_message: None,
            surveys_checked: first.surveys_checked,
            consecutive_empty: first.consecutive_empty,
            last_with_data: first.last_with_data,
            skipped_count: first.skipped,
        };

        let mut resumed = SweepTracker::restore(settings(5, 10), 30, &progress);
        assert_eq!(resumed.consecutive_empty, 6);
        assert_eq!(resumed.record_survey(&report(8, 0)), SweepDecision::Continue);
        assert_eq!(resumed.record_survey(&report(9, 0)), SweepDecision::Continue);
        assert_eq!(resumed.record_survey(&report(10, 0)), SweepDecision::Stop(StopReason::SmartStop));
        assert_eq!(resumed.last_with_data, Some(1));
        assert_eq!(resumed.records_found, 2);
    }

    #[test]
    fn test_skipping_the_last_survey_ends_the_sweep() {
        let mut tracker = SweepTracker::new(settings(50, 10), 3);
        tracker.record_survey(&report(1, 0));
        tracker.record_survey(&report(2, 2));
        assert_eq!(tracker.record_skipped_survey(3), SweepDecision::Stop(StopReason::MaxReached));
        assert_eq!(tracker.skipped, 1);
        assert_eq!(tracker.last_checked, 3);
    }
}
