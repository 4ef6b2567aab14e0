use anyhow::Result;
use chrono::Utc;
use serde::{Serialize, Deserialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::browser::form::FormPortal;
use crate::cli::config::{HarvestConfig, SweepSettings, WorkerSettings};
use crate::crawler::sweep::{SurveyReport, SweepDecision, SweepTracker};
use crate::crawler::task::{SearchTask, VillageStatus};
use crate::error::{PortalError, RetryReason, TaskOutcome};
use crate::extract::{is_owner_match, OwnerRow};
use crate::portal::{HealthGate, Throttle};
use crate::storage::{Ledger, LandRecord, RunControl, SkippedItem, TaskQueue, VillageProgress, WorkerHeartbeat, WorkerState};
use crate::utils::metrics::MetricField;

/// Shared channels a worker talks through; everything else is process-local
#[derive(Clone)]
pub struct WorkerChannels {
    pub queue: Arc<dyn TaskQueue>,
    pub control: Arc<dyn RunControl>,
    pub ledger: Arc<dyn Ledger>,
    pub gate: Arc<dyn HealthGate>,
    pub throttle: Arc<dyn Throttle>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub tasks_processed: u64,
    pub tasks_failed: u64,
    pub records_saved: u64,
    pub recycles: u32,
}

enum StepError {
    Portal(PortalError),
    Storage(anyhow::Error),
    Fatal(String),
}

impl From<PortalError> for StepError {
    fn from(err: PortalError) -> Self {
        StepError::Portal(err)
    }
}

/// One level of the cascading form. A combination is replayed from the
/// location down when it is retried.
enum Step<'a> {
    Survey(u32),
    Surnoc(&'a str),
    Hissa(&'a str),
    Fetch(&'a str),
}

enum StepOutput {
    Options(Vec<String>),
    Owners(Vec<OwnerRow>),
}

/// Resolves once the terminate flag is raised; pends forever if the sender is gone
async fn terminated(terminate: &mut watch::Receiver<bool>) {
    while !*terminate.borrow() {
        if terminate.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn narrow(options: Vec<String>, wanted: Option<&String>) -> Vec<String> {
    match wanted {
        Some(wanted) => options.into_iter().filter(|o| o == wanted).collect(),
        None => options,
    }
}

/// A single browser-owning worker consuming its own queue lane
pub struct Worker<P: FormPortal> {
    id: u32,
    pid: u32,
    settings: WorkerSettings,
    sweep_settings: SweepSettings,
    acquire_timeout: Duration,
    portal: P,
    channels: WorkerChannels,

    sweeps: HashMap<String, SweepTracker>,
    finished_villages: HashSet<String>,
    stats: WorkerStats,

    browser_ready: bool,
    tasks_since_recycle: u32,
    last_recycle: Instant,
    session_expiries: u32,
    current_task: Option<String>,
}

impl<P: FormPortal> Worker<P> {
    pub fn new(id: u32, config: &HarvestConfig, portal: P, channels: WorkerChannels) -> Self {
        Self {
            id,
            pid: std::process::id(),
            settings: config.workers.clone(),
            sweep_settings: config.sweep.clone(),
            acquire_timeout: Duration::from_secs(config.rate_limit.acquire_timeout_secs),
            portal,
            channels,
            sweeps: HashMap::new(),
            finished_villages: HashSet::new(),
            stats: WorkerStats::default(),
            browser_ready: false,
            tasks_since_recycle: 0,
            last_recycle: Instant::now(),
            session_expiries: 0,
            current_task: None,
        }
    }

    /// Main loop. Returns when shutdown is requested through the run control
    /// or when `terminate` is raised (SIGTERM).
    pub async fn run(mut self, mut terminate: watch::Receiver<bool>) -> Result<WorkerStats> {
        info!("Worker {} starting (pid {})", self.id, self.pid);
        self.heartbeat(WorkerState::Starting).await;

        let recovered = self.channels.queue.recover_inflight(self.id).await?;
        if recovered > 0 {
            info!("Recovered {} in-flight task(s) left by a previous worker", recovered);
        }

        self.browser_ready = self.open_browser(false).await;
        if !self.browser_ready {
            warn!("Browser could not be started, will retry on the next task");
        }

        let pop_timeout = Duration::from_secs(self.settings.pop_timeout_secs);

        loop {
            if *terminate.borrow() {
                break;
            }
            match self.channels.control.shutdown_requested().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => warn!("Failed to read shutdown flag: {:#}", e),
            }

            if self.should_recycle() {
                self.recycle().await;
            }

            let popped = tokio::select! {
                popped = self.channels.queue.pop(self.id, pop_timeout) => popped,
                _ = terminated(&mut terminate) => break,
            };

            let mut task = match popped {
                Ok(Some(task)) => task,
                Ok(None) => {
                    self.heartbeat(WorkerState::Idle).await;
                    continue;
                }
                Err(e) => {
                    error!("Failed to pop task: {:#}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if !self.sweeps.contains_key(&task.location.village_code)
                && !self.finished_villages.contains(&task.location.village_code)
            {
                self.restore_village(&task).await;
            }

            if self.finished_villages.contains(&task.location.village_code) {
                debug!("Dropping {} (village sweep finished)", task.summary());
                self.ack(&task).await;
                continue;
            }

            if !self.channels.gate.should_allow_task().await {
                self.defer(&task, &mut terminate).await;
                continue;
            }

            if !self.browser_ready && !self.recreate_browser().await {
                self.abandon_village(&task, RetryReason::BrowserDead.as_str(), "browser could not be recreated").await;
                self.ack(&task).await;
                continue;
            }

            task.mark_started(self.id);
            self.current_task = Some(task.summary());
            self.heartbeat(WorkerState::Working).await;
            debug!("Processing {}", task.summary());

            let outcome = tokio::select! {
                outcome = self.execute(&task) => Some(outcome),
                _ = terminated(&mut terminate) => None,
            };

            match outcome {
                Some(outcome) => self.settle(task, outcome).await,
                None => {
                    warn!("Interrupted during {}", task.summary());
                    self.record_skip(&task, None, None, None, "interrupted").await;
                    self.ack(&task).await;
                    break;
                }
            }

            self.current_task = None;
            self.heartbeat(WorkerState::Idle).await;
        }

        self.heartbeat(WorkerState::Stopping).await;
        self.portal.close().await;
        self.current_task = None;
        self.heartbeat(WorkerState::Stopped).await;

        info!(
            "Worker {} finished: {} processed, {} failed, {} records",
            self.id, self.stats.tasks_processed, self.stats.tasks_failed, self.stats.records_saved
        );
        Ok(self.stats)
    }

    fn should_recycle(&self) -> bool {
        self.tasks_since_recycle >= self.settings.recycle_after_tasks
            || self.last_recycle.elapsed() >= Duration::from_secs(self.settings.recycle_after_secs)
    }

    /// Planned browser restart to shed accumulated memory
    async fn recycle(&mut self) {
        info!("Recycling browser after {} tasks", self.tasks_since_recycle);
        self.heartbeat(WorkerState::Recycling).await;

        self.portal.close().await;
        self.browser_ready = self.open_browser(false).await;

        self.tasks_since_recycle = 0;
        self.last_recycle = Instant::now();
        self.session_expiries = 0;
        self.stats.recycles += 1;
        self.incr(MetricField::Recycles, 1).await;
    }

    async fn open_browser(&mut self, recreation: bool) -> bool {
        let attempts = self.settings.browser_recreate_attempts.max(1);

        for attempt in 1..=attempts {
            match self.portal.open().await {
                Ok(()) => {
                    self.session_expiries = 0;
                    if recreation {
                        self.incr(MetricField::BrowserRecreations, 1).await;
                    }
                    return true;
                }
                Err(e) => {
                    warn!("Browser start attempt {}/{} failed: {}", attempt, attempts, e);
                    self.portal.close().await;
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_secs((1u64 << attempt).min(30))).await;
                    }
                }
            }
        }
        false
    }

    async fn recreate_browser(&mut self) -> bool {
        info!("Recreating browser");
        self.portal.close().await;
        self.browser_ready = self.open_browser(true).await;
        self.browser_ready
    }

    /// Session expiry: reload without cookies first, recreate once that keeps failing
    async fn recover_session(&mut self) {
        self.session_expiries += 1;
        self.incr(MetricField::SessionResets, 1).await;

        if self.session_expiries >= self.settings.session_resets_before_recreate {
            warn!("Session expired {} times in a row, recreating browser", self.session_expiries);
            self.recreate_browser().await;
            return;
        }

        if let Err(e) = self.portal.reset_session().await {
            warn!("Session reset failed: {}", e);
            self.recreate_browser().await;
        }
    }

    /// Health gate denied the task: put it back at the head of the lane and back off
    async fn defer(&mut self, task: &SearchTask, terminate: &mut watch::Receiver<bool>) {
        let backoff = self
            .channels
            .gate
            .backoff_seconds()
            .await
            .clamp(1, self.settings.gate_backoff_cap_secs.max(1));

        warn!("Portal unhealthy, deferring {} for {}s", task.summary(), backoff);

        match self.channels.queue.push_front(self.id, task).await {
            Ok(()) => self.ack(task).await,
            Err(e) => error!("Failed to re-queue {}: {:#}", task.summary(), e),
        }
        self.incr(MetricField::GateDenials, 1).await;
        self.heartbeat(WorkerState::Backoff).await;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(backoff)) => {}
            _ = terminated(terminate) => {}
        }
    }

    async fn execute(&mut self, task: &SearchTask) -> TaskOutcome {
        match self.execute_survey(task).await {
            Ok(report) => TaskOutcome::Completed(report),
            Err(StepError::Portal(e)) => TaskOutcome::retryable(&e),
            Err(StepError::Storage(e)) => TaskOutcome::Retryable {
                reason: RetryReason::Storage,
                detail: format!("{:#}", e),
            },
            Err(StepError::Fatal(detail)) => TaskOutcome::Fatal(detail),
        }
    }

    /// Walk every surnoc × hissa × period combination of one survey number
    async fn execute_survey(&mut self, task: &SearchTask) -> Result<SurveyReport, StepError> {
        self.portal.select_location(&task.location).await.map_err(|e| match e {
            PortalError::MissingOption(option) => StepError::Fatal(format!("location not offered by the portal: {}", option)),
            other => StepError::Portal(other),
        })?;

        let surnocs = match self.run_step(&Step::Survey(task.survey_no)).await? {
            StepOutput::Options(options) => narrow(options, task.surnoc.as_ref()),
            StepOutput::Owners(_) => Vec::new(),
        };

        let mut report = SurveyReport::empty(task.survey_no);
        if surnocs.is_empty() {
            debug!("No data for survey {}", task.survey_no);
            return Ok(report);
        }

        for surnoc in &surnocs {
            let hissas = match self.guarded(task, &[Step::Surnoc(surnoc)], &mut report).await? {
                Some(StepOutput::Options(options)) => narrow(options, task.hissa.as_ref()),
                _ => continue,
            };

            for hissa in &hissas {
                let periods = match self
                    .guarded(task, &[Step::Surnoc(surnoc), Step::Hissa(hissa)], &mut report)
                    .await?
                {
                    Some(StepOutput::Options(options)) => narrow(options, task.period.as_ref()),
                    _ => continue,
                };

                for period in &periods {
                    let chain = [Step::Surnoc(surnoc), Step::Hissa(hissa), Step::Fetch(period)];
                    let owners = match self.guarded(task, &chain, &mut report).await? {
                        Some(StepOutput::Owners(owners)) => owners,
                        _ => continue,
                    };

                    report.combinations += 1;
                    for owner in owners {
                        self.save_owner(task, surnoc, hissa, period, owner, &mut report).await?;
                    }
                }
            }

            report.processed_surnocs.push(surnoc.clone());
        }

        Ok(report)
    }

    async fn run_step(&mut self, step: &Step<'_>) -> Result<StepOutput, PortalError> {
        match step {
            Step::Survey(survey_no) => {
                self.throttle().await?;
                self.portal.submit_survey(*survey_no).await.map(StepOutput::Options)
            }
            Step::Surnoc(surnoc) => self.portal.select_surnoc(surnoc).await.map(StepOutput::Options),
            Step::Hissa(hissa) => self.portal.select_hissa(hissa).await.map(StepOutput::Options),
            Step::Fetch(period) => {
                self.throttle().await?;
                self.portal.fetch_details(period).await.map(StepOutput::Owners)
            }
        }
    }

    /// Run the last step of `chain`, retrying the whole chain on portal trouble.
    /// Gives up on this combination alone (skipped item) once retries run out;
    /// session and browser failures abort the survey.
    async fn guarded(
        &mut self,
        task: &SearchTask,
        chain: &[Step<'_>],
        report: &mut SurveyReport,
    ) -> Result<Option<StepOutput>, StepError> {
        let Some(last) = chain.last() else {
            return Ok(None);
        };

        let mut attempt = 0;
        loop {
            let result = if attempt == 0 {
                self.run_step(last).await
            } else {
                self.replay(task, chain).await
            };

            match result {
                Ok(output) => return Ok(Some(output)),
                Err(e @ (PortalError::SessionExpired(_) | PortalError::BrowserDead(_))) => return Err(e.into()),
                Err(e) if attempt < self.settings.combination_retries => {
                    attempt += 1;
                    let backoff = Duration::from_millis(500 * (1u64 << attempt));
                    debug!("Combination attempt {} failed ({}), retrying in {:?}", attempt, e, backoff);
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    let (surnoc, hissa, period) = combination_of(chain);
                    warn!("Giving up on {} [{:?}/{:?}/{:?}]: {}", task.summary(), surnoc, hissa, period, e);
                    self.channels.gate.report_failure(self.id, e.retry_reason().as_str()).await;
                    self.save_skip(task, surnoc, hissa, period, e.retry_reason().as_str())
                        .await
                        .map_err(StepError::Storage)?;
                    self.incr(MetricField::CombinationsSkipped, 1).await;
                    report.skipped += 1;
                    return Ok(None);
                }
            }
        }
    }

    /// Re-establish form state from the location down and run the chain again
    async fn replay(&mut self, task: &SearchTask, chain: &[Step<'_>]) -> Result<StepOutput, PortalError> {
        self.portal.select_location(&task.location).await?;
        let mut output = self.run_step(&Step::Survey(task.survey_no)).await?;
        for step in chain {
            output = self.run_step(step).await?;
        }
        Ok(output)
    }

    async fn throttle(&self) -> Result<(), PortalError> {
        match self.channels.throttle.acquire(self.acquire_timeout).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(PortalError::Timeout("no rate limiter token".into())),
            Err(e) => Err(PortalError::Timeout(format!("rate limiter unavailable: {:#}", e))),
        }
    }

    async fn save_owner(
        &mut self,
        task: &SearchTask,
        surnoc: &str,
        hissa: &str,
        period: &str,
        owner: OwnerRow,
        report: &mut SurveyReport,
    ) -> Result<(), StepError> {
        let is_match = is_owner_match(&owner.owner_name, &task.owner_name, &task.owner_variants);
        let location = &task.location;

        let record = LandRecord {
            session_id: task.session_id.clone(),
            district: location.district_name.clone(),
            taluk: location.taluk_name.clone(),
            hobli: location.hobli_name.clone(),
            village_code: location.village_code.clone(),
            village: location.village_name.clone(),
            survey_no: task.survey_no,
            surnoc: surnoc.to_string(),
            hissa: hissa.to_string(),
            period: period.to_string(),
            owner_name: owner.owner_name,
            extent: owner.extent.unwrap_or_default(),
            khata: owner.khata.unwrap_or_default(),
            is_match,
            worker_id: self.id,
        };

        let inserted = self
            .channels
            .ledger
            .save_record(&record)
            .await
            .map_err(StepError::Storage)?;

        report.records += 1;
        if is_match {
            report.matches += 1;
            info!(
                "Match: {} in {} survey {}/{}/{} ({})",
                record.owner_name, record.village, record.survey_no, surnoc, hissa, record.extent
            );
        }

        if inserted {
            self.stats.records_saved += 1;
            self.incr(MetricField::RecordsSaved, 1).await;
            if is_match {
                self.incr(MetricField::MatchesFound, 1).await;
            }
        }
        Ok(())
    }

    async fn settle(&mut self, mut task: SearchTask, outcome: TaskOutcome) {
        self.stats.tasks_processed += 1;
        self.tasks_since_recycle += 1;

        match outcome {
            TaskOutcome::Completed(report) => {
                if let Err(e) = self.complete(&mut task, report).await {
                    self.fail(task.clone(), RetryReason::Storage, &format!("{:#}", e)).await;
                }
            }
            TaskOutcome::Retryable { reason, detail } => self.fail(task.clone(), reason, &detail).await,
            TaskOutcome::Fatal(detail) => {
                error!("Fatal failure on {}: {}", task.summary(), detail);
                self.stats.tasks_failed += 1;
                self.incr(MetricField::TasksFailed, 1).await;
                self.abandon_village(&task, "fatal", &detail).await;
            }
        }

        self.ack(&task).await;
    }

    async fn complete(&mut self, task: &mut SearchTask, report: SurveyReport) -> Result<()> {
        let village_code = task.location.village_code.clone();

        self.channels
            .ledger
            .save_checkpoint(&task.session_id, &village_code, task.survey_no, &report.processed_surnocs)
            .await?;

        task.mark_completed();
        self.session_expiries = 0;
        self.incr(MetricField::TasksCompleted, 1).await;

        let decision = self
            .sweeps
            .entry(village_code)
            .or_insert_with(|| SweepTracker::new(self.sweep_settings.clone(), task.max_survey))
            .record_survey(&report);

        match decision {
            SweepDecision::Continue => self.write_progress(task, VillageStatus::InProgress, None).await,
            SweepDecision::Stop(_) => self.finish_village(task).await,
        }
        Ok(())
    }

    /// Retry at the head of the lane, or record the survey as skipped
    async fn fail(&mut self, mut task: SearchTask, reason: RetryReason, detail: &str) {
        warn!("Task failed ({}): {} - {}", reason.as_str(), task.summary(), detail);
        self.stats.tasks_failed += 1;
        self.incr(MetricField::TasksFailed, 1).await;

        match reason {
            RetryReason::SessionExpired => {
                self.channels.gate.report_failure(self.id, reason.as_str()).await;
                self.recover_session().await;
            }
            RetryReason::BrowserDead => {
                if !self.recreate_browser().await {
                    self.abandon_village(&task, reason.as_str(), detail).await;
                    return;
                }
            }
            RetryReason::PortalIssue | RetryReason::Transient => {
                self.channels.gate.report_failure(self.id, reason.as_str()).await;
            }
            RetryReason::Storage => {}
        }

        task.mark_failed(detail);
        if task.can_retry(self.settings.max_retries) {
            task.increment_retry();
            match self.channels.queue.push_front(self.id, &task).await {
                Ok(()) => {
                    self.incr(MetricField::TasksRetried, 1).await;
                    info!("Re-queued {} (retry {})", task.summary(), task.retry_count);
                }
                Err(e) => error!("Failed to re-queue {}: {:#}", task.summary(), e),
            }
            return;
        }

        self.record_skip(&task, task.surnoc.as_deref(), task.hissa.as_deref(), task.period.as_deref(), reason.as_str())
            .await;

        let decision = self
            .sweeps
            .entry(task.location.village_code.clone())
            .or_insert_with(|| SweepTracker::new(self.sweep_settings.clone(), task.max_survey))
            .record_skipped_survey(task.survey_no);

        match decision {
            SweepDecision::Continue => self.write_progress(&task, VillageStatus::InProgress, None).await,
            SweepDecision::Stop(_) => self.finish_village(&task).await,
        }
    }

    /// First sight of a village in this process: adopt whatever an earlier
    /// worker stored for it. A ledger error leaves the village to a fresh tracker.
    async fn restore_village(&mut self, task: &SearchTask) {
        let code = task.location.village_code.clone();
        let stored = match self.channels.ledger.get_village_progress(&task.session_id).await {
            Ok(all) => all.into_iter().find(|p| p.village_code == code),
            Err(e) => {
                warn!("Failed to load progress for {}: {:#}", task.location.village_name, e);
                return;
            }
        };

        let tracker = match stored {
            Some(progress) => match VillageStatus::parse(&progress.status) {
                VillageStatus::Completed | VillageStatus::Failed => {
                    info!(
                        "Village {} already {} in this session, dropping its tasks",
                        task.location.village_name, progress.status
                    );
                    self.finished_villages.insert(code);
                    return;
                }
                VillageStatus::InProgress => {
                    debug!(
                        "Restoring sweep of {} at survey {} ({} empty in a row)",
                        task.location.village_name, progress.last_survey_no, progress.consecutive_empty
                    );
                    SweepTracker::restore(self.sweep_settings.clone(), task.max_survey, &progress)
                }
                VillageStatus::Pending => SweepTracker::new(self.sweep_settings.clone(), task.max_survey),
            },
            None => SweepTracker::new(self.sweep_settings.clone(), task.max_survey),
        };
        self.sweeps.insert(code, tracker);
    }

    /// Give up on the rest of a village: remaining tasks are dropped when popped
    async fn abandon_village(&mut self, task: &SearchTask, reason: &str, detail: &str) {
        warn!("Abandoning village {}: {}", task.location.village_name, detail);
        self.record_skip(task, task.surnoc.as_deref(), task.hissa.as_deref(), task.period.as_deref(), reason)
            .await;

        let tracker = self
            .sweeps
            .entry(task.location.village_code.clone())
            .or_insert_with(|| SweepTracker::new(self.sweep_settings.clone(), task.max_survey));
        tracker.record_skipped_survey(task.survey_no);
        tracker.abort();

        self.finished_villages.insert(task.location.village_code.clone());
        self.write_progress(task, VillageStatus::Failed, Some(detail.to_string())).await;
    }

    async fn finish_village(&mut self, task: &SearchTask) {
        self.finished_villages.insert(task.location.village_code.clone());

        if let Some(tracker) = self.sweeps.get(&task.location.village_code) {
            let confidence = tracker.confidence();
            info!(
                "Village {} finished ({}) after {} surveys: {} records, {} matches, confidence {:.0} {}",
                task.location.village_name,
                tracker.stop_reason().map(|r| r.as_str()).unwrap_or("unknown"),
                tracker.surveys_checked,
                tracker.records_found,
                tracker.matches_found,
                confidence.score,
                confidence.level.as_str()
            );
        }

        self.incr(MetricField::VillagesCompleted, 1).await;
        self.write_progress(task, VillageStatus::Completed, None).await;
    }

    async fn write_progress(&self, task: &SearchTask, status: VillageStatus, error_message: Option<String>) {
        let Some(tracker) = self.sweeps.get(&task.location.village_code) else {
            return;
        };

        let confidence = tracker.stop_reason().map(|_| tracker.confidence());
        let progress = VillageProgress {
            session_id: task.session_id.clone(),
            village_code: task.location.village_code.clone(),
            village_name: task.location.village_name.clone(),
            hobli_name: task.location.hobli_name.clone(),
            status: status.as_str().to_string(),
            last_survey_no: tracker.last_checked,
            max_survey_no: task.max_survey,
            records_found: tracker.records_found,
            matches_found: tracker.matches_found,
            stop_reason: tracker.stop_reason().map(|r| r.as_str().to_string()),
            confidence: confidence.as_ref().map(|c| c.score),
            confidence_level: confidence.as_ref().map(|c| c.level.as_str().to_string()),
            error_message,
            surveys_checked: tracker.surveys_checked,
            consecutive_empty: tracker.consecutive_empty,
            last_with_data: tracker.last_with_data,
            skipped_count: tracker.skipped,
        };

        if let Err(e) = self.channels.ledger.update_village_progress(&progress).await {
            error!("Failed to update progress for {}: {:#}", task.location.village_name, e);
        }
    }

    async fn save_skip(
        &self,
        task: &SearchTask,
        surnoc: Option<&str>,
        hissa: Option<&str>,
        period: Option<&str>,
        reason: &str,
    ) -> Result<()> {
        let item = SkippedItem {
            session_id: task.session_id.clone(),
            village_code: task.location.village_code.clone(),
            village_name: task.location.village_name.clone(),
            survey_no: task.survey_no,
            surnoc: surnoc.map(str::to_string),
            hissa: hissa.map(str::to_string),
            period: period.map(str::to_string),
            reason: reason.to_string(),
            retry_count: task.retry_count,
            worker_id: Some(self.id),
        };
        self.channels.ledger.save_skipped_item(&item).await
    }

    /// Whole-survey skip; the ledger already retried, so a failure here is only logged
    async fn record_skip(
        &self,
        task: &SearchTask,
        surnoc: Option<&str>,
        hissa: Option<&str>,
        period: Option<&str>,
        reason: &str,
    ) {
        if let Err(e) = self.save_skip(task, surnoc, hissa, period, reason).await {
            error!("Failed to record skipped {}: {:#}", task.summary(), e);
        }
        self.incr(MetricField::TasksSkipped, 1).await;
    }

    async fn ack(&self, task: &SearchTask) {
        if let Err(e) = self.channels.queue.ack(self.id, &task.task_id).await {
            warn!("Failed to ack {}: {:#}", task.task_id, e);
        }
    }

    async fn incr(&self, field: MetricField, by: u64) {
        if let Err(e) = self.channels.control.incr(field, by).await {
            debug!("Failed to bump {}: {:#}", field.key(), e);
        }
    }

    async fn heartbeat(&self, state: WorkerState) {
        let heartbeat = WorkerHeartbeat {
            worker_id: self.id,
            pid: self.pid,
            state,
            current_task: self.current_task.clone(),
            tasks_processed: self.stats.tasks_processed,
            tasks_failed: self.stats.tasks_failed,
            records_saved: self.stats.records_saved,
            recycles: self.stats.recycles,
            last_seen: Utc::now(),
        };
        if let Err(e) = self.channels.control.publish_heartbeat(&heartbeat).await {
            debug!("Failed to publish heartbeat: {:#}", e);
        }
    }
}

fn combination_of<'a>(chain: &[Step<'a>]) -> (Option<&'a str>, Option<&'a str>, Option<&'a str>) {
    let mut combination = (None, None, None);
    for step in chain {
        match step {
            Step::Surnoc(s) => combination.0 = Some(*s),
            Step::Hissa(h) => combination.1 = Some(*h),
            Step::Fetch(p) => combination.2 = Some(*p),
            Step::Survey(_) => {}
        }
    }
    combination
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::tests::location;
    use crate::crawler::task::VillageTask;
    use crate::portal::TokenBucket;
    use crate::storage::ledger::{MockLedger, SqliteLedger};
    use crate::storage::{MemoryRunControl, MemoryTaskQueue};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    const HISSA: &str = "1";
    const PERIOD: &str = "2023-2024";

    #[derive(Default)]
    struct PortalLog {
        opens: u32,
        closes: u32,
        resets: u32,
        surveys: Vec<u32>,
        fetches: u32,
    }

    /// Scripted portal: each survey maps surnoc -> owners under one hissa and period.
    /// Failures are keyed `survey:N`, `fetch:N:SURNOC` and consumed front to back.
    #[derive(Clone, Default)]
    struct FakePortal {
        data: Arc<HashMap<u32, Vec<(String, Vec<OwnerRow>)>>>,
        failures: Arc<StdMutex<HashMap<String, VecDeque<PortalError>>>>,
        log: Arc<StdMutex<PortalLog>>,
        hang_on_fetch: bool,
        survey: u32,
        surnoc: String,
    }

    impl FakePortal {
        fn with_data(data: HashMap<u32, Vec<(String, Vec<OwnerRow>)>>) -> Self {
            Self {
                data: Arc::new(data),
                ..Default::default()
            }
        }

        fn fail(&self, key: &str, errors: Vec<PortalError>) {
            self.failures.lock().unwrap().insert(key.to_string(), errors.into());
        }

        fn next_failure(&self, key: &str) -> Result<(), PortalError> {
            match self.failures.lock().unwrap().get_mut(key).and_then(|q| q.pop_front()) {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl FormPortal for FakePortal {
        async fn open(&mut self) -> Result<(), PortalError> {
            self.log.lock().unwrap().opens += 1;
            Ok(())
        }

        async fn close(&mut self) {
            self.log.lock().unwrap().closes += 1;
        }

        async fn reset_session(&mut self) -> Result<(), PortalError> {
            self.log.lock().unwrap().resets += 1;
            Ok(())
        }

        async fn select_location(&mut self, _location: &crate::crawler::task::Location) -> Result<(), PortalError> {
            Ok(())
        }

        async fn submit_survey(&mut self, survey_no: u32) -> Result<Vec<String>, PortalError> {
            self.log.lock().unwrap().surveys.push(survey_no);
            self.next_failure(&format!("survey:{}", survey_no))?;
            self.survey = survey_no;
            Ok(self
                .data
                .get(&survey_no)
                .map(|surnocs| surnocs.iter().map(|(s, _)| s.clone()).collect())
                .unwrap_or_default())
        }

        async fn select_surnoc(&mut self, surnoc: &str) -> Result<Vec<String>, PortalError> {
            self.surnoc = surnoc.to_string();
            Ok(vec![HISSA.to_string()])
        }

        async fn select_hissa(&mut self, _hissa: &str) -> Result<Vec<String>, PortalError> {
            Ok(vec![PERIOD.to_string()])
        }

        async fn fetch_details(&mut self, _period: &str) -> Result<Vec<OwnerRow>, PortalError> {
            if self.hang_on_fetch {
                std::future::pending::<()>().await;
            }
            self.log.lock().unwrap().fetches += 1;
            self.next_failure(&format!("fetch:{}:{}", self.survey, self.surnoc))?;
            Ok(self
                .data
                .get(&self.survey)
                .and_then(|surnocs| surnocs.iter().find(|(s, _)| *s == self.surnoc))
                .map(|(_, owners)| owners.clone())
                .unwrap_or_default())
        }
    }

    /// Gate that denies the first `denials` calls
    struct CountingGate {
        denials: AtomicU32,
    }

    #[async_trait]
    impl HealthGate for CountingGate {
        async fn should_allow_task(&self) -> bool {
            self.denials
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
        }

        async fn backoff_seconds(&self) -> u64 {
            2
        }

        async fn report_failure(&self, _worker_id: u32, _reason: &str) {}
    }

    fn owner(name: &str, extent: &str) -> OwnerRow {
        OwnerRow {
            owner_name: name.to_string(),
            extent: Some(extent.to_string()),
            khata: Some("12".to_string()),
        }
    }

    fn config() -> HarvestConfig {
        let mut config = HarvestConfig::default();
        config.workers.pop_timeout_secs = 1;
        config.workers.max_retries = 2;
        config.workers.combination_retries = 1;
        config.workers.session_resets_before_recreate = 2;
        config.rate_limit.acquire_timeout_secs = 5;
        config.sweep.empty_survey_threshold = 50;
        config.sweep.min_surveys_before_stop = 10;
        config
    }

    struct Harness {
        queue: Arc<MemoryTaskQueue>,
        control: Arc<MemoryRunControl>,
        ledger: Arc<dyn Ledger>,
        gate: Arc<dyn HealthGate>,
        _dir: Option<tempfile::TempDir>,
    }

    impl Harness {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let ledger = SqliteLedger::open(&dir.path().join("ledger.db"), 3, 5).await.unwrap();
            Self::with_ledger(Arc::new(ledger), Some(dir))
        }

        fn with_ledger(ledger: Arc<dyn Ledger>, dir: Option<tempfile::TempDir>) -> Self {
            Self {
                queue: Arc::new(MemoryTaskQueue::new(1000)),
                control: Arc::new(MemoryRunControl::new()),
                ledger,
                gate: Arc::new(CountingGate { denials: AtomicU32::new(0) }),
                _dir: dir,
            }
        }

        fn channels(&self) -> WorkerChannels {
            WorkerChannels {
                queue: self.queue.clone(),
                control: self.control.clone(),
                ledger: self.ledger.clone(),
                gate: self.gate.clone(),
                throttle: Arc::new(TokenBucket::new(100, 100.0)),
            }
        }

        async fn enqueue(&self, max_survey: u32) {
            let village = VillageTask::new("search_test", location("101"), max_survey);
            for task in village.generate_survey_tasks("Ramesh", &["RAMESH".to_string()]) {
                self.queue.push(0, &task).await.unwrap();
            }
        }

        /// Run a worker until its lane drains, then request shutdown
        async fn run(&self, config: &HarvestConfig, portal: FakePortal) -> WorkerStats {
            let worker = Worker::new(0, config, portal, self.channels());
            let (_tx, rx) = watch::channel(false);
            let handle = tokio::spawn(worker.run(rx));

            loop {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let pending = self.queue.len(0).await.unwrap() + self.queue.inflight_len(0).await.unwrap();
                if pending == 0 {
                    break;
                }
            }
            self.control.request_shutdown().await.unwrap();
            handle.await.unwrap().unwrap()
        }
    }

    fn sample_data() -> HashMap<u32, Vec<(String, Vec<OwnerRow>)>> {
        let mut data = HashMap::new();
        data.insert(
            2,
            vec![
                ("*".to_string(), vec![owner("Ramesh Kumar", "1-02-00"), owner("Lakshmi", "0-20-00")]),
                ("1".to_string(), vec![owner("Suresh", "0-05-00")]),
            ],
        );
        data
    }

    #[tokio::test]
    async fn test_sweep_saves_records_and_checkpoints() {
        let harness = Harness::new().await;
        harness.enqueue(3).await;

        let portal = FakePortal::with_data(sample_data());
        let log = portal.log.clone();
        let stats = harness.run(&config(), portal).await;

        assert_eq!(stats.tasks_processed, 3);
        assert_eq!(stats.records_saved, 3);
        assert_eq!(harness.ledger.count_records("search_test", false).await.unwrap(), 3);
        assert_eq!(harness.ledger.count_records("search_test", true).await.unwrap(), 1);

        let checkpoint = harness.ledger.get_last_checkpoint("search_test", "101").await.unwrap().unwrap();
        assert_eq!(checkpoint.survey_no, 3);

        let progress = harness.ledger.get_village_progress("search_test").await.unwrap();
        assert_eq!(progress[0].status, "completed");
        assert_eq!(progress[0].stop_reason.as_deref(), Some("max_reached"));
        assert!(progress[0].confidence.is_some());

        let metrics = harness.control.metrics().await.unwrap();
        assert_eq!(metrics.tasks_completed, 3);
        assert_eq!(metrics.matches_found, 1);
        assert_eq!(metrics.villages_completed, 1);

        let log = log.lock().unwrap();
        assert_eq!(log.surveys, vec![1, 2, 3]);
        assert_eq!(log.opens, 1);
        assert!(log.closes >= 1);
    }

    #[tokio::test]
    async fn test_reprocessing_a_task_adds_no_duplicates() {
        let harness = Harness::new().await;
        let config = config();

        harness.enqueue(3).await;
        harness.run(&config, FakePortal::with_data(sample_data())).await;
        let first = harness.ledger.count_records("search_test", false).await.unwrap();

        // a resumed run re-queues a failed village after resetting it
        harness.control.clear_shutdown().await.unwrap();
        harness.ledger.reset_village_progress("search_test", "101").await.unwrap();
        harness.enqueue(3).await;
        let portal = FakePortal::with_data(sample_data());
        let log = portal.log.clone();
        let stats = harness.run(&config, portal).await;

        assert_eq!(log.lock().unwrap().surveys, vec![1, 2, 3]);
        assert_eq!(harness.ledger.count_records("search_test", false).await.unwrap(), first);
        assert_eq!(stats.records_saved, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_combination_is_skipped_alone() {
        let harness = Harness::with_ledger(Arc::new(MemoryLedger::default()), None);
        harness.enqueue(2).await;

        let portal = FakePortal::with_data(sample_data());
        portal.fail(
            "fetch:2:*",
            vec![
                PortalError::PortalIssue("facing issues".into()),
                PortalError::PortalIssue("facing issues".into()),
            ],
        );
        harness.run(&config(), portal).await;

        let skipped = harness.ledger.get_skipped_items("search_test").await.unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].survey_no, 2);
        assert_eq!(skipped[0].surnoc.as_deref(), Some("*"));
        assert_eq!(skipped[0].period.as_deref(), Some(PERIOD));
        assert_eq!(skipped[0].reason, "portal_issue");

        // surnoc "1" was still harvested and the survey checkpointed
        assert_eq!(harness.ledger.count_records("search_test", false).await.unwrap(), 1);
        let checkpoint = harness.ledger.get_last_checkpoint("search_test", "101").await.unwrap().unwrap();
        assert_eq!(checkpoint.survey_no, 2);
        assert_eq!(checkpoint.processed_surnocs, vec!["*", "1"]);
        assert_eq!(harness.control.metrics().await.unwrap().combinations_skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_expiry_resets_then_recreates() {
        let harness = Harness::with_ledger(Arc::new(MemoryLedger::default()), None);
        harness.enqueue(1).await;

        let portal = FakePortal::with_data(HashMap::new());
        portal.fail(
            "survey:1",
            vec![
                PortalError::SessionExpired("session expired".into()),
                PortalError::SessionExpired("session expired".into()),
            ],
        );
        let log = portal.log.clone();
        harness.run(&config(), portal).await;

        let log = log.lock().unwrap();
        assert_eq!(log.resets, 1);
        assert_eq!(log.opens, 2);
        assert_eq!(log.surveys, vec![1, 1, 1]);

        let metrics = harness.control.metrics().await.unwrap();
        assert_eq!(metrics.session_resets, 2);
        assert_eq!(metrics.browser_recreations, 1);
        assert_eq!(metrics.tasks_retried, 2);
        assert_eq!(metrics.tasks_completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_skip_the_survey_and_continue() {
        let harness = Harness::with_ledger(Arc::new(MemoryLedger::default()), None);
        harness.enqueue(2).await;

        let portal = FakePortal::with_data(sample_data());
        portal.fail("survey:1", vec![PortalError::Timeout("slow".into()); 3]);
        let log = portal.log.clone();
        harness.run(&config(), portal).await;

        let skipped = harness.ledger.get_skipped_items("search_test").await.unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].survey_no, 1);
        assert_eq!(skipped[0].surnoc, None);
        assert_eq!(skipped[0].retry_count, 2);
        assert_eq!(skipped[0].reason, "transient");

        assert_eq!(log.lock().unwrap().surveys, vec![1, 1, 1, 2]);
        assert_eq!(harness.ledger.count_records("search_test", false).await.unwrap(), 3);

        let progress = harness.ledger.get_village_progress("search_test").await.unwrap();
        assert_eq!(progress[0].status, "completed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_denial_requeues_at_head() {
        let mut harness = Harness::with_ledger(Arc::new(MemoryLedger::default()), None);
        harness.gate = Arc::new(CountingGate { denials: AtomicU32::new(2) });
        harness.enqueue(3).await;

        let portal = FakePortal::with_data(sample_data());
        let log = portal.log.clone();
        harness.run(&config(), portal).await;

        assert_eq!(log.lock().unwrap().surveys, vec![1, 2, 3]);
        let metrics = harness.control.metrics().await.unwrap();
        assert_eq!(metrics.gate_denials, 2);
        assert_eq!(metrics.tasks_completed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_smart_stop_drops_the_rest_of_the_village() {
        let harness = Harness::with_ledger(Arc::new(MemoryLedger::default()), None);
        harness.enqueue(20).await;

        let mut config = config();
        config.sweep.empty_survey_threshold = 3;
        config.sweep.min_surveys_before_stop = 3;

        let portal = FakePortal::with_data(HashMap::new());
        let log = portal.log.clone();
        harness.run(&config, portal).await;

        assert_eq!(log.lock().unwrap().surveys, vec![1, 2, 3]);
        let progress = harness.ledger.get_village_progress("search_test").await.unwrap();
        assert_eq!(progress[0].stop_reason.as_deref(), Some("smart_stop"));
        assert_eq!(progress[0].last_survey_no, 3);
    }

    fn sparse_config() -> HarvestConfig {
        let mut config = config();
        config.sweep.empty_survey_threshold = 5;
        config.sweep.min_surveys_before_stop = 10;
        config
    }

    #[tokio::test]
    async fn test_replacement_worker_drops_a_stopped_village() {
        let harness = Harness::new().await;
        let config = sparse_config();
        let tasks = VillageTask::new("search_test", location("101"), 30).generate_survey_tasks("Ramesh", &[]);
        for task in &tasks[..12] {
            harness.queue.push(0, task).await.unwrap();
        }

        let portal = FakePortal::with_data(HashMap::new());
        let log = portal.log.clone();
        harness.run(&config, portal).await;
        assert_eq!(log.lock().unwrap().surveys, (1..=10).collect::<Vec<_>>());

        // a new process on the same lane and ledger sees the remaining surveys
        harness.control.clear_shutdown().await.unwrap();
        for task in &tasks[12..20] {
            harness.queue.push(0, task).await.unwrap();
        }
        let portal = FakePortal::with_data(HashMap::new());
        let log = portal.log.clone();
        let stats = harness.run(&config, portal).await;

        assert!(log.lock().unwrap().surveys.is_empty());
        assert_eq!(stats.tasks_processed, 0);
        assert_eq!(harness.queue.len(0).await.unwrap(), 0);

        let progress = harness.ledger.get_village_progress("search_test").await.unwrap();
        assert_eq!(progress[0].stop_reason.as_deref(), Some("smart_stop"));
        assert_eq!(progress[0].last_survey_no, 10);
    }

    #[tokio::test]
    async fn test_replacement_worker_continues_the_empty_run() {
        let harness = Harness::new().await;
        let config = sparse_config();
        let tasks = VillageTask::new("search_test", location("101"), 30).generate_survey_tasks("Ramesh", &[]);
        for task in &tasks[..7] {
            harness.queue.push(0, task).await.unwrap();
        }
        harness.run(&config, FakePortal::with_data(HashMap::new())).await;

        let progress = harness.ledger.get_village_progress("search_test").await.unwrap();
        assert_eq!(progress[0].status, "in_progress");
        assert_eq!(progress[0].consecutive_empty, 7);

        harness.control.clear_shutdown().await.unwrap();
        for task in &tasks[7..] {
            harness.queue.push(0, task).await.unwrap();
        }
        let portal = FakePortal::with_data(HashMap::new());
        let log = portal.log.clone();
        harness.run(&config, portal).await;

        // seven empty surveys were already on record, so ten checked stops the sweep
        assert_eq!(log.lock().unwrap().surveys, vec![8, 9, 10]);
        let progress = harness.ledger.get_village_progress("search_test").await.unwrap();
        assert_eq!(progress[0].status, "completed");
        assert_eq!(progress[0].stop_reason.as_deref(), Some("smart_stop"));
        assert_eq!(progress[0].surveys_checked, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_failure_requeues_the_task() {
        let mut ledger = MockLedger::new();
        ledger
            .expect_save_record()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("database is locked")));
        ledger.expect_save_record().returning(|_| Ok(true));
        ledger.expect_save_checkpoint().times(1).returning(|_, _, _, _| Ok(()));
        ledger.expect_update_village_progress().returning(|_| Ok(()));
        ledger.expect_save_skipped_item().never();
        ledger.expect_get_village_progress().times(1).returning(|_| Ok(vec![]));

        let harness = Harness::with_ledger(Arc::new(ledger), None);
        let village = VillageTask::new("search_test", location("101"), 5);
        let task = village.generate_survey_tasks_from(2, "Ramesh", &[]).remove(0);
        harness.queue.push(0, &task).await.unwrap();

        let mut data = HashMap::new();
        data.insert(2, vec![("*".to_string(), vec![owner("Ramesh", "1-00-00")])]);
        harness.run(&config(), FakePortal::with_data(data)).await;

        let metrics = harness.control.metrics().await.unwrap();
        assert_eq!(metrics.tasks_retried, 1);
        assert_eq!(metrics.tasks_completed, 1);
        assert_eq!(metrics.records_saved, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_records_the_inflight_task() {
        let harness = Harness::with_ledger(Arc::new(MemoryLedger::default()), None);
        harness.enqueue(2).await;

        let mut portal = FakePortal::with_data(sample_data());
        portal.hang_on_fetch = true;
        let log = portal.log.clone();

        let worker = Worker::new(0, &config(), portal, harness.channels());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx));

        while log.lock().unwrap().surveys.len() < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let skipped = harness.ledger.get_skipped_items("search_test").await.unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].survey_no, 2);
        assert_eq!(skipped[0].reason, "interrupted");
        assert_eq!(harness.queue.inflight_len(0).await.unwrap(), 0);
        assert!(log.lock().unwrap().closes >= 1);

        let heartbeats = harness.control.heartbeats().await.unwrap();
        assert_eq!(heartbeats[0].state, WorkerState::Stopped);
    }

    /// Ledger kept in memory, for tests running on a paused clock
    #[derive(Default)]
    struct MemoryLedger {
        records: StdMutex<Vec<LandRecord>>,
        checkpoints: StdMutex<HashMap<(String, String), crate::storage::Checkpoint>>,
        skipped: StdMutex<Vec<SkippedItem>>,
        progress: StdMutex<HashMap<String, VillageProgress>>,
    }

    fn same_key(a: &LandRecord, b: &LandRecord) -> bool {
        a.session_id == b.session_id
            && a.village_code == b.village_code
            && a.survey_no == b.survey_no
            && a.surnoc == b.surnoc
            && a.hissa == b.hissa
            && a.period == b.period
            && a.owner_name == b.owner_name
    }

    #[async_trait]
    impl Ledger for MemoryLedger {
        async fn create_session(&self, _params: &crate::storage::SessionParams) -> Result<String> {
            Ok("search_test".into())
        }

        async fn update_session_status(&self, _session_id: &str, _status: &str) -> Result<()> {
            Ok(())
        }

        async fn get_session(&self, _session_id: &str) -> Result<Option<crate::storage::SessionRecord>> {
            Ok(None)
        }

        async fn save_record(&self, record: &LandRecord) -> Result<bool> {
            let mut records = self.records.lock().unwrap();
            if let Some(existing) = records.iter_mut().find(|r| same_key(r, record)) {
                *existing = record.clone();
                return Ok(false);
            }
            records.push(record.clone());
            Ok(true)
        }

        async fn count_records(&self, session_id: &str, matches_only: bool) -> Result<u64> {
            let records = self.records.lock().unwrap();
            Ok(records
                .iter()
                .filter(|r| r.session_id == session_id && (r.is_match || !matches_only))
                .count() as u64)
        }

        async fn save_checkpoint(&self, session_id: &str, village_code: &str, survey_no: u32, processed_surnocs: &[String]) -> Result<()> {
            let mut checkpoints = self.checkpoints.lock().unwrap();
            let entry = checkpoints
                .entry((session_id.to_string(), village_code.to_string()))
                .or_insert(crate::storage::Checkpoint { survey_no: 0, processed_surnocs: Vec::new() });
            if survey_no >= entry.survey_no {
                entry.survey_no = survey_no;
                entry.processed_surnocs = processed_surnocs.to_vec();
            }
            Ok(())
        }

        async fn get_last_checkpoint(&self, session_id: &str, village_code: &str) -> Result<Option<crate::storage::Checkpoint>> {
            Ok(self
                .checkpoints
                .lock()
                .unwrap()
                .get(&(session_id.to_string(), village_code.to_string()))
                .cloned())
        }

        async fn save_skipped_item(&self, item: &SkippedItem) -> Result<()> {
            self.skipped.lock().unwrap().push(item.clone());
            Ok(())
        }

        async fn get_skipped_items(&self, session_id: &str) -> Result<Vec<SkippedItem>> {
            Ok(self
                .skipped
                .lock()
                .unwrap()
                .iter()
                .filter(|i| i.session_id == session_id)
                .cloned()
                .collect())
        }

        async fn update_village_progress(&self, progress: &VillageProgress) -> Result<()> {
            let mut stored = self.progress.lock().unwrap();
            let entry = stored.entry(progress.village_code.clone()).or_insert_with(|| progress.clone());
            let last = entry.last_survey_no.max(progress.last_survey_no);
            *entry = progress.clone();
            entry.last_survey_no = last;
            Ok(())
        }

        async fn reset_village_progress(&self, _session_id: &str, village_code: &str) -> Result<()> {
            if let Some(entry) = self.progress.lock().unwrap().get_mut(village_code) {
                entry.status = VillageStatus::Pending.as_str().to_string();
                entry.stop_reason = None;
                entry.surveys_checked = 0;
                entry.consecutive_empty = 0;
                entry.last_with_data = None;
                entry.skipped_count = 0;
            }
            Ok(())
        }

        async fn get_village_progress(&self, session_id: &str) -> Result<Vec<VillageProgress>> {
            Ok(self
                .progress
                .lock()
                .unwrap()
                .values()
                .filter(|p| p.session_id == session_id)
                .cloned()
                .collect())
        }
    }
}
