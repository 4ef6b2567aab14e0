use anyhow::{Result, Context, bail};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Serialize, Deserialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cli::config::HarvestConfig;
use crate::crawler::supervisor::{Supervisor, SupervisorSummary, WorkerCommand};
use crate::crawler::task::{Location, VillageStatus, VillageTask};
use crate::extract::owner_variants;
use crate::portal::{HealthMonitor, HealthSnapshot, PortalStatus};
use crate::storage::{Ledger, RunControl, SessionParams, TaskQueue, VillageProgress, WorkerHeartbeat};
use crate::utils::metrics::RunMetrics;

/// How often the monitor's snapshot is pushed to workers
const HEALTH_BRIDGE_INTERVAL: Duration = Duration::from_secs(2);

/// What to harvest
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub villages: Vec<Location>,
    pub owner_name: String,
    pub owner_variants: Vec<String>,
    pub max_survey: u32,
    /// Continue an existing session instead of creating one
    pub resume_session: Option<String>,
}

impl RunRequest {
    /// Configured variants plus the generated spellings of the owner name
    pub fn all_variants(&self) -> Vec<String> {
        let mut variants = self.owner_variants.clone();
        for variant in owner_variants(&self.owner_name) {
            if !variants.contains(&variant) {
                variants.push(variant);
            }
        }
        variants
    }
}

/// The villages one worker lane will sweep, each with its first survey
#[derive(Debug, Clone)]
pub struct LanePlan {
    pub lane: u32,
    pub villages: Vec<(VillageTask, u32)>,
}

impl LanePlan {
    pub fn task_count(&self) -> usize {
        self.villages
            .iter()
            .map(|(village, start)| (village.max_survey + 1).saturating_sub(*start) as usize)
            .sum()
    }
}

/// Aggregated run view, shared by the live run and the `status` command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub session_id: String,
    pub status: String,
    pub owner_name: String,
    pub started_at: DateTime<Utc>,
    pub workers: Vec<WorkerHeartbeat>,
    pub supervisor: Option<SupervisorSummary>,
    pub metrics: RunMetrics,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub health: Option<HealthSnapshot>,
    pub villages: Vec<VillageProgress>,
    pub total_villages: u32,
    pub progress_pct: f64,
    pub tasks_per_minute: f64,
    pub eta_minutes: Option<f64>,
}

impl RunState {
    pub async fn collect(
        session_id: &str,
        lanes: u32,
        ledger: &dyn Ledger,
        control: &dyn RunControl,
        queue: &dyn TaskQueue,
        supervisor: Option<&Supervisor>,
    ) -> Result<Self> {
        let session = ledger
            .get_session(session_id)
            .await?
            .context(format!("Unknown session: {}", session_id))?;

        let villages = ledger.get_village_progress(session_id).await?;
        let metrics = control.metrics().await?;

        let mut queue_depth = 0;
        let mut in_flight = 0;
        for lane in 0..lanes {
            queue_depth += queue.len(lane).await?;
            in_flight += queue.inflight_len(lane).await?;
        }

        let supervisor = match supervisor {
            Some(supervisor) => Some(supervisor.summary().await),
            None => None,
        };

        // Surveys covered: everything for finished villages, up to the last one seen otherwise
        let planned = session.total_villages as u64 * session.max_survey as u64;
        let covered: u64 = villages
            .iter()
            .map(|v| match VillageStatus::parse(&v.status) {
                VillageStatus::Completed | VillageStatus::Failed => v.max_survey_no as u64,
                _ => v.last_survey_no as u64,
            })
            .sum();
        let progress_pct = if planned == 0 {
            0.0
        } else {
            (covered as f64 / planned as f64 * 100.0).min(100.0)
        };

        let tasks_per_minute = metrics.tasks_per_minute(session.started_at);
        let eta_minutes = (tasks_per_minute > 0.0 && planned > covered)
            .then(|| (planned - covered) as f64 / tasks_per_minute);

        Ok(Self {
            session_id: session.session_id,
            status: session.status,
            owner_name: session.owner_name,
            started_at: session.started_at,
            workers: control.heartbeats().await?,
            supervisor,
            metrics,
            queue_depth,
            in_flight,
            health: control.health().await?,
            villages,
            total_villages: session.total_villages,
            progress_pct,
            tasks_per_minute,
            eta_minutes,
        })
    }

    pub fn log(&self) {
        let health = self
            .health
            .as_ref()
            .map(|h| h.metrics.status.to_string())
            .unwrap_or_else(|| "UNKNOWN".to_string());
        let alive = self.supervisor.as_ref().map_or(0, |s| s.alive_workers);
        let browsers = self.supervisor.as_ref().map_or(0, |s| s.budget.browser_processes);

        info!(
            "Progress {:.1}% | tasks {} done, {} skipped, {} retried | records {} ({} matches) | queue {} (+{} in flight) | workers {} | browsers {} | portal {} | {:.1}/min{}",
            self.progress_pct,
            self.metrics.tasks_completed,
            self.metrics.tasks_skipped,
            self.metrics.tasks_retried,
            self.metrics.records_saved,
            self.metrics.matches_found,
            self.queue_depth,
            self.in_flight,
            alive,
            browsers,
            health,
            self.tasks_per_minute,
            self.eta_minutes
                .map(|eta| format!(" | ETA {:.0} min", eta))
                .unwrap_or_default()
        );
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub session_id: String,
    pub status: String,
    pub state: Option<RunState>,
}

/// Round-robin villages over worker lanes; a village never spans two lanes
pub fn partition(villages: &[Location], lanes: u32) -> Vec<Vec<Location>> {
    let lanes = lanes.max(1) as usize;
    let mut partitions = vec![Vec::new(); lanes];
    for (i, village) in villages.iter().enumerate() {
        partitions[i % lanes].push(village.clone());
    }
    partitions
}

/// Push a lane's surveys in village order; blocks while the lane is full
async fn feed(queue: Arc<dyn TaskQueue>, plan: LanePlan, owner_name: String, variants: Vec<String>) -> Result<usize> {
    let mut pushed = 0;
    for (village, start) in &plan.villages {
        for task in village.generate_survey_tasks_from(*start, &owner_name, &variants) {
            queue.push(plan.lane, &task).await?;
            pushed += 1;
        }
        debug!("Lane {}: queued {} from survey {}", plan.lane, village.location.village_name, start);
    }
    Ok(pushed)
}

/// Publish the breaker state for worker processes and fold their failure reports back in
async fn bridge_health(
    monitor: Arc<HealthMonitor>,
    control: Arc<dyn RunControl>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(HEALTH_BRIDGE_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => break,
        }

        match control.drain_failure_reports().await {
            Ok(reports) => {
                for report in reports {
                    monitor.report_failure(report.worker_id, &report.reason).await;
                }
            }
            Err(e) => warn!("Failed to drain failure reports: {:#}", e),
        }

        if let Err(e) = control.publish_health(&monitor.metrics().await).await {
            warn!("Failed to publish health snapshot: {:#}", e);
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Create a session, or reopen the one being resumed
pub async fn open_session(ledger: &dyn Ledger, request: &RunRequest) -> Result<String> {
    if let Some(session_id) = &request.resume_session {
        let session = ledger
            .get_session(session_id)
            .await?
            .context(format!("Cannot resume unknown session: {}", session_id))?;
        if session.owner_name != request.owner_name {
            warn!(
                "Resuming session {} created for '{}' with owner '{}'",
                session_id, session.owner_name, request.owner_name
            );
        }
        ledger.update_session_status(session_id, "running").await?;
        info!("Resuming session {}", session_id);
        return Ok(session_id.clone());
    }

    let session_id = ledger
        .create_session(&SessionParams {
            owner_name: request.owner_name.clone(),
            owner_variants: request.owner_variants.clone(),
            max_survey: request.max_survey,
            total_villages: request.villages.len() as u32,
        })
        .await?;
    info!("Created session {}", session_id);
    Ok(session_id)
}

/// Owns one run: session, task expansion, pool, health and completion
pub struct Coordinator {
    config: HarvestConfig,
    ledger: Arc<dyn Ledger>,
    queue: Arc<dyn TaskQueue>,
    control: Arc<dyn RunControl>,
}

impl Coordinator {
    pub fn new(
        config: HarvestConfig,
        ledger: Arc<dyn Ledger>,
        queue: Arc<dyn TaskQueue>,
        control: Arc<dyn RunControl>,
    ) -> Self {
        Self {
            config,
            ledger,
            queue,
            control,
        }
    }

    fn lanes(&self) -> u32 {
        self.config.workers.num_workers.max(1)
    }

    /// Create a session, or reopen the one being resumed
    pub async fn open_session(&self, request: &RunRequest) -> Result<String> {
        open_session(self.ledger.as_ref(), request).await
    }

    /// Partition the villages and work out where each one resumes
    pub async fn plan(&self, session_id: &str, request: &RunRequest) -> Result<Vec<LanePlan>> {
        let progress: HashMap<String, VillageProgress> = self
            .ledger
            .get_village_progress(session_id)
            .await?
            .into_iter()
            .map(|p| (p.village_code.clone(), p))
            .collect();

        let mut plans = Vec::new();
        for (lane, villages) in partition(&request.villages, self.lanes()).into_iter().enumerate() {
            let mut planned = Vec::new();

            for location in villages {
                let code = location.village_code.clone();
                if progress
                    .get(&code)
                    .is_some_and(|p| VillageStatus::parse(&p.status) == VillageStatus::Completed)
                {
                    info!("Village {} already completed, skipping", location.village_name);
                    continue;
                }

                let start = match self.ledger.get_last_checkpoint(session_id, &code).await? {
                    Some(checkpoint) => checkpoint.survey_no + 1,
                    None => 1,
                };
                if start > request.max_survey {
                    info!("Village {} already swept to survey {}", location.village_name, request.max_survey);
                    continue;
                }
                if start > 1 {
                    info!("Village {} resumes at survey {}", location.village_name, start);
                }
                // workers drop tasks for failed villages, so clear the mark before re-queueing
                if progress
                    .get(&code)
                    .is_some_and(|p| VillageStatus::parse(&p.status) == VillageStatus::Failed)
                {
                    info!("Retrying failed village {}", location.village_name);
                    self.ledger.reset_village_progress(session_id, &code).await?;
                }

                planned.push((VillageTask::new(session_id, location, request.max_survey), start));
            }

            plans.push(LanePlan {
                lane: lane as u32,
                villages: planned,
            });
        }

        Ok(plans)
    }

    async fn lanes_drained(&self) -> Result<bool> {
        for lane in 0..self.lanes() {
            if self.queue.len(lane).await? > 0 || self.queue.inflight_len(lane).await? > 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn clear_lanes(&self) {
        for lane in 0..self.lanes() {
            if let Err(e) = self.queue.clear(lane).await {
                warn!("Failed to clear lane {}: {:#}", lane, e);
            }
        }
    }

    /// Run until every lane drains, a signal arrives, or the pool dies
    ///
    /// `session_id` comes from [`open_session`](Self::open_session); workers
    /// spawned from `command` must be pointed at the same session.
    pub async fn run(
        &self,
        session_id: &str,
        request: &RunRequest,
        command: WorkerCommand,
        health: Arc<HealthMonitor>,
    ) -> Result<RunSummary> {
        if request.villages.is_empty() {
            bail!("No villages to process");
        }

        let session_id = session_id.to_string();
        let variants = request.all_variants();
        self.control.clear_shutdown().await?;
        self.clear_lanes().await;

        let plans = self.plan(&session_id, request).await?;
        let total_tasks: usize = plans.iter().map(LanePlan::task_count).sum();
        if total_tasks == 0 {
            info!("Nothing left to do for session {}", session_id);
            self.ledger.update_session_status(&session_id, "completed").await?;
            return Ok(RunSummary {
                session_id,
                status: "completed".to_string(),
                state: None,
            });
        }
        info!("Session {}: {} surveys over {} lanes", session_id, total_tasks, plans.len());

        health.on_status_change(Box::new(|old, new| match new {
            PortalStatus::Healthy => info!("Portal status {} -> {}", old, new),
            _ => warn!("Portal status {} -> {}", old, new),
        }));
        info!("Portal status at start: {}", health.force_check().await);
        let (stop_tx, stop_rx) = watch::channel(false);
        let prober = tokio::spawn(health.clone().run(stop_rx.clone()));
        let bridge = tokio::spawn(bridge_health(health.clone(), self.control.clone(), stop_rx));

        let feeders = plans
            .into_iter()
            .map(|plan| feed(self.queue.clone(), plan, request.owner_name.clone(), variants.clone()));
        let mut feeding: Option<JoinHandle<Result<Vec<usize>>>> = Some(tokio::spawn(try_join_all(feeders)));

        let mut supervisor = Supervisor::new(
            command,
            self.config.workers.clone(),
            self.config.browser.process_names.clone(),
            self.control.clone(),
        );
        supervisor.start().await?;

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.workers.monitor_interval_secs.max(1)));
        let mut drained_ticks = 0;

        let status = loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut shutdown => {
                    warn!("Interrupted, stopping run");
                    break "stopped";
                }
            }

            match RunState::collect(
                &session_id,
                self.lanes(),
                self.ledger.as_ref(),
                self.control.as_ref(),
                self.queue.as_ref(),
                Some(&supervisor),
            )
            .await
            {
                Ok(state) => state.log(),
                Err(e) => warn!("Failed to collect run state: {:#}", e),
            }

            if feeding.as_ref().is_some_and(|f| f.is_finished()) {
                if let Some(handle) = feeding.take() {
                    match handle.await {
                        Ok(Ok(pushed)) => info!("All {} surveys queued", pushed.iter().sum::<usize>()),
                        Ok(Err(e)) => {
                            error!("Feeding tasks failed: {:#}", e);
                            break "failed";
                        }
                        Err(e) => {
                            error!("Feeder panicked: {}", e);
                            break "failed";
                        }
                    }
                }
            }

            if feeding.is_none() {
                match self.lanes_drained().await {
                    Ok(true) => drained_ticks += 1,
                    Ok(false) => drained_ticks = 0,
                    Err(e) => warn!("Failed to read queue depth: {:#}", e),
                }
                // Two quiet ticks in a row: a pop may be between its dequeue and in-flight write
                if drained_ticks >= 2 {
                    info!("All lanes drained");
                    break "completed";
                }
            }

            if !supervisor.can_recover().await {
                error!("No workers left alive and none will be restarted");
                break "failed";
            }
        };

        if let Some(handle) = feeding.take() {
            handle.abort();
        }
        supervisor.stop().await?;

        let _ = stop_tx.send(true);
        if let Err(e) = prober.await {
            debug!("Health prober ended abnormally: {}", e);
        }
        if let Err(e) = bridge.await {
            debug!("Health bridge ended abnormally: {}", e);
        }

        self.ledger.update_session_status(&session_id, status).await?;
        let state = RunState::collect(
            &session_id,
            self.lanes(),
            self.ledger.as_ref(),
            self.control.as_ref(),
            self.queue.as_ref(),
            None,
        )
        .await
        .ok();
        if let Some(state) = &state {
            state.log();
        }

        if status == "completed" {
            self.clear_lanes().await;
        }
        info!("Session {} {}", session_id, status);

        Ok(RunSummary {
            session_id,
            status: status.to_string(),
            state,
        })
    }
}
