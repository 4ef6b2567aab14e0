use anyhow::{Result, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::Client;
use serde::{Serialize, Deserialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cli::config::HealthSettings;
use crate::utils::metrics::RequestTimer;

/// Circuit breaker state of the remote portal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortalStatus {
    Healthy,
    Degraded,
    RateLimited,
    NetworkCongestion,
    Down,
    Unknown,
}

impl fmt::Display for PortalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PortalStatus::Healthy => "HEALTHY",
            PortalStatus::Degraded => "DEGRADED",
            PortalStatus::RateLimited => "RATE_LIMITED",
            PortalStatus::NetworkCongestion => "NETWORK_CONGESTION",
            PortalStatus::Down => "DOWN",
            PortalStatus::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Counters mutated only by the probe loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalHealthMetrics {
    pub status: PortalStatus,
    pub response_time_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_timeouts: u32,
    pub total_checks: u64,
    pub failed_checks: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for PortalHealthMetrics {
    fn default() -> Self {
        Self {
            status: PortalStatus::Unknown,
            response_time_ms: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            consecutive_timeouts: 0,
            total_checks: 0,
            failed_checks: 0,
            last_check: None,
            last_success: None,
            last_error: None,
        }
    }
}

/// Point-in-time view of the breaker, published to worker processes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub metrics: PortalHealthMetrics,
    /// Percentage of probes that succeeded, 0..=100
    pub success_rate: f64,
    pub cooldown_remaining_secs: u64,
    pub backoff_secs: u64,
    pub taken_at: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Admission decision shared by the in-process monitor and remote readers
    pub fn allows_task(&self, degraded_admit_ratio: f64) -> bool {
        admits(self.metrics.status, self.cooldown_remaining_secs > 0, degraded_admit_ratio)
    }
}

fn admits(status: PortalStatus, cooling_down: bool, degraded_admit_ratio: f64) -> bool {
    if cooling_down {
        return false;
    }
    match status {
        PortalStatus::Healthy | PortalStatus::Unknown => true,
        PortalStatus::Degraded | PortalStatus::NetworkCongestion => {
            rand::thread_rng().gen_bool(degraded_admit_ratio.clamp(0.0, 1.0))
        }
        PortalStatus::RateLimited | PortalStatus::Down => false,
    }
}

/// Result of a single reachability probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Response { status: u16, elapsed: Duration },
    Timeout,
    ConnectionFailed(String),
}

/// Gate consulted by workers before executing a task
#[async_trait]
pub trait HealthGate: Send + Sync {
    async fn should_allow_task(&self) -> bool;
    async fn backoff_seconds(&self) -> u64;
    async fn report_failure(&self, worker_id: u32, reason: &str);
}

pub type StatusCallback = Box<dyn Fn(PortalStatus, PortalStatus) + Send + Sync>;

struct MonitorState {
    metrics: PortalHealthMetrics,
    failure_reports: VecDeque<(u32, Instant)>,
    cooldown_until: Option<Instant>,
}

/// Browser-free prober driving the circuit breaker
pub struct HealthMonitor {
    settings: HealthSettings,
    url: String,
    client: Client,
    state: Mutex<MonitorState>,
    callbacks: std::sync::RwLock<Vec<StatusCallback>>,
}

impl HealthMonitor {
    pub fn new(settings: HealthSettings, url: &str) -> Result<Self> {
        // The portal's certificate chain is broken; reachability is all we check
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.probe_timeout_secs))
            .danger_accept_invalid_certs(true)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            settings,
            url: url.to_string(),
            client,
            state: Mutex::new(MonitorState {
                metrics: PortalHealthMetrics::default(),
                failure_reports: VecDeque::new(),
                cooldown_until: None,
            }),
            callbacks: std::sync::RwLock::new(Vec::new()),
        })
    }

    /// Register a listener for status transitions
    pub fn on_status_change(&self, callback: StatusCallback) {
        if let Ok(mut callbacks) = self.callbacks.write() {
            callbacks.push(callback);
        }
    }

    fn notify(&self, old: PortalStatus, new: PortalStatus) {
        if let Ok(callbacks) = self.callbacks.read() {
            for callback in callbacks.iter() {
                callback(old, new);
            }
        }
    }

    /// One HEAD request against the portal
    pub async fn probe(&self) -> ProbeResult {
        let timer = RequestTimer::start();

        match self.client.head(&self.url).send().await {
            Ok(response) => ProbeResult::Response {
                status: response.status().as_u16(),
                elapsed: timer.elapsed(),
            },
            Err(e) if e.is_timeout() => ProbeResult::Timeout,
            Err(e) => ProbeResult::ConnectionFailed(e.to_string()),
        }
    }

    /// Probe now and fold the result into the breaker
    pub async fn check(&self) -> PortalStatus {
        let result = self.probe().await;
        debug!("Health probe result: {:?}", result);
        self.record_probe(result).await
    }

    pub async fn force_check(&self) -> PortalStatus {
        info!("Forcing portal health check");
        self.check().await
    }

    /// Apply one probe result to the counters and return the new status
    pub async fn record_probe(&self, result: ProbeResult) -> PortalStatus {
        let (old, new) = {
            let mut state = self.state.lock().await;
            let metrics = &mut state.metrics;
            let old = metrics.status;
            let now = Utc::now();

            metrics.total_checks += 1;
            metrics.last_check = Some(now);

            let failure = match result {
                ProbeResult::Response { status, elapsed } if status < 400 => {
                    let ms = elapsed.as_millis() as u64;
                    metrics.response_time_ms = Some(ms);
                    metrics.status = if ms < self.settings.healthy_ms {
                        PortalStatus::Healthy
                    } else if ms < self.settings.degraded_ms {
                        PortalStatus::Degraded
                    } else {
                        PortalStatus::NetworkCongestion
                    };
                    None
                }
                ProbeResult::Response { status: 429, elapsed } => {
                    metrics.response_time_ms = Some(elapsed.as_millis() as u64);
                    metrics.status = PortalStatus::RateLimited;
                    Some("HTTP 429".to_string())
                }
                ProbeResult::Response { status, elapsed } if status >= 500 => {
                    metrics.response_time_ms = Some(elapsed.as_millis() as u64);
                    metrics.status = PortalStatus::Down;
                    Some(format!("HTTP {}", status))
                }
                ProbeResult::Response { status, elapsed } => {
                    metrics.response_time_ms = Some(elapsed.as_millis() as u64);
                    metrics.status = PortalStatus::Degraded;
                    Some(format!("HTTP {}", status))
                }
                ProbeResult::Timeout => {
                    metrics.consecutive_timeouts += 1;
                    metrics.response_time_ms = None;
                    metrics.status = if metrics.consecutive_timeouts > 1 {
                        PortalStatus::RateLimited
                    } else {
                        PortalStatus::NetworkCongestion
                    };
                    Some("probe timed out".to_string())
                }
                ProbeResult::ConnectionFailed(message) => {
                    metrics.response_time_ms = None;
                    metrics.status = PortalStatus::Down;
                    Some(message)
                }
            };

            match failure {
                None => {
                    metrics.consecutive_failures = 0;
                    metrics.consecutive_timeouts = 0;
                    metrics.consecutive_successes += 1;
                    metrics.last_success = Some(now);
                    metrics.last_error = None;
                }
                Some(error) => {
                    metrics.consecutive_failures += 1;
                    metrics.consecutive_successes = 0;
                    metrics.failed_checks += 1;
                    metrics.last_error = Some(error);
                    if metrics.consecutive_failures >= self.settings.down_after_failures {
                        metrics.status = PortalStatus::Down;
                    }
                }
            }

            (old, metrics.status)
        };

        if old != new {
            info!("Portal status changed: {} -> {}", old, new);
            self.notify(old, new);
        }
        new
    }

    /// Admission decision for the next task
    pub async fn should_allow_task(&self) -> bool {
        let state = self.state.lock().await;
        let cooling_down = state.cooldown_until.map_or(false, |until| Instant::now() < until);
        admits(state.metrics.status, cooling_down, self.settings.degraded_admit_ratio)
    }

    /// `min(2^consecutive_failures, cap)` seconds
    pub async fn get_backoff_seconds(&self) -> u64 {
        let state = self.state.lock().await;
        backoff_for(state.metrics.consecutive_failures, self.settings.backoff_cap_secs)
    }

    /// Worker-observed failure; a burst from several workers opens a cooldown.
    /// Returns whether this report opened one.
    pub async fn report_failure(&self, worker_id: u32, reason: &str) -> bool {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let window = Duration::from_secs(self.settings.burst_window_secs);

        state.failure_reports.push_back((worker_id, now));
        while let Some((_, at)) = state.failure_reports.front() {
            if now.duration_since(*at) > window {
                state.failure_reports.pop_front();
            } else {
                break;
            }
        }

        let workers: HashSet<u32> = state.failure_reports.iter().map(|(id, _)| *id).collect();
        debug!("Worker {} reported failure ({}); {} reports in window", worker_id, reason, state.failure_reports.len());

        if state.failure_reports.len() >= self.settings.burst_failures
            && workers.len() >= self.settings.burst_min_workers
        {
            let cooldown = Duration::from_secs(self.settings.cooldown_secs);
            state.cooldown_until = Some(now + cooldown);
            state.failure_reports.clear();
            warn!(
                "Failure burst from {} workers, pausing new tasks for {}s",
                workers.len(),
                cooldown.as_secs()
            );
            return true;
        }
        false
    }

    pub async fn reset_metrics(&self) {
        let old = {
            let mut state = self.state.lock().await;
            let old = state.metrics.status;
            state.metrics = PortalHealthMetrics::default();
            state.failure_reports.clear();
            state.cooldown_until = None;
            old
        };
        if old != PortalStatus::Unknown {
            self.notify(old, PortalStatus::Unknown);
        }
    }

    pub async fn metrics(&self) -> HealthSnapshot {
        let state = self.state.lock().await;
        let metrics = state.metrics.clone();
        let success_rate = if metrics.total_checks == 0 {
            0.0
        } else {
            (metrics.total_checks - metrics.failed_checks) as f64 / metrics.total_checks as f64 * 100.0
        };
        let cooldown_remaining_secs = state
            .cooldown_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .map_or(0, |left| left.as_secs_f64().ceil() as u64);

        HealthSnapshot {
            backoff_secs: backoff_for(metrics.consecutive_failures, self.settings.backoff_cap_secs),
            metrics,
            success_rate,
            cooldown_remaining_secs,
            taken_at: Utc::now(),
        }
    }

    /// Probe on a fixed interval until `stop` flips to true
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.settings.interval_secs));
        info!("Health monitor probing {} every {}s", self.url, self.settings.interval_secs);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check().await;
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Health monitor stopped");
    }
}

pub(crate) fn backoff_for(consecutive_failures: u32, cap_secs: u64) -> u64 {
    2u64.checked_pow(consecutive_failures).unwrap_or(u64::MAX).min(cap_secs)
}

#[async_trait]
impl HealthGate for HealthMonitor {
    async fn should_allow_task(&self) -> bool {
        HealthMonitor::should_allow_task(self).await
    }

    async fn backoff_seconds(&self) -> u64 {
        self.get_backoff_seconds().await
    }

    async fn report_failure(&self, worker_id: u32, reason: &str) {
        HealthMonitor::report_failure(self, worker_id, reason).await;
    }
}
