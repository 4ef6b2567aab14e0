use anyhow::{Result, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::portal::health::{HealthGate, HealthSnapshot};
use crate::storage::{KeySpace, RedisConn};
use crate::utils::metrics::{MetricField, RunMetrics, SharedMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Idle,
    Working,
    Backoff,
    Recycling,
    Stopping,
    Stopped,
}

/// Liveness and progress published by each worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: u32,
    pub pid: u32,
    pub state: WorkerState,
    pub current_task: Option<String>,
    pub tasks_processed: u64,
    pub tasks_failed: u64,
    pub records_saved: u64,
    pub recycles: u32,
    pub last_seen: DateTime<Utc>,
}

/// A failure observed by a worker, forwarded to the circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub worker_id: u32,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Cross-process control plane: shutdown flag, counters, heartbeats, health
#[async_trait]
pub trait RunControl: Send + Sync {
    async fn request_shutdown(&self) -> Result<()>;
    async fn shutdown_requested(&self) -> Result<bool>;
    /// Forget a previous run's shutdown request
    async fn clear_shutdown(&self) -> Result<()>;

    async fn incr(&self, field: MetricField, by: u64) -> Result<()>;
    async fn metrics(&self) -> Result<RunMetrics>;

    async fn publish_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<()>;
    async fn heartbeats(&self) -> Result<Vec<WorkerHeartbeat>>;

    async fn publish_health(&self, snapshot: &HealthSnapshot) -> Result<()>;
    async fn health(&self) -> Result<Option<HealthSnapshot>>;

    async fn push_failure_report(&self, report: &FailureReport) -> Result<()>;
    async fn drain_failure_reports(&self) -> Result<Vec<FailureReport>>;
}

pub struct RedisRunControl {
    conn: RedisConn,
    keys: KeySpace,
    ttl: u64,
}

impl RedisRunControl {
    pub fn new(conn: RedisConn, keys: KeySpace, ttl: u64) -> Self {
        Self { conn, keys, ttl }
    }
}

#[async_trait]
impl RunControl for RedisRunControl {
    async fn request_shutdown(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        redis::cmd("SET")
            .arg(self.keys.shutdown())
            .arg("1")
            .arg("EX")
            .arg(self.ttl)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to set shutdown flag")?;
        Ok(())
    }

    async fn shutdown_requested(&self) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.keys.shutdown())
            .query_async(&mut *conn)
            .await
            .context("Failed to read shutdown flag")?;
        Ok(exists)
    }

    async fn clear_shutdown(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        redis::cmd("DEL")
            .arg(self.keys.shutdown())
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to clear shutdown flag")?;
        Ok(())
    }

    async fn incr(&self, field: MetricField, by: u64) -> Result<()> {
        let mut conn = self.conn.lock().await;
        redis::cmd("HINCRBY")
            .arg(self.keys.metrics())
            .arg(field.key())
            .arg(by)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context(format!("Failed to increment metric {}", field.key()))?;
        Ok(())
    }

    async fn metrics(&self) -> Result<RunMetrics> {
        let mut conn = self.conn.lock().await;
        let counts: HashMap<String, u64> = redis::cmd("HGETALL")
            .arg(self.keys.metrics())
            .query_async(&mut *conn)
            .await
            .context("Failed to read metrics")?;
        Ok(RunMetrics::from_counts(&counts))
    }

    async fn publish_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<()> {
        let json = serde_json::to_string(heartbeat)
            .context("Failed to serialize heartbeat")?;

        let mut conn = self.conn.lock().await;
        redis::cmd("HSET")
            .arg(self.keys.heartbeats())
            .arg(heartbeat.worker_id)
            .arg(json)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to publish heartbeat")?;
        Ok(())
    }

    async fn heartbeats(&self) -> Result<Vec<WorkerHeartbeat>> {
        let mut conn = self.conn.lock().await;
        let values: Vec<String> = redis::cmd("HVALS")
            .arg(self.keys.heartbeats())
            .query_async(&mut *conn)
            .await
            .context("Failed to read heartbeats")?;

        let mut heartbeats: Vec<WorkerHeartbeat> = values
            .iter()
            .filter_map(|json| match serde_json::from_str(json) {
                Ok(heartbeat) => Some(heartbeat),
                Err(e) => {
                    warn!("Ignoring malformed heartbeat: {}", e);
                    None
                }
            })
            .collect();
        heartbeats.sort_by_key(|h| h.worker_id);
        Ok(heartbeats)
    }

    async fn publish_health(&self, snapshot: &HealthSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)
            .context("Failed to serialize health snapshot")?;

        let mut conn = self.conn.lock().await;
        redis::cmd("SET")
            .arg(self.keys.health())
            .arg(json)
            .arg("EX")
            .arg(self.ttl)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to publish health snapshot")?;
        Ok(())
    }

    async fn health(&self) -> Result<Option<HealthSnapshot>> {
        let mut conn = self.conn.lock().await;
        let json: Option<String> = redis::cmd("GET")
            .arg(self.keys.health())
            .query_async(&mut *conn)
            .await
            .context("Failed to read health snapshot")?;

        json.map(|json| serde_json::from_str(&json).context("Failed to parse health snapshot"))
            .transpose()
    }

    async fn push_failure_report(&self, report: &FailureReport) -> Result<()> {
        let json = serde_json::to_string(report)
            .context("Failed to serialize failure report")?;

        let mut conn = self.conn.lock().await;
        redis::cmd("RPUSH")
            .arg(self.keys.failure_reports())
            .arg(json)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to push failure report")?;
        Ok(())
    }

    async fn drain_failure_reports(&self) -> Result<Vec<FailureReport>> {
        let key = self.keys.failure_reports();

        let mut conn = self.conn.lock().await;
        let (values,): (Vec<String>,) = redis::pipe()
            .atomic()
            .cmd("LRANGE").arg(&key).arg(0).arg(-1)
            .cmd("DEL").arg(&key).ignore()
            .query_async(&mut *conn)
            .await
            .context("Failed to drain failure reports")?;

        Ok(values
            .iter()
            .filter_map(|json| serde_json::from_str(json).ok())
            .collect())
    }
}

/// In-process control plane for tests and single-process use
#[derive(Default)]
pub struct MemoryRunControl {
    shutdown: AtomicBool,
    counters: SharedMetrics,
    heartbeats: Mutex<HashMap<u32, WorkerHeartbeat>>,
    health: Mutex<Option<HealthSnapshot>>,
    failures: Mutex<Vec<FailureReport>>,
}

impl MemoryRunControl {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunControl for MemoryRunControl {
    async fn request_shutdown(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown_requested(&self) -> Result<bool> {
        Ok(self.shutdown.load(Ordering::SeqCst))
    }

    async fn clear_shutdown(&self) -> Result<()> {
        self.shutdown.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn incr(&self, field: MetricField, by: u64) -> Result<()> {
        self.counters.incr(field, by);
        Ok(())
    }

    async fn metrics(&self) -> Result<RunMetrics> {
        Ok(self.counters.snapshot())
    }

    async fn publish_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<()> {
        self.heartbeats.lock().await.insert(heartbeat.worker_id, heartbeat.clone());
        Ok(())
    }

    async fn heartbeats(&self) -> Result<Vec<WorkerHeartbeat>> {
        let mut heartbeats: Vec<WorkerHeartbeat> = self.heartbeats.lock().await.values().cloned().collect();
        heartbeats.sort_by_key(|h| h.worker_id);
        Ok(heartbeats)
    }

    async fn publish_health(&self, snapshot: &HealthSnapshot) -> Result<()> {
        *self.health.lock().await = Some(snapshot.clone());
        Ok(())
    }

    async fn health(&self) -> Result<Option<HealthSnapshot>> {
        Ok(self.health.lock().await.clone())
    }

    async fn push_failure_report(&self, report: &FailureReport) -> Result<()> {
        self.failures.lock().await.push(report.clone());
        Ok(())
    }

    async fn drain_failure_reports(&self) -> Result<Vec<FailureReport>> {
        Ok(std::mem::take(&mut *self.failures.lock().await))
    }
}

/// Health gate for worker processes: reads the snapshot the coordinator
/// publishes and forwards failures back to it.
pub struct RemoteHealthGate {
    control: Arc<dyn RunControl>,
    degraded_admit_ratio: f64,
    stale_after: Duration,
}

impl RemoteHealthGate {
    pub fn new(control: Arc<dyn RunControl>, degraded_admit_ratio: f64, stale_after: Duration) -> Self {
        Self {
            control,
            degraded_admit_ratio,
            stale_after,
        }
    }

    async fn fresh_snapshot(&self) -> Option<HealthSnapshot> {
        match self.control.health().await {
            Ok(Some(snapshot)) => {
                let age = (Utc::now() - snapshot.taken_at).to_std().unwrap_or_default();
                if age <= self.stale_after {
                    Some(snapshot)
                } else {
                    debug!("Health snapshot is {}s old, treating portal as unknown", age.as_secs());
                    None
                }
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read health snapshot: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl HealthGate for RemoteHealthGate {
    async fn should_allow_task(&self) -> bool {
        // No fresh snapshot means UNKNOWN, which admits
        self.fresh_snapshot()
            .await
            .map_or(true, |snapshot| snapshot.allows_task(self.degraded_admit_ratio))
    }

    async fn backoff_seconds(&self) -> u64 {
        self.fresh_snapshot()
            .await
            .map_or(1, |snapshot| snapshot.backoff_secs.max(snapshot.cooldown_remaining_secs))
    }

    async fn report_failure(&self, worker_id: u32, reason: &str) {
        let report = FailureReport {
            worker_id,
            reason: reason.to_string(),
            at: Utc::now(),
        };
        if let Err(e) = self.control.push_failure_report(&report).await {
            error!("Failed to forward failure report: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::HarvestConfig;
    use crate::portal::health::{HealthMonitor, ProbeResult};

    #[tokio::test]
    async fn test_remote_gate_follows_published_snapshot() {
        let control: Arc<dyn RunControl> = Arc::new(MemoryRunControl::new());
        let gate = RemoteHealthGate::new(control.clone(), 0.5, Duration::from_secs(60));

        // nothing published yet
        assert!(gate.should_allow_task().await);
        assert_eq!(gate.backoff_seconds().await, 1);

        let monitor = HealthMonitor::new(HarvestConfig::default().health, "http://127.0.0.1:9/").unwrap();
        for _ in 0..5 {
            monitor.record_probe(ProbeResult::ConnectionFailed("refused".into())).await;
        }
        control.publish_health(&monitor.metrics().await).await.unwrap();

        assert!(!gate.should_allow_task().await);
        assert_eq!(gate.backoff_seconds().await, 32);
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_ignored() {
        let control: Arc<dyn RunControl> = Arc::new(MemoryRunControl::new());
        let gate = RemoteHealthGate::new(control.clone(), 0.5, Duration::from_secs(30));

        let monitor = HealthMonitor::new(HarvestConfig::default().health, "http://127.0.0.1:9/").unwrap();
        monitor.record_probe(ProbeResult::ConnectionFailed("refused".into())).await;
        let mut snapshot = monitor.metrics().await;
        snapshot.taken_at = Utc::now() - chrono::Duration::minutes(5);
        control.publish_health(&snapshot).await.unwrap();

        assert!(gate.should_allow_task().await);
    }

    #[tokio::test]
    async fn test_failure_reports_are_drained_once() {
        let control: Arc<dyn RunControl> = Arc::new(MemoryRunControl::new());
        let gate = RemoteHealthGate::new(control.clone(), 0.5, Duration::from_secs(30));

        gate.report_failure(1, "portal_issue").await;
        gate.report_failure(2, "session_expired").await;

        let drained = control.drain_failure_reports().await.unwrap();
        assert_eq!(drained.iter().map(|r| r.worker_id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(control.drain_failure_reports().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_control_counters_and_shutdown() {
        let control = MemoryRunControl::new();
        control.incr(MetricField::RecordsSaved, 3).await.unwrap();
        control.incr(MetricField::RecordsSaved, 2).await.unwrap();
        assert_eq!(control.metrics().await.unwrap().records_saved, 5);

        assert!(!control.shutdown_requested().await.unwrap());
        control.request_shutdown().await.unwrap();
        assert!(control.shutdown_requested().await.unwrap());
        control.clear_shutdown().await.unwrap();
        assert!(!control.shutdown_requested().await.unwrap());
    }
}
