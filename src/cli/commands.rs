use anyhow::{Result, Context};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, info_span, warn, Instrument};

use crate::browser::WebFormPortal;
use crate::cli::config::HarvestConfig;
use crate::crawler::coordinator::{open_session, shutdown_signal};
use crate::crawler::{Coordinator, Location, RunRequest, RunState, Worker, WorkerChannels, WorkerCommand};
use crate::portal::{HealthMonitor, HealthSnapshot, RedisTokenBucket};
use crate::storage::{connect_redis, KeySpace, Ledger, RedisRunControl, RedisTaskQueue, RemoteHealthGate, RunControl, SqliteLedger};

pub struct RunArgs {
    pub villages: PathBuf,
    pub owner: String,
    pub variants: Vec<String>,
    pub workers: Option<u32>,
    pub max_survey: Option<u32>,
    pub profile: Option<String>,
    pub session: Option<String>,
    pub verbose: bool,
    pub log_file: Option<PathBuf>,
}

/// Read the village list produced by the location lookup
pub fn load_villages(path: &Path) -> Result<Vec<Location>> {
    let contents = fs::read_to_string(path)
        .context(format!("Failed to read villages file: {}", path.display()))?;

    let villages: Vec<Location> = serde_yaml::from_str(&contents)
        .context(format!("Failed to parse villages file: {}", path.display()))?;

    Ok(villages)
}

async fn open_ledger(config: &HarvestConfig) -> Result<SqliteLedger> {
    SqliteLedger::open(
        &config.storage.database_path,
        config.storage.write_retries,
        config.storage.write_backoff_ms,
    )
    .await
}

/// Arguments a worker process is started with
fn worker_args(session_id: &str, args: &RunArgs) -> Vec<String> {
    let mut worker_args = vec![
        "worker".to_string(),
        "--session".to_string(),
        session_id.to_string(),
        "--worker-id".to_string(),
        "{worker_id}".to_string(),
    ];
    if let Some(profile) = &args.profile {
        worker_args.push("--profile".to_string());
        worker_args.push(profile.clone());
    }
    if args.verbose {
        worker_args.push("--verbose".to_string());
    }
    if let Some(log_file) = &args.log_file {
        worker_args.push("--log-file".to_string());
        worker_args.push(log_file.display().to_string());
    }
    worker_args
}

/// Coordinate a full run in this process
pub async fn run(args: RunArgs) -> Result<()> {
    let mut config = HarvestConfig::load(args.profile.as_deref())?;

    // Override configuration with command line parameters if provided
    if let Some(workers) = args.workers {
        config.workers.num_workers = workers;
    }
    config.validate()?;

    let villages = load_villages(&args.villages)?;
    let request = RunRequest {
        villages,
        owner_name: args.owner.clone(),
        owner_variants: args.variants.clone(),
        max_survey: args.max_survey.unwrap_or(config.workers.default_max_survey),
        resume_session: args.session.clone(),
    };

    let ledger = Arc::new(open_ledger(&config).await?);
    let conn = connect_redis(&config.storage.redis_url).await?;

    // The session id names every Redis key, so it is settled before anything else
    let session_id = open_session(ledger.as_ref(), &request).await?;

    let keys = KeySpace::new(&config.storage.key_prefix, &session_id);
    let queue = Arc::new(
        RedisTaskQueue::new(
            &config.storage.redis_url,
            keys.clone(),
            config.workers.queue_capacity,
            config.storage.task_ttl,
        )
        .await?,
    );
    let control = Arc::new(RedisRunControl::new(conn, keys, config.storage.task_ttl));

    let health = Arc::new(HealthMonitor::new(config.health.clone(), config.probe_url())?);
    let command = WorkerCommand::current_exe(worker_args(&session_id, &args))?;

    let coordinator = Coordinator::new(config, ledger, queue, control);
    let summary = coordinator.run(&session_id, &request, command, health).await?;

    info!("Session {} finished with status {}", summary.session_id, summary.status);
    if summary.status != "completed" {
        info!("Use `harvester run --session {} ...` to resume", summary.session_id);
    }
    info!("Use `harvester status {}` to inspect the results", summary.session_id);

    Ok(())
}

/// Worker process: consume this worker's lane until told to stop
pub async fn worker(session: String, worker_id: u32, profile: Option<String>) -> Result<()> {
    let config = HarvestConfig::load(profile.as_deref())?;

    let keys = KeySpace::new(&config.storage.key_prefix, &session);
    let conn = connect_redis(&config.storage.redis_url).await?;
    let queue = Arc::new(
        RedisTaskQueue::new(
            &config.storage.redis_url,
            keys.clone(),
            config.workers.queue_capacity,
            config.storage.task_ttl,
        )
        .await?,
    );
    let control: Arc<dyn RunControl> = Arc::new(RedisRunControl::new(conn.clone(), keys.clone(), config.storage.task_ttl));

    // A snapshot older than a few probe intervals means the coordinator is gone
    let stale_after = Duration::from_secs((config.health.interval_secs * 3).max(30));
    let gate = Arc::new(RemoteHealthGate::new(control.clone(), config.health.degraded_admit_ratio, stale_after));
    let throttle = Arc::new(RedisTokenBucket::new(
        conn,
        keys.token_bucket(),
        config.rate_limit.capacity,
        config.rate_limit.refill_rate,
    ));

    let channels = WorkerChannels {
        queue,
        control,
        ledger: Arc::new(open_ledger(&config).await?),
        gate,
        throttle,
    };
    let portal = WebFormPortal::new(worker_id, config.browser.clone(), config.portal.clone());

    let (terminate_tx, terminate_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = terminate_tx.send(true);
    });

    let stats = Worker::new(worker_id, &config, portal, channels)
        .run(terminate_rx)
        .instrument(info_span!("worker", id = worker_id))
        .await?;

    info!(
        "Worker {} exiting: {} tasks, {} failed, {} records, {} recycles",
        worker_id, stats.tasks_processed, stats.tasks_failed, stats.records_saved, stats.recycles
    );
    Ok(())
}

/// Print the aggregated state of a session
pub async fn status(session: String, profile: Option<String>, json: bool) -> Result<()> {
    let config = HarvestConfig::load(profile.as_deref())?;
    let ledger = open_ledger(&config).await?;

    let keys = KeySpace::new(&config.storage.key_prefix, &session);
    let conn = connect_redis(&config.storage.redis_url).await?;
    let queue = RedisTaskQueue::new(
        &config.storage.redis_url,
        keys.clone(),
        config.workers.queue_capacity,
        config.storage.task_ttl,
    )
    .await?;
    let control = RedisRunControl::new(conn, keys, config.storage.task_ttl);

    let state = RunState::collect(&session, config.workers.num_workers, &ledger, &control, &queue, None).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    println!("Session: {}", state.session_id);
    println!("Status: {}", state.status);
    println!("Owner: {}", state.owner_name);
    println!("Started: {}", state.started_at);
    println!("Progress: {:.1}% of {} villages", state.progress_pct, state.total_villages);
    println!(
        "Tasks: {} completed, {} skipped, {} retried, {} failed",
        state.metrics.tasks_completed,
        state.metrics.tasks_skipped,
        state.metrics.tasks_retried,
        state.metrics.tasks_failed
    );
    println!("Records: {} ({} matches)", state.metrics.records_saved, state.metrics.matches_found);
    println!("Queue: {} waiting, {} in flight", state.queue_depth, state.in_flight);
    if let Some(eta) = state.eta_minutes {
        println!("Rate: {:.1} tasks/min, ETA {:.0} min", state.tasks_per_minute, eta);
    }

    println!("{}", portal_line(state.health.as_ref()));

    if !state.workers.is_empty() {
        println!("Workers:");
        for worker in &state.workers {
            println!(
                "  - #{} pid {} {:?}: {} tasks, {} records, last seen {}",
                worker.worker_id,
                worker.pid,
                worker.state,
                worker.tasks_processed,
                worker.records_saved,
                worker.last_seen.format("%H:%M:%S")
            );
        }
    }

    if !state.villages.is_empty() {
        println!("Villages:");
        for village in &state.villages {
            let confidence = match (village.confidence, &village.confidence_level) {
                (Some(score), Some(level)) => format!(", confidence {:.0} ({})", score, level),
                _ => String::new(),
            };
            println!(
                "  - {} [{}] {}: survey {}/{}, {} records, {} matches{}",
                village.village_name,
                village.village_code,
                village.status,
                village.last_survey_no,
                village.max_survey_no,
                village.records_found,
                village.matches_found,
                confidence
            );
        }
    }

    Ok(())
}

fn portal_line(health: Option<&HealthSnapshot>) -> String {
    match health {
        Some(health) => format!(
            "Portal: {} (success rate {:.0}%, backoff {}s)",
            health.metrics.status, health.success_rate, health.backoff_secs
        ),
        None => "Portal: no health snapshot".to_string(),
    }
}

/// List skipped work for manual re-runs
pub async fn skipped(session: String, profile: Option<String>) -> Result<()> {
    let config = HarvestConfig::load(profile.as_deref())?;
    let ledger = open_ledger(&config).await?;

    let items = ledger.get_skipped_items(&session).await?;
    if items.is_empty() {
        println!("No skipped items for session {}", session);
        return Ok(());
    }

    println!("{} skipped items:", items.len());
    for item in &items {
        let combination = [&item.surnoc, &item.hissa, &item.period]
            .iter()
            .filter_map(|part| part.as_deref())
            .collect::<Vec<_>>()
            .join(" / ");
        println!(
            "  - {} [{}] survey {}{}: {} (retries {})",
            item.village_name,
            item.village_code,
            item.survey_no,
            if combination.is_empty() { String::new() } else { format!(" ({})", combination) },
            item.reason,
            item.retry_count
        );
    }

    Ok(())
}

/// List all available configuration profiles
pub async fn list_profiles() -> Result<()> {
    let profiles = HarvestConfig::list_profiles().await?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Manage a specific configuration profile
pub async fn manage_profile(profile_name: String) -> Result<()> {
    // Load the profile if it exists
    match HarvestConfig::load_profile(&profile_name) {
        Ok(config) => {
            println!("Profile: {}", profile_name);
            println!("{}", serde_yaml::to_string(&config)?);
        },
        Err(_) => {
            warn!("Profile '{}' does not exist. Creating a default profile.", profile_name);
            let config = HarvestConfig::default();
            config.save_as_profile(&profile_name).await?;
            println!("Created default profile: {}", profile_name);
        }
    }

    Ok(())
}

/// Show the current configuration
pub async fn show_config() -> Result<()> {
    let config = HarvestConfig::load_default()?;
    println!("Current configuration:");
    println!("{}", serde_yaml::to_string(&config)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args() -> RunArgs {
        RunArgs {
            villages: PathBuf::from("villages.yaml"),
            owner: "Ramesh".into(),
            variants: vec![],
            workers: None,
            max_survey: None,
            profile: Some("slow".into()),
            session: None,
            verbose: true,
            log_file: None,
        }
    }

    #[test]
    fn test_worker_args_carry_session_and_profile() {
        let args = worker_args("search_20250101_000000_abcd1234", &run_args());
        assert_eq!(
            args,
            vec![
                "worker",
                "--session",
                "search_20250101_000000_abcd1234",
                "--worker-id",
                "{worker_id}",
                "--profile",
                "slow",
                "--verbose",
            ]
        );
    }

    #[tokio::test]
    async fn test_portal_line_prints_success_rate_as_percentage() {
        use crate::portal::health::ProbeResult;

        let monitor = HealthMonitor::new(HarvestConfig::default().health, "http://127.0.0.1:9").unwrap();
        monitor
            .record_probe(ProbeResult::Response { status: 200, elapsed: Duration::from_millis(100) })
            .await;

        let line = portal_line(Some(&monitor.metrics().await));
        assert_eq!(line, "Portal: HEALTHY (success rate 100%, backoff 1s)");
        assert_eq!(portal_line(None), "Portal: no health snapshot");
    }

    #[test]
    fn test_load_villages_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("villages.yaml");
        fs::write(
            &path,
            r#"
- district_code: "20"
  district_name: Bangalore Urban
  taluk_code: "2"
  taluk_name: Bangalore North
  hobli_code: "3"
  hobli_name: Yelahanka
  village_code: "101"
  village_name: Bagalur
"#,
        )
        .unwrap();

        let villages = load_villages(&path).unwrap();
        assert_eq!(villages.len(), 1);
        assert_eq!(villages[0].village_name, "Bagalur");
        assert_eq!(villages[0].path_key(), "20-2-3-101");

        assert!(load_villages(&dir.path().join("missing.yaml")).is_err());
    }
}
