use anyhow::{Result, Context};
use serde::{Serialize, Deserialize};
use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cli::config::WorkerSettings;
use crate::storage::RunControl;

/// How to launch one worker process. `{worker_id}` in an argument is
/// replaced by the worker's id.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-execute the running binary
    pub fn current_exe(args: Vec<String>) -> Result<Self> {
        let program = std::env::current_exe().context("Failed to locate the running executable")?;
        Ok(Self::new(program, args))
    }

    fn build(&self, worker_id: u32) -> Command {
        let mut command = Command::new(&self.program);
        for arg in &self.args {
            command.arg(arg.replace("{worker_id}", &worker_id.to_string()));
        }
        command.stdin(Stdio::null()).kill_on_drop(true);
        command
    }
}

struct WorkerSlot {
    worker_id: u32,
    child: Option<Child>,
    pid: Option<u32>,
    restarts: u32,
}

impl WorkerSlot {
    fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

/// Browser budget verdict at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserBudget {
    pub browser_processes: usize,
    pub limit: usize,
    pub within_budget: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSummary {
    pub num_workers: u32,
    pub alive_workers: usize,
    pub worker_pids: Vec<u32>,
    pub restarts: u32,
    pub budget: BrowserBudget,
}

/// Owns the worker processes: staggered start, crash restarts and
/// three-phase shutdown
pub struct Supervisor {
    command: WorkerCommand,
    settings: WorkerSettings,
    browser_names: Vec<String>,
    control: Arc<dyn RunControl>,
    slots: Arc<Mutex<Vec<WorkerSlot>>>,
    running: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(
        command: WorkerCommand,
        settings: WorkerSettings,
        browser_names: Vec<String>,
        control: Arc<dyn RunControl>,
    ) -> Self {
        Self {
            command,
            settings,
            browser_names: browser_names.into_iter().map(|n| n.to_lowercase()).collect(),
            control,
            slots: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            monitor: None,
        }
    }

    /// Spawn `num_workers` processes, `stagger_delay_ms` apart, then start the monitor
    pub async fn start(&mut self) -> Result<()> {
        let stagger = Duration::from_millis(self.settings.stagger_delay_ms);
        info!("Starting {} workers ({:?} apart)", self.settings.num_workers, stagger);

        self.running.store(true, Ordering::SeqCst);

        for worker_id in 0..self.settings.num_workers {
            if worker_id > 0 && !stagger.is_zero() {
                tokio::time::sleep(stagger).await;
            }

            let child = spawn(&self.command, worker_id)?;
            self.slots.lock().await.push(WorkerSlot {
                worker_id,
                pid: child.id(),
                child: Some(child),
                restarts: 0,
            });
        }

        let monitor = Monitor {
            command: self.command.clone(),
            settings: self.settings.clone(),
            control: self.control.clone(),
            slots: self.slots.clone(),
            running: self.running.clone(),
        };
        self.monitor = Some(tokio::spawn(monitor.run()));

        Ok(())
    }

    /// Three-phase stop: shutdown flag, then SIGTERM, then kill.
    /// Browser processes left behind by dead workers are killed as well.
    pub async fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }

        let mut slots = self.slots.lock().await;
        let worker_pids: Vec<u32> = slots.iter().filter_map(|s| s.pid).collect();
        let descendants = descendants_of(&worker_pids);

        // Phase 1: cooperative
        info!("Stopping workers (graceful timeout {}s)", self.settings.graceful_timeout_secs);
        if let Err(e) = self.control.request_shutdown().await {
            warn!("Failed to raise shutdown flag: {:#}", e);
        }
        let graceful = Duration::from_secs(self.settings.graceful_timeout_secs);
        if wait_all(&mut slots, graceful).await {
            info!("All workers exited gracefully");
        } else {
            // Phase 2: SIGTERM
            let stragglers: Vec<u32> = slots
                .iter_mut()
                .filter_map(|s| if s.is_alive() { s.pid } else { None })
                .collect();
            warn!("{} worker(s) still alive, sending SIGTERM", stragglers.len());
            terminate(&stragglers);

            let grace = Duration::from_secs(self.settings.kill_grace_secs);
            if !wait_all(&mut slots, grace).await {
                // Phase 3: kill
                for slot in slots.iter_mut() {
                    if slot.is_alive() {
                        warn!("Force-killing worker {}", slot.worker_id);
                        if let Some(child) = slot.child.as_mut() {
                            if let Err(e) = child.kill().await {
                                error!("Failed to kill worker {}: {}", slot.worker_id, e);
                            }
                        }
                    }
                }
            }
        }

        for slot in slots.iter_mut() {
            if let Some(mut child) = slot.child.take() {
                let _ = child.wait().await;
            }
        }

        let orphans = kill_survivors(&descendants);
        if orphans > 0 {
            warn!("Killed {} orphaned browser process(es)", orphans);
        }

        info!("All workers stopped");
        Ok(())
    }

    pub async fn alive_count(&self) -> usize {
        let mut slots = self.slots.lock().await;
        let mut alive = 0;
        for slot in slots.iter_mut() {
            if slot.is_alive() {
                alive += 1;
            }
        }
        alive
    }

    pub async fn worker_pids(&self) -> Vec<u32> {
        let mut slots = self.slots.lock().await;
        slots
            .iter_mut()
            .filter_map(|s| if s.is_alive() { s.pid } else { None })
            .collect()
    }

    pub async fn total_restarts(&self) -> u32 {
        self.slots.lock().await.iter().map(|s| s.restarts).sum()
    }

    /// Browser instances anywhere in the live workers' process trees
    pub async fn browser_process_count(&self) -> usize {
        let pids = self.worker_pids().await;
        count_browser_instances(&pids, &self.browser_names)
    }

    /// False once no worker is alive and none will be restarted
    pub async fn can_recover(&self) -> bool {
        let mut slots = self.slots.lock().await;
        let auto_restart = self.settings.auto_restart;
        let max_restarts = self.settings.max_restarts;
        slots.iter_mut().any(|slot| {
            if slot.is_alive() {
                return true;
            }
            // A dead child not yet reaped by the monitor may still be restarted
            let awaiting_restart = match slot.child.as_mut().map(|c| c.try_wait()) {
                Some(Ok(Some(status))) => !status.success(),
                _ => false,
            };
            awaiting_restart && auto_restart && slot.restarts < max_restarts
        })
    }

    /// The pool may never own more than `num_workers + browser_tolerance` browser processes
    pub async fn verify_browser_budget(&self) -> BrowserBudget {
        let browser_processes = self.browser_process_count().await;
        let limit = self.settings.num_workers as usize + self.settings.browser_tolerance;
        let within_budget = browser_processes <= limit;

        if !within_budget {
            error!("Browser budget exceeded: {} processes (max {})", browser_processes, limit);
        }

        BrowserBudget {
            browser_processes,
            limit,
            within_budget,
        }
    }

    pub async fn summary(&self) -> SupervisorSummary {
        let worker_pids = self.worker_pids().await;
        SupervisorSummary {
            num_workers: self.settings.num_workers,
            alive_workers: worker_pids.len(),
            worker_pids,
            restarts: self.total_restarts().await,
            budget: self.verify_browser_budget().await,
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

/// Background liveness poller; restarts crashed workers under the same id
struct Monitor {
    command: WorkerCommand,
    settings: WorkerSettings,
    control: Arc<dyn RunControl>,
    slots: Arc<Mutex<Vec<WorkerSlot>>>,
    running: Arc<AtomicBool>,
}

impl Monitor {
    async fn run(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.settings.monitor_interval_secs.max(1)));
        interval.tick().await;

        loop {
            interval.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if matches!(self.control.shutdown_requested().await, Ok(true)) {
                debug!("Shutdown requested, monitor stops restarting workers");
                break;
            }
            self.check().await;
        }
    }

    async fn check(&self) {
        let mut slots = self.slots.lock().await;

        for slot in slots.iter_mut() {
            let Some(child) = slot.child.as_mut() else {
                continue;
            };

            let status = match child.try_wait() {
                Ok(Some(status)) => status,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to poll worker {}: {}", slot.worker_id, e);
                    continue;
                }
            };

            slot.child = None;
            if status.success() {
                info!("Worker {} exited cleanly", slot.worker_id);
                continue;
            }

            warn!("Worker {} died ({})", slot.worker_id, status);
            if !self.settings.auto_restart {
                continue;
            }
            if slot.restarts >= self.settings.max_restarts {
                error!("Worker {} reached the restart limit ({})", slot.worker_id, self.settings.max_restarts);
                continue;
            }

            match spawn(&self.command, slot.worker_id) {
                Ok(child) => {
                    slot.restarts += 1;
                    slot.pid = child.id();
                    slot.child = Some(child);
                    info!("Restarted worker {} (restart {}/{})", slot.worker_id, slot.restarts, self.settings.max_restarts);
                }
                Err(e) => error!("Failed to restart worker {}: {:#}", slot.worker_id, e),
            }
        }
    }
}

fn spawn(command: &WorkerCommand, worker_id: u32) -> Result<Child> {
    let child = command
        .build(worker_id)
        .spawn()
        .context(format!("Failed to spawn worker {}", worker_id))?;
    debug!("Spawned worker {} (pid {:?})", worker_id, child.id());
    Ok(child)
}

/// Poll until every slot's process has exited or `timeout` passes
async fn wait_all(slots: &mut [WorkerSlot], timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if slots.iter_mut().all(|s| !s.is_alive()) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn process_table() -> System {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
}

fn terminate(pids: &[u32]) {
    let system = process_table();
    for pid in pids {
        if let Some(process) = system.process(Pid::from_u32(*pid)) {
            if process.kill_with(Signal::Term) != Some(true) {
                warn!("Could not deliver SIGTERM to pid {}", pid);
            }
        }
    }
}

/// Every process below `roots` in the process tree
fn descendants_of(roots: &[u32]) -> HashSet<u32> {
    let system = process_table();
    let mut found: HashSet<u32> = HashSet::new();
    let mut frontier: Vec<Pid> = roots.iter().map(|p| Pid::from_u32(*p)).collect();

    while let Some(parent) = frontier.pop() {
        for (pid, process) in system.processes() {
            if process.parent() == Some(parent) && found.insert(pid.as_u32()) {
                frontier.push(*pid);
            }
        }
    }
    found
}

fn kill_survivors(pids: &HashSet<u32>) -> usize {
    if pids.is_empty() {
        return 0;
    }
    let system = process_table();
    pids.iter()
        .filter_map(|pid| system.process(Pid::from_u32(*pid)))
        .filter(|process| process.kill())
        .count()
}

fn name_matches(name: &OsStr, wanted: &[String]) -> bool {
    let name = name.to_string_lossy().to_lowercase();
    wanted.iter().any(|w| name.contains(w.as_str()))
}

/// Browser instances anywhere below `roots`. A named process whose parent is
/// itself a named descendant (Chrome under chromedriver, renderers under
/// Chrome) belongs to an instance already counted.
fn count_browser_instances(roots: &[u32], names: &[String]) -> usize {
    if roots.is_empty() {
        return 0;
    }
    let system = process_table();
    let descendants = descendants_of(roots);

    let named: HashSet<u32> = descendants
        .iter()
        .copied()
        .filter(|pid| {
            system
                .process(Pid::from_u32(*pid))
                .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie) && name_matches(p.name(), names))
        })
        .collect();

    named
        .iter()
        .filter(|pid| {
            let parent = system.process(Pid::from_u32(**pid)).and_then(|p| p.parent());
            !parent.is_some_and(|parent| named.contains(&parent.as_u32()))
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::HarvestConfig;
    use crate::storage::MemoryRunControl;

    fn settings(num_workers: u32) -> WorkerSettings {
        WorkerSettings {
            num_workers,
            stagger_delay_ms: 10,
            graceful_timeout_secs: 1,
            kill_grace_secs: 1,
            monitor_interval_secs: 1,
            max_restarts: 2,
            browser_tolerance: 2,
            ..HarvestConfig::default().workers
        }
    }

    fn shell(script: &str) -> WorkerCommand {
        WorkerCommand::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    fn supervisor(script: &str, num_workers: u32) -> Supervisor {
        Supervisor::new(
            shell(script),
            settings(num_workers),
            vec!["sleep".to_string()],
            Arc::new(MemoryRunControl::new()),
        )
    }

    #[test]
    fn test_worker_id_is_substituted() {
        let command = WorkerCommand::new("harvester", vec!["worker".into(), "--worker-id".into(), "{worker_id}".into()]);
        let built = command.build(3);
        let args: Vec<_> = built.as_std().get_args().map(|a| a.to_string_lossy().to_string()).collect();
        assert_eq!(args, vec!["worker", "--worker-id", "3"]);
    }

    #[tokio::test]
    async fn test_start_spawns_exactly_num_workers() {
        let mut supervisor = supervisor("sleep 30 & wait", 3);
        supervisor.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(supervisor.alive_count().await, 3);
        assert_eq!(supervisor.worker_pids().await.len(), 3);

        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.alive_count().await, 0);
    }

    #[tokio::test]
    async fn test_stop_escalates_and_leaves_no_processes() {
        let mut supervisor = supervisor("trap '' TERM; sleep 30 & wait", 2);
        supervisor.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let pids = supervisor.worker_pids().await;
        let children = descendants_of(&pids);
        assert!(!children.is_empty());

        let started = std::time::Instant::now();
        supervisor.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1 + 1 + 2));

        assert_eq!(supervisor.alive_count().await, 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let system = process_table();
        for pid in pids.iter().chain(children.iter()) {
            let alive = system
                .process(Pid::from_u32(*pid))
                .is_some_and(|p| !matches!(p.status(), sysinfo::ProcessStatus::Zombie));
            assert!(!alive, "pid {} survived", pid);
        }
    }

    #[tokio::test]
    async fn test_crashed_workers_restart_up_to_the_limit() {
        let mut supervisor = supervisor("sleep 0.2; exit 3", 2);
        supervisor.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(supervisor.total_restarts().await, 4);

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_exit_is_not_restarted() {
        let mut supervisor = supervisor("exit 0", 1);
        supervisor.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(supervisor.total_restarts().await, 0);
        assert_eq!(supervisor.alive_count().await, 0);

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_browser_budget() {
        let mut within = supervisor("sleep 30 & wait", 2);
        within.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let budget = within.verify_browser_budget().await;
        assert_eq!(budget.browser_processes, 2);
        assert_eq!(budget.limit, 4);
        assert!(budget.within_budget);
        within.stop().await.unwrap();

        let mut leaking = supervisor("sleep 30 & sleep 30 & sleep 30 & wait", 2);
        leaking.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let budget = leaking.verify_browser_budget().await;
        assert_eq!(budget.browser_processes, 6);
        assert!(!budget.within_budget);
        leaking.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_browser_budget_sees_grandchildren() {
        let mut leaking = supervisor("sh -c 'sleep 30 & sleep 30 & sleep 30 & wait' & wait", 2);
        leaking.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let budget = leaking.verify_browser_budget().await;
        assert_eq!(budget.browser_processes, 6);
        assert_eq!(budget.limit, 4);
        assert!(!budget.within_budget);
        leaking.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_browser_helpers_count_as_one_instance() {
        // `timeout` forks `sleep`, the way chromedriver forks Chrome
        let mut pool = Supervisor::new(
            shell("timeout 30 sleep 30 & wait"),
            settings(2),
            vec!["timeout".to_string(), "sleep".to_string()],
            Arc::new(MemoryRunControl::new()),
        );
        pool.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let budget = pool.verify_browser_budget().await;
        assert_eq!(budget.browser_processes, 2);
        assert!(budget.within_budget);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_recoverable_until_restarts_run_out() {
        let mut settings = settings(1);
        settings.max_restarts = 1;
        settings.monitor_interval_secs = 1;
        let mut pool = Supervisor::new(
            shell("exit 3"),
            settings,
            vec!["sleep".to_string()],
            Arc::new(MemoryRunControl::new()),
        );
        pool.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Crashed, but the monitor has a restart left for it
        assert_eq!(pool.alive_count().await, 0);
        assert!(pool.can_recover().await);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(pool.total_restarts().await, 1);
        assert!(!pool.can_recover().await);

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_exit_is_not_recoverable() {
        let mut pool = supervisor("exit 0", 1);
        pool.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!pool.can_recover().await);
        pool.stop().await.unwrap();
    }
}
