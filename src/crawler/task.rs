use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};
use std::fmt;

/// Position of a village inside the district → taluk → hobli → village hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub district_code: String,
    pub district_name: String,
    pub taluk_code: String,
    pub taluk_name: String,
    pub hobli_code: String,
    pub hobli_name: String,
    pub village_code: String,
    pub village_name: String,
}

impl Location {
    /// Stable key for the full hierarchy, used inside task identifiers
    pub fn path_key(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.district_code, self.taluk_code, self.hobli_code, self.village_code
        )
    }
}

/// Lifecycle of a queued unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Atomic, idempotent unit of scraping work: one survey number in one village,
/// optionally narrowed to a surnoc / hissa / period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchTask {
    /// Session this task belongs to
    pub session_id: String,

    /// Location hierarchy codes and names
    pub location: Location,

    /// Survey number (required)
    pub survey_no: u32,

    /// Highest survey number of the village sweep this task is part of
    #[serde(default)]
    pub max_survey: u32,

    /// Refinements; `None` means "enumerate every value at this level"
    pub surnoc: Option<String>,
    pub hissa: Option<String>,
    pub period: Option<String>,

    /// Owner name searched for, plus case variants used for matching
    pub owner_name: String,
    pub owner_variants: Vec<String>,

    /// Deterministic identifier derived from the hierarchy and survey coordinates
    pub task_id: String,

    pub retry_count: u32,
    pub status: TaskStatus,
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Worker that processed (or is processing) this task
    pub worker_id: Option<u32>,
}

impl SearchTask {
    pub fn new(
        session_id: &str,
        location: Location,
        survey_no: u32,
        owner_name: &str,
        owner_variants: Vec<String>,
    ) -> Self {
        let mut task = Self {
            session_id: session_id.to_string(),
            location,
            survey_no,
            max_survey: survey_no,
            surnoc: None,
            hissa: None,
            period: None,
            owner_name: owner_name.to_string(),
            owner_variants,
            task_id: String::new(),
            retry_count: 0,
            status: TaskStatus::Pending,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            worker_id: None,
        };
        task.task_id = task.derive_id();
        task
    }

    /// Narrow the task to a single surnoc / hissa, re-deriving its identifier
    pub fn narrowed(mut self, surnoc: Option<String>, hissa: Option<String>) -> Self {
        self.surnoc = surnoc;
        self.hissa = hissa;
        self.task_id = self.derive_id();
        self
    }

    /// Unique within a session; queue keys already carry the session id
    fn derive_id(&self) -> String {
        let mut parts = vec![self.location.path_key(), format!("S{}", self.survey_no)];
        if let Some(surnoc) = &self.surnoc {
            parts.push(format!("SN{}", surnoc));
        }
        if let Some(hissa) = &self.hissa {
            parts.push(format!("H{}", hissa));
        }
        parts.join("_")
    }

    pub fn mark_started(&mut self, worker_id: u32) {
        self.status = TaskStatus::Processing;
        self.worker_id = Some(worker_id);
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: &str) {
        self.status = TaskStatus::Failed;
        self.error_message = Some(error.to_string());
        self.completed_at = Some(Utc::now());
    }

    pub fn can_retry(&self, max_retries: u32) -> bool {
        self.retry_count < max_retries
    }

    /// Prepare the task for re-queuing
    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
        self.status = TaskStatus::Pending;
        self.error_message = None;
        self.started_at = None;
        self.completed_at = None;
    }

    /// Whether this survey closes the village sweep
    pub fn is_last_survey(&self) -> bool {
        self.survey_no >= self.max_survey
    }

    pub fn summary(&self) -> String {
        let mut summary = format!("{} - Survey #{}", self.location.village_name, self.survey_no);
        if let Some(surnoc) = &self.surnoc {
            summary.push_str(&format!(" / Surnoc {}", surnoc));
        }
        if let Some(hissa) = &self.hissa {
            summary.push_str(&format!(" / Hissa {}", hissa));
        }
        summary
    }
}

/// Village-level aggregate; expands into one survey task per survey number
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VillageTask {
    pub session_id: String,
    pub location: Location,
    pub max_survey: u32,
    pub status: VillageStatus,

    pub surveys_completed: u32,
    pub records_found: u64,
    pub matches_found: u64,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VillageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl VillageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VillageStatus::Pending => "pending",
            VillageStatus::InProgress => "in_progress",
            VillageStatus::Completed => "completed",
            VillageStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "in_progress" => VillageStatus::InProgress,
            "completed" => VillageStatus::Completed,
            "failed" => VillageStatus::Failed,
            _ => VillageStatus::Pending,
        }
    }
}

impl VillageTask {
    pub fn new(session_id: &str, location: Location, max_survey: u32) -> Self {
        Self {
            session_id: session_id.to_string(),
            location,
            max_survey,
            status: VillageStatus::Pending,
            surveys_completed: 0,
            records_found: 0,
            matches_found: 0,
            started_at: None,
            completed_at: None,
        }
    }

    /// One task per survey number, 1..=max_survey, no gaps
    pub fn generate_survey_tasks(&self, owner_name: &str, owner_variants: &[String]) -> Vec<SearchTask> {
        self.generate_survey_tasks_from(1, owner_name, owner_variants)
    }

    /// Same as [`generate_survey_tasks`](Self::generate_survey_tasks) but resuming at `start`
    pub fn generate_survey_tasks_from(
        &self,
        start: u32,
        owner_name: &str,
        owner_variants: &[String],
    ) -> Vec<SearchTask> {
        (start.max(1)..=self.max_survey)
            .map(|survey_no| {
                let mut task = SearchTask::new(
                    &self.session_id,
                    self.location.clone(),
                    survey_no,
                    owner_name,
                    owner_variants.to_vec(),
                );
                task.max_survey = self.max_survey;
                task
            })
            .collect()
    }
}
