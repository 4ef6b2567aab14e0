use anyhow::{Result, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Parameters of a new search session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionParams {
    pub owner_name: String,
    pub owner_variants: Vec<String>,
    pub max_survey: u32,
    pub total_villages: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub owner_name: String,
    pub owner_variants: Vec<String>,
    pub max_survey: u32,
    pub total_villages: u32,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One scraped owner row. Refinement levels that do not apply are empty
/// strings, never NULL, so the natural key stays unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandRecord {
    pub session_id: String,
    pub district: String,
    pub taluk: String,
    pub hobli: String,
    pub village_code: String,
    pub village: String,
    pub survey_no: u32,
    pub surnoc: String,
    pub hissa: String,
    pub period: String,
    pub owner_name: String,
    pub extent: String,
    pub khata: String,
    pub is_match: bool,
    pub worker_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub survey_no: u32,
    pub processed_surnocs: Vec<String>,
}

/// A unit of work abandoned after exhausting its retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedItem {
    pub session_id: String,
    pub village_code: String,
    pub village_name: String,
    pub survey_no: u32,
    pub surnoc: Option<String>,
    pub hissa: Option<String>,
    pub period: Option<String>,
    pub reason: String,
    pub retry_count: u32,
    pub worker_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VillageProgress {
    pub session_id: String,
    pub village_code: String,
    pub village_name: String,
    pub hobli_name: String,
    pub status: String,
    pub last_survey_no: u32,
    pub max_survey_no: u32,
    /// Derived from `land_records` on every update
    pub records_found: u64,
    pub matches_found: u64,
    pub stop_reason: Option<String>,
    pub confidence: Option<f64>,
    pub confidence_level: Option<String>,
    pub error_message: Option<String>,
    /// Sweep counters, so a restarted worker picks up the empty-survey run
    pub surveys_checked: u32,
    pub consecutive_empty: u32,
    pub last_with_data: Option<u32>,
    pub skipped_count: u32,
}

/// Durable progress, record and failure store shared by every worker process
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn create_session(&self, params: &SessionParams) -> Result<String>;
    async fn update_session_status(&self, session_id: &str, status: &str) -> Result<()>;
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    /// Idempotent upsert on the natural key; `true` when the row is new
    async fn save_record(&self, record: &LandRecord) -> Result<bool>;
    async fn count_records(&self, session_id: &str, matches_only: bool) -> Result<u64>;

    async fn save_checkpoint(&self, session_id: &str, village_code: &str, survey_no: u32, processed_surnocs: &[String]) -> Result<()>;
    async fn get_last_checkpoint(&self, session_id: &str, village_code: &str) -> Result<Option<Checkpoint>>;

    async fn save_skipped_item(&self, item: &SkippedItem) -> Result<()>;
    async fn get_skipped_items(&self, session_id: &str) -> Result<Vec<SkippedItem>>;

    async fn update_village_progress(&self, progress: &VillageProgress) -> Result<()>;
    async fn get_village_progress(&self, session_id: &str) -> Result<Vec<VillageProgress>>;
    /// Put a village back to `pending` with cleared sweep counters
    async fn reset_village_progress(&self, session_id: &str, village_code: &str) -> Result<()>;
}

pub fn new_session_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("search_{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &suffix[..8])
}

/// SQLite ledger in WAL mode; every write retries on lock contention
pub struct SqliteLedger {
    pool: SqlitePool,
    write_retries: u32,
    write_backoff: Duration,
}

fn is_contention(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            let message = db.message().to_lowercase();
            message.contains("locked") || message.contains("busy")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

impl SqliteLedger {
    pub async fn open(path: &Path, write_retries: u32, write_backoff_ms: u64) -> Result<Self> {
        debug!("Opening SQLite ledger at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create directory: {}", parent.display()))?;
        }

        let connect_options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .connect_with(connect_options)
            .await
            .context(format!("Failed to open SQLite database: {}", path.display()))?;

        let ledger = Self {
            pool,
            write_retries,
            write_backoff: Duration::from_millis(write_backoff_ms),
        };
        ledger.ensure_schema().await?;

        Ok(ledger)
    }

    async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS search_sessions (
                session_id TEXT PRIMARY KEY,
                owner_name TEXT NOT NULL,
                owner_variants TEXT NOT NULL DEFAULT '[]',
                max_survey INTEGER NOT NULL DEFAULT 200,
                total_villages INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'running',
                started_at TEXT NOT NULL,
                completed_at TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS land_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                district TEXT NOT NULL,
                taluk TEXT NOT NULL,
                hobli TEXT NOT NULL,
                village_code TEXT NOT NULL,
                village TEXT NOT NULL,
                survey_no INTEGER NOT NULL,
                surnoc TEXT NOT NULL DEFAULT '',
                hissa TEXT NOT NULL DEFAULT '',
                period TEXT NOT NULL DEFAULT '',
                owner_name TEXT NOT NULL,
                extent TEXT NOT NULL DEFAULT '',
                khata TEXT NOT NULL DEFAULT '',
                is_match INTEGER NOT NULL DEFAULT 0,
                worker_id INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                UNIQUE(session_id, village_code, survey_no, surnoc, hissa, period, owner_name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS survey_checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                village_code TEXT NOT NULL,
                survey_no INTEGER NOT NULL,
                processed_surnocs TEXT NOT NULL DEFAULT '[]',
                completed_at TEXT NOT NULL,
                UNIQUE(session_id, village_code, survey_no)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS skipped_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                village_code TEXT NOT NULL,
                village_name TEXT NOT NULL,
                survey_no INTEGER NOT NULL,
                surnoc TEXT,
                hissa TEXT,
                period TEXT,
                reason TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                worker_id INTEGER,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS village_progress (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                village_code TEXT NOT NULL,
                village_name TEXT NOT NULL,
                hobli_name TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending',
                last_survey_no INTEGER NOT NULL DEFAULT 0,
                max_survey_no INTEGER NOT NULL DEFAULT 200,
                records_found INTEGER NOT NULL DEFAULT 0,
                matches_found INTEGER NOT NULL DEFAULT 0,
                stop_reason TEXT,
                confidence REAL,
                confidence_level TEXT,
                error_message TEXT,
                surveys_checked INTEGER NOT NULL DEFAULT 0,
                consecutive_empty INTEGER NOT NULL DEFAULT 0,
                last_with_data INTEGER,
                skipped_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                UNIQUE(session_id, village_code)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_records_session ON land_records(session_id)",
            "CREATE INDEX IF NOT EXISTS idx_records_match ON land_records(session_id, is_match)",
            "CREATE INDEX IF NOT EXISTS idx_skipped_session ON skipped_items(session_id)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to create ledger schema")?;
        }
        Ok(())
    }

    /// Run a write, retrying with exponential backoff while the database is locked
    async fn write<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if is_contention(&e) && attempt < self.write_retries => {
                    let backoff = self.write_backoff * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    warn!("Ledger busy during {} (attempt {}), retrying in {:?}", what, attempt, backoff);
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e).context(format!("Failed to {}", what)),
            }
        }
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn create_session(&self, params: &SessionParams) -> Result<String> {
        let session_id = new_session_id();
        let variants = serde_json::to_string(&params.owner_variants)
            .context("Failed to serialize owner variants")?;

        self.write("create session", || {
            sqlx::query(
                "INSERT INTO search_sessions (session_id, owner_name, owner_variants, max_survey, total_villages, status, started_at)
                 VALUES (?, ?, ?, ?, ?, 'running', ?)",
            )
            .bind(session_id.as_str())
            .bind(params.owner_name.as_str())
            .bind(variants.as_str())
            .bind(params.max_survey)
            .bind(params.total_villages)
            .bind(Utc::now())
            .execute(&self.pool)
        })
        .await?;

        debug!("Created session {}", session_id);
        Ok(session_id)
    }

    async fn update_session_status(&self, session_id: &str, status: &str) -> Result<()> {
        let finished = matches!(status, "completed" | "stopped" | "failed");
        self.write("update session status", || {
            sqlx::query(
                "UPDATE search_sessions
                 SET status = ?, completed_at = CASE WHEN ? THEN ? ELSE completed_at END
                 WHERE session_id = ?",
            )
            .bind(status)
            .bind(finished)
            .bind(Utc::now())
            .bind(session_id)
            .execute(&self.pool)
        })
        .await?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query(
            "SELECT session_id, owner_name, owner_variants, max_survey, total_villages, status, started_at, completed_at
             FROM search_sessions WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load session")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let variants: String = row.try_get("owner_variants")?;
        Ok(Some(SessionRecord {
            session_id: row.try_get("session_id")?,
            owner_name: row.try_get("owner_name")?,
            owner_variants: serde_json::from_str(&variants)
                .context(format!("Corrupt owner variants for session {}", session_id))?,
            max_survey: row.try_get("max_survey")?,
            total_villages: row.try_get("total_villages")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        }))
    }

    async fn save_record(&self, record: &LandRecord) -> Result<bool> {
        let inserted = self
            .write("save record", || {
                sqlx::query(
                    "INSERT INTO land_records (session_id, district, taluk, hobli, village_code, village, survey_no,
                                               surnoc, hissa, period, owner_name, extent, khata, is_match, worker_id, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(session_id, village_code, survey_no, surnoc, hissa, period, owner_name) DO NOTHING",
                )
                .bind(record.session_id.as_str())
                .bind(record.district.as_str())
                .bind(record.taluk.as_str())
                .bind(record.hobli.as_str())
                .bind(record.village_code.as_str())
                .bind(record.village.as_str())
                .bind(record.survey_no)
                .bind(record.surnoc.as_str())
                .bind(record.hissa.as_str())
                .bind(record.period.as_str())
                .bind(record.owner_name.as_str())
                .bind(record.extent.as_str())
                .bind(record.khata.as_str())
                .bind(record.is_match)
                .bind(record.worker_id)
                .bind(Utc::now())
                .execute(&self.pool)
            })
            .await?
            .rows_affected()
            > 0;

        if !inserted {
            // Re-execution of the same task: refresh the non-key columns in place
            self.write("refresh record", || {
                sqlx::query(
                    "UPDATE land_records SET extent = ?, khata = ?, is_match = ?, worker_id = ?
                     WHERE session_id = ? AND village_code = ? AND survey_no = ? AND surnoc = ?
                       AND hissa = ? AND period = ? AND owner_name = ?",
                )
                .bind(record.extent.as_str())
                .bind(record.khata.as_str())
                .bind(record.is_match)
                .bind(record.worker_id)
                .bind(record.session_id.as_str())
                .bind(record.village_code.as_str())
                .bind(record.survey_no)
                .bind(record.surnoc.as_str())
                .bind(record.hissa.as_str())
                .bind(record.period.as_str())
                .bind(record.owner_name.as_str())
                .execute(&self.pool)
            })
            .await?;
        }

        Ok(inserted)
    }

    async fn count_records(&self, session_id: &str, matches_only: bool) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM land_records WHERE session_id = ? AND (is_match = 1 OR ? = 0)",
        )
        .bind(session_id)
        .bind(matches_only)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count records")?;
        Ok(count as u64)
    }

    async fn save_checkpoint(&self, session_id: &str, village_code: &str, survey_no: u32, processed_surnocs: &[String]) -> Result<()> {
        let processed = serde_json::to_string(processed_surnocs)
            .context("Failed to serialize processed surnocs")?;

        self.write("save checkpoint", || {
            sqlx::query(
                "INSERT INTO survey_checkpoints (session_id, village_code, survey_no, processed_surnocs, completed_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(session_id, village_code, survey_no)
                 DO UPDATE SET processed_surnocs = excluded.processed_surnocs, completed_at = excluded.completed_at",
            )
            .bind(session_id)
            .bind(village_code)
            .bind(survey_no)
            .bind(processed.as_str())
            .bind(Utc::now())
            .execute(&self.pool)
        })
        .await?;

        debug!("Checkpoint {} / {} -> survey {}", session_id, village_code, survey_no);
        Ok(())
    }

    async fn get_last_checkpoint(&self, session_id: &str, village_code: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT survey_no, processed_surnocs FROM survey_checkpoints
             WHERE session_id = ? AND village_code = ?
             ORDER BY survey_no DESC LIMIT 1",
        )
        .bind(session_id)
        .bind(village_code)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load checkpoint")?;

        row.map(|row| {
            let processed: String = row.try_get("processed_surnocs")?;
            Ok(Checkpoint {
                survey_no: row.try_get("survey_no")?,
                processed_surnocs: serde_json::from_str(&processed)
                    .context(format!("Corrupt processed surnocs for {} / {}", session_id, village_code))?,
            })
        })
        .transpose()
    }

    async fn save_skipped_item(&self, item: &SkippedItem) -> Result<()> {
        self.write("save skipped item", || {
            sqlx::query(
                "INSERT INTO skipped_items (session_id, village_code, village_name, survey_no, surnoc, hissa, period,
                                            reason, retry_count, worker_id, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(item.session_id.as_str())
            .bind(item.village_code.as_str())
            .bind(item.village_name.as_str())
            .bind(item.survey_no)
            .bind(item.surnoc.as_deref())
            .bind(item.hissa.as_deref())
            .bind(item.period.as_deref())
            .bind(item.reason.as_str())
            .bind(item.retry_count)
            .bind(item.worker_id)
            .bind(Utc::now())
            .execute(&self.pool)
        })
        .await?;

        warn!(
            "Skipped {} survey {} ({}): {}",
            item.village_name, item.survey_no,
            [item.surnoc.as_deref(), item.hissa.as_deref(), item.period.as_deref()]
                .iter()
                .flatten()
                .copied()
                .collect::<Vec<_>>()
                .join("/"),
            item.reason
        );
        Ok(())
    }

    async fn get_skipped_items(&self, session_id: &str) -> Result<Vec<SkippedItem>> {
        let rows = sqlx::query(
            "SELECT session_id, village_code, village_name, survey_no, surnoc, hissa, period, reason, retry_count, worker_id
             FROM skipped_items WHERE session_id = ? ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load skipped items")?;

        rows.iter()
            .map(|row| {
                Ok(SkippedItem {
                    session_id: row.try_get("session_id")?,
                    village_code: row.try_get("village_code")?,
                    village_name: row.try_get("village_name")?,
                    survey_no: row.try_get("survey_no")?,
                    surnoc: row.try_get("surnoc")?,
                    hissa: row.try_get("hissa")?,
                    period: row.try_get("period")?,
                    reason: row.try_get("reason")?,
                    retry_count: row.try_get("retry_count")?,
                    worker_id: row.try_get("worker_id")?,
                })
            })
            .collect()
    }

    async fn update_village_progress(&self, progress: &VillageProgress) -> Result<()> {
        self.write("update village progress", || {
            sqlx::query(
                "INSERT INTO village_progress (session_id, village_code, village_name, hobli_name, status, last_survey_no,
                                               max_survey_no, records_found, matches_found, stop_reason, confidence,
                                               confidence_level, error_message, surveys_checked, consecutive_empty,
                                               last_with_data, skipped_count, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7,
                         (SELECT COUNT(*) FROM land_records WHERE session_id = ?1 AND village_code = ?2),
                         (SELECT COUNT(*) FROM land_records WHERE session_id = ?1 AND village_code = ?2 AND is_match = 1),
                         ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                 ON CONFLICT(session_id, village_code) DO UPDATE SET
                     status = excluded.status,
                     last_survey_no = MAX(village_progress.last_survey_no, excluded.last_survey_no),
                     max_survey_no = excluded.max_survey_no,
                     records_found = excluded.records_found,
                     matches_found = excluded.matches_found,
                     stop_reason = COALESCE(excluded.stop_reason, village_progress.stop_reason),
                     confidence = COALESCE(excluded.confidence, village_progress.confidence),
                     confidence_level = COALESCE(excluded.confidence_level, village_progress.confidence_level),
                     error_message = excluded.error_message,
                     surveys_checked = excluded.surveys_checked,
                     consecutive_empty = excluded.consecutive_empty,
                     last_with_data = excluded.last_with_data,
                     skipped_count = excluded.skipped_count,
                     updated_at = excluded.updated_at",
            )
            .bind(progress.session_id.as_str())
            .bind(progress.village_code.as_str())
            .bind(progress.village_name.as_str())
            .bind(progress.hobli_name.as_str())
            .bind(progress.status.as_str())
            .bind(progress.last_survey_no)
            .bind(progress.max_survey_no)
            .bind(progress.stop_reason.as_deref())
            .bind(progress.confidence)
            .bind(progress.confidence_level.as_deref())
            .bind(progress.error_message.as_deref())
            .bind(progress.surveys_checked)
            .bind(progress.consecutive_empty)
            .bind(progress.last_with_data)
            .bind(progress.skipped_count)
            .bind(Utc::now())
            .execute(&self.pool)
        })
        .await?;
        Ok(())
    }

    async fn get_village_progress(&self, session_id: &str) -> Result<Vec<VillageProgress>> {
        let rows = sqlx::query(
            "SELECT session_id, village_code, village_name, hobli_name, status, last_survey_no, max_survey_no,
                    records_found, matches_found, stop_reason, confidence, confidence_level, error_message,
                    surveys_checked, consecutive_empty, last_with_data, skipped_count
             FROM village_progress WHERE session_id = ? ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load village progress")?;

        rows.iter()
            .map(|row| {
                let records: i64 = row.try_get("records_found")?;
                let matches: i64 = row.try_get("matches_found")?;
                Ok(VillageProgress {
                    session_id: row.try_get("session_id")?,
                    village_code: row.try_get("village_code")?,
                    village_name: row.try_get("village_name")?,
                    hobli_name: row.try_get("hobli_name")?,
                    status: row.try_get("status")?,
                    last_survey_no: row.try_get("last_survey_no")?,
                    max_survey_no: row.try_get("max_survey_no")?,
                    records_found: records as u64,
                    matches_found: matches as u64,
                    stop_reason: row.try_get("stop_reason")?,
                    confidence: row.try_get("confidence")?,
                    confidence_level: row.try_get("confidence_level")?,
                    error_message: row.try_get("error_message")?,
                    surveys_checked: row.try_get("surveys_checked")?,
                    consecutive_empty: row.try_get("consecutive_empty")?,
                    last_with_data: row.try_get("last_with_data")?,
                    skipped_count: row.try_get("skipped_count")?,
                })
            })
            .collect()
    }

    async fn reset_village_progress(&self, session_id: &str, village_code: &str) -> Result<()> {
        self.write("reset village progress", || {
            sqlx::query(
                "UPDATE village_progress
                 SET status = 'pending', stop_reason = NULL, confidence = NULL, confidence_level = NULL,
                     error_message = NULL, surveys_checked = 0, consecutive_empty = 0, last_with_data = NULL,
                     skipped_count = 0, updated_at = ?3
                 WHERE session_id = ?1 AND village_code = ?2",
            )
            .bind(session_id)
            .bind(village_code)
            .bind(Utc::now())
            .execute(&self.pool)
        })
        .await?;
        Ok(())
    }
}
