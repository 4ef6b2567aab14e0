use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::fs;
use tracing::{info, debug, error};

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HarvestConfig {
    pub portal: PortalSettings,
    pub browser: BrowserSettings,
    pub workers: WorkerSettings,
    pub health: HealthSettings,
    pub rate_limit: RateLimitSettings,
    pub sweep: SweepSettings,
    pub storage: StorageSettings,
}

/// The remote cascading form
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PortalSettings {
    pub base_url: String,
    pub element_ids: ElementIds,
    /// Phrases meaning the portal dropped our session
    pub session_phrases: Vec<String>,
    /// Phrases meaning "facing issues, try again later"
    pub portal_issue_phrases: Vec<String>,
}

/// DOM ids of the form controls
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ElementIds {
    pub district: String,
    pub taluk: String,
    pub hobli: String,
    pub village: String,
    pub survey_no: String,
    pub surnoc: String,
    pub hissa: String,
    pub period: String,
    pub go_button: String,
    pub fetch_button: String,
}

/// Browser engine settings (one chromedriver + Chrome per worker)
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrowserSettings {
    pub chromedriver_path: String,
    /// Worker N drives chromedriver on `driver_base_port + N`
    pub driver_base_port: u16,
    pub headless: bool,
    pub window_width: u32,
    pub window_height: u32,
    pub page_load_timeout_secs: u64,
    pub element_wait_secs: u64,
    pub post_click_wait_ms: u64,
    pub post_select_wait_ms: u64,
    /// Process names counted by the browser budget check
    pub process_names: Vec<String>,
}

/// Worker pool and supervision settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkerSettings {
    pub num_workers: u32,
    pub stagger_delay_ms: u64,
    pub default_max_survey: u32,
    pub queue_capacity: usize,
    pub pop_timeout_secs: u64,

    pub recycle_after_tasks: u32,
    pub recycle_after_secs: u64,

    pub max_retries: u32,
    pub combination_retries: u32,
    pub session_resets_before_recreate: u32,
    pub browser_recreate_attempts: u32,
    pub gate_backoff_cap_secs: u64,

    pub graceful_timeout_secs: u64,
    pub kill_grace_secs: u64,
    pub monitor_interval_secs: u64,
    pub auto_restart: bool,
    pub max_restarts: u32,
    pub browser_tolerance: usize,
    pub heartbeat_ttl_secs: u64,
}

/// Circuit breaker settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HealthSettings {
    /// Defaults to the portal base URL when unset
    pub probe_url: Option<String>,
    pub interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub healthy_ms: u64,
    pub degraded_ms: u64,
    pub down_after_failures: u32,
    pub backoff_cap_secs: u64,
    pub degraded_admit_ratio: f64,
    pub burst_failures: usize,
    pub burst_min_workers: usize,
    pub burst_window_secs: u64,
    pub cooldown_secs: u64,
}

/// Shared token bucket
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RateLimitSettings {
    pub capacity: u32,
    pub refill_rate: f64,
    pub acquire_timeout_secs: u64,
}

/// Per-village sweep settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SweepSettings {
    pub smart_stop_enabled: bool,
    pub empty_survey_threshold: u32,
    pub min_surveys_before_stop: u32,
}

/// Storage settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageSettings {
    pub redis_url: String,
    pub key_prefix: String,
    pub task_ttl: u64, // Time to live for queue keys in seconds
    pub database_path: PathBuf,
    pub write_retries: u32,
    pub write_backoff_ms: u64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            portal: PortalSettings {
                base_url: "https://landrecords.karnataka.gov.in/Service2/".to_string(),
                element_ids: ElementIds {
                    district: "ctl00_MainContent_ddlCDistrict".to_string(),
                    taluk: "ctl00_MainContent_ddlCTaluk".to_string(),
                    hobli: "ctl00_MainContent_ddlCHobli".to_string(),
                    village: "ctl00_MainContent_ddlCVillage".to_string(),
                    survey_no: "ctl00_MainContent_txtCSurveyNo".to_string(),
                    surnoc: "ctl00_MainContent_ddlCSurnocNo".to_string(),
                    hissa: "ctl00_MainContent_ddlCHissaNo".to_string(),
                    period: "ctl00_MainContent_ddlCPeriod".to_string(),
                    go_button: "ctl00_MainContent_btnCGo".to_string(),
                    fetch_button: "ctl00_MainContent_btnCFetchDetails".to_string(),
                },
                session_phrases: [
                    "session expired",
                    "session has expired",
                    "session timeout",
                    "please login again",
                    "login again",
                    "session has been terminated",
                    "ಸೆಷನ್ ಮುಗಿದಿದೆ",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
                portal_issue_phrases: [
                    "facing issues",
                    "try again later",
                    "server error",
                    "internal error",
                    "maintenance",
                    "temporarily unavailable",
                    "ದೋಷ",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            },
            browser: BrowserSettings {
                chromedriver_path: "chromedriver".to_string(),
                driver_base_port: 9515,
                headless: true,
                window_width: 1920,
                window_height: 1080,
                page_load_timeout_secs: 20,
                element_wait_secs: 8,
                post_click_wait_ms: 4000,
                post_select_wait_ms: 1500,
                process_names: vec![
                    "chromedriver".to_string(),
                    "chrome".to_string(),
                    "chromium".to_string(),
                    "headless_shell".to_string(),
                ],
            },
            workers: WorkerSettings {
                num_workers: 4,
                stagger_delay_ms: 700,
                default_max_survey: 200,
                queue_capacity: 500,
                pop_timeout_secs: 5,
                recycle_after_tasks: 200,
                recycle_after_secs: 7200,
                max_retries: 3,
                combination_retries: 2,
                session_resets_before_recreate: 2,
                browser_recreate_attempts: 3,
                gate_backoff_cap_secs: 30,
                graceful_timeout_secs: 30,
                kill_grace_secs: 5,
                monitor_interval_secs: 5,
                auto_restart: true,
                max_restarts: 5,
                browser_tolerance: 2,
                heartbeat_ttl_secs: 120,
            },
            health: HealthSettings {
                probe_url: None,
                interval_secs: 10,
                probe_timeout_secs: 5,
                healthy_ms: 1000,
                degraded_ms: 3000,
                down_after_failures: 5,
                backoff_cap_secs: 300,
                degraded_admit_ratio: 0.5,
                burst_failures: 3,
                burst_min_workers: 2,
                burst_window_secs: 60,
                cooldown_secs: 60,
            },
            rate_limit: RateLimitSettings {
                capacity: 10,
                refill_rate: 2.0,
                acquire_timeout_secs: 30,
            },
            sweep: SweepSettings {
                smart_stop_enabled: true,
                empty_survey_threshold: 50,
                min_surveys_before_stop: 10,
            },
            storage: StorageSettings {
                redis_url: "redis://localhost:6379".to_string(),
                key_prefix: "bhoomi".to_string(),
                task_ttl: 86400,
                database_path: Self::data_dir().join("harvest.db"),
                write_retries: 5,
                write_backoff_ms: 100,
            },
        }
    }
}

impl HarvestConfig {
    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("in", "bhoomi-harvester", "bhoomi-harvester")
    }

    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let mut path = if let Some(proj_dirs) = Self::project_dirs() {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        path.push("profiles");
        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path.pop();
        path
    }

    /// Directory holding the ledger database and log files
    pub fn data_dir() -> PathBuf {
        if let Some(proj_dirs) = Self::project_dirs() {
            proj_dirs.data_dir().to_path_buf()
        } else {
            PathBuf::from("./data")
        }
    }

    /// Load the named profile, or the default configuration when none is given
    pub fn load(profile: Option<&str>) -> Result<Self> {
        match profile {
            Some(name) => Self::load_profile(name)
                .context(format!("Failed to load profile: {}", name)),
            None => Self::load_default(),
        }
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_path = Self::config_dir().join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            Ok(config)
        }
    }

    /// Load a configuration profile
    pub fn load_profile(profile: &str) -> Result<Self> {
        let profile_path = Self::config_dir().join("profiles").join(format!("{}.yaml", profile));

        if profile_path.exists() {
            Self::load_from_file(&profile_path)
        } else {
            anyhow::bail!("Profile '{}' not found", profile)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the pool cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.workers.num_workers == 0 {
            anyhow::bail!("workers.num_workers must be at least 1");
        }
        if self.rate_limit.capacity == 0 || self.rate_limit.refill_rate <= 0.0 {
            anyhow::bail!("rate_limit.capacity and rate_limit.refill_rate must be positive");
        }
        if !(0.0..=1.0).contains(&self.health.degraded_admit_ratio) {
            anyhow::bail!("health.degraded_admit_ratio must be within 0..=1");
        }
        url::Url::parse(&self.portal.base_url)
            .context(format!("portal.base_url is not a valid URL: {}", self.portal.base_url))?;
        if let Some(probe_url) = &self.health.probe_url {
            url::Url::parse(probe_url)
                .context(format!("health.probe_url is not a valid URL: {}", probe_url))?;
        }
        if self.health.healthy_ms > self.health.degraded_ms {
            anyhow::bail!("health.healthy_ms must not exceed health.degraded_ms");
        }
        Ok(())
    }

    /// URL probed by the health monitor
    pub fn probe_url(&self) -> &str {
        self.health.probe_url.as_deref().unwrap_or(&self.portal.base_url)
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        let config_path = Self::config_dir().join("default.yaml");
        self.save_to_file(&config_path)
    }

    /// Save the configuration as a profile
    pub async fn save_as_profile(&self, profile: &str) -> Result<()> {
        let profiles_dir = Self::config_dir().join("profiles");

        if !profiles_dir.exists() {
            fs::create_dir_all(&profiles_dir)
                .context(format!("Failed to create profiles directory: {}", profiles_dir.display()))?;
        }

        let profile_path = profiles_dir.join(format!("{}.yaml", profile));
        self.save_to_file(&profile_path)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// List all available profiles
    pub async fn list_profiles() -> Result<Vec<String>> {
        let profiles_dir = Self::config_dir().join("profiles");

        if !profiles_dir.exists() {
            return Ok(vec![]);
        }

        let mut profiles = Vec::new();

        for entry in fs::read_dir(profiles_dir)? {
            let path = entry?.path();

            if path.is_file() && path.extension().map_or(false, |ext| ext == "yaml") {
                if let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) {
                    profiles.push(name.to_string());
                }
            }
        }

        profiles.sort();
        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = HarvestConfig::default();
        tokio_test::assert_ok!(config.validate());
        assert_eq!(config.probe_url(), "https://landrecords.karnataka.gov.in/Service2/");
        assert_eq!(config.workers.recycle_after_tasks, 200);
        assert_eq!(config.rate_limit.capacity, 10);
    }

    #[test]
    fn test_yaml_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("custom.yaml");

        let mut config = HarvestConfig::default();
        config.workers.num_workers = 8;
        config.health.probe_url = Some("http://127.0.0.1:9/".to_string());
        config.save_to_file(&path).unwrap();

        let loaded = HarvestConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.workers.num_workers, 8);
        assert_eq!(loaded.probe_url(), "http://127.0.0.1:9/");
        assert_eq!(loaded.portal.element_ids.fetch_button, "ctl00_MainContent_btnCFetchDetails");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = HarvestConfig::default();
        config.workers.num_workers = 0;
        assert!(config.validate().is_err());

        let mut config = HarvestConfig::default();
        config.health.degraded_admit_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = HarvestConfig::default();
        config.portal.base_url = "not a url".to_string();
        tokio_test::assert_err!(config.validate());
    }
}
