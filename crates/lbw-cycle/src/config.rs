use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use lbw_adapters::{GeminiConfig, SmtpConfig, DEFAULT_GEMINI_MODEL, LAST_BOTTLE_URL};

/// Runtime knobs for the cycle, read from the environment.
#[derive(Debug, Clone)]
pub struct CycleConfig {
    pub database_url: String,
    pub profiles_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub listing_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub score_timeout_secs: u64,
    pub notify_timeout_secs: u64,
    pub max_notify_attempts: u32,
    pub scheduler_cron: String,
    pub operator_email: Option<String>,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub smtp_host: Option<String>,
    pub smtp_port: Option<u16>,
    pub smtp_user: Option<String>,
    pub smtp_pass: Option<String>,
    pub hostname: String,
}

impl CycleConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:data/wines.db".to_string()),
            profiles_dir: std::env::var("LBW_PROFILES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/user_configs")),
            reports_dir: std::env::var("LBW_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/reports")),
            listing_url: std::env::var("LBW_LISTING_URL")
                .unwrap_or_else(|_| LAST_BOTTLE_URL.to_string()),
            user_agent: std::env::var("LBW_USER_AGENT")
                .unwrap_or_else(|_| "last-bottle-watch/0.1".to_string()),
            http_timeout_secs: env_parse("LBW_HTTP_TIMEOUT_SECS", 20),
            fetch_timeout_secs: env_parse("LBW_FETCH_TIMEOUT_SECS", 90),
            score_timeout_secs: env_parse("LBW_SCORE_TIMEOUT_SECS", 60),
            notify_timeout_secs: env_parse("LBW_NOTIFY_TIMEOUT_SECS", 30),
            max_notify_attempts: env_parse("LBW_MAX_NOTIFY_ATTEMPTS", 3u32).max(1),
            scheduler_cron: std::env::var("LBW_SCHEDULER_CRON")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
            operator_email: env_non_empty("LBW_OPERATOR_EMAIL"),
            gemini_api_key: env_non_empty("GEMINI_API_KEY")
                .or_else(|| env_non_empty("GOOGLE_API_KEY")),
            gemini_model: env_non_empty("LBW_GEMINI_MODEL")
                .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            smtp_host: env_non_empty("SMTP_HOST"),
            smtp_port: env_non_empty("SMTP_PORT").and_then(|v| v.parse().ok()),
            smtp_user: env_non_empty("SMTP_USER"),
            smtp_pass: env_non_empty("SMTP_PASS"),
            hostname: env_non_empty("HOSTNAME").unwrap_or_else(|| "localhost".to_string()),
        }
    }

    pub fn settings(&self) -> CycleSettings {
        CycleSettings {
            profiles_dir: self.profiles_dir.clone(),
            reports_dir: Some(self.reports_dir.clone()),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            score_timeout: Duration::from_secs(self.score_timeout_secs),
            notify_timeout: Duration::from_secs(self.notify_timeout_secs),
            max_notify_attempts: self.max_notify_attempts,
            operator_email: self.operator_email.clone(),
        }
    }

    pub fn smtp(&self) -> SmtpConfig {
        SmtpConfig {
            host: self.smtp_host.clone(),
            port: self.smtp_port,
            username: self.smtp_user.clone(),
            password: self.smtp_pass.clone(),
            from: self
                .smtp_user
                .clone()
                .unwrap_or_else(|| format!("no-reply@{}", self.hostname)),
            timeout: Duration::from_secs(self.notify_timeout_secs),
        }
    }

    pub fn gemini(&self) -> Option<GeminiConfig> {
        self.gemini_api_key.as_ref().map(|api_key| GeminiConfig {
            api_key: api_key.clone(),
            model: self.gemini_model.clone(),
        })
    }
}

/// The subset of configuration the pipeline itself consumes.
#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub profiles_dir: PathBuf,
    /// `None` disables report files.
    pub reports_dir: Option<PathBuf>,
    pub fetch_timeout: Duration,
    pub score_timeout: Duration,
    pub notify_timeout: Duration,
    pub max_notify_attempts: u32,
    pub operator_email: Option<String>,
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
