use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use waypoint_core::backoff::{ModelTiers, DEFAULT_MAX_ATTEMPTS};
use waypoint_core::context::BatchDelays;
use waypoint_core::gemini::DEFAULT_GEMINI_API_URL;
use waypoint_core::github::DEFAULT_GITHUB_API_URL;
use waypoint_core::matcher::DEFAULT_COMMIT_WINDOW;

#[derive(Clone)]
pub struct Config {
    pub gemini_api_key: String,
    /// Unauthenticated GitHub requests are made when unset.
    pub github_token: Option<String>,
    /// Owner used when a connect request names only the repository.
    pub github_default_owner: Option<String>,
    pub github_api_url: String,
    pub gemini_api_url: String,
    pub model_tiers: ModelTiers,
    pub generation_max_attempts: u32,
    pub commit_window: usize,
    pub batch_delays: BatchDelays,
    pub http_timeout: Duration,
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    pub state_dir: PathBuf,
    /// JSON file of projects loaded into storage at startup.
    pub projects_file: Option<PathBuf>,
    pub recording_enabled: bool,
    pub recording_log_path: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| non_empty(lookup(key));

        let gemini_api_key = var("GEMINI_API_KEY")
            .or_else(|| var("GOOGLE_AI_API_KEY"))
            .context("GEMINI_API_KEY (or GOOGLE_AI_API_KEY) environment variable is required")?;

        let model_tiers = match var("MODEL_TIERS") {
            Some(raw) => ModelTiers::parse_list(&raw)
                .context("MODEL_TIERS must name at least one model")?,
            None => ModelTiers::default(),
        };

        let generation_max_attempts = parse_or(
            var("GENERATION_MAX_ATTEMPTS"),
            DEFAULT_MAX_ATTEMPTS,
            "GENERATION_MAX_ATTEMPTS",
        )?;

        let commit_window = parse_or(var("COMMIT_WINDOW"), DEFAULT_COMMIT_WINDOW, "COMMIT_WINDOW")?;

        let defaults = BatchDelays::default();
        let batch_delays = BatchDelays {
            before_milestone: Duration::from_millis(parse_or(
                var("CONTEXT_MILESTONE_DELAY_MS"),
                defaults.before_milestone.as_millis() as u64,
                "CONTEXT_MILESTONE_DELAY_MS",
            )?),
            before_goal: Duration::from_millis(parse_or(
                var("CONTEXT_GOAL_DELAY_MS"),
                defaults.before_goal.as_millis() as u64,
                "CONTEXT_GOAL_DELAY_MS",
            )?),
        };

        let http_timeout = Duration::from_secs(parse_or(
            var("HTTP_TIMEOUT_SECS"),
            120u64,
            "HTTP_TIMEOUT_SECS",
        )?);

        let port = parse_or(var("PORT"), 3000u16, "PORT")?;

        let recording_enabled = var("RECORDING_ENABLED")
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(false);

        Ok(Config {
            gemini_api_key,
            github_token: var("GITHUB_ACCESS_TOKEN"),
            github_default_owner: var("GITHUB_DEFAULT_OWNER"),
            github_api_url: var("GITHUB_API_URL")
                .unwrap_or_else(|| DEFAULT_GITHUB_API_URL.to_string()),
            gemini_api_url: var("GEMINI_API_URL")
                .unwrap_or_else(|| DEFAULT_GEMINI_API_URL.to_string()),
            model_tiers,
            generation_max_attempts,
            commit_window,
            batch_delays,
            http_timeout,
            port,
            state_dir: var("STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            projects_file: var("PROJECTS_FILE").map(PathBuf::from),
            recording_enabled,
            recording_log_path: var("RECORDING_LOG_PATH")
                .unwrap_or_else(|| "recordings.jsonl".to_string()),
        })
    }
}

/// Treat missing, empty and whitespace-only values alike.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn parse_or<T>(value: Option<String>, default: T, key: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} must be a valid number", key)),
        None => Ok(default),
    }
}
