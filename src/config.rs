//! Configuration loading and management.
//!
//! Loads pipeline configuration from `./config.toml` (or
//! `$SHOEBOX_CONFIG_PATH`). Environment variables override file values;
//! file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ── Top-level config ────────────────────────────────────────────

/// Top-level pipeline configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Owner of every row this process writes (multi-tenancy passthrough).
    pub user_id: UserConfig,
    /// Orchestrator loop, concurrency caps, and retry budget.
    pub orchestrator: OrchestratorConfig,
    /// Prompt scoring and evolution knobs.
    pub scoring: ScoringConfig,
    /// Filesystem locations for the inbox, artifacts, DB, and logs.
    pub paths: PathsConfig,
    /// LLM adapter configuration.
    pub llm: LlmConfig,
}

/// Wrapper so `user_id` reads naturally at the TOML top level.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct UserConfig(pub String);

impl Default for UserConfig {
    fn default() -> Self {
        Self("local".to_owned())
    }
}

impl PipelineConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$SHOEBOX_CONFIG_PATH` or `./config.toml`.
    /// A missing file is not an error; defaults are used.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from TOML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: PipelineConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(PipelineConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config file path using a custom env resolver (for testing).
    fn config_path(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("SHOEBOX_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability.
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("SHOEBOX_USER_ID") {
            self.user_id = UserConfig(v);
        }

        // Orchestrator knobs.
        override_num(
            &env,
            "SHOEBOX_TEXTRACT_WORKERS",
            &mut self.orchestrator.textract_workers,
        );
        override_num(
            &env,
            "SHOEBOX_BEDROCK_WORKERS",
            &mut self.orchestrator.bedrock_workers,
        );
        override_num(
            &env,
            "SHOEBOX_FILE_GENERATION_WORKERS",
            &mut self.orchestrator.file_generation_workers,
        );
        override_num(
            &env,
            "SHOEBOX_MAX_DOCUMENT_FLOWS",
            &mut self.orchestrator.max_document_flows,
        );
        override_num(
            &env,
            "SHOEBOX_MAX_FILE_FLOWS",
            &mut self.orchestrator.max_file_flows,
        );
        override_num(
            &env,
            "SHOEBOX_POLL_INTERVAL_SECS",
            &mut self.orchestrator.poll_interval_seconds,
        );
        override_num(
            &env,
            "SHOEBOX_RECOVERY_INTERVAL_SECS",
            &mut self.orchestrator.recovery_interval_seconds,
        );
        override_num(
            &env,
            "SHOEBOX_STALE_TIMEOUT_SECS",
            &mut self.orchestrator.stale_timeout_seconds,
        );
        override_num(&env, "SHOEBOX_MAX_RETRIES", &mut self.orchestrator.max_retries);
        override_num(
            &env,
            "SHOEBOX_LOCK_WAIT_TIMEOUT_SECS",
            &mut self.orchestrator.lock_wait_timeout_seconds,
        );
        override_num(
            &env,
            "SHOEBOX_OCR_TIMEOUT_SECS",
            &mut self.orchestrator.ocr_timeout_seconds,
        );
        override_num(
            &env,
            "SHOEBOX_LLM_TIMEOUT_SECS",
            &mut self.orchestrator.llm_timeout_seconds,
        );

        // Scoring knobs.
        override_num(
            &env,
            "SHOEBOX_PROMPT_UPDATE_THRESHOLD",
            &mut self.scoring.prompt_update_threshold,
        );
        override_num(
            &env,
            "SHOEBOX_MIN_DOCUMENTS_FOR_SCORING",
            &mut self.scoring.min_documents_for_scoring,
        );
        override_num(
            &env,
            "SHOEBOX_SCORE_CEILING_DEFAULT",
            &mut self.scoring.score_ceiling_default,
        );

        // Paths.
        if let Some(v) = env("SHOEBOX_DATA_DIR") {
            self.paths.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env("SHOEBOX_INBOX_DIR") {
            self.paths.inbox_dir = Some(PathBuf::from(v));
        }

        // LLM adapter.
        if let Some(v) = env("SHOEBOX_ANTHROPIC_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = env("SHOEBOX_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = env("SHOEBOX_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
    }

    /// Parse a TOML string into config (for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: PipelineConfig =
            toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }
}

/// Apply an env override to a parseable field, warning on garbage.
fn override_num<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    field: &mut T,
) {
    if let Some(v) = env(key) {
        match v.parse() {
            Ok(n) => *field = n,
            Err(_) => {
                tracing::warn!(var = key, value = %v, "ignoring invalid env override");
            }
        }
    }
}

// ── Orchestrator config ─────────────────────────────────────────

/// Orchestrator loop, concurrency caps, timeouts, and retry budget.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Concurrent OCR adapter calls.
    pub textract_workers: usize,
    /// Concurrent LLM adapter calls.
    pub bedrock_workers: usize,
    /// Concurrent file-summary steps.
    pub file_generation_workers: usize,
    /// Documents in flight at once.
    pub max_document_flows: usize,
    /// File generations in flight at once.
    pub max_file_flows: usize,
    /// Delay between orchestrator ticks.
    pub poll_interval_seconds: u64,
    /// Period between stale-work recovery sweeps.
    pub recovery_interval_seconds: u64,
    /// In-flight age past which recovery acts.
    pub stale_timeout_seconds: u64,
    /// Per-document/file retry budget.
    pub max_retries: i64,
    /// Advisory lock acquisition timeout.
    pub lock_wait_timeout_seconds: u64,
    /// Per-call OCR adapter timeout.
    pub ocr_timeout_seconds: u64,
    /// Per-call LLM adapter timeout.
    pub llm_timeout_seconds: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            textract_workers: 3,
            bedrock_workers: 5,
            file_generation_workers: 2,
            max_document_flows: 5,
            max_file_flows: 2,
            poll_interval_seconds: 5,
            recovery_interval_seconds: 300,
            stale_timeout_seconds: 1800,
            max_retries: 3,
            lock_wait_timeout_seconds: 30,
            ocr_timeout_seconds: 60,
            llm_timeout_seconds: 120,
        }
    }
}

impl OrchestratorConfig {
    /// Tick delay as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    /// Recovery sweep period as a [`Duration`].
    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_seconds)
    }

    /// Advisory lock wait budget as a [`Duration`].
    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_wait_timeout_seconds)
    }

    /// OCR call timeout as a [`Duration`].
    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.ocr_timeout_seconds)
    }

    /// LLM call timeout as a [`Duration`].
    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_seconds)
    }
}

// ── Scoring config ──────────────────────────────────────────────

/// Prompt scoring and evolution knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Score improvement required before a prompt may evolve.
    ///
    /// Set very large (e.g. 10.0) to disable evolution in tests.
    pub prompt_update_threshold: f64,
    /// Minimum scored documents before a prompt may evolve.
    pub min_documents_for_scoring: i64,
    /// Default ceiling applied to newly created evolving prompts.
    pub score_ceiling_default: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            prompt_update_threshold: 0.05,
            min_documents_for_scoring: 5,
            score_ceiling_default: 0.95,
        }
    }
}

// ── Paths config ────────────────────────────────────────────────

/// Filesystem locations for the inbox, artifacts, DB, and logs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root directory for DB, artifacts, and logs.
    pub data_dir: PathBuf,
    /// Inbox directory; defaults to `{data_dir}/inbox` when unset.
    pub inbox_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let data_dir = directories::ProjectDirs::from("", "", "shoebox")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("./shoebox-data"));
        Self {
            data_dir,
            inbox_dir: None,
        }
    }
}

impl PathsConfig {
    /// SQLite database file path.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("shoebox.db")
    }

    /// Inbox directory the scanner sweeps.
    pub fn inbox_dir(&self) -> PathBuf {
        self.inbox_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("inbox"))
    }

    /// Directory for per-document artifacts (`{id}.txt`, `{id}_llm.json`).
    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }

    /// Directory for rotated JSON log files.
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

// ── LLM config ──────────────────────────────────────────────────

/// LLM adapter configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// API key; when unset the processor refuses to start.
    pub api_key: Option<String>,
    /// Model identifier passed to the adapter.
    pub model: String,
    /// API base URL (overridable for proxies and tests).
    pub base_url: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "claude-sonnet-4-20250514".to_owned(),
            base_url: "https://api.anthropic.com".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_caps() {
        let config = PipelineConfig::default();
        assert_eq!(config.orchestrator.textract_workers, 3);
        assert_eq!(config.orchestrator.bedrock_workers, 5);
        assert_eq!(config.orchestrator.file_generation_workers, 2);
        assert_eq!(config.orchestrator.max_document_flows, 5);
        assert_eq!(config.orchestrator.max_file_flows, 2);
        assert_eq!(config.orchestrator.max_retries, 3);
        assert_eq!(config.orchestrator.stale_timeout_seconds, 1800);
        assert_eq!(config.scoring.score_ceiling_default, 0.95);
        assert_eq!(config.user_id.0, "local");
    }

    #[test]
    fn toml_sections_parse() {
        let config = PipelineConfig::from_toml(
            r#"
            user_id = "igor"

            [orchestrator]
            textract_workers = 1
            poll_interval_seconds = 2

            [scoring]
            prompt_update_threshold = 10.0

            [paths]
            data_dir = "/tmp/shoebox-test"

            [llm]
            model = "claude-haiku"
            "#,
        )
        .expect("toml should parse");

        assert_eq!(config.user_id.0, "igor");
        assert_eq!(config.orchestrator.textract_workers, 1);
        assert_eq!(config.orchestrator.poll_interval_seconds, 2);
        // Unset keys keep defaults.
        assert_eq!(config.orchestrator.bedrock_workers, 5);
        assert_eq!(config.scoring.prompt_update_threshold, 10.0);
        assert_eq!(config.llm.model, "claude-haiku");
        assert_eq!(
            config.paths.db_path(),
            PathBuf::from("/tmp/shoebox-test/shoebox.db")
        );
    }

    #[test]
    fn env_overrides_beat_file_values() {
        let mut config = PipelineConfig::from_toml(
            r#"
            [orchestrator]
            bedrock_workers = 9
            "#,
        )
        .expect("toml should parse");

        config.apply_overrides(|key| match key {
            "SHOEBOX_BEDROCK_WORKERS" => Some("2".to_owned()),
            "SHOEBOX_ANTHROPIC_API_KEY" => Some("sk-test".to_owned()),
            _ => None,
        });

        assert_eq!(config.orchestrator.bedrock_workers, 2);
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn invalid_env_override_is_ignored() {
        let mut config = PipelineConfig::default();
        config.apply_overrides(|key| match key {
            "SHOEBOX_MAX_RETRIES" => Some("lots".to_owned()),
            _ => None,
        });
        assert_eq!(config.orchestrator.max_retries, 3);
    }

    #[test]
    fn inbox_dir_defaults_under_data_dir() {
        let config = PipelineConfig::from_toml(
            r#"
            [paths]
            data_dir = "/var/lib/shoebox"
            "#,
        )
        .expect("toml should parse");
        assert_eq!(
            config.paths.inbox_dir(),
            PathBuf::from("/var/lib/shoebox/inbox")
        );
    }

    #[test]
    fn config_path_resolution() {
        let path = PipelineConfig::config_path(|key| match key {
            "SHOEBOX_CONFIG_PATH" => Some("/etc/shoebox.toml".to_owned()),
            _ => None,
        });
        assert_eq!(path, PathBuf::from("/etc/shoebox.toml"));

        let fallback = PipelineConfig::config_path(|_| None);
        assert_eq!(fallback, PathBuf::from("config.toml"));
    }
}
