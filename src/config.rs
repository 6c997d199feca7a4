//! Configuration for the enhancer, read from `.enhancer/enhancer.toml`.
//!
//! Settings are layered: file → environment (including a `.env` file) → CLI.
//! Every field has a default, so an empty or missing file is valid.
//!
//! # Configuration File Format
//!
//! ```toml
//! [queue]
//! path = ".enhancer/enhancements.json"
//!
//! [agent]
//! api_base = "https://api.openai.com/v1"
//! assistant_id = "asst_..."
//! poll_interval_ms = 2000
//! max_poll_interval_ms = 10000
//! poll_backoff = 1.5
//! run_timeout_secs = 120
//! request_timeout_secs = 60
//!
//! [repository]
//! remote_url = "https://github.com/owner/repo.git"
//! checkout_path = ".enhancer/checkout"
//! default_branch = "main"
//! branch_prefix = "feature/"
//! branch_max_len = 32
//! risky_paths = ["Dockerfile", "**/Dockerfile"]
//!
//! [github]
//! api_base = "https://api.github.com"
//! repo = "owner/repo"
//! request_timeout_secs = 30
//!
//! [server]
//! host = "127.0.0.1"
//! port = 5005
//!
//! [suggest]
//! model = "gpt-4o"
//! include = "**/*.rs"
//! max_files = 10
//!
//! [logging]
//! format = "pretty"
//! directory = ".enhancer/logs"
//! ```
//!
//! Secrets (`OPENAI_API_KEY`, `BOT_GH_TOKEN`, `ENHANCER_SECRET`) normally come
//! from the environment rather than the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::automation::agent::PollPolicy;
use crate::automation::github::{is_valid_github_token, parse_owner_repo_from_url};

/// Directory under the project root holding config, queue, and checkout.
pub const ENHANCER_DIR: &str = ".enhancer";
pub const CONFIG_FILE: &str = "enhancer.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSection {
    /// JSON file holding the ordered request list
    #[serde(default = "default_queue_path")]
    pub path: PathBuf,
}

fn default_queue_path() -> PathBuf {
    PathBuf::from(ENHANCER_DIR).join("enhancements.json")
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            path: default_queue_path(),
        }
    }
}

/// Remote code-generation agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_agent_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Assistant that executes runs
    #[serde(default)]
    pub assistant_id: Option<String>,
    /// First delay between run status polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound for the backed-off poll delay
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
    /// Multiplier applied to the delay after each poll
    #[serde(default = "default_poll_backoff")]
    pub poll_backoff: f64,
    /// Hard deadline for one run, from submission to terminal status
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    /// Per-request HTTP timeout for the agent and chat endpoints
    #[serde(default = "default_agent_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_agent_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_max_poll_interval_ms() -> u64 {
    10_000
}

fn default_poll_backoff() -> f64 {
    1.5
}

fn default_run_timeout_secs() -> u64 {
    120
}

fn default_agent_request_timeout_secs() -> u64 {
    60
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            api_base: default_agent_api_base(),
            api_key: None,
            assistant_id: None,
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            poll_backoff: default_poll_backoff(),
            run_timeout_secs: default_run_timeout_secs(),
            request_timeout_secs: default_agent_request_timeout_secs(),
        }
    }
}

/// Target repository and local checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositorySection {
    /// Clone URL (https or local path)
    #[serde(default)]
    pub remote_url: Option<String>,
    /// The single working copy used by every cycle
    #[serde(default = "default_checkout_path")]
    pub checkout_path: PathBuf,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Maximum length of the slug after the prefix
    #[serde(default = "default_branch_max_len")]
    pub branch_max_len: usize,
    /// Token used for https fetch/push and the pull request API
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
    /// Glob patterns; a change touching any of them opens a draft PR
    #[serde(default = "default_risky_paths")]
    pub risky_paths: Vec<String>,
}

fn default_checkout_path() -> PathBuf {
    PathBuf::from(ENHANCER_DIR).join("checkout")
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_branch_prefix() -> String {
    "feature/".to_string()
}

fn default_branch_max_len() -> usize {
    32
}

fn default_author_name() -> String {
    "enhancer-bot".to_string()
}

fn default_author_email() -> String {
    "enhancer-bot@users.noreply.github.com".to_string()
}

fn default_risky_paths() -> Vec<String> {
    vec![
        "Dockerfile".to_string(),
        "**/Dockerfile".to_string(),
        "prod_config.yml".to_string(),
        ".github/workflows/*".to_string(),
    ]
}

impl Default for RepositorySection {
    fn default() -> Self {
        Self {
            remote_url: None,
            checkout_path: default_checkout_path(),
            default_branch: default_branch(),
            branch_prefix: default_branch_prefix(),
            branch_max_len: default_branch_max_len(),
            token: None,
            author_name: default_author_name(),
            author_email: default_author_email(),
            risky_paths: default_risky_paths(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubSection {
    #[serde(default = "default_github_api_base")]
    pub api_base: String,
    /// `owner/repo`; derived from `repository.remote_url` when unset
    #[serde(default)]
    pub repo: Option<String>,
    /// Per-request HTTP timeout for pull request calls
    #[serde(default = "default_github_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_github_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_github_request_timeout_secs() -> u64 {
    30
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            api_base: default_github_api_base(),
            repo: None,
            request_timeout_secs: default_github_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret expected in the `x-enhancer-secret` header
    #[serde(default)]
    pub secret: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5005
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            secret: None,
        }
    }
}

/// Settings for model-suggested enhancements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestSection {
    #[serde(default = "default_suggest_model")]
    pub model: String,
    /// Glob, relative to the code directory, selecting files to show the model
    #[serde(default = "default_suggest_include")]
    pub include: String,
    #[serde(default = "default_suggest_max_files")]
    pub max_files: usize,
}

fn default_suggest_model() -> String {
    "gpt-4o".to_string()
}

fn default_suggest_include() -> String {
    "**/*.rs".to_string()
}

fn default_suggest_max_files() -> usize {
    10
}

impl Default for SuggestSection {
    fn default() -> Self {
        Self {
            model: default_suggest_model(),
            include: default_suggest_include(),
            max_files: default_suggest_max_files(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// When set, logs are also written to a daily rolling file here
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: default_log_level(),
            directory: None,
        }
    }
}

/// Root of `enhancer.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnhancerToml {
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub repository: RepositorySection,
    #[serde(default)]
    pub github: GitHubSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub suggest: SuggestSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl EnhancerToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse enhancer.toml")
    }

    /// Load from `path`, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize enhancer.toml")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("ENHANCER_QUEUE_PATH") {
            self.queue.path = PathBuf::from(v);
        }
        if let Some(v) = non_empty("OPENAI_API_KEY") {
            self.agent.api_key = Some(v);
        }
        if let Some(v) = non_empty("ENHANCER_ASSISTANT_ID") {
            self.agent.assistant_id = Some(v);
        }
        if let Some(v) = non_empty("BOT_GH_TOKEN") {
            self.repository.token = Some(v);
        }
        if let Some(v) = non_empty("ENHANCER_REMOTE_URL") {
            self.repository.remote_url = Some(v);
        }
        if let Some(v) = non_empty("BOT_GH_REPO") {
            if self.repository.remote_url.is_none() {
                self.repository.remote_url = Some(format!("https://github.com/{}.git", v));
            }
            self.github.repo = Some(v);
        }
        if let Some(v) = non_empty("ENHANCER_SECRET") {
            self.server.secret = Some(v);
        }
        if let Some(v) = non_empty("LOG_FORMAT") {
            self.logging.format = v;
        }
    }

    /// Check for problems that would make a cycle fail. Returns warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.agent.api_key.is_none() {
            warnings.push("agent.api_key is not set (export OPENAI_API_KEY)".to_string());
        }
        if self.agent.assistant_id.is_none() {
            warnings.push(
                "agent.assistant_id is not set (export ENHANCER_ASSISTANT_ID)".to_string(),
            );
        }
        if self.agent.poll_backoff < 1.0 {
            warnings.push(format!(
                "agent.poll_backoff {} is below 1.0; poll delays would shrink",
                self.agent.poll_backoff
            ));
        }
        if self.agent.run_timeout_secs == 0 {
            warnings.push("agent.run_timeout_secs is 0; every run would time out".to_string());
        }

        match &self.repository.remote_url {
            None => warnings.push(
                "repository.remote_url is not set (export ENHANCER_REMOTE_URL or BOT_GH_REPO)"
                    .to_string(),
            ),
            Some(url) if url.starts_with("https://github.com/") => {
                match &self.repository.token {
                    None => warnings.push(
                        "repository.token is not set; pushes to GitHub will fail (export BOT_GH_TOKEN)"
                            .to_string(),
                    ),
                    Some(token) if !is_valid_github_token(token) => warnings.push(
                        "repository.token does not look like a GitHub token".to_string(),
                    ),
                    Some(_) => {}
                }
            }
            Some(_) => {}
        }
        if self.repository.branch_max_len == 0 {
            warnings.push("repository.branch_max_len must be greater than 0".to_string());
        }
        for pattern in &self.repository.risky_paths {
            if glob::Pattern::new(pattern).is_err() {
                warnings.push(format!("repository.risky_paths: invalid pattern '{}'", pattern));
            }
        }
        if self.server.secret.is_none() {
            warnings.push(
                "server.secret is not set; the HTTP API accepts unauthenticated requests"
                    .to_string(),
            );
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            warnings.push(format!(
                "logging.format '{}' is unknown; expected 'pretty' or 'json'",
                self.logging.format
            ));
        }

        warnings
    }
}

/// Resolved runtime configuration: the parsed file plus the project root that
/// relative paths are anchored to.
#[derive(Debug, Clone)]
pub struct EnhancerConfig {
    pub project_dir: PathBuf,
    pub config_path: PathBuf,
    pub toml: EnhancerToml,
}

impl EnhancerConfig {
    /// Load `.env`, the config file (default `.enhancer/enhancer.toml`), then
    /// environment overrides.
    pub fn load(project_dir: PathBuf, config_path: Option<PathBuf>) -> Result<Self> {
        let env_path = project_dir.join(".env");
        match dotenvy::from_path(&env_path) {
            Ok(()) => {}
            Err(e) if e.not_found() => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to load {}", env_path.display()));
            }
        }

        let config_path =
            config_path.unwrap_or_else(|| project_dir.join(ENHANCER_DIR).join(CONFIG_FILE));
        let mut toml = EnhancerToml::load_or_default(&config_path)?;
        toml.apply_env(|key| std::env::var(key).ok());

        Ok(Self {
            project_dir,
            config_path,
            toml,
        })
    }

    /// Build a config directly from parsed settings (tests, embedding).
    pub fn from_toml(project_dir: PathBuf, toml: EnhancerToml) -> Self {
        let config_path = project_dir.join(ENHANCER_DIR).join(CONFIG_FILE);
        Self {
            project_dir,
            config_path,
            toml,
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn queue_path(&self) -> PathBuf {
        self.resolve(&self.toml.queue.path)
    }

    pub fn checkout_path(&self) -> PathBuf {
        self.resolve(&self.toml.repository.checkout_path)
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.toml.logging.directory.as_deref().map(|d| self.resolve(d))
    }

    /// `owner/repo` for the pull request API (explicit setting, else parsed
    /// from the remote URL).
    pub fn github_repo(&self) -> Option<String> {
        self.toml.github.repo.clone().or_else(|| {
            self.toml
                .repository
                .remote_url
                .as_deref()
                .and_then(parse_owner_repo_from_url)
        })
    }

    pub fn poll_policy(&self) -> PollPolicy {
        let agent = &self.toml.agent;
        PollPolicy {
            initial_interval: Duration::from_millis(agent.poll_interval_ms),
            max_interval: Duration::from_millis(agent.max_poll_interval_ms),
            backoff: agent.poll_backoff,
            timeout: Duration::from_secs(agent.run_timeout_secs),
        }
    }

    pub fn agent_request_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.agent.request_timeout_secs.max(1))
    }

    pub fn github_request_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.github.request_timeout_secs.max(1))
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let toml = EnhancerToml::parse("").unwrap();
        assert_eq!(toml.queue.path, PathBuf::from(".enhancer/enhancements.json"));
        assert_eq!(toml.agent.poll_interval_ms, 2000);
        assert_eq!(toml.agent.run_timeout_secs, 120);
        assert_eq!(toml.repository.default_branch, "main");
        assert_eq!(toml.repository.branch_prefix, "feature/");
        assert_eq!(toml.repository.branch_max_len, 32);
        assert_eq!(toml.server.port, 5005);
        assert_eq!(toml.suggest.max_files, 10);
        assert_eq!(toml.logging.format, "pretty");
    }

    #[test]
    fn test_parse_sections() {
        let content = r#"
[agent]
assistant_id = "asst_123"
run_timeout_secs = 30

[repository]
remote_url = "https://github.com/acme/widgets.git"
default_branch = "develop"
risky_paths = ["deploy/**"]

[server]
port = 8080
"#;
        let toml = EnhancerToml::parse(content).unwrap();
        assert_eq!(toml.agent.assistant_id.as_deref(), Some("asst_123"));
        assert_eq!(toml.agent.run_timeout_secs, 30);
        assert_eq!(toml.agent.poll_interval_ms, 2000);
        assert_eq!(toml.repository.default_branch, "develop");
        assert_eq!(toml.repository.risky_paths, vec!["deploy/**".to_string()]);
        assert_eq!(toml.server.port, 8080);
    }

    #[test]
    fn test_parse_invalid_toml_fails() {
        assert!(EnhancerToml::parse("[agent\nbroken").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut toml = EnhancerToml::parse("[agent]\napi_key = \"from-file\"").unwrap();
        toml.apply_env(env(&[
            ("OPENAI_API_KEY", "from-env"),
            ("BOT_GH_TOKEN", "ghp_abc"),
            ("ENHANCER_SECRET", "s3cret"),
        ]));
        assert_eq!(toml.agent.api_key.as_deref(), Some("from-env"));
        assert_eq!(toml.repository.token.as_deref(), Some("ghp_abc"));
        assert_eq!(toml.server.secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_env_empty_values_are_ignored() {
        let mut toml = EnhancerToml::parse("[agent]\napi_key = \"from-file\"").unwrap();
        toml.apply_env(env(&[("OPENAI_API_KEY", "  ")]));
        assert_eq!(toml.agent.api_key.as_deref(), Some("from-file"));
    }

    #[test]
    fn test_bot_gh_repo_derives_remote_url() {
        let mut toml = EnhancerToml::default();
        toml.apply_env(env(&[("BOT_GH_REPO", "acme/widgets")]));
        assert_eq!(
            toml.repository.remote_url.as_deref(),
            Some("https://github.com/acme/widgets.git")
        );
        assert_eq!(toml.github.repo.as_deref(), Some("acme/widgets"));
    }

    #[test]
    fn test_github_repo_derived_from_remote() {
        let mut toml = EnhancerToml::default();
        toml.repository.remote_url = Some("https://github.com/acme/widgets.git".into());
        let config = EnhancerConfig::from_toml(PathBuf::from("/srv/app"), toml);
        assert_eq!(config.github_repo().as_deref(), Some("acme/widgets"));
    }

    #[test]
    fn test_relative_paths_resolve_against_project_dir() {
        let config = EnhancerConfig::from_toml(PathBuf::from("/srv/app"), EnhancerToml::default());
        assert_eq!(
            config.queue_path(),
            PathBuf::from("/srv/app/.enhancer/enhancements.json")
        );
        assert_eq!(
            config.checkout_path(),
            PathBuf::from("/srv/app/.enhancer/checkout")
        );
        assert!(config.log_dir().is_none());
    }

    #[test]
    fn test_poll_policy_from_agent_section() {
        let config = EnhancerConfig::from_toml(PathBuf::from("/"), EnhancerToml::default());
        let policy = config.poll_policy();
        assert_eq!(policy.initial_interval, Duration::from_secs(2));
        assert_eq!(policy.timeout, Duration::from_secs(120));
        assert!(policy.backoff >= 1.0);
    }

    #[test]
    fn test_validate_flags_missing_settings() {
        let warnings = EnhancerToml::default().validate();
        assert!(warnings.iter().any(|w| w.contains("api_key")));
        assert!(warnings.iter().any(|w| w.contains("assistant_id")));
        assert!(warnings.iter().any(|w| w.contains("remote_url")));
        assert!(warnings.iter().any(|w| w.contains("server.secret")));
    }

    #[test]
    fn test_validate_flags_bad_token_and_pattern() {
        let mut toml = EnhancerToml::default();
        toml.repository.remote_url = Some("https://github.com/acme/widgets.git".into());
        toml.repository.token = Some("not-a-token".into());
        toml.repository.risky_paths = vec!["[".into()];
        let warnings = toml.validate();
        assert!(warnings.iter().any(|w| w.contains("does not look like")));
        assert!(warnings.iter().any(|w| w.contains("invalid pattern")));
    }

    #[test]
    fn test_load_without_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = EnhancerConfig::load(dir.path().to_path_buf(), None).unwrap();
        assert_eq!(config.toml.server.port, 5005);
    }

    #[test]
    fn test_load_rejects_malformed_env_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "ENHANCER_BROKEN='unterminated\n").unwrap();
        let err = EnhancerConfig::load(dir.path().to_path_buf(), None).unwrap_err();
        assert!(format!("{:#}", err).contains(".env"), "got: {:#}", err);
    }

    #[test]
    fn test_request_timeouts_have_defaults() {
        let config = EnhancerConfig::from_toml(PathBuf::from("/"), EnhancerToml::default());
        assert_eq!(config.agent_request_timeout(), Duration::from_secs(60));
        assert_eq!(config.github_request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".enhancer").join("enhancer.toml");
        let mut toml = EnhancerToml::default();
        toml.server.port = 9999;
        toml.save(&path).unwrap();
        let loaded = EnhancerToml::load_or_default(&path).unwrap();
        assert_eq!(loaded.server.port, 9999);
    }
}
