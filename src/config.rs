//! Configuration loader and validator for the batch orchestrator.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub batch: BatchSettings,
    pub dispatch: DispatchSettings,
    pub retry: RetrySettings,
    pub sweep: SweepSettings,
    pub generation: GenerationSettings,
    pub workers: Workers,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub bind_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchSettings {
    pub timeout_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Delay between two consecutive audio jobs.
    pub stagger_ms: u64,
    /// How long a unit may sit dispatched without an artifact before the
    /// sweep hands it to the audio worker again.
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
}

fn default_lease_seconds() -> u64 {
    1800
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepSettings {
    pub interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationSettings {
    pub enabled: bool,
    pub interval_seconds: u64,
    #[serde(default)]
    pub user_ids: Vec<String>,
}

/// Downstream worker endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workers {
    pub summarizer_url: String,
    pub audio_url: String,
    #[serde(default)]
    pub token: Option<String>,
    /// Public base URL of this service; workers post webhook events under it.
    pub callback_base_url: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}/briefcast.db",
                self.app.data_dir.trim_end_matches('/')
            )
        })
    }

    pub fn batch_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.batch.timeout_minutes as i64)
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.dispatch.stagger_ms)
    }

    pub fn dispatch_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dispatch.lease_seconds as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep.interval_seconds)
    }

    pub fn generation_interval(&self) -> Duration {
        Duration::from_secs(self.generation.interval_seconds)
    }

    pub fn summary_callback_url(&self) -> String {
        format!(
            "{}/webhooks/summary",
            self.workers.callback_base_url.trim_end_matches('/')
        )
    }

    pub fn audio_callback_url(&self) -> String {
        format!(
            "{}/webhooks/audio",
            self.workers.callback_base_url.trim_end_matches('/')
        )
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn is_http_url(s: &str) -> bool {
    let s = s.trim();
    s.starts_with("http://") || s.starts_with("https://")
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.bind_addr.parse::<std::net::SocketAddr>().is_err() {
        return Err(ConfigError::Invalid("app.bind_addr must be a socket address"));
    }

    if cfg.batch.timeout_minutes == 0 {
        return Err(ConfigError::Invalid("batch.timeout_minutes must be > 0"));
    }
    // dispatch.stagger_ms may be 0 (no throttling)
    if cfg.dispatch.lease_seconds == 0 {
        return Err(ConfigError::Invalid("dispatch.lease_seconds must be > 0"));
    }

    if cfg.retry.max_retries == 0 {
        return Err(ConfigError::Invalid("retry.max_retries must be > 0"));
    }
    if cfg.retry.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("retry.poll_interval_ms must be > 0"));
    }

    if cfg.sweep.interval_seconds == 0 {
        return Err(ConfigError::Invalid("sweep.interval_seconds must be > 0"));
    }

    let mut seen = std::collections::HashSet::new();
    for user in &cfg.generation.user_ids {
        let user = user.trim();
        if user.is_empty() {
            return Err(ConfigError::Invalid("generation.user_ids must not contain blank entries"));
        }
        if !seen.insert(user) {
            return Err(ConfigError::Invalid("generation.user_ids must not contain duplicates"));
        }
    }
    if cfg.generation.enabled {
        if cfg.generation.interval_seconds == 0 {
            return Err(ConfigError::Invalid("generation.interval_seconds must be > 0"));
        }
        if cfg.generation.user_ids.is_empty() {
            return Err(ConfigError::Invalid(
                "generation.user_ids must list at least one participant",
            ));
        }
    }

    if !is_http_url(&cfg.workers.summarizer_url) {
        return Err(ConfigError::Invalid("workers.summarizer_url must be an http(s) URL"));
    }
    if !is_http_url(&cfg.workers.audio_url) {
        return Err(ConfigError::Invalid("workers.audio_url must be an http(s) URL"));
    }
    if !is_http_url(&cfg.workers.callback_base_url) {
        return Err(ConfigError::Invalid(
            "workers.callback_base_url must be an http(s) URL",
        ));
    }

    Ok(())
}

/// Returns a complete example YAML document.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  bind_addr: "0.0.0.0:8080"

batch:
  timeout_minutes: 30

dispatch:
  stagger_ms: 1000
  lease_seconds: 1800

retry:
  max_retries: 3
  poll_interval_ms: 2000
  max_backoff_seconds: 300

sweep:
  interval_seconds: 300

generation:
  enabled: true
  interval_seconds: 86400
  user_ids:
    - "alice"
    - "bob"

workers:
  summarizer_url: "http://localhost:9001/summaries"
  audio_url: "http://localhost:9002/audio"
  token: "YOUR_WORKER_TOKEN"
  callback_base_url: "http://localhost:8080"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_cfg();
        validate(&cfg).unwrap();
        assert_eq!(cfg.batch_timeout(), chrono::Duration::minutes(30));
        assert_eq!(cfg.stagger(), Duration::from_secs(1));
        assert_eq!(cfg.audio_callback_url(), "http://localhost:8080/webhooks/audio");
    }

    #[test]
    fn invalid_bind_addr() {
        let mut cfg = example_cfg();
        cfg.app.bind_addr = "not-an-addr".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("app.bind_addr")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_timeouts_and_intervals() {
        let mut cfg = example_cfg();
        cfg.batch.timeout_minutes = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("timeout_minutes")),
            _ => panic!("wrong error"),
        }

        let mut cfg = example_cfg();
        cfg.sweep.interval_seconds = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.retry.max_retries = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.dispatch.stagger_ms = 0;
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn generation_requires_participants_only_when_enabled() {
        let mut cfg = example_cfg();
        cfg.generation.user_ids.clear();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("generation.user_ids")),
            _ => panic!("wrong error"),
        }

        cfg.generation.enabled = false;
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn blank_or_repeated_participants_are_rejected() {
        let mut cfg = example_cfg();
        cfg.generation.user_ids = vec!["alice".into(), " alice ".into()];
        match validate(&cfg).unwrap_err() {
            ConfigError::Invalid(msg) => assert!(msg.contains("duplicates")),
            _ => panic!("wrong error"),
        }

        cfg.generation.user_ids = vec!["alice".into(), "  ".into()];
        match validate(&cfg).unwrap_err() {
            ConfigError::Invalid(msg) => assert!(msg.contains("blank")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn lease_defaults_when_omitted() {
        let yaml = example().replace("  lease_seconds: 1800\n", "");
        let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg.dispatch.lease_seconds, 1800);
        assert_eq!(cfg.dispatch_lease(), chrono::Duration::minutes(30));

        let mut cfg = example_cfg();
        cfg.dispatch.lease_seconds = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_worker_urls() {
        let mut cfg = example_cfg();
        cfg.workers.audio_url = "ftp://nope".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("workers.audio_url")),
            _ => panic!("wrong error"),
        }

        let mut cfg = example_cfg();
        cfg.workers.callback_base_url = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = example_cfg();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.generation.user_ids, vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(cfg.retry.max_retries, 3);
    }
}
