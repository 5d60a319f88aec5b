//! Configuration loader and validator for the prerender cache service.
use crate::model::PageType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
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
    pub generator: Generator,
    pub scheduler: Scheduler,
    pub serve: Serve,
    pub catalog: Catalog,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Public origin used for canonical links, without trailing slash.
    pub base_url: String,
    pub site_name: String,
}

/// Batch generator limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Generator {
    pub default_batch_size: u32,
    pub max_batch_size: u32,
    /// A `running` claim without a heartbeat for this long may be taken over.
    pub stall_timeout_secs: u64,
}

/// Server-owned driver that walks page types to completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scheduler {
    pub enabled: bool,
    pub page_types: Vec<PageType>,
    pub batch_size: u32,
    pub inter_call_delay_ms: u64,
    pub idle_interval_secs: u64,
}

/// Crawler serving surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Serve {
    pub bind: String,
    /// Only callers flagged as crawlers get cached HTML (test mode bypasses).
    pub crawler_only: bool,
    /// Header set by the upstream crawler-detection layer.
    pub crawler_header: String,
}

/// Source catalog used by the bundled `PageSource`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Catalog {
    pub path: String,
}

impl App {
    /// Expand a leading `~/` in `data_dir`.
    pub fn resolved_data_dir(&self) -> PathBuf {
        if let Some(rest) = self.data_dir.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return Path::new(&home).join(rest);
            }
        }
        PathBuf::from(&self.data_dir)
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.resolved_data_dir().join("blobs")
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}/prerender.db",
                self.resolved_data_dir().display()
            )
        })
    }
}

impl Generator {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

impl Scheduler {
    pub fn inter_call_delay(&self) -> Duration {
        Duration::from_millis(self.inter_call_delay_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval_secs)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` and the blob root).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.blob_dir())
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

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if !(cfg.app.base_url.starts_with("http://") || cfg.app.base_url.starts_with("https://")) {
        return Err(ConfigError::Invalid("app.base_url must be an http(s) origin"));
    }
    if cfg.app.base_url.ends_with('/') {
        return Err(ConfigError::Invalid("app.base_url must not end with '/'"));
    }

    let g = &cfg.generator;
    if g.max_batch_size == 0 {
        return Err(ConfigError::Invalid("generator.max_batch_size must be > 0"));
    }
    if g.default_batch_size == 0 || g.default_batch_size > g.max_batch_size {
        return Err(ConfigError::Invalid(
            "generator.default_batch_size must be in 1..=generator.max_batch_size",
        ));
    }
    if g.stall_timeout_secs == 0 {
        return Err(ConfigError::Invalid("generator.stall_timeout_secs must be > 0"));
    }

    let s = &cfg.scheduler;
    if s.enabled && s.page_types.is_empty() {
        return Err(ConfigError::Invalid(
            "scheduler.page_types must be non-empty when the scheduler is enabled",
        ));
    }
    if s.batch_size == 0 || s.batch_size > g.max_batch_size {
        return Err(ConfigError::Invalid(
            "scheduler.batch_size must be in 1..=generator.max_batch_size",
        ));
    }
    if s.idle_interval_secs == 0 {
        return Err(ConfigError::Invalid("scheduler.idle_interval_secs must be > 0"));
    }

    if cfg.serve.bind.trim().is_empty() {
        return Err(ConfigError::Invalid("serve.bind must be non-empty"));
    }
    if cfg.serve.crawler_only && cfg.serve.crawler_header.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "serve.crawler_header must be set when serve.crawler_only is true",
        ));
    }

    if cfg.catalog.path.trim().is_empty() {
        return Err(ConfigError::Invalid("catalog.path must be non-empty"));
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  base_url: "https://www.example.com"
  site_name: "Example Directory"

generator:
  default_batch_size: 50
  max_batch_size: 500
  stall_timeout_secs: 300

scheduler:
  enabled: true
  page_types:
    - state
    - city
    - service
    - service_location
    - entity_detail
  batch_size: 50
  inter_call_delay_ms: 250
  idle_interval_secs: 600

serve:
  bind: "127.0.0.1:8080"
  crawler_only: true
  crawler_header: "x-crawler"

catalog:
  path: "./catalog.yaml"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.scheduler.page_types.len(), 5);
        assert_eq!(cfg.scheduler.page_types[3], PageType::ServiceLocation);
    }

    #[test]
    fn invalid_base_url() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.base_url = "www.example.com".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("app.base_url")), _ => panic!("wrong error") }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.base_url = "https://www.example.com/".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_batch_sizes() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.generator.default_batch_size = 0;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("default_batch_size")), _ => panic!("wrong error") }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.scheduler.batch_size = cfg.generator.max_batch_size + 1;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("scheduler.batch_size")), _ => panic!("wrong error") }
    }

    #[test]
    fn scheduler_needs_page_types_only_when_enabled() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.scheduler.page_types.clear();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        cfg.scheduler.enabled = false;
        validate(&cfg).unwrap();
    }

    #[test]
    fn unknown_page_type_is_a_parse_error() {
        let yaml = example().replace("- entity_detail", "- clinic");
        assert!(serde_yaml::from_str::<Config>(&yaml).is_err());
    }

    #[test]
    fn crawler_gate_requires_header() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.serve.crawler_header = " ".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
        cfg.serve.crawler_only = false;
        validate(&cfg).unwrap();
    }

    #[test]
    fn ensure_dirs_creates_blob_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.join("blobs").exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.serve.crawler_header, "x-crawler");
        assert_eq!(cfg.generator.stall_timeout(), Duration::from_secs(300));
    }
}
