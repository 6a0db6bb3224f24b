use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::analysis::{BuildFilter, HistogramMode};

/// Widest rolling window accepted, about a century
pub const MAX_WINDOW_WIDTH_DAYS: u32 = 36_500;

/// Configuration file structure for bklens.
///
/// Every value has a default, so a config file only needs the keys it wants to
/// change. Command-line flags are applied on top of the loaded file and the
/// resolved value is handed to each component; nothing reads configuration
/// from global state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub buildkite: BuildkiteConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BuildkiteConfig {
    /// Buildkite API access token (usually taken from `BUILDKITE_API_TOKEN`)
    pub token: Option<String>,

    /// REST API base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Builds requested per page
    #[serde(default = "default_per_page")]
    pub per_page: usize,

    /// Timeout applied to every single HTTP request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Retry policy for transient API failures (network errors, 429, 5xx).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-indexed), capped at `max_delay_ms`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(retry);
        let delay = self.initial_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    /// Directory holding `{org}_{pipeline}.cache` files
    pub dir: Option<PathBuf>,

    /// Skip the remote fetch when the cache file is younger than this
    pub skip_fetch_if_newer_than_minutes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AnalysisConfig {
    /// Width of the trailing window for rolling statistics
    #[serde(default = "default_window_width_days")]
    pub window_width_days: u32,

    /// Which builds contribute to the step histogram
    #[serde(default)]
    pub histogram_mode: HistogramMode,

    /// Number of step keys shown in the top-N table
    #[serde(default = "default_top_n")]
    pub top_n: usize,

    /// Ignore builds shorter than this many seconds
    pub ignore_builds_shorter_than: Option<u64>,

    /// Ignore builds longer than this many seconds
    pub ignore_builds_longer_than: Option<u64>,

    /// Ignore builds that finished before this date
    pub ignore_builds_before: Option<NaiveDate>,

    /// Step keys that get their own rolling duration series
    #[serde(default)]
    pub step_duration_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputConfig {
    /// Report directory; defaults to `{YYYY-MM-DD}_report`
    pub directory: Option<PathBuf>,

    /// Only write the combined report, no per-series files
    #[serde(default)]
    pub multi_plot_only: bool,

    /// Pretty-print `insights.json`
    #[serde(default)]
    pub pretty: bool,
}

impl Default for BuildkiteConfig {
    fn default() -> Self {
        Self {
            token: None,
            base_url: default_base_url(),
            per_page: default_per_page(),
            request_timeout_secs: default_request_timeout_secs(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            window_width_days: default_window_width_days(),
            histogram_mode: HistogramMode::default(),
            top_n: default_top_n(),
            ignore_builds_shorter_than: None,
            ignore_builds_longer_than: None,
            ignore_builds_before: None,
            step_duration_keys: Vec::new(),
        }
    }
}

impl AnalysisConfig {
    /// Rejects window widths outside `1..=MAX_WINDOW_WIDTH_DAYS`.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (1..=MAX_WINDOW_WIDTH_DAYS).contains(&self.window_width_days),
            "window-width-days must be between 1 and {MAX_WINDOW_WIDTH_DAYS}, got {}",
            self.window_width_days
        );
        Ok(())
    }

    pub fn filter(&self) -> BuildFilter {
        BuildFilter {
            shorter_than: self.ignore_builds_shorter_than.map(Duration::from_secs),
            longer_than: self.ignore_builds_longer_than.map(Duration::from_secs),
            before: self.ignore_builds_before,
        }
    }
}

fn default_base_url() -> String {
    "https://api.buildkite.com/v2".to_string()
}

fn default_per_page() -> usize {
    100
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_window_width_days() -> u32 {
    10
}

fn default_top_n() -> usize {
    7
}

impl Config {
    /// Load configuration from a file.
    ///
    /// Searches for configuration files in this order:
    /// 1. Specified path (must exist)
    /// 2. ./bklens.toml
    /// 3. ./bklens.json
    /// 4. ./bklens.yaml
    /// 5. ./bklens.yml
    ///
    /// Returns default configuration if no file is found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_path(path);
        }

        let candidates = ["bklens.toml", "bklens.json", "bklens.yaml", "bklens.yml"];

        for candidate in &candidates {
            let path = Path::new(candidate);
            if path.exists() {
                return Self::load_from_path(path);
            }
        }

        Ok(Self::default())
    }

    fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");

        let config: Self = match extension {
            "toml" => toml::from_str(&contents)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display())),
            "json" => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display())),
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display())),
            _ => toml::from_str(&contents)
                .or_else(|_| serde_json::from_str(&contents))
                .or_else(|_| serde_yaml::from_str(&contents))
                .with_context(|| format!("Failed to parse config file: {}", path.display())),
        }?;

        config
            .analysis
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }
}
