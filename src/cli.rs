use anyhow::Result;
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use std::path::PathBuf;
use std::time::Duration;

use crate::analysis::{analyze, Analysis, HistogramMode};
use crate::auth::Token;
use crate::config::{Config, MAX_WINDOW_WIDTH_DAYS};
use crate::error::BkLensError;
use crate::insights::PipelineInsights;
use crate::output::{default_report_directory, print_summary, write_report, PhaseProgress};
use crate::providers::buildkite::BuildkiteProvider;

#[derive(Parser)]
#[command(name = "bklens")]
#[command(author, version, about = "Buildkite build stability insights", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./bklens.{toml,json,yaml,yml} if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Report directory (defaults to {YYYY-MM-DD}_report)
    #[arg(short, long, global = true)]
    output_directory: Option<PathBuf>,

    /// Directory holding the build caches
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Pretty-print insights.json
    #[arg(short, long, global = true, default_value_t = false)]
    pretty: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync and analyze the build history of a Buildkite pipeline
    Bk(BuildkiteArgs),
}

#[derive(Args)]
struct BuildkiteArgs {
    /// Buildkite organization slug
    org: String,

    /// Pipeline slug
    pipeline: String,

    #[arg(short, long, env = "BUILDKITE_API_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// REST API base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Ignore builds that ran for less than this many seconds
    #[arg(long, value_name = "SECONDS")]
    ignore_builds_shorter_than: Option<u64>,

    /// Ignore builds that ran for more than this many seconds
    #[arg(long, value_name = "SECONDS")]
    ignore_builds_longer_than: Option<u64>,

    /// Ignore builds that finished before this date
    #[arg(long, value_name = "YYYY-MM-DD")]
    ignore_builds_before: Option<NaiveDate>,

    /// Only write report.md and insights.json
    #[arg(long, default_value_t = false)]
    multi_plot_only: bool,

    /// Also compute the rolling duration of these step keys
    #[arg(long, value_name = "KEY", num_args = 1..)]
    multi_plot_add_step_duration: Vec<String>,

    /// Width of the rolling window
    #[arg(
        short,
        long,
        value_name = "DAYS",
        value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_WINDOW_WIDTH_DAYS))
    )]
    window_width_days: Option<u32>,

    /// Which builds count towards the step histogram
    #[arg(long, value_enum)]
    histogram_mode: Option<HistogramMode>,

    /// Number of step keys shown in the summary
    #[arg(short = 'n', long)]
    top_n: Option<usize>,

    /// Use the cache as is when it was written less than this many minutes ago
    #[arg(long, value_name = "MINUTES")]
    skip_fetch_if_cache_newer_than: Option<u64>,

    /// Delete the pipeline's cache before syncing
    #[arg(long, default_value_t = false)]
    clear_cache: bool,
}

impl BuildkiteArgs {
    /// Command-line values take precedence over the config file.
    fn apply_to(&self, config: &mut Config) {
        if let Some(token) = &self.token {
            config.buildkite.token = Some(token.clone());
        }
        if let Some(base_url) = &self.base_url {
            config.buildkite.base_url.clone_from(base_url);
        }

        let analysis = &mut config.analysis;
        if self.ignore_builds_shorter_than.is_some() {
            analysis.ignore_builds_shorter_than = self.ignore_builds_shorter_than;
        }
        if self.ignore_builds_longer_than.is_some() {
            analysis.ignore_builds_longer_than = self.ignore_builds_longer_than;
        }
        if self.ignore_builds_before.is_some() {
            analysis.ignore_builds_before = self.ignore_builds_before;
        }
        if !self.multi_plot_add_step_duration.is_empty() {
            analysis
                .step_duration_keys
                .clone_from(&self.multi_plot_add_step_duration);
        }
        if let Some(days) = self.window_width_days {
            analysis.window_width_days = days;
        }
        if let Some(mode) = self.histogram_mode {
            analysis.histogram_mode = mode;
        }
        if let Some(top_n) = self.top_n {
            analysis.top_n = top_n;
        }

        if self.skip_fetch_if_cache_newer_than.is_some() {
            config.cache.skip_fetch_if_newer_than_minutes = self.skip_fetch_if_cache_newer_than;
        }
        if self.multi_plot_only {
            config.output.multi_plot_only = true;
        }
    }
}

impl Cli {
    fn apply_to(&self, config: &mut Config) {
        if let Some(dir) = &self.output_directory {
            config.output.directory = Some(dir.clone());
        }
        if let Some(dir) = &self.cache_dir {
            config.cache.dir = Some(dir.clone());
        }
        if self.pretty {
            config.output.pretty = true;
        }
    }

    async fn execute_buildkite(&self, args: &BuildkiteArgs, config: &Config) -> Result<()> {
        info!(
            "Collecting Buildkite insights for pipeline: {}/{}",
            args.org, args.pipeline
        );

        let token = config.buildkite.token.as_deref().map(Token::from);
        if token.is_none() {
            warn!("No Buildkite API token given, only public pipelines are readable");
        }

        let provider =
            BuildkiteProvider::new(config, args.org.clone(), args.pipeline.clone(), token)?;

        if args.clear_cache && provider.cache.clear()? {
            info!("Cleared cache: {}", provider.cache.path().display());
        }

        let filter = config.analysis.filter();
        let max_cache_age = config
            .cache
            .skip_fetch_if_newer_than_minutes
            .map(|minutes| Duration::from_secs(minutes.saturating_mul(60)));

        let progress = PhaseProgress::start_sync();
        let outcome = match provider.sync(&filter, max_cache_age).await {
            Ok(outcome) => outcome,
            Err(err) => {
                progress.fail();
                return Err(err.into());
            }
        };
        if let Some(saved) = outcome.saved {
            info!(
                "Cache holds {} builds ({} bytes)",
                saved.builds, saved.bytes
            );
        }

        let new_builds = outcome
            .fetch
            .map(|fetch| fetch.stats.inserted + fetch.stats.updated);
        let progress = progress.finish_sync_start_analysis(new_builds);

        let analysis = match analyze(&outcome.store, &config.analysis) {
            Ok(analysis) => analysis,
            Err(err @ BkLensError::Analysis(_)) => {
                warn!("{err}");
                Analysis::empty(&config.analysis)
            }
            Err(err) => {
                progress.fail();
                return Err(err.into());
            }
        };

        let progress = progress.finish_analysis_start_report();

        let insights = PipelineInsights {
            provider: "Buildkite".to_string(),
            organization: args.org.clone(),
            pipeline: args.pipeline.clone(),
            collected_at: Utc::now(),
            cached_builds: outcome.store.len(),
            fetch: outcome.fetch.map(Into::into),
            analysis,
        };

        let report_dir = config
            .output
            .directory
            .clone()
            .unwrap_or_else(|| default_report_directory(insights.collected_at.date_naive()));

        if let Err(err) = write_report(&insights, &report_dir, &config.output) {
            progress.fail();
            return Err(err);
        }
        progress.finish_report();

        print_summary(&insights, config.analysis.top_n);
        info!("Report written to: {}", report_dir.display());

        Ok(())
    }

    pub async fn execute(&self) -> Result<()> {
        let mut config = Config::load(self.config.as_deref())?;
        self.apply_to(&mut config);

        match &self.command {
            Commands::Bk(args) => {
                args.apply_to(&mut config);
                config.analysis.validate()?;
                self.execute_buildkite(args, &config).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bk_command() {
        let cli = Cli::try_parse_from([
            "bklens",
            "--cache-dir",
            "/tmp/cache",
            "bk",
            "acme",
            "web",
            "--ignore-builds-longer-than",
            "3600",
            "--ignore-builds-before",
            "2024-01-15",
            "--multi-plot-add-step-duration",
            "unit",
            "lint",
            "--histogram-mode",
            "all",
            "--window-width-days",
            "14",
            "--clear-cache",
        ])
        .unwrap();

        let Commands::Bk(args) = &cli.command;
        assert_eq!(args.org, "acme");
        assert_eq!(args.pipeline, "web");
        assert!(args.clear_cache);

        let mut config = Config::default();
        cli.apply_to(&mut config);
        args.apply_to(&mut config);

        assert_eq!(config.cache.dir, Some(PathBuf::from("/tmp/cache")));
        assert_eq!(config.analysis.ignore_builds_longer_than, Some(3600));
        assert_eq!(
            config.analysis.ignore_builds_before,
            NaiveDate::from_ymd_opt(2024, 1, 15)
        );
        assert_eq!(config.analysis.step_duration_keys, vec!["unit", "lint"]);
        assert_eq!(config.analysis.histogram_mode, HistogramMode::All);
        assert_eq!(config.analysis.window_width_days, 14);
        // Untouched values keep their defaults
        assert_eq!(config.analysis.top_n, 7);
        assert!(!config.output.multi_plot_only);
    }

    #[test]
    fn test_flags_override_config_file() {
        let mut config = Config::default();
        config.analysis.window_width_days = 30;
        config.analysis.top_n = 3;

        let cli = Cli::try_parse_from(["bklens", "bk", "acme", "web", "-w", "5"]).unwrap();
        let Commands::Bk(args) = &cli.command;
        args.apply_to(&mut config);

        assert_eq!(config.analysis.window_width_days, 5);
        assert_eq!(config.analysis.top_n, 3);
    }

    #[test]
    fn test_rejects_malformed_date() {
        let result = Cli::try_parse_from([
            "bklens",
            "bk",
            "acme",
            "web",
            "--ignore-builds-before",
            "15/01/2024",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_window_width_out_of_range() {
        for width in ["0", "36501", "100000000"] {
            let result = Cli::try_parse_from(["bklens", "bk", "acme", "web", "-w", width]);
            assert!(result.is_err(), "accepted --window-width-days {width}");
        }

        let cli = Cli::try_parse_from(["bklens", "bk", "acme", "web", "-w", "36500"]).unwrap();
        let Commands::Bk(args) = &cli.command;
        assert_eq!(args.window_width_days, Some(MAX_WINDOW_WIDTH_DAYS));
    }
}
