mod duration;
mod filter;
mod histogram;
mod rate;
mod stability;

pub use duration::{
    build_duration_samples, rolling_duration, step_duration_samples, DurationPoint,
    StepDurationSeries,
};
pub use filter::BuildFilter;
pub use histogram::{step_histogram, HistogramMode, StepCount};
pub use rate::{rolling_event_rate, RatePoint};
pub use stability::{StabilityPoint, StabilitySeries};

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::AnalysisConfig;
use crate::error::{BkLensError, Result};
use crate::providers::buildkite::{Build, BuildStore};

/// Everything computed from one snapshot of the build store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub window_width_days: u32,
    pub histogram_mode: HistogramMode,
    /// Finished builds that survived the filter
    pub analyzed_builds: usize,
    pub passed_builds: usize,
    pub overall_pass_rate: Option<f64>,
    pub stability: Vec<StabilityPoint>,
    pub build_rate: Vec<RatePoint>,
    pub duration: Vec<DurationPoint>,
    pub step_histogram: Vec<StepCount>,
    pub step_durations: Vec<StepDurationSeries>,
}

impl Analysis {
    /// Result reported when there is nothing to analyze.
    pub fn empty(config: &AnalysisConfig) -> Self {
        Self {
            window_width_days: config.window_width_days,
            histogram_mode: config.histogram_mode,
            analyzed_builds: 0,
            passed_builds: 0,
            overall_pass_rate: None,
            stability: Vec::new(),
            build_rate: Vec::new(),
            duration: Vec::new(),
            step_histogram: Vec::new(),
            step_durations: Vec::new(),
        }
    }
}

/// Start of the trailing window of `width` that ends at `at`.
///
/// Clamped to the earliest representable instant, so arbitrarily wide
/// windows simply cover the whole history.
fn window_start(at: DateTime<Utc>, width: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(width)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Computes stability, build rate, durations and the step histogram.
///
/// The filter is applied once up front, so every output is derived from the
/// same set of finished builds.
///
/// # Errors
///
/// Returns `Analysis` if no finished build survives the filter. Callers
/// treat that as an empty report, not as a failure of the run.
pub fn analyze(store: &BuildStore, config: &AnalysisConfig) -> Result<Analysis> {
    let filter = config.filter();
    let mut builds: Vec<&Build> = filter.apply(store.finished());
    builds.sort_by_key(|b| (b.created_at, b.number));

    if builds.is_empty() {
        return Err(BkLensError::Analysis(format!(
            "no finished builds left to analyze ({} cached)",
            store.len()
        )));
    }

    info!(
        "Analyzing {} finished builds, window width: {} days",
        builds.len(),
        config.window_width_days
    );

    let series = StabilitySeries::new(&builds, config.window_width_days);
    let overall = series.overall();
    if let Some(latest) = builds.last() {
        info!(
            "Pass rate of the latest {}-day window: {}",
            config.window_width_days,
            series
                .rate_at(latest.created_at)
                .map_or_else(|| "n/a".to_string(), |rate| format!("{:.1}%", rate * 100.0))
        );
    }

    let build_rate = rolling_event_rate(
        &builds.iter().map(|b| b.created_at).collect::<Vec<_>>(),
        config.window_width_days,
    );
    if build_rate.is_empty() {
        warn!(
            "Build history spans less than {} days, no build rate computed",
            config.window_width_days
        );
    }

    let duration = rolling_duration(&build_duration_samples(&builds), config.window_width_days);

    let step_durations = config
        .step_duration_keys
        .iter()
        .map(|key| {
            let samples = step_duration_samples(&builds, key);
            if samples.is_empty() {
                warn!("No passed executions found for step key: {key}");
            }
            StepDurationSeries {
                key: key.clone(),
                points: rolling_duration(&samples, config.window_width_days),
            }
        })
        .collect();

    Ok(Analysis {
        window_width_days: config.window_width_days,
        histogram_mode: config.histogram_mode,
        analyzed_builds: builds.len(),
        passed_builds: overall.passed,
        overall_pass_rate: overall.rate(),
        stability: series.points(),
        build_rate,
        duration,
        step_histogram: step_histogram(builds.iter().copied(), config.histogram_mode),
        step_durations,
    })
}
