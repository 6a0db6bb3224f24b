use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::window_start;
use crate::providers::buildkite::Build;

/// Pass rate of one build's trailing window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityPoint {
    /// Creation time of the build closing the window
    pub at: DateTime<Utc>,
    pub build_number: u64,
    pub passed: usize,
    pub total: usize,
    /// `None` when the window is empty
    pub pass_rate: Option<f64>,
}

/// Passed/total counts inside one window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowCount {
    pub passed: usize,
    pub total: usize,
}

impl WindowCount {
    /// Fraction of passed builds in `[0, 1]`; `None` for an empty window.
    #[allow(clippy::cast_precision_loss)]
    pub fn rate(self) -> Option<f64> {
        (self.total > 0).then(|| self.passed as f64 / self.total as f64)
    }
}

/// Rolling pass rate over a trailing window of finished builds.
///
/// The window ending at instant `t` covers `[t - width, t]`, both ends
/// included, and is keyed on build creation time.
pub struct StabilitySeries {
    width: Duration,
    /// (created_at, build number), sorted by time then number
    samples: Vec<(DateTime<Utc>, u64)>,
    /// `passed_prefix[i]` = passed builds among the first `i` samples
    passed_prefix: Vec<usize>,
}

impl StabilitySeries {
    /// Builds the series from `builds`, ignoring any that are not finished.
    pub fn new(builds: &[&Build], window_width_days: u32) -> Self {
        let mut finished: Vec<&Build> = builds
            .iter()
            .copied()
            .filter(|b| b.is_finished())
            .collect();
        finished.sort_by_key(|b| (b.created_at, b.number));

        let mut passed_prefix = Vec::with_capacity(finished.len() + 1);
        passed_prefix.push(0);
        for build in &finished {
            let last = passed_prefix.last().copied().unwrap_or(0);
            passed_prefix.push(last + usize::from(build.state.is_passed()));
        }

        Self {
            width: Duration::days(i64::from(window_width_days)),
            samples: finished.iter().map(|b| (b.created_at, b.number)).collect(),
            passed_prefix,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Counts of the window ending at `at`.
    pub fn window_at(&self, at: DateTime<Utc>) -> WindowCount {
        let start = window_start(at, self.width);
        let lo = self.samples.partition_point(|(t, _)| *t < start);
        let hi = self.samples.partition_point(|(t, _)| *t <= at);
        if hi <= lo {
            return WindowCount::default();
        }

        WindowCount {
            passed: self.passed_prefix[hi] - self.passed_prefix[lo],
            total: hi - lo,
        }
    }

    /// Pass rate of the window ending at `at`, `None` if it holds no build.
    pub fn rate_at(&self, at: DateTime<Utc>) -> Option<f64> {
        self.window_at(at).rate()
    }

    /// One point per build, in chronological order.
    pub fn points(&self) -> Vec<StabilityPoint> {
        self.samples
            .iter()
            .map(|&(at, build_number)| {
                let window = self.window_at(at);
                StabilityPoint {
                    at,
                    build_number,
                    passed: window.passed,
                    total: window.total,
                    pass_rate: window.rate(),
                }
            })
            .collect()
    }

    /// Pass rate over every build in the series.
    pub fn overall(&self) -> WindowCount {
        WindowCount {
            passed: self.passed_prefix.last().copied().unwrap_or(0),
            total: self.samples.len(),
        }
    }
}
