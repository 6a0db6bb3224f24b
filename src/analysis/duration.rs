use std::cmp::Ordering;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::window_start;
use crate::providers::buildkite::Build;

/// One measured duration, placed at the time the work started.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationSample {
    pub at: DateTime<Utc>,
    pub seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationPoint {
    pub at: DateTime<Utc>,
    pub seconds: f64,
    pub rolling_mean: f64,
    pub rolling_median: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDurationSeries {
    pub key: String,
    pub points: Vec<DurationPoint>,
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| cmp_f64(*a, *b));
    let len = values.len();
    if len % 2 == 1 {
        values[len / 2]
    } else {
        (values[len / 2 - 1] + values[len / 2]) / 2.0
    }
}

/// Durations of passed builds, sampled at their start time.
pub fn build_duration_samples(builds: &[&Build]) -> Vec<DurationSample> {
    builds
        .iter()
        .filter(|b| b.state.is_passed())
        .filter_map(|b| {
            Some(DurationSample {
                at: b.started_at?,
                seconds: b.duration_seconds()?,
            })
        })
        .collect()
}

/// Durations of the steps with `key` inside passed builds.
pub fn step_duration_samples(builds: &[&Build], key: &str) -> Vec<DurationSample> {
    builds
        .iter()
        .filter(|b| b.state.is_passed())
        .flat_map(|b| b.steps.iter())
        .filter(|step| step.key.as_deref() == Some(key))
        .filter_map(|step| {
            Some(DurationSample {
                at: step.started_at?,
                seconds: step.duration_seconds()?,
            })
        })
        .collect()
}

/// Rolling mean and median over a trailing window of `window_width_days`.
///
/// Each sample's window covers `[at - width, at]`, so it always contains at
/// least the sample itself.
#[allow(clippy::cast_precision_loss)]
pub fn rolling_duration(samples: &[DurationSample], window_width_days: u32) -> Vec<DurationPoint> {
    let mut samples = samples.to_vec();
    samples.sort_by_key(|s| s.at);

    let width = Duration::days(i64::from(window_width_days));
    let mut lo = 0;
    let mut points = Vec::with_capacity(samples.len());

    for (hi, sample) in samples.iter().enumerate() {
        while samples[lo].at < window_start(sample.at, width) {
            lo += 1;
        }
        let end = hi + samples[hi..]
            .iter()
            .take_while(|other| other.at == sample.at)
            .count();

        let mut window: Vec<f64> = samples[lo..end].iter().map(|s| s.seconds).collect();
        let mean = window.iter().sum::<f64>() / window.len() as f64;

        points.push(DurationPoint {
            at: sample.at,
            seconds: sample.seconds,
            rolling_mean: mean,
            rolling_median: median(&mut window),
        });
    }

    points
}
