use std::collections::HashMap;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::providers::buildkite::Build;

/// Which builds contribute their steps to the histogram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HistogramMode {
    /// Only passed builds
    #[default]
    Passed,
    /// Every build, whatever its outcome
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCount {
    pub key: String,
    pub count: usize,
}

/// Counts how often each step key was executed.
///
/// Steps without a key (waiters, the pipeline upload step) are skipped. The
/// result is sorted by count descending, ties broken by key ascending.
pub fn step_histogram<'a, I>(builds: I, mode: HistogramMode) -> Vec<StepCount>
where
    I: IntoIterator<Item = &'a Build>,
{
    let mut counts: HashMap<&str, usize> = HashMap::new();

    for build in builds {
        if mode == HistogramMode::Passed && !build.state.is_passed() {
            continue;
        }
        for key in build.steps.iter().filter_map(|step| step.key.as_deref()) {
            *counts.entry(key).or_insert(0) += 1;
        }
    }

    debug!("Distinct step keys: {}", counts.len());

    let mut histogram: Vec<StepCount> = counts
        .into_iter()
        .map(|(key, count)| StepCount {
            key: key.to_string(),
            count,
        })
        .collect();

    histogram.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));

    if let Some(top) = histogram.first() {
        info!("Most executed step: {} ({} executions)", top.key, top.count);
    }

    histogram
}
